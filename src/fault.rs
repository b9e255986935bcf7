//! Fault detection, diagnosis and recovery
//!
//! Detectors call [`FaultController::report`], which records the report, sets
//! the cause bit and wakes the worker. The worker then runs
//! [`FaultController::process`] under the device lock:
//!
//! 1. **Diagnosing**: find the faulting inflight object for each report, by exact
//!    (context, timestamp) match or, for page faults, by the progress heuristic,
//!    and capture a snapshot.
//! 2. **Recovering**: force-retire the culprits, invalidate contexts per policy,
//!    reset the hardware once, replay the remaining inflight list in order and
//!    restart or stop the recurring command.
//! 3. Back to **Normal**: clear the processed cause bits and kick the worker.
//!
//! A pass that finds no cause bits set does nothing, so coalesced triggers
//! cannot recover twice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::context::{ContextFlags, DrawContext};
use crate::dispatcher::{DeviceState, Dispatcher};
use crate::hw::Interfaces;
use crate::inflight::{InflightList, RetireMode};
use crate::object::{timestamp_retired, ContextId, DrawObjectRef, Lane};
use crate::sync::lock;

const HISTORY_LIMIT: usize = 32;

bitflags! {
    /// Fault classes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FaultCause: u32 {
        /// GPU memory access violation
        const PAGE_FAULT = 1 << 0;
        /// Firmware stopped making progress
        const FW_HANG = 1 << 1;
        /// Firmware reported an unrecoverable error
        const FW_FATAL = 1 << 2;
        /// A hardware fence never signaled
        const HW_FENCE_TIMEOUT = 1 << 3;
        /// A software sync never resolved
        const SYNC_TIMEOUT = 1 << 4;
    }
}

impl FaultCause {
    /// Causes that need a hardware reset
    pub fn needs_reset(self) -> bool {
        !self.difference(FaultCause::SYNC_TIMEOUT).is_empty()
    }
}

/// One detected fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Fault class
    pub cause: FaultCause,
    /// Context named by the hardware, if known
    pub context: Option<ContextId>,
    /// Timestamp named by the hardware, if known
    pub timestamp: Option<u32>,
    /// Lane the fault happened on, if the hardware said
    pub lane: Option<Lane>,
}

impl FaultReport {
    /// Report with no object attribution
    pub fn new(cause: FaultCause) -> Self {
        Self {
            cause,
            context: None,
            timestamp: None,
            lane: None,
        }
    }

    /// Report naming the faulting object
    pub fn for_object(cause: FaultCause, context: ContextId, timestamp: u32) -> Self {
        Self {
            context: Some(context),
            timestamp: Some(timestamp),
            ..Self::new(cause)
        }
    }

    /// Set the lane
    pub fn on_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }
}

/// Recovery state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultState {
    /// Dispatching normally
    Normal,
    /// A fault was reported and waits for the worker
    FaultPending,
    /// Looking for the faulting object
    Diagnosing,
    /// Reset and replay in progress
    Recovering,
}

impl FaultState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => FaultState::FaultPending,
            2 => FaultState::Diagnosing,
            3 => FaultState::Recovering,
            _ => FaultState::Normal,
        }
    }
}

/// Outcome of one recovery, kept in the fault history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// When recovery finished
    pub at: DateTime<Utc>,
    /// Causes handled
    pub cause: FaultCause,
    /// Objects blamed, as (context, timestamp)
    pub culprits: Vec<(ContextId, u32)>,
    /// Contexts invalidated
    pub invalidated: Vec<ContextId>,
    /// Whether the hardware was reset
    pub reset: bool,
    /// Inflight objects resubmitted after the reset
    pub replayed: usize,
    /// Inflight objects retired during replay
    pub dropped: usize,
}

/// Fault state shared between detectors and the worker
pub struct FaultController {
    mask: AtomicU32,
    state: AtomicU32,
    reports: Mutex<Vec<FaultReport>>,
    history: Mutex<VecDeque<FaultRecord>>,
    recoveries: AtomicU64,
}

impl Default for FaultController {
    fn default() -> Self {
        Self {
            mask: AtomicU32::new(0),
            state: AtomicU32::new(FaultState::Normal as u32),
            reports: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            recoveries: AtomicU64::new(0),
        }
    }
}

impl FaultController {
    /// Controller in the `Normal` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the worker; the caller kicks it
    pub fn report(&self, report: FaultReport) {
        let mut reports = lock(&self.reports);
        log::error!(
            "fault reported: {:?} ctx={:?} ts={:?} lane={:?}",
            report.cause,
            report.context,
            report.timestamp,
            report.lane
        );
        self.mask.fetch_or(report.cause.bits(), Ordering::AcqRel);
        let _ = self.state.compare_exchange(
            FaultState::Normal as u32,
            FaultState::FaultPending as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        reports.push(report);
    }

    /// Causes waiting to be processed
    pub fn mask(&self) -> FaultCause {
        FaultCause::from_bits_truncate(self.mask.load(Ordering::Acquire))
    }

    /// Whether dispatch must stop for a fault
    pub fn is_pending(&self) -> bool {
        self.mask.load(Ordering::Acquire) != 0
    }

    /// Current state
    pub fn state(&self) -> FaultState {
        FaultState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FaultState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Completed recoveries
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Most recent recoveries, oldest first
    pub fn history(&self) -> Vec<FaultRecord> {
        lock(&self.history).iter().cloned().collect()
    }

    fn begin(&self) -> (Vec<FaultReport>, FaultCause) {
        let mut reports = lock(&self.reports);
        let mask = self.mask();
        (std::mem::take(&mut *reports), mask)
    }

    fn finish(&self, processed: FaultCause, record: FaultRecord) {
        {
            let reports = lock(&self.reports);
            self.mask.fetch_and(!processed.bits(), Ordering::AcqRel);
            // reports that raced in during recovery keep their bits
            for report in reports.iter() {
                self.mask.fetch_or(report.cause.bits(), Ordering::AcqRel);
            }
            let next = if reports.is_empty() {
                FaultState::Normal
            } else {
                FaultState::FaultPending
            };
            self.set_state(next);
        }
        let mut history = lock(&self.history);
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Run diagnosis and recovery for every queued report.
    ///
    /// Must be called by the worker with the device lock held.
    pub(crate) fn process(&self, dispatcher: &Dispatcher, dev: &mut DeviceState) {
        let (reports, mask) = self.begin();
        if mask.is_empty() {
            return;
        }
        let env = dispatcher.env();
        let config = dispatcher.config();

        self.set_state(FaultState::Diagnosing);
        let mut culprits: Vec<DrawObjectRef> = Vec::new();
        let mut blamed: Vec<(Arc<DrawContext>, FaultCause)> = Vec::new();
        for report in &reports {
            let object = find_culprit(report, &dev.inflight, env)
                .and_then(|i| dev.inflight.get(i))
                .map(|entry| Arc::clone(&entry.object));
            let context = match &object {
                Some(object) => Some(Arc::clone(object.context())),
                None => report.context.and_then(|id| dispatcher.context(id)),
            };
            match &object {
                Some(object) => log::error!("{:?} on {:?}: culprit {:?}", report.cause, report.lane, object),
                None => log::error!("{:?} on {:?}: no culprit found", report.cause, report.lane),
            }

            if dispatcher.is_powered() {
                env.diagnostics
                    .snapshot(context.as_ref().map(|c| c.id()), report.cause);
            } else {
                env.diagnostics.snapshot(None, report.cause);
            }

            if let Some(object) = object {
                if !culprits.iter().any(|c| Arc::ptr_eq(c, &object)) {
                    culprits.push(object);
                }
            }
            if let Some(context) = context {
                blamed.push((context, report.cause));
            }
        }

        let mut record = FaultRecord {
            at: Utc::now(),
            cause: mask,
            culprits: culprits
                .iter()
                .map(|o| (o.context_id(), o.timestamp()))
                .collect(),
            invalidated: Vec::new(),
            reset: false,
            replayed: 0,
            dropped: 0,
        };

        if !mask.needs_reset() {
            self.finish(mask, record);
            dispatcher.kick();
            return;
        }

        self.set_state(FaultState::Recovering);
        for object in &culprits {
            dispatcher.remove_inflight(dev, object, RetireMode::Forced);
        }

        for (context, cause) in blamed {
            if should_invalidate(&context, cause, config) && context.invalidate(env) {
                log::error!("ctx {}: invalidated after {:?}", context.id(), cause);
                record.invalidated.push(context.id());
            }
        }

        if !config.recovery_enabled {
            log::error!("recovery disabled, dispatch stays halted");
            dispatcher.halt();
            self.finish(mask, record);
            return;
        }

        record.reset = true;
        if let Err(err) = env.hardware_queue.reset() {
            log::error!("hardware reset failed: {}; dropping all inflight work", err);
            for entry in dev.inflight.drain() {
                dispatcher.complete(dev, &entry.object, RetireMode::Forced);
                record.dropped += 1;
            }
            dev.recurring = None;
            dispatcher.halt();
            self.finish(mask, record);
            return;
        }

        let (replayed, dropped) = replay(dispatcher, dev);
        record.replayed = replayed;
        record.dropped = dropped;
        restart_recurring(dispatcher, dev);

        log::info!(
            "recovered from {:?}: {} replayed, {} dropped, {} contexts invalidated",
            mask,
            replayed,
            dropped,
            record.invalidated.len()
        );
        self.finish(mask, record);
        dispatcher.kick();
    }
}

impl std::fmt::Debug for FaultController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultController")
            .field("state", &self.state())
            .field("mask", &self.mask())
            .field("recoveries", &self.recoveries())
            .finish()
    }
}

/// Index of the inflight entry to blame for `report`
pub(crate) fn find_culprit(report: &FaultReport, inflight: &InflightList, env: &Interfaces) -> Option<usize> {
    if let (Some(ctx), Some(ts)) = (report.context, report.timestamp) {
        if let Some(i) = inflight
            .iter()
            .position(|e| e.context_id() == ctx && e.timestamp() == ts)
        {
            return Some(i);
        }
    }
    if !report.cause.contains(FaultCause::PAGE_FAULT) {
        return None;
    }
    // no exact match: blame the highest priority entry the hardware was working on
    inflight
        .iter()
        .enumerate()
        .filter(|(_, e)| report.lane.map_or(true, |lane| e.lane() == lane))
        .filter(|(_, e)| e.object.as_sync().is_none())
        .filter(|(_, e)| {
            let consumed = env.consumed(e.context_id());
            let retired = env.retired(e.context_id());
            consumed != 0 && consumed != retired && !timestamp_retired(retired, e.timestamp())
        })
        .min_by_key(|(_, e)| e.object.context().priority())
        .map(|(i, _)| i)
}

/// Whether a fault of `cause` should invalidate `context`
pub(crate) fn should_invalidate(context: &DrawContext, cause: FaultCause, config: &SchedulerConfig) -> bool {
    let throttled = context.record_fault(
        Instant::now(),
        config.fault_throttle_burst,
        config.throttle_period(),
    );
    context
        .flags()
        .intersects(ContextFlags::INVALIDATE_ON_FAULT | ContextFlags::NO_FAULT_TOLERANCE)
        || cause.intersects(config.always_fatal)
        || throttled
}

fn replay(dispatcher: &Dispatcher, dev: &mut DeviceState) -> (usize, usize) {
    let env = dispatcher.env();
    let mut replayed = 0;
    let mut dropped = 0;
    for entry in dev.inflight.drain() {
        let object = entry.object;
        if object.context().is_invalid() {
            dispatcher.complete(dev, &object, RetireMode::Forced);
            dropped += 1;
            continue;
        }
        if entry_complete(env, &object) {
            dispatcher.complete(dev, &object, RetireMode::Hardware);
            dropped += 1;
            continue;
        }
        match env.hardware_queue.submit(object.context_id(), &object) {
            Ok(()) => {
                dev.inflight.push(object);
                replayed += 1;
            }
            Err(err) => {
                log::error!("replay of {:?} failed: {}", object, err);
                object.context().invalidate(env);
                dispatcher.complete(dev, &object, RetireMode::Forced);
                dropped += 1;
            }
        }
    }
    if let Some(big) = &dev.big {
        if !dev.inflight.contains(big) {
            dev.big = None;
        }
    }
    (replayed, dropped)
}

fn entry_complete(env: &Interfaces, object: &DrawObjectRef) -> bool {
    match object.as_sync() {
        Some(sync) => sync.poll(env.timestamps.as_ref()) == 0,
        None => timestamp_retired(env.retired(object.context_id()), object.timestamp()),
    }
}

fn restart_recurring(dispatcher: &Dispatcher, dev: &mut DeviceState) {
    let Some(recurring) = dev.recurring.take() else {
        return;
    };
    if !recurring.context().is_usable() {
        log::info!("recurring command {:?} stopped", recurring);
        return;
    }
    // still running after replay
    if dev.inflight.contains(&recurring) {
        dev.recurring = Some(recurring);
        return;
    }
    match dispatcher.push_to_hardware(dev, &recurring) {
        Ok(()) => log::info!("recurring command {:?} restarted", recurring),
        Err(err) => log::error!("recurring command {:?} not restarted: {}", recurring, err),
    }
    // a failed restart is retried after the next reset
    dev.recurring = Some(recurring);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextParams;
    use crate::hw::{
        LogDiagnostics, MockHardwareQueue, MockPowerControl, MockTimestampStore, NoHardwareFence,
        NullEvents, TimestampKind,
    };
    use crate::object::{CommandFlags, CommandObject, DrawKind, DrawObject};
    use rstest::rstest;
    use std::collections::HashMap;

    fn env(consumed: HashMap<ContextId, u32>, retired: HashMap<ContextId, u32>) -> Interfaces {
        let mut store = MockTimestampStore::new();
        store.expect_read().returning(move |ctx, kind| match kind {
            TimestampKind::Consumed => consumed.get(&ctx).copied().unwrap_or(0),
            TimestampKind::Retired => retired.get(&ctx).copied().unwrap_or(0),
        });
        Interfaces {
            hardware_queue: Arc::new(MockHardwareQueue::new()),
            timestamps: Arc::new(store),
            diagnostics: Arc::new(LogDiagnostics),
            power: Arc::new(MockPowerControl::new()),
            events: Arc::new(NullEvents),
            hardware_fence: Arc::new(NoHardwareFence),
        }
    }

    fn context(id: ContextId, priority: usize, flags: ContextFlags) -> Arc<DrawContext> {
        DrawContext::new(id, ContextParams { priority, flags }, &SchedulerConfig::default())
    }

    fn command(ctx: &Arc<DrawContext>, ts: u32) -> DrawObjectRef {
        command_on(ctx, ts, CommandFlags::empty())
    }

    fn command_on(ctx: &Arc<DrawContext>, ts: u32, flags: CommandFlags) -> DrawObjectRef {
        DrawObject::new(
            Arc::clone(ctx),
            ts,
            DrawKind::Command(CommandObject {
                ibs: Vec::new(),
                flags,
                big: false,
                requeue_count: AtomicU32::new(0),
                profiling: None,
            }),
        )
    }

    #[test]
    fn test_exact_match_wins() {
        let env = env(HashMap::new(), HashMap::new());
        let a = context(5, 0, ContextFlags::empty());
        let mut list = InflightList::new();
        list.push(command(&a, 41));
        list.push(command(&a, 42));
        let report = FaultReport::for_object(FaultCause::FW_HANG, 5, 42);
        assert_eq!(find_culprit(&report, &list, &env), Some(1));
        let miss = FaultReport::for_object(FaultCause::FW_HANG, 5, 99);
        assert_eq!(find_culprit(&miss, &list, &env), None);
    }

    #[test]
    fn test_page_fault_heuristic_prefers_high_priority() {
        let low = context(1, 3, ContextFlags::empty());
        let high = context(2, 1, ContextFlags::empty());
        let idle = context(3, 0, ContextFlags::empty());
        let env = env(
            HashMap::from([(1, 4), (2, 7), (3, 0)]),
            HashMap::from([(1, 3), (2, 6), (3, 0)]),
        );
        let mut list = InflightList::new();
        list.push(command(&low, 4));
        list.push(command(&idle, 1));
        list.push(command(&high, 7));
        let report = FaultReport::new(FaultCause::PAGE_FAULT);
        assert_eq!(find_culprit(&report, &list, &env), Some(2));
        // heuristic only applies to memory faults
        let hang = FaultReport::new(FaultCause::FW_HANG);
        assert_eq!(find_culprit(&hang, &list, &env), None);
    }

    #[test]
    fn test_heuristic_is_per_lane() {
        let ctx = context(1, 0, ContextFlags::empty());
        let env = env(HashMap::from([(1, 2)]), HashMap::from([(1, 1)]));
        let mut list = InflightList::new();
        list.push(command(&ctx, 2));
        let report = FaultReport::new(FaultCause::PAGE_FAULT).on_lane(Lane::Auxiliary);
        assert_eq!(find_culprit(&report, &list, &env), None);
    }

    #[test]
    fn test_laneless_page_fault_searches_both_lanes() {
        let ctx = context(1, 0, ContextFlags::empty());
        let env = env(HashMap::from([(1, 2)]), HashMap::from([(1, 1)]));
        let mut list = InflightList::new();
        list.push(command_on(&ctx, 2, CommandFlags::AUX_LANE));
        let report = FaultReport::new(FaultCause::PAGE_FAULT);
        assert_eq!(find_culprit(&report, &list, &env), Some(0));
        let primary = FaultReport::new(FaultCause::PAGE_FAULT).on_lane(Lane::Primary);
        assert_eq!(find_culprit(&primary, &list, &env), None);
    }

    #[rstest]
    #[case(ContextFlags::empty(), FaultCause::FW_HANG, false)]
    #[case(ContextFlags::INVALIDATE_ON_FAULT, FaultCause::FW_HANG, true)]
    #[case(ContextFlags::NO_FAULT_TOLERANCE, FaultCause::PAGE_FAULT, true)]
    #[case(ContextFlags::empty(), FaultCause::FW_FATAL, true)]
    fn test_invalidate_policy(
        #[case] flags: ContextFlags,
        #[case] cause: FaultCause,
        #[case] expected: bool,
    ) {
        let ctx = context(1, 0, flags);
        assert_eq!(should_invalidate(&ctx, cause, &SchedulerConfig::default()), expected);
    }

    #[test]
    fn test_throttle_invalidates_repeat_offender() {
        let config = SchedulerConfig::default();
        let ctx = context(1, 0, ContextFlags::empty());
        assert!(!should_invalidate(&ctx, FaultCause::PAGE_FAULT, &config));
        assert!(!should_invalidate(&ctx, FaultCause::PAGE_FAULT, &config));
        assert!(should_invalidate(&ctx, FaultCause::PAGE_FAULT, &config));

        let off = SchedulerConfig::debug();
        let other = context(2, 0, ContextFlags::empty());
        for _ in 0..10 {
            assert!(!should_invalidate(&other, FaultCause::PAGE_FAULT, &off));
        }
    }

    #[test]
    fn test_report_sets_mask_and_state() {
        let faults = FaultController::new();
        assert_eq!(faults.state(), FaultState::Normal);
        faults.report(FaultReport::new(FaultCause::PAGE_FAULT));
        faults.report(FaultReport::new(FaultCause::FW_HANG));
        assert!(faults.is_pending());
        assert_eq!(faults.mask(), FaultCause::PAGE_FAULT | FaultCause::FW_HANG);
        assert_eq!(faults.state(), FaultState::FaultPending);

        let (reports, mask) = faults.begin();
        assert_eq!(reports.len(), 2);
        faults.finish(
            mask,
            FaultRecord {
                at: Utc::now(),
                cause: mask,
                culprits: Vec::new(),
                invalidated: Vec::new(),
                reset: false,
                replayed: 0,
                dropped: 0,
            },
        );
        assert!(!faults.is_pending());
        assert_eq!(faults.state(), FaultState::Normal);
        assert_eq!(faults.history().len(), 1);
    }

    #[test]
    fn test_sync_timeout_alone_skips_reset() {
        assert!(!FaultCause::SYNC_TIMEOUT.needs_reset());
        assert!((FaultCause::SYNC_TIMEOUT | FaultCause::FW_HANG).needs_reset());
    }
}
