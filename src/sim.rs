//! In-process simulated hardware
//!
//! [`SimHardware`] implements every hardware interface with plain memory. The
//! test suite, the benchmarks and the CLI drive the scheduler through it. By
//! default submitted work stays on the "GPU" until [`SimHardware::complete`] is
//! called; [`SimHardware::set_auto_retire`] makes every submission finish at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::HwError;
use crate::fault::FaultCause;
use crate::hw::{
    Diagnostics, EventSink, FenceHandle, HardwareFence, HardwareQueue, Interfaces, PowerControl,
    TimestampKind, TimestampStore,
};
use crate::object::{timestamp_retired, ContextId, DrawObject, Lane, ObjectFlags};
use crate::sync::lock;

/// One accepted submission, as seen by the simulated firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Submitting context
    pub context: ContextId,
    /// Object timestamp
    pub timestamp: u32,
    /// Object variant
    pub kind: String,
    /// IBs executed
    pub ibs: usize,
    /// Timestamp-only no-op
    pub skip: bool,
    /// Lane used
    pub lane: Lane,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    consumed: u32,
    retired: u32,
}

#[derive(Debug, Default)]
struct SimState {
    timestamps: HashMap<ContextId, Timestamps>,
    log: Vec<Submission>,
    snapshots: Vec<(Option<ContextId>, FaultCause)>,
    fences: HashSet<u64>,
}

/// Simulated GPU
#[derive(Debug, Default)]
pub struct SimHardware {
    state: Mutex<SimState>,
    auto_retire: AtomicBool,
    busy_budget: AtomicU32,
    fatal_budget: AtomicU32,
    fail_reset: AtomicBool,
    hardware_fences: AtomicBool,
    next_fence: AtomicU64,
    votes: AtomicI64,
    resets: AtomicU32,
    events: AtomicU64,
}

impl SimHardware {
    /// Idle GPU with manual retirement
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// GPU that retires every submission immediately
    pub fn auto_retiring() -> Arc<Self> {
        let sim = Self::new();
        sim.set_auto_retire(true);
        sim
    }

    /// Interface bundle backed by this GPU
    pub fn interfaces(self: &Arc<Self>) -> Interfaces {
        Interfaces::from_backend(Arc::clone(self))
    }

    /// Retire submissions as soon as they are accepted
    pub fn set_auto_retire(&self, on: bool) {
        self.auto_retire.store(on, Ordering::Release);
    }

    /// Refuse the next `count` submissions with `Busy`
    pub fn inject_busy(&self, count: u32) {
        self.busy_budget.store(count, Ordering::Release);
    }

    /// Fail the next `count` submissions with a fatal firmware error
    pub fn inject_fatal(&self, count: u32) {
        self.fatal_budget.store(count, Ordering::Release);
    }

    /// Make resets fail
    pub fn fail_resets(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::Release);
    }

    /// Back sync objects with hardware fences
    pub fn enable_hardware_fences(&self, on: bool) {
        self.hardware_fences.store(on, Ordering::Release);
    }

    /// Finish every submission on `context` up to `timestamp`
    pub fn complete(&self, context: ContextId, timestamp: u32) {
        let mut state = lock(&self.state);
        let ts = state.timestamps.entry(context).or_default();
        if !timestamp_retired(ts.retired, timestamp) {
            ts.retired = timestamp;
        }
        if !timestamp_retired(ts.consumed, timestamp) {
            ts.consumed = timestamp;
        }
    }

    /// Finish everything submitted so far
    pub fn complete_all(&self) {
        let mut state = lock(&self.state);
        for ts in state.timestamps.values_mut() {
            if !timestamp_retired(ts.retired, ts.consumed) {
                ts.retired = ts.consumed;
            }
        }
    }

    /// Accepted submissions, oldest first
    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.state).log.clone()
    }

    /// Timestamps submitted for `context`, oldest first
    pub fn submitted_timestamps(&self, context: ContextId) -> Vec<u32> {
        lock(&self.state)
            .log
            .iter()
            .filter(|s| s.context == context)
            .map(|s| s.timestamp)
            .collect()
    }

    /// Resets performed
    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::Acquire)
    }

    /// Snapshots captured
    pub fn snapshots(&self) -> Vec<(Option<ContextId>, FaultCause)> {
        lock(&self.state).snapshots.clone()
    }

    /// Power votes currently held
    pub fn votes_held(&self) -> i64 {
        self.votes.load(Ordering::Acquire)
    }

    /// Timestamp events signaled
    pub fn events_signaled(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Hardware fences handed out and not yet released
    pub fn outstanding_fences(&self) -> usize {
        lock(&self.state).fences.len()
    }

    fn take_budget(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl HardwareQueue for SimHardware {
    fn submit(&self, context_id: ContextId, object: &DrawObject) -> Result<(), HwError> {
        if Self::take_budget(&self.busy_budget) {
            return Err(HwError::Busy);
        }
        if Self::take_budget(&self.fatal_budget) {
            return Err(HwError::Fatal("simulated firmware error".to_string()));
        }
        let mut state = lock(&self.state);
        state.log.push(Submission {
            context: context_id,
            timestamp: object.timestamp(),
            kind: object.kind_name().to_string(),
            ibs: object.dispatch_ibs().len(),
            skip: object.has(ObjectFlags::SKIP),
            lane: object.lane(),
        });
        let timestamp = object.timestamp();
        if timestamp != 0 {
            let auto = self.auto_retire.load(Ordering::Acquire);
            let ts = state.timestamps.entry(context_id).or_default();
            if !timestamp_retired(ts.consumed, timestamp) {
                ts.consumed = timestamp;
            }
            if auto && !timestamp_retired(ts.retired, timestamp) {
                ts.retired = timestamp;
            }
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), HwError> {
        self.resets.fetch_add(1, Ordering::AcqRel);
        if self.fail_reset.load(Ordering::Acquire) {
            return Err(HwError::Fatal("simulated reset failure".to_string()));
        }
        // unfinished work is lost
        for ts in lock(&self.state).timestamps.values_mut() {
            ts.consumed = ts.retired;
        }
        Ok(())
    }
}

impl TimestampStore for SimHardware {
    fn read(&self, context_id: ContextId, kind: TimestampKind) -> u32 {
        let state = lock(&self.state);
        let ts = state.timestamps.get(&context_id).copied().unwrap_or_default();
        match kind {
            TimestampKind::Consumed => ts.consumed,
            TimestampKind::Retired => ts.retired,
        }
    }

    fn force_write(&self, context_id: ContextId, timestamp: u32) {
        let mut state = lock(&self.state);
        let ts = state.timestamps.entry(context_id).or_default();
        ts.consumed = timestamp;
        ts.retired = timestamp;
    }
}

impl Diagnostics for SimHardware {
    fn snapshot(&self, context: Option<ContextId>, cause: FaultCause) {
        log::info!("sim snapshot: ctx={:?} cause={:?}", context, cause);
        lock(&self.state).snapshots.push((context, cause));
    }
}

impl PowerControl for SimHardware {
    fn acquire_vote(&self) -> Result<(), HwError> {
        self.votes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn release_vote(&self) {
        self.votes.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EventSink for SimHardware {
    fn signal_group(&self, _context_id: ContextId) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }
}

impl HardwareFence for SimHardware {
    fn register(&self, _context_id: ContextId, _sync: &DrawObject) -> Option<FenceHandle> {
        if !self.hardware_fences.load(Ordering::Acquire) {
            return None;
        }
        let handle = self.next_fence.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.state).fences.insert(handle);
        Some(FenceHandle(handle))
    }

    fn release(&self, handle: FenceHandle) {
        lock(&self.state).fences.remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_never_moves_backwards() {
        let sim = SimHardware::new();
        sim.complete(1, 5);
        sim.complete(1, 3);
        assert_eq!(sim.read(1, TimestampKind::Retired), 5);
        assert_eq!(sim.read(2, TimestampKind::Retired), 0);
    }

    #[test]
    fn test_busy_budget_counts_down() {
        let sim = SimHardware::new();
        sim.inject_busy(2);
        assert!(SimHardware::take_budget(&sim.busy_budget));
        assert!(SimHardware::take_budget(&sim.busy_budget));
        assert!(!SimHardware::take_budget(&sim.busy_budget));
    }

    #[test]
    fn test_reset_discards_unfinished_work() {
        let sim = SimHardware::new();
        {
            let mut state = lock(&sim.state);
            state.timestamps.insert(
                4,
                Timestamps {
                    consumed: 9,
                    retired: 7,
                },
            );
        }
        sim.reset().unwrap();
        assert_eq!(sim.read(4, TimestampKind::Consumed), 7);
        assert_eq!(sim.reset_count(), 1);

        sim.fail_resets(true);
        assert!(sim.reset().is_err());
    }

    #[test]
    fn test_votes_balance() {
        let sim = SimHardware::new();
        sim.acquire_vote().unwrap();
        assert_eq!(sim.votes_held(), 1);
        sim.release_vote();
        assert_eq!(sim.votes_held(), 0);
    }
}
