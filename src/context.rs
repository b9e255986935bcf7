//! Per-client draw contexts
//!
//! Each context owns a fixed ring of draw objects and its own timestamp space.
//! Client threads produce into the ring through [`DrawContext::enqueue`], blocking
//! for room when it is full; the dispatcher consumes from the head through
//! [`DrawContext::dequeue_ready`]. One ring slot is never handed to producers so a
//! popped object can always be put back at the front.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{SchedError, SchedResult};
use crate::hw::{Interfaces, TimestampKind, TimestampStore};
use crate::inflight::{retire_object, RetireMode};
use crate::object::{
    timestamp_cmp, timestamp_retired, BindObject, CommandObject, ContextId, DrawKind, DrawObject,
    DrawObjectRef, DrawRequest, MarkerObject, ObjectFlags, SyncObject, TimelineObject,
};
use crate::sync::{lock, wait_until, WaitOutcome};

type Waiter = Box<dyn FnOnce() + Send>;

/// Handle for removing a timestamp waiter that is no longer wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(u64);

struct TimestampWaiter {
    id: WaiterId,
    timestamp: u32,
    waiter: Waiter,
}

bitflags! {
    /// Behavior requested when the context is created
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ContextFlags: u32 {
        /// Client supplies timestamps; each must exceed the last
        const USER_TIMESTAMP = 1 << 0;
        /// Invalidate the context on any fault it causes
        const INVALIDATE_ON_FAULT = 1 << 1;
        /// Do not attempt to keep the context alive after a fault
        const NO_FAULT_TOLERANCE = 1 << 2;
    }
}

bitflags! {
    /// Context validity
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextState: u32 {
        /// Owner released the context
        const DETACHED = 1 << 0;
        /// Context was marked bad
        const INVALID = 1 << 1;
    }
}

/// Parameters for a new context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Priority bucket, 0 = highest
    pub priority: usize,
    /// Behavior flags
    pub flags: ContextFlags,
}

/// Point-in-time view of a context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStats {
    /// Context id
    pub id: ContextId,
    /// Priority bucket
    pub priority: usize,
    /// Objects waiting in the ring
    pub queued: usize,
    /// Last assigned timestamp
    pub timestamp: u32,
    /// Last timestamp placed in the ring
    pub queued_timestamp: u32,
    /// Last timestamp handed to hardware
    pub submitted_timestamp: u32,
    /// Objects submitted to hardware
    pub submitted: u64,
    /// Objects retired, in place or by hardware
    pub retired: u64,
    /// Objects dropped before reaching hardware
    pub cancelled: u64,
    /// Faults blamed on the context
    pub faults: u64,
    /// Callbacks waiting on a timestamp
    pub waiters: usize,
    /// Marked bad
    pub invalid: bool,
    /// Released by its owner
    pub detached: bool,
}

#[derive(Debug, Clone, Copy)]
struct QueueLimits {
    usable: usize,
    max_objects: usize,
    max_ibs: usize,
    single_slot_ibs: usize,
    enqueue_timeout: Duration,
}

struct ContextQueue {
    ring: Vec<Option<DrawObjectRef>>,
    head: usize,
    tail: usize,
    queued: usize,
    timestamp: u32,
    queued_timestamp: u32,
    submitted_timestamp: u32,
}

impl ContextQueue {
    fn new(capacity: usize) -> Self {
        Self {
            ring: vec![None; capacity],
            head: 0,
            tail: 0,
            queued: 0,
            timestamp: 0,
            queued_timestamp: 0,
            submitted_timestamp: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.ring.len()
    }

    fn push(&mut self, object: DrawObjectRef) {
        debug_assert!(self.queued < self.capacity());
        self.ring[self.tail] = Some(object);
        self.tail = (self.tail + 1) % self.capacity();
        self.queued += 1;
    }

    fn push_front(&mut self, object: DrawObjectRef) -> Result<(), DrawObjectRef> {
        if self.queued == self.capacity() {
            return Err(object);
        }
        self.head = (self.head + self.capacity() - 1) % self.capacity();
        self.ring[self.head] = Some(object);
        self.queued += 1;
        Ok(())
    }

    fn peek(&self) -> Option<&DrawObjectRef> {
        if self.queued == 0 {
            return None;
        }
        self.ring[self.head].as_ref()
    }

    fn pop(&mut self) -> Option<DrawObjectRef> {
        if self.queued == 0 {
            return None;
        }
        let object = self.ring[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.queued -= 1;
        object
    }

    fn iter(&self) -> impl Iterator<Item = &DrawObjectRef> {
        let cap = self.capacity();
        (0..self.queued).filter_map(move |i| self.ring[(self.head + i) % cap].as_ref())
    }

    fn drain(&mut self) -> Vec<DrawObjectRef> {
        let mut out = Vec::with_capacity(self.queued);
        while let Some(object) = self.pop() {
            out.push(object);
        }
        out
    }

    fn next_timestamp(&mut self, user: Option<u32>) -> u32 {
        let ts = match user {
            Some(ts) => ts,
            // 0 means "no timestamp"
            None => match self.timestamp.wrapping_add(1) {
                0 => 1,
                ts => ts,
            },
        };
        self.timestamp = ts;
        ts
    }

    fn skip_markers(&self) {
        for object in self.iter() {
            if matches!(object.kind(), DrawKind::Marker(_)) {
                object.set_flag(ObjectFlags::SKIP);
            }
        }
    }
}

/// Head of the ring as seen under the queue lock
enum Head {
    Done(Dequeue),
    /// Popped; resolves without the hardware
    InPlace(DrawObjectRef),
    /// Popped bind; `idle` if everything before it has retired
    Bind { object: DrawObjectRef, idle: bool },
}

/// Result of a consumer-side dequeue
#[derive(Debug)]
pub(crate) enum Dequeue {
    /// Work for the hardware
    Ready(DrawObjectRef),
    /// Head is a marker or sync waiting on its dependencies
    Pending(DrawObjectRef),
    /// Nothing queued
    Empty,
}

/// Result of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EnqueueOutcome {
    /// Last timestamp assigned on the context
    pub timestamp: u32,
    /// Objects placed in the ring
    pub queued: usize,
}

#[derive(Default)]
struct ContextCounters {
    submitted: AtomicU64,
    retired: AtomicU64,
    cancelled: AtomicU64,
    faults: AtomicU64,
}

/// Ordered per-client work queue with its own timestamp space
pub struct DrawContext {
    id: ContextId,
    priority: usize,
    flags: ContextFlags,
    state: AtomicU32,
    limits: QueueLimits,
    queue: Mutex<ContextQueue>,
    room: Condvar,
    waiters: Mutex<Vec<TimestampWaiter>>,
    next_waiter: AtomicU64,
    fault_times: Mutex<VecDeque<Instant>>,
    counters: ContextCounters,
}

impl DrawContext {
    pub(crate) fn new(id: ContextId, params: ContextParams, config: &SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            priority: params.priority.min(config.num_priorities - 1),
            flags: params.flags,
            state: AtomicU32::new(0),
            limits: QueueLimits {
                usable: config.usable_slots(),
                max_objects: config.max_objects_per_submit,
                max_ibs: config.max_ibs_per_command,
                single_slot_ibs: config.single_slot_ib_limit,
                enqueue_timeout: config.enqueue_timeout(),
            },
            queue: Mutex::new(ContextQueue::new(config.context_queue_size)),
            room: Condvar::new(),
            waiters: Mutex::new(Vec::new()),
            next_waiter: AtomicU64::new(0),
            fault_times: Mutex::new(VecDeque::new()),
            counters: ContextCounters::default(),
        })
    }

    /// Context id
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Priority bucket
    pub fn priority(&self) -> usize {
        self.priority
    }

    /// Creation flags
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Validity state
    pub fn state(&self) -> ContextState {
        ContextState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Whether the owner released the context
    pub fn is_detached(&self) -> bool {
        self.state().contains(ContextState::DETACHED)
    }

    /// Whether the context was marked bad
    pub fn is_invalid(&self) -> bool {
        self.state().contains(ContextState::INVALID)
    }

    /// Neither detached nor invalid
    pub fn is_usable(&self) -> bool {
        self.state().is_empty()
    }

    /// Objects waiting in the ring
    pub fn queued(&self) -> usize {
        lock(&self.queue).queued
    }

    /// Last assigned timestamp
    pub fn last_timestamp(&self) -> u32 {
        lock(&self.queue).timestamp
    }

    pub(crate) fn validity_error(&self) -> SchedError {
        if self.is_invalid() {
            SchedError::ContextInvalid(self.id)
        } else {
            SchedError::Detached(self.id)
        }
    }

    fn check_usable(&self) -> SchedResult<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(self.validity_error())
        }
    }

    fn set_state(&self, bit: ContextState) -> bool {
        self.state.fetch_or(bit.bits(), Ordering::AcqRel) & bit.bits() == 0
    }

    fn check_user_timestamp(&self, q: &ContextQueue, user_ts: Option<u32>) -> SchedResult<()> {
        if let Some(requested) = user_ts {
            if timestamp_cmp(requested, q.timestamp) != std::cmp::Ordering::Greater {
                return Err(SchedError::RangeError {
                    requested,
                    last: q.timestamp,
                });
            }
        }
        Ok(())
    }

    fn validate(&self, requests: &[DrawRequest], user_ts: Option<u32>) -> SchedResult<Option<u32>> {
        let count = requests.len();
        if count == 0 {
            return Err(SchedError::InvalidParameter("empty submission".to_string()));
        }
        if count > self.limits.max_objects || count > self.limits.usable {
            return Err(SchedError::CapacityExceeded(format!(
                "{} objects in one submission (limit {})",
                count,
                self.limits.max_objects.min(self.limits.usable)
            )));
        }
        for request in requests {
            if let DrawRequest::Command(cmd) = request {
                if cmd.ibs.len() > self.limits.max_ibs {
                    return Err(SchedError::CapacityExceeded(format!(
                        "{} IBs in one command (limit {})",
                        cmd.ibs.len(),
                        self.limits.max_ibs
                    )));
                }
            }
        }

        let timestamped = requests.iter().filter(|r| r.has_timestamp()).count();
        if !self.flags.contains(ContextFlags::USER_TIMESTAMP) || timestamped == 0 {
            return Ok(None);
        }
        let ts = user_ts.ok_or_else(|| {
            SchedError::InvalidParameter("context requires user timestamps".to_string())
        })?;
        if timestamped > 1 {
            return Err(SchedError::InvalidParameter(
                "a user timestamp covers one timestamped object".to_string(),
            ));
        }
        Ok(Some(ts))
    }

    /// Producer side: validate, wait for room, assign timestamps and insert.
    ///
    /// A rejected submission leaves the context untouched.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        requests: Vec<DrawRequest>,
        user_ts: Option<u32>,
        env: &Interfaces,
    ) -> SchedResult<EnqueueOutcome> {
        let user_ts = self.validate(&requests, user_ts)?;
        let count = requests.len();
        let usable = self.limits.usable;

        let guard = lock(&self.queue);
        self.check_usable()?;
        self.check_user_timestamp(&guard, user_ts)?;

        if guard.queued + count > usable {
            log::debug!("ctx {}: queue full ({} queued), waiting for room", self.id, guard.queued);
        }
        let (mut q, outcome) = wait_until(
            &self.room,
            guard,
            self.limits.enqueue_timeout,
            |q| q.queued + count <= usable,
            |_| !self.is_usable(),
        );
        match outcome {
            WaitOutcome::Woken => {}
            WaitOutcome::TimedOut => return Err(SchedError::TimedOut),
            WaitOutcome::Invalidated => return Err(self.validity_error()),
        }
        // another producer may have advanced the timestamp while we slept
        self.check_user_timestamp(&q, user_ts)?;

        let mut inserted = 0;
        for request in requests {
            let object = match request {
                DrawRequest::Command(cmd) => {
                    let ts = q.next_timestamp(user_ts);
                    let empty = cmd.ibs.is_empty();
                    let object = DrawObject::new(
                        Arc::clone(self),
                        ts,
                        DrawKind::Command(CommandObject {
                            big: cmd.ibs.len() > self.limits.single_slot_ibs,
                            ibs: cmd.ibs,
                            flags: cmd.flags,
                            requeue_count: AtomicU32::new(0),
                            profiling: cmd.profiling,
                        }),
                    );
                    if empty {
                        object.set_flag(ObjectFlags::SKIP);
                    }
                    // markers ahead of real work must not stall it
                    q.skip_markers();
                    q.queued_timestamp = ts;
                    object
                }
                DrawRequest::Marker => {
                    let ts = q.next_timestamp(user_ts);
                    let object = DrawObject::new(
                        Arc::clone(self),
                        ts,
                        DrawKind::Marker(MarkerObject {
                            marker_timestamp: q.queued_timestamp,
                        }),
                    );
                    let idle = q.queued == 0
                        && timestamp_retired(env.retired(self.id), q.queued_timestamp);
                    q.queued_timestamp = ts;
                    if idle {
                        log::debug!("ctx {}: marker {} retired on enqueue", self.id, ts);
                        retire_object(&object, env, RetireMode::InPlace);
                        continue;
                    }
                    object
                }
                DrawRequest::Bind(op) => {
                    let ts = q.next_timestamp(user_ts);
                    q.queued_timestamp = ts;
                    DrawObject::new(
                        Arc::clone(self),
                        ts,
                        DrawKind::Bind(BindObject {
                            op: Mutex::new(Some(op)),
                        }),
                    )
                }
                DrawRequest::Sync(points) => {
                    let object =
                        DrawObject::new(Arc::clone(self), 0, DrawKind::Sync(SyncObject::new(points)));
                    if let Some(sync) = object.as_sync() {
                        *lock(&sync.hw_fence) = env.hardware_fence.register(self.id, &object);
                    }
                    object
                }
                DrawRequest::Timeline(signals) => DrawObject::new(
                    Arc::clone(self),
                    0,
                    DrawKind::Timeline(TimelineObject {
                        signals: Mutex::new(signals),
                    }),
                ),
            };
            object.stamp_queued();
            q.push(object);
            inserted += 1;
        }

        Ok(EnqueueOutcome {
            timestamp: q.timestamp,
            queued: inserted,
        })
    }

    /// Consumer side: pop the next object for the hardware.
    ///
    /// Objects that resolve without hardware are retired here and skipped over.
    /// Bind operations and retirement callbacks run with the queue unlocked, so
    /// they may call back into the context.
    pub(crate) fn dequeue_ready(&self, env: &Interfaces) -> Dequeue {
        loop {
            match self.take_head(env) {
                Head::Done(result) => return result,
                Head::InPlace(object) => {
                    retire_object(&object, env, RetireMode::InPlace);
                }
                Head::Bind { object, idle } => {
                    if let DrawKind::Bind(bind) = object.kind() {
                        bind.execute(self.id, object.timestamp());
                    }
                    if idle {
                        retire_object(&object, env, RetireMode::InPlace);
                        continue;
                    }
                    // earlier work still running: let the hardware retire it in order
                    object.set_flag(ObjectFlags::SKIP);
                    return Dequeue::Ready(object);
                }
            }
        }
    }

    fn take_head(&self, env: &Interfaces) -> Head {
        let mut q = lock(&self.queue);
        if !self.is_usable() {
            return Head::Done(Dequeue::Empty);
        }
        let Some(head) = q.peek().cloned() else {
            return Head::Done(Dequeue::Empty);
        };
        let popped = match head.kind() {
            DrawKind::Command(_) => Head::Done(Dequeue::Ready(Arc::clone(&head))),
            DrawKind::Marker(marker) => {
                if timestamp_retired(env.retired(self.id), marker.marker_timestamp) {
                    Head::InPlace(Arc::clone(&head))
                } else if head.has(ObjectFlags::SKIP) {
                    Head::Done(Dequeue::Ready(Arc::clone(&head)))
                } else {
                    return Head::Done(Dequeue::Pending(Arc::clone(&head)));
                }
            }
            DrawKind::Sync(sync) => {
                if sync.hw_fence().is_some() {
                    Head::Done(Dequeue::Ready(Arc::clone(&head)))
                } else if sync.poll(env.timestamps.as_ref()) == 0 {
                    Head::InPlace(Arc::clone(&head))
                } else {
                    sync.arm_timer();
                    return Head::Done(Dequeue::Pending(Arc::clone(&head)));
                }
            }
            DrawKind::Bind(_) => Head::Bind {
                object: Arc::clone(&head),
                idle: timestamp_retired(env.retired(self.id), q.submitted_timestamp),
            },
            DrawKind::Timeline(_) => Head::InPlace(Arc::clone(&head)),
        };
        q.pop();
        self.room.notify_all();
        popped
    }

    /// Return a popped object to the front of the ring
    pub(crate) fn put_back(&self, object: DrawObjectRef) -> bool {
        let mut q = lock(&self.queue);
        match q.push_front(object) {
            Ok(()) => true,
            Err(object) => {
                log::error!("ctx {}: no slot to put back {:?}", self.id, object);
                object.set_flag(ObjectFlags::CANCELLED);
                false
            }
        }
    }

    pub(crate) fn note_submitted(&self, object: &DrawObject) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if object.timestamp() != 0 {
            lock(&self.queue).submitted_timestamp = object.timestamp();
        }
    }

    pub(crate) fn note_retired(&self) {
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
    }

    fn cancel_locked(&self, q: &mut ContextQueue) -> Vec<DrawObjectRef> {
        let cancelled = q.drain();
        for object in &cancelled {
            object.set_flag(ObjectFlags::CANCELLED);
        }
        self.counters
            .cancelled
            .fetch_add(cancelled.len() as u64, Ordering::Relaxed);
        self.room.notify_all();
        cancelled
    }

    /// Release what cancelled objects hold; runs with the queue unlocked
    fn release_cancelled(&self, cancelled: &[DrawObjectRef], env: &Interfaces) {
        for object in cancelled {
            match object.kind() {
                DrawKind::Sync(sync) => {
                    if let Some(handle) = lock(&sync.hw_fence).take() {
                        env.hardware_fence.release(handle);
                    }
                }
                // waiters on other contexts must not hang on a dead queue
                DrawKind::Timeline(timeline) => timeline.signal_all(),
                _ => {}
            }
        }
    }

    /// Mark the context bad, cancel its queued work and wake every waiter.
    ///
    /// Returns `false` if it was already invalid.
    pub(crate) fn invalidate(&self, env: &Interfaces) -> bool {
        if !self.set_state(ContextState::INVALID) {
            return false;
        }
        let (last, cancelled) = {
            let mut q = lock(&self.queue);
            let cancelled = self.cancel_locked(&mut q);
            log::warn!("ctx {}: invalidated, {} queued objects cancelled", self.id, cancelled.len());
            if q.timestamp != 0 && !timestamp_retired(env.retired(self.id), q.timestamp) {
                env.timestamps.force_write(self.id, q.timestamp);
            }
            (q.timestamp, cancelled)
        };
        self.release_cancelled(&cancelled, env);
        self.fire_waiters(last);
        env.events.signal_group(self.id);
        true
    }

    /// Release the context: queued work is dropped, inflight work still retires
    pub(crate) fn detach(&self, env: &Interfaces) -> bool {
        if !self.set_state(ContextState::DETACHED) {
            return false;
        }
        let cancelled = {
            let mut q = lock(&self.queue);
            self.cancel_locked(&mut q)
        };
        self.release_cancelled(&cancelled, env);
        log::debug!("ctx {}: detached, {} queued objects dropped", self.id, cancelled.len());
        // dependents re-poll and expire their points on this context
        let waiters = std::mem::take(&mut *lock(&self.waiters));
        for entry in waiters {
            (entry.waiter)();
        }
        env.events.signal_group(self.id);
        true
    }

    /// Run `waiter` once `timestamp` retires.
    ///
    /// Returns `false` without storing it if the timestamp already retired.
    /// Waiters run on the retiring thread and must not block.
    pub(crate) fn add_timestamp_waiter(
        &self,
        timestamp: u32,
        store: &dyn TimestampStore,
        waiter: impl FnOnce() + Send + 'static,
    ) -> bool {
        self.register_timestamp_waiter(timestamp, store, waiter).is_some()
    }

    /// Like [`DrawContext::add_timestamp_waiter`], returning a handle for
    /// [`DrawContext::remove_timestamp_waiter`]
    pub(crate) fn register_timestamp_waiter(
        &self,
        timestamp: u32,
        store: &dyn TimestampStore,
        waiter: impl FnOnce() + Send + 'static,
    ) -> Option<WaiterId> {
        let mut waiters = lock(&self.waiters);
        if timestamp_retired(store.read(self.id, TimestampKind::Retired), timestamp) {
            return None;
        }
        let id = WaiterId(self.next_waiter.fetch_add(1, Ordering::Relaxed));
        waiters.push(TimestampWaiter {
            id,
            timestamp,
            waiter: Box::new(waiter),
        });
        Some(id)
    }

    /// Drop a waiter that has not fired yet
    pub(crate) fn remove_timestamp_waiter(&self, id: WaiterId) {
        lock(&self.waiters).retain(|w| w.id != id);
    }

    pub(crate) fn fire_waiters(&self, retired: u32) {
        let ready: Vec<Waiter> = {
            let mut waiters = lock(&self.waiters);
            if waiters.is_empty() {
                return;
            }
            let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| timestamp_retired(retired, w.timestamp));
            *waiters = rest;
            ready.into_iter().map(|w| w.waiter).collect()
        };
        for waiter in ready {
            waiter();
        }
    }

    /// Record a fault; returns `true` once the context hits the throttle
    pub(crate) fn record_fault(&self, now: Instant, burst: u32, period: Duration) -> bool {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        let mut times = lock(&self.fault_times);
        times.push_back(now);
        while let Some(first) = times.front() {
            if now.duration_since(*first) > period {
                times.pop_front();
            } else {
                break;
            }
        }
        burst > 0 && times.len() >= burst as usize
    }

    /// Head object, if it is a sync that has waited longer than `timeout`
    pub(crate) fn stalled_sync(&self, timeout: Duration) -> Option<DrawObjectRef> {
        let q = lock(&self.queue);
        let head = q.peek()?;
        let since = head.as_sync()?.waiting_since()?;
        (since.elapsed() >= timeout).then(|| Arc::clone(head))
    }

    /// Point-in-time counters
    pub fn stats(&self) -> ContextStats {
        let waiters = lock(&self.waiters).len();
        let q = lock(&self.queue);
        ContextStats {
            id: self.id,
            priority: self.priority,
            queued: q.queued,
            timestamp: q.timestamp,
            queued_timestamp: q.queued_timestamp,
            submitted_timestamp: q.submitted_timestamp,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            waiters,
            invalid: self.is_invalid(),
            detached: self.is_detached(),
        }
    }
}

impl std::fmt::Debug for DrawContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawContext")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{
        LogDiagnostics, MockHardwareQueue, MockPowerControl, MockTimestampStore, NoHardwareFence,
        NullEvents,
    };
    use crate::object::CommandRequest;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32 as Counter;

    fn env_with_retired(retired: Arc<Counter>) -> Interfaces {
        let mut store = MockTimestampStore::new();
        let r = Arc::clone(&retired);
        store.expect_read().returning(move |_, _| r.load(Ordering::SeqCst));
        let w = Arc::clone(&retired);
        store
            .expect_force_write()
            .returning(move |_, ts| w.store(ts, Ordering::SeqCst));
        Interfaces {
            hardware_queue: Arc::new(MockHardwareQueue::new()),
            timestamps: Arc::new(store),
            diagnostics: Arc::new(LogDiagnostics),
            power: Arc::new(MockPowerControl::new()),
            events: Arc::new(NullEvents),
            hardware_fence: Arc::new(NoHardwareFence),
        }
    }

    fn context(flags: ContextFlags) -> Arc<DrawContext> {
        DrawContext::new(
            1,
            ContextParams { priority: 0, flags },
            &SchedulerConfig::quick(),
        )
    }

    fn cmd() -> DrawRequest {
        DrawRequest::Command(CommandRequest::with_ib_count(1))
    }

    #[test]
    fn test_timestamps_increase() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        let a = ctx.enqueue(vec![cmd()], None, &env).unwrap();
        let b = ctx.enqueue(vec![cmd(), cmd()], None, &env).unwrap();
        assert_eq!(a.timestamp, 1);
        assert_eq!(b.timestamp, 3);
        assert_eq!(ctx.queued(), 3);
    }

    #[test]
    fn test_user_timestamp_must_advance() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::USER_TIMESTAMP);
        ctx.enqueue(vec![cmd()], Some(10), &env).unwrap();
        for bad in [10, 9, 1] {
            let err = ctx.enqueue(vec![cmd()], Some(bad), &env).unwrap_err();
            assert!(matches!(err, SchedError::RangeError { last: 10, .. }));
        }
        assert_eq!(ctx.queued(), 1);
        assert_eq!(ctx.last_timestamp(), 10);
    }

    #[test]
    fn test_capacity_rejects_without_mutation() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        let too_many_ibs = DrawRequest::Command(CommandRequest::with_ib_count(65));
        assert!(matches!(
            ctx.enqueue(vec![too_many_ibs], None, &env),
            Err(SchedError::CapacityExceeded(_))
        ));
        let too_many_objects: Vec<_> = (0..8).map(|_| cmd()).collect();
        assert!(matches!(
            ctx.enqueue(too_many_objects, None, &env),
            Err(SchedError::CapacityExceeded(_))
        ));
        assert_eq!(ctx.queued(), 0);
        assert_eq!(ctx.last_timestamp(), 0);
    }

    #[test]
    fn test_full_queue_times_out() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        let fill: Vec<_> = (0..7).map(|_| cmd()).collect();
        ctx.enqueue(fill, None, &env).unwrap();
        assert!(matches!(
            ctx.enqueue(vec![cmd()], None, &env),
            Err(SchedError::TimedOut)
        ));
    }

    #[test]
    fn test_marker_on_idle_context_retires_immediately() {
        let retired = Arc::new(Counter::new(0));
        let env = env_with_retired(Arc::clone(&retired));
        let ctx = context(ContextFlags::empty());
        let out = ctx.enqueue(vec![DrawRequest::Marker], None, &env).unwrap();
        assert_eq!(out.queued, 0);
        assert_eq!(retired.load(Ordering::SeqCst), out.timestamp);
    }

    #[test]
    fn test_marker_waits_then_skips_for_new_work() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        ctx.enqueue(vec![cmd(), DrawRequest::Marker], None, &env).unwrap();

        assert!(matches!(ctx.dequeue_ready(&env), Dequeue::Ready(_)));
        match ctx.dequeue_ready(&env) {
            Dequeue::Pending(marker) => assert_eq!(marker.timestamp(), 2),
            other => panic!("expected pending marker, got {:?}", other),
        }

        ctx.enqueue(vec![cmd()], None, &env).unwrap();
        match ctx.dequeue_ready(&env) {
            Dequeue::Ready(marker) => {
                assert_eq!(marker.timestamp(), 2);
                assert!(marker.has(ObjectFlags::SKIP));
            }
            other => panic!("expected skipped marker, got {:?}", other),
        }
    }

    #[test]
    fn test_put_back_uses_reserved_slot() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        ctx.enqueue((0..7).map(|_| cmd()).collect(), None, &env).unwrap();
        let Dequeue::Ready(first) = ctx.dequeue_ready(&env) else {
            panic!("expected a command");
        };
        // a producer refills the freed slot before the put-back
        ctx.enqueue(vec![cmd()], None, &env).unwrap();
        assert!(ctx.put_back(Arc::clone(&first)));
        assert_eq!(ctx.queued(), 8);
        let Dequeue::Ready(again) = ctx.dequeue_ready(&env) else {
            panic!("expected a command");
        };
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_invalidate_cancels_and_wakes() {
        let retired = Arc::new(Counter::new(0));
        let env = env_with_retired(Arc::clone(&retired));
        let ctx = context(ContextFlags::empty());
        ctx.enqueue(vec![cmd(), cmd()], None, &env).unwrap();
        assert!(ctx.invalidate(&env));
        assert!(!ctx.invalidate(&env));
        assert_eq!(ctx.queued(), 0);
        assert_eq!(retired.load(Ordering::SeqCst), 2);
        assert!(matches!(
            ctx.enqueue(vec![cmd()], None, &env),
            Err(SchedError::ContextInvalid(1))
        ));
        assert_eq!(ctx.stats().cancelled, 2);
    }

    #[test]
    fn test_fault_throttle() {
        let ctx = context(ContextFlags::empty());
        let now = Instant::now();
        let period = Duration::from_secs(3);
        assert!(!ctx.record_fault(now, 3, period));
        assert!(!ctx.record_fault(now, 3, period));
        assert!(ctx.record_fault(now, 3, period));
        let later = now + Duration::from_secs(10);
        assert!(!ctx.record_fault(later, 3, period));
    }

    #[test]
    fn test_timestamp_waiter_fires_once_retired() {
        let retired = Arc::new(Counter::new(0));
        let env = env_with_retired(Arc::clone(&retired));
        let ctx = context(ContextFlags::empty());
        let hits = Arc::new(Counter::new(0));
        let h = Arc::clone(&hits);
        assert!(ctx.add_timestamp_waiter(2, env.timestamps.as_ref(), move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.fire_waiters(1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        ctx.fire_waiters(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        retired.store(5, Ordering::SeqCst);
        assert!(!ctx.add_timestamp_waiter(3, env.timestamps.as_ref(), || {}));
    }

    #[test]
    fn test_removed_waiter_never_fires() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        let hits = Arc::new(Counter::new(0));
        let h = Arc::clone(&hits);
        let id = ctx
            .register_timestamp_waiter(4, env.timestamps.as_ref(), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(ctx.stats().waiters, 1);
        ctx.remove_timestamp_waiter(id);
        assert_eq!(ctx.stats().waiters, 0);
        ctx.fire_waiters(4);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bind_runs_with_queue_unlocked() {
        let env = env_with_retired(Arc::new(Counter::new(0)));
        let ctx = context(ContextFlags::empty());
        let seen = Arc::new(Mutex::new(None));
        let (c, s) = (Arc::clone(&ctx), Arc::clone(&seen));
        let bind: crate::object::BindOp = Box::new(move |_, ts| {
            *s.lock().unwrap() = Some((ts, c.queued(), c.last_timestamp()));
        });
        ctx.enqueue(vec![DrawRequest::Bind(bind), cmd()], None, &env).unwrap();

        // nothing submitted yet, so the bind retires in place and the command follows
        match ctx.dequeue_ready(&env) {
            Dequeue::Ready(object) => assert_eq!(object.timestamp(), 2),
            other => panic!("expected the command, got {:?}", other),
        }
        assert_eq!(*seen.lock().unwrap(), Some((1, 1, 2)));
    }
}
