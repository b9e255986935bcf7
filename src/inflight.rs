//! Inflight tracking and retirement
//!
//! Every object the hardware queue accepts is appended to the [`InflightList`]
//! and stays there until its timestamp retires, a fault force-retires it, or
//! replay after a reset drops it. The list is only touched under the device lock.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::hw::Interfaces;
use crate::object::{timestamp_retired, ContextId, DrawKind, DrawObjectRef, Lane, ObjectFlags};
use crate::sync::lock;

/// How an object reaches retirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireMode {
    /// Hardware reported completion
    Hardware,
    /// Resolved without hardware; timestamp written by software
    InPlace,
    /// Blamed for a fault or dropped in recovery
    Forced,
}

/// Final bookkeeping for an object.
///
/// Runs at most once per object; returns `false` if it already retired.
pub(crate) fn retire_object(object: &DrawObjectRef, env: &Interfaces, mode: RetireMode) -> bool {
    if !object.set_flag(ObjectFlags::RETIRED) {
        return false;
    }
    let ctx = object.context_id();
    let ts = object.timestamp();

    if mode == RetireMode::Forced {
        object.set_flag(ObjectFlags::FAULT);
    }
    // never move the watermark backwards
    if mode != RetireMode::Hardware && ts != 0 && !timestamp_retired(env.retired(ctx), ts) {
        env.timestamps.force_write(ctx, ts);
    }

    match object.kind() {
        DrawKind::Sync(sync) => {
            if let Some(handle) = lock(&sync.hw_fence).take() {
                env.hardware_fence.release(handle);
            }
        }
        DrawKind::Timeline(timeline) => timeline.signal_all(),
        DrawKind::Command(_) => object.stamp_retired(mode == RetireMode::Forced),
        DrawKind::Marker(_) | DrawKind::Bind(_) => {}
    }

    log::trace!("retired {:?} ({:?})", object, mode);
    let context = object.context();
    context.note_retired();
    context.fire_waiters(env.retired(ctx));
    env.events.signal_group(ctx);
    true
}

/// One accepted submission
#[derive(Debug, Clone)]
pub(crate) struct InflightEntry {
    pub object: DrawObjectRef,
    pub submitted_at: Instant,
}

impl InflightEntry {
    pub fn context_id(&self) -> ContextId {
        self.object.context_id()
    }

    pub fn timestamp(&self) -> u32 {
        self.object.timestamp()
    }

    pub fn lane(&self) -> Lane {
        self.object.lane()
    }

    /// Whether the hardware has finished with it
    pub fn is_complete(&self, env: &Interfaces) -> bool {
        match self.object.as_sync() {
            Some(sync) => sync.poll(env.timestamps.as_ref()) == 0,
            None => timestamp_retired(env.retired(self.context_id()), self.timestamp()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HangWatch {
    context: ContextId,
    timestamp: u32,
    consumed: u32,
    retired: u32,
}

/// FIFO of submitted objects awaiting retirement
#[derive(Debug, Default)]
pub(crate) struct InflightList {
    entries: VecDeque<InflightEntry>,
    watch: Option<(HangWatch, Instant)>,
}

impl InflightList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object: DrawObjectRef) {
        self.entries.push_back(InflightEntry {
            object,
            submitted_at: Instant::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InflightEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, object: &DrawObjectRef) -> bool {
        self.entries.iter().any(|e| Arc::ptr_eq(&e.object, object))
    }

    pub fn get(&self, index: usize) -> Option<&InflightEntry> {
        self.entries.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<InflightEntry> {
        self.entries.remove(index)
    }

    pub fn drain(&mut self) -> Vec<InflightEntry> {
        self.watch = None;
        self.entries.drain(..).collect()
    }

    /// Remove every entry the hardware has completed.
    ///
    /// In strict mode the scan stops at the first incomplete entry; otherwise it
    /// walks the whole list so syncs can finish out of order.
    pub fn take_completed(&mut self, env: &Interfaces, strict: bool) -> Vec<DrawObjectRef> {
        let mut done = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].is_complete(env) {
                if let Some(entry) = self.entries.remove(i) {
                    done.push(entry.object);
                }
            } else if strict {
                break;
            } else {
                i += 1;
            }
        }
        done
    }

    /// Report the oldest command whose context made no progress for `timeout`
    pub fn check_hang(&mut self, env: &Interfaces, timeout: Duration) -> Option<(ContextId, u32, Lane)> {
        let Some(front) = self.entries.iter().find(|e| e.object.as_sync().is_none()) else {
            self.watch = None;
            return None;
        };
        let ctx = front.context_id();
        let current = HangWatch {
            context: ctx,
            timestamp: front.timestamp(),
            consumed: env.consumed(ctx),
            retired: env.retired(ctx),
        };
        let now = Instant::now();
        match self.watch {
            Some((seen, since)) if seen == current => {
                if now.duration_since(since) >= timeout {
                    self.watch = Some((current, now));
                    return Some((ctx, current.timestamp, front.lane()));
                }
            }
            _ => self.watch = Some((current, now)),
        }
        None
    }

    /// Hardware-backed syncs inflight longer than `timeout`, each reported once
    pub fn stale_fence_syncs(&self, timeout: Duration) -> Vec<DrawObjectRef> {
        self.entries
            .iter()
            .filter(|e| e.submitted_at.elapsed() >= timeout)
            .filter(|e| {
                e.object.as_sync().is_some_and(|sync| {
                    sync.hw_fence().is_some() && !sync.timeout_reported.swap(true, Ordering::AcqRel)
                })
            })
            .map(|e| Arc::clone(&e.object))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::context::{ContextParams, DrawContext};
    use crate::hw::{
        LogDiagnostics, MockEventSink, MockHardwareQueue, MockPowerControl, MockTimestampStore,
        NoHardwareFence, TimestampKind,
    };
    use crate::object::{CommandObject, DrawObject, MarkerObject};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn env(retired: Arc<AtomicU32>, consumed: Arc<AtomicU32>) -> Interfaces {
        let mut store = MockTimestampStore::new();
        let (r, c) = (Arc::clone(&retired), consumed);
        store.expect_read().returning(move |_, kind| match kind {
            TimestampKind::Retired => r.load(Ordering::SeqCst),
            TimestampKind::Consumed => c.load(Ordering::SeqCst),
        });
        store
            .expect_force_write()
            .returning(move |_, ts| retired.store(ts, Ordering::SeqCst));
        let mut events = MockEventSink::new();
        events.expect_signal_group().returning(|_| ());
        Interfaces {
            hardware_queue: Arc::new(MockHardwareQueue::new()),
            timestamps: Arc::new(store),
            diagnostics: Arc::new(LogDiagnostics),
            power: Arc::new(MockPowerControl::new()),
            events: Arc::new(events),
            hardware_fence: Arc::new(NoHardwareFence),
        }
    }

    fn command(ctx: &Arc<DrawContext>, ts: u32) -> DrawObjectRef {
        DrawObject::new(
            Arc::clone(ctx),
            ts,
            DrawKind::Command(CommandObject {
                ibs: Vec::new(),
                flags: Default::default(),
                big: false,
                requeue_count: AtomicU32::new(0),
                profiling: None,
            }),
        )
    }

    fn ctx() -> Arc<DrawContext> {
        DrawContext::new(7, ContextParams::default(), &SchedulerConfig::quick())
    }

    #[test]
    fn test_forced_retire_writes_once() {
        let retired = Arc::new(AtomicU32::new(0));
        let env = env(Arc::clone(&retired), Arc::new(AtomicU32::new(0)));
        let ctx = ctx();
        let obj = command(&ctx, 42);
        assert!(retire_object(&obj, &env, RetireMode::Forced));
        assert!(!retire_object(&obj, &env, RetireMode::Forced));
        assert!(obj.has(ObjectFlags::FAULT | ObjectFlags::RETIRED));
        assert_eq!(retired.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_take_completed_fifo_modes() {
        let retired = Arc::new(AtomicU32::new(0));
        let env = env(Arc::clone(&retired), Arc::new(AtomicU32::new(0)));
        let ctx = ctx();
        let mut list = InflightList::new();
        list.push(command(&ctx, 1));
        list.push(command(&ctx, 2));
        list.push(command(&ctx, 3));
        retired.store(2, Ordering::SeqCst);
        let done = list.take_completed(&env, true);
        assert_eq!(done.iter().map(|o| o.timestamp()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_hang_needs_stalled_progress() {
        let consumed = Arc::new(AtomicU32::new(1));
        let env = env(Arc::new(AtomicU32::new(0)), Arc::clone(&consumed));
        let ctx = ctx();
        let mut list = InflightList::new();
        list.push(command(&ctx, 1));
        let timeout = Duration::from_millis(5);
        assert_eq!(list.check_hang(&env, timeout), None);
        std::thread::sleep(Duration::from_millis(10));
        consumed.store(2, Ordering::SeqCst);
        assert_eq!(list.check_hang(&env, timeout), None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(list.check_hang(&env, timeout), Some((7, 1, Lane::Primary)));
    }

    #[test]
    fn test_marker_completes_by_timestamp() {
        let retired = Arc::new(AtomicU32::new(5));
        let env = env(Arc::clone(&retired), Arc::new(AtomicU32::new(0)));
        let ctx = ctx();
        let marker = DrawObject::new(
            Arc::clone(&ctx),
            5,
            DrawKind::Marker(MarkerObject { marker_timestamp: 4 }),
        );
        let entry = InflightEntry {
            object: marker,
            submitted_at: Instant::now(),
        };
        assert!(entry.is_complete(&env));
    }
}
