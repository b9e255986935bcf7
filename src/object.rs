//! Draw objects: the units of orderable GPU work
//!
//! A `DrawObject` is built by [`DrawContext`](crate::context::DrawContext) from a client
//! [`DrawRequest`] at enqueue time, when its owning context and timestamp become known.
//! After that only its state flags change; its position in the context queue is fixed.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::DrawContext;
use crate::hw::{FenceHandle, TimestampKind, TimestampStore};
use crate::sync::lock;

/// Context identifier
pub type ContextId = u32;

/// Shared handle to a draw object
pub type DrawObjectRef = Arc<DrawObject>;

/// Callback run when a bind object reaches the head of its queue
pub type BindOp = Box<dyn FnOnce(ContextId, u32) + Send>;

type Waiter = Box<dyn FnOnce() + Send>;

/// Timestamps closer than this are compared directly; farther apart they have wrapped
const TIMESTAMP_WINDOW: u32 = 0x8000_0000;

/// Compare two context timestamps, allowing for 32-bit wraparound
pub fn timestamp_cmp(a: u32, b: u32) -> CmpOrdering {
    if a == b {
        CmpOrdering::Equal
    } else if (a > b && a - b < TIMESTAMP_WINDOW) || (a < b && b - a > TIMESTAMP_WINDOW) {
        CmpOrdering::Greater
    } else {
        CmpOrdering::Less
    }
}

/// Whether `timestamp` is covered by the `retired` watermark
pub fn timestamp_retired(retired: u32, timestamp: u32) -> bool {
    timestamp_cmp(retired, timestamp) != CmpOrdering::Less
}

/// Hardware lane a command executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    /// Main graphics/compute lane
    Primary,
    /// Low-priority auxiliary lane
    Auxiliary,
}

/// Indirect buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbDesc {
    /// GPU address of the buffer
    pub gpuaddr: u64,
    /// Size in bytes
    pub size: u64,
}

bitflags! {
    /// Client-requested command behavior
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CommandFlags: u32 {
        /// Start a recurring background command
        const RECURRING_START = 1 << 0;
        /// Stop the recurring background command
        const RECURRING_STOP = 1 << 1;
        /// Execute on the auxiliary lane
        const AUX_LANE = 1 << 2;
    }
}

bitflags! {
    /// Scheduler-side object state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// Dispatch as a timestamp-only no-op
        const SKIP = 1 << 0;
        /// Object was blamed for a hardware fault
        const FAULT = 1 << 1;
        /// Accepted by the hardware queue at least once
        const SUBMITTED = 1 << 2;
        /// Final timestamp bookkeeping done
        const RETIRED = 1 << 3;
        /// Dropped before reaching hardware
        const CANCELLED = 1 << 4;
        /// Wake-up callbacks registered for its dependencies
        const ARMED = 1 << 5;
    }
}

/// A one-shot software fence
pub struct Fence {
    name: String,
    signaled: AtomicBool,
    waiters: Mutex<Vec<Waiter>>,
}

impl Fence {
    /// Create an unsignaled fence
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            signaled: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        })
    }

    /// Fence name, for logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the fence has fired
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Fire the fence and run its waiters; later calls do nothing
    pub fn signal(&self) {
        let waiters = {
            let mut waiters = lock(&self.waiters);
            if self.signaled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Register a callback for when the fence fires.
    ///
    /// Returns `false` without storing the callback if the fence already fired.
    pub fn add_waiter(&self, waiter: impl FnOnce() + Send + 'static) -> bool {
        let mut waiters = lock(&self.waiters);
        if self.is_signaled() {
            return false;
        }
        waiters.push(Box::new(waiter));
        true
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// A monotonically increasing software timeline
pub struct Timeline {
    id: u32,
    value: AtomicU64,
    waiters: Mutex<Vec<(u64, Waiter)>>,
}

impl Timeline {
    /// Create a timeline starting at `initial`
    pub fn new(id: u32, initial: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            value: AtomicU64::new(initial),
            waiters: Mutex::new(Vec::new()),
        })
    }

    /// Timeline id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current value
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Advance the timeline to `value`; values at or below the current one are ignored
    pub fn signal(&self, value: u64) {
        let ready: Vec<Waiter> = {
            let mut waiters = lock(&self.waiters);
            if self.value.fetch_max(value, Ordering::AcqRel) >= value {
                return;
            }
            let (ready, rest): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *waiters).into_iter().partition(|(seqno, _)| *seqno <= value);
            *waiters = rest;
            ready.into_iter().map(|(_, w)| w).collect()
        };
        for waiter in ready {
            waiter();
        }
    }

    /// Register a callback for when the timeline reaches `seqno`.
    ///
    /// Returns `false` without storing the callback if it already has.
    pub fn add_waiter(&self, seqno: u64, waiter: impl FnOnce() + Send + 'static) -> bool {
        let mut waiters = lock(&self.waiters);
        if self.value() >= seqno {
            return false;
        }
        waiters.push((seqno, Box::new(waiter)));
        true
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("id", &self.id)
            .field("value", &self.value())
            .finish()
    }
}

/// A dependency a sync object waits on
#[derive(Debug, Clone)]
pub enum SyncPoint {
    /// Another context's timestamp retiring
    Timestamp {
        /// Context owning the timestamp
        context: ContextId,
        /// Timestamp to wait for
        timestamp: u32,
    },
    /// A software fence firing
    Fence(Arc<Fence>),
    /// A timeline reaching a value
    Timeline {
        /// Timeline to watch
        timeline: Arc<Timeline>,
        /// Value to wait for
        seqno: u64,
    },
}

impl SyncPoint {
    /// Whether this dependency is satisfied
    pub fn is_signaled(&self, store: &dyn TimestampStore) -> bool {
        match self {
            SyncPoint::Timestamp { context, timestamp } => {
                timestamp_retired(store.read(*context, TimestampKind::Retired), *timestamp)
            }
            SyncPoint::Fence(fence) => fence.is_signaled(),
            SyncPoint::Timeline { timeline, seqno } => timeline.value() >= *seqno,
        }
    }
}

/// Wall-clock trace of one command's life
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSample {
    /// When the command entered its context queue
    pub queued_at: Option<DateTime<Utc>>,
    /// When the hardware queue accepted it
    pub submitted_at: Option<DateTime<Utc>>,
    /// When it retired
    pub retired_at: Option<DateTime<Utc>>,
    /// Whether it was force-retired after a fault
    pub faulted: bool,
}

/// Client-visible profiling buffer shared with a command
pub type ProfilingBuffer = Arc<Mutex<ProfileSample>>;

/// A command submission before it is queued
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    /// Indirect buffers to execute
    pub ibs: Vec<IbDesc>,
    /// Behavior flags
    pub flags: CommandFlags,
    /// Optional profiling buffer
    pub profiling: Option<ProfilingBuffer>,
}

impl CommandRequest {
    /// Command executing `ibs`
    pub fn new(ibs: Vec<IbDesc>) -> Self {
        Self {
            ibs,
            ..Self::default()
        }
    }

    /// Command with `count` dummy IBs, for tests and tools
    pub fn with_ib_count(count: usize) -> Self {
        Self::new(
            (0..count as u64)
                .map(|i| IbDesc {
                    gpuaddr: 0x1000_0000 + i * 0x1000,
                    size: 0x100,
                })
                .collect(),
        )
    }

    /// Set behavior flags
    pub fn flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attach a profiling buffer
    pub fn profiling(mut self, buffer: ProfilingBuffer) -> Self {
        self.profiling = Some(buffer);
        self
    }
}

/// One object in a client submission
pub enum DrawRequest {
    /// GPU command
    Command(CommandRequest),
    /// Wait for dependencies
    Sync(Vec<SyncPoint>),
    /// Barrier on everything queued before it
    Marker,
    /// Administrative bind operation
    Bind(BindOp),
    /// Signal timelines
    Timeline(Vec<(Arc<Timeline>, u64)>),
}

impl DrawRequest {
    pub(crate) fn has_timestamp(&self) -> bool {
        !matches!(self, DrawRequest::Sync(_) | DrawRequest::Timeline(_))
    }
}

impl fmt::Debug for DrawRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawRequest::Command(cmd) => f.debug_tuple("Command").field(&cmd.ibs.len()).finish(),
            DrawRequest::Sync(points) => f.debug_tuple("Sync").field(points).finish(),
            DrawRequest::Marker => f.write_str("Marker"),
            DrawRequest::Bind(_) => f.write_str("Bind"),
            DrawRequest::Timeline(sigs) => f.debug_tuple("Timeline").field(&sigs.len()).finish(),
        }
    }
}

/// Command payload
pub struct CommandObject {
    pub(crate) ibs: Vec<IbDesc>,
    pub(crate) flags: CommandFlags,
    pub(crate) big: bool,
    pub(crate) requeue_count: AtomicU32,
    pub(crate) profiling: Option<ProfilingBuffer>,
}

impl CommandObject {
    /// Indirect buffers
    pub fn ibs(&self) -> &[IbDesc] {
        &self.ibs
    }

    /// Behavior flags
    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// Whether it exceeds the single-slot dispatch limit
    pub fn is_big(&self) -> bool {
        self.big
    }

    /// Times the hardware refused it transiently
    pub fn requeue_count(&self) -> u32 {
        self.requeue_count.load(Ordering::Relaxed)
    }

    fn stamp(&self, f: impl FnOnce(&mut ProfileSample)) {
        if let Some(buffer) = &self.profiling {
            f(&mut lock(buffer));
        }
    }
}

/// Sync payload
pub struct SyncObject {
    pub(crate) pending: Mutex<Vec<SyncPoint>>,
    pub(crate) hw_fence: Mutex<Option<FenceHandle>>,
    pub(crate) armed_at: Mutex<Option<Instant>>,
    pub(crate) timeout_reported: AtomicBool,
}

impl SyncObject {
    pub(crate) fn new(points: Vec<SyncPoint>) -> Self {
        Self {
            pending: Mutex::new(points),
            hw_fence: Mutex::new(None),
            armed_at: Mutex::new(None),
            timeout_reported: AtomicBool::new(false),
        }
    }

    /// Drop satisfied dependencies and return how many remain
    pub fn poll(&self, store: &dyn TimestampStore) -> usize {
        let mut pending = lock(&self.pending);
        pending.retain(|point| !point.is_signaled(store));
        pending.len()
    }

    /// Snapshot of unresolved dependencies
    pub fn pending_points(&self) -> Vec<SyncPoint> {
        lock(&self.pending).clone()
    }

    /// Forget every dependency on `context`
    pub(crate) fn expire_context(&self, context: ContextId) {
        lock(&self.pending)
            .retain(|p| !matches!(p, SyncPoint::Timestamp { context: c, .. } if *c == context));
    }

    /// Hardware fence backing this sync, if any
    pub fn hw_fence(&self) -> Option<FenceHandle> {
        *lock(&self.hw_fence)
    }

    /// Start the timeout clock if it isn't running
    pub(crate) fn arm_timer(&self) {
        lock(&self.armed_at).get_or_insert_with(Instant::now);
    }

    pub(crate) fn waiting_since(&self) -> Option<Instant> {
        *lock(&self.armed_at)
    }
}

/// Marker payload
pub struct MarkerObject {
    pub(crate) marker_timestamp: u32,
}

impl MarkerObject {
    /// Timestamp of the last object queued before the marker
    pub fn marker_timestamp(&self) -> u32 {
        self.marker_timestamp
    }
}

/// Bind payload
pub struct BindObject {
    pub(crate) op: Mutex<Option<BindOp>>,
}

impl BindObject {
    /// Run the bind operation; only the first call does anything
    pub(crate) fn execute(&self, context: ContextId, timestamp: u32) {
        let op = lock(&self.op).take();
        if let Some(op) = op {
            op(context, timestamp);
        }
    }
}

/// Timeline payload
pub struct TimelineObject {
    pub(crate) signals: Mutex<Vec<(Arc<Timeline>, u64)>>,
}

impl TimelineObject {
    /// Signal every timeline; only the first call does anything
    pub(crate) fn signal_all(&self) {
        let signals = std::mem::take(&mut *lock(&self.signals));
        for (timeline, value) in signals {
            timeline.signal(value);
        }
    }
}

/// Variant payload of a draw object
pub enum DrawKind {
    /// GPU command
    Command(CommandObject),
    /// Dependency wait
    Sync(SyncObject),
    /// Barrier
    Marker(MarkerObject),
    /// Administrative bind
    Bind(BindObject),
    /// Timeline signal
    Timeline(TimelineObject),
}

/// One unit of orderable work
pub struct DrawObject {
    context: Arc<DrawContext>,
    timestamp: u32,
    flags: AtomicU32,
    kind: DrawKind,
}

impl DrawObject {
    pub(crate) fn new(context: Arc<DrawContext>, timestamp: u32, kind: DrawKind) -> DrawObjectRef {
        Arc::new(Self {
            context,
            timestamp,
            flags: AtomicU32::new(0),
            kind,
        })
    }

    /// Owning context
    pub fn context(&self) -> &Arc<DrawContext> {
        &self.context
    }

    /// Owning context id
    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }

    /// Assigned timestamp; 0 for sync and timeline objects
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Variant payload
    pub fn kind(&self) -> &DrawKind {
        &self.kind
    }

    /// Short variant name, for logs
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DrawKind::Command(_) => "cmd",
            DrawKind::Sync(_) => "sync",
            DrawKind::Marker(_) => "marker",
            DrawKind::Bind(_) => "bind",
            DrawKind::Timeline(_) => "timeline",
        }
    }

    /// Command payload, if this is a command
    pub fn as_command(&self) -> Option<&CommandObject> {
        match &self.kind {
            DrawKind::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Sync payload, if this is a sync
    pub fn as_sync(&self) -> Option<&SyncObject> {
        match &self.kind {
            DrawKind::Sync(sync) => Some(sync),
            _ => None,
        }
    }

    /// Current state flags
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether all of `flags` are set
    pub fn has(&self, flags: ObjectFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Set `flag`, returning `true` if this call set it
    pub(crate) fn set_flag(&self, flag: ObjectFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        old & flag.bits() == 0
    }

    /// Lane the object executes on
    pub fn lane(&self) -> Lane {
        match &self.kind {
            DrawKind::Command(cmd) if cmd.flags.contains(CommandFlags::AUX_LANE) => Lane::Auxiliary,
            _ => Lane::Primary,
        }
    }

    /// IBs the hardware will execute; none for skipped or administrative objects
    pub fn dispatch_ibs(&self) -> &[IbDesc] {
        match &self.kind {
            DrawKind::Command(cmd) if !self.has(ObjectFlags::SKIP) => &cmd.ibs,
            _ => &[],
        }
    }

    pub(crate) fn stamp_queued(&self) {
        if let DrawKind::Command(cmd) = &self.kind {
            cmd.stamp(|s| s.queued_at = Some(Utc::now()));
        }
    }

    pub(crate) fn stamp_submitted(&self) {
        if let DrawKind::Command(cmd) = &self.kind {
            cmd.stamp(|s| s.submitted_at = Some(Utc::now()));
        }
    }

    pub(crate) fn stamp_retired(&self, faulted: bool) {
        if let DrawKind::Command(cmd) = &self.kind {
            cmd.stamp(|s| {
                s.retired_at = Some(Utc::now());
                s.faulted = faulted;
            });
        }
    }
}

impl fmt::Debug for DrawObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrawObject")
            .field("context", &self.context_id())
            .field("kind", &self.kind_name())
            .field("timestamp", &self.timestamp)
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;

    #[rstest]
    #[case(5, 3, CmpOrdering::Greater)]
    #[case(3, 5, CmpOrdering::Less)]
    #[case(7, 7, CmpOrdering::Equal)]
    #[case(2, 0xFFFF_FFF0, CmpOrdering::Greater)]
    #[case(0xFFFF_FFF0, 2, CmpOrdering::Less)]
    fn test_timestamp_cmp(#[case] a: u32, #[case] b: u32, #[case] expected: CmpOrdering) {
        assert_eq!(timestamp_cmp(a, b), expected);
    }

    #[test]
    fn test_fence_runs_waiters_once() {
        let fence = Fence::new("f0");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        assert!(fence.add_waiter(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        fence.signal();
        fence.signal();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!fence.add_waiter(|| {}));
    }

    #[test]
    fn test_timeline_wakes_only_reached_waiters() {
        let timeline = Timeline::new(1, 0);
        let hits = Arc::new(AtomicUsize::new(0));
        for seqno in [2u64, 5] {
            let h = Arc::clone(&hits);
            timeline.add_waiter(seqno, move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        timeline.signal(3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        timeline.signal(2);
        assert_eq!(timeline.value(), 3);
        timeline.signal(5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
