//! Client-facing scheduler handle

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::context::{ContextParams, ContextStats, DrawContext};
use crate::dispatcher::Dispatcher;
use crate::error::{SchedError, SchedResult};
use crate::fault::{FaultCause, FaultRecord, FaultReport, FaultState};
use crate::hw::Interfaces;
use crate::object::{timestamp_cmp, timestamp_retired, ContextId, DrawRequest};
use crate::sync::{lock, wait_until, WaitOutcome};

/// Point-in-time view of the whole scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
    /// Registered contexts
    pub contexts: Vec<ContextStats>,
    /// Objects on the hardware
    pub inflight: usize,
    /// Dispatch halted
    pub halted: bool,
    /// Active power vote held
    pub powered: bool,
    /// Background command restarted after resets, as (context, timestamp)
    pub recurring: Option<(ContextId, u32)>,
    /// Fault state machine position
    pub fault_state: FaultState,
    /// Unprocessed fault causes
    pub fault_mask: FaultCause,
    /// Dispatch passes run
    pub passes: u64,
    /// Objects accepted by the hardware queue
    pub submitted: u64,
    /// Contexts put back on the requeue list
    pub requeued: u64,
    /// Objects retired off the inflight list
    pub retired: u64,
    /// Hangs detected
    pub hangs_detected: u64,
    /// Sync objects reported as stuck
    pub sync_timeouts: u64,
    /// Completed fault recoveries
    pub recoveries: u64,
    /// Times the power vote was taken
    pub power_acquisitions: u64,
    /// Recent recoveries, oldest first
    pub fault_history: Vec<FaultRecord>,
}

/// GPU command scheduler.
///
/// Owns the dispatch worker; dropping the handle stops it and releases every
/// context.
pub struct Scheduler {
    core: Arc<Dispatcher>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with its own dispatch thread
    pub fn new(config: SchedulerConfig, env: Interfaces) -> SchedResult<Self> {
        config.validate()?;
        let core = Dispatcher::new(config, env);
        let worker = core.spawn_worker()?;
        log::info!("scheduler started");
        Ok(Self {
            core,
            worker: Some(worker),
        })
    }

    /// Create a scheduler that only dispatches when [`Scheduler::dispatch`] is called
    pub fn manual(config: SchedulerConfig, env: Interfaces) -> SchedResult<Self> {
        config.validate()?;
        Ok(Self {
            core: Dispatcher::new(config, env),
            worker: None,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        self.core.config()
    }

    /// Whether a worker thread is dispatching
    pub fn is_threaded(&self) -> bool {
        self.worker.is_some()
    }

    /// Open a new context
    pub fn create_context(&self, params: ContextParams) -> SchedResult<ContextId> {
        Ok(self.core.create_context(params)?.id())
    }

    /// Release a context.
    ///
    /// Queued objects are dropped and blocked producers fail with `Detached`;
    /// objects already on the hardware still retire.
    pub fn destroy_context(&self, id: ContextId) -> SchedResult<()> {
        self.core.destroy_context(id)
    }

    /// Look up a live context
    pub fn context(&self, id: ContextId) -> Option<Arc<DrawContext>> {
        self.core.context(id)
    }

    fn live_context(&self, id: ContextId) -> SchedResult<Arc<DrawContext>> {
        self.core.context(id).ok_or(SchedError::NoSuchContext(id))
    }

    /// Queue objects on a context and return the last assigned timestamp.
    ///
    /// Blocks while the context queue is full, up to `enqueue_timeout_ms`.
    /// A rejected submission leaves the context unchanged.
    pub fn queue_commands(
        &self,
        id: ContextId,
        requests: Vec<DrawRequest>,
        user_ts: Option<u32>,
    ) -> SchedResult<u32> {
        let context = self.live_context(id)?;
        let outcome = context.enqueue(requests, user_ts, self.core.env())?;
        if outcome.queued > 0 {
            self.core.post(&context);
        }
        Ok(outcome.timestamp)
    }

    fn wait_slice(&self, deadline: Instant) -> Option<Duration> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        Some((deadline - now).min(self.config().worker_poll()))
    }

    /// Block until `timestamp` on context `id` retires
    pub fn wait_timestamp(&self, id: ContextId, timestamp: u32, timeout: Duration) -> SchedResult<()> {
        let context = self.live_context(id)?;
        if timestamp_cmp(timestamp, context.last_timestamp()) == std::cmp::Ordering::Greater {
            return Err(SchedError::InvalidParameter(format!(
                "timestamp {} not queued on ctx {}",
                timestamp, id
            )));
        }

        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let waker = Arc::clone(&signal);
        let env = self.core.env();
        let Some(waiter) = context.register_timestamp_waiter(timestamp, env.timestamps.as_ref(), move || {
            *lock(&waker.0) = true;
            waker.1.notify_all();
        }) else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        let result = loop {
            if !self.is_threaded() {
                self.core.dispatch();
            }
            if timestamp_retired(env.retired(id), timestamp) {
                break Ok(());
            }
            let Some(slice) = self.wait_slice(deadline) else {
                break Err(SchedError::TimedOut);
            };
            let (_guard, outcome) = wait_until(&signal.1, lock(&signal.0), slice, |done| *done, |_| {
                context.is_detached()
            });
            match outcome {
                WaitOutcome::Woken => break Ok(()),
                WaitOutcome::Invalidated => break Err(SchedError::Detached(id)),
                WaitOutcome::TimedOut => {}
            }
        };
        context.remove_timestamp_waiter(waiter);
        result
    }

    /// Whether nothing is queued or inflight
    pub fn is_idle(&self) -> bool {
        self.core.inflight_count() == 0 && self.core.contexts().iter().all(|c| c.queued() == 0)
    }

    /// Block until every context queue is empty and nothing is inflight
    pub fn wait_idle(&self, timeout: Duration) -> SchedResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_threaded() {
                self.core.dispatch();
            }
            if self.is_idle() {
                return Ok(());
            }
            let Some(slice) = self.wait_slice(deadline) else {
                return Err(SchedError::TimedOut);
            };
            let gate = self.core.idle_gate();
            if gate.is_idle() {
                // queued work is blocked on a dependency; nothing will open the gate
                thread::sleep(slice);
            } else {
                gate.wait(slice, || self.core.faults().is_pending());
            }
        }
    }

    /// Invalidate a context: queued work is cancelled and later submissions fail
    pub fn mark_context_bad(&self, id: ContextId, reason: &str) -> SchedResult<()> {
        self.core.invalidate_context(id, reason)
    }

    /// Feed a hardware or firmware fault into recovery
    pub fn report_fault(&self, report: FaultReport) {
        self.core.report_fault(report);
    }

    /// Stop new hardware submissions; queued work is kept
    pub fn halt(&self) {
        self.core.halt();
    }

    /// Undo [`Scheduler::halt`]
    pub fn resume(&self) {
        self.core.resume();
    }

    /// Whether dispatch is halted
    pub fn is_halted(&self) -> bool {
        self.core.is_halted()
    }

    /// Signal that the hardware made progress
    pub fn kick(&self) {
        self.core.kick();
    }

    /// Run dispatch on the calling thread
    pub fn dispatch(&self) {
        self.core.dispatch();
    }

    /// Objects on the hardware
    pub fn inflight(&self) -> usize {
        self.core.inflight_count()
    }

    /// Snapshot of every counter
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.core.counters;
        let load = |v: &std::sync::atomic::AtomicU64| v.load(std::sync::atomic::Ordering::Relaxed);
        let faults = self.core.faults();
        SchedulerStats {
            captured_at: Utc::now(),
            contexts: self.core.contexts().iter().map(|ctx| ctx.stats()).collect(),
            inflight: self.core.inflight_count(),
            halted: self.core.is_halted(),
            powered: self.core.is_powered(),
            recurring: self.core.recurring(),
            fault_state: faults.state(),
            fault_mask: faults.mask(),
            passes: load(&c.passes),
            submitted: load(&c.submitted),
            requeued: load(&c.requeued),
            retired: load(&c.retired),
            hangs_detected: load(&c.hangs),
            sync_timeouts: load(&c.sync_timeouts),
            recoveries: faults.recoveries(),
            power_acquisitions: self.core.vote().acquisitions(),
            fault_history: faults.history(),
        }
    }

    /// Write [`Scheduler::stats`] to a JSON file
    pub fn export_stats_json<P: AsRef<Path>>(&self, path: P) -> SchedResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &self.stats())?;
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("dispatch worker panicked");
            }
        }
        for context in self.core.contexts() {
            let _ = self.core.destroy_context(context.id());
        }
        self.core.drain_all();
        log::debug!("scheduler stopped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("core", &self.core)
            .field("threaded", &self.is_threaded())
            .finish()
    }
}
