//! Active power vote and the idle gate
//!
//! The vote is held from the first accepted submission until the inflight count
//! drops back to zero. The idle gate mirrors the same edge for `wait_idle` callers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::HwError;
use crate::hw::PowerControl;
use crate::sync::{lock, wait_until, WaitOutcome};

/// Tracks whether the scheduler holds the active vote
pub struct PowerVote {
    control: Arc<dyn PowerControl>,
    held: AtomicBool,
    acquisitions: AtomicU64,
}

impl PowerVote {
    /// Wrap a power interface
    pub fn new(control: Arc<dyn PowerControl>) -> Self {
        Self {
            control,
            held: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Take the vote if not already held
    pub fn acquire(&self) -> Result<(), HwError> {
        if self.held.load(Ordering::Acquire) {
            return Ok(());
        }
        self.control.acquire_vote()?;
        self.held.store(true, Ordering::Release);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        log::trace!("power vote acquired");
        Ok(())
    }

    /// Drop the vote if held
    pub fn release(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            self.control.release_vote();
            log::trace!("power vote released");
        }
    }

    /// Whether the vote is held
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Times the vote was taken
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PowerVote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerVote")
            .field("held", &self.is_held())
            .field("acquisitions", &self.acquisitions())
            .finish()
    }
}

/// Completion gate opened whenever nothing is inflight
#[derive(Debug)]
pub struct IdleGate {
    busy: Mutex<bool>,
    cv: Condvar,
}

impl Default for IdleGate {
    fn default() -> Self {
        Self {
            busy: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl IdleGate {
    /// Gate starting open
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate
    pub fn set_busy(&self) {
        *lock(&self.busy) = true;
    }

    /// Open the gate and wake all waiters
    pub fn signal_idle(&self) {
        *lock(&self.busy) = false;
        self.cv.notify_all();
    }

    /// Whether the gate is open
    pub fn is_idle(&self) -> bool {
        !*lock(&self.busy)
    }

    /// Wait for the gate to open, giving up early if `abort` holds
    pub fn wait(&self, timeout: Duration, abort: impl Fn() -> bool) -> WaitOutcome {
        let (_guard, outcome) = wait_until(&self.cv, lock(&self.busy), timeout, |busy| !*busy, |_| abort());
        outcome
    }

    /// Wake waiters so they re-check their abort condition
    pub fn poke(&self) {
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MockPowerControl;
    use std::thread;

    #[test]
    fn test_vote_taken_once() {
        let mut control = MockPowerControl::new();
        control.expect_acquire_vote().times(1).returning(|| Ok(()));
        control.expect_release_vote().times(1).return_const(());
        let vote = PowerVote::new(Arc::new(control));
        vote.acquire().unwrap();
        vote.acquire().unwrap();
        assert!(vote.is_held());
        vote.release();
        vote.release();
        assert!(!vote.is_held());
        assert_eq!(vote.acquisitions(), 1);
    }

    #[test]
    fn test_failed_acquire_not_held() {
        let mut control = MockPowerControl::new();
        control
            .expect_acquire_vote()
            .returning(|| Err(HwError::Fatal("rail off".into())));
        control.expect_release_vote().never();
        let vote = PowerVote::new(Arc::new(control));
        assert!(vote.acquire().is_err());
        vote.release();
        assert!(!vote.is_held());
    }

    #[test]
    fn test_idle_gate_wakes_waiter() {
        let gate = Arc::new(IdleGate::new());
        gate.set_busy();
        assert_eq!(gate.wait(Duration::from_millis(5), || false), WaitOutcome::TimedOut);
        let other = Arc::clone(&gate);
        let handle = thread::spawn(move || other.wait(Duration::from_secs(5), || false));
        thread::sleep(Duration::from_millis(10));
        gate.signal_idle();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Woken);
        assert!(gate.is_idle());
    }
}
