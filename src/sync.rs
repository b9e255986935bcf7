//! Lock helpers and typed wait results

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Outcome of a bounded sleep on a wait condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition became true
    Woken,
    /// The deadline passed first
    TimedOut,
    /// The object being waited on was invalidated or detached
    Invalidated,
}

/// Lock a mutex, recovering the guard if a holder panicked.
///
/// Scheduler state stays consistent across a panicking client callback, so
/// poisoning is not treated as fatal.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sleep on `cv` until `ready` holds, `invalid` holds, or `timeout` elapses.
pub(crate) fn wait_until<'a, T>(
    cv: &Condvar,
    mut guard: MutexGuard<'a, T>,
    timeout: Duration,
    mut ready: impl FnMut(&T) -> bool,
    mut invalid: impl FnMut(&T) -> bool,
) -> (MutexGuard<'a, T>, WaitOutcome) {
    let deadline = Instant::now() + timeout;
    loop {
        if invalid(&guard) {
            return (guard, WaitOutcome::Invalidated);
        }
        if ready(&guard) {
            return (guard, WaitOutcome::Woken);
        }
        let now = Instant::now();
        if now >= deadline {
            return (guard, WaitOutcome::TimedOut);
        }
        guard = cv
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let m = Mutex::new(0u32);
        let cv = Condvar::new();
        let (_g, outcome) = wait_until(&cv, lock(&m), Duration::from_millis(5), |v| *v > 0, |_| false);
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_wait_woken_by_other_thread() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let other = Arc::clone(&pair);
        let handle = thread::spawn(move || {
            *lock(&other.0) = true;
            other.1.notify_all();
        });
        let (_g, outcome) = wait_until(
            &pair.1,
            lock(&pair.0),
            Duration::from_secs(5),
            |v| *v,
            |_| false,
        );
        handle.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
    }

    #[test]
    fn test_invalid_wins_over_ready() {
        let m = Mutex::new(1u32);
        let cv = Condvar::new();
        let (_g, outcome) = wait_until(&cv, lock(&m), Duration::from_secs(1), |_| true, |_| true);
        assert_eq!(outcome, WaitOutcome::Invalidated);
    }
}
