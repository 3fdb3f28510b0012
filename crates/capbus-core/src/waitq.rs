//! Reader wakeup object shared between a peer and its queue.
//!
//! One mutex + condvar pair per peer. The queue signals it on the
//! not-readable to readable edge; the activation counter signals it when the
//! in-flight count drains; and the peer lifecycle borrows the mutex as the
//! critical section for connect/disconnect publication, so the peer needs no
//! second lock.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true.
    Ready,
    /// The deadline expired first.
    TimedOut,
}

/// Wait queue with an edge-triggered broadcast.
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Enter the critical section backing this wait queue.
    ///
    /// Used by the peer lifecycle to make publish-and-activate appear atomic
    /// to concurrent disconnectors.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Wake all waiters. Waiters must re-check their predicate; spurious
    /// wakeups are expected.
    ///
    /// Takes the mutex before signalling: this orders the wake against a
    /// waiter's predicate check, so the waiter either observes the state
    /// written before this call or is already parked and receives the
    /// signal. A notify issued between a false predicate check and the
    /// park would otherwise be lost.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `pred` returns true.
    ///
    /// The predicate is evaluated under the wait queue lock, so any state it
    /// reads must be publishable without holding other locks (atomics, or
    /// values snapshotted before the call).
    pub fn wait_until(&self, mut pred: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !pred() {
            self.cond.wait(&mut guard);
        }
    }

    /// Block until `pred` returns true or `timeout` elapses.
    pub fn wait_until_timeout(
        &self,
        mut pred: impl FnMut() -> bool,
        timeout: Duration,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while !pred() {
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() && !pred() {
                return WaitOutcome::TimedOut;
            }
        }
        WaitOutcome::Ready
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn wait_sees_flag_set_by_other_thread() {
        let waitq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let w = Arc::clone(&waitq);
        let f = Arc::clone(&flag);
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            f.store(true, Ordering::Release);
            w.notify_all();
        });

        waitq.wait_until(|| flag.load(Ordering::Acquire));
        setter.join().unwrap();
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn bounded_wait_times_out() {
        let waitq = WaitQueue::new();
        let outcome = waitq.wait_until_timeout(|| false, Duration::from_millis(20));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn bounded_wait_ready_immediately() {
        let waitq = WaitQueue::new();
        let outcome = waitq.wait_until_timeout(|| true, Duration::from_millis(20));
        assert_eq!(outcome, WaitOutcome::Ready);
    }
}
