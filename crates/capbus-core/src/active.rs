//! Activation counter gating peer operations.
//!
//! A single atomic word encodes the peer lifecycle: *new* (never activated),
//! *active* with an in-flight operation count, *draining* (deactivated with
//! operations still in flight), *drained*, and *released* (cleanup done).
//! Deactivation adds a large negative bias so `acquire` fails from that
//! point on while in-flight operations keep their balanced `release` calls.
//!
//! Cleanup runs exactly once; every other caller of [`ActiveCounter::cleanup`]
//! blocks until that one run has finished, which is what makes disconnect
//! idempotent and synchronous for all callers.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::waitq::WaitQueue;

/// Never activated.
const STATE_NEW: i64 = i64::MIN;
/// Cleanup has completed.
const STATE_RELEASED: i64 = i64::MIN + 1;
/// Cleanup is running on some thread.
const STATE_RELEASING: i64 = i64::MIN + 2;
/// Deactivated with zero operations in flight. Values above this (but below
/// zero) are "bias + in-flight count" while draining; values >= 0 are the
/// in-flight count while active.
const STATE_BIAS: i64 = i64::MIN + 3;

/// Atomic lifecycle counter.
#[derive(Debug)]
pub struct ActiveCounter {
    state: AtomicI64,
}

impl ActiveCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicI64::new(STATE_NEW),
        }
    }

    /// Whether the counter has never been activated.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_NEW
    }

    /// Whether the counter has been deactivated (draining, drained,
    /// releasing, or released).
    #[must_use]
    pub fn is_deactivated(&self) -> bool {
        let v = self.state.load(Ordering::Acquire);
        v < 0 && v != STATE_NEW
    }

    /// Transition new -> active. Returns false if the counter was already
    /// activated or deactivated.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(STATE_NEW, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire an in-flight reference. Fails once deactivated or while new.
    pub fn acquire(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v >= 0 { Some(v + 1) } else { None }
            })
            .is_ok()
    }

    /// Release an in-flight reference acquired with [`acquire`].
    ///
    /// Wakes `waitq` when the last in-flight operation of a draining counter
    /// finishes.
    ///
    /// [`acquire`]: Self::acquire
    pub fn release(&self, waitq: &WaitQueue) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            prev > 0 || (prev > STATE_BIAS && prev < 0),
            "active release without acquire"
        );
        if prev - 1 == STATE_BIAS {
            waitq.notify_all();
        }
    }

    /// Deactivate: no further `acquire` succeeds. Safe to call repeatedly
    /// and concurrently.
    pub fn deactivate(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v == STATE_NEW {
                    // Never activated; nothing can be in flight.
                    Some(STATE_BIAS)
                } else if v >= 0 {
                    Some(v + STATE_BIAS)
                } else {
                    None
                }
            });
    }

    /// Wait until every in-flight operation has released its reference.
    ///
    /// Must be called after [`deactivate`]; returns immediately if cleanup
    /// has already started or finished.
    ///
    /// [`deactivate`]: Self::deactivate
    pub fn drain(&self, waitq: &WaitQueue) {
        waitq.wait_until(|| self.state.load(Ordering::Acquire) <= STATE_BIAS);
    }

    /// Run `f` exactly once across all callers.
    ///
    /// Returns true for the caller that performed the cleanup. Every other
    /// caller blocks until that cleanup has finished, then returns false.
    /// Must be called after [`drain`].
    ///
    /// [`drain`]: Self::drain
    pub fn cleanup(&self, waitq: &WaitQueue, f: impl FnOnce()) -> bool {
        match self.state.compare_exchange(
            STATE_BIAS,
            STATE_RELEASING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                f();
                self.state.store(STATE_RELEASED, Ordering::Release);
                waitq.notify_all();
                true
            }
            Err(observed) => {
                debug_assert!(
                    observed == STATE_RELEASING || observed == STATE_RELEASED,
                    "cleanup before drain completed"
                );
                waitq.wait_until(|| self.state.load(Ordering::Acquire) == STATE_RELEASED);
                false
            }
        }
    }
}

impl Default for ActiveCounter {
    fn default() -> Self {
        Self::new()
    }
}
