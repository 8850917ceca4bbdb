// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::loom_const_fn;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

const EMPTY: usize = 0;
const PARKED: usize = 1;
const NOTIFIED: usize = 2;

/// A counting-permit blocking primitive with at most one stored permit.
///
/// [`park`] blocks until a permit is available, the passed flag is raised, or
/// a spurious wakeup occurs; callers re-check their condition in a loop.
/// [`unpark`] stores a permit and wakes the parked owner; two unparks are
/// indistinguishable from one.
///
/// [`park`]: Parker::park
/// [`unpark`]: Parker::unpark
#[derive(Debug)]
pub(crate) struct Parker {
    state: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
}

// === impl Parker ===

impl Parker {
    loom_const_fn! {
        pub(crate) const fn new() -> Self {
            Self {
                state: AtomicUsize::new(EMPTY),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }
        }
    }

    /// Block the calling thread (which must own this parker) until a permit
    /// is consumed, `cancel` is raised, or a spurious wakeup occurs.
    ///
    /// Does not consume a permit when returning because of `cancel`.
    pub(crate) fn park(&self, cancel: &AtomicBool) {
        if self
            .state
            .compare_exchange(NOTIFIED, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
        if cancel.load(Ordering::SeqCst) {
            return;
        }

        let guard = self.lock();
        if self
            .state
            .compare_exchange(EMPTY, PARKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // a permit arrived while taking the lock, consume it
            let prev = self.state.swap(EMPTY, Ordering::SeqCst);
            debug_assert_eq!(prev, NOTIFIED);
            return;
        }
        // re-check under the lock: a waker raises the flag before taking the
        // lock, so past this point any wake-up reaches the condvar wait
        if cancel.load(Ordering::SeqCst) {
            self.state.store(EMPTY, Ordering::SeqCst);
            return;
        }

        // a single wait; spurious wakeups are part of the contract and the
        // caller's acquire loop re-checks
        let guard = self
            .cvar
            .wait(guard)
            .expect("parker mutex poisoned");
        drop(guard);
        let _ = self.state.swap(EMPTY, Ordering::SeqCst);
    }

    /// Timed flavor of [`park`](Parker::park); returns no later than
    /// `deadline` (modulo scheduling).
    pub(crate) fn park_until(&self, deadline: Instant, cancel: &AtomicBool) {
        if self
            .state
            .compare_exchange(NOTIFIED, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let Some(timeout) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };

        let guard = self.lock();
        if self
            .state
            .compare_exchange(EMPTY, PARKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let prev = self.state.swap(EMPTY, Ordering::SeqCst);
            debug_assert_eq!(prev, NOTIFIED);
            return;
        }
        if cancel.load(Ordering::SeqCst) {
            self.state.store(EMPTY, Ordering::SeqCst);
            return;
        }

        // loom does not model timed waits, so fall back to an untimed one
        #[cfg(loom)]
        {
            let _ = timeout;
            let guard = self.cvar.wait(guard).expect("parker mutex poisoned");
            drop(guard);
        }
        #[cfg(not(loom))]
        {
            let (guard, _timed_out) = self
                .cvar
                .wait_timeout(guard, timeout)
                .expect("parker mutex poisoned");
            drop(guard);
        }
        let _ = self.state.swap(EMPTY, Ordering::SeqCst);
    }

    /// Make a permit available, waking the owner if it is parked.
    ///
    /// Idempotent: at most one permit is stored.
    pub(crate) fn unpark(&self) {
        if self.state.swap(NOTIFIED, Ordering::SeqCst) == PARKED {
            // taking the lock serializes with the owner between publishing
            // PARKED and entering the wait, so the notification cannot be lost
            drop(self.lock());
            self.cvar.notify_one();
        }
    }

    /// Wake the owner if it is parked *without* storing a permit.
    ///
    /// Used for interrupt delivery; the caller raises its flag first.
    pub(crate) fn wake(&self) {
        let guard = self.lock();
        drop(guard);
        self.cvar.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("parker mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_stores_a_permit() {
        crate::loom::model(|| {
            let parker = Parker::new();
            let cancel = AtomicBool::new(false);
            parker.unpark();
            // must return immediately, consuming the stored permit
            parker.park(&cancel);
        });
    }

    #[test]
    fn unpark_wakes_parked_thread() {
        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref PARKER: Parker = Parker::new();
                static ref STOP: AtomicBool = AtomicBool::new(false);
            }

            let a = thread::spawn(|| {
                while !STOP.load(Ordering::SeqCst) {
                    PARKER.park(&STOP);
                }
            });
            let b = thread::spawn(|| {
                STOP.store(true, Ordering::SeqCst);
                PARKER.unpark();
            });

            a.join().unwrap();
            b.join().unwrap();
        });
    }

    #[test]
    fn permits_saturate_at_one() {
        let parker = Parker::new();
        let cancel = AtomicBool::new(false);
        // two unparks store a single permit...
        parker.unpark();
        parker.unpark();
        assert_eq!(parker.state.load(Ordering::SeqCst), NOTIFIED);
        // ...which one park consumes, leaving nothing behind that could
        // wake a later park without a new cause
        parker.park(&cancel);
        assert_eq!(parker.state.load(Ordering::SeqCst), EMPTY);
    }

    #[test]
    fn raised_flag_short_circuits_park() {
        crate::loom::model(|| {
            let parker = Parker::new();
            let cancel = AtomicBool::new(true);
            // must not block, and must not consume a permit stored later
            parker.park(&cancel);
            parker.unpark();
            cancel.store(false, Ordering::SeqCst);
            parker.park(&cancel);
        });
    }

    // loom does not model timed waits
    #[cfg(not(loom))]
    #[test]
    fn park_until_respects_the_deadline() {
        let parker = Parker::new();
        let cancel = AtomicBool::new(false);
        let start = Instant::now();
        let deadline = start + Duration::from_millis(50);
        // spurious wakeups may end any single park early
        while Instant::now() < deadline {
            parker.park_until(deadline, &cancel);
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
