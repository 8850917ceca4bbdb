// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A one-shot count-down latch built on the synchronizer framework.
//!
//! The state word holds the remaining count. Waiters acquire in shared mode,
//! which succeeds only at zero, so a single count reaching zero releases the
//! whole chain of waiters through the propagation protocol.

use crate::error::Interrupted;
use crate::loom::loom_const_fn;
use crate::raw::{SyncQueue, Synchronizer};
use core::fmt;
use core::time::Duration;

/// The latch's synchronizer: remaining count in the state word.
struct RawLatch {
    queue: SyncQueue,
}

/// A synchronization aid that lets threads wait until a set of operations
/// completes.
///
/// The latch starts with a count; [`count_down`] decrements it, and
/// [`wait`] blocks until it reaches zero. The count cannot be reset, and
/// extra count-downs at zero are no-ops.
///
/// [`count_down`]: Latch::count_down
/// [`wait`]: Latch::wait
pub struct Latch {
    raw: RawLatch,
}

// === impl RawLatch ===

impl Synchronizer for RawLatch {
    fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    fn try_acquire_shared(&self, _arg: i32) -> i32 {
        if self.queue.state() == 0 { 1 } else { -1 }
    }

    fn try_release_shared(&self, _arg: i32) -> bool {
        // decrement the count; only the transition to zero releases waiters
        loop {
            let c = self.queue.state();
            if c == 0 {
                return false;
            }
            let next = c - 1;
            if self.queue.compare_and_set_state(c, next) {
                return next == 0;
            }
        }
    }
}

// === impl Latch ===

impl Latch {
    loom_const_fn! {
        /// Creates a latch that opens after `count` calls to
        /// [`count_down`](Latch::count_down).
        ///
        /// # Panics
        ///
        /// Panics if `count` is negative.
        pub const fn new(count: i32) -> Self {
            assert!(count >= 0, "latch count must not be negative");
            Self {
                raw: RawLatch {
                    queue: SyncQueue::with_state(count),
                },
            }
        }
    }

    /// Blocks the calling thread until the count reaches zero.
    ///
    /// Returns immediately if it already has. Interrupts are remembered and
    /// re-asserted on exit.
    pub fn wait(&self) {
        self.raw.acquire_shared(1);
    }

    /// Blocks until the count reaches zero or the calling thread is
    /// interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the interrupt flag was set on entry or
    /// became set while waiting.
    pub fn wait_interruptibly(&self) -> Result<(), Interrupted> {
        self.raw.acquire_shared_interruptibly(1)
    }

    /// Blocks until the count reaches zero, for at most `timeout`. Returns
    /// whether the latch opened in time.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if interrupted before the latch opened.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.raw.try_acquire_shared_for(1, timeout)
    }

    /// Decrements the count, releasing every waiter when it reaches zero.
    ///
    /// Counting down an open latch has no effect.
    pub fn count_down(&self) {
        self.raw.release_shared(1);
    }

    /// The current count.
    #[must_use]
    pub fn count(&self) -> i32 {
        self.raw.queue.state()
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn zero_count_is_open() {
        let latch = Latch::new(0);
        latch.wait();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn count_down_to_zero_releases_waiters() {
        const WAITERS: usize = 4;

        let latch = Arc::new(Latch::new(2));
        let released = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..WAITERS {
            let latch = Arc::clone(&latch);
            let released = Arc::clone(&released);
            threads.push(thread::spawn(move || {
                latch.wait();
                released.fetch_add(1, Ordering::SeqCst);
            }));
        }

        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        assert_eq!(latch.count(), 0);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), WAITERS);
    }

    #[test]
    fn extra_count_downs_are_noops() {
        let latch = Latch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        latch.wait();
    }

    #[test]
    fn wait_timeout_expires_while_closed() {
        let latch = Latch::new(1);
        let start = Instant::now();
        let opened = latch.wait_timeout(Duration::from_millis(30)).unwrap();
        assert!(!opened);
        assert!(start.elapsed() >= Duration::from_millis(30));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::ZERO).unwrap());
    }

    #[test]
    fn interrupted_wait_aborts() {
        let latch = Arc::new(Latch::new(1));
        let latch2 = Arc::clone(&latch);
        let waiter = thread::spawn(move || {
            crate::thread::current().interrupt();
            latch2.wait_interruptibly()
        });
        assert!(waiter.join().unwrap().is_err());
        assert_eq!(latch.count(), 1);
    }
}
