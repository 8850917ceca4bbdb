// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The synchronizer framework.
//!
//! A concrete synchronizer embeds a [`SyncQueue`] (a 32-bit state word plus
//! the wait queue) and implements [`Synchronizer`], overriding the subset of
//! `try_*` predicates that match its mode. The trait's provided methods are
//! the acquisition engine: blocking, interruptible, and timed acquires in
//! exclusive and shared mode, the matching releases, and condition-variable
//! support.
//!
//! The predicates must not block. They may read and CAS the state word and
//! may consult [`SyncQueue::has_queued_predecessors`] to implement fairness.

pub(crate) mod acquire;
mod condition;
mod node;
mod queue;

pub use condition::Condition;
pub use queue::SyncQueue;

use crate::error::Interrupted;
use core::time::Duration;
use std::time::Instant;

/// Client hooks plus the acquisition engine built on top of them.
///
/// Only the `try_*` predicates and [`is_held_exclusively`] are meant to be
/// implemented; their defaults panic so that a synchronizer only pays for
/// the modes it actually supports. The remaining methods are the engine and
/// should not be overridden.
///
/// [`is_held_exclusively`]: Synchronizer::is_held_exclusively
pub trait Synchronizer {
    /// The embedded state word and wait queue.
    fn queue(&self) -> &SyncQueue;

    /// Attempt to acquire in exclusive mode. Must be atomic and must not
    /// block.
    ///
    /// # Panics
    ///
    /// The default panics: the synchronizer does not support exclusive mode.
    fn try_acquire(&self, arg: i32) -> bool {
        let _ = arg;
        panic!("exclusive mode is not supported by this synchronizer");
    }

    /// Attempt to release in exclusive mode; true iff the synchronizer is
    /// now fully released so that waiters may attempt to acquire.
    ///
    /// # Panics
    ///
    /// The default panics: the synchronizer does not support exclusive mode.
    fn try_release(&self, arg: i32) -> bool {
        let _ = arg;
        panic!("exclusive mode is not supported by this synchronizer");
    }

    /// Attempt to acquire in shared mode. Negative means failure; zero means
    /// success without surplus; positive means success and subsequent shared
    /// acquires may also succeed.
    ///
    /// # Panics
    ///
    /// The default panics: the synchronizer does not support shared mode.
    fn try_acquire_shared(&self, arg: i32) -> i32 {
        let _ = arg;
        panic!("shared mode is not supported by this synchronizer");
    }

    /// Attempt to release in shared mode; true iff a waiting acquire (shared
    /// or exclusive) may now succeed.
    ///
    /// # Panics
    ///
    /// The default panics: the synchronizer does not support shared mode.
    fn try_release_shared(&self, arg: i32) -> bool {
        let _ = arg;
        panic!("shared mode is not supported by this synchronizer");
    }

    /// Whether the calling thread holds this synchronizer exclusively.
    /// Required only when conditions are used.
    ///
    /// # Panics
    ///
    /// The default panics: the synchronizer does not track exclusive
    /// ownership.
    fn is_held_exclusively(&self) -> bool {
        panic!("exclusive ownership is not tracked by this synchronizer");
    }

    // --- the acquisition engine ---

    /// Acquire in exclusive mode, parking until successful.
    ///
    /// Ignores interrupts but re-asserts the flag on exit if one was
    /// observed.
    fn acquire(&self, arg: i32) {
        acquire::acquire(self, arg);
    }

    /// Acquire in exclusive mode, parking until successful or interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the interrupt flag was set on entry or
    /// became set while waiting; the caller's node is removed from the queue
    /// first.
    fn acquire_interruptibly(&self, arg: i32) -> Result<(), Interrupted> {
        acquire::acquire_interruptibly(self, arg)
    }

    /// Acquire in exclusive mode with a time limit. Returns whether the
    /// acquisition succeeded before `timeout` elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if interrupted before acquiring.
    fn try_acquire_for(&self, arg: i32, timeout: Duration) -> Result<bool, Interrupted> {
        acquire::try_acquire_for(self, arg, timeout)
    }

    /// Release in exclusive mode. When [`try_release`] reports the
    /// synchronizer fully released, the head's successor is unparked.
    ///
    /// [`try_release`]: Synchronizer::try_release
    fn release(&self, arg: i32) -> bool {
        acquire::release(self, arg)
    }

    /// Acquire in shared mode, parking until successful; a success that
    /// leaves surplus wakes further shared waiters in turn.
    ///
    /// Ignores interrupts but re-asserts the flag on exit if one was
    /// observed.
    fn acquire_shared(&self, arg: i32) {
        acquire::acquire_shared(self, arg);
    }

    /// Acquire in shared mode, parking until successful or interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the interrupt flag was set on entry or
    /// became set while waiting.
    fn acquire_shared_interruptibly(&self, arg: i32) -> Result<(), Interrupted> {
        acquire::acquire_shared_interruptibly(self, arg)
    }

    /// Acquire in shared mode with a time limit. Returns whether the
    /// acquisition succeeded before `timeout` elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if interrupted before acquiring.
    fn try_acquire_shared_for(&self, arg: i32, timeout: Duration) -> Result<bool, Interrupted> {
        acquire::try_acquire_shared_for(self, arg, timeout)
    }

    /// Release in shared mode, propagating wakeups when [`try_release_shared`]
    /// reports that waiters may proceed.
    ///
    /// [`try_release_shared`]: Synchronizer::try_release_shared
    fn release_shared(&self, arg: i32) -> bool {
        acquire::release_shared(self, arg)
    }

    /// A new condition whose waiters synchronize on this synchronizer.
    ///
    /// All condition operations require the synchronizer to be held
    /// exclusively by the calling thread.
    fn new_condition(&self) -> Condition<'_, Self>
    where
        Self: Sized,
    {
        Condition::new(self)
    }
}

/// Time left until `deadline`, zero once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
