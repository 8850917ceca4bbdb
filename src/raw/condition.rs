// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::acquire::{self, SPIN_FOR_TIMEOUT_THRESHOLD};
use super::node::{CANCELLED, CONDITION, Node};
use super::{Synchronizer, remaining};
use crate::error::Interrupted;
use crate::thread::{self, Thread};
use core::fmt;
use core::sync::atomic::Ordering;
use core::time::Duration;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::time::Instant;

/// A condition variable bound to one synchronizer.
///
/// Waiters atomically give up every hold on the synchronizer, park on a
/// private queue, and re-acquire their saved holds once signalled. Every
/// operation requires the synchronizer to be held exclusively by the calling
/// thread; the queue therefore sees no concurrent mutation and needs no
/// splicing protocol of its own.
///
/// Signalling moves the longest-waiting node over to the synchronizer's main
/// wait queue, where it competes for acquisition like any other waiter.
pub struct Condition<'a, S: Synchronizer> {
    sync: &'a S,
    /// Head and tail of the private singly-linked wait queue, linked through
    /// `next_waiter`. Guarded by the exclusive-hold requirement; the cells
    /// are atomic so a misbehaving client corrupts bookkeeping, not memory.
    first_waiter: Atomic<Node>,
    last_waiter: Atomic<Node>,
}

/// What an interrupt observed during a wait means for the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum InterruptAction {
    /// No interrupt observed.
    None,
    /// The interrupt beat any signal; surface the error.
    Abort,
    /// A signal was already in flight; re-assert the flag instead.
    Reassert,
}

// === impl Condition ===

impl<'a, S: Synchronizer> Condition<'a, S> {
    pub(crate) fn new(sync: &'a S) -> Self {
        Self {
            sync,
            first_waiter: Atomic::null(),
            last_waiter: Atomic::null(),
        }
    }

    fn queue(&self) -> &super::SyncQueue {
        self.sync.queue()
    }

    fn assert_held(&self) {
        assert!(
            self.sync.is_held_exclusively(),
            "condition used without holding its synchronizer exclusively"
        );
    }

    /// Block until signalled or interrupted, releasing every hold on the
    /// synchronizer for the duration and restoring them before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] when the interrupt flag was set on entry, or
    /// when an interrupt arrived before any signal. An interrupt that loses
    /// the race against a signal re-asserts the flag instead.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    pub fn wait(&self) -> Result<(), Interrupted> {
        if thread::interrupted() {
            return Err(Interrupted(()));
        }
        let node = self.add_waiter();
        let saved = self.fully_release(node);
        let mut action = InterruptAction::None;
        loop {
            let guard = epoch::pin();
            let transferred = self.queue().is_on_sync_queue(Shared::from(node), &guard);
            drop(guard);
            if transferred {
                break;
            }
            thread::park();
            action = self.check_interrupt_while_waiting(node);
            if action != InterruptAction::None {
                break;
            }
        }
        if acquire::acquire_queued(self.sync, node, saved) && action != InterruptAction::Abort {
            action = InterruptAction::Reassert;
        }
        self.cleanup_after_wait(node, action != InterruptAction::None);
        match action {
            InterruptAction::Abort => Err(Interrupted(())),
            InterruptAction::Reassert => {
                thread::current().interrupt();
                Ok(())
            }
            InterruptAction::None => Ok(()),
        }
    }

    /// Block until signalled, releasing every hold on the synchronizer for
    /// the duration. Interrupts are remembered and re-asserted on exit.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    pub fn wait_uninterruptibly(&self) {
        let node = self.add_waiter();
        let saved = self.fully_release(node);
        let mut interrupted = false;
        loop {
            let guard = epoch::pin();
            let transferred = self.queue().is_on_sync_queue(Shared::from(node), &guard);
            drop(guard);
            if transferred {
                break;
            }
            thread::park();
            if thread::interrupted() {
                interrupted = true;
            }
        }
        if acquire::acquire_queued(self.sync, node, saved) || interrupted {
            thread::current().interrupt();
        }
    }

    /// Timed flavor of [`wait`](Condition::wait). Returns the time remaining
    /// out of `timeout`; zero means the wait timed out before any signal.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] under the same rules as
    /// [`wait`](Condition::wait).
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    pub fn wait_for(&self, timeout: Duration) -> Result<Duration, Interrupted> {
        if thread::interrupted() {
            return Err(Interrupted(()));
        }
        let deadline = Instant::now() + timeout;
        let node = self.add_waiter();
        let saved = self.fully_release(node);
        let mut action = InterruptAction::None;
        let mut cancelled = false;
        loop {
            let guard = epoch::pin();
            let transferred = self.queue().is_on_sync_queue(Shared::from(node), &guard);
            if transferred {
                drop(guard);
                break;
            }
            if Instant::now() >= deadline {
                // same protocol as the interrupt path: whoever wins the
                // status CAS moves the node to the main queue
                self.queue()
                    .transfer_after_cancelled_wait(Shared::from(node), &guard);
                cancelled = true;
                drop(guard);
                break;
            }
            drop(guard);
            if remaining(deadline) >= SPIN_FOR_TIMEOUT_THRESHOLD {
                thread::park_until(deadline);
            }
            action = self.check_interrupt_while_waiting(node);
            if action != InterruptAction::None {
                cancelled = true;
                break;
            }
        }
        if acquire::acquire_queued(self.sync, node, saved) && action != InterruptAction::Abort {
            action = InterruptAction::Reassert;
        }
        self.cleanup_after_wait(node, cancelled);
        match action {
            InterruptAction::Abort => Err(Interrupted(())),
            InterruptAction::Reassert => {
                thread::current().interrupt();
                Ok(remaining(deadline))
            }
            InterruptAction::None => Ok(remaining(deadline)),
        }
    }

    /// Deadline flavor of [`wait_for`](Condition::wait_for). Returns whether
    /// a signal arrived before `deadline` passed.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] under the same rules as
    /// [`wait`](Condition::wait).
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    pub fn wait_until(&self, deadline: Instant) -> Result<bool, Interrupted> {
        if thread::interrupted() {
            return Err(Interrupted(()));
        }
        let node = self.add_waiter();
        let saved = self.fully_release(node);
        let mut action = InterruptAction::None;
        let mut timed_out = false;
        let mut cancelled = false;
        loop {
            let guard = epoch::pin();
            let transferred = self.queue().is_on_sync_queue(Shared::from(node), &guard);
            if transferred {
                drop(guard);
                break;
            }
            if Instant::now() >= deadline {
                timed_out = self
                    .queue()
                    .transfer_after_cancelled_wait(Shared::from(node), &guard);
                cancelled = true;
                drop(guard);
                break;
            }
            drop(guard);
            thread::park_until(deadline);
            action = self.check_interrupt_while_waiting(node);
            if action != InterruptAction::None {
                cancelled = true;
                break;
            }
        }
        if acquire::acquire_queued(self.sync, node, saved) && action != InterruptAction::Abort {
            action = InterruptAction::Reassert;
        }
        self.cleanup_after_wait(node, cancelled);
        match action {
            InterruptAction::Abort => Err(Interrupted(())),
            InterruptAction::Reassert => {
                thread::current().interrupt();
                Ok(!timed_out)
            }
            InterruptAction::None => Ok(!timed_out),
        }
    }

    /// Move the longest-waiting waiter, if any, over to the main wait queue.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    pub fn signal(&self) {
        self.assert_held();
        let guard = &epoch::pin();
        let first = self.first_waiter.load(Ordering::SeqCst, guard);
        if !first.is_null() {
            self.do_signal(first, guard);
        }
    }

    /// Move every waiter over to the main wait queue.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    pub fn signal_all(&self) {
        self.assert_held();
        let guard = &epoch::pin();
        let mut first = self.first_waiter.load(Ordering::SeqCst, guard);
        self.first_waiter.store(Shared::null(), Ordering::SeqCst);
        self.last_waiter.store(Shared::null(), Ordering::SeqCst);
        while !first.is_null() {
            // Safety: condition-queue nodes stay alive while linked here
            let f = unsafe { first.deref() };
            let next = f.next_waiter.load(Ordering::SeqCst, guard);
            f.next_waiter.store(Shared::null(), Ordering::SeqCst);
            self.queue().transfer_for_signal(first, guard);
            first = next;
        }
    }

    fn do_signal<'g>(&self, mut first: Shared<'g, Node>, guard: &'g Guard) {
        loop {
            // Safety: condition-queue nodes stay alive while linked here
            let f = unsafe { first.deref() };
            let next = f.next_waiter.load(Ordering::SeqCst, guard);
            self.first_waiter.store(next, Ordering::SeqCst);
            if next.is_null() {
                self.last_waiter.store(Shared::null(), Ordering::SeqCst);
            }
            f.next_waiter.store(Shared::null(), Ordering::SeqCst);
            if self.queue().transfer_for_signal(first, guard) {
                break;
            }
            // that waiter cancelled concurrently; try the next one
            first = self.first_waiter.load(Ordering::SeqCst, guard);
            if first.is_null() {
                break;
            }
        }
    }

    /// Whether any thread is waiting on this condition.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.assert_held();
        let guard = &epoch::pin();
        let mut w = self.first_waiter.load(Ordering::SeqCst, guard);
        while !w.is_null() {
            // Safety: condition-queue nodes stay alive while linked here
            let wr = unsafe { w.deref() };
            if wr.status() == CONDITION {
                return true;
            }
            w = wr.next_waiter.load(Ordering::SeqCst, guard);
        }
        false
    }

    /// An estimate of the number of threads waiting on this condition.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    #[must_use]
    pub fn wait_queue_length(&self) -> usize {
        self.assert_held();
        let guard = &epoch::pin();
        let mut n = 0;
        let mut w = self.first_waiter.load(Ordering::SeqCst, guard);
        while !w.is_null() {
            // Safety: condition-queue nodes stay alive while linked here
            let wr = unsafe { w.deref() };
            if wr.status() == CONDITION {
                n += 1;
            }
            w = wr.next_waiter.load(Ordering::SeqCst, guard);
        }
        n
    }

    /// Snapshot of the threads waiting on this condition.
    ///
    /// # Panics
    ///
    /// Panics if the synchronizer is not held exclusively by the calling
    /// thread.
    #[must_use]
    pub fn waiting_threads(&self) -> Vec<Thread> {
        self.assert_held();
        let guard = &epoch::pin();
        let mut threads = Vec::new();
        let mut w = self.first_waiter.load(Ordering::SeqCst, guard);
        while !w.is_null() {
            // Safety: condition-queue nodes stay alive while linked here
            let wr = unsafe { w.deref() };
            if wr.status() == CONDITION {
                if let Some(thread) = wr.thread_handle() {
                    threads.push(thread);
                }
            }
            w = wr.next_waiter.load(Ordering::SeqCst, guard);
        }
        threads
    }

    // --- internals ---

    /// Append a fresh waiter node for the calling thread, pruning cancelled
    /// entries off the tail first.
    fn add_waiter(&self) -> *const Node {
        self.assert_held();
        let guard = &epoch::pin();
        let mut tail = self.last_waiter.load(Ordering::SeqCst, guard);
        // Safety: condition-queue nodes stay alive while linked here
        if let Some(t) = unsafe { tail.as_ref() } {
            if t.status() != CONDITION {
                self.unlink_cancelled_waiters(guard);
                tail = self.last_waiter.load(Ordering::SeqCst, guard);
            }
        }

        let node = Owned::new(Node::condition_waiter(thread::current())).into_shared(guard);
        // Safety: as above
        match unsafe { tail.as_ref() } {
            None => self.first_waiter.store(node, Ordering::SeqCst),
            Some(t) => t.next_waiter.store(node, Ordering::SeqCst),
        }
        self.last_waiter.store(node, Ordering::SeqCst);
        tracing::trace!("appended condition waiter");
        node.as_raw()
    }

    /// Release the synchronizer completely, whatever the current reentrancy
    /// depth, and return the released amount for re-acquisition.
    ///
    /// On failure the node is marked cancelled so later traffic prunes it.
    fn fully_release(&self, node: *const Node) -> i32 {
        struct CancelNode(*const Node);
        impl Drop for CancelNode {
            fn drop(&mut self) {
                // Safety: the node was just allocated by the caller and is
                // still alive; marking it cancelled is idempotent
                unsafe { &*self.0 }.set_status(CANCELLED);
            }
        }

        let failed = CancelNode(node);
        let saved = self.queue().state();
        if acquire::release(self.sync, saved) {
            core::mem::forget(failed);
            saved
        } else {
            drop(failed);
            panic!("condition wait on a synchronizer not held by the current thread");
        }
    }

    fn check_interrupt_while_waiting(&self, node: *const Node) -> InterruptAction {
        if thread::interrupted() {
            let guard = &epoch::pin();
            if self
                .queue()
                .transfer_after_cancelled_wait(Shared::from(node), guard)
            {
                InterruptAction::Abort
            } else {
                InterruptAction::Reassert
            }
        } else {
            InterruptAction::None
        }
    }

    /// Post-reacquisition cleanup: a waiter that cancelled its wait is still
    /// linked here and must be pruned before it can be retired through the
    /// main queue; interior nodes are pruned opportunistically.
    fn cleanup_after_wait(&self, node: *const Node, cancelled: bool) {
        let guard = &epoch::pin();
        // Safety: the node is still alive; it is on the main queue by now
        let lingering = !unsafe { &*node }
            .next_waiter
            .load(Ordering::SeqCst, guard)
            .is_null();
        if lingering || cancelled {
            self.unlink_cancelled_waiters(guard);
        }
    }

    /// Sweep every node that is no longer waiting out of the queue.
    ///
    /// A node that died before ever reaching the main queue (a failed
    /// [`fully_release`](Condition::fully_release)) is unreachable once
    /// unlinked and is retired here; transferred nodes are owned by the main
    /// queue and only unlinked.
    fn unlink_cancelled_waiters(&self, guard: &Guard) {
        let mut t = self.first_waiter.load(Ordering::SeqCst, guard);
        let mut trail: Shared<'_, Node> = Shared::null();
        while !t.is_null() {
            // Safety: condition-queue nodes stay alive while linked here
            let tr = unsafe { t.deref() };
            let next = tr.next_waiter.load(Ordering::SeqCst, guard);
            if tr.status() == CONDITION {
                trail = t;
            } else {
                tr.next_waiter.store(Shared::null(), Ordering::SeqCst);
                // Safety: `trail` is a node we kept linked this sweep
                match unsafe { trail.as_ref() } {
                    None => self.first_waiter.store(next, Ordering::SeqCst),
                    Some(tl) => tl.next_waiter.store(next, Ordering::SeqCst),
                }
                if next.is_null() {
                    self.last_waiter.store(trail, Ordering::SeqCst);
                }
                if tr.prev.load(Ordering::SeqCst, guard).is_null() {
                    // Safety: never reached the main queue, and now unlinked
                    // from the only structure that referenced it
                    unsafe { guard.defer_destroy(t) };
                }
            }
            t = next;
        }
    }
}

impl<S: Synchronizer> fmt::Debug for Condition<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition").finish_non_exhaustive()
    }
}

impl<S: Synchronizer> Drop for Condition<'_, S> {
    fn drop(&mut self) {
        // Safety: `&mut self` rules out concurrent waiters; any node still
        // linked either died before reaching the main queue (freed here) or
        // is owned by the main queue (skipped)
        let guard = unsafe { epoch::unprotected() };
        let mut t = self.first_waiter.load(Ordering::Relaxed, guard);
        while !t.is_null() {
            // Safety: see above
            let tr = unsafe { t.deref() };
            let next = tr.next_waiter.load(Ordering::Relaxed, guard);
            if tr.status() == CANCELLED && tr.prev.load(Ordering::Relaxed, guard).is_null() {
                // Safety: sole owner of a node that never reached the main
                // queue
                drop(unsafe { t.into_owned() });
            }
            t = next;
        }
    }
}
