// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The acquisition and release engine.
//!
//! Each flavor is the same loop: try the client predicate from the front of
//! the queue, and otherwise park behind a predecessor that has committed to
//! a wakeup. Newly arriving threads may barge past the queue by succeeding
//! the predicate before enqueueing; fair clients opt out by consulting
//! [`SyncQueue::has_queued_predecessors`] inside their predicate.

use super::Synchronizer;
use super::node::Node;
use super::queue::SyncQueue;
use crate::error::Interrupted;
use crate::thread;
use core::sync::atomic::Ordering;
use core::time::Duration;
use crossbeam_epoch::{self as epoch, Shared};
use crossbeam_utils::Backoff;
use std::time::Instant;

/// Below this remaining wait time a timed acquire spins instead of parking;
/// setting up the park and its timer costs more than the wait itself.
pub(crate) const SPIN_FOR_TIMEOUT_THRESHOLD: Duration = Duration::from_micros(1);

/// Removes the owned node from the queue unless the acquisition completed.
///
/// Covers early returns (interrupt, timeout) and panics escaping client
/// predicates alike; errors surface only after the queue is clean again.
struct CancelOnDrop<'a> {
    queue: &'a SyncQueue,
    node: *const Node,
    armed: bool,
}

impl<'a> CancelOnDrop<'a> {
    fn new(queue: &'a SyncQueue, node: *const Node) -> Self {
        Self {
            queue,
            node,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.cancel_acquire(self.node);
        }
    }
}

fn add_waiter<S: Synchronizer + ?Sized>(sync: &S, shared: bool) -> *const Node {
    let guard = &epoch::pin();
    sync.queue().add_waiter(shared, guard).as_raw()
}

// === exclusive mode ===

pub(crate) fn acquire<S: Synchronizer + ?Sized>(sync: &S, arg: i32) {
    if !sync.try_acquire(arg) {
        let node = add_waiter(sync, false);
        if acquire_queued(sync, node, arg) {
            // the wait observed an interrupt; put the flag back for the caller
            thread::current().interrupt();
        }
    }
}

/// Uninterruptible wait loop for a node already on the queue. Returns
/// whether an interrupt was observed while waiting.
///
/// Also the re-acquisition path for condition waiters, which re-enter with
/// their saved state as `arg`.
pub(crate) fn acquire_queued<S: Synchronizer + ?Sized>(
    sync: &S,
    node: *const Node,
    arg: i32,
) -> bool {
    let queue = sync.queue();
    let mut cleanup = CancelOnDrop::new(queue, node);
    let mut interrupted = false;
    loop {
        let guard = epoch::pin();
        let node_s = Shared::from(node);
        // Safety: the node is owned by this thread until dequeued
        let n = unsafe { node_s.deref() };
        let pred = n.prev.load(Ordering::SeqCst, &guard);
        if pred == queue.head_node(&guard) && sync.try_acquire(arg) {
            queue.set_head(node_s, &guard);
            queue.retire_old_head(pred, &guard);
            cleanup.disarm();
            return interrupted;
        }
        let park = queue.should_park(pred, node_s, &guard);
        // never hold a pin across a park; a sleeping thread must not hold
        // up reclamation
        drop(guard);
        if park {
            thread::park();
            interrupted |= thread::interrupted();
        }
    }
}

pub(crate) fn acquire_interruptibly<S: Synchronizer + ?Sized>(
    sync: &S,
    arg: i32,
) -> Result<(), Interrupted> {
    if thread::interrupted() {
        return Err(Interrupted(()));
    }
    if sync.try_acquire(arg) {
        return Ok(());
    }

    let node = add_waiter(sync, false);
    let queue = sync.queue();
    let mut cleanup = CancelOnDrop::new(queue, node);
    loop {
        let guard = epoch::pin();
        let node_s = Shared::from(node);
        // Safety: the node is owned by this thread until dequeued
        let n = unsafe { node_s.deref() };
        let pred = n.prev.load(Ordering::SeqCst, &guard);
        if pred == queue.head_node(&guard) && sync.try_acquire(arg) {
            queue.set_head(node_s, &guard);
            queue.retire_old_head(pred, &guard);
            cleanup.disarm();
            return Ok(());
        }
        let park = queue.should_park(pred, node_s, &guard);
        drop(guard);
        if park {
            thread::park();
            if thread::interrupted() {
                // `cleanup` removes the node on the way out
                return Err(Interrupted(()));
            }
        }
    }
}

pub(crate) fn try_acquire_for<S: Synchronizer + ?Sized>(
    sync: &S,
    arg: i32,
    timeout: Duration,
) -> Result<bool, Interrupted> {
    if thread::interrupted() {
        return Err(Interrupted(()));
    }
    if sync.try_acquire(arg) {
        return Ok(true);
    }

    let deadline = Instant::now() + timeout;
    let node = add_waiter(sync, false);
    let queue = sync.queue();
    let mut cleanup = CancelOnDrop::new(queue, node);
    let backoff = Backoff::new();
    loop {
        let guard = epoch::pin();
        let node_s = Shared::from(node);
        // Safety: the node is owned by this thread until dequeued
        let n = unsafe { node_s.deref() };
        let pred = n.prev.load(Ordering::SeqCst, &guard);
        if pred == queue.head_node(&guard) && sync.try_acquire(arg) {
            queue.set_head(node_s, &guard);
            queue.retire_old_head(pred, &guard);
            cleanup.disarm();
            return Ok(true);
        }
        let park = queue.should_park(pred, node_s, &guard);
        drop(guard);

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        if park {
            if deadline - now > SPIN_FOR_TIMEOUT_THRESHOLD {
                thread::park_until(deadline);
            } else {
                backoff.spin();
            }
        }
        if thread::interrupted() {
            return Err(Interrupted(()));
        }
    }
}

pub(crate) fn release<S: Synchronizer + ?Sized>(sync: &S, arg: i32) -> bool {
    if sync.try_release(arg) {
        let guard = &epoch::pin();
        let h = sync.queue().head_node(guard);
        // Safety: the head stays valid under this pin even if replaced
        if let Some(hr) = unsafe { h.as_ref() } {
            if hr.status() != 0 {
                sync.queue().unpark_successor(h, guard);
            }
        }
        true
    } else {
        false
    }
}

// === shared mode ===

pub(crate) fn acquire_shared<S: Synchronizer + ?Sized>(sync: &S, arg: i32) {
    if sync.try_acquire_shared(arg) < 0 && do_acquire_shared(sync, arg) {
        thread::current().interrupt();
    }
}

fn do_acquire_shared<S: Synchronizer + ?Sized>(sync: &S, arg: i32) -> bool {
    let node = add_waiter(sync, true);
    let queue = sync.queue();
    let mut cleanup = CancelOnDrop::new(queue, node);
    let mut interrupted = false;
    loop {
        let guard = epoch::pin();
        let node_s = Shared::from(node);
        // Safety: the node is owned by this thread until dequeued
        let n = unsafe { node_s.deref() };
        let pred = n.prev.load(Ordering::SeqCst, &guard);
        if pred == queue.head_node(&guard) {
            let r = sync.try_acquire_shared(arg);
            if r >= 0 {
                queue.set_head_and_propagate(node_s, r, &guard);
                queue.retire_old_head(pred, &guard);
                cleanup.disarm();
                return interrupted;
            }
        }
        let park = queue.should_park(pred, node_s, &guard);
        drop(guard);
        if park {
            thread::park();
            interrupted |= thread::interrupted();
        }
    }
}

pub(crate) fn acquire_shared_interruptibly<S: Synchronizer + ?Sized>(
    sync: &S,
    arg: i32,
) -> Result<(), Interrupted> {
    if thread::interrupted() {
        return Err(Interrupted(()));
    }
    if sync.try_acquire_shared(arg) >= 0 {
        return Ok(());
    }

    let node = add_waiter(sync, true);
    let queue = sync.queue();
    let mut cleanup = CancelOnDrop::new(queue, node);
    loop {
        let guard = epoch::pin();
        let node_s = Shared::from(node);
        // Safety: the node is owned by this thread until dequeued
        let n = unsafe { node_s.deref() };
        let pred = n.prev.load(Ordering::SeqCst, &guard);
        if pred == queue.head_node(&guard) {
            let r = sync.try_acquire_shared(arg);
            if r >= 0 {
                queue.set_head_and_propagate(node_s, r, &guard);
                queue.retire_old_head(pred, &guard);
                cleanup.disarm();
                return Ok(());
            }
        }
        let park = queue.should_park(pred, node_s, &guard);
        drop(guard);
        if park {
            thread::park();
            if thread::interrupted() {
                return Err(Interrupted(()));
            }
        }
    }
}

pub(crate) fn try_acquire_shared_for<S: Synchronizer + ?Sized>(
    sync: &S,
    arg: i32,
    timeout: Duration,
) -> Result<bool, Interrupted> {
    if thread::interrupted() {
        return Err(Interrupted(()));
    }
    if sync.try_acquire_shared(arg) >= 0 {
        return Ok(true);
    }

    let deadline = Instant::now() + timeout;
    let node = add_waiter(sync, true);
    let queue = sync.queue();
    let mut cleanup = CancelOnDrop::new(queue, node);
    let backoff = Backoff::new();
    loop {
        let guard = epoch::pin();
        let node_s = Shared::from(node);
        // Safety: the node is owned by this thread until dequeued
        let n = unsafe { node_s.deref() };
        let pred = n.prev.load(Ordering::SeqCst, &guard);
        if pred == queue.head_node(&guard) {
            let r = sync.try_acquire_shared(arg);
            if r >= 0 {
                queue.set_head_and_propagate(node_s, r, &guard);
                queue.retire_old_head(pred, &guard);
                cleanup.disarm();
                return Ok(true);
            }
        }
        let park = queue.should_park(pred, node_s, &guard);
        drop(guard);

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        if park {
            if deadline - now > SPIN_FOR_TIMEOUT_THRESHOLD {
                thread::park_until(deadline);
            } else {
                backoff.spin();
            }
        }
        if thread::interrupted() {
            return Err(Interrupted(()));
        }
    }
}

pub(crate) fn release_shared<S: Synchronizer + ?Sized>(sync: &S, arg: i32) -> bool {
    if sync.try_release_shared(arg) {
        let guard = &epoch::pin();
        sync.queue().do_release_shared(guard);
        true
    } else {
        false
    }
}
