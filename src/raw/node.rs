// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::thread::{self, Thread};
use core::fmt;
use core::sync::atomic::{AtomicI8, AtomicPtr, Ordering};
use crossbeam_epoch::{Atomic, Guard};

/// The node's successor needs unparking when this node releases or cancels.
pub(crate) const SIGNAL: i8 = -1;
/// The node's waiter gave up (interrupt or timeout). Terminal.
pub(crate) const CANCELLED: i8 = 1;
/// The node sits on a condition queue.
pub(crate) const CONDITION: i8 = -2;
/// A shared-mode release reached the head while no signal was pending; the
/// next acquirer must keep propagating.
pub(crate) const PROPAGATE: i8 = -3;

/// One waiting caller in the wait queue.
///
/// `prev` links are authoritative: a node is published by first storing
/// `prev` and then installing itself as the tail, so walking backwards from
/// `tail` is always sound. `next` links are a best-effort optimization and
/// may lag; readers fall back to a backward scan whenever `next` is null or
/// points at a cancelled node.
///
/// A node's `next` pointing at the node itself marks it as detached from the
/// queue.
pub(crate) struct Node {
    status: AtomicI8,
    /// Creation-time mode marker; shared-mode waiters propagate wakeups.
    shared: bool,
    /// The parked waiter's record. Owns one strong reference; null on the
    /// dummy head and after dequeue or cancellation.
    thread: AtomicPtr<thread::Inner>,
    pub(crate) prev: Atomic<Node>,
    pub(crate) next: Atomic<Node>,
    /// Link in a condition queue. Only touched while the owning synchronizer
    /// is held exclusively.
    pub(crate) next_waiter: Atomic<Node>,
    /// Link in the queue's list of cancelled nodes awaiting reclamation.
    pub(crate) dead_next: Atomic<Node>,
}

// === impl Node ===

impl Node {
    /// The dummy node lazily installed as the first head.
    pub(crate) fn dummy() -> Self {
        Self::new(core::ptr::null_mut(), false, 0)
    }

    pub(crate) fn waiter(thread: Thread, shared: bool) -> Self {
        Self::new(thread.into_raw(), shared, 0)
    }

    pub(crate) fn condition_waiter(thread: Thread) -> Self {
        Self::new(thread.into_raw(), false, CONDITION)
    }

    fn new(thread: *mut thread::Inner, shared: bool, status: i8) -> Self {
        Self {
            status: AtomicI8::new(status),
            shared,
            thread: AtomicPtr::new(thread),
            prev: Atomic::null(),
            next: Atomic::null(),
            next_waiter: Atomic::null(),
            dead_next: Atomic::null(),
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> i8 {
        self.status.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_status(&self, status: i8) {
        self.status.store(status, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn cas_status(&self, current: i8, new: i8) -> bool {
        self.status
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        self.shared
    }

    #[inline]
    pub(crate) fn has_thread(&self) -> bool {
        !self.thread.load(Ordering::SeqCst).is_null()
    }

    /// Unpark the waiter recorded in this node, if any.
    ///
    /// Must be called while pinned: a concurrent dequeue clears the slot and
    /// defers dropping the record's strong reference past this pin, so a
    /// non-null load stays dereferenceable here.
    pub(crate) fn unpark(&self) {
        let ptr = self.thread.load(Ordering::SeqCst);
        if !ptr.is_null() {
            // Safety: see above; the record outlives the current pin
            unsafe { (*ptr).unpark() };
        }
    }

    /// Clones a handle to the waiter recorded in this node.
    ///
    /// Must be called while pinned, same as [`unpark`](Node::unpark).
    pub(crate) fn thread_handle(&self) -> Option<Thread> {
        let ptr = self.thread.load(Ordering::SeqCst);
        if ptr.is_null() {
            None
        } else {
            // Safety: the record outlives the current pin
            Some(unsafe { Thread::clone_raw(ptr) })
        }
    }

    /// Whether the waiter recorded in this node is `thread`.
    ///
    /// Must be called while pinned, same as [`unpark`](Node::unpark).
    pub(crate) fn is_waiter(&self, thread: &Thread) -> bool {
        let ptr = self.thread.load(Ordering::SeqCst);
        // Safety: the record outlives the current pin
        !ptr.is_null() && unsafe { (*ptr).id() } == thread.id().as_u64()
    }

    /// Null the thread slot, deferring the strong-reference drop past every
    /// active pin so concurrent readers stay safe.
    pub(crate) fn clear_thread(&self, guard: &Guard) {
        let ptr = self.thread.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if !ptr.is_null() {
            let addr = ptr as usize;
            guard.defer(move || {
                // Safety: the slot owned this strong reference, and it was
                // irrevocably taken out of the slot by the swap above
                drop(unsafe { Thread::from_raw(addr as *mut thread::Inner) });
            });
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let ptr = *self.thread.get_mut();
        if !ptr.is_null() {
            // Safety: the slot owns a strong reference until cleared
            drop(unsafe { Thread::from_raw(ptr) });
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("status", &self.status())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}
