// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::node::{CANCELLED, CONDITION, Node, PROPAGATE, SIGNAL};
use crate::loom::loom_const_fn;
use crate::thread::{self, Thread};
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

/// The synchronization state word plus the wait queue of blocked callers.
///
/// The queue is a lock-free doubly-linked list: `tail` advances by CAS on
/// enqueue, `head` is replaced only by a thread that has just been granted
/// acquisition, and `prev` links are authoritative while `next` links are
/// repaired lazily. `head`, when non-null, is a dummy whose waiter has
/// already been dequeued; it is never cancelled.
///
/// Reclamation is epoch-based. A dequeued head is retired once it is
/// unreachable from `head` and `tail`; cancelled nodes stay on an internal
/// list until the queue is dropped, because lazily-repaired `next` links may
/// keep pointing at them for an unbounded time.
pub struct SyncQueue {
    state: CachePadded<AtomicI32>,
    head: CachePadded<Atomic<Node>>,
    tail: CachePadded<Atomic<Node>>,
    /// Cancelled nodes, linked through `dead_next`, reclaimed on drop.
    dead: Atomic<Node>,
}

// === impl SyncQueue ===

impl SyncQueue {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self::with_state(0)
        }
    }

    loom_const_fn! {
        /// A queue whose state word starts at `state` instead of zero.
        pub const fn with_state(state: i32) -> Self {
            Self {
                state: CachePadded::new(AtomicI32::new(state)),
                head: CachePadded::new(Atomic::null()),
                tail: CachePadded::new(Atomic::null()),
                dead: Atomic::null(),
            }
        }
    }

    /// Current value of the synchronization state word.
    #[inline]
    pub fn state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    /// Plain write of the state word.
    ///
    /// Only sound as an unsynchronized update when the caller holds the
    /// synchronizer exclusively; otherwise use
    /// [`compare_and_set_state`](Self::compare_and_set_state).
    #[inline]
    pub fn set_state(&self, state: i32) {
        self.state.store(state, Ordering::SeqCst);
    }

    /// Atomically set the state word to `new` if it currently is `current`.
    #[inline]
    pub fn compare_and_set_state(&self, current: i32, new: i32) -> bool {
        self.state
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Current head pointer, for the acquisition engine's front-of-queue
    /// check.
    pub(crate) fn head_node<'g>(&self, guard: &'g Guard) -> Shared<'g, Node> {
        self.head.load(Ordering::SeqCst, guard)
    }

    // --- enqueue ---

    /// Allocate a node for the calling thread and splice it onto the tail.
    pub(crate) fn add_waiter<'g>(&self, shared: bool, guard: &'g Guard) -> Shared<'g, Node> {
        let node = Owned::new(Node::waiter(thread::current(), shared)).into_shared(guard);
        // fast path: one CAS against a populated tail
        let t = self.tail.load(Ordering::SeqCst, guard);
        if !t.is_null() {
            // `prev` is published before the node becomes reachable through
            // `tail`, so backward walks never see a gap
            // Safety: `node` was just allocated and is pinned by `guard`
            unsafe { node.deref() }.prev.store(t, Ordering::Release);
            if self
                .tail
                .compare_exchange(t, node, Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_ok()
            {
                // Safety: `t` was reached through `tail` under this pin
                unsafe { t.deref() }.next.store(node, Ordering::Release);
                return node;
            }
        }
        self.enq(node, guard);
        node
    }

    /// Splice `node` onto the tail, initializing the queue if necessary.
    /// Returns the node's predecessor.
    pub(crate) fn enq<'g>(&self, node: Shared<'g, Node>, guard: &'g Guard) -> Shared<'g, Node> {
        let backoff = Backoff::new();
        loop {
            let t = self.tail.load(Ordering::SeqCst, guard);
            if t.is_null() {
                // lazily install the dummy head; `tail` follows with a plain
                // store, losers re-read it through the CAS below
                let dummy = Owned::new(Node::dummy()).into_shared(guard);
                match self.head.compare_exchange(
                    Shared::null(),
                    dummy,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => self.tail.store(dummy, Ordering::Release),
                    // Safety: the dummy lost the race and was never published
                    Err(_) => drop(unsafe { dummy.into_owned() }),
                }
            } else {
                // Safety: `node` is owned by the caller and pinned
                unsafe { node.deref() }.prev.store(t, Ordering::Release);
                if self
                    .tail
                    .compare_exchange(t, node, Ordering::SeqCst, Ordering::SeqCst, guard)
                    .is_ok()
                {
                    // Safety: `t` was reached through `tail` under this pin
                    unsafe { t.deref() }.next.store(node, Ordering::Release);
                    return t;
                }
            }
            backoff.spin();
        }
    }

    // --- dequeue ---

    /// Install `node` as the new head, shedding its waiter bookkeeping.
    ///
    /// Only called by the thread that just won acquisition through `node`,
    /// which is why the trailing writes can be plain.
    pub(crate) fn set_head(&self, node: Shared<'_, Node>, guard: &Guard) {
        self.head.store(node, Ordering::SeqCst);
        // Safety: `node` is the caller's own node, pinned by `guard`
        let n = unsafe { node.deref() };
        n.clear_thread(guard);
        n.prev.store(Shared::null(), Ordering::Relaxed);
    }

    /// Retire the head that `node` just replaced.
    ///
    /// The old head is unreachable at this point: the new head's `prev` is
    /// null and every cancelled node that ever pointed at the old head has
    /// already been spliced out of the backward chain by the new head's own
    /// park-gate walks.
    pub(crate) fn retire_old_head(&self, old: Shared<'_, Node>, guard: &Guard) {
        // Safety: `old` was reached through `head` under this pin
        unsafe { old.deref() }.next.store(Shared::null(), Ordering::Relaxed);
        // Safety: unreachable from `head`/`tail`, see above
        unsafe { guard.defer_destroy(old) };
    }

    /// Wake the first live waiter behind `node` (typically the head).
    ///
    /// `next` may lag behind a tail CAS, so when it is null or cancelled the
    /// real successor is found by scanning backwards from `tail`.
    pub(crate) fn unpark_successor(&self, node: Shared<'_, Node>, guard: &Guard) {
        // Safety: reachable node under the current pin
        let n = unsafe { node.deref() };
        let status = n.status();
        if status < 0 {
            // best-effort; a failed CAS means someone else is signalling
            let _ = n.cas_status(status, 0);
        }

        let mut successor = n.next.load(Ordering::SeqCst, guard);
        // Safety: `next` targets are queue or dead-list nodes, both live
        let stale = match unsafe { successor.as_ref() } {
            Some(s) => s.status() > 0,
            None => true,
        };
        if stale {
            successor = Shared::null();
            let mut t = self.tail.load(Ordering::SeqCst, guard);
            while !t.is_null() && t != node {
                // Safety: the backward chain under a live waiter is never
                // retired until that waiter relinks past it
                let tr = unsafe { t.deref() };
                if tr.status() <= 0 {
                    successor = t;
                }
                t = tr.prev.load(Ordering::SeqCst, guard);
            }
        }
        // Safety: either freshly scanned or checked above
        if let Some(s) = unsafe { successor.as_ref() } {
            s.unpark();
        }
    }

    /// The park-gate predicate: decide whether a waiter whose acquisition
    /// attempt just failed may safely park.
    ///
    /// Parking is only safe behind a predecessor that has committed to
    /// waking us. A cancelled predecessor is spliced out and the caller
    /// retries; an uncommitted one is asked to commit first, then the caller
    /// retries in case it raced with a release.
    pub(crate) fn should_park(
        &self,
        pred: Shared<'_, Node>,
        node: Shared<'_, Node>,
        guard: &Guard,
    ) -> bool {
        // Safety: `pred` is the caller's predecessor, reachable under this pin
        let mut p = unsafe { pred.deref() };
        let status = p.status();
        if status == SIGNAL {
            return true;
        }
        if status > 0 {
            // splice past the cancelled run; stops before null because the
            // head is never cancelled
            let mut pred = pred;
            loop {
                pred = p.prev.load(Ordering::SeqCst, guard);
                // Safety: see the backward-chain liveness note in
                // `unpark_successor`
                p = unsafe { pred.deref() };
                // Safety: `node` is the caller's own node
                unsafe { node.deref() }.prev.store(pred, Ordering::Release);
                if p.status() <= 0 {
                    break;
                }
            }
            p.next.store(node, Ordering::Release);
        } else {
            // 0 or PROPAGATE: ask the predecessor to commit to a wakeup
            let _ = p.cas_status(status, SIGNAL);
        }
        false
    }

    // --- shared-mode propagation ---

    /// Install `node` as head after a successful shared acquisition and keep
    /// the wakeup cascading when warranted.
    ///
    /// The rule is deliberately conservative: a release that observed the
    /// old head before it committed to signalling would otherwise be lost
    /// when that head is replaced. `PROPAGATE` exists solely to carry that
    /// "a release happened here" fact across the head change.
    pub(crate) fn set_head_and_propagate(
        &self,
        node: Shared<'_, Node>,
        propagate: i32,
        guard: &Guard,
    ) {
        let old = self.head.load(Ordering::SeqCst, guard);
        self.set_head(node, guard);

        // Safety: `old` may already be retired but stays valid under this pin
        let must_propagate = propagate > 0
            || unsafe { old.as_ref() }.is_none_or(|h| h.status() < 0)
            || {
                let h = self.head.load(Ordering::SeqCst, guard);
                // Safety: as above
                unsafe { h.as_ref() }.is_none_or(|h| h.status() < 0)
            };
        if must_propagate {
            // Safety: `node` is the caller's own node
            let s = unsafe { node.deref() }.next.load(Ordering::SeqCst, guard);
            // an unknown successor might be shared; err on the side of waking
            // Safety: `next` targets stay valid under the pin
            let next_shared = unsafe { s.as_ref() }.is_none_or(Node::is_shared);
            if next_shared {
                self.do_release_shared(guard);
            }
        }
    }

    /// Shared-mode release action: signal the head's successor and record a
    /// pending propagation when no signal was requested yet.
    ///
    /// Loops as long as the head keeps changing underneath, helping each new
    /// head propagate in turn.
    pub(crate) fn do_release_shared(&self, guard: &Guard) {
        loop {
            let h = self.head.load(Ordering::SeqCst, guard);
            if !h.is_null() && h != self.tail.load(Ordering::SeqCst, guard) {
                // Safety: valid under this pin even if concurrently retired
                let hr = unsafe { h.deref() };
                let status = hr.status();
                if status == SIGNAL {
                    if !hr.cas_status(SIGNAL, 0) {
                        // lost to another releaser, re-examine
                        continue;
                    }
                    self.unpark_successor(h, guard);
                } else if status == 0 && !hr.cas_status(0, PROPAGATE) {
                    continue;
                }
            }
            if h == self.head.load(Ordering::SeqCst, guard) {
                break;
            }
        }
    }

    // --- cancellation ---

    /// Remove the calling thread's `node` from the queue after an abandoned
    /// wait (interrupt, timeout, or a panicking client hook).
    pub(crate) fn cancel_acquire(&self, node: *const Node) {
        let guard = &epoch::pin();
        let node = Shared::from(node);
        // Safety: the caller owns `node`, which has not been retired
        let n = unsafe { node.deref() };
        tracing::trace!(node = ?n, "cancelling acquire");

        n.clear_thread(guard);

        // skip over cancelled predecessors; stops before null because the
        // head is never cancelled
        let mut pred = n.prev.load(Ordering::SeqCst, guard);
        // Safety: backward-chain liveness, see `unpark_successor`
        let mut p = unsafe { pred.deref() };
        while p.status() > 0 {
            pred = p.prev.load(Ordering::SeqCst, guard);
            // Safety: as above
            p = unsafe { pred.deref() };
            n.prev.store(pred, Ordering::Release);
        }

        // the expected value for the splicing CASes below; if it is stale the
        // CAS fails and some other repair already happened
        let pred_next = p.next.load(Ordering::SeqCst, guard);

        n.set_status(CANCELLED);
        // ownership of the allocation moves to the dead list; lazily-linked
        // `next` edges may reference this node until the queue drops
        self.push_dead(node, guard);

        if node == self.tail.load(Ordering::SeqCst, guard)
            && self
                .tail
                .compare_exchange(node, pred, Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_ok()
        {
            let _ = p.next.compare_exchange(
                pred_next,
                Shared::null(),
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            );
        } else {
            // splice the node out if its predecessor is an interior node
            // committed to signalling; otherwise the successor must be woken
            // so it can find its new predecessor itself
            let head = self.head.load(Ordering::SeqCst, guard);
            let ps = p.status();
            if pred != head
                && (ps == SIGNAL || (ps <= 0 && p.cas_status(ps, SIGNAL)))
                && p.has_thread()
            {
                let next = n.next.load(Ordering::SeqCst, guard);
                // Safety: `next` targets stay valid under the pin
                if let Some(nx) = unsafe { next.as_ref() } {
                    if nx.status() <= 0 {
                        let _ = p.next.compare_exchange(
                            pred_next,
                            next,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            guard,
                        );
                    }
                }
            } else {
                self.unpark_successor(node, guard);
            }
            // self-link: marks the node as detached while `prev` stays
            // readable for stragglers
            n.next.store(node, Ordering::SeqCst);
        }
    }

    fn push_dead(&self, node: Shared<'_, Node>, guard: &Guard) {
        // Safety: `node` is the caller's own node
        let n = unsafe { node.deref() };
        let mut head = self.dead.load(Ordering::Relaxed, guard);
        loop {
            n.dead_next.store(head, Ordering::Relaxed);
            match self
                .dead
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, guard)
            {
                Ok(_) => break,
                Err(e) => head = e.current,
            }
        }
    }

    // --- condition-queue transfer ---

    /// True once `node` has made it from a condition queue onto this queue.
    pub(crate) fn is_on_sync_queue(&self, node: Shared<'_, Node>, guard: &Guard) -> bool {
        // Safety: the caller owns or holds `node`
        let n = unsafe { node.deref() };
        if n.status() == CONDITION || n.prev.load(Ordering::SeqCst, guard).is_null() {
            return false;
        }
        // `next` is only ever written by main-queue linkage
        if !n.next.load(Ordering::SeqCst, guard).is_null() {
            return true;
        }
        // `prev` may be set while the enqueueing CAS has not landed yet; the
        // node will be near the tail, so scan backwards for it
        self.find_node_from_tail(node, guard)
    }

    fn find_node_from_tail(&self, node: Shared<'_, Node>, guard: &Guard) -> bool {
        let mut t = self.tail.load(Ordering::SeqCst, guard);
        loop {
            if t == node {
                return true;
            }
            if t.is_null() {
                return false;
            }
            // Safety: backward-chain liveness, see `unpark_successor`
            t = unsafe { t.deref() }.prev.load(Ordering::SeqCst, guard);
        }
    }

    /// Move a signalled condition waiter onto this queue.
    ///
    /// Fails if the waiter already cancelled its wait; the signaller then
    /// tries the next one.
    pub(crate) fn transfer_for_signal(&self, node: Shared<'_, Node>, guard: &Guard) -> bool {
        // Safety: condition-queue nodes are kept alive by the condition
        let n = unsafe { node.deref() };
        if !n.cas_status(CONDITION, 0) {
            return false;
        }
        tracing::trace!(node = ?n, "transferring signalled waiter");

        let pred = self.enq(node, guard);
        // Safety: predecessors stay valid under the pin
        let p = unsafe { pred.deref() };
        let status = p.status();
        if status > 0 || !p.cas_status(status, SIGNAL) {
            // the predecessor cannot promise a wakeup; let the waiter
            // resynchronize on its own
            n.unpark();
        }
        true
    }

    /// Move the calling thread's condition waiter onto this queue after its
    /// wait was cut short by an interrupt or timeout.
    ///
    /// Returns false when a signal got there first; in that case the
    /// signaller is mid-transfer, which completes in bounded time, so spin
    /// until the node shows up.
    pub(crate) fn transfer_after_cancelled_wait(
        &self,
        node: Shared<'_, Node>,
        guard: &Guard,
    ) -> bool {
        // Safety: the caller owns `node`
        let n = unsafe { node.deref() };
        if n.cas_status(CONDITION, 0) {
            self.enq(node, guard);
            return true;
        }
        while !self.is_on_sync_queue(node, guard) {
            crate::loom::thread::yield_now();
        }
        false
    }

    // --- inspection ---

    /// Whether any thread is queued waiting to acquire. Best-effort.
    #[must_use]
    pub fn has_queued_threads(&self) -> bool {
        let guard = &epoch::pin();
        self.head.load(Ordering::Acquire, guard) != self.tail.load(Ordering::Acquire, guard)
    }

    /// Whether any thread has ever contended on this synchronizer.
    #[must_use]
    pub fn has_contended(&self) -> bool {
        let guard = &epoch::pin();
        !self.head.load(Ordering::Acquire, guard).is_null()
    }

    /// The longest-queued thread, if any. Best-effort snapshot.
    #[must_use]
    pub fn first_queued_thread(&self) -> Option<Thread> {
        let guard = &epoch::pin();
        let h = self.head.load(Ordering::Acquire, guard);
        let t = self.tail.load(Ordering::Acquire, guard);
        if h == t {
            return None;
        }

        // fast path: the head's validated successor
        // Safety: all nodes reached here stay valid under the pin
        if let Some(hr) = unsafe { h.as_ref() } {
            let s = hr.next.load(Ordering::Acquire, guard);
            // Safety: as above
            if let Some(sr) = unsafe { s.as_ref() } {
                if sr.prev.load(Ordering::Acquire, guard) == h {
                    if let Some(thread) = sr.thread_handle() {
                        return Some(thread);
                    }
                }
            }
        }

        // `next` was torn by a concurrent enqueue or cancellation; the first
        // waiter is the last one seen walking backwards from the tail
        let mut first = None;
        let mut t = self.tail.load(Ordering::Acquire, guard);
        while !t.is_null() && t != h {
            // Safety: backward-chain liveness, see `unpark_successor`
            let tr = unsafe { t.deref() };
            if let Some(thread) = tr.thread_handle() {
                first = Some(thread);
            }
            t = tr.prev.load(Ordering::Acquire, guard);
        }
        first
    }

    /// Whether `thread` is currently queued. Best-effort linear scan.
    #[must_use]
    pub fn is_queued(&self, thread: &Thread) -> bool {
        let guard = &epoch::pin();
        let mut t = self.tail.load(Ordering::Acquire, guard);
        while !t.is_null() {
            // Safety: backward-chain liveness, see `unpark_successor`
            let tr = unsafe { t.deref() };
            if tr.is_waiter(thread) {
                return true;
            }
            t = tr.prev.load(Ordering::Acquire, guard);
        }
        false
    }

    /// An estimate of the number of queued threads.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.count_queued(|_| true)
    }

    /// Best-effort snapshot of all queued threads, in no particular order.
    #[must_use]
    pub fn queued_threads(&self) -> Vec<Thread> {
        self.collect_queued(|_| true)
    }

    /// Best-effort snapshot of the threads queued in exclusive mode.
    #[must_use]
    pub fn exclusive_queued_threads(&self) -> Vec<Thread> {
        self.collect_queued(|node| !node.is_shared())
    }

    /// Best-effort snapshot of the threads queued in shared mode.
    #[must_use]
    pub fn shared_queued_threads(&self) -> Vec<Thread> {
        self.collect_queued(Node::is_shared)
    }

    fn count_queued(&self, f: impl Fn(&Node) -> bool) -> usize {
        let guard = &epoch::pin();
        let mut n = 0;
        let mut t = self.tail.load(Ordering::Acquire, guard);
        while !t.is_null() {
            // Safety: backward-chain liveness, see `unpark_successor`
            let tr = unsafe { t.deref() };
            if tr.has_thread() && f(tr) {
                n += 1;
            }
            t = tr.prev.load(Ordering::Acquire, guard);
        }
        n
    }

    fn collect_queued(&self, f: impl Fn(&Node) -> bool) -> Vec<Thread> {
        let guard = &epoch::pin();
        let mut threads = Vec::new();
        let mut t = self.tail.load(Ordering::Acquire, guard);
        while !t.is_null() {
            // Safety: backward-chain liveness, see `unpark_successor`
            let tr = unsafe { t.deref() };
            if f(tr) {
                if let Some(thread) = tr.thread_handle() {
                    threads.push(thread);
                }
            }
            t = tr.prev.load(Ordering::Acquire, guard);
        }
        threads
    }

    /// Whether any thread has been waiting longer than the caller.
    ///
    /// This is the gate fair clients consult before a barging CAS. Reading
    /// `tail` before `head` matters: it guarantees that an initialized queue
    /// is seen with a consistent head.
    #[must_use]
    pub fn has_queued_predecessors(&self) -> bool {
        let guard = &epoch::pin();
        let t = self.tail.load(Ordering::SeqCst, guard);
        let h = self.head.load(Ordering::SeqCst, guard);
        if h == t {
            return false;
        }
        // `tail` is non-null here, and `head` is installed before `tail`
        // Safety: valid under this pin
        let hr = unsafe { h.deref() };
        let s = hr.next.load(Ordering::SeqCst, guard);
        // Safety: `next` targets stay valid under the pin
        match unsafe { s.as_ref() } {
            None => true,
            Some(sr) => !sr.is_waiter(&thread::current()),
        }
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("state", &self.state())
            .field("has_queued_threads", &self.has_queued_threads())
            .finish_non_exhaustive()
    }
}

impl Drop for SyncQueue {
    fn drop(&mut self) {
        // Safety: `&mut self` means no other thread touches the queue and no
        // guard can still reach any of its nodes
        let guard = unsafe { epoch::unprotected() };
        // the backward chain from tail covers every node still linked;
        // cancelled nodes are owned by the dead list instead and are only
        // traversed here
        let mut t = self.tail.load(Ordering::Relaxed, guard);
        while !t.is_null() {
            // Safety: nodes in the chain have not been retired
            let tr = unsafe { t.deref() };
            let prev = tr.prev.load(Ordering::Relaxed, guard);
            if tr.status() != CANCELLED {
                // Safety: sole owner, see above
                drop(unsafe { t.into_owned() });
            }
            t = prev;
        }
        let mut d = self.dead.load(Ordering::Relaxed, guard);
        while !d.is_null() {
            // Safety: dead-list nodes are never freed before this point
            let dr = unsafe { d.deref() };
            let next = dr.dead_next.load(Ordering::Relaxed, guard);
            // Safety: sole owner, see above
            drop(unsafe { d.into_owned() });
            d = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread as loom_thread;
    use crate::raw::Synchronizer;
    use core::time::Duration;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    /// Walks the backward chain from `tail`, asserting the structural rules
    /// that hold at every observation point: `prev` links reach a head-role
    /// node in finitely many steps without crossing a null, the node playing
    /// the head is never cancelled, and no condition waiter is ever linked
    /// into the chain.
    fn probe_backward_chain(q: &SyncQueue) {
        let guard = &epoch::pin();
        let h = q.head.load(Ordering::SeqCst, guard);
        // Safety: the head stays valid under this pin
        if let Some(hr) = unsafe { h.as_ref() } {
            assert_ne!(hr.status(), CANCELLED, "the head must never be cancelled");
        }

        let mut t = q.tail.load(Ordering::SeqCst, guard);
        let mut steps = 0_usize;
        while !t.is_null() {
            // Safety: chain nodes (dead-list ones included) are live under
            // this pin
            let tr = unsafe { t.deref() };
            assert_ne!(
                tr.status(),
                CONDITION,
                "condition waiters must never appear in the chain"
            );
            let prev = tr.prev.load(Ordering::SeqCst, guard);
            if prev.is_null() {
                // the terminal node plays the head role
                assert_ne!(tr.status(), CANCELLED, "the chain must end at a live head");
            }
            t = prev;
            steps += 1;
            assert!(steps <= 10_000, "the backward chain failed to terminate");
        }
    }

    #[test]
    fn state_word_roundtrip() {
        let q = SyncQueue::new();
        assert_eq!(q.state(), 0);
        assert!(q.compare_and_set_state(0, 7));
        assert!(!q.compare_and_set_state(0, 9));
        assert_eq!(q.state(), 7);
        q.set_state(0);
        assert_eq!(q.state(), 0);
    }

    #[test]
    fn fresh_queue_is_empty() {
        let q = SyncQueue::new();
        assert!(!q.has_contended());
        assert!(!q.has_queued_threads());
        assert_eq!(q.queue_length(), 0);
        assert!(q.first_queued_thread().is_none());
        assert!(!q.has_queued_predecessors());
    }

    #[test]
    fn enqueue_installs_a_dummy_head() {
        let q = SyncQueue::new();
        let guard = &epoch::pin();
        let node = q.add_waiter(false, guard);
        assert!(q.has_contended());
        assert!(q.has_queued_threads());
        assert_eq!(q.queue_length(), 1);
        assert!(q.is_queued(&crate::thread::current()));
        // the dummy head itself carries no thread
        assert_eq!(q.queued_threads().len(), 1);
        assert_eq!(q.first_queued_thread().unwrap(), crate::thread::current());
        assert_eq!(q.exclusive_queued_threads().len(), 1);
        assert!(q.shared_queued_threads().is_empty());
        // the head's successor is the current thread itself
        assert!(!q.has_queued_predecessors());
        let _ = node;
    }

    #[test]
    fn shared_waiters_are_tracked_separately() {
        let q = SyncQueue::new();
        let guard = &epoch::pin();
        let _a = q.add_waiter(true, guard);
        let _b = q.add_waiter(false, guard);
        assert_eq!(q.queue_length(), 2);
        assert_eq!(q.shared_queued_threads().len(), 1);
        assert_eq!(q.exclusive_queued_threads().len(), 1);
    }

    #[test]
    fn cancelled_tail_is_unlinked() {
        let q = SyncQueue::new();
        let guard = &epoch::pin();
        let a = q.add_waiter(false, guard);
        let b = q.add_waiter(false, guard);
        q.cancel_acquire(b.as_raw());
        // Safety: cancelled nodes live on the dead list until the queue drops
        assert_eq!(unsafe { b.deref() }.status(), CANCELLED);
        assert_eq!(q.queue_length(), 1);
        // a second cancellation empties the queue entirely
        q.cancel_acquire(a.as_raw());
        assert_eq!(q.queue_length(), 0);
    }

    #[test]
    fn cancellation_is_terminal() {
        let q = SyncQueue::new();
        let guard = &epoch::pin();
        let a = q.add_waiter(false, guard);
        let b = q.add_waiter(false, guard);
        let c = q.add_waiter(false, guard);
        // Safety: cancelled nodes live on the dead list until the queue drops
        let (ar, br) = unsafe { (a.deref(), b.deref()) };

        // an interior cancellation clears the thread and sticks
        q.cancel_acquire(b.as_raw());
        assert_eq!(br.status(), CANCELLED);
        assert!(!br.has_thread());
        probe_backward_chain(&q);

        // traffic over and around the dead node must not revive it
        q.unpark_successor(q.head_node(guard), guard);
        q.cancel_acquire(a.as_raw());
        q.cancel_acquire(c.as_raw());
        assert_eq!(br.status(), CANCELLED);
        assert!(!br.has_thread());
        assert_eq!(ar.status(), CANCELLED);
        assert!(!ar.has_thread());
        probe_backward_chain(&q);
        assert_eq!(q.queue_length(), 0);
    }

    #[test]
    fn condition_waiters_stay_isolated_until_transferred() {
        let q = SyncQueue::new();
        let guard = &epoch::pin();
        let node = Owned::new(Node::condition_waiter(thread::current())).into_shared(guard);
        // Safety: the node is owned by this test until transferred
        let nr = unsafe { node.deref() };
        assert_eq!(nr.status(), CONDITION);
        assert!(!q.is_on_sync_queue(node, guard));

        // main-queue traffic never carries a condition-status node
        let _w = q.add_waiter(false, guard);
        probe_backward_chain(&q);
        assert!(!q.is_on_sync_queue(node, guard));

        // a signal transfer strips the condition status before linking
        assert!(q.transfer_for_signal(node, guard));
        assert_ne!(nr.status(), CONDITION);
        assert!(q.is_on_sync_queue(node, guard));
        probe_backward_chain(&q);

        // and the node can never be signalled as a condition waiter again
        assert!(!q.transfer_for_signal(node, guard));
    }

    #[test]
    fn wakeups_have_causes() {
        // permits saturate at one: two unparks collapse into a single
        // wakeup, and once it is consumed a timed park with no permit and
        // no interrupt waits out its whole deadline
        let me = thread::current();
        me.unpark();
        me.unpark();
        thread::park();

        let start = Instant::now();
        let deadline = start + Duration::from_millis(30);
        // spurious wakeups may end any single park early
        while Instant::now() < deadline {
            thread::park_until(deadline);
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!me.is_interrupted());
    }

    #[test]
    fn invariants_hold_under_contention_and_cancellation() {
        struct Flag {
            queue: SyncQueue,
        }

        impl Synchronizer for Flag {
            fn queue(&self) -> &SyncQueue {
                &self.queue
            }

            fn try_acquire(&self, _arg: i32) -> bool {
                self.queue.compare_and_set_state(0, 1)
            }

            fn try_release(&self, _arg: i32) -> bool {
                self.queue.set_state(0);
                true
            }
        }

        let flag = Arc::new(Flag {
            queue: SyncQueue::new(),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::new();
        for _ in 0..2 {
            let flag = Arc::clone(&flag);
            let stop = Arc::clone(&stop);
            threads.push(loom_thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    flag.acquire(1);
                    flag.release(1);
                }
            }));
        }
        for _ in 0..2 {
            let flag = Arc::clone(&flag);
            let stop = Arc::clone(&stop);
            threads.push(loom_thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    // short timed attempts keep the cancellation path busy
                    if flag.try_acquire_for(1, Duration::from_micros(50)).unwrap() {
                        flag.release(1);
                    }
                }
            }));
        }

        // observe the structural rules while the queue churns
        for _ in 0..1_000 {
            probe_backward_chain(&flag.queue);
        }
        stop.store(true, Ordering::SeqCst);
        for t in threads {
            t.join().unwrap();
        }
        probe_backward_chain(&flag.queue);
    }
}
