// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread handles for the synchronizer framework.
//!
//! The framework parks and unparks *threads*, uses a thread as the identity
//! token for fair gating and exclusive ownership, and needs interrupt-aware
//! parking: an interrupt wakes a parked thread without consuming a permit.
//! `std` threads carry no interrupt flag, so the crate keeps its own
//! per-thread record. A [`Thread`] is a cheap clonable handle to that record;
//! [`current`] returns the calling thread's handle, lazily registering it.

mod parker;

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use core::fmt;
use core::num::NonZeroU64;
use core::sync::atomic::AtomicU64;
use parker::Parker;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::time::Instant;

/// A handle to a thread registered with this crate.
///
/// Handles compare equal iff they refer to the same thread registration and
/// stay valid after the thread exits (operations on a dead thread's handle
/// are no-ops).
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

assert_impl_all!(Thread: Send, Sync);

/// A unique identifier for a registered thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub(crate) fn as_u64(self) -> NonZeroU64 {
        self.0
    }
}

pub(crate) struct Inner {
    id: NonZeroU64,
    interrupted: AtomicBool,
    parker: Parker,
}

std::thread_local! {
    static CURRENT: Thread = Thread::register();
}

/// Returns a handle to the calling thread.
pub fn current() -> Thread {
    CURRENT.with(Clone::clone)
}

/// Block the calling thread until a permit is consumed, it is interrupted,
/// or a spurious wakeup occurs.
///
/// The interrupt flag is left untouched; callers poll it after every return.
pub fn park() {
    CURRENT.with(|t| {
        tracing::trace!("parking current thread ({:?})...", t);
        t.inner.parker.park(&t.inner.interrupted);
    });
}

/// Timed flavor of [`park`]: additionally returns once `deadline` has passed.
pub fn park_until(deadline: Instant) {
    CURRENT.with(|t| {
        tracing::trace!("parking current thread ({:?}) with a deadline...", t);
        t.inner.parker.park_until(deadline, &t.inner.interrupted);
    });
}

/// Polls *and clears* the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|t| t.inner.interrupted.swap(false, Ordering::SeqCst))
}

// === impl Thread ===

impl Thread {
    fn register() -> Self {
        // identity counter only, never used for synchronization
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NonZeroU64::new(NEXT_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed))
            .expect("thread id counter wrapped");
        Self {
            inner: Arc::new(Inner {
                id,
                interrupted: AtomicBool::new(false),
                parker: Parker::new(),
            }),
        }
    }

    /// The thread's unique id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        ThreadId(self.inner.id)
    }

    /// Make a permit available to this thread, waking it if it is parked.
    ///
    /// Idempotent: at most one permit is stored.
    pub fn unpark(&self) {
        tracing::trace!("unparking thread {:?}...", self);
        self.inner.parker.unpark();
    }

    /// Interrupt this thread: raise its interrupt flag and wake it if it is
    /// parked, without storing a permit.
    pub fn interrupt(&self) {
        tracing::trace!("interrupting thread {:?}...", self);
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.parker.wake();
    }

    /// Reads the interrupt flag without clearing it.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Transfers ownership of one strong reference to the caller.
    pub(crate) fn into_raw(self) -> *mut Inner {
        Arc::into_raw(self.inner).cast_mut()
    }

    /// # Safety
    ///
    /// `ptr` must have come out of [`Thread::into_raw`], and the caller must
    /// own the strong reference it represents.
    pub(crate) unsafe fn from_raw(ptr: *mut Inner) -> Self {
        // Safety: ensured by caller
        Self {
            inner: unsafe { Arc::from_raw(ptr.cast_const()) },
        }
    }

    /// Clones a handle out of a raw record pointer without taking ownership.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live record, i.e. the strong reference it was
    /// derived from must be held (or have its destruction deferred) for the
    /// duration of this call.
    pub(crate) unsafe fn clone_raw(ptr: *mut Inner) -> Self {
        // Safety: ensured by caller
        unsafe {
            Arc::increment_strong_count(ptr.cast_const());
            Self::from_raw(ptr)
        }
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

// === impl Inner ===

impl Inner {
    pub(crate) fn id(&self) -> NonZeroU64 {
        self.id
    }

    pub(crate) fn unpark(&self) {
        self.parker.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::time::Duration;

    #[test]
    fn current_is_stable_per_thread() {
        crate::loom::model(|| {
            let a = current();
            let b = current();
            assert_eq!(a, b);
            let other = thread::spawn(current).join().unwrap();
            assert_ne!(a, other);
        });
    }

    #[test]
    fn unpark_then_park_does_not_block() {
        crate::loom::model(|| {
            current().unpark();
            park();
        });
    }

    #[test]
    fn interrupt_wakes_and_is_sticky_until_polled() {
        crate::loom::model(|| {
            let handle = current();
            let waker = thread::spawn(move || handle.interrupt());
            while !interrupted() {
                park();
            }
            waker.join().unwrap();
            // the poll above cleared the flag
            assert!(!current().is_interrupted());
        });
    }

    // loom does not model timed waits
    #[cfg(not(loom))]
    #[test]
    fn park_until_returns_after_the_deadline() {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(20);
        // spurious wakeups may end any single park early
        while Instant::now() < deadline {
            park_until(deadline);
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
