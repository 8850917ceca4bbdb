// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A framework for building blocking locks and related synchronizers.
//!
//! A synchronizer's public behavior is defined by a 32-bit state word plus a
//! handful of client predicates that decide when the state permits
//! acquisition; everything else — the FIFO wait queue, the park/unpark
//! blocking discipline, shared-mode wakeup propagation, cancellation, and
//! condition variables — is provided by the framework. See [`Synchronizer`]
//! for the client contract and [`mutex::ReentrantLock`] for the bundled
//! reference client.
//!
//! # Ordering
//!
//! There is no strict FIFO guarantee by default: a newly arriving thread may
//! *barge* past queued waiters by succeeding its predicate before
//! enqueueing, which maximizes throughput. Fair clients opt out by gating
//! their predicate on [`SyncQueue::has_queued_predecessors`]. Wakeups, when
//! they happen, go to the first non-cancelled waiter in queue order.
//!
//! # Example
//!
//! A one-shot gate (state zero closed, nonzero open) takes a dozen lines:
//!
//! ```
//! use synq::{SyncQueue, Synchronizer};
//!
//! struct Gate(SyncQueue);
//!
//! impl Synchronizer for Gate {
//!     fn queue(&self) -> &SyncQueue {
//!         &self.0
//!     }
//!     fn try_acquire_shared(&self, _arg: i32) -> i32 {
//!         if self.0.state() != 0 { 1 } else { -1 }
//!     }
//!     fn try_release_shared(&self, _arg: i32) -> bool {
//!         self.0.set_state(1);
//!         true
//!     }
//! }
//!
//! let gate = Gate(SyncQueue::new());
//! gate.release_shared(1); // open
//! gate.acquire_shared(1); // passes immediately, and so does every waiter
//! ```

mod error;
pub mod latch;
mod loom;
pub mod mutex;
mod raw;
pub mod thread;

pub use error::Interrupted;
pub use raw::{Condition, SyncQueue, Synchronizer};

#[cfg(test)]
mod test_util;
