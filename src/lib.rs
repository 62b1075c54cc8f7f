//! A fixed-capacity, lock-free, in-memory coordination log.
//!
//! `roundabout` is a 32-slot ring of published operation descriptors
//! behind one atomic header word. A thread publishes what it is about to
//! do, waits out every earlier conflicting descriptor, runs, and retracts.
//! That one protocol covers a surprising amount of ground:
//!
//! * an exclusive lock ([`lock_ring`](ring::Roundabout::lock_ring)),
//! * a reader-writer lock ([`share_ring`](ring::Roundabout::share_ring) /
//!   [`lock_ring`](ring::Roundabout::lock_ring)),
//! * keyed fine-grained locks ([`share_lane`](ring::Roundabout::share_lane)
//!   / [`lock_lane`](ring::Roundabout::lock_lane) over a 32-bit lane),
//! * RCU-style flag fences and phases
//!   ([`fence`](ring::Roundabout::fence), [`phase`](ring::Roundabout::phase)),
//!
//! all without OS primitives and without allocating after construction.
//! Waiting is busy-wait spinning with a pause hint and bounded backoff;
//! the structure is built for small sets of active contenders.
//!
//! # Examples
//!
//! A shared counter behind the big lock:
//!
//! ```
//! use roundabout::Roundabout;
//! use std::cell::Cell;
//!
//! struct Counter {
//!     log:   Roundabout,
//!     value: Cell<u64>,
//! }
//! // every access to `value` happens under an exclusive or shared claim
//! unsafe impl Sync for Counter {}
//!
//! static COUNTER: Counter = Counter {
//!     log:   Roundabout::new(),
//!     value: Cell::new(0),
//! };
//!
//! COUNTER.log.lock_ring(|_, _| COUNTER.value.set(COUNTER.value.get() + 1));
//! let snapshot = COUNTER.log.share_ring(|_, _| COUNTER.value.get());
//! assert_eq!(snapshot, 1);
//! ```
//!
//! Lane claims only contend when their keys collide:
//!
//! ```
//! use roundabout::Roundabout;
//!
//! let log = Roundabout::new();
//! log.lock_lane(7, |_, _| { /* lane 7 is exclusively ours */ });
//! log.share_lane(7, |_, _| { /* other lane-7 readers may run too */ });
//! ```
//!
//! Everything mutating takes a callback invoked with `(epoch, flags)`,
//! the admission ordinal and the advisory flag bits seen at admission,
//! and returns the callback's result verbatim. For scoped acquisition
//! without closures, see [`ring::Roundabout::acquire`].
//!
//! # Liveness
//!
//! Admission order is FIFO and all waiting is against earlier admissions,
//! so the structure cannot cycle; but a descriptor is only retracted when
//! its holder finishes. A callback that never returns pins its slot
//! forever, and a thread that re-enters the same log with a conflicting
//! claim waits on itself. Debug builds panic on the latter; release builds
//! spin.

#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

mod internal;

pub mod conflict;
pub mod map;
pub mod ring;
pub mod stats;

pub use conflict::{Conflict, LaneEq};
pub use ring::{Claim, Entry, FenceGuard, Roundabout};
