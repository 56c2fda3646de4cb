//! Lock-free queues and node pools (C1).
//!
//! Three queue shapes are used throughout the pipeline, matching §4.1:
//!
//! * [`BoundedSpsc`] — fixed power-of-two capacity, single producer / single consumer. Used for
//!   the AIO command queue.
//! * [`UnboundedSpsc`] — single producer / single consumer, unbounded. Used for per-decoder
//!   read-result delivery and PIO's interval-delivery path.
//! * [`UnboundedMpsc`] — many producers / single consumer, unbounded. Used for every long-lived
//!   service's input queue (cache declarations/definitions/locations/commands, loader requests,
//!   buffer return queues).
//!
//! The underlying lock-free ring/list algorithms are provided by `crossbeam-queue`'s `ArrayQueue`
//! and `SegQueue`, which are the idiomatic, well-audited choice for this in the Rust ecosystem
//! (hand-rolling intrusive Michael-Scott lists here would trade a proven implementation for an
//! unverifiable one). What this module adds on top is the §4.1 *producer-cache* and
//! *allocator-table* shape: a producer handle is a cheap, cloneable, thread-cacheable token, and
//! [`AllocatorTable`] lazily keeps one such handle per distinct target queue observed by a
//! fan-out consumer (e.g. the loader posting errors to many distinct client queues).

mod spsc_bounded;
mod spsc_unbounded;
mod mpsc;

pub use spsc_bounded::{BoundedSpsc, BoundedSpscProducer, BoundedSpscConsumer};
pub use spsc_unbounded::{UnboundedSpsc, UnboundedSpscProducer, UnboundedSpscConsumer};
pub use mpsc::{UnboundedMpsc, MpscProducer, AllocatorTable};
