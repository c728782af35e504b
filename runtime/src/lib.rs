//! Signal bitfield, timer queue, global lock and poll-loop thread base
//! (spec.md §2 components F–G): the concurrency substrate every other
//! crate's I/O-facing state machines run on top of.

pub mod global_lock;
pub mod signal;
pub mod thread;
pub mod timer;

pub use signal::SignalBitfield;
pub use thread::{Thread, ThreadBody, ThreadHandle};
pub use timer::{TimerId, TimerQueue};
