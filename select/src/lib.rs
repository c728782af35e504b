//! Choke-group scheduling (spec.md §4.J): weighted upload/download unchoke
//! queues, optimistic rotation, and the group-entry bookkeeping they share.
//! No teacher module covers this (`bip_select` is piece revelation/
//! discovery, not choking) — built from the spec directly; see
//! `group.rs`/`queue.rs` doc comments and the grounding ledger.

#[macro_use]
extern crate error_chain;

pub mod error;
pub mod group;
pub mod queue;

mod chokegroup;

pub use chokegroup::{migrate, ChokeGroup};
pub use error::{SelectError, SelectErrorKind, SelectResult};
pub use group::{ChokeSlot, GroupEntry, QueueState, BAND_SIZE};
pub use queue::{ChokeQueue, Direction};
