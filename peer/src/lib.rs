//! Per-connection BitTorrent wire protocol (spec.md §4.H): wire message
//! codec, the read and write state machines, request-list/pipelining and
//! leader/non-leader piece reconciliation, and the `PeerConnection` type
//! that ties them together with choke/interest bookkeeping.

#[macro_use]
extern crate error_chain;

pub mod connection;
pub mod error;
pub mod message;
pub mod read;
pub mod requests;
pub mod write;

pub use connection::{ConnectionEvent, PeerConnection, RequestSource};
pub use error::{PeerError, PeerErrorKind, PeerResult};
pub use message::Message;
pub use read::{Event, PieceDisposition, PieceSink, ReadMachine};
pub use requests::{BlockRequest, LeadershipSink, PieceLeadership, RequestList, pipe_size};
pub use write::{BlockSource, OutgoingCipher, WriteMachine, WriteOutcome};
