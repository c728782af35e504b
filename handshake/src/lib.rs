//! Handshake layer (spec.md §2 component I, and the handshake half of
//! component K): the MSE + BitTorrent handshake state machine and the
//! manager that admits, deduplicates, and migrates in-flight handshakes.
//!
//! Grounded on `bip_handshake`'s crate split (`message`, `handshaker`) for
//! the overall shape; the MSE phases and the opposite-encryption retry
//! policy have no teacher precedent and are built from spec.md §4.I and
//! the MSE specification directly.

#[macro_use]
extern crate error_chain;

pub mod error;
pub mod extensions;
pub mod machine;
pub mod manager;
pub mod message;
pub mod mse;

pub use error::{HandshakeError, HandshakeErrorKind, HandshakeResult};
pub use extensions::{Extension, Extensions};
pub use machine::{Config, HandshakeMachine, Outcome, Role, State};
pub use manager::{AdmissionPolicy, ConnectionList, Disposition, EraseFlags, HandshakeManager};
pub use message::{Handshake, Protocol};
