//! Shared primitives used across the tcore workspace: BitTorrent identifier
//! newtypes, a SHA-1 wrapper usable as a streaming hasher, and a small
//! `TrySender` abstraction used to pass messages between threads without
//! committing every crate to one channel implementation.

pub mod bitfield;
pub mod bt;
pub mod send;
pub mod sha;
