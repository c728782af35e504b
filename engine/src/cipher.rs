//! Per-connection RC4 keystreams derived from a completed MSE handshake
//! (spec.md §4.I phase 2), wiring `tcore_handshake::mse::derive_rc4` into
//! `tcore_peer`'s `OutgoingCipher` seam on the write side and a plain
//! `apply_keystream` call on the read side (the read machine has no cipher
//! hook of its own — bytes are decrypted before they ever reach it).

use rc4::{Rc4, StreamCipher};
use tcore_handshake::mse::{self, Side};
use tcore_peer::OutgoingCipher;

/// Outgoing half of an encrypted session, plugged into
/// `tcore_peer::write::WriteMachine::poll_write`.
pub struct Rc4Outgoing(Rc4<rc4::consts::U20>);

impl OutgoingCipher for Rc4Outgoing {
    fn apply(&mut self, bytes: &mut [u8]) {
        self.0.apply_keystream(bytes);
    }
}

/// Incoming half, applied to raw socket bytes before they reach
/// `tcore_peer::read::ReadMachine::feed`.
pub struct Rc4Incoming(Rc4<rc4::consts::U20>);

impl Rc4Incoming {
    pub fn decrypt(&mut self, bytes: &mut [u8]) {
        self.0.apply_keystream(bytes);
    }
}

/// Both halves of one connection's encrypted session, keyed off which end
/// of the TCP connection we were (spec.md §4.I "initiator"/"responder"
/// streams are mirror images of each other, not of the local role").
pub struct SessionCiphers {
    pub outgoing: Rc4Outgoing,
    pub incoming: Rc4Incoming,
}

impl SessionCiphers {
    pub fn for_role(role: tcore_handshake::Role, secret: &[u8], info_hash: &[u8]) -> SessionCiphers {
        let (our_side, their_side) = match role {
            tcore_handshake::Role::Outgoing => (Side::Initiator, Side::Responder),
            tcore_handshake::Role::Incoming => (Side::Responder, Side::Initiator),
        };
        SessionCiphers {
            outgoing: Rc4Outgoing(mse::derive_rc4(our_side, secret, info_hash)),
            incoming: Rc4Incoming(mse::derive_rc4(their_side, secret, info_hash)),
        }
    }
}
