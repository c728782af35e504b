//! The plaintext BitTorrent handshake message (spec.md §4.I phase 7):
//! 1-byte length, protocol string, 8 reserved bytes, 20-byte info-hash,
//! 20-byte peer-id. Grounded on `bip_handshake::message::protocol` and
//! `bip_handshake::message::handshake`, re-expressed with nom 7's
//! functional combinators instead of the teacher's `do_parse!`/`switch!`
//! macros (deprecated since nom 5, still present in the teacher's nom 4
//! vintage).

use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use nom::IResult;

use tcore_util::sha::{InfoHash, PeerId, SHA_HASH_LEN};

use crate::extensions::{Extensions, NUM_EXTENSION_BYTES};

const BT_PROTOCOL: &[u8] = b"BitTorrent protocol";

/// The protocol name string prefixing the handshake; almost always
/// `"BitTorrent protocol"` but kept open for forks that negotiate a
/// different string and fail the handshake on mismatch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Protocol {
    BitTorrent,
    Custom(Vec<u8>),
}

impl Protocol {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Protocol::BitTorrent => BT_PROTOCOL,
            Protocol::Custom(bytes) => bytes,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Handshake {
    pub protocol: Protocol,
    pub extensions: Extensions,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, extensions: Extensions) -> Handshake {
        Handshake { protocol: Protocol::BitTorrent, extensions, info_hash, peer_id }
    }

    pub fn write_len(&self) -> usize {
        1 + self.protocol.as_bytes().len() + NUM_EXTENSION_BYTES + SHA_HASH_LEN * 2
    }

    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        let proto = self.protocol.as_bytes();
        out.push(proto.len() as u8);
        out.extend_from_slice(proto);
        out.extend_from_slice(&self.extensions.write_bytes());
        out.extend_from_slice(self.info_hash.as_ref());
        out.extend_from_slice(self.peer_id.as_ref());
    }

    pub fn from_bytes(bytes: &[u8]) -> IResult<&[u8], Handshake> {
        let (rest, proto_len) = be_u8(bytes)?;
        let (rest, proto_bytes) = take(proto_len as usize)(rest)?;
        let (rest, ext_bytes) = take(NUM_EXTENSION_BYTES)(rest)?;
        let (rest, info_hash_bytes) = take(SHA_HASH_LEN)(rest)?;
        let (rest, peer_id_bytes) = take(SHA_HASH_LEN)(rest)?;

        let protocol = if proto_bytes == BT_PROTOCOL { Protocol::BitTorrent } else { Protocol::Custom(proto_bytes.to_vec()) };

        let mut ext_arr = [0u8; NUM_EXTENSION_BYTES];
        ext_arr.copy_from_slice(ext_bytes);

        let handshake = Handshake {
            protocol,
            extensions: Extensions::from(ext_arr),
            info_hash: InfoHash::from_hash(info_hash_bytes).expect("take() guarantees SHA_HASH_LEN bytes"),
            peer_id: PeerId::from_hash(peer_id_bytes).expect("take() guarantees SHA_HASH_LEN bytes"),
        };

        Ok((rest, handshake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcore_util::sha::ShaHash;

    #[test]
    fn positive_round_trip() {
        let info_hash = ShaHash::from_bytes(b"info hash bytes!!!!!");
        let peer_id = ShaHash::from_bytes(b"peer identifier!!!!!");
        let mut extensions = Extensions::new();
        extensions.add(crate::extensions::Extension::ExtensionProtocol);

        let handshake = Handshake::new(info_hash, peer_id, extensions);
        let mut bytes = Vec::new();
        handshake.write_bytes(&mut bytes);
        assert_eq!(bytes.len(), handshake.write_len());

        let (rest, parsed) = Handshake::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn negative_self_connection_is_detected_by_caller_via_peer_id_eq() {
        let local_id = ShaHash::from_bytes(b"same peer identifier");
        let info_hash = ShaHash::from_bytes(b"info hash bytes!!!!!");
        let handshake = Handshake::new(info_hash, local_id, Extensions::new());

        assert_eq!(handshake.peer_id, local_id);
    }
}
