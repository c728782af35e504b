//! SHA-1 wrapper type, grounded on `bip_util::sha`, backed by the `sha1`
//! crate instead of the teacher's `rust-crypto` dependency (which no longer
//! builds on current toolchains).

use std::fmt;
use std::ops::BitXor;

use sha1::{Digest, Sha1};

/// Length in bytes of a SHA-1 hash.
pub const SHA_HASH_LEN: usize = 20;

/// Bittorrent `info_hash`.
pub type InfoHash = ShaHash;
/// Bittorrent peer id.
pub type PeerId = ShaHash;
/// Length of an `InfoHash`.
pub const INFO_HASH_LEN: usize = SHA_HASH_LEN;
/// Length of a `PeerId`.
pub const PEER_ID_LEN: usize = SHA_HASH_LEN;

/// A 20-byte SHA-1 hash.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaHash {
    hash: [u8; SHA_HASH_LEN],
}

impl ShaHash {
    /// Hash `bytes` in one shot.
    pub fn from_bytes(bytes: &[u8]) -> ShaHash {
        ShaHashBuilder::new().add_bytes(bytes).build()
    }

    /// Wrap an already-computed hash.
    pub fn from_hash(hash: &[u8]) -> Option<ShaHash> {
        if hash.len() != SHA_HASH_LEN {
            None
        } else {
            let mut buf = [0u8; SHA_HASH_LEN];
            buf.copy_from_slice(hash);
            Some(ShaHash { hash: buf })
        }
    }

    pub fn len() -> usize {
        SHA_HASH_LEN
    }
}

impl AsRef<[u8]> for ShaHash {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

impl From<[u8; SHA_HASH_LEN]> for ShaHash {
    fn from(hash: [u8; SHA_HASH_LEN]) -> ShaHash {
        ShaHash { hash }
    }
}

impl From<ShaHash> for [u8; SHA_HASH_LEN] {
    fn from(hash: ShaHash) -> [u8; SHA_HASH_LEN] {
        hash.hash
    }
}

impl PartialEq<[u8]> for ShaHash {
    fn eq(&self, other: &[u8]) -> bool {
        self.hash.as_ref() == other
    }
}

impl BitXor for ShaHash {
    type Output = ShaHash;

    fn bitxor(mut self, rhs: ShaHash) -> ShaHash {
        for (dst, src) in self.hash.iter_mut().zip(rhs.hash.iter()) {
            *dst ^= *src;
        }
        self
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaHash(")?;
        for byte in &self.hash {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Streaming SHA-1 builder, used by the hash-check pipeline to digest a
/// chunk scattered across several chunk-parts without first copying them
/// into one contiguous buffer.
pub struct ShaHashBuilder {
    hasher: Sha1,
}

impl ShaHashBuilder {
    pub fn new() -> ShaHashBuilder {
        ShaHashBuilder { hasher: Sha1::new() }
    }

    pub fn add_bytes(mut self, bytes: &[u8]) -> ShaHashBuilder {
        self.hasher.update(bytes);
        self
    }

    pub fn build(self) -> ShaHash {
        let digest = self.hasher.finalize();
        let mut hash = [0u8; SHA_HASH_LEN];
        hash.copy_from_slice(&digest);
        ShaHash { hash }
    }
}

impl Default for ShaHashBuilder {
    fn default() -> ShaHashBuilder {
        ShaHashBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_known_hash() {
        let hash = ShaHash::from_bytes(b"");
        assert_eq!(
            hash.as_ref(),
            &[
                0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60,
                0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09
            ]
        );
    }

    #[test]
    fn positive_streaming_matches_one_shot() {
        let streamed = ShaHashBuilder::new().add_bytes(b"hello ").add_bytes(b"world").build();
        let one_shot = ShaHash::from_bytes(b"hello world");

        assert_eq!(streamed, one_shot);
    }

    #[test]
    fn positive_xor_self_is_zero() {
        let hash = ShaHash::from_bytes(b"anything");
        let zero = hash ^ hash;

        assert_eq!(zero, ShaHash::from([0u8; SHA_HASH_LEN]));
    }

    #[test]
    fn negative_from_hash_wrong_length() {
        assert!(ShaHash::from_hash(&[0u8; SHA_HASH_LEN - 1]).is_none());
        assert!(ShaHash::from_hash(&[0u8; SHA_HASH_LEN + 1]).is_none());
    }
}
