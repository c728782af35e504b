//! BitTorrent-specific type aliases, grounded on `bip_util::bt`.

pub use crate::sha::{InfoHash, PeerId, INFO_HASH_LEN, PEER_ID_LEN};

/// Maximum length of a single requested block, per BEP 3 and spec.md's data
/// model ("Block: a sub-range of a piece (<= 2^17 bytes)").
pub const MAX_BLOCK_LEN: usize = 1 << 17;

/// Identifies one piece of a torrent by its zero-based index.
pub type PieceIndex = u32;
