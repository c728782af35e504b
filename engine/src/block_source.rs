//! Feeds an outgoing `piece` message's body straight out of a chunk's
//! memory map (spec.md §4.H "the connection streams the requested block
//! straight out of the chunk instead of first copying it into a
//! `Message::Piece`"), the `tcore_peer::write::BlockSource` this crate's
//! write machine was built to consume.

use tcore_disk::chunk::{ChunkHandle, Read};
use tcore_peer::BlockSource;

use crate::chunk_io::read_range;

pub struct ChunkBlockSource {
    handle: ChunkHandle<Read>,
    offset: u32,
    remaining: usize,
}

impl ChunkBlockSource {
    pub fn new(handle: ChunkHandle<Read>, offset: u32, length: usize) -> ChunkBlockSource {
        ChunkBlockSource { handle, offset, remaining: length }
    }
}

impl BlockSource for ChunkBlockSource {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn read_into(&mut self, out: &mut [u8]) -> usize {
        let take = out.len().min(self.remaining);
        if take == 0 {
            return 0;
        }
        let bytes = self.handle.with_chunk(|chunk| read_range(chunk, self.offset, take)).unwrap_or_default();
        out[..bytes.len()].copy_from_slice(&bytes);
        self.offset += bytes.len() as u32;
        self.remaining -= bytes.len();
        bytes.len()
    }
}
