//! Per-torrent leader/non-leader reconciliation for concurrent multi-peer
//! block downloads (spec.md §4.H), the `tcore_peer::PieceLeadership`
//! implementation that actually owns disk writes: the leader's bytes land
//! straight in the chunk, and a non-leader is promoted only once it has
//! outrun the recorded leader offset by more than one block (spec.md §9
//! Open Question: "promote when the non-leader's received-byte offset
//! exceeds the current leader's by more than one block").

use std::collections::HashMap;

use tcore_disk::chunk::{GetFlags, Read, Write};
use tcore_disk::Manager;
use tcore_util::bt::PieceIndex;

use crate::chunk_io::{read_range, write_range};

pub struct TorrentLeadership<'a> {
    manager: &'a Manager,
    leader: &'a mut HashMap<PieceIndex, (u64, u32)>,
}

impl<'a> TorrentLeadership<'a> {
    pub fn new(manager: &'a Manager, leader: &'a mut HashMap<PieceIndex, (u64, u32)>) -> TorrentLeadership<'a> {
        TorrentLeadership { manager, leader }
    }
}

impl<'a> tcore_peer::PieceLeadership for TorrentLeadership<'a> {
    fn leader_progress(&self, index: PieceIndex) -> Option<u32> {
        self.leader.get(&index).map(|&(_, offset)| offset)
    }

    fn claim_leadership(&mut self, index: PieceIndex, connection_id: u64, offset: u32) {
        self.leader.insert(index, (connection_id, offset));
    }

    fn leader_bytes_at(&self, index: PieceIndex, offset: u32, len: usize) -> Option<Vec<u8>> {
        let handle = self.manager.get::<Read>(index, GetFlags { do_not_create: true }).ok()?;
        handle.with_chunk(|chunk| read_range(chunk, offset, len))
    }

    fn write_leader_bytes(&mut self, index: PieceIndex, offset: u32, bytes: &[u8]) {
        if let Ok(handle) = self.manager.get::<Write>(index, GetFlags::default()) {
            handle.with_chunk_mut(|chunk| write_range(chunk, offset, bytes));
        }
    }

    fn mark_dissimilar(&mut self, index: PieceIndex) {
        log::warn!("piece {} has a non-leader byte mismatch, discarding the contribution", index);
    }
}
