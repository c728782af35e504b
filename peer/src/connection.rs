//! Per-connection peer state (spec.md §4.H "Choke/interest protocol" and
//! "Pipelining"), tying the read state machine, write state machine and
//! request list into one type. The choke-queue's decision of *which*
//! connections to choke/unchoke (spec.md §4.J) and the disk layer's
//! decision of *which* block to request next both live outside this
//! module; this type only carries out whatever they decide.

use tcore_util::bitfield::Bitfield;
use tcore_util::bt::PieceIndex;

use crate::error::PeerError;
use crate::message::Message;
use crate::read::ReadMachine;
use crate::requests::{BlockRequest, LeadershipSink, PieceLeadership, RequestList, pipe_size};
use crate::write::WriteMachine;

/// Supplies the next block to request from this peer, consulting what we
/// already have so the connection never has to know about torrent-wide
/// piece selection itself (spec.md §4.H "Pipelining": "the connection
/// re-requests until queued_size >= pipe_size or the delegator returns no
/// piece").
pub trait RequestSource {
    fn next_request(&mut self, have: &Bitfield) -> Option<BlockRequest>;
}

/// Events surfaced to the connection's owner after processing inbound
/// bytes. Distinct from `crate::read::Event`: choke/interest bookkeeping
/// and the remote-bitfield/have mirroring have already been applied here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    RemoteChoked,
    RemoteUnchoked,
    RemoteInterested,
    RemoteNotInterested,
    RemoteRequest { index: PieceIndex, begin: u32, length: u32 },
    RemoteCancel { index: PieceIndex, begin: u32 },
    /// A block we requested finished streaming in. Hash verification and
    /// the "invalidate every contributing peer's blocks on mismatch"
    /// behavior (spec.md §4.H "Failure semantics") happen above this layer,
    /// once the disk side knows whether the whole piece now hashes clean.
    BlockComplete { index: PieceIndex, begin: u32 },
    Extension { id: u8, payload: Vec<u8> },
}

pub struct PeerConnection {
    connection_id: u64,
    read: ReadMachine,
    write: WriteMachine,
    requests: RequestList,

    /// Pieces we have, kept so interest can be recomputed as our own
    /// completion state changes (spec.md: "have" and bitfield messages
    /// decide the remote's interest in us, and vice versa for ours).
    have_pieces: Bitfield,
    remote_bitfield: Bitfield,

    local_choking: bool,
    local_interested: bool,
    remote_choking: bool,
    remote_interested: bool,

    /// Set on receive-unchoke; consumed by the next `on_tick` to refill the
    /// pipeline (spec.md "mark try_request; on next tick, replenish").
    try_request: bool,
}

impl PeerConnection {
    pub fn new(connection_id: u64, num_pieces: usize, max_incoming_requests: usize) -> PeerConnection {
        PeerConnection {
            connection_id,
            read: ReadMachine::new(num_pieces),
            write: WriteMachine::new(),
            requests: RequestList::new(connection_id, max_incoming_requests),
            have_pieces: Bitfield::new(num_pieces),
            remote_bitfield: Bitfield::new(num_pieces),
            local_choking: true,
            local_interested: false,
            remote_choking: true,
            remote_interested: false,
            try_request: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn remote_bitfield(&self) -> &Bitfield {
        &self.remote_bitfield
    }

    pub fn is_remote_choking(&self) -> bool {
        self.remote_choking
    }

    pub fn is_local_choking(&self) -> bool {
        self.local_choking
    }

    pub fn write_machine(&mut self) -> &mut WriteMachine {
        &mut self.write
    }

    pub fn requests(&self) -> &RequestList {
        &self.requests
    }

    /// Pop the next upload the remote asked for, so the connection's owner
    /// can begin streaming it via `write_machine().begin_piece_upload`.
    pub fn pop_upload_request(&mut self) -> Option<BlockRequest> {
        self.requests.pop_upload()
    }

    /// A piece we previously lacked just finished verifying; mirrors into
    /// our outgoing `have` advertisement and may drop our interest in the
    /// remote if they have nothing left we want.
    pub fn mark_have(&mut self, index: PieceIndex) {
        if self.have_pieces.set(index as usize) {
            self.write.queue_command(Message::Have(index));
            self.recompute_interest();
        }
    }

    /// Feed freshly-read socket bytes through the wire protocol, applying
    /// choke/interest bookkeeping and leader/non-leader piece reconciliation
    /// along the way.
    pub fn feed<L: PieceLeadership>(&mut self, data: &[u8], leadership: &mut L) -> Result<Vec<ConnectionEvent>, PeerError> {
        let read_events = {
            let mut sink = LeadershipSink { requests: &mut self.requests, leadership };
            self.read.feed(data, &mut sink)?
        };

        let mut out = Vec::with_capacity(read_events.len());
        for event in read_events {
            if let Some(translated) = self.apply(event) {
                out.push(translated);
            }
        }
        Ok(out)
    }

    fn apply(&mut self, event: crate::read::Event) -> Option<ConnectionEvent> {
        use crate::read::Event;

        match event {
            Event::KeepAlive => None,

            Event::Choke => {
                self.remote_choking = true;
                let dropped = self.requests.on_remote_choke();
                log::debug!("connection {} choked by remote, dropped {} outstanding requests", self.connection_id, dropped);
                Some(ConnectionEvent::RemoteChoked)
            }
            Event::Unchoke => {
                self.remote_choking = false;
                self.try_request = true;
                log::debug!("connection {} unchoked by remote", self.connection_id);
                Some(ConnectionEvent::RemoteUnchoked)
            }
            Event::Interested => {
                self.remote_interested = true;
                Some(ConnectionEvent::RemoteInterested)
            }
            Event::NotInterested => {
                self.remote_interested = false;
                Some(ConnectionEvent::RemoteNotInterested)
            }

            Event::Have(index) => {
                self.remote_bitfield.set(index as usize);
                self.recompute_interest();
                None
            }
            Event::Bitfield(bitfield) => {
                self.remote_bitfield = bitfield;
                self.recompute_interest();
                None
            }

            Event::Request { index, begin, length } => {
                let accepted = self.requests.on_remote_request(BlockRequest { index, begin, length }, self.local_choking);
                if accepted {
                    Some(ConnectionEvent::RemoteRequest { index, begin, length })
                } else {
                    None
                }
            }
            Event::Cancel { index, begin, length: _ } => {
                if self.requests.on_remote_cancel(index, begin) {
                    Some(ConnectionEvent::RemoteCancel { index, begin })
                } else {
                    None
                }
            }
            Event::PieceComplete { index, begin } => Some(ConnectionEvent::BlockComplete { index, begin }),
            Event::Extension { id, payload } => Some(ConnectionEvent::Extension { id, payload }),
        }
    }

    /// Recompute whether we're interested in the remote now that either
    /// bitfield has changed, queuing `interested`/`not-interested` only on
    /// an actual flip.
    fn recompute_interest(&mut self) {
        let wants_something = (0..self.have_pieces.len()).any(|i| self.remote_bitfield.contains(i) && !self.have_pieces.contains(i));

        if wants_something && !self.local_interested {
            self.local_interested = true;
            self.write.queue_command(Message::Interested);
        } else if !wants_something && self.local_interested {
            self.local_interested = false;
            self.write.queue_command(Message::NotInterested);
        }
    }

    /// Driven by the choke-queue (spec.md §4.J: "Send-choke/unchoke is
    /// driven by §4.J").
    pub fn set_local_choking(&mut self, choking: bool) {
        if choking == self.local_choking {
            return;
        }
        self.local_choking = choking;
        self.write.queue_command(if choking { Message::Choke } else { Message::Unchoke });
    }

    /// Replenish the outgoing request pipeline up to `pipe_size` if we were
    /// just unchoked or are already mid-download (spec.md "on next tick,
    /// replenish the pipeline up to pipe_size = f(download_rate)").
    pub fn on_tick<S: RequestSource>(&mut self, download_rate_bytes_per_sec: u64, source: &mut S) {
        if self.remote_choking || !self.try_request {
            return;
        }

        let target = pipe_size(download_rate_bytes_per_sec);
        while self.requests.outgoing_len() < target {
            match source.next_request(&self.have_pieces) {
                Some(request) => {
                    if !self.requests.want_request(request, target) {
                        break;
                    }
                    self.write.queue_command(Message::Request { index: request.index, begin: request.begin, length: request.length });
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct NullLeadership {
        leader: HashMap<PieceIndex, (u64, u32)>,
        bytes: HashMap<PieceIndex, Vec<u8>>,
    }

    impl PieceLeadership for NullLeadership {
        fn leader_progress(&self, index: PieceIndex) -> Option<u32> {
            self.leader.get(&index).map(|(_, offset)| *offset)
        }
        fn claim_leadership(&mut self, index: PieceIndex, connection_id: u64, offset: u32) {
            self.leader.insert(index, (connection_id, offset));
        }
        fn leader_bytes_at(&self, index: PieceIndex, offset: u32, len: usize) -> Option<Vec<u8>> {
            self.bytes.get(&index).and_then(|b| {
                let start = offset as usize;
                if start + len <= b.len() { Some(b[start..start + len].to_vec()) } else { None }
            })
        }
        fn write_leader_bytes(&mut self, index: PieceIndex, offset: u32, bytes: &[u8]) {
            let buf = self.bytes.entry(index).or_insert_with(Vec::new);
            let end = offset as usize + bytes.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(bytes);
        }
        fn mark_dissimilar(&mut self, _index: PieceIndex) {}
    }

    #[test]
    fn positive_bitfield_from_remote_triggers_interest() {
        let mut conn = PeerConnection::new(1, 4, 8);
        let mut leadership = NullLeadership::default();

        let mut remote_has = Bitfield::new(4);
        remote_has.set(2);
        let mut bytes = Vec::new();
        Message::Bitfield(remote_has).write_bytes(&mut bytes);

        conn.feed(&bytes, &mut leadership).unwrap();
        assert!(conn.local_interested);
        assert_eq!(conn.write.pending_commands(), 1);
    }

    #[test]
    fn positive_having_everything_remote_has_suppresses_interest() {
        let mut conn = PeerConnection::new(1, 4, 8);
        conn.mark_have(2);
        let mut leadership = NullLeadership::default();

        let mut remote_has = Bitfield::new(4);
        remote_has.set(2);
        let mut bytes = Vec::new();
        Message::Bitfield(remote_has).write_bytes(&mut bytes);

        conn.feed(&bytes, &mut leadership).unwrap();
        assert!(!conn.local_interested);
    }

    #[test]
    fn positive_remote_choke_drops_outstanding_requests() {
        let mut conn = PeerConnection::new(1, 4, 8);
        conn.requests.want_request(BlockRequest { index: 0, begin: 0, length: 16384 }, 4);
        assert_eq!(conn.requests.outgoing_len(), 1);

        let mut leadership = NullLeadership::default();
        let mut bytes = Vec::new();
        Message::Choke.write_bytes(&mut bytes);
        let events = conn.feed(&bytes, &mut leadership).unwrap();

        assert_eq!(events, vec![ConnectionEvent::RemoteChoked]);
        assert_eq!(conn.requests.outgoing_len(), 0);
    }

    struct OneShotSource(Option<BlockRequest>);
    impl RequestSource for OneShotSource {
        fn next_request(&mut self, _have: &Bitfield) -> Option<BlockRequest> {
            self.0.take()
        }
    }

    #[test]
    fn positive_unchoke_then_tick_replenishes_pipeline() {
        let mut conn = PeerConnection::new(1, 4, 8);
        let mut leadership = NullLeadership::default();

        let mut bytes = Vec::new();
        Message::Unchoke.write_bytes(&mut bytes);
        conn.feed(&bytes, &mut leadership).unwrap();

        let mut source = OneShotSource(Some(BlockRequest { index: 0, begin: 0, length: 16384 }));
        conn.on_tick(200 * 1024, &mut source);

        assert_eq!(conn.requests.outgoing_len(), 1);
        assert_eq!(conn.write.pending_commands(), 1);
    }
}
