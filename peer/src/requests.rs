//! Request list (spec.md §4.H "Pipelining" and "read-piece ... leader /
//! non-leader" semantics), grounded on spec.md §3's "Peer chunks" data
//! model (pending upload-request queue, in-flight download requests,
//! per-direction throttle) since the teacher (`bip_peer::piece`) never
//! finished this half of its request tracker.

use std::collections::VecDeque;

use tcore_util::bt::{PieceIndex, MAX_BLOCK_LEN};

use crate::read::{PieceDisposition, PieceSink};

/// One outstanding block request this connection has sent to the peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: PieceIndex,
    pub begin: u32,
    pub length: u32,
}

/// Minimum and maximum `pipe_size` (spec.md §8 "pipe_size grows with
/// download rate but is capped"; the property test exercises 200 KiB/s
/// yielding `pipe_size >= 8` and 1 KiB/s collapsing to the minimum).
const MIN_PIPE_SIZE: usize = 2;
const MAX_PIPE_SIZE: usize = 48;

/// `pipe_size = f(download_rate)`: one request per ~16 KiB/s of observed
/// download rate from this peer, clamped to `[MIN_PIPE_SIZE,
/// MAX_PIPE_SIZE]`.
pub fn pipe_size(download_rate_bytes_per_sec: u64) -> usize {
    let size = (download_rate_bytes_per_sec / (16 * 1024)) as usize;
    size.clamp(MIN_PIPE_SIZE, MAX_PIPE_SIZE)
}

/// Which connection is currently "leading" the fetch of a given piece: the
/// first connection to start streaming a block into it writes bytes
/// directly; every other connection racing the same piece compares its
/// bytes against what the leader already wrote, and only takes over if it
/// runs ahead of the leader's progress (spec.md §4.H).
pub trait PieceLeadership {
    /// Current leader's write offset into `index`, if any connection is
    /// leading it.
    fn leader_progress(&self, index: PieceIndex) -> Option<u32>;
    /// Become (or remain) the leader for `index`, recording this
    /// connection's id.
    fn claim_leadership(&mut self, index: PieceIndex, connection_id: u64, offset: u32);
    /// The bytes the leader already wrote for `index` at `[offset, offset +
    /// bytes.len())`, used to detect mismatches from non-leader streams.
    fn leader_bytes_at(&self, index: PieceIndex, offset: u32, len: usize) -> Option<Vec<u8>>;
    fn write_leader_bytes(&mut self, index: PieceIndex, offset: u32, bytes: &[u8]);
    /// Mark this piece dissimilar: a non-leader's bytes disagreed with the
    /// leader's, so its contribution is discarded (spec.md "abandons this
    /// transfer and marks it dissimilar").
    fn mark_dissimilar(&mut self, index: PieceIndex);
}

/// Per-connection request tracking: the upload queue of blocks the remote
/// peer asked for, and the download queue of blocks we asked the remote
/// for (spec.md §3 "Peer chunks").
pub struct RequestList {
    connection_id: u64,
    outgoing: VecDeque<BlockRequest>,
    incoming: VecDeque<BlockRequest>,
    /// Upload-queue cardinality cap (spec.md §5 "a small cardinality cap").
    max_incoming: usize,
    current_piece: Option<(PieceIndex, u32)>,
}

impl RequestList {
    pub fn new(connection_id: u64, max_incoming: usize) -> RequestList {
        RequestList {
            connection_id,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            max_incoming,
            current_piece: None,
        }
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Queue a block we intend to request, respecting `pipe_size` (spec.md
    /// "the connection re-requests until `queued_size >= pipe_size`").
    pub fn want_request(&mut self, request: BlockRequest, target_pipe_size: usize) -> bool {
        if self.outgoing.len() >= target_pipe_size {
            return false;
        }
        self.outgoing.push_back(request);
        true
    }

    /// Remote sent us a `choke`: drop outstanding outgoing requests, but
    /// queued-but-not-yet-sent intent may still arrive and is kept (spec.md
    /// §4.H "Receive-choke ↔ drop all outstanding requests (but keep
    /// enqueued ones; they may still arrive)").
    pub fn on_remote_choke(&mut self) -> usize {
        let dropped = self.outgoing.len();
        self.outgoing.clear();
        dropped
    }

    pub fn cancel_outgoing(&mut self, index: PieceIndex, begin: u32) -> bool {
        let before = self.outgoing.len();
        self.outgoing.retain(|r| !(r.index == index && r.begin == begin));
        before != self.outgoing.len()
    }

    /// Validate and enqueue an incoming `request` message against the
    /// upload-queue bound (spec.md §4.H "validate ... and enqueue", §5
    /// "Upload pipeline is bounded by upload-request-queue length per
    /// peer").
    pub fn on_remote_request(&mut self, request: BlockRequest, we_are_choking: bool) -> bool {
        if we_are_choking || request.length as usize > MAX_BLOCK_LEN || self.incoming.len() >= self.max_incoming {
            return false;
        }
        self.incoming.push_back(request);
        true
    }

    pub fn on_remote_cancel(&mut self, index: PieceIndex, begin: u32) -> bool {
        let before = self.incoming.len();
        self.incoming.retain(|r| !(r.index == index && r.begin == begin));
        before != self.incoming.len()
    }

    pub fn pop_upload(&mut self) -> Option<BlockRequest> {
        self.incoming.pop_front()
    }
}

/// A `RequestList` plus a shared leadership tracker implements `PieceSink`
/// (spec.md §4.H's read-piece/skip-piece transitions); kept as a thin
/// adapter rather than merged into `RequestList` itself so the leadership
/// tracker (process-wide, per-piece) stays decoupled from the per-
/// connection request bookkeeping.
pub struct LeadershipSink<'a, L: PieceLeadership> {
    pub requests: &'a mut RequestList,
    pub leadership: &'a mut L,
}

impl<'a, L: PieceLeadership> PieceSink for LeadershipSink<'a, L> {
    fn begin_piece(&mut self, index: PieceIndex, begin: u32, _length: u32) -> PieceDisposition {
        match self.leadership.leader_progress(index) {
            None => {
                self.leadership.claim_leadership(index, self.requests.connection_id, begin);
                self.requests.current_piece = Some((index, begin));
                PieceDisposition::Accept
            }
            Some(leader_offset) if begin > leader_offset.saturating_add(MAX_BLOCK_LEN as u32) => {
                // We have run ahead of the recorded leader offset by more
                // than a block: take over leadership rather than silently
                // discard our own bytes.
                self.leadership.claim_leadership(index, self.requests.connection_id, begin);
                self.requests.current_piece = Some((index, begin));
                PieceDisposition::Accept
            }
            Some(_) => {
                // Still within a block of the leader: stream along as a
                // non-leader, comparison happens per-block in `write_block`.
                self.requests.current_piece = Some((index, begin));
                PieceDisposition::Accept
            }
        }
    }

    fn write_block(&mut self, index: PieceIndex, offset: u32, bytes: &[u8]) {
        match self.leadership.leader_bytes_at(index, offset, bytes.len()) {
            Some(existing) if existing == bytes => {
                // Matches what the leader already wrote; nothing new to do.
            }
            Some(_mismatch) => {
                self.leadership.mark_dissimilar(index);
            }
            None => {
                self.leadership.write_leader_bytes(index, offset, bytes);
                self.leadership.claim_leadership(index, self.requests.connection_id, offset + bytes.len() as u32);
            }
        }
    }

    fn finish_piece(&mut self, index: PieceIndex, begin: u32) {
        self.requests.cancel_outgoing(index, begin);
        self.requests.current_piece = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestLeadership {
        leader: HashMap<PieceIndex, (u64, u32)>,
        bytes: HashMap<PieceIndex, Vec<u8>>,
        dissimilar: Vec<PieceIndex>,
    }

    impl PieceLeadership for TestLeadership {
        fn leader_progress(&self, index: PieceIndex) -> Option<u32> {
            self.leader.get(&index).map(|(_, offset)| *offset)
        }
        fn claim_leadership(&mut self, index: PieceIndex, connection_id: u64, offset: u32) {
            self.leader.insert(index, (connection_id, offset));
        }
        fn leader_bytes_at(&self, index: PieceIndex, offset: u32, len: usize) -> Option<Vec<u8>> {
            self.bytes.get(&index).and_then(|b| {
                let start = offset as usize;
                if start + len <= b.len() {
                    Some(b[start..start + len].to_vec())
                } else {
                    None
                }
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
        fn mark_dissimilar(&mut self, index: PieceIndex) {
            self.dissimilar.push(index);
        }
    }

    #[test]
    fn positive_pipe_size_grows_with_rate_and_is_capped() {
        assert_eq!(pipe_size(200 * 1024), 12);
        assert!(pipe_size(200 * 1024) >= 8);
        assert_eq!(pipe_size(1024), MIN_PIPE_SIZE);
        assert_eq!(pipe_size(u64::MAX), MAX_PIPE_SIZE);
    }

    #[test]
    fn positive_remote_choke_drops_outgoing_but_keeps_slot_for_requeue() {
        let mut list = RequestList::new(1, 8);
        list.want_request(BlockRequest { index: 0, begin: 0, length: 16384 }, 4);
        assert_eq!(list.outgoing_len(), 1);

        let dropped = list.on_remote_choke();
        assert_eq!(dropped, 1);
        assert_eq!(list.outgoing_len(), 0);
    }

    #[test]
    fn positive_first_writer_becomes_leader_and_writes_through() {
        let mut requests = RequestList::new(1, 8);
        let mut leadership = TestLeadership::default();
        let mut sink = LeadershipSink { requests: &mut requests, leadership: &mut leadership };

        assert_eq!(sink.begin_piece(0, 0, 4), PieceDisposition::Accept);
        sink.write_block(0, 0, &[1, 2, 3, 4]);

        assert_eq!(leadership.bytes.get(&0).unwrap(), &vec![1, 2, 3, 4]);
        assert!(leadership.dissimilar.is_empty());
    }

    #[test]
    fn negative_mismatched_non_leader_bytes_are_marked_dissimilar() {
        let mut requests_a = RequestList::new(1, 8);
        let mut requests_b = RequestList::new(2, 8);
        let mut leadership = TestLeadership::default();

        {
            let mut sink_a = LeadershipSink { requests: &mut requests_a, leadership: &mut leadership };
            sink_a.begin_piece(0, 0, 4);
            sink_a.write_block(0, 0, &[1, 2, 3, 4]);
        }

        let mut sink_b = LeadershipSink { requests: &mut requests_b, leadership: &mut leadership };
        sink_b.write_block(0, 0, &[9, 9, 9, 9]);

        assert_eq!(leadership.dissimilar, vec![0]);
    }
}
