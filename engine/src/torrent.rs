//! One torrent's worth of wiring: the disk manager, the established
//! connection table, and the upload/download choke-group that schedules
//! them (spec.md §4.K "the rest of §4.K" — the connection bookkeeping that
//! sits above one download's handshake admission).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use tcore_disk::chunk::{GetFlags, Read as ChunkRead};
use tcore_disk::hashcheck::HashCheckResult;
use tcore_disk::Manager;
use tcore_handshake::manager::{ConnectionList, EraseFlags};
use tcore_handshake::{Outcome, Role};
use tcore_peer::{BlockSource, ConnectionEvent, OutgoingCipher, PeerConnection, RequestSource, WriteOutcome};
use tcore_select::ChokeGroup;
use tcore_util::bt::{PieceIndex, MAX_BLOCK_LEN};
use tcore_util::sha::{InfoHash, ShaHash};

use crate::block_source::ChunkBlockSource;
use crate::choke::{DownloadChokeSlot, SharedConnection, UploadChokeSlot};
use crate::cipher::SessionCiphers;
use crate::error::{EngineError, EngineErrorKind};
use crate::leadership::TorrentLeadership;

struct ConnectionEntry {
    connection: SharedConnection,
    connection_id: u64,
    ciphers: Mutex<Option<SessionCiphers>>,
    /// Gate on `on_tick`'s pipeline replenishment, driven by the
    /// download-direction choke-group (spec.md §4.J's symmetric model has
    /// no wire message for this side; see `crate::choke`'s doc comment).
    download_paused: Arc<AtomicBool>,
    /// The block currently streaming out to this peer, if any; persisted
    /// across `poll_writes` calls so a multi-tick upload resumes where it
    /// left off instead of re-reading from the start of the block.
    upload_source: Mutex<Option<ChunkBlockSource>>,
}

/// Everything needed to drive one torrent's peers: disk I/O, piece
/// leadership, and the choke-group that schedules upload/download access.
pub struct Torrent {
    info_hash: InfoHash,
    manager: Manager,
    connections: ConnectionList<ConnectionEntry>,
    /// Kept alongside `connections` purely for iteration (broadcasting
    /// `have`, running the choke cycle) — `ConnectionList` itself only
    /// supports point lookups, by design (spec.md §4.K's deferred-erase
    /// discipline is about *removal*, not enumeration).
    addrs: HashSet<SocketAddr>,
    upload_choke: ChokeGroup<UploadChokeSlot>,
    download_choke: ChokeGroup<DownloadChokeSlot>,
    leader: HashMap<PieceIndex, (u64, u32)>,
    piece_progress: HashMap<PieceIndex, HashSet<u32>>,
    next_connection_id: u64,
    max_incoming_requests_per_peer: usize,
    /// Piece hashes supplied by the caller (metainfo parsing is out of
    /// scope, spec.md §1) — compared against what the hash-check worker
    /// reports back for each piece (spec.md §8 "SHA1(chunk i) ==
    /// expected_hash[i]").
    expected_hashes: Vec<ShaHash>,
    hash_results: Receiver<HashCheckResult<PieceIndex>>,
}

impl Torrent {
    pub fn new(
        info_hash: InfoHash,
        manager: Manager,
        expected_hashes: Vec<ShaHash>,
        hash_results: Receiver<HashCheckResult<PieceIndex>>,
        max_unchoked_upload: Option<usize>,
        max_unchoked_download: Option<usize>,
        max_incoming_requests_per_peer: usize,
    ) -> Torrent {
        Torrent {
            info_hash,
            manager,
            connections: ConnectionList::new(),
            addrs: HashSet::new(),
            upload_choke: ChokeGroup::new(max_unchoked_upload, None),
            download_choke: ChokeGroup::new(None, max_unchoked_download),
            leader: HashMap::new(),
            piece_progress: HashMap::new(),
            next_connection_id: 0,
            max_incoming_requests_per_peer,
            expected_hashes,
            hash_results,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn has_connection(&self, addr: &SocketAddr) -> bool {
        self.connections.contains(addr)
    }

    fn num_pieces(&self) -> usize {
        self.manager.storage().lock().unwrap().bitfield().len()
    }

    pub fn is_complete(&self) -> bool {
        self.manager.storage().lock().unwrap().bitfield().has_all()
    }

    /// Register a freshly-completed handshake as a live connection.
    pub fn add_connection(&mut self, addr: SocketAddr, outcome: &Outcome, role: Role) -> u64 {
        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        let connection = Arc::new(Mutex::new(PeerConnection::new(connection_id, self.num_pieces(), self.max_incoming_requests_per_peer)));
        let download_paused = Arc::new(AtomicBool::new(true));

        let ciphers = if outcome.encrypted {
            outcome.secret.map(|secret| SessionCiphers::for_role(role, &secret, outcome.info_hash.as_ref()))
        } else {
            None
        };

        self.connections.insert(
            addr,
            ConnectionEntry {
                connection: connection.clone(),
                connection_id,
                ciphers: Mutex::new(ciphers),
                download_paused: download_paused.clone(),
                upload_source: Mutex::new(None),
            },
        );
        self.addrs.insert(addr);

        let _ = self.upload_choke.upload_mut().register(connection_id, UploadChokeSlot::new(connection));
        let _ = self.download_choke.download_mut().register(connection_id, DownloadChokeSlot::new(download_paused));

        connection_id
    }

    /// Drop a connection, deferring the actual removal if `flags` asks for
    /// that (spec.md §4.K "Moving/erasing a download's connections is
    /// sometimes deferred until a safe point").
    pub fn remove_connection(&mut self, addr: SocketAddr, flags: EraseFlags) {
        if let Some(entry) = self.connections.get(&addr) {
            self.upload_choke.upload_mut().remove(entry.connection_id);
            self.download_choke.download_mut().remove(entry.connection_id);
        }
        self.connections.erase(addr, flags);
        self.addrs.remove(&addr);
    }

    pub fn flush_deferred_erasures(&mut self) -> Vec<SocketAddr> {
        self.connections.flush_deferred_erasures()
    }

    /// Feed freshly-read socket bytes from `addr` through the wire protocol,
    /// applying choke/interest and piece-leadership bookkeeping.
    pub fn feed(&mut self, addr: SocketAddr, data: &[u8]) -> Result<Vec<ConnectionEvent>, EngineError> {
        let entry = self.connections.get(&addr).ok_or(EngineErrorKind::UnknownConnection { addr })?;

        let mut plaintext;
        let bytes: &[u8] = {
            let mut ciphers = entry.ciphers.lock().unwrap();
            if let Some(ciphers) = ciphers.as_mut() {
                plaintext = data.to_vec();
                ciphers.incoming.decrypt(&mut plaintext);
                &plaintext
            } else {
                data
            }
        };

        let mut leadership = TorrentLeadership::new(&self.manager, &mut self.leader);
        let (connection_id, events) = {
            let mut connection = entry.connection.lock().unwrap();
            (entry.connection_id, connection.feed(bytes, &mut leadership)?)
        };

        for event in &events {
            self.apply_event(connection_id, event)?;
        }

        Ok(events)
    }

    fn apply_event(&mut self, connection_id: u64, event: &ConnectionEvent) -> Result<(), EngineError> {
        match *event {
            ConnectionEvent::RemoteInterested => {
                self.upload_choke.upload_mut().set_queued(connection_id)?;
            }
            ConnectionEvent::RemoteNotInterested => {
                self.upload_choke.upload_mut().set_not_queued(connection_id)?;
            }
            ConnectionEvent::RemoteUnchoked => {
                self.download_choke.download_mut().set_queued(connection_id)?;
            }
            ConnectionEvent::RemoteChoked => {
                self.download_choke.download_mut().set_not_queued(connection_id)?;
            }
            ConnectionEvent::BlockComplete { index, begin } => {
                self.note_block_complete(index, begin)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Records a downloaded block and, once every block of the piece has
    /// arrived, hands it to the shared hash-check queue (spec.md §4.D/§4.E).
    fn note_block_complete(&mut self, index: PieceIndex, begin: u32) -> Result<(), EngineError> {
        let piece_size = self.manager.storage().lock().unwrap().chunk_index_size(index);

        let progress = self.piece_progress.entry(index).or_default();
        progress.insert(begin);

        let fully_received = expected_block_begins(piece_size).iter().all(|begin| progress.contains(begin));
        if fully_received {
            self.piece_progress.remove(&index);
            self.leader.remove(&index);
            self.manager.queue_hash_check(index)?;
        }
        Ok(())
    }

    /// Drain every hash-check result that has arrived since the last call,
    /// comparing each against the piece's expected hash (spec.md §8 "hash
    /// mismatch: ... `bitfield[7]` remains 0; chunk is re-requested from a
    /// second peer"). A clean match marks the piece complete and
    /// advertises it; a mismatch is just logged — the piece stays at 0 and
    /// the next `BlockComplete` naturally re-triggers a check once the
    /// piece refills.
    pub fn poll_hash_results(&mut self) {
        while let Ok(result) = self.hash_results.try_recv() {
            match self.expected_hashes.get(result.node as usize) {
                Some(expected) if *expected == result.hash => self.on_piece_verified(result.node),
                Some(_) => log::warn!("tcore_engine: piece {} failed hash check, re-requesting", result.node),
                None => log::warn!("tcore_engine: hash-check result for piece {} has no expected hash on record", result.node),
            }
        }
    }

    /// Called once a hash-check result confirms `index` hashes clean: marks
    /// it complete in the file-list and advertises it to every connection
    /// (spec.md §4.C `mark_completed`, §4.H `have`).
    fn on_piece_verified(&mut self, index: PieceIndex) {
        self.manager.mark_completed(index);
        for addr in &self.addrs {
            if let Some(entry) = self.connections.get(addr) {
                entry.connection.lock().unwrap().mark_have(index);
            }
        }
    }

    /// Run one choke-cycle tick for both directions.
    pub fn run_choke_cycle(&mut self, upload_budget: usize, download_budget: usize) {
        self.upload_choke.run_cycle(upload_budget, 0);
        self.download_choke.run_cycle(0, download_budget);
    }

    /// Replenish every unpaused connection's outgoing request pipeline,
    /// begin serving the next queued upload if idle, and drain whatever
    /// bytes are ready to go out this tick.
    pub fn poll_writes<S: RequestSource>(&mut self, download_rate_bytes_per_sec: u64, source: &mut S) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut out = Vec::new();

        for addr in self.addrs.clone() {
            let entry = match self.connections.get(&addr) {
                Some(entry) => entry,
                None => continue,
            };
            let mut connection = entry.connection.lock().unwrap();

            if !entry.download_paused.load(Ordering::SeqCst) {
                connection.on_tick(download_rate_bytes_per_sec, source);
            }

            let mut upload_source = entry.upload_source.lock().unwrap();
            if upload_source.is_none() && connection.write_machine().is_idle() {
                if let Some(request) = connection.pop_upload_request() {
                    connection.write_machine().begin_piece_upload(request.index, request.begin, request.length);
                    *upload_source = self.chunk_block_source(request.index, request.begin, request.length as usize);
                }
            }

            let mut cipher_guard = entry.ciphers.lock().unwrap();
            let cipher = cipher_guard.as_mut().map(|c| &mut c.outgoing as &mut dyn OutgoingCipher);

            let outcome = match upload_source.as_mut() {
                Some(blocks) => connection.write_machine().poll_write(blocks, cipher),
                None => connection.write_machine().poll_write(&mut NullBlockSource, cipher),
            };

            let drained = matches!(upload_source.as_ref(), Some(blocks) if blocks.remaining() == 0);
            if drained {
                *upload_source = None;
            }

            if let WriteOutcome::Bytes(bytes) = outcome {
                if !bytes.is_empty() {
                    out.push((addr, bytes));
                }
            }
        }

        out
    }

    fn chunk_block_source(&self, index: PieceIndex, begin: u32, length: usize) -> Option<ChunkBlockSource> {
        let handle = self.manager.get::<ChunkRead>(index, GetFlags::default()).ok()?;
        Some(ChunkBlockSource::new(handle, begin, length))
    }
}

struct NullBlockSource;
impl BlockSource for NullBlockSource {
    fn remaining(&self) -> usize {
        0
    }
    fn read_into(&mut self, _out: &mut [u8]) -> usize {
        0
    }
}

fn expected_block_begins(piece_size: u64) -> Vec<u32> {
    let mut begins = Vec::new();
    let mut offset = 0u64;
    while offset < piece_size {
        begins.push(offset as u32);
        offset += MAX_BLOCK_LEN as u64;
    }
    begins
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcore_disk::{spawn_hash_check_queue, Manager as DiskManager};
    use tcore_disk::storage::Storage;
    use tcore_handshake::Extensions;
    use tcore_util::sha::ShaHash;

    fn make_torrent(dir: &std::path::Path, num_pieces: u32, chunk_size: u64) -> Torrent {
        let mut storage = Storage::new(chunk_size, num_pieces);
        storage.push_back(dir.join("data"), chunk_size * num_pieces as u64).unwrap();
        storage.open().unwrap();
        let (hash_queue, results) = spawn_hash_check_queue();
        let manager = DiskManager::new(storage, hash_queue);
        Torrent::new(ShaHash::from_bytes(b"info"), manager, vec![ShaHash::default(); num_pieces as usize], results, Some(4), Some(4), 8)
    }

    fn plaintext_outcome(info_hash: ShaHash, peer_id: ShaHash) -> Outcome {
        Outcome { info_hash, remote_peer_id: peer_id, remote_extensions: Extensions::new(), encrypted: false, residual: Vec::new(), secret: None }
    }

    #[test]
    fn positive_add_connection_registers_in_both_choke_queues() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = make_torrent(dir.path(), 4, 16);

        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let outcome = plaintext_outcome(torrent.info_hash(), ShaHash::from_bytes(b"peer"));
        torrent.add_connection(addr, &outcome, Role::Outgoing);

        assert_eq!(torrent.connection_count(), 1);
        assert!(torrent.has_connection(&addr));
    }

    #[test]
    fn positive_remove_connection_clears_choke_queue_membership() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = make_torrent(dir.path(), 4, 16);

        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let outcome = plaintext_outcome(torrent.info_hash(), ShaHash::from_bytes(b"peer"));
        torrent.add_connection(addr, &outcome, Role::Outgoing);
        torrent.remove_connection(addr, EraseFlags::none());

        assert_eq!(torrent.connection_count(), 0);
        assert!(!torrent.has_connection(&addr));
    }

    #[test]
    fn positive_hash_match_marks_piece_complete_and_mismatch_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let mut torrent = make_torrent(dir.path(), 2, 16);
        torrent.expected_hashes[0] = ShaHash::from_bytes(&[0u8; 16]);
        torrent.expected_hashes[1] = ShaHash::from_bytes(b"not what piece 1 actually contains");

        torrent.manager.queue_hash_check(0).unwrap();
        torrent.manager.queue_hash_check(1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        torrent.poll_hash_results();

        assert!(torrent.manager.storage().lock().unwrap().bitfield().contains(0));
        assert!(!torrent.manager.storage().lock().unwrap().bitfield().contains(1));
    }
}
