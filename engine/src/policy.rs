//! The `AdmissionPolicy` the handshake manager consults on every admitted
//! socket (spec.md §4.K "On handshake success the manager migrates the
//! connection into the target download's connection-list unless the
//! download is finished and the peer is a seeder, or the peer duplicates an
//! existing connection"). Backed directly by the engine's torrent table so
//! there is exactly one source of truth for "which downloads exist" and
//! "who is already connected to them".

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tcore_handshake::AdmissionPolicy;
use tcore_util::sha::InfoHash;

use crate::torrent::Torrent;

pub type TorrentTable = Arc<Mutex<std::collections::HashMap<InfoHash, Torrent>>>;

pub struct TorrentAdmissionPolicy {
    torrents: TorrentTable,
    max_incoming_connections: usize,
}

impl TorrentAdmissionPolicy {
    pub fn new(torrents: TorrentTable, max_incoming_connections: usize) -> TorrentAdmissionPolicy {
        TorrentAdmissionPolicy { torrents, max_incoming_connections }
    }

    fn total_connections(&self) -> usize {
        self.torrents.lock().unwrap().values().map(Torrent::connection_count).sum()
    }
}

impl AdmissionPolicy for TorrentAdmissionPolicy {
    fn can_accept_incoming(&self) -> bool {
        self.total_connections() < self.max_incoming_connections
    }

    fn is_address_allowed(&self, _addr: &SocketAddr) -> bool {
        // No IP allow/deny list in scope (spec.md §1 excludes a tracker/DHT
        // client and the address-filtering UI that would configure one).
        true
    }

    fn accepts_download(&self, info_hash: &InfoHash) -> bool {
        self.torrents.lock().unwrap().contains_key(info_hash)
    }

    fn is_uninteresting_seeder(&self, info_hash: &InfoHash, peer_is_seeder: bool) -> bool {
        if !peer_is_seeder {
            return false;
        }
        self.torrents.lock().unwrap().get(info_hash).map(Torrent::is_complete).unwrap_or(false)
    }

    fn is_duplicate(&self, info_hash: &InfoHash, addr: &SocketAddr) -> bool {
        self.torrents.lock().unwrap().get(info_hash).map(|torrent| torrent.has_connection(addr)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcore_disk::{spawn_hash_check_queue, Manager as DiskManager};
    use tcore_disk::storage::Storage;

    fn table_with_one_torrent(dir: &std::path::Path) -> (TorrentTable, InfoHash) {
        let mut storage = Storage::new(16, 4);
        storage.push_back(dir.join("data"), 64).unwrap();
        storage.open().unwrap();
        let (hash_queue, results) = spawn_hash_check_queue();
        let manager = DiskManager::new(storage, hash_queue);

        let info_hash = InfoHash::from_bytes(b"info");
        let torrent = Torrent::new(info_hash, manager, vec![InfoHash::default(); 4], results, Some(4), Some(4), 8);

        let mut table = std::collections::HashMap::new();
        table.insert(info_hash, torrent);
        (Arc::new(Mutex::new(table)), info_hash)
    }

    #[test]
    fn positive_accepts_download_only_for_registered_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (table, info_hash) = table_with_one_torrent(dir.path());
        let policy = TorrentAdmissionPolicy::new(table, 500);

        assert!(policy.accepts_download(&info_hash));
        assert!(!policy.accepts_download(&InfoHash::from_bytes(b"other")));
    }

    #[test]
    fn positive_can_accept_incoming_respects_global_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _info_hash) = table_with_one_torrent(dir.path());
        let policy = TorrentAdmissionPolicy::new(table, 0);

        assert!(!policy.can_accept_incoming());
    }
}
