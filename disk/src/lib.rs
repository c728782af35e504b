//! Chunk / storage layer and hash-check pipeline (spec.md §2 components
//! A–E): memory-chunks, file handles with LRU eviction, the file-list that
//! turns a logical byte range into scatter/gather chunks, a per-torrent
//! chunk-list cache, and the cross-thread hash-check queue.
//!
//! Grounded on `bip_disk::disk::manager::DiskManager` for the overall shape
//! of tying these pieces into one per-torrent handle, and on the original
//! engine's `src/data/*` for the algorithms each piece implements.

#[macro_use]
extern crate error_chain;

pub mod chunk;
pub mod error;
pub mod file;
pub mod hashcheck;
pub mod memory;
pub mod storage;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use tcore_util::bt::PieceIndex;

use chunk::{Chunk, ChunkAccess, ChunkHandle, ChunkList, GetFlags, Hashing};
use error::StorageError;
use file::Prot;
use hashcheck::{HashCheckQueue, HashCheckResult};
use storage::Storage;

/// Ties a torrent's `Storage` (component C) to its `ChunkList` (component
/// D), and exposes the hash-check queue (component E) it shares with
/// every other torrent's manager. `Storage` lives behind a mutex because
/// `ChunkList`'s lazy `create_chunk` callback needs its own handle to it.
pub struct Manager {
    storage: Arc<Mutex<Storage>>,
    chunks: ChunkList,
    hash_queue: Arc<HashCheckQueue<PieceIndex>>,
}

impl Manager {
    /// `storage` must already be `open()`ed. `hash_queue` is shared process-
    /// wide: one worker thread services every torrent's hash checks, as the
    /// original engine's single `HashCheckQueue` does.
    pub fn new(storage: Storage, hash_queue: Arc<HashCheckQueue<PieceIndex>>) -> Manager {
        let chunk_size = storage.chunk_size();
        let num_pieces = storage.bitfield().len() as u32;
        let storage = Arc::new(Mutex::new(storage));

        let create_files = storage.clone();
        let create_chunk: Box<dyn Fn(u32, Prot) -> Result<Chunk, StorageError> + Send + Sync> =
            Box::new(move |index, prot| create_files.lock().unwrap().create_chunk_index(index, prot));

        let chunks = ChunkList::new(num_pieces, chunk_size, create_chunk);

        Manager { storage, chunks, hash_queue }
    }

    pub fn storage(&self) -> Arc<Mutex<Storage>> {
        self.storage.clone()
    }

    pub fn chunks(&self) -> &ChunkList {
        &self.chunks
    }

    /// Obtain a handle to piece `index` (spec.md §4.D `get`).
    pub fn get<S: ChunkAccess>(&self, index: u32, flags: GetFlags) -> Result<ChunkHandle<S>, StorageError> {
        self.chunks.get::<S>(index, flags)
    }

    /// Queue piece `index` for hashing on the shared worker thread. Fails
    /// if another reader/writer is already holding it in a way that
    /// conflicts with a blocking handle (spec.md §4.E).
    pub fn queue_hash_check(&self, index: PieceIndex) -> Result<(), StorageError> {
        let handle = self.chunks.get::<Hashing>(index, GetFlags::default())?;
        self.hash_queue.push_back(handle, index);
        Ok(())
    }

    /// Periodic maintenance: flush dirty chunks older than `threshold`
    /// (spec.md §4.D `sync_chunks`).
    pub fn sync_chunks(&self, threshold: Duration, evict_on_success: bool) -> Vec<PieceIndex> {
        self.chunks.sync_chunks(threshold, evict_on_success)
    }

    /// Mark piece `index` complete in the underlying file-list (spec.md
    /// §4.C `mark_completed`).
    pub fn mark_completed(&self, index: PieceIndex) -> bool {
        self.storage.lock().unwrap().mark_completed(index)
    }
}

/// Spawn the process-wide hash-check worker and return the queue handle
/// every torrent's `Manager` shares, plus the channel its results arrive
/// on.
pub fn spawn_hash_check_queue() -> (Arc<HashCheckQueue<PieceIndex>>, crossbeam_channel::Receiver<HashCheckResult<PieceIndex>>) {
    let (tx, rx): (Sender<HashCheckResult<PieceIndex>>, _) = crossbeam_channel::unbounded();
    let queue = Arc::new(HashCheckQueue::new(tx));
    queue.spawn_worker();
    (queue, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positive_manager_round_trips_a_hash_check() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::new(16, 1);
        storage.push_back(dir.path().join("a"), 16).unwrap();
        storage.open().unwrap();

        let (hash_queue, results) = spawn_hash_check_queue();
        let manager = Manager::new(storage, hash_queue);

        {
            let handle = manager.get::<chunk::Write>(0, GetFlags::default()).unwrap();
            handle.with_chunk_mut(|chunk| {
                chunk.parts_mut()[0].memory_mut().as_mut_slice().copy_from_slice(&[7u8; 16]);
            });
        }

        manager.queue_hash_check(0).unwrap();

        let result = results.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.node, 0);
        assert_eq!(result.hash, tcore_util::sha::ShaHash::from_bytes(&[7u8; 16]));
    }

    #[test]
    fn positive_mark_completed() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::new(16, 1);
        storage.push_back(dir.path().join("a"), 16).unwrap();
        storage.open().unwrap();

        let (hash_queue, _results) = spawn_hash_check_queue();
        let manager = Manager::new(storage, hash_queue);

        assert!(manager.mark_completed(0));
    }
}
