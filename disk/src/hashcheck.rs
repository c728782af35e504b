//! Component E — Hash-check queue (spec.md §3 "Hash-check entry", §4.E).
//!
//! Grounded on `src/data/hash_check_queue.{h,cc}`: a single FIFO guarded by
//! one mutex, with a worker thread that pops one entry at a time, releases
//! the lock while hashing, then reacquires it to report back. Result
//! delivery crosses back to whichever thread the caller cares about over a
//! `crossbeam_channel`, in the shape `bip_dht::worker::messenger` uses to
//! hand worker-thread output back to the event loop.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tcore_util::sha::{ShaHash, ShaHashBuilder};

use crate::chunk::{ChunkHandle, Hashing};

struct Entry<N> {
    handle: ChunkHandle<Hashing>,
    node: N,
}

/// Delivered to the result channel once a queued chunk finishes hashing
/// (spec.md §4.E "invokes the `chunk_done` slot with (handle, node,
/// 20-byte hash)").
pub struct HashCheckResult<N> {
    pub handle: ChunkHandle<Hashing>,
    pub node: N,
    pub hash: ShaHash,
}

struct Inner<N> {
    queue: Mutex<VecDeque<Entry<N>>>,
    not_empty: Condvar,
    shutdown: Mutex<bool>,
}

/// Cross-thread FIFO of pending chunk handles (spec.md §4.E). `N` is the
/// caller's opaque node token, carried through untouched and handed back
/// alongside the computed hash.
pub struct HashCheckQueue<N> {
    inner: Arc<Inner<N>>,
    result_sender: Sender<HashCheckResult<N>>,
}

impl<N: Send + 'static> HashCheckQueue<N> {
    pub fn new(result_sender: Sender<HashCheckResult<N>>) -> HashCheckQueue<N> {
        HashCheckQueue {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
                shutdown: Mutex::new(false),
            }),
            result_sender,
        }
    }

    /// Append a hashing handle to the queue. The handle must already be a
    /// `Hashing`-typestate handle, so the type system (rather than a
    /// runtime check) guarantees it is blocking concurrent writes.
    pub fn push_back(&self, handle: ChunkHandle<Hashing>, node: N) {
        let mut queue = self.inner.queue.lock().unwrap();
        queue.push_back(Entry { handle, node });
        self.inner.not_empty.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued entry whose node satisfies `matches`, returning
    /// them without hashing. Used to cancel a pending check e.g. when a
    /// torrent is removed before its worker gets to it.
    pub fn remove(&self, mut matches: impl FnMut(&N) -> bool) -> Vec<(ChunkHandle<Hashing>, N)> {
        let mut queue = self.inner.queue.lock().unwrap();
        let mut removed = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());

        for entry in queue.drain(..) {
            if matches(&entry.node) {
                removed.push((entry.handle, entry.node));
            } else {
                remaining.push_back(entry);
            }
        }

        *queue = remaining;
        removed
    }

    fn pop_blocking(&self) -> Option<Entry<N>> {
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(entry) = queue.pop_front() {
                return Some(entry);
            }
            if *self.inner.shutdown.lock().unwrap() {
                return None;
            }
            queue = self.inner.not_empty.wait(queue).unwrap();
        }
    }

    /// Run the worker loop: pop one entry at a time (without holding the
    /// queue lock while hashing), SHA-1 the chunk scattered over its
    /// chunk-parts, and deliver the result. Returns when `shutdown` is
    /// called and the queue has drained.
    fn perform(&self) {
        while let Some(entry) = self.pop_blocking() {
            let hash = entry
                .handle
                .with_chunk(|chunk| {
                    let mut builder = ShaHashBuilder::new();
                    chunk.for_each_byte_range(|bytes| {
                        builder = std::mem::replace(&mut builder, ShaHashBuilder::new()).add_bytes(bytes);
                    });
                    builder.build()
                })
                .unwrap_or_default();

            let result = HashCheckResult { handle: entry.handle, node: entry.node, hash };

            // Best-effort: if the owning thread is gone there's nothing
            // left to deliver to.
            let _ = self.result_sender.send(result);
        }
    }

    pub fn shutdown(&self) {
        *self.inner.shutdown.lock().unwrap() = true;
        self.inner.not_empty.notify_all();
    }

    /// Spawn the worker thread running `perform` in a loop.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = self.clone();
        thread::Builder::new()
            .name("tcore-hashcheck".into())
            .spawn(move || queue.perform())
            .expect("failed to spawn hash-check worker thread")
    }
}

impl<N> Clone for HashCheckQueue<N> {
    fn clone(&self) -> HashCheckQueue<N> {
        HashCheckQueue { inner: self.inner.clone(), result_sender: self.result_sender.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkList, GetFlags};
    use crate::file::Prot;
    use crate::memory::MemoryChunk;
    use memmap2::MmapMut;
    use std::io::Write as _;

    fn list_with_bytes(bytes: &[u8]) -> ChunkList {
        let owned = bytes.to_vec();
        ChunkList::new(
            1,
            owned.len() as u64,
            Box::new(move |_, _: Prot| {
                let mut map = MmapMut::map_anon(owned.len().max(1)).unwrap();
                (&mut map[..owned.len()]).write_all(&owned).unwrap();
                let memory = MemoryChunk::new(map, 0, owned.len());
                Ok(crate::chunk::Chunk::new(vec![crate::chunk::ChunkPart::new(0, 0, memory)]))
            }),
        )
    }

    #[test]
    fn positive_worker_hashes_and_reports_back() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = Arc::new(HashCheckQueue::<u32>::new(tx));
        let worker = queue.spawn_worker();

        let list = list_with_bytes(b"hello world");
        let handle = list.get::<crate::chunk::Hashing>(0, GetFlags::default()).unwrap();
        queue.push_back(handle, 42);

        let result = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(result.node, 42);
        assert_eq!(result.hash, ShaHash::from_bytes(b"hello world"));

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn positive_remove_cancels_before_hashing() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let queue = HashCheckQueue::<u32>::new(tx);

        let list = list_with_bytes(b"data");
        let handle = list.get::<crate::chunk::Hashing>(0, GetFlags::default()).unwrap();
        queue.push_back(handle, 7);

        let removed = queue.remove(|node| *node == 7);
        assert_eq!(removed.len(), 1);
        assert!(queue.is_empty());
    }
}
