//! Component B — File / file-manager (spec.md §4.B).
//!
//! Grounded on `src/data/file.{h,cc}` and `src/data/file_manager.{h,cc}`
//! from the original engine, and on `bip_disk::disk::fs::cache::file_handle`
//! for the LRU-eviction shape (there implemented over file *handles*; here
//! applied to raw, protection-tagged file descriptors as the original does).

use std::collections::HashMap;
use std::fs::{File as StdFile, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use lru::LruCache;
use memmap2::MmapOptions;

use crate::error::{StorageError, StorageErrorKind};
use crate::memory::MemoryChunk;

/// Protection bits a file (or a chunk mapped from it) was opened/mapped
/// with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
}

impl Prot {
    pub const READ: Prot = Prot { read: true, write: false };
    pub const READ_WRITE: Prot = Prot { read: true, write: true };

    pub fn satisfies(&self, requested: Prot) -> bool {
        (!requested.read || self.read) && (!requested.write || self.write)
    }
}

/// One file within a torrent's on-disk layout.
pub struct FileHandle {
    path: PathBuf,
    prot: Option<Prot>,
    file: Option<StdFile>,
    last_touched: Instant,
}

impl FileHandle {
    pub fn new(path: PathBuf) -> FileHandle {
        FileHandle { path, prot: None, file: None, last_touched: Instant::now() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Ensure the file is open with at least `requested` protection,
    /// opening (or reopening with wider permissions) as needed. Updates
    /// the last-touched timestamp used for LRU eviction.
    pub fn prepare(&mut self, requested: Prot) -> Result<(), StorageError> {
        self.last_touched = Instant::now();

        let needs_open = match self.prot {
            Some(prot) => !prot.satisfies(requested),
            None => true,
        };

        if needs_open {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StorageError::with_chain(e, StorageErrorKind::FileOpenFailed { path: self.path.clone() }))?;
                }
            }

            let file = OpenOptions::new()
                .read(true)
                .write(requested.write)
                .create(true)
                .open(&self.path)
                .map_err(|e| StorageError::with_chain(e, StorageErrorKind::FileOpenFailed { path: self.path.clone() }))?;

            self.file = Some(file);
            self.prot = Some(requested);
        }

        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    pub fn close(&mut self) {
        self.file = None;
        self.prot = None;
    }

    pub fn size(&self) -> io::Result<u64> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not open"))?
            .metadata()
            .map(|m| m.len())
    }

    /// Best-effort allocation: try `fallocate`/`posix_fallocate`, falling
    /// back to truncate + a 1-byte write at `size - 1` for filesystems that
    /// reject truncate-grow (spec.md §4.B, §8 scenario 6).
    pub fn resize(&mut self, size: u64) -> Result<(), StorageError> {
        use std::io::{Seek, SeekFrom, Write};

        let file = self
            .file
            .as_ref()
            .ok_or_else(|| StorageError::from_kind(StorageErrorKind::NotOpen))?;

        let fallocate_ok = unsafe {
            #[cfg(target_os = "linux")]
            {
                use std::os::unix::io::AsRawFd;
                libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) == 0
            }
            #[cfg(not(target_os = "linux"))]
            {
                false
            }
        };

        if fallocate_ok {
            return Ok(());
        }

        // Fall back to truncate, then, if the filesystem silently refuses
        // to grow a sparse file on truncate alone, force allocation with a
        // single trailing byte write.
        file.set_len(size)
            .map_err(|e| StorageError::with_chain(e, StorageErrorKind::WriteFailed { path: self.path.clone() }))?;

        let actual = file
            .metadata()
            .map_err(|e| StorageError::with_chain(e, StorageErrorKind::WriteFailed { path: self.path.clone() }))?
            .len();

        if actual < size && size > 0 {
            let file_mut = self.file.as_ref().unwrap();
            file_mut
                .seek(SeekFrom::Start(size - 1))
                .map_err(|e| StorageError::with_chain(e, StorageErrorKind::WriteFailed { path: self.path.clone() }))?;
            file_mut
                .write_all(&[0u8])
                .map_err(|e| StorageError::with_chain(e, StorageErrorKind::WriteFailed { path: self.path.clone() }))?;
        }

        Ok(())
    }

    /// Map `[offset, offset + length)` of this file. Refuses if it would
    /// run past the file's declared size; pages the mapping to a page
    /// boundary internally, returning a `MemoryChunk` whose usable region
    /// starts exactly at the requested offset.
    pub fn create_mmap(&self, offset: u64, length: usize, prot: Prot) -> Result<MemoryChunk, StorageError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| StorageError::from_kind(StorageErrorKind::NotOpen))?;

        debug_assert!(self.prot.map_or(false, |open_prot| open_prot.satisfies(prot)));

        let file_size = self
            .size()
            .map_err(|e| StorageError::with_chain(e, StorageErrorKind::MmapFailed { path: self.path.clone(), offset, length }))?;

        if offset.checked_add(length as u64).map_or(true, |end| end > file_size) {
            return Err(StorageError::from_kind(StorageErrorKind::InvalidRange { offset, length }));
        }

        let page = MemoryChunk::page_size() as u64;
        let aligned_offset = (offset / page) * page;
        let begin_offset = (offset - aligned_offset) as usize;
        let map_len = begin_offset + length;

        let mut options = MmapOptions::new();
        options.offset(aligned_offset).len(map_len);

        // The mapping is always taken read-write; `prot` governs whether
        // the chunk built on top of it is handed out for writing (see
        // `ChunkHandle<Write>` in `chunk.rs`), not whether the kernel
        // mapping itself can be mutated.
        let map = unsafe { options.map_mut(file) }
            .map_err(|e| StorageError::with_chain(e, StorageErrorKind::MmapFailed { path: self.path.clone(), offset, length }))?;

        Ok(MemoryChunk::new(map, begin_offset, length))
    }
}

/// Owns a bounded set of open files, evicting the least-recently-touched
/// file when the open-descriptor cap is reached (spec.md §4.B).
pub struct FileManager {
    max_open: usize,
    open_order: LruCache<PathBuf, ()>,
}

impl FileManager {
    pub fn new(max_open: usize) -> FileManager {
        FileManager { max_open, open_order: LruCache::new(std::num::NonZeroUsize::new(max_open.max(1)).unwrap()) }
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Record that `path` was just opened/touched, evicting and closing
    /// the least-recently-touched file among `files` if the cap is
    /// exceeded.
    pub fn note_touched(&mut self, path: &Path, files: &mut HashMap<PathBuf, FileHandle>) {
        self.open_order.put(path.to_path_buf(), ());

        while self.open_order.len() > self.max_open {
            if let Some((evict_path, _)) = self.open_order.pop_lru() {
                if let Some(handle) = files.get_mut(&evict_path) {
                    handle.close();
                }
            } else {
                break;
            }
        }
    }

    /// Idempotently forget a closed file.
    pub fn note_closed(&mut self, path: &Path) {
        self.open_order.pop(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positive_prepare_then_resize_then_mmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.dat");

        let mut handle = FileHandle::new(path);
        handle.prepare(Prot::READ_WRITE).unwrap();
        handle.resize(16).unwrap();

        assert_eq!(handle.size().unwrap(), 16);

        let chunk = handle.create_mmap(0, 16, Prot::READ_WRITE).unwrap();
        assert_eq!(chunk.size(), 16);
    }

    #[test]
    fn positive_resize_fallback_reports_correct_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.dat");

        let mut handle = FileHandle::new(path);
        handle.prepare(Prot::READ_WRITE).unwrap();
        handle.resize(5 * 1024 * 1024).unwrap();

        assert!(handle.size().unwrap() >= 5 * 1024 * 1024);

        let page = MemoryChunk::page_size();
        let chunk = handle
            .create_mmap(5 * 1024 * 1024 - page as u64, page, Prot::READ)
            .unwrap();
        assert_eq!(chunk.size(), page);
    }

    #[test]
    fn negative_mmap_past_size_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.dat");

        let mut handle = FileHandle::new(path);
        handle.prepare(Prot::READ_WRITE).unwrap();
        handle.resize(4).unwrap();

        assert!(handle.create_mmap(0, 16, Prot::READ_WRITE).is_err());
    }

    #[test]
    fn positive_manager_evicts_least_recently_touched() {
        let dir = tempdir().unwrap();
        let mut manager = FileManager::new(2);
        let mut files = HashMap::new();

        for name in ["a", "b", "c"] {
            let path = dir.path().join(name);
            let mut handle = FileHandle::new(path.clone());
            handle.prepare(Prot::READ).unwrap();
            files.insert(path.clone(), handle);
            manager.note_touched(&path, &mut files);
        }

        let a_path = dir.path().join("a");
        assert!(!files.get(&a_path).unwrap().is_open());
        let c_path = dir.path().join("c");
        assert!(files.get(&c_path).unwrap().is_open());
    }
}
