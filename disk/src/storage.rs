//! Component C — Storage / file-list (spec.md §4.C).
//!
//! Maps a torrent's logical byte stream onto an ordered list of files and
//! produces per-piece scatter/gather chunks. Grounded on
//! `src/data/storage_consolidator.cc` (`push_back`, `get_chunk`,
//! `get_chunk_part`) and `src/torrent/data/file_list.cc`'s file-entry
//! bookkeeping from the original engine.

use std::collections::HashSet;
use std::path::PathBuf;

use tcore_util::bitfield::Bitfield;

use crate::chunk::{Chunk, ChunkPart};
use crate::error::{StorageError, StorageErrorKind};
use crate::file::{FileHandle, Prot};

/// One file in the torrent's logical layout (spec.md §3 "File entry").
pub struct FileEntry {
    path: PathBuf,
    /// Byte offset of this file within the torrent's logical byte stream.
    offset: u64,
    length: u64,
    first_chunk: u32,
    last_chunk: u32,
    priority: FilePriority,
    completed_pieces: usize,
    /// Number of leading path components this file shares with its
    /// neighbor, used by callers to group files in a UI tree.
    match_depth: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilePriority {
    Off,
    Normal,
    High,
}

impl FileEntry {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn first_chunk(&self) -> u32 {
        self.first_chunk
    }

    pub fn last_chunk(&self) -> u32 {
        self.last_chunk
    }

    pub fn priority(&self) -> FilePriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: FilePriority) {
        self.priority = priority;
    }

    pub fn completed_pieces(&self) -> usize {
        self.completed_pieces
    }

    pub fn match_depth(&self) -> usize {
        self.match_depth
    }

    pub fn num_pieces(&self) -> usize {
        (self.last_chunk - self.first_chunk + 1) as usize
    }

    /// Whether an empty trailing path component, i.e. this entry
    /// represents an empty directory rather than a file (spec.md §4.C,
    /// §6 "an empty trailing path component means an empty directory").
    pub fn is_empty_directory_marker(&self) -> bool {
        self.path.file_name().map_or(true, |n| n.is_empty()) && self.length == 0
    }
}

/// Holds the immutable file layout and the torrent's chunk size, and
/// produces per-piece chunks on demand (spec.md §4.C).
pub struct Storage {
    chunk_size: u64,
    total_size: u64,
    num_pieces: u32,
    files: Vec<FileEntry>,
    handles: Vec<FileHandle>,
    bitfield: Bitfield,
    wanted_chunks: usize,
    is_open: bool,
}

impl Storage {
    pub fn new(chunk_size: u64, num_pieces: u32) -> Storage {
        Storage {
            chunk_size,
            total_size: 0,
            num_pieces,
            files: Vec::new(),
            handles: Vec::new(),
            bitfield: Bitfield::new(num_pieces as usize),
            wanted_chunks: num_pieces as usize,
            is_open: false,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn wanted_chunks(&self) -> usize {
        self.wanted_chunks
    }

    /// Append a file to the layout; `size` is the file's declared length.
    /// Sum overflow is fatal per spec.md §4.C.
    pub fn push_back(&mut self, path: PathBuf, size: u64) -> Result<(), StorageError> {
        if self.is_open {
            return Err(StorageError::from_kind(StorageErrorKind::AlreadyOpen));
        }

        if self.files.iter().any(|f| f.path == path) {
            return Err(StorageError::from_kind(StorageErrorKind::DuplicateFilename { path }));
        }

        let new_total = self
            .total_size
            .checked_add(size)
            .ok_or_else(|| StorageError::from_kind(StorageErrorKind::SizeOverflow))?;

        let first_chunk = (self.total_size / self.chunk_size) as u32;
        let last_byte = new_total.saturating_sub(1);
        let last_chunk = if size == 0 {
            first_chunk
        } else {
            (last_byte / self.chunk_size) as u32
        };

        let match_depth = path
            .parent()
            .map(|p| p.components().count())
            .unwrap_or(0);

        self.files.push(FileEntry {
            path,
            offset: self.total_size,
            length: size,
            first_chunk,
            last_chunk,
            priority: FilePriority::Normal,
            completed_pieces: 0,
            match_depth,
        });
        self.total_size = new_total;

        Ok(())
    }

    /// Create directories and open each file; duplicate paths (checked in
    /// `push_back`) and size mismatches on pre-existing files fail fast.
    /// Idempotent.
    pub fn open(&mut self) -> Result<(), StorageError> {
        if self.is_open {
            return Ok(());
        }

        self.handles = self
            .files
            .iter()
            .map(|f| FileHandle::new(f.path.clone()))
            .collect();

        for (entry, handle) in self.files.iter().zip(self.handles.iter_mut()) {
            if entry.is_empty_directory_marker() {
                continue;
            }

            handle.prepare(Prot::READ_WRITE)?;

            let existing = handle.size().unwrap_or(0);
            if existing != entry.length {
                if existing == 0 {
                    handle.resize(entry.length)?;
                } else {
                    return Err(StorageError::from_kind(StorageErrorKind::SizeMismatch {
                        path: entry.path.clone(),
                        expected: entry.length,
                        actual: existing,
                    }));
                }
            }
        }

        self.is_open = true;
        Ok(())
    }

    fn chunk_index_range(&self, index: u32) -> (u64, u64) {
        let first = index as u64 * self.chunk_size;
        let last = ((index as u64 + 1) * self.chunk_size).min(self.total_size);
        (first, last)
    }

    /// Length of piece `index`, accounting for a possibly-shorter final
    /// piece (spec.md §8 "Boundary behaviors").
    pub fn chunk_index_size(&self, index: u32) -> u64 {
        let (first, last) = self.chunk_index_range(index);
        last - first
    }

    /// Locate the first file covering `offset`, then successively map each
    /// contiguous sub-range until `length` bytes are satisfied (spec.md
    /// §4.C). Zero-length files are skipped without being mapped. A
    /// partial failure drops the whole chunk (all earlier parts are
    /// dropped along with it).
    pub fn create_chunk(&mut self, offset: u64, length: u64, prot: Prot) -> Result<Chunk, StorageError> {
        if !self.is_open {
            return Err(StorageError::from_kind(StorageErrorKind::NotOpen));
        }
        if length == 0 || offset + length > self.total_size {
            return Err(StorageError::from_kind(StorageErrorKind::InvalidRange {
                offset,
                length: length as usize,
            }));
        }

        let mut parts = Vec::new();
        let mut cursor = offset;
        let end = offset + length;

        let start_index = self
            .files
            .iter()
            .position(|f| cursor < f.offset + f.length || (f.length == 0 && cursor == f.offset))
            .ok_or_else(|| StorageError::from_kind(StorageErrorKind::InvalidRange { offset, length: length as usize }))?;

        for file_index in start_index..self.files.len() {
            if cursor >= end {
                break;
            }

            let entry = &self.files[file_index];
            if entry.length == 0 {
                continue;
            }
            if cursor < entry.offset {
                // Gap: shouldn't happen for a well-formed layout, but bail
                // cleanly rather than mapping the wrong file.
                return Err(StorageError::from_kind(StorageErrorKind::InvalidRange { offset, length: length as usize }));
            }

            let file_relative_offset = cursor - entry.offset;
            let available_in_file = entry.length - file_relative_offset;
            let remaining = end - cursor;
            let take = available_in_file.min(remaining);

            let handle = &self.handles[file_index];
            let mmap = handle.create_mmap(file_relative_offset, take as usize, prot)?;

            parts.push(ChunkPart::new(file_index, file_relative_offset, mmap));
            cursor += take;
        }

        if cursor != end {
            return Err(StorageError::from_kind(StorageErrorKind::InvalidRange { offset, length: length as usize }));
        }

        Ok(Chunk::new(parts))
    }

    /// Create a chunk for piece `index`, accounting for the possibly
    /// shorter final piece.
    pub fn create_chunk_index(&mut self, index: u32, prot: Prot) -> Result<Chunk, StorageError> {
        if index >= self.num_pieces {
            return Err(StorageError::from_kind(StorageErrorKind::PieceOutOfRange { index }));
        }

        let (first, last) = self.chunk_index_range(index);
        self.create_chunk(first, last - first, prot)
    }

    /// Mark piece `index` complete: sets the bit, increments per-file
    /// completion counters for files overlapping the piece, and decrements
    /// `wanted_chunks` iff the piece was wanted (spec.md §4.C).
    pub fn mark_completed(&mut self, index: u32) -> bool {
        if !self.bitfield.set(index as usize) {
            return false;
        }

        let mut was_wanted = false;
        for file in self.files.iter_mut() {
            if index >= file.first_chunk && index <= file.last_chunk {
                file.completed_pieces += 1;
                if file.priority != FilePriority::Off {
                    was_wanted = true;
                }
            }
        }

        if was_wanted && self.wanted_chunks > 0 {
            self.wanted_chunks -= 1;
        }

        true
    }

    /// Distinct file paths currently tracked, for duplicate-detection in
    /// callers building up a layout incrementally.
    pub fn file_paths(&self) -> HashSet<&std::path::Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positive_chunk_index_size_handles_short_final_piece() {
        let mut storage = Storage::new(16, 3);
        storage.push_back(PathBuf::from("a"), 40).unwrap();

        assert_eq!(storage.chunk_index_size(0), 16);
        assert_eq!(storage.chunk_index_size(1), 16);
        assert_eq!(storage.chunk_index_size(2), 8);
    }

    #[test]
    fn negative_duplicate_path_fails() {
        let mut storage = Storage::new(16, 1);
        storage.push_back(PathBuf::from("a"), 16).unwrap();
        assert!(storage.push_back(PathBuf::from("a"), 16).is_err());
    }

    #[test]
    fn negative_overflow_is_fatal() {
        let mut storage = Storage::new(16, 1);
        storage.push_back(PathBuf::from("a"), u64::MAX - 1).unwrap();
        assert!(storage.push_back(PathBuf::from("b"), 2).is_err());
    }

    #[test]
    fn positive_create_chunk_skips_zero_length_file() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::new(16, 2);
        storage.push_back(dir.path().join("empty"), 0).unwrap();
        storage.push_back(dir.path().join("data"), 32).unwrap();
        storage.open().unwrap();

        let chunk = storage.create_chunk_index(0, Prot::READ_WRITE).unwrap();
        assert_eq!(chunk.parts().len(), 1);
        assert_eq!(chunk.parts()[0].file_index(), 1);
    }

    #[test]
    fn positive_mark_completed_updates_file_counters() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::new(16, 4);
        storage.push_back(dir.path().join("a"), 32).unwrap();
        storage.push_back(dir.path().join("b"), 32).unwrap();
        storage.open().unwrap();

        assert!(storage.mark_completed(1));
        assert_eq!(storage.files()[0].completed_pieces(), 1);
        assert_eq!(storage.files()[1].completed_pieces(), 0);

        assert!(storage.mark_completed(2));
        assert_eq!(storage.files()[1].completed_pieces(), 1);
    }

    #[test]
    fn negative_mark_completed_twice_is_refused() {
        let dir = tempdir().unwrap();
        let mut storage = Storage::new(16, 2);
        storage.push_back(dir.path().join("a"), 32).unwrap();
        storage.open().unwrap();

        assert!(storage.mark_completed(0));
        assert!(!storage.mark_completed(0));
    }
}
