//! Storage error taxonomy (spec.md §7 "Storage"), grounded on
//! `bip_disk::error`'s `error_chain!` blocks.

use std::io;
use std::path::PathBuf;

use tcore_util::bt::PieceIndex;

error_chain! {
    types {
        StorageError, StorageErrorKind, StorageResultExt, StorageResult;
    }

    foreign_links {
        Io(io::Error);
    }

    errors {
        FileOpenFailed {
            path: PathBuf
        } {
            description("failed to open file")
            display("failed to open file {:?}", path)
        }
        MmapFailed {
            path: PathBuf,
            offset: u64,
            length: usize
        } {
            description("failed to mmap file region")
            display("failed to mmap {:?} at offset {} length {}", path, offset, length)
        }
        WriteFailed {
            path: PathBuf
        } {
            description("failed to write to file")
            display("failed to write to file {:?}", path)
        }
        SyncFailed {
            index: PieceIndex
        } {
            description("msync failed for chunk")
            display("msync failed for chunk {}", index)
        }
        SizeMismatch {
            path: PathBuf,
            expected: u64,
            actual: u64
        } {
            description("existing file size does not match the torrent's declared size")
            display("{:?} is {} bytes, expected {}", path, actual, expected)
        }
        DuplicateFilename {
            path: PathBuf
        } {
            description("two files in the same torrent share a path")
            display("duplicate file path {:?}", path)
        }
        SizeOverflow {
            description("total torrent size overflowed")
        }
        PieceOutOfRange {
            index: PieceIndex
        } {
            description("piece index is out of range for this torrent")
            display("piece index {} is out of range", index)
        }
        InvalidRange {
            offset: u64,
            length: usize
        } {
            description("requested byte range is empty or not aligned within a chunk")
            display("invalid range offset={} length={}", offset, length)
        }
        AlreadyOpen {
            description("storage is already open")
        }
        NotOpen {
            description("storage has not been opened yet")
        }
        NotPresent {
            index: PieceIndex
        } {
            description("chunk does not exist yet and do-not-create was requested")
            display("chunk {} has not been created yet", index)
        }
        Blocked {
            index: PieceIndex
        } {
            description("chunk is currently blocking (held by the hash-check queue)")
            display("chunk {} is blocking and cannot be opened for write", index)
        }
        Errored {
            index: PieceIndex
        } {
            description("chunk previously failed and is in an error state")
            display("chunk {} is in an error state", index)
        }
    }
}
