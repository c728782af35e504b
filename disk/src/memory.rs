//! Component A — memory-chunk: a contiguous mmap'd byte range with
//! page-aligned metadata, residency and advise/sync primitives (spec.md
//! §3 "Memory-chunk", §4.A).
//!
//! Grounded on `src/data/memory_chunk.{h,cc}` from the original C++ engine;
//! re-expressed on top of `memmap2::MmapMut` instead of a raw `mmap(2)`
//! call, the way `rqbit`'s storage layer and `muhtutorials-bittorrent` both
//! reach for `memmap2` rather than hand-rolling `libc::mmap`.

use std::io;

use memmap2::MmapMut;

/// Advice hints passed through to `madvise(2)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
}

impl Advice {
    fn to_libc(self) -> libc::c_int {
        match self {
            Advice::Normal => libc::MADV_NORMAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::WillNeed => libc::MADV_WILLNEED,
            Advice::DontNeed => libc::MADV_DONTNEED,
        }
    }
}

/// Flush mode passed through to `msync(2)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Sync,
    Async,
    Invalidate,
}

impl SyncMode {
    fn to_libc(self) -> libc::c_int {
        match self {
            SyncMode::Sync => libc::MS_SYNC,
            SyncMode::Async => libc::MS_ASYNC,
            SyncMode::Invalidate => libc::MS_INVALIDATE,
        }
    }
}

/// A contiguous mmap'd byte range (spec.md §3 "Memory-chunk").
///
/// `begin` may sit past `base` because the kernel only maps whole pages:
/// `create_mmap` always rounds the requested offset down to a page boundary
/// and `begin` is the usable start within that mapping.
pub struct MemoryChunk {
    map: MmapMut,
    /// Offset of the caller-visible region within `map`; `0 <= begin_offset
    /// < page_size()` (spec.md §3 invariant "begin - base < page_size").
    begin_offset: usize,
    usable_len: usize,
}

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on supported platforms.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl MemoryChunk {
    /// Wrap an already-created mapping. `begin_offset` is the byte offset
    /// within `map` where caller-visible data starts; `usable_len` is the
    /// number of caller-visible bytes from there.
    pub(crate) fn new(map: MmapMut, begin_offset: usize, usable_len: usize) -> MemoryChunk {
        debug_assert!(begin_offset < page_size() || page_size() == 0);
        debug_assert!(begin_offset + usable_len <= map.len());

        MemoryChunk { map, begin_offset, usable_len }
    }

    pub fn page_size() -> usize {
        page_size()
    }

    /// Number of caller-visible bytes in this chunk.
    pub fn size(&self) -> usize {
        self.usable_len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[self.begin_offset..self.begin_offset + self.usable_len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[self.begin_offset..self.begin_offset + self.usable_len]
    }

    /// `(offset, length)` describes a non-empty range that stays within
    /// the usable region.
    pub fn is_valid_range(&self, offset: usize, length: usize) -> bool {
        length != 0 && offset.checked_add(length).map_or(false, |end| end <= self.usable_len)
    }

    /// Number of pages `[offset, offset+length)` touches, accounting for
    /// the page-alignment padding before `begin`.
    pub fn pages_touched(&self, offset: usize, length: usize) -> usize {
        let page = page_size().max(1);
        let aligned_offset = (self.begin_offset + offset) % page;
        (length + aligned_offset + page - 1) / page
    }

    fn aligned_range(&self, offset: usize, length: usize) -> (usize, usize) {
        let page = page_size().max(1);
        let abs_offset = self.begin_offset + offset;
        let aligned_start = (abs_offset / page) * page;
        let aligned_end = ((abs_offset + length + page - 1) / page) * page;
        (aligned_start, aligned_end - aligned_start)
    }

    /// Advise the kernel about an access pattern for `[offset, offset +
    /// length)`. Returns `Ok(false)` (not a fatal error) when the range was
    /// not validated by the caller and the syscall failed; a validated
    /// range that fails is a bug and is surfaced as `Err`, per spec.md
    /// §4.A "Failure of the underlying syscall maps to a fatal error if
    /// the range was validated (indicates bug), otherwise to a boolean
    /// return."
    pub fn advise(&self, offset: usize, length: usize, hint: Advice) -> io::Result<bool> {
        let validated = self.is_valid_range(offset, length);
        let (aligned_offset, aligned_len) = self.aligned_range(offset, length);

        let ptr = unsafe { self.map.as_ptr().add(aligned_offset) as *mut libc::c_void };
        let ret = unsafe { libc::madvise(ptr, aligned_len, hint.to_libc()) };

        if ret == 0 {
            Ok(true)
        } else if validated {
            Err(io::Error::last_os_error())
        } else {
            Ok(false)
        }
    }

    pub fn sync(&self, offset: usize, length: usize, mode: SyncMode) -> io::Result<bool> {
        let validated = self.is_valid_range(offset, length);
        let (aligned_offset, aligned_len) = self.aligned_range(offset, length);

        let ptr = unsafe { self.map.as_ptr().add(aligned_offset) as *mut libc::c_void };
        let ret = unsafe { libc::msync(ptr, aligned_len, mode.to_libc()) };

        if ret == 0 {
            Ok(true)
        } else if validated {
            Err(io::Error::last_os_error())
        } else {
            Ok(false)
        }
    }

    /// Populate `buffer` with one byte per page covering `[offset, offset +
    /// length)`: non-zero where the page is resident in core.
    pub fn incore(&self, buffer: &mut Vec<u8>, offset: usize, length: usize) -> io::Result<()> {
        let (aligned_offset, aligned_len) = self.aligned_range(offset, length);
        let page = page_size().max(1);
        let num_pages = (aligned_len + page - 1) / page;

        buffer.clear();
        buffer.resize(num_pages, 0);

        let ptr = unsafe { self.map.as_ptr().add(aligned_offset) as *mut libc::c_void };

        #[cfg(target_os = "linux")]
        let ret = unsafe { libc::mincore(ptr, aligned_len, buffer.as_mut_ptr()) };
        #[cfg(not(target_os = "linux"))]
        let ret = {
            // mincore's signature differs across BSD/macOS (char* vector);
            // the bit semantics are identical so we reuse the same buffer.
            unsafe { libc::mincore(ptr, aligned_len, buffer.as_mut_ptr() as *mut i8) }
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn is_incore(&self, offset: usize, length: usize) -> io::Result<bool> {
        let mut buf = Vec::new();
        self.incore(&mut buf, offset, length)?;
        Ok(buf.iter().all(|&byte| byte & 1 != 0))
    }

    pub fn flush_data(&self) {
        let _ = self.map.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mapped(len: usize) -> MemoryChunk {
        let mut map = MmapMut::map_anon(len).unwrap();
        (&mut map[..]).write_all(&vec![0u8; len]).unwrap();
        MemoryChunk::new(map, 0, len)
    }

    #[test]
    fn positive_is_valid_range() {
        let chunk = mapped(4096);
        assert!(chunk.is_valid_range(0, 4096));
        assert!(chunk.is_valid_range(100, 10));
        assert!(!chunk.is_valid_range(0, 0));
        assert!(!chunk.is_valid_range(4090, 100));
    }

    #[test]
    fn positive_pages_touched_single_page() {
        let chunk = mapped(8192);
        assert_eq!(chunk.pages_touched(0, 100), 1);
    }

    #[test]
    fn positive_pages_touched_spans_pages() {
        let chunk = mapped(8192);
        let page = MemoryChunk::page_size();
        assert_eq!(chunk.pages_touched(page - 10, 20), 2);
    }

    #[test]
    fn positive_advise_and_sync_succeed_on_valid_range() {
        let chunk = mapped(8192);
        assert!(chunk.advise(0, 100, Advice::WillNeed).unwrap());
        assert!(chunk.sync(0, 100, SyncMode::Async).unwrap());
    }

    #[test]
    fn positive_read_write_round_trip() {
        let mut chunk = mapped(16);
        chunk.as_mut_slice()[0] = 0xAB;
        assert_eq!(chunk.as_slice()[0], 0xAB);
    }
}
