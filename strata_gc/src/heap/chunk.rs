//! Nursery chunks.
//!
//! The nursery is a list of fixed-size chunks mapped straight from the OS.
//! Each chunk ends with a small trailer, so only `CHUNK_USABLE_SIZE` bytes
//! hold cells:
//!
//! ```text
//! +--------------------------------------------+---------+
//! |              cells (bump allocated)        | trailer |
//! +--------------------------------------------+---------+
//! ^ start                        usable_end ^
//! ```

use std::ptr::NonNull;

/// Size of one nursery chunk.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// OS page size assumed for sub-chunk sizing and decommit.
pub const PAGE_SIZE: usize = 4096;

/// Marker written into every trailer.
const CHUNK_MAGIC: usize = 0x5354_5241_4e55_5253;

/// Byte written over fresh nursery memory.
pub const FRESH_NURSERY_PATTERN: u8 = 0x2F;

/// Byte written over nursery memory after a collection.
pub const SWEPT_NURSERY_PATTERN: u8 = 0x2B;

/// Lives in the last bytes of every chunk.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkTrailer {
    magic: usize,
    chunk_base: usize,
}

/// Size of the trailer.
pub const CHUNK_TRAILER_SIZE: usize = std::mem::size_of::<ChunkTrailer>();

/// Bytes of a chunk available for cells.
pub const CHUNK_USABLE_SIZE: usize = CHUNK_SIZE - CHUNK_TRAILER_SIZE;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Round a nursery size to the nearest whole number of chunks, or of pages
/// when below one chunk. Never returns less than one step.
pub fn round_size(size: usize) -> usize {
    let step = if size >= CHUNK_SIZE { CHUNK_SIZE } else { PAGE_SIZE };
    let rounded = round_down(size.saturating_add(step / 2), step);
    rounded.max(step)
}

/// One mapped nursery chunk. Unmapped on drop.
pub struct NurseryChunk {
    base: NonNull<u8>,
}

// Safety: a chunk is plain memory. Ownership moves between the nursery and
// the decommit task, never shared.
unsafe impl Send for NurseryChunk {}

impl NurseryChunk {
    /// Map a fresh chunk. Returns `None` if the OS refuses.
    pub fn allocate() -> Option<Self> {
        let base = NonNull::new(platform::map_chunk())?;
        let chunk = Self { base };
        // Safety: the trailer lies inside the mapping.
        unsafe {
            chunk.trailer_ptr().write(ChunkTrailer {
                magic: CHUNK_MAGIC,
                chunk_base: base.as_ptr() as usize,
            });
        }
        Some(chunk)
    }

    #[inline]
    fn trailer_ptr(&self) -> *mut ChunkTrailer {
        // Safety: CHUNK_USABLE_SIZE is in bounds.
        unsafe { self.base.as_ptr().add(CHUNK_USABLE_SIZE) as *mut ChunkTrailer }
    }

    /// Address of the first byte.
    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last byte usable for cells.
    #[inline]
    pub fn usable_end(&self) -> usize {
        self.start() + CHUNK_USABLE_SIZE
    }

    /// Whether `addr` lies in the cell area.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.usable_end()
    }

    /// Whether the trailer still identifies this chunk.
    pub fn trailer_is_valid(&self) -> bool {
        // Safety: the trailer is inside the mapping and never decommitted.
        let trailer = unsafe { &*self.trailer_ptr() };
        trailer.magic == CHUNK_MAGIC && trailer.chunk_base == self.start()
    }

    /// Fill `[offset, offset + len)` with `pattern`.
    pub fn poison(&self, offset: usize, len: usize, pattern: u8) {
        debug_assert!(offset + len <= CHUNK_USABLE_SIZE);
        // Safety: range checked above.
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr().add(offset), pattern, len);
        }
    }

    /// Release the physical pages after `offset`. The trailer page stays.
    pub fn decommit_from(&self, offset: usize) -> bool {
        decommit_chunk_tail(self.start(), offset)
    }
}

impl Drop for NurseryChunk {
    fn drop(&mut self) {
        platform::unmap_chunk(self.base.as_ptr());
    }
}

impl std::fmt::Debug for NurseryChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NurseryChunk({:#x})", self.start())
    }
}

/// Decommit whole pages of the chunk at `base` from `from` up to the page
/// holding the trailer. Returns false if the OS call failed.
pub fn decommit_chunk_tail(base: usize, from: usize) -> bool {
    let start = round_up(from, PAGE_SIZE);
    let end = round_down(CHUNK_USABLE_SIZE, PAGE_SIZE);
    if start >= end {
        return true;
    }
    platform::decommit(base + start, end - start)
}

#[cfg(unix)]
mod platform {
    use super::CHUNK_SIZE;

    pub(super) fn map_chunk() -> *mut u8 {
        // Safety: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                CHUNK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub(super) fn unmap_chunk(ptr: *mut u8) {
        // Safety: `ptr` came from `map_chunk` and is unmapped once.
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, CHUNK_SIZE);
        }
    }

    pub(super) fn decommit(addr: usize, len: usize) -> bool {
        // Safety: callers pass a page-aligned range inside a live chunk.
        unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) == 0 }
    }
}

#[cfg(not(unix))]
mod platform {
    use super::{CHUNK_SIZE, PAGE_SIZE};
    use std::alloc::Layout;

    fn layout() -> Option<Layout> {
        Layout::from_size_align(CHUNK_SIZE, PAGE_SIZE).ok()
    }

    pub(super) fn map_chunk() -> *mut u8 {
        match layout() {
            // Safety: non-zero size.
            Some(layout) => unsafe { std::alloc::alloc(layout) },
            None => std::ptr::null_mut(),
        }
    }

    pub(super) fn unmap_chunk(ptr: *mut u8) {
        if let Some(layout) = layout() {
            // Safety: allocated in `map_chunk` with the same layout.
            unsafe { std::alloc::dealloc(ptr, layout) }
        }
    }

    pub(super) fn decommit(_addr: usize, _len: usize) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(1), PAGE_SIZE);
        assert_eq!(round_size(10_000), 2 * PAGE_SIZE);
        assert_eq!(round_size(6 * 1024), 2 * PAGE_SIZE);
        assert_eq!(round_size(CHUNK_SIZE), CHUNK_SIZE);
        assert_eq!(round_size(3 * CHUNK_SIZE + 100), 3 * CHUNK_SIZE);
        assert_eq!(round_size(CHUNK_SIZE + CHUNK_SIZE / 2), 2 * CHUNK_SIZE);
    }

    #[test]
    fn test_chunk_layout() {
        let chunk = NurseryChunk::allocate().expect("chunk mapping failed");
        assert!(chunk.trailer_is_valid());
        assert_eq!(chunk.usable_end() - chunk.start(), CHUNK_USABLE_SIZE);
        assert!(chunk.contains(chunk.start()));
        assert!(!chunk.contains(chunk.usable_end()));
    }

    #[test]
    fn test_poison_and_decommit_keep_trailer() {
        let chunk = NurseryChunk::allocate().expect("chunk mapping failed");
        chunk.poison(0, CHUNK_USABLE_SIZE, FRESH_NURSERY_PATTERN);
        assert!(chunk.trailer_is_valid());
        assert!(chunk.decommit_from(PAGE_SIZE));
        assert!(chunk.trailer_is_valid());
        assert!(chunk.decommit_from(CHUNK_USABLE_SIZE));
    }
}
