//! Tenured heap with block-based bump allocation.
//!
//! Tenured cells are laid out end to end inside fixed-size blocks, so a block
//! can be walked cell by cell using the size in each header. Cells larger
//! than a block get a dedicated block of their own.
//!
//! Marking and sweeping belong to the major collector; this heap only hands
//! out memory, answers containment queries and owns the out-of-line buffers
//! of tenured cells.

use super::malloc;
use crate::cell::{align_cell, CellPtr};
use crate::memory_tracker::MemoryUse;
use rustc_hash::FxHashMap;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use tracing::warn;

/// Default block size (64KB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const BLOCK_ALIGN: usize = 16;

/// One tenured block.
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
    allocated: usize,
}

impl Block {
    /// Allocate a zeroed block of `size` bytes.
    pub fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).ok()?;
        if size == 0 {
            return None;
        }
        // Safety: non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, size, allocated: 0 })
    }

    /// First byte of the block.
    #[inline]
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Whether `addr` falls inside the allocated part of this block.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.start()) < self.allocated
    }

    /// Bytes handed out.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Usable size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bump-allocate `size` bytes, or `None` if the block is full.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let new_offset = self.allocated.checked_add(size)?;
        if new_offset > self.size {
            return None;
        }
        // Safety: offset is within the block.
        let ptr = unsafe { self.ptr.as_ptr().add(self.allocated) };
        self.allocated = new_offset;
        NonNull::new(ptr)
    }

    /// Visit every cell in allocation order.
    pub fn for_each_cell(&self, f: &mut impl FnMut(CellPtr)) {
        let mut offset = 0;
        while offset < self.allocated {
            // Safety: cells are laid out end to end up to `allocated`.
            let Some(cell) = CellPtr::from_raw(unsafe { self.ptr.as_ptr().add(offset) }) else {
                break;
            };
            // Safety: every allocation is followed by a header write.
            let size = unsafe { cell.header().alloc_size() };
            if size == 0 {
                break;
            }
            f(cell);
            offset += size;
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.size, BLOCK_ALIGN) {
            // Safety: allocated in `new` with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

// Safety: a block is plain memory owned by exactly one heap.
unsafe impl Send for Block {}

/// A malloced buffer owned by a tenured cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedBuffer {
    /// Cell the buffer belongs to.
    pub owner: CellPtr,
    /// Size in bytes.
    pub nbytes: usize,
    /// Accounting category.
    pub use_: MemoryUse,
}

/// The old generation.
pub struct TenuredHeap {
    blocks: Vec<Block>,
    current_block: usize,
    block_size: usize,
    allocated: usize,
    max_bytes: Option<usize>,
    /// Malloced buffers owned by tenured cells, keyed by address.
    owned_buffers: FxHashMap<usize, OwnedBuffer>,
    owned_buffer_bytes: usize,
}

impl TenuredHeap {
    /// Create an empty heap. `max_bytes` caps the cell bytes it will hand
    /// out, simulating memory exhaustion.
    pub fn new(block_size: usize, max_bytes: Option<usize>) -> Self {
        Self {
            blocks: Vec::new(),
            current_block: 0,
            block_size: block_size.max(BLOCK_ALIGN),
            allocated: 0,
            max_bytes,
            owned_buffers: FxHashMap::default(),
            owned_buffer_bytes: 0,
        }
    }

    /// Allocate `size` bytes for a cell. The caller writes the header.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = align_cell(size);
        if self.max_bytes.is_some_and(|max| self.allocated + size > max) {
            return None;
        }

        if let Some(block) = self.blocks.get_mut(self.current_block) {
            if let Some(ptr) = block.alloc(size) {
                self.allocated += size;
                return Some(ptr);
            }
        }
        self.alloc_slow(size)
    }

    #[cold]
    fn alloc_slow(&mut self, size: usize) -> Option<NonNull<u8>> {
        let Some(mut block) = Block::new(self.block_size.max(size)) else {
            warn!(size, "failed to allocate tenured block");
            return None;
        };
        let ptr = block.alloc(size)?;

        // Oversized blocks are full immediately; keep allocating from the
        // current one.
        self.blocks.push(block);
        if size <= self.block_size {
            self.current_block = self.blocks.len() - 1;
        }
        self.allocated += size;
        Some(ptr)
    }

    /// Whether `addr` is inside a tenured cell.
    pub fn contains(&self, addr: usize) -> bool {
        self.blocks.iter().any(|block| block.contains(addr))
    }

    /// Bytes handed out for cells.
    #[inline]
    pub fn usage(&self) -> usize {
        self.allocated
    }

    /// Bytes reserved by blocks.
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(Block::size).sum()
    }

    /// Number of blocks.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Visit every tenured cell.
    pub fn for_each_cell(&self, mut f: impl FnMut(CellPtr)) {
        for block in &self.blocks {
            block.for_each_cell(&mut f);
        }
    }

    // =========================================================================
    // Owned Buffers
    // =========================================================================

    /// Take ownership of a malloced buffer for a tenured cell.
    pub fn adopt_buffer(&mut self, owner: CellPtr, buffer: NonNull<u8>, nbytes: usize, use_: MemoryUse) {
        let entry = OwnedBuffer { owner, nbytes, use_ };
        let previous = self.owned_buffers.insert(buffer.as_ptr() as usize, entry);
        debug_assert!(previous.is_none());
        self.owned_buffer_bytes += nbytes;
    }

    /// Give up ownership of a buffer. The caller frees it.
    pub fn release_buffer(&mut self, buffer: NonNull<u8>) -> Option<OwnedBuffer> {
        let entry = self.owned_buffers.remove(&(buffer.as_ptr() as usize))?;
        self.owned_buffer_bytes -= entry.nbytes;
        Some(entry)
    }

    /// Give up ownership of every buffer, returning address and entry.
    pub(crate) fn take_owned_buffers(&mut self) -> Vec<(NonNull<u8>, OwnedBuffer)> {
        self.owned_buffer_bytes = 0;
        self.owned_buffers
            .drain()
            .filter_map(|(addr, entry)| NonNull::new(addr as *mut u8).map(|ptr| (ptr, entry)))
            .collect()
    }

    /// Whether `buffer` is owned by a tenured cell.
    pub fn owns_buffer(&self, buffer: *const u8) -> bool {
        self.owned_buffers.contains_key(&(buffer as usize))
    }

    /// Malloced bytes owned by tenured cells.
    #[inline]
    pub fn owned_buffer_bytes(&self) -> usize {
        self.owned_buffer_bytes
    }
}

impl Drop for TenuredHeap {
    fn drop(&mut self) {
        for (ptr, entry) in self.take_owned_buffers() {
            // Safety: adopted buffers come from `malloc`.
            unsafe { malloc::free_buffer(ptr, entry.nbytes) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellHeader, TraceKind};
    use crate::zone::ZoneId;

    fn alloc_cell(heap: &mut TenuredHeap, size: usize) -> CellPtr {
        let ptr = heap.alloc(size).expect("alloc failed");
        let cell = CellPtr::from_raw(ptr.as_ptr()).unwrap();
        unsafe { cell.as_ptr().write(CellHeader::new(TraceKind::Object, align_cell(size), ZoneId(0))) };
        cell
    }

    #[test]
    fn test_block_allocation() {
        let mut block = Block::new(128).expect("block");
        let a = block.alloc(64).expect("first");
        let b = block.alloc(64).expect("second");
        assert_ne!(a, b);
        assert!(block.alloc(8).is_none());
        assert!(block.contains(a.as_ptr() as usize));
    }

    #[test]
    fn test_tenured_allocation() {
        let mut heap = TenuredHeap::new(1024, None);
        let cell = alloc_cell(&mut heap, 64);
        assert_eq!(heap.usage(), 64);
        assert!(heap.contains(cell.addr()));
        assert!(!heap.contains(0));
    }

    #[test]
    fn test_multiple_blocks_and_walk() {
        let mut heap = TenuredHeap::new(256, None);
        let mut cells = Vec::new();
        for _ in 0..10 {
            cells.push(alloc_cell(&mut heap, 64));
        }
        assert!(heap.block_count() >= 3);

        let mut seen = Vec::new();
        heap.for_each_cell(|cell| seen.push(cell));
        assert_eq!(seen, cells);
    }

    #[test]
    fn test_oversized_cell_gets_own_block() {
        let mut heap = TenuredHeap::new(256, None);
        let small = alloc_cell(&mut heap, 32);
        let big = alloc_cell(&mut heap, 1024);
        let next = alloc_cell(&mut heap, 32);
        assert!(heap.contains(big.addr()));
        assert_eq!(next.addr(), small.addr() + 32);
    }

    #[test]
    fn test_max_bytes_limit() {
        let mut heap = TenuredHeap::new(1024, Some(96));
        assert!(heap.alloc(64).is_some());
        assert!(heap.alloc(64).is_none());
        assert!(heap.alloc(32).is_some());
    }

    #[test]
    fn test_owned_buffers() {
        let mut heap = TenuredHeap::new(1024, None);
        let owner = alloc_cell(&mut heap, 32);
        let buf = malloc::malloc_buffer(128).expect("malloc");
        heap.adopt_buffer(owner, buf, 128, MemoryUse::CellBuffer);
        assert!(heap.owns_buffer(buf.as_ptr()));
        assert_eq!(heap.owned_buffer_bytes(), 128);

        let entry = heap.release_buffer(buf).expect("owned");
        assert_eq!(entry.owner, owner);
        assert_eq!(entry.nbytes, 128);
        unsafe { malloc::free_buffer(buf, 128) };
        assert_eq!(heap.owned_buffer_bytes(), 0);
        assert!(heap.release_buffer(buf).is_none());
    }
}
