//! Nursery (young generation) with bump-pointer allocation.
//!
//! The nursery is a list of [`NurseryChunk`]s mapped on demand up to
//! `capacity`. Allocation bumps `position` towards the end of the current
//! chunk and moves to the next chunk when it overflows:
//!
//! ```text
//! position += size;
//! if position > current_end { move_to_next_chunk_and_allocate() }
//! ```
//!
//! Strings and BigInts have their own end pointers so either kind can be
//! switched off by setting its end to zero: every attempt then overflows into
//! the slow path, which refuses.
//!
//! A nursery smaller than one chunk ("sub-chunk mode") only uses the first
//! `capacity` bytes of chunk 0; the rest is handed to the decommit task.

use super::chunk::{
    round_size, NurseryChunk, CHUNK_SIZE, CHUNK_USABLE_SIZE, FRESH_NURSERY_PATTERN,
    SWEPT_NURSERY_PATTERN,
};
use super::decommit::NurseryDecommitTask;
use super::malloc;
use crate::cell::{align_cell, CellHeader, CellPtr, TraceKind, MIN_CELL_SIZE};
use crate::memory_tracker::{MemoryTracker, MemoryUse};
use crate::scheduling::SchedulingTunables;
use crate::zone::ZoneId;
use crate::{GcKind, GcReason};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Largest buffer bump-allocated in the nursery; bigger ones are malloced.
pub const MAX_NURSERY_BUFFER_SIZE: usize = 1024;

// Resizing goals.
const PROMOTION_GOAL: f64 = 0.02;
const DUTY_FACTOR_GOAL: f64 = 0.01;
const COLLECTOR_TIME_GOAL: Duration = Duration::from_millis(4);
const MIN_GROWTH_FACTOR: f64 = 0.5;
const MAX_GROWTH_FACTOR: f64 = 2.0;
const GROWTH_DEAD_BAND: f64 = 1.5;
const SMOOTHING_WINDOW: Duration = Duration::from_millis(200);
const SMOOTHING_WEIGHT: f64 = 0.75;

/// Where a minor collection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionPhase {
    /// No collection running.
    #[default]
    Idle,
    /// Tracing the store buffer and roots.
    TracingRoots,
    /// Draining the moved-cell lists.
    FixupWorklist,
    /// Updating side tables that refer to moved cells.
    Sweep,
    /// Resetting the nursery.
    Clear,
}

impl CollectionPhase {
    /// Whether relocation overlays in the nursery can be read. They are
    /// written while tracing and destroyed by the clear.
    #[inline]
    pub fn has_forwarding(self) -> bool {
        matches!(
            self,
            CollectionPhase::TracingRoots | CollectionPhase::FixupWorklist | CollectionPhase::Sweep
        )
    }
}

/// Facts about the last minor collection.
#[derive(Debug, Clone, Default)]
pub struct PreviousGc {
    /// Why it ran.
    pub reason: Option<GcReason>,
    /// Capacity while it ran.
    pub capacity: usize,
    /// Bytes in use when it started.
    pub used_bytes: usize,
    /// Bytes moved to the tenured heap.
    pub tenured_bytes: usize,
    /// Cells moved to the tenured heap.
    pub tenured_cells: usize,
    /// When it finished.
    pub end_time: Option<Instant>,
}

/// The young generation.
pub struct Nursery {
    chunks: SmallVec<[NurseryChunk; 8]>,
    current_chunk: usize,
    position: usize,
    current_end: usize,
    current_string_end: usize,
    current_bigint_end: usize,

    /// Zero when disabled. Excludes nothing: chunk trailers come on top.
    capacity: usize,

    can_allocate_strings: bool,
    can_allocate_bigints: bool,
    minor_gc_requested: AtomicU8,
    phase: CollectionPhase,

    /// Malloced buffers owned by nursery cells, with their sizes.
    malloced_buffers: FxHashMap<usize, usize>,
    malloced_buffer_bytes: usize,
    /// Old buffer address to new one, for buffers moved during a collection.
    forwarded_buffers: FxHashMap<usize, usize>,
    /// Buffers handed out for a specific nursery owner: address to
    /// `(owner, size)`. Moved with the owner when it is tenured.
    cell_buffers: FxHashMap<usize, (CellPtr, usize)>,
    cells_with_uid: Vec<CellPtr>,

    decommit_task: NurseryDecommitTask,
    tracker: Option<Arc<MemoryTracker>>,
    poison: bool,
    max_mapped_chunks: Option<usize>,

    previous_gc: PreviousGc,
    smoothed_growth_factor: f64,
    has_recent_growth_data: bool,
    collection_start: Option<Instant>,
}

impl Nursery {
    /// A disabled nursery. Call [`Nursery::enable`] before allocating.
    pub fn new(poison: bool, max_mapped_chunks: Option<usize>, tracker: Option<Arc<MemoryTracker>>) -> Self {
        Self {
            chunks: SmallVec::new(),
            current_chunk: 0,
            position: 0,
            current_end: 0,
            current_string_end: 0,
            current_bigint_end: 0,
            capacity: 0,
            can_allocate_strings: true,
            can_allocate_bigints: true,
            minor_gc_requested: AtomicU8::new(0),
            phase: CollectionPhase::Idle,
            malloced_buffers: FxHashMap::default(),
            malloced_buffer_bytes: 0,
            forwarded_buffers: FxHashMap::default(),
            cell_buffers: FxHashMap::default(),
            cells_with_uid: Vec::new(),
            decommit_task: NurseryDecommitTask::new(),
            tracker,
            poison,
            max_mapped_chunks,
            previous_gc: PreviousGc::default(),
            smoothed_growth_factor: 1.0,
            has_recent_growth_data: false,
            collection_start: None,
        }
    }

    // =========================================================================
    // Enable / Disable
    // =========================================================================

    /// Map the first chunk and start at the minimum capacity. Returns false
    /// and stays disabled if the chunk cannot be mapped.
    pub fn enable(&mut self, tunables: &SchedulingTunables) -> bool {
        if self.is_enabled() {
            return true;
        }
        debug_assert!(self.chunks.is_empty());

        self.capacity = round_size(tunables.gc_min_nursery_bytes());
        if !self.allocate_next_chunk() {
            self.capacity = 0;
            return false;
        }
        self.set_current_chunk(0);
        true
    }

    /// Release every chunk. The nursery must have been evicted first.
    pub fn disable(&mut self) {
        debug_assert!(self.is_empty());
        if !self.is_enabled() {
            return;
        }
        self.decommit_task.join();
        self.decommit_task.cancel_range();
        self.chunks.clear();
        self.capacity = 0;
        self.current_chunk = 0;
        self.position = 0;
        self.current_end = 0;
        self.current_string_end = 0;
        self.current_bigint_end = 0;
    }

    /// Whether cells can be allocated here at all.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.capacity != 0
    }

    /// Allow nursery strings.
    pub fn enable_strings(&mut self) {
        self.can_allocate_strings = true;
        self.current_string_end = self.current_end;
    }

    /// Send new strings to the tenured heap.
    pub fn disable_strings(&mut self) {
        self.can_allocate_strings = false;
        self.current_string_end = 0;
    }

    /// Allow nursery BigInts.
    pub fn enable_bigints(&mut self) {
        self.can_allocate_bigints = true;
        self.current_bigint_end = self.current_end;
    }

    /// Send new BigInts to the tenured heap.
    pub fn disable_bigints(&mut self) {
        self.can_allocate_bigints = false;
        self.current_bigint_end = 0;
    }

    /// Whether cells of `kind` may be nursery allocated.
    pub fn can_allocate(&self, kind: TraceKind) -> bool {
        self.is_enabled()
            && match kind {
                TraceKind::Object => true,
                TraceKind::String => self.can_allocate_strings,
                TraceKind::BigInt => self.can_allocate_bigints,
            }
    }

    // =========================================================================
    // Space Queries
    // =========================================================================

    /// Whether `addr` lies inside a mapped chunk.
    #[inline]
    pub fn is_inside(&self, addr: usize) -> bool {
        self.chunks
            .iter()
            .any(|chunk| addr.wrapping_sub(chunk.start()) < CHUNK_SIZE)
    }

    /// Whether nothing was allocated since the last collection.
    pub fn is_empty(&self) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.current_chunk == 0 && self.position == self.chunks[0].start()
    }

    /// Configured capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes available for cells at the current capacity.
    pub fn usable_capacity(&self) -> usize {
        (0..self.max_chunk_count()).map(|i| self.chunk_extent(i)).sum()
    }

    /// Bytes handed out since the last collection, including the unused
    /// tails of chunks already left behind.
    pub fn used_space(&self) -> usize {
        self.usable_capacity() - self.free_space()
    }

    /// Bytes still available before a collection is needed.
    pub fn free_space(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let in_current = self.current_end - self.position;
        let later: usize = (self.current_chunk + 1..self.max_chunk_count())
            .map(|i| self.chunk_extent(i))
            .sum();
        in_current + later
    }

    /// Chunks mapped so far.
    #[inline]
    pub fn allocated_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks needed for the current capacity.
    #[inline]
    pub fn max_chunk_count(&self) -> usize {
        self.capacity.div_ceil(CHUNK_SIZE)
    }

    /// Whether the capacity is below one chunk.
    #[inline]
    pub fn is_sub_chunk_mode(&self) -> bool {
        self.capacity < CHUNK_SIZE
    }

    /// Malloced bytes owned by nursery cells.
    #[inline]
    pub fn malloced_buffer_bytes(&self) -> usize {
        self.malloced_buffer_bytes
    }

    /// Current collection phase.
    #[inline]
    pub fn phase(&self) -> CollectionPhase {
        self.phase
    }

    /// Facts about the last minor collection.
    #[inline]
    pub fn previous_gc(&self) -> &PreviousGc {
        &self.previous_gc
    }

    /// Bytes returned to the OS by the decommit task.
    pub fn decommitted_bytes(&self) -> usize {
        self.decommit_task.released_bytes()
    }

    /// Wait for background decommit.
    pub fn join_decommit_task(&self) {
        self.decommit_task.join();
    }

    #[inline]
    fn chunk_extent(&self, index: usize) -> usize {
        debug_assert!(index < self.max_chunk_count());
        (self.capacity - index * CHUNK_SIZE).min(CHUNK_USABLE_SIZE)
    }

    // =========================================================================
    // Cell Allocation
    // =========================================================================

    /// Allocate a cell and write its header. `None` if the size is invalid,
    /// the kind is disabled or the nursery is full.
    pub fn allocate_cell(&mut self, zone: ZoneId, size: usize, kind: TraceKind) -> Option<CellPtr> {
        if size == 0 {
            return None;
        }
        let size = align_cell(size).max(MIN_CELL_SIZE);
        if size > CHUNK_USABLE_SIZE {
            return None;
        }

        let addr = self.allocate(size, kind)?;
        let cell = CellPtr::from_raw(addr as *mut u8)?;
        // Safety: `size` bytes at `addr` were just reserved.
        unsafe {
            cell.as_ptr().write(CellHeader::new(kind, size, zone));
        }
        Some(cell)
    }

    #[inline]
    fn end_for(&self, kind: TraceKind) -> usize {
        match kind {
            TraceKind::Object => self.current_end,
            TraceKind::String => self.current_string_end,
            TraceKind::BigInt => self.current_bigint_end,
        }
    }

    #[inline]
    fn allocate(&mut self, size: usize, kind: TraceKind) -> Option<usize> {
        let new_position = self.position + size;
        if new_position <= self.end_for(kind) {
            let addr = self.position;
            self.position = new_position;
            return Some(addr);
        }
        self.move_to_next_chunk_and_allocate(size, kind)
    }

    #[cold]
    fn move_to_next_chunk_and_allocate(&mut self, size: usize, kind: TraceKind) -> Option<usize> {
        if !self.can_allocate(kind) {
            return None;
        }

        let next = self.current_chunk + 1;
        if next >= self.max_chunk_count() {
            return None;
        }
        if next == self.chunks.len() && !self.allocate_next_chunk() {
            return None;
        }
        self.set_current_chunk(next);

        let new_position = self.position + size;
        if new_position > self.end_for(kind) {
            return None;
        }
        let addr = self.position;
        self.position = new_position;
        Some(addr)
    }

    fn allocate_next_chunk(&mut self) -> bool {
        let chunkno = self.chunks.len();
        debug_assert!(chunkno < self.max_chunk_count());

        let capped = self.max_mapped_chunks.is_some_and(|max| chunkno >= max);
        let chunk = if capped { None } else { NurseryChunk::allocate() };
        match chunk {
            Some(chunk) => {
                self.chunks.push(chunk);
                true
            }
            None => {
                warn!(chunkno, capacity = self.capacity, "failed to map nursery chunk");
                if chunkno > 0 {
                    let degraded = chunkno * CHUNK_SIZE;
                    warn!(from = self.capacity, to = degraded, "reducing nursery capacity");
                    self.capacity = degraded;
                }
                false
            }
        }
    }

    fn set_current_chunk(&mut self, index: usize) {
        debug_assert!(index < self.chunks.len());
        self.current_chunk = index;
        self.position = self.chunks[index].start();
        self.set_current_end();
        if self.poison {
            let extent = self.current_end - self.position;
            self.chunks[index].poison(0, extent, FRESH_NURSERY_PATTERN);
        }
    }

    fn set_current_end(&mut self) {
        let start = self.chunks[self.current_chunk].start();
        self.current_end = start + self.chunk_extent(self.current_chunk);
        self.current_string_end = if self.can_allocate_strings { self.current_end } else { 0 };
        self.current_bigint_end = if self.can_allocate_bigints { self.current_end } else { 0 };
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Allocate a buffer for a nursery cell: bump allocated when small,
    /// otherwise malloced and registered so it is freed if the owner dies.
    pub fn allocate_buffer(&mut self, nbytes: usize) -> Option<NonNull<u8>> {
        debug_assert!(nbytes > 0);
        if nbytes <= MAX_NURSERY_BUFFER_SIZE {
            if let Some(addr) = self.allocate(align_cell(nbytes), TraceKind::Object) {
                return NonNull::new(addr as *mut u8);
            }
        }
        let buffer = malloc::malloc_buffer(nbytes)?;
        self.register_malloced_buffer(buffer, nbytes);
        Some(buffer)
    }

    /// Like [`Nursery::allocate_buffer`] but zero filled.
    pub fn allocate_zeroed_buffer(&mut self, nbytes: usize) -> Option<NonNull<u8>> {
        debug_assert!(nbytes > 0);
        if nbytes <= MAX_NURSERY_BUFFER_SIZE {
            if let Some(addr) = self.allocate(align_cell(nbytes), TraceKind::Object) {
                // Safety: just reserved.
                unsafe { std::ptr::write_bytes(addr as *mut u8, 0, nbytes) };
                return NonNull::new(addr as *mut u8);
            }
        }
        let buffer = malloc::malloc_zeroed_buffer(nbytes)?;
        self.register_malloced_buffer(buffer, nbytes);
        Some(buffer)
    }

    /// Resize a buffer owned by a nursery cell.
    ///
    /// Nursery buffers cannot grow in place: a bigger one is allocated and
    /// the contents copied. Shrinking keeps the old buffer.
    pub fn reallocate_buffer(
        &mut self,
        old: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        if !self.is_inside(old.as_ptr() as usize) {
            let registered = self.remove_malloced_buffer(old);
            debug_assert_eq!(registered, Some(old_bytes));
            // Safety: registered malloced buffer of `old_bytes`.
            return match unsafe { malloc::realloc_buffer(old, old_bytes, new_bytes) } {
                Some(new) => {
                    self.register_malloced_buffer(new, new_bytes);
                    Some(new)
                }
                None => {
                    self.register_malloced_buffer(old, old_bytes);
                    None
                }
            };
        }

        if new_bytes < old_bytes {
            return Some(old);
        }
        let new = self.allocate_buffer(new_bytes)?;
        // Safety: both buffers hold at least `old_bytes` and are distinct.
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_bytes) };
        Some(new)
    }

    /// Release a buffer owned by a nursery cell. Nursery memory is
    /// reclaimed by the next collection.
    pub fn free_buffer(&mut self, buffer: NonNull<u8>, nbytes: usize) {
        if self.is_inside(buffer.as_ptr() as usize) {
            return;
        }
        if self.remove_malloced_buffer(buffer).is_some() {
            // Safety: registered malloced buffer of `nbytes`.
            unsafe { malloc::free_buffer(buffer, nbytes) };
        }
    }

    /// Take ownership of a malloced buffer until its owner is tenured.
    pub fn register_malloced_buffer(&mut self, buffer: NonNull<u8>, nbytes: usize) {
        let addr = buffer.as_ptr() as usize;
        let previous = self.malloced_buffers.insert(addr, nbytes);
        debug_assert!(previous.is_none());
        self.malloced_buffer_bytes += nbytes;
        if let Some(tracker) = &self.tracker {
            tracker.register_non_gc_memory(addr, MemoryUse::MallocedBuffer);
            tracker.inc_non_gc_memory(addr, nbytes, MemoryUse::MallocedBuffer);
        }
    }

    /// Stop tracking a malloced buffer, returning its size if it was known.
    pub fn remove_malloced_buffer(&mut self, buffer: NonNull<u8>) -> Option<usize> {
        let addr = buffer.as_ptr() as usize;
        let nbytes = self.malloced_buffers.remove(&addr)?;
        self.malloced_buffer_bytes -= nbytes;
        if let Some(tracker) = &self.tracker {
            tracker.dec_non_gc_memory(addr, nbytes, MemoryUse::MallocedBuffer);
            tracker.unregister_non_gc_memory(addr, MemoryUse::MallocedBuffer);
        }
        Some(nbytes)
    }

    /// Attach a buffer from [`Nursery::allocate_buffer`] to its nursery
    /// owner so it follows the owner into the tenured heap.
    pub fn note_cell_buffer(&mut self, owner: CellPtr, buffer: NonNull<u8>, nbytes: usize) {
        debug_assert!(self.is_inside(owner.addr()));
        self.cell_buffers.insert(buffer.as_ptr() as usize, (owner, nbytes));
    }

    /// Detach a buffer, returning its owner and size.
    pub fn forget_cell_buffer(&mut self, buffer: NonNull<u8>) -> Option<(CellPtr, usize)> {
        self.cell_buffers.remove(&(buffer.as_ptr() as usize))
    }

    pub(crate) fn take_cell_buffers(&mut self) -> Vec<(NonNull<u8>, CellPtr, usize)> {
        self.cell_buffers
            .drain()
            .filter_map(|(addr, (owner, nbytes))| NonNull::new(addr as *mut u8).map(|ptr| (ptr, owner, nbytes)))
            .collect()
    }

    /// Whether `buffer` is a registered malloced buffer.
    pub fn is_malloced_buffer(&self, buffer: *const u8) -> bool {
        self.malloced_buffers.contains_key(&(buffer as usize))
    }

    /// Free every registered buffer. After a collection these belong to
    /// cells that died in the nursery. Returns the bytes freed.
    pub fn free_malloced_buffers(&mut self) -> usize {
        let buffers: Vec<(usize, usize)> = self.malloced_buffers.drain().collect();
        let mut freed = 0;
        for (addr, nbytes) in buffers {
            if let Some(tracker) = &self.tracker {
                tracker.dec_non_gc_memory(addr, nbytes, MemoryUse::MallocedBuffer);
                tracker.unregister_non_gc_memory(addr, MemoryUse::MallocedBuffer);
            }
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // Safety: registered malloced buffer of `nbytes`.
                unsafe { malloc::free_buffer(ptr, nbytes) };
            }
            freed += nbytes;
        }
        self.malloced_buffer_bytes = 0;
        freed
    }

    /// Record that the buffer at `old` now lives at `new`.
    pub fn set_forwarded_buffer(&mut self, old: *const u8, new: *const u8) {
        debug_assert!(self.is_inside(old as usize));
        self.forwarded_buffers.insert(old as usize, new as usize);
    }

    /// Rewrite a pointer to a moved nursery buffer.
    pub fn forward_buffer_pointer(&self, pointer: &mut *mut u8) {
        let old = *pointer as usize;
        if !self.is_inside(old) {
            return;
        }
        if let Some(&new) = self.forwarded_buffers.get(&old) {
            *pointer = new as *mut u8;
        }
    }

    // =========================================================================
    // Forwarding
    // =========================================================================

    /// If `cell` is a nursery cell that was tenured, update it to the new
    /// address and return true. Forwarding is only known while a collection
    /// is tracing or sweeping; at any other time this returns false and
    /// leaves `cell` alone.
    pub fn get_forwarded_pointer(&self, cell: &mut CellPtr) -> bool {
        if !self.phase.has_forwarding() || !self.is_inside(cell.addr()) {
            return false;
        }
        // Safety: nursery memory is mapped and the phase check guarantees
        // the header or its overlay is intact.
        unsafe {
            if !cell.is_forwarded() {
                return false;
            }
            *cell = cell.forwarding_address();
        }
        true
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Ask for a minor collection at the next safe point. The first reason
    /// wins.
    pub fn request_minor_gc(&self, reason: GcReason) {
        let _ = self
            .minor_gc_requested
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Whether a collection was requested.
    #[inline]
    pub fn minor_gc_requested(&self) -> bool {
        self.minor_gc_requested.load(Ordering::Acquire) != 0
    }

    /// Why a collection was requested.
    pub fn minor_gc_trigger_reason(&self) -> Option<GcReason> {
        GcReason::from_u8(self.minor_gc_requested.load(Ordering::Acquire))
    }

    /// Forget a pending request.
    pub fn clear_minor_gc_request(&self) {
        self.minor_gc_requested.store(0, Ordering::Release);
    }

    /// Idle-time heuristic: collect if requested, if nearly full, or if an
    /// oversized nursery has sat unused for a while.
    pub fn should_collect(&self, tunables: &SchedulingTunables, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.is_empty() && self.capacity == tunables.gc_min_nursery_bytes() {
            return false;
        }
        if self.minor_gc_requested() {
            return true;
        }

        let free_bytes = self.free_space();
        let free_fraction = free_bytes as f64 / self.usable_capacity() as f64;
        if free_bytes < tunables.nursery_free_threshold_for_idle_collection()
            && free_fraction < tunables.nursery_free_threshold_for_idle_collection_fraction()
        {
            return true;
        }

        self.is_underused(tunables, now)
    }

    fn is_underused(&self, tunables: &SchedulingTunables, now: Instant) -> bool {
        if self.capacity == tunables.gc_min_nursery_bytes() {
            return false;
        }
        self.previous_gc.end_time.is_some_and(|end| {
            now.saturating_duration_since(end) > tunables.nursery_timeout_for_idle_collection()
        })
    }

    // =========================================================================
    // Collection Support
    // =========================================================================

    pub(crate) fn set_phase(&mut self, phase: CollectionPhase) {
        self.phase = phase;
    }

    pub(crate) fn begin_collection(&mut self, now: Instant) {
        self.collection_start = Some(now);
    }

    /// Remember a nursery cell that was given a unique id.
    pub fn add_cell_with_uid(&mut self, cell: CellPtr) {
        debug_assert!(self.is_inside(cell.addr()));
        self.cells_with_uid.push(cell);
    }

    pub(crate) fn take_cells_with_uid(&mut self) -> Vec<CellPtr> {
        std::mem::take(&mut self.cells_with_uid)
    }

    /// Promotion rate of the last collection: tenured bytes over used bytes.
    pub fn promotion_rate(&self) -> f64 {
        if self.previous_gc.used_bytes == 0 {
            return 0.0;
        }
        self.previous_gc.tenured_bytes as f64 / self.previous_gc.used_bytes as f64
    }

    pub(crate) fn record_previous_gc(
        &mut self,
        reason: GcReason,
        used_bytes: usize,
        tenured_bytes: usize,
        tenured_cells: usize,
    ) {
        self.previous_gc.reason = Some(reason);
        self.previous_gc.capacity = self.capacity;
        self.previous_gc.used_bytes = used_bytes;
        self.previous_gc.tenured_bytes = tenured_bytes;
        self.previous_gc.tenured_cells = tenured_cells;
    }

    pub(crate) fn end_collection(&mut self, now: Instant) {
        self.previous_gc.end_time = Some(now);
        self.collection_start = None;
        self.phase = CollectionPhase::Idle;
    }

    /// Reset to the first chunk. Freed memory is poisoned when enabled.
    pub(crate) fn clear(&mut self) {
        if !self.is_enabled() {
            return;
        }
        if self.poison {
            for index in 0..=self.current_chunk {
                let used = if index == self.current_chunk {
                    self.position - self.chunks[index].start()
                } else {
                    self.chunk_extent(index)
                };
                self.chunks[index].poison(0, used, SWEPT_NURSERY_PATTERN);
            }
        }
        self.forwarded_buffers.clear();
        self.set_current_chunk(0);
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    /// Pick a new capacity after a collection and grow or shrink to it.
    pub(crate) fn maybe_resize(&mut self, kind: GcKind, reason: GcReason, tunables: &SchedulingTunables, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        let min = round_size(tunables.gc_min_nursery_bytes());
        let max = round_size(tunables.gc_max_nursery_bytes());
        let target = self.target_size(kind, reason, tunables, now).clamp(min, max);

        if target > self.capacity {
            self.grow_allocable_space(target);
        } else if target < self.capacity {
            self.shrink_allocable_space(target);
        }
    }

    /// Re-clamp the capacity after the size bounds changed.
    pub(crate) fn clamp_to_bounds(&mut self, tunables: &SchedulingTunables) {
        if !self.is_enabled() {
            return;
        }
        let min = round_size(tunables.gc_min_nursery_bytes());
        let max = round_size(tunables.gc_max_nursery_bytes());
        let target = self.capacity.clamp(min, max);
        if target > self.capacity {
            self.grow_allocable_space(target);
        } else if target < self.capacity && self.is_empty() {
            self.shrink_allocable_space(target);
        }
    }

    fn target_size(&mut self, kind: GcKind, reason: GcReason, tunables: &SchedulingTunables, now: Instant) -> usize {
        if kind == GcKind::Shrink || reason.is_oom_reason() {
            return 0;
        }

        // `end_time` still refers to the collection before this one.
        let since_last = self.previous_gc.end_time.map(|end| now.saturating_duration_since(end));

        // An unused nursery drops to the minimum after the idle timeout.
        if self.has_recent_growth_data
            && self.previous_gc.used_bytes == 0
            && since_last.is_some_and(|d| d > tunables.nursery_timeout_for_idle_collection())
        {
            self.has_recent_growth_data = false;
            self.smoothed_growth_factor = 1.0;
            return 0;
        }

        let fraction_promoted = self.previous_gc.tenured_bytes as f64 / self.previous_gc.capacity.max(1) as f64;

        let collector_time = self
            .collection_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        let duty_factor = match since_last {
            Some(total) if self.has_recent_growth_data && !total.is_zero() => {
                collector_time.as_secs_f64() / total.as_secs_f64()
            }
            _ => 0.0,
        };

        let mut growth = (fraction_promoted / PROMOTION_GOAL).max(duty_factor / DUTY_FACTOR_GOAL);
        if !collector_time.is_zero() {
            growth = growth.min(COLLECTOR_TIME_GOAL.as_secs_f64() / collector_time.as_secs_f64());
        }
        growth = growth.clamp(MIN_GROWTH_FACTOR, MAX_GROWTH_FACTOR);

        if self.has_recent_growth_data && since_last.is_some_and(|d| d < SMOOTHING_WINDOW) {
            growth = SMOOTHING_WEIGHT * self.smoothed_growth_factor + (1.0 - SMOOTHING_WEIGHT) * growth;
        }
        self.smoothed_growth_factor = growth;
        self.has_recent_growth_data = true;

        if growth > 1.0 / GROWTH_DEAD_BAND && growth < GROWTH_DEAD_BAND {
            return self.capacity;
        }
        round_size((self.capacity as f64 * growth) as usize)
    }

    fn grow_allocable_space(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity > self.capacity);
        if self.is_sub_chunk_mode() {
            // The decommitted tail of chunk 0 is about to be used again.
            self.decommit_task.join();
            self.decommit_task.cancel_range();
        }
        debug!(from = self.capacity, to = new_capacity, "growing nursery");
        self.capacity = new_capacity;
        self.set_current_end();
    }

    fn shrink_allocable_space(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity < self.capacity);
        debug_assert_eq!(self.current_chunk, 0);

        let new_count = new_capacity.div_ceil(CHUNK_SIZE);
        if new_count < self.chunks.len() {
            self.free_chunks_from(new_count);
        }

        debug!(from = self.capacity, to = new_capacity, "shrinking nursery");
        self.capacity = new_capacity;
        if self.is_sub_chunk_mode() {
            self.decommit_task.queue_range(new_capacity, &self.chunks[0]);
            self.decommit_task.start_or_run_if_idle();
        }
        self.set_current_end();
    }

    fn free_chunks_from(&mut self, first: usize) {
        debug_assert!(first > 0 || self.is_empty());
        if first == 0 && self.is_sub_chunk_mode() {
            self.decommit_task.join();
        }
        for chunk in self.chunks.drain(first..) {
            self.decommit_task.queue_chunk(chunk);
        }
        self.decommit_task.start_or_run_if_idle();
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        self.decommit_task.join();
        self.decommit_task.cancel_range();
        self.free_malloced_buffers();
    }
}
