//! Promotion of live nursery cells into the tenured heap.
//!
//! [`TenuringTracer`] is a moving [`Tracer`]: every edge it is shown that
//! points at an unmoved nursery cell causes that cell to be copied into the
//! tenured heap. A [`RelocationOverlay`] is then written over the old
//! location and threaded onto one of three FIFO lists (objects, strings,
//! BigInts). Edges to already-moved cells are simply rewritten.
//!
//! Copying a cell does not trace it. Its outgoing edges are fixed up later by
//! draining the moved lists in [`TenuringTracer::collect_to_fixed_point`],
//! which repeats until all three lists are empty at once; fixing one cell can
//! move more cells. The worklist replaces recursion, so deep and cyclic
//! graphs are handled in constant stack space.
//!
//! Out-of-line buffers never stay in the nursery: nursery-allocated slot and
//! digit buffers are copied to malloc, and malloced buffers registered with
//! the nursery are adopted by the tenured heap.

use crate::cell::{
    BigIntCell, CellHeader, CellPtr, ObjectCell, RelocationOverlay, StringCell, TraceKind, Value,
};
use crate::heap::malloc::{crash_oom_unsafe, malloc_buffer};
use crate::heap::{CollectionPhase, Nursery, TenuredHeap};
use crate::memory_tracker::{MemoryTracker, MemoryUse};
use crate::trace::{trace_children, Tracer};
use crate::zone::{ZoneAllocator, ZoneId};
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::ptr::{self, NonNull};

/// FIFO list threaded through relocation overlays.
struct MovedList {
    head: *mut RelocationOverlay,
    tail: *mut RelocationOverlay,
}

impl MovedList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// # Safety
    ///
    /// `overlay` must be a fresh overlay with a null `next`.
    #[inline]
    unsafe fn push(&mut self, overlay: *mut RelocationOverlay) {
        unsafe {
            if self.tail.is_null() {
                self.head = overlay;
            } else {
                (*self.tail).set_next(overlay);
            }
        }
        self.tail = overlay;
    }

    /// Pop the oldest overlay and return where its cell now lives.
    #[inline]
    fn pop(&mut self) -> Option<CellPtr> {
        if self.head.is_null() {
            return None;
        }
        // Safety: list entries are overlays in nursery memory, which stays
        // mapped and intact until the nursery is cleared.
        unsafe {
            let overlay = &*self.head;
            self.head = overlay.next();
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            Some(overlay.forwarding_address())
        }
    }
}

/// Key for string deduplication. Candidates with equal keys are compared
/// character by character.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct DedupKey {
    zone: ZoneId,
    flags: u8,
    alloc_size: usize,
    len: usize,
    hash: u64,
}

impl DedupKey {
    fn new(header: &CellHeader, chars: &[u8]) -> Self {
        let mut hasher = FxHasher::default();
        chars.hash(&mut hasher);
        Self {
            zone: header.zone(),
            flags: header.flags(),
            alloc_size: header.alloc_size(),
            len: chars.len(),
            hash: hasher.finish(),
        }
    }
}

/// Moving tracer used by a minor collection.
pub struct TenuringTracer<'a> {
    nursery: &'a mut Nursery,
    tenured: &'a mut TenuredHeap,
    zones: &'a mut [ZoneAllocator],
    tracker: Option<&'a MemoryTracker>,

    objects: MovedList,
    strings: MovedList,
    bigints: MovedList,

    string_dedup: FxHashMap<DedupKey, SmallVec<[CellPtr; 1]>>,

    /// Bytes copied into the tenured heap.
    pub tenured_bytes: usize,
    /// Cells copied into the tenured heap.
    pub tenured_cells: usize,
    /// Strings redirected to an equal tenured string instead of copied.
    pub deduplicated_strings: usize,
}

impl<'a> TenuringTracer<'a> {
    /// Create a tracer for one collection. The nursery enters the tracing
    /// phase.
    pub fn new(
        nursery: &'a mut Nursery,
        tenured: &'a mut TenuredHeap,
        zones: &'a mut [ZoneAllocator],
        tracker: Option<&'a MemoryTracker>,
    ) -> Self {
        nursery.set_phase(CollectionPhase::TracingRoots);
        Self {
            nursery,
            tenured,
            zones,
            tracker,
            objects: MovedList::new(),
            strings: MovedList::new(),
            bigints: MovedList::new(),
            string_dedup: FxHashMap::default(),
            tenured_bytes: 0,
            tenured_cells: 0,
            deduplicated_strings: 0,
        }
    }

    /// The nursery being evacuated.
    pub fn nursery(&self) -> &Nursery {
        self.nursery
    }

    pub(crate) fn set_phase(&mut self, phase: CollectionPhase) {
        self.nursery.set_phase(phase);
    }

    /// Promote the target of an edge if needed and rewrite the edge.
    pub fn traverse(&mut self, cell: &mut CellPtr) {
        if !self.nursery.is_inside(cell.addr()) {
            return;
        }

        // Safety: nursery cells are intact or overlaid during a collection.
        unsafe {
            if cell.is_forwarded() {
                *cell = cell.forwarding_address();
                return;
            }
            *cell = match cell.header().kind() {
                TraceKind::Object => self.move_object(*cell),
                TraceKind::String => self.move_string(*cell),
                TraceKind::BigInt => self.move_bigint(*cell),
            };
        }
    }

    /// Trace the slots of a tenured cell recorded in the store buffer.
    ///
    /// # Safety
    ///
    /// `cell` must be a live tenured cell.
    pub unsafe fn trace_whole_cell(&mut self, cell: CellPtr) {
        unsafe { trace_children(cell, self) }
    }

    /// Trace one remembered slot of a tenured object. Stale entries
    /// pointing past the current slot count are ignored.
    ///
    /// # Safety
    ///
    /// `cell` must be a live tenured cell.
    pub unsafe fn trace_slot(&mut self, cell: CellPtr, index: usize) {
        unsafe {
            if cell.header().kind() != TraceKind::Object {
                return;
            }
            if index < ObjectCell::from_cell(cell).slot_count() {
                crate::trace::trace_slot(cell, index, self);
            }
        }
    }

    /// Drain the moved lists until no list has work left.
    pub fn collect_to_fixed_point(&mut self) {
        loop {
            while let Some(cell) = self.objects.pop() {
                // Safety: popped cells are fully copied tenured cells.
                unsafe { trace_children(cell, self) };
            }
            while let Some(cell) = self.strings.pop() {
                // Safety: as above.
                unsafe { trace_children(cell, self) };
            }
            // BigInts hold no edges; draining keeps the lists consistent.
            while self.bigints.pop().is_some() {}

            if self.objects.is_empty() && self.strings.is_empty() && self.bigints.is_empty() {
                break;
            }
        }
    }

    /// Hand buffers attached with [`Nursery::note_cell_buffer`] to the
    /// tenured copies of their owners. Buffers of dead owners stay with the
    /// nursery and are freed in the sweep. Run after the fixed point.
    pub fn promote_cell_buffers(&mut self) {
        for (buffer, owner, nbytes) in self.nursery.take_cell_buffers() {
            let mut moved = owner;
            if !self.nursery.get_forwarded_pointer(&mut moved) {
                continue;
            }
            // Safety: the buffer belonged to `owner`, which was tenured.
            let buffer = unsafe { self.take_buffer(buffer.as_ptr(), nbytes, "tenuring a cell buffer") };
            self.adopt_buffer(moved, buffer, nbytes, MemoryUse::CellBuffer);
        }
    }

    // =========================================================================
    // Moving
    // =========================================================================

    /// Copy `src` into a fresh tenured cell in the same zone.
    unsafe fn copy_to_tenured(&mut self, src: CellPtr) -> CellPtr {
        unsafe {
            let size = src.header().alloc_size();
            let zone = src.header().zone();

            let Some(dst) = self.tenured.alloc(size) else {
                crash_oom_unsafe("tenuring a nursery cell");
            };
            ptr::copy_nonoverlapping(src.as_ptr() as *const u8, dst.as_ptr(), size);

            if let Some(zone) = self.zones.get_mut(zone.index()) {
                zone.add_gc_bytes(size);
            }
            self.tenured_bytes += size;
            self.tenured_cells += 1;

            match CellPtr::from_raw(dst.as_ptr()) {
                Some(cell) => cell,
                None => crash_oom_unsafe("tenuring a nursery cell"),
            }
        }
    }

    unsafe fn move_object(&mut self, src: CellPtr) -> CellPtr {
        unsafe {
            let dst = self.copy_to_tenured(src);

            let obj = ObjectCell::from_cell(dst);
            if obj.ndynamic > 0 {
                let nbytes = obj.ndynamic as usize * size_of::<Value>();
                let buffer = self.take_buffer(obj.dynamic as *mut u8, nbytes, "tenuring object slots");
                obj.dynamic = buffer.as_ptr() as *mut Value;
                self.adopt_buffer(dst, buffer, nbytes, MemoryUse::ObjectSlots);
            }

            let overlay = RelocationOverlay::forward(src, dst);
            self.objects.push(overlay);
            dst
        }
    }

    unsafe fn move_string(&mut self, src: CellPtr) -> CellPtr {
        unsafe {
            let zone = src.header().zone();
            if let Some(zone) = self.zones.get_mut(zone.index()) {
                zone.note_string_tenured();
            }

            let key = if StringCell::from_cell(src).is_deduplicatable() {
                let chars = StringCell::chars(src);
                let key = DedupKey::new(src.header(), chars);
                if let Some(existing) = self.find_duplicate(&key, chars) {
                    RelocationOverlay::forward(src, existing);
                    self.deduplicated_strings += 1;
                    return existing;
                }
                Some(key)
            } else {
                None
            };

            let dst = self.copy_to_tenured(src);
            if let Some(key) = key {
                self.string_dedup.entry(key).or_default().push(dst);
            }

            let overlay = RelocationOverlay::forward(src, dst);
            self.strings.push(overlay);
            dst
        }
    }

    unsafe fn move_bigint(&mut self, src: CellPtr) -> CellPtr {
        unsafe {
            let dst = self.copy_to_tenured(src);

            let bigint = BigIntCell::from_cell(dst);
            if bigint.has_heap_digits() {
                let nbytes = bigint.digit_length() * size_of::<u64>();
                let buffer = self.take_buffer(bigint.digits as *mut u8, nbytes, "tenuring BigInt digits");
                bigint.digits = buffer.as_ptr() as *mut u64;
                self.adopt_buffer(dst, buffer, nbytes, MemoryUse::BigIntDigits);
            }

            let overlay = RelocationOverlay::forward(src, dst);
            self.bigints.push(overlay);
            dst
        }
    }

    /// Turn a nursery cell's buffer into a malloced buffer the tenured copy
    /// can own.
    unsafe fn take_buffer(&mut self, old: *mut u8, nbytes: usize, what: &str) -> NonNull<u8> {
        let Some(old_ptr) = NonNull::new(old) else {
            crash_oom_unsafe(what);
        };

        if !self.nursery.is_inside(old as usize) {
            let registered = self.nursery.remove_malloced_buffer(old_ptr);
            debug_assert_eq!(registered, Some(nbytes));
            return old_ptr;
        }

        let Some(new) = malloc_buffer(nbytes) else {
            crash_oom_unsafe(what);
        };
        // Safety: both buffers hold `nbytes`; one is nursery, one malloc.
        unsafe { ptr::copy_nonoverlapping(old, new.as_ptr(), nbytes) };
        self.nursery.set_forwarded_buffer(old, new.as_ptr());
        new
    }

    fn adopt_buffer(&mut self, owner: CellPtr, buffer: NonNull<u8>, nbytes: usize, use_: MemoryUse) {
        self.tenured.adopt_buffer(owner, buffer, nbytes, use_);
        // Safety: `owner` was just copied.
        let zone = unsafe { owner.header().zone() };
        if let Some(zone) = self.zones.get_mut(zone.index()) {
            zone.add_cell_memory(owner, nbytes, use_, self.tracker);
        }
    }

    unsafe fn find_duplicate(&self, key: &DedupKey, chars: &[u8]) -> Option<CellPtr> {
        let candidates = self.string_dedup.get(key)?;
        candidates
            .iter()
            .copied()
            // Safety: candidates are linear tenured strings.
            .find(|candidate| unsafe { StringCell::chars(*candidate) } == chars)
    }
}

impl Tracer for TenuringTracer<'_> {
    #[inline]
    fn on_cell_edge(&mut self, cell: &mut CellPtr) {
        self.traverse(cell);
    }
}
