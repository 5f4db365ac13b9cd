//! Heap memory management.
//!
//! A [`GcHeap`] owns both generations and the state shared between them:
//! - Nursery: young generation with bump-pointer allocation over chunks
//! - Tenured heap: old generation with block-based allocation
//! - Zones: per-zone accounting and major collection thresholds
//!
//! Minor collections run here. Major collections belong to a separate
//! tenured collector which brackets its work with
//! [`GcHeap::begin_major_collection`] and [`GcHeap::record_major_collection`]
//! so that rates and thresholds stay current.

pub mod chunk;
mod decommit;
pub mod malloc;
mod nursery;
mod task;
pub mod tenured;

pub use chunk::{CHUNK_SIZE, CHUNK_USABLE_SIZE, PAGE_SIZE};
pub use decommit::NurseryDecommitTask;
pub use nursery::{CollectionPhase, MAX_NURSERY_BUFFER_SIZE, Nursery, PreviousGc};
pub use task::{GcParallelTask, TaskBody};
pub use tenured::{OwnedBuffer, TenuredHeap};

use crate::barrier::{needs_post_barrier, Overflow, StoreBuffer};
use crate::cell::{
    align_cell, flags, BigIntCell, CellHeader, CellPtr, ObjectCell, StringCell, TraceKind, Value,
    MIN_CELL_SIZE,
};
use crate::collector::{collect_minor, MinorGcReport};
use crate::config::{ConfigError, GcConfig};
use crate::memory_tracker::{MemoryTracker, MemoryUse};
use crate::roots::RootSet;
use crate::scheduling::{ParamKey, SchedulingState, SchedulingTunables, TunableError};
use crate::stats::GcStats;
use crate::zone::{ZoneAllocator, ZoneId};
use crate::{GcKind, GcReason};
use rustc_hash::FxHashMap;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sweep results for one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSweep {
    /// Zone that was swept.
    pub zone: ZoneId,
    /// Tenured cell bytes released.
    pub freed_bytes: usize,
    /// Tenured strings found dead.
    pub dead_strings: usize,
    /// Tenured strings examined.
    pub total_strings: usize,
    /// Time spent on this zone alone, such as sweeping it off the main
    /// thread. Added to its share of the main-thread time.
    pub zone_time: Duration,
}

/// What a major collection did, as reported by the tenured collector.
///
/// The tenured collector owns marking and sweeping; this report only feeds
/// the scheduling state.
#[derive(Debug, Clone)]
pub struct MajorGcReport {
    /// Why the collection ran.
    pub reason: GcReason,
    /// Main-thread time spent collecting.
    pub main_thread_time: Duration,
    /// Per-zone sweep results. Zones not listed freed nothing.
    pub zones: Vec<ZoneSweep>,
}

type TenuredCallback = Box<dyn FnMut(&Nursery)>;

/// Main heap structure managing both generations.
pub struct GcHeap {
    pub(crate) config: GcConfig,
    pub(crate) tunables: SchedulingTunables,
    pub(crate) scheduling: SchedulingState,

    pub(crate) nursery: Nursery,
    pub(crate) tenured: TenuredHeap,
    pub(crate) zones: Vec<ZoneAllocator>,

    /// Tenured to nursery edges.
    pub(crate) store_buffer: StoreBuffer,
    pub(crate) roots: RootSet,

    pub(crate) unique_ids: FxHashMap<CellPtr, u64>,
    next_unique_id: u64,

    pub(crate) tracker: Option<Arc<MemoryTracker>>,
    pub(crate) stats: GcStats,
    pub(crate) objects_tenured_callback: Option<TenuredCallback>,

    major_gc_requested: Option<GcReason>,
    last_major_end: Instant,
    last_gc_time: Option<Instant>,
    last_minor_report: Option<MinorGcReport>,
}

impl GcHeap {
    /// Create a heap with the default configuration.
    pub fn new() -> Self {
        Self::build(GcConfig::default(), SchedulingTunables::default())
    }

    /// Create a heap with the given configuration.
    pub fn with_config(config: GcConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tunables = config.tunables()?;
        Ok(Self::build(config, tunables))
    }

    fn build(config: GcConfig, tunables: SchedulingTunables) -> Self {
        let tracker = config.track_memory.then(|| Arc::new(MemoryTracker::new()));

        let mut nursery = Nursery::new(
            config.poison_nursery,
            config.max_nursery_chunks,
            tracker.clone(),
        );
        if config.generational && !nursery.enable(&tunables) {
            warn!("failed to map the first nursery chunk; allocating tenured");
        }
        if !config.nursery_strings {
            nursery.disable_strings();
        }
        if !config.nursery_bigints {
            nursery.disable_bigints();
        }

        let tenured = TenuredHeap::new(config.tenured_block_size, config.max_tenured_bytes);
        let store_buffer = StoreBuffer::new(config.store_buffer_entries);

        debug!(
            nursery_capacity = nursery.capacity(),
            tracked = tracker.is_some(),
            "GC heap created"
        );

        Self {
            config,
            tunables,
            scheduling: SchedulingState::new(),
            nursery,
            tenured,
            zones: Vec::new(),
            store_buffer,
            roots: RootSet::new(),
            unique_ids: FxHashMap::default(),
            next_unique_id: 1,
            tracker,
            stats: GcStats::new(),
            objects_tenured_callback: None,
            major_gc_requested: None,
            last_major_end: Instant::now(),
            last_gc_time: None,
            last_minor_report: None,
        }
    }

    // =========================================================================
    // Zones
    // =========================================================================

    /// Add a zone with thresholds for an empty heap.
    pub fn create_zone(&mut self) -> ZoneId {
        let id = ZoneId(self.zones.len() as u32);
        self.zones
            .push(ZoneAllocator::new(id, &self.tunables, &self.scheduling));
        id
    }

    /// Look up a zone.
    pub fn zone(&self, id: ZoneId) -> Option<&ZoneAllocator> {
        self.zones.get(id.index())
    }

    /// All zones, indexed by [`ZoneId::index`].
    pub fn zones(&self) -> &[ZoneAllocator] {
        &self.zones
    }

    // =========================================================================
    // Cell Allocation
    // =========================================================================

    /// Allocate a cell and write its header.
    ///
    /// Tries the nursery first. If it is full a minor collection runs and
    /// the allocation is retried once; if that fails too, or the kind is not
    /// nursery allocated, the cell goes straight to the tenured heap.
    /// Returns `None` for a zero size, an unknown zone, or when the tenured
    /// heap is exhausted.
    ///
    /// Any cell pointer not reachable from roots is stale afterwards if a
    /// collection ran.
    pub fn allocate_cell(&mut self, zone: ZoneId, size: usize, kind: TraceKind) -> Option<CellPtr> {
        if size == 0 || zone.index() >= self.zones.len() {
            return None;
        }

        if self.wants_nursery(zone, size, kind) {
            if let Some(cell) = self.allocate_in_nursery(zone, size, kind) {
                return Some(cell);
            }
            self.collect(GcKind::Normal, GcReason::OutOfNursery);
            if self.wants_nursery(zone, size, kind) {
                if let Some(cell) = self.allocate_in_nursery(zone, size, kind) {
                    return Some(cell);
                }
            }
            debug!(size, ?kind, "nursery allocation failed after collection");
        }

        self.allocate_tenured_cell(zone, size, kind)
    }

    fn wants_nursery(&self, zone: ZoneId, size: usize, kind: TraceKind) -> bool {
        self.nursery.can_allocate(kind)
            && align_cell(size) <= CHUNK_USABLE_SIZE
            && (kind != TraceKind::String || self.zones[zone.index()].allows_nursery_strings())
    }

    fn allocate_in_nursery(&mut self, zone: ZoneId, size: usize, kind: TraceKind) -> Option<CellPtr> {
        let cell = self.nursery.allocate_cell(zone, size, kind)?;
        // Safety: the header was just written.
        self.stats
            .record_nursery_allocation(unsafe { cell.header().alloc_size() });
        if kind == TraceKind::String {
            self.zones[zone.index()].note_nursery_string_allocated();
        }
        Some(cell)
    }

    fn allocate_tenured_cell(&mut self, zone: ZoneId, size: usize, kind: TraceKind) -> Option<CellPtr> {
        let size = align_cell(size).max(MIN_CELL_SIZE);
        let Some(ptr) = self.tenured.alloc(size) else {
            warn!(size, ?kind, "tenured allocation failed");
            return None;
        };
        let cell = CellPtr::from_raw(ptr.as_ptr())?;
        // Safety: fresh tenured memory of `size` bytes.
        unsafe { cell.as_ptr().write(CellHeader::new(kind, size, zone)) };

        self.zones[zone.index()].add_gc_bytes(size);
        self.stats.record_tenured_allocation(size);
        self.check_zone_triggers(zone);
        Some(cell)
    }

    /// Allocate an object with `nfixed` inline slots, all undefined.
    pub fn new_object(&mut self, zone: ZoneId, nfixed: u32) -> Option<CellPtr> {
        let cell = self.allocate_cell(zone, ObjectCell::alloc_size(nfixed as usize), TraceKind::Object)?;
        // Safety: allocated with the matching size.
        unsafe { ObjectCell::init(cell, nfixed) };
        Some(cell)
    }

    /// Allocate a linear string holding a copy of `chars`.
    pub fn new_string(&mut self, zone: ZoneId, chars: &[u8]) -> Option<CellPtr> {
        let len = u32::try_from(chars.len()).ok()?;
        let cell = self.allocate_cell(zone, StringCell::linear_alloc_size(chars.len()), TraceKind::String)?;
        // Safety: allocated with room for `chars` after the string body.
        unsafe {
            let string = StringCell::from_cell(cell);
            string.header.set_aux(len);
            string.base = ptr::null_mut();
            string.offset = 0;
            ptr::copy_nonoverlapping(chars.as_ptr(), StringCell::inline_chars(cell), chars.len());
        }
        Some(cell)
    }

    /// Allocate a string sharing `len` characters of `base` from `offset`.
    /// A dependent `base` is replaced by its own base.
    ///
    /// # Safety
    ///
    /// `base` must be a live cell of this heap.
    pub unsafe fn new_dependent_string(
        &mut self,
        zone: ZoneId,
        base: CellPtr,
        offset: usize,
        len: usize,
    ) -> Option<CellPtr> {
        let len32 = u32::try_from(len).ok()?;
        let (base, offset) = unsafe {
            if base.header().kind() != TraceKind::String {
                return None;
            }
            let string = StringCell::from_cell(base);
            if offset.checked_add(len)? > string.len() {
                return None;
            }
            if string.is_dependent() {
                (CellPtr::from_raw(string.base as *mut u8)?, string.offset + offset)
            } else {
                (base, offset)
            }
        };

        // Allocation may collect, which moves the base.
        let root = self.roots.add(Value::from_cell(base));
        let cell = self.allocate_cell(zone, StringCell::DEPENDENT_ALLOC_SIZE, TraceKind::String);
        let base = self.roots.remove(root).and_then(Value::as_cell)?;
        let cell = cell?;

        // Safety: allocated with the dependent string size.
        unsafe {
            let string = StringCell::from_cell(cell);
            string.header.set_aux(len32);
            string.header.set_flag(flags::DEPENDENT);
            string.base = base.as_ptr();
            string.offset = offset;
        }
        if needs_post_barrier(&self.nursery, cell, Value::from_cell(base)) {
            let overflow = self.store_buffer.put_whole_cell(cell.addr());
            self.note_store_buffer_overflow(overflow);
        }
        Some(cell)
    }

    /// Allocate a BigInt with the given magnitude, least significant digit
    /// first.
    pub fn new_bigint(&mut self, zone: ZoneId, digits: &[u64], negative: bool) -> Option<CellPtr> {
        let ndigits = u32::try_from(digits.len()).ok()?;
        let cell = self.allocate_cell(zone, BigIntCell::ALLOC_SIZE, TraceKind::BigInt)?;
        // Safety: allocated with the BigInt size.
        unsafe {
            let bigint = BigIntCell::from_cell(cell);
            bigint.header.set_aux(0);
            bigint.digits = ptr::null_mut();
            bigint.inline_digit = digits.first().copied().unwrap_or(0);
            if negative {
                bigint.header.set_flag(flags::NEGATIVE);
            }
        }

        if digits.len() > 1 {
            let nbytes = digits.len() * size_of::<u64>();
            // Safety: `cell` is live and owns no digits yet.
            let buffer = unsafe { self.allocate_owned_buffer(cell, nbytes, MemoryUse::BigIntDigits, false)? };
            // Safety: the buffer holds `nbytes`.
            unsafe {
                ptr::copy_nonoverlapping(digits.as_ptr(), buffer.as_ptr() as *mut u64, digits.len());
                BigIntCell::from_cell(cell).digits = buffer.as_ptr() as *mut u64;
            }
        }
        // Safety: as above.
        unsafe { BigIntCell::from_cell(cell).header.set_aux(ndigits) };
        Some(cell)
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// Grow an object's dynamic slots to `count`, keeping existing values.
    /// New slots are undefined. Returns false if the buffer could not be
    /// allocated; shrinking is a no-op.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object of this heap.
    pub unsafe fn grow_dynamic_slots(&mut self, obj: CellPtr, count: u32) -> bool {
        let (old_count, old_slots) = unsafe {
            let object = ObjectCell::from_cell(obj);
            (object.ndynamic as usize, object.dynamic)
        };
        let new_count = count as usize;
        if new_count <= old_count {
            return true;
        }

        let old_bytes = old_count * size_of::<Value>();
        let new_bytes = new_count * size_of::<Value>();
        // Safety: `obj` is live; `old_slots` is its slot buffer.
        let buffer = unsafe {
            match NonNull::new(old_slots as *mut u8) {
                Some(old) if old_count > 0 => {
                    self.reallocate_owned_buffer(obj, old, old_bytes, new_bytes, MemoryUse::ObjectSlots)
                }
                _ => self.allocate_owned_buffer(obj, new_bytes, MemoryUse::ObjectSlots, false),
            }
        };
        let Some(buffer) = buffer else {
            return false;
        };

        // Safety: the buffer holds `new_count` slots.
        unsafe {
            let slots = buffer.as_ptr() as *mut Value;
            for i in old_count..new_count {
                slots.add(i).write(Value::UNDEFINED);
            }
            let object = ObjectCell::from_cell(obj);
            object.dynamic = slots;
            object.ndynamic = count;
        }
        true
    }

    /// Store into an object slot, recording tenured to nursery edges.
    /// Returns false for a non-object or an out of range index.
    ///
    /// # Safety
    ///
    /// `obj` must be a live cell of this heap.
    pub unsafe fn set_slot(&mut self, obj: CellPtr, index: usize, value: Value) -> bool {
        unsafe {
            if obj.header().kind() != TraceKind::Object || index >= ObjectCell::from_cell(obj).slot_count() {
                return false;
            }
            *ObjectCell::slot_ptr(obj, index) = value;
        }

        if needs_post_barrier(&self.nursery, obj, value) {
            let overflow = self.store_buffer.put_slot(obj.addr(), index as u32);
            self.note_store_buffer_overflow(overflow);
        }
        true
    }

    /// Read an object slot.
    ///
    /// # Safety
    ///
    /// `obj` must be a live cell of this heap.
    pub unsafe fn get_slot(&self, obj: CellPtr, index: usize) -> Option<Value> {
        unsafe {
            if obj.header().kind() != TraceKind::Object || index >= ObjectCell::from_cell(obj).slot_count() {
                return None;
            }
            Some(*ObjectCell::slot_ptr(obj, index))
        }
    }

    fn note_store_buffer_overflow(&self, overflow: Option<Overflow>) {
        match overflow {
            Some(Overflow::Slots) => self.nursery.request_minor_gc(GcReason::FullSlotBuffer),
            Some(Overflow::WholeCells) => self.nursery.request_minor_gc(GcReason::FullWholeCellBuffer),
            None => {}
        }
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Allocate a buffer for `owner`.
    ///
    /// A nursery owner gets nursery memory for small sizes and a tracked
    /// malloced buffer otherwise; either moves to malloc memory owned by the
    /// tenured copy if the owner survives, and is reclaimed if it dies. A
    /// tenured owner gets malloc memory accounted to its zone.
    ///
    /// # Safety
    ///
    /// `owner` must be a live cell of this heap.
    pub unsafe fn allocate_buffer(&mut self, owner: CellPtr, nbytes: usize) -> Option<NonNull<u8>> {
        unsafe { self.allocate_cell_buffer(owner, nbytes, false) }
    }

    /// Like [`GcHeap::allocate_buffer`] but zero filled.
    ///
    /// # Safety
    ///
    /// `owner` must be a live cell of this heap.
    pub unsafe fn allocate_zeroed_buffer(&mut self, owner: CellPtr, nbytes: usize) -> Option<NonNull<u8>> {
        unsafe { self.allocate_cell_buffer(owner, nbytes, true) }
    }

    unsafe fn allocate_cell_buffer(&mut self, owner: CellPtr, nbytes: usize, zeroed: bool) -> Option<NonNull<u8>> {
        if nbytes == 0 {
            return None;
        }
        let buffer = unsafe { self.allocate_owned_buffer(owner, nbytes, MemoryUse::CellBuffer, zeroed)? };
        if self.nursery.is_inside(owner.addr()) {
            self.nursery.note_cell_buffer(owner, buffer, nbytes);
        }
        Some(buffer)
    }

    /// Resize a buffer from [`GcHeap::allocate_buffer`]. On failure the old
    /// buffer is untouched.
    ///
    /// # Safety
    ///
    /// `owner` must be a live cell of this heap and `old` a buffer of
    /// `old_bytes` allocated for it.
    pub unsafe fn reallocate_buffer(
        &mut self,
        owner: CellPtr,
        old: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        if new_bytes == 0 {
            return None;
        }
        let in_nursery = self.nursery.is_inside(owner.addr());
        if in_nursery {
            self.nursery.forget_cell_buffer(old);
        }
        let new = unsafe { self.reallocate_owned_buffer(owner, old, old_bytes, new_bytes, MemoryUse::CellBuffer) };
        if in_nursery {
            match new {
                Some(new) => self.nursery.note_cell_buffer(owner, new, new_bytes),
                None => self.nursery.note_cell_buffer(owner, old, old_bytes),
            }
        }
        new
    }

    /// Release a buffer from [`GcHeap::allocate_buffer`].
    ///
    /// # Safety
    ///
    /// `owner` must be a live cell of this heap and `buffer` a buffer of
    /// `nbytes` allocated for it. The buffer must not be used afterwards.
    pub unsafe fn free_buffer(&mut self, owner: CellPtr, buffer: NonNull<u8>, nbytes: usize) {
        if self.nursery.is_inside(owner.addr()) {
            self.nursery.forget_cell_buffer(buffer);
            self.nursery.free_buffer(buffer, nbytes);
            return;
        }
        if let Some(released) = unsafe { self.release_tenured_buffer(buffer) } {
            debug_assert_eq!(released, nbytes);
            // Safety: a malloced buffer of `released` bytes.
            unsafe { malloc::free_buffer(buffer, released) };
        }
    }

    /// Buffer for a cell's slots, digits or other data. Nursery buffers of
    /// slots and digits are found by the tenuring tracer through the cell.
    unsafe fn allocate_owned_buffer(
        &mut self,
        owner: CellPtr,
        nbytes: usize,
        use_: MemoryUse,
        zeroed: bool,
    ) -> Option<NonNull<u8>> {
        if self.nursery.is_inside(owner.addr()) {
            return if zeroed {
                self.nursery.allocate_zeroed_buffer(nbytes)
            } else {
                self.nursery.allocate_buffer(nbytes)
            };
        }
        let buffer = if zeroed {
            malloc::malloc_zeroed_buffer(nbytes)
        } else {
            malloc::malloc_buffer(nbytes)
        }?;
        unsafe { self.adopt_tenured_buffer(owner, buffer, nbytes, use_) };
        Some(buffer)
    }

    unsafe fn reallocate_owned_buffer(
        &mut self,
        owner: CellPtr,
        old: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
        use_: MemoryUse,
    ) -> Option<NonNull<u8>> {
        if self.nursery.is_inside(owner.addr()) {
            return self.nursery.reallocate_buffer(old, old_bytes, new_bytes);
        }

        let released = unsafe { self.release_tenured_buffer(old)? };
        debug_assert_eq!(released, old_bytes);
        // Safety: a malloced buffer of `old_bytes` no longer owned by anyone.
        match unsafe { malloc::realloc_buffer(old, old_bytes, new_bytes) } {
            Some(new) => {
                unsafe { self.adopt_tenured_buffer(owner, new, new_bytes, use_) };
                Some(new)
            }
            None => {
                unsafe { self.adopt_tenured_buffer(owner, old, old_bytes, use_) };
                None
            }
        }
    }

    unsafe fn adopt_tenured_buffer(&mut self, owner: CellPtr, buffer: NonNull<u8>, nbytes: usize, use_: MemoryUse) {
        self.tenured.adopt_buffer(owner, buffer, nbytes, use_);
        let zone = unsafe { owner.header().zone() };
        if let Some(allocator) = self.zones.get_mut(zone.index()) {
            allocator.add_cell_memory(owner, nbytes, use_, self.tracker.as_deref());
            self.check_zone_triggers(zone);
        }
    }

    unsafe fn release_tenured_buffer(&mut self, buffer: NonNull<u8>) -> Option<usize> {
        let entry = self.tenured.release_buffer(buffer)?;
        let zone = unsafe { entry.owner.header().zone() };
        if let Some(allocator) = self.zones.get_mut(zone.index()) {
            allocator.remove_cell_memory(entry.owner, entry.nbytes, entry.use_, false, self.tracker.as_deref());
        }
        Some(entry.nbytes)
    }

    // =========================================================================
    // Minor Collection
    // =========================================================================

    /// Run a minor collection.
    pub fn collect(&mut self, kind: GcKind, reason: GcReason) -> MinorGcReport {
        let report = collect_minor(self, kind, reason);
        for index in 0..self.zones.len() {
            self.check_zone_triggers(ZoneId(index as u32));
        }
        self.last_minor_report = Some(report.clone());
        report
    }

    /// Ask for a minor collection at the next safe point.
    #[inline]
    pub fn request_minor_gc(&self, reason: GcReason) {
        self.nursery.request_minor_gc(reason);
    }

    /// Whether a minor collection was requested.
    #[inline]
    pub fn minor_gc_requested(&self) -> bool {
        self.nursery.minor_gc_requested()
    }

    /// Run a requested minor collection, if any.
    pub fn maybe_collect_if_requested(&mut self) -> Option<MinorGcReport> {
        let reason = self.nursery.minor_gc_trigger_reason()?;
        Some(self.collect(GcKind::Normal, reason))
    }

    /// Idle-time check: whether collecting the nursery now is worthwhile.
    pub fn should_collect_nursery(&self, now: Instant) -> bool {
        self.nursery.should_collect(&self.tunables, now)
    }

    /// Rewrite `cell` if it was tenured by the running minor collection.
    ///
    /// Forwarding is valid until the nursery is cleared, so the only place
    /// outside the collector that sees it is the objects-tenured callback.
    /// Once [`GcHeap::collect`] has returned this is false for every cell
    /// and stale nursery pointers must be refreshed from roots instead.
    #[inline]
    pub fn get_forwarded_pointer(&self, cell: &mut CellPtr) -> bool {
        self.nursery.get_forwarded_pointer(cell)
    }

    /// Called after every minor collection's fix-up, before the nursery is
    /// cleared, so stale nursery addresses can still be forwarded.
    pub fn set_objects_tenured_callback(&mut self, callback: impl FnMut(&Nursery) + 'static) {
        self.objects_tenured_callback = Some(Box::new(callback));
    }

    /// Evict the nursery and allocate everything tenured from now on.
    pub fn disable_nursery(&mut self) {
        if !self.nursery.is_enabled() {
            return;
        }
        self.collect(GcKind::Normal, GcReason::EvictNursery);
        self.nursery.disable();
    }

    /// Start nursery allocation again. Returns false if no chunk could be
    /// mapped.
    pub fn enable_nursery(&mut self) -> bool {
        self.nursery.enable(&self.tunables)
    }

    // =========================================================================
    // Unique Ids
    // =========================================================================

    /// Stable id for a cell that survives moves.
    ///
    /// # Safety
    ///
    /// `cell` must be a live cell of this heap.
    pub unsafe fn get_or_create_unique_id(&mut self, cell: CellPtr) -> u64 {
        if let Some(&uid) = self.unique_ids.get(&cell) {
            return uid;
        }
        let uid = self.next_unique_id;
        self.next_unique_id += 1;
        self.unique_ids.insert(cell, uid);

        if self.nursery.is_inside(cell.addr()) {
            // A string with an identity must not be merged with another.
            unsafe {
                if cell.header().kind() == TraceKind::String {
                    cell.header_mut().set_flag(flags::NON_DEDUP);
                }
            }
            self.nursery.add_cell_with_uid(cell);
        }
        uid
    }

    /// Id of `cell`, if one was created.
    pub fn unique_id(&self, cell: CellPtr) -> Option<u64> {
        self.unique_ids.get(&cell).copied()
    }

    /// Forget the id of a tenured cell that died.
    pub fn remove_unique_id(&mut self, cell: CellPtr) -> Option<u64> {
        self.unique_ids.remove(&cell)
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Set a tunable. Out of range values are rejected.
    pub fn set_parameter(&mut self, key: ParamKey, value: u32) -> Result<(), TunableError> {
        self.tunables.set_parameter(key, value)?;
        self.on_parameter_changed(key);
        Ok(())
    }

    /// Restore a tunable's default.
    pub fn reset_parameter(&mut self, key: ParamKey) {
        self.tunables.reset_parameter(key);
        self.on_parameter_changed(key);
    }

    /// Current value of a tunable, in its parameter units.
    pub fn get_parameter(&self, key: ParamKey) -> u32 {
        self.tunables.get_parameter(key)
    }

    fn on_parameter_changed(&mut self, key: ParamKey) {
        match key {
            ParamKey::MinNurseryBytes | ParamKey::MaxNurseryBytes => {
                self.nursery.clamp_to_bounds(&self.tunables);
            }
            _ => {
                for zone in &mut self.zones {
                    zone.update_gc_start_thresholds(&self.tunables, &self.scheduling);
                }
            }
        }
        debug!(param = %key, value = self.tunables.get_parameter(key), "GC parameter changed");
    }

    // =========================================================================
    // Major Collection Scheduling
    // =========================================================================

    fn check_zone_triggers(&mut self, zone: ZoneId) {
        let Some(allocator) = self.zones.get(zone.index()) else {
            return;
        };
        if let Some(reason) = allocator
            .check_alloc_trigger()
            .or_else(|| allocator.check_malloc_trigger())
        {
            self.request_major_gc(reason);
        }
    }

    /// Record that a major collection should start. The first reason wins
    /// until the collection begins.
    pub fn request_major_gc(&mut self, reason: GcReason) {
        if self.major_gc_requested.is_some() {
            return;
        }
        debug!(?reason, "major GC requested");
        self.major_gc_requested = Some(reason);
        self.scheduling.update_high_frequency_mode_for_reason(reason);
    }

    /// Pending major collection request.
    #[inline]
    pub fn major_gc_requested(&self) -> Option<GcReason> {
        self.major_gc_requested
    }

    /// Take the pending major collection request.
    pub fn take_major_gc_request(&mut self) -> Option<GcReason> {
        self.major_gc_requested.take()
    }

    /// Whether a last-ditch collection may run now.
    pub fn may_run_last_ditch_gc(&self) -> bool {
        self.scheduling
            .may_run_last_ditch_gc(Instant::now(), &self.tunables)
    }

    /// Called by the tenured collector before it marks. Evicts the nursery,
    /// folds the mutator's allocation into each zone's rate and snapshots
    /// heap sizes.
    pub fn begin_major_collection(&mut self, reason: GcReason) -> Option<MinorGcReport> {
        let evicted = (!self.nursery.is_empty()).then(|| self.collect(GcKind::Normal, reason));

        let now = Instant::now();
        self.scheduling
            .on_major_gc_start(reason, self.last_gc_time, now, &self.tunables);

        let mutator_time = now.saturating_duration_since(self.last_major_end);
        for zone in &mut self.zones {
            zone.update_allocation_rate(mutator_time);
            zone.update_on_gc_start();
            zone.set_gc_slice_thresholds(&self.tunables, false);
        }
        self.major_gc_requested = None;

        debug!(
            ?reason,
            high_frequency = self.scheduling.in_high_frequency_gc_mode(),
            "major GC started"
        );
        evicted
    }

    /// Called by the tenured collector when it is done. Applies the sweep
    /// results, updates collection rates and recomputes every zone's
    /// thresholds.
    pub fn record_major_collection(&mut self, report: MajorGcReport) {
        for sweep in &report.zones {
            let Some(zone) = self.zones.get_mut(sweep.zone.index()) else {
                continue;
            };
            let freed = sweep.freed_bytes.min(zone.gc_heap_size().bytes());
            zone.remove_gc_bytes(freed, true);
            zone.add_per_zone_gc_time(sweep.zone_time);
            if zone.on_tenured_strings_swept(sweep.dead_strings, sweep.total_strings, &self.tunables) {
                debug!(zone = sweep.zone.index(), "nursery strings re-enabled");
            }
        }

        let initial_bytes: usize = self
            .zones
            .iter()
            .map(|zone| zone.gc_heap_size().initial_bytes())
            .sum();
        for zone in &mut self.zones {
            if initial_bytes != 0 {
                zone.update_collection_rate(report.main_thread_time, initial_bytes);
            }
            zone.clear_gc_slice_thresholds();
            zone.update_gc_start_thresholds(&self.tunables, &self.scheduling);
        }

        let now = Instant::now();
        self.last_major_end = now;
        self.last_gc_time = Some(now);
        self.stats.record_major_gc(report.main_thread_time);

        info!(
            reason = ?report.reason,
            time = ?report.main_thread_time,
            zones = self.zones.len(),
            high_frequency = self.scheduling.in_high_frequency_gc_mode(),
            "major GC finished"
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The configuration the heap was built with.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The root set.
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// The root set, for adding and removing roots.
    pub fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    /// The young generation.
    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// The old generation.
    pub fn tenured(&self) -> &TenuredHeap {
        &self.tenured
    }

    /// Pending tenured to nursery edges.
    pub fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Current tunables.
    pub fn tunables(&self) -> &SchedulingTunables {
        &self.tunables
    }

    /// Shared scheduling state.
    pub fn scheduling_state(&self) -> &SchedulingState {
        &self.scheduling
    }

    /// The memory tracker, when enabled.
    pub fn memory_tracker(&self) -> Option<&MemoryTracker> {
        self.tracker.as_deref()
    }

    /// Report of the most recent minor collection.
    pub fn last_minor_report(&self) -> Option<&MinorGcReport> {
        self.last_minor_report.as_ref()
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        self.nursery.free_malloced_buffers();

        let tracker = self.tracker.clone();
        for (buffer, entry) in self.tenured.take_owned_buffers() {
            // Safety: tenured blocks outlive this loop.
            let zone = unsafe { entry.owner.header().zone() };
            if let Some(allocator) = self.zones.get_mut(zone.index()) {
                allocator.remove_cell_memory(entry.owner, entry.nbytes, entry.use_, false, tracker.as_deref());
            }
            // Safety: adopted buffers are malloced with their recorded size.
            unsafe { malloc::free_buffer(buffer, entry.nbytes) };
        }

        if let Some(tracker) = &tracker {
            if !std::thread::panicking() {
                tracker.check_empty_on_destroy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> GcHeap {
        GcHeap::with_config(GcConfig::debug()).expect("valid config")
    }

    #[test]
    fn test_heap_creation() {
        let heap = GcHeap::new();
        assert!(heap.nursery().is_enabled());
        assert!(heap.zones().is_empty());
        assert!(heap.major_gc_requested().is_none());
    }

    #[test]
    fn test_allocation_prefers_nursery() {
        let mut heap = heap();
        let zone = heap.create_zone();
        let obj = heap.new_object(zone, 2).expect("alloc");
        assert!(heap.nursery().is_inside(obj.addr()));
        assert_eq!(heap.zone(zone).unwrap().gc_heap_size().bytes(), 0);
    }

    #[test]
    fn test_invalid_allocations() {
        let mut heap = heap();
        let zone = heap.create_zone();
        assert!(heap.allocate_cell(zone, 0, TraceKind::Object).is_none());
        assert!(heap.allocate_cell(ZoneId(7), 32, TraceKind::Object).is_none());
    }

    #[test]
    fn test_disabled_kinds_go_tenured() {
        let config = GcConfig {
            nursery_strings: false,
            ..GcConfig::debug()
        };
        let mut heap = GcHeap::with_config(config).unwrap();
        let zone = heap.create_zone();
        let string = heap.new_string(zone, b"tenured").expect("alloc");
        assert!(heap.tenured().contains(string.addr()));
        assert_eq!(unsafe { StringCell::chars(string) }, b"tenured");
        assert!(heap.zone(zone).unwrap().gc_heap_size().bytes() > 0);
    }

    #[test]
    fn test_oversized_cells_go_tenured() {
        let mut heap = heap();
        let zone = heap.create_zone();
        let cell = heap
            .allocate_cell(zone, CHUNK_SIZE, TraceKind::Object)
            .expect("alloc");
        assert!(heap.tenured().contains(cell.addr()));
    }

    #[test]
    fn test_slot_barrier_records_edges() {
        let mut heap = GcHeap::with_config(GcConfig {
            generational: false,
            ..GcConfig::debug()
        })
        .unwrap();
        let zone = heap.create_zone();
        let old = heap.new_object(zone, 1).unwrap();
        assert!(heap.enable_nursery());
        let young = heap.new_object(zone, 0).unwrap();

        unsafe {
            assert!(heap.set_slot(old, 0, Value::from_cell(young)));
            assert!(!heap.set_slot(old, 1, Value::UNDEFINED));
            assert_eq!(heap.get_slot(old, 0), Some(Value::from_cell(young)));
        }
        assert_eq!(heap.store_buffer().len(), 1);
    }

    #[test]
    fn test_tenured_buffers_are_accounted() {
        let mut heap = GcHeap::with_config(GcConfig {
            generational: false,
            ..GcConfig::debug()
        })
        .unwrap();
        let zone = heap.create_zone();
        let obj = heap.new_object(zone, 0).unwrap();

        unsafe {
            assert!(heap.grow_dynamic_slots(obj, 4));
            assert!(heap.grow_dynamic_slots(obj, 8));
            let buf = heap.allocate_buffer(obj, 100).expect("buffer");
            assert_eq!(heap.zone(zone).unwrap().malloc_heap_size().bytes(), 64 + 100);
            heap.free_buffer(obj, buf, 100);
        }
        assert_eq!(heap.zone(zone).unwrap().malloc_heap_size().bytes(), 64);
        let tracker = heap.memory_tracker().expect("tracker");
        assert_eq!(tracker.gc_association(obj, MemoryUse::ObjectSlots), Some(64));
        // Dropping the heap releases the slots without tripping the tracker.
    }

    #[test]
    fn test_unique_ids_are_stable() {
        let mut heap = heap();
        let zone = heap.create_zone();
        let string = heap.new_string(zone, b"id").unwrap();
        unsafe {
            let uid = heap.get_or_create_unique_id(string);
            assert_eq!(heap.get_or_create_unique_id(string), uid);
            assert!(string.header().has_flag(flags::NON_DEDUP));
        }
        assert!(heap.unique_id(string).is_some());
    }

    #[test]
    fn test_parameter_changes_reclamp_nursery() {
        let mut heap = heap();
        heap.set_parameter(ParamKey::MinNurseryBytes, 64 * 1024).unwrap();
        heap.set_parameter(ParamKey::MaxNurseryBytes, 64 * 1024).unwrap();
        assert_eq!(heap.nursery().capacity(), 64 * 1024);
        assert_eq!(heap.get_parameter(ParamKey::MaxNurseryBytes), 64 * 1024);

        heap.reset_parameter(ParamKey::MaxNurseryBytes);
        heap.reset_parameter(ParamKey::MinNurseryBytes);
        assert_eq!(heap.nursery().capacity(), CHUNK_SIZE);
    }

    #[test]
    fn test_rejected_parameter_leaves_state() {
        let mut heap = heap();
        let before = heap.get_parameter(ParamKey::PretenureThreshold);
        assert!(heap.set_parameter(ParamKey::PretenureThreshold, 101).is_err());
        assert_eq!(heap.get_parameter(ParamKey::PretenureThreshold), before);
    }
}
