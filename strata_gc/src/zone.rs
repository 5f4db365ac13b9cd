//! Zones: independently accounted groups of cells.
//!
//! A [`ZoneAllocator`] tracks how many bytes of GC cells and associated
//! malloc memory a zone holds, the thresholds at which a major collection is
//! requested, and smoothed allocation and collection rates used by the
//! balanced heap limit model.

use crate::GcReason;
use crate::cell::CellPtr;
use crate::memory_tracker::{MemoryTracker, MemoryUse};
use crate::scheduling::{
    GcHeapThreshold, HeapSize, MallocHeapThreshold, SchedulingState, SchedulingTunables,
    exponential_moving_average,
};
use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const COLLECTION_RATE_SMOOTHING_FACTOR: f64 = 0.5;
const ALLOCATION_RATE_SMOOTHING_FACTOR: f64 = 0.5;

/// Index of a zone within its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId(pub(crate) u32);

impl ZoneId {
    /// Position in the heap's zone list.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Size accounting, thresholds and rates for one zone.
#[derive(Debug)]
pub struct ZoneAllocator {
    id: ZoneId,

    gc_heap_size: HeapSize,
    gc_heap_threshold: GcHeapThreshold,
    malloc_heap_size: HeapSize,
    malloc_heap_threshold: MallocHeapThreshold,

    smoothed_allocation_rate: Option<f64>,
    smoothed_collection_rate: Option<f64>,
    prev_gc_heap_size: usize,
    per_zone_gc_time: Duration,

    alloc_nursery_strings: bool,
    nursery_allocated_strings: usize,
    tenured_strings: usize,
}

impl ZoneAllocator {
    /// New zone with thresholds computed for an empty heap.
    pub fn new(id: ZoneId, tunables: &SchedulingTunables, state: &SchedulingState) -> Self {
        let mut zone = Self {
            id,
            gc_heap_size: HeapSize::default(),
            gc_heap_threshold: GcHeapThreshold::default(),
            malloc_heap_size: HeapSize::default(),
            malloc_heap_threshold: MallocHeapThreshold::default(),
            smoothed_allocation_rate: None,
            smoothed_collection_rate: None,
            prev_gc_heap_size: 0,
            per_zone_gc_time: Duration::ZERO,
            alloc_nursery_strings: true,
            nursery_allocated_strings: 0,
            tenured_strings: 0,
        };
        zone.update_gc_start_thresholds(tunables, state);
        zone
    }

    /// This zone's id.
    #[inline]
    pub fn id(&self) -> ZoneId {
        self.id
    }

    /// Tenured cell bytes.
    #[inline]
    pub fn gc_heap_size(&self) -> &HeapSize {
        &self.gc_heap_size
    }

    /// Malloc bytes associated with tenured cells.
    #[inline]
    pub fn malloc_heap_size(&self) -> &HeapSize {
        &self.malloc_heap_size
    }

    /// Thresholds for tenured cell bytes.
    #[inline]
    pub fn gc_heap_threshold(&self) -> &GcHeapThreshold {
        &self.gc_heap_threshold
    }

    /// Thresholds for associated malloc bytes.
    #[inline]
    pub fn malloc_heap_threshold(&self) -> &MallocHeapThreshold {
        &self.malloc_heap_threshold
    }

    /// Smoothed mutator allocation rate in MB/s.
    #[inline]
    pub fn smoothed_allocation_rate(&self) -> Option<f64> {
        self.smoothed_allocation_rate
    }

    /// Smoothed collection rate in MB/s.
    #[inline]
    pub fn smoothed_collection_rate(&self) -> Option<f64> {
        self.smoothed_collection_rate
    }

    /// Time spent on work attributable to this zone alone.
    pub fn add_per_zone_gc_time(&mut self, time: Duration) {
        self.per_zone_gc_time += time;
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Record newly tenured cell bytes.
    pub fn add_gc_bytes(&mut self, nbytes: usize) {
        self.gc_heap_size.add_bytes(nbytes);
    }

    /// Record cell bytes released by the tenured collector.
    pub fn remove_gc_bytes(&mut self, nbytes: usize, was_swept: bool) {
        self.gc_heap_size.remove_bytes(nbytes, was_swept);
    }

    /// Associate malloc memory with a tenured cell.
    pub fn add_cell_memory(
        &mut self,
        cell: CellPtr,
        nbytes: usize,
        use_: MemoryUse,
        tracker: Option<&MemoryTracker>,
    ) {
        self.malloc_heap_size.add_bytes(nbytes);
        if let Some(tracker) = tracker {
            tracker.track_gc_memory(cell, nbytes, use_);
        }
    }

    /// Release malloc memory associated with a tenured cell.
    pub fn remove_cell_memory(
        &mut self,
        cell: CellPtr,
        nbytes: usize,
        use_: MemoryUse,
        was_swept: bool,
        tracker: Option<&MemoryTracker>,
    ) {
        if let Some(tracker) = tracker {
            tracker.untrack_gc_memory(cell, nbytes, use_);
        }
        self.malloc_heap_size.remove_bytes(nbytes, was_swept);
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Whether the GC heap crossed its start or slice threshold.
    pub fn check_alloc_trigger(&self) -> Option<GcReason> {
        Self::crossed(&self.gc_heap_size, &self.gc_heap_threshold).then_some(GcReason::AllocTrigger)
    }

    /// Whether the malloc heap crossed its start or slice threshold.
    pub fn check_malloc_trigger(&self) -> Option<GcReason> {
        Self::crossed(&self.malloc_heap_size, &self.malloc_heap_threshold)
            .then_some(GcReason::TooMuchMalloc)
    }

    fn crossed(size: &HeapSize, threshold: &crate::scheduling::HeapThreshold) -> bool {
        match threshold.slice_bytes() {
            Some(slice) => size.bytes() >= slice,
            None => size.bytes() >= threshold.start_bytes(),
        }
    }

    /// Snapshot sizes at the start of a major collection.
    pub fn update_on_gc_start(&mut self) {
        self.gc_heap_size.update_on_gc_start();
        self.malloc_heap_size.update_on_gc_start();
    }

    /// Recompute both start thresholds from the current sizes.
    pub fn update_gc_start_thresholds(&mut self, tunables: &SchedulingTunables, state: &SchedulingState) {
        self.gc_heap_threshold.update_start_threshold(
            self.gc_heap_size.bytes(),
            self.smoothed_allocation_rate,
            self.smoothed_collection_rate,
            tunables,
            state,
        );
        self.malloc_heap_threshold
            .update_start_threshold(self.malloc_heap_size.bytes(), tunables, state);
    }

    /// Set slice thresholds for an ongoing incremental collection.
    pub fn set_gc_slice_thresholds(&mut self, tunables: &SchedulingTunables, waiting_on_bg_task: bool) {
        self.gc_heap_threshold
            .threshold_mut()
            .set_slice_threshold(&self.gc_heap_size, tunables, waiting_on_bg_task);
        self.malloc_heap_threshold
            .threshold_mut()
            .set_slice_threshold(&self.malloc_heap_size, tunables, waiting_on_bg_task);
    }

    /// Drop slice thresholds once the collection ends.
    pub fn clear_gc_slice_thresholds(&mut self) {
        self.gc_heap_threshold.threshold_mut().clear_slice_threshold();
        self.malloc_heap_threshold.threshold_mut().clear_slice_threshold();
    }

    // =========================================================================
    // Rates
    // =========================================================================

    /// Fold a finished collection into the smoothed collection rate.
    ///
    /// Main-thread time is attributed to zones in proportion to their share
    /// of the bytes being collected.
    pub fn update_collection_rate(&mut self, main_thread_gc_time: Duration, initial_bytes_for_all_zones: usize) {
        debug_assert!(initial_bytes_for_all_zones != 0);
        debug_assert!(self.gc_heap_size.initial_bytes() <= initial_bytes_for_all_zones);

        let initial = self.gc_heap_size.initial_bytes() as f64;
        let zone_fraction = initial / initial_bytes_for_all_zones as f64;
        let zone_duration =
            main_thread_gc_time.as_secs_f64() * zone_fraction + self.per_zone_gc_time.as_secs_f64();
        self.per_zone_gc_time = Duration::ZERO;
        if zone_duration <= 0.0 {
            return;
        }

        let collection_rate = initial / (zone_duration * BYTES_PER_MB);
        self.smoothed_collection_rate = Some(match self.smoothed_collection_rate {
            Some(prev) => exponential_moving_average(prev, collection_rate, COLLECTION_RATE_SMOOTHING_FACTOR),
            None => collection_rate,
        });
    }

    /// Fold the mutator's allocation since the last collection into the
    /// smoothed allocation rate.
    pub fn update_allocation_rate(&mut self, mutator_time: Duration) {
        let size_including_freed = self.gc_heap_size.bytes() + self.gc_heap_size.freed_bytes();
        debug_assert!(self.prev_gc_heap_size <= size_including_freed);
        let allocated = size_including_freed.saturating_sub(self.prev_gc_heap_size);

        let secs = mutator_time.as_secs_f64();
        if secs > 0.0 {
            let allocation_rate = allocated as f64 / (secs * BYTES_PER_MB);
            self.smoothed_allocation_rate = Some(match self.smoothed_allocation_rate {
                Some(prev) => {
                    exponential_moving_average(prev, allocation_rate, ALLOCATION_RATE_SMOOTHING_FACTOR)
                }
                None => allocation_rate,
            });
        }

        self.gc_heap_size.clear_freed_bytes();
        self.prev_gc_heap_size = self.gc_heap_size.bytes();
    }

    // =========================================================================
    // String pretenuring
    // =========================================================================

    /// Whether new strings in this zone may go to the nursery.
    #[inline]
    pub fn allows_nursery_strings(&self) -> bool {
        self.alloc_nursery_strings
    }

    pub(crate) fn note_nursery_string_allocated(&mut self) {
        self.nursery_allocated_strings += 1;
    }

    pub(crate) fn note_string_tenured(&mut self) {
        self.tenured_strings += 1;
    }

    /// `(tenured, allocated)` nursery string counts for the last minor GC.
    pub fn nursery_string_counts(&self) -> (usize, usize) {
        (self.tenured_strings, self.nursery_allocated_strings)
    }

    pub(crate) fn reset_nursery_string_counts(&mut self) {
        self.tenured_strings = 0;
        self.nursery_allocated_strings = 0;
    }

    /// Decide after a minor GC whether this zone's strings should be
    /// allocated tenured. Returns true if pretenuring was switched on.
    pub(crate) fn maybe_pretenure_strings(&mut self, promotion_rate: f64, tunables: &SchedulingTunables) -> bool {
        let (tenured, allocated) = self.nursery_string_counts();
        self.reset_nursery_string_counts();

        if !self.alloc_nursery_strings || allocated == 0 {
            return false;
        }
        if promotion_rate <= tunables.pretenure_threshold() {
            return false;
        }
        if tenured < tunables.pretenure_group_threshold() as usize {
            return false;
        }
        if (tenured as f64 / allocated as f64) <= tunables.pretenure_string_threshold() {
            return false;
        }

        self.alloc_nursery_strings = false;
        true
    }

    /// Called by the tenured collector after sweeping strings. Re-enables
    /// nursery strings if most pretenured strings died young.
    pub fn on_tenured_strings_swept(&mut self, dead: usize, total: usize, tunables: &SchedulingTunables) -> bool {
        if self.alloc_nursery_strings || total == 0 {
            return false;
        }
        if (dead as f64 / total as f64) > tunables.stop_pretenure_string_threshold() {
            self.alloc_nursery_strings = true;
            return true;
        }
        false
    }
}
