//! Per-zone heap size accounting and collection thresholds.
//!
//! Each zone keeps one [`GcHeapThreshold`] for cell bytes and one
//! [`MallocHeapThreshold`] for malloc memory associated with cells. Both
//! expose three limits through [`HeapThreshold`]:
//!
//! - `start_bytes`: crossing it requests a major collection.
//! - `incremental_limit_bytes`: crossing it during an incremental collection
//!   forces the rest to finish non-incrementally.
//! - `slice_bytes`: next slice trigger while a collection is in progress.
//!
//! Invariants: `incremental_limit_bytes >= start_bytes` and
//! `slice_bytes <= incremental_limit_bytes`.

use super::tunables::{
    HIGH_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR, LOW_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR,
    SchedulingTunables,
};
use super::SchedulingState;
use std::ops::Deref;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

// Balanced heap limit constants (sizes in MB, rates in MB/s).
const BALANCED_HEAP_BASE_MB: f64 = 5.0;
const MIN_BALANCED_HEAP_LIMIT_MB: f64 = 10.0;
const MIN_BALANCED_HEADROOM_MB: f64 = 3.0;
const MAX_HEAP_GROWTH: f64 = 3.0;
const DEFAULT_ALLOCATION_RATE: f64 = 0.0;
const DEFAULT_COLLECTION_RATE: f64 = 200.0;
/// Slowest collection rate used by the balanced model, in MB/s.
const MIN_COLLECTION_RATE: f64 = 0.001;

/// Piecewise linear interpolation, flat outside `[x0, x1]`.
pub fn linear_interpolate(x: f64, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    debug_assert!(x0 < x1);

    if x < x0 {
        return y0;
    }
    if x < x1 {
        return y0 + (y1 - y0) * ((x - x0) / (x1 - x0));
    }
    y1
}

/// Weight `new_data` by `smoothing_factor` against the previous average.
pub fn exponential_moving_average(prev_average: f64, new_data: f64, smoothing_factor: f64) -> f64 {
    debug_assert!(smoothing_factor > 0.0 && smoothing_factor <= 1.0);
    smoothing_factor * new_data + (1.0 - smoothing_factor) * prev_average
}

/// Thresholds are computed in floating point and may exceed `usize`.
#[inline]
fn to_clamped_size(bytes: f64) -> usize {
    if bytes >= usize::MAX as f64 {
        usize::MAX
    } else if bytes <= 0.0 {
        0
    } else {
        bytes as usize
    }
}

/// Byte count of one heap kind in a zone.
#[derive(Debug, Default, Clone)]
pub struct HeapSize {
    bytes: usize,
    initial_bytes: usize,
    freed_bytes: usize,
}

impl HeapSize {
    /// Current size.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Size when the current or last collection started.
    #[inline]
    pub fn initial_bytes(&self) -> usize {
        self.initial_bytes
    }

    /// Bytes freed by sweeping since the last allocation rate update.
    #[inline]
    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes
    }

    /// Account for new memory.
    #[inline]
    pub fn add_bytes(&mut self, nbytes: usize) {
        self.bytes += nbytes;
    }

    /// Account for released memory. `was_swept` marks memory freed by the
    /// collector rather than explicitly by the owner.
    #[inline]
    pub fn remove_bytes(&mut self, nbytes: usize, was_swept: bool) {
        debug_assert!(nbytes <= self.bytes);
        self.bytes -= nbytes;
        if was_swept {
            self.freed_bytes += nbytes;
        }
    }

    /// Snapshot the size at collection start.
    #[inline]
    pub fn update_on_gc_start(&mut self) {
        self.initial_bytes = self.bytes;
    }

    /// Reset the freed counter.
    #[inline]
    pub fn clear_freed_bytes(&mut self) {
        self.freed_bytes = 0;
    }
}

/// Trigger, incremental limit and slice threshold for one heap kind.
#[derive(Debug, Clone)]
pub struct HeapThreshold {
    start_bytes: usize,
    incremental_limit_bytes: usize,
    slice_bytes: Option<usize>,
}

impl Default for HeapThreshold {
    fn default() -> Self {
        Self {
            start_bytes: usize::MAX,
            incremental_limit_bytes: usize::MAX,
            slice_bytes: None,
        }
    }
}

impl HeapThreshold {
    /// Heap size that triggers the next collection.
    #[inline]
    pub fn start_bytes(&self) -> usize {
        self.start_bytes
    }

    /// Size at which an incremental collection stops being incremental.
    #[inline]
    pub fn incremental_limit_bytes(&self) -> usize {
        self.incremental_limit_bytes
    }

    /// Next slice trigger, if a collection is in progress.
    #[inline]
    pub fn slice_bytes(&self) -> Option<usize> {
        self.slice_bytes
    }

    /// Whether a slice threshold is set.
    #[inline]
    pub fn has_slice_threshold(&self) -> bool {
        self.slice_bytes.is_some()
    }

    /// Drop the slice threshold once the collection finishes.
    #[inline]
    pub fn clear_slice_threshold(&mut self) {
        self.slice_bytes = None;
    }

    /// Size at which a collection may be started early.
    pub fn eager_alloc_trigger(&self, high_frequency_gc: bool) -> f64 {
        let factor = if high_frequency_gc {
            HIGH_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR
        } else {
            LOW_FREQUENCY_EAGER_ALLOC_TRIGGER_FACTOR
        };
        factor * self.start_bytes as f64
    }

    /// Bytes left before the incremental limit.
    pub fn incremental_bytes_remaining(&self, heap_size: &HeapSize) -> usize {
        self.incremental_limit_bytes.saturating_sub(heap_size.bytes())
    }

    /// Set the next slice trigger for an ongoing incremental collection.
    ///
    /// The gap normally equals the zone alloc delay. It shrinks in proportion
    /// to the remaining headroom once that drops below the urgent threshold.
    /// While the collector waits on a background task no slice fires until
    /// the urgent threshold is reached.
    pub fn set_slice_threshold(
        &mut self,
        heap_size: &HeapSize,
        tunables: &SchedulingTunables,
        waiting_on_bg_task: bool,
    ) {
        let bytes_remaining = self.incremental_bytes_remaining(heap_size);
        let urgent = tunables.urgent_threshold_bytes();
        let is_urgent = bytes_remaining < urgent;

        let mut delay_before_next_slice = tunables.zone_alloc_delay_bytes();
        if is_urgent {
            let fraction_remaining = bytes_remaining as f64 / urgent as f64;
            delay_before_next_slice = (delay_before_next_slice as f64 * fraction_remaining) as usize;
            debug_assert!(delay_before_next_slice <= tunables.zone_alloc_delay_bytes());
        } else if waiting_on_bg_task {
            delay_before_next_slice = bytes_remaining - urgent;
        }

        let slice = (heap_size.bytes() as u64 + delay_before_next_slice as u64)
            .min(self.incremental_limit_bytes as u64);
        self.slice_bytes = Some(slice.min(usize::MAX as u64) as usize);
    }

    /// Classify the retained size as small, medium or large and derive the
    /// incremental limit from the start threshold.
    ///
    /// The limit is always at least one maximum nursery above the start
    /// threshold so tenuring a full nursery cannot by itself force a
    /// non-incremental collection.
    fn set_incremental_limit_from_start_bytes(
        &mut self,
        retained_bytes: usize,
        tunables: &SchedulingTunables,
    ) {
        let factor = linear_interpolate(
            retained_bytes as f64,
            tunables.small_heap_size_max_bytes() as f64,
            tunables.small_heap_incremental_limit(),
            tunables.large_heap_size_min_bytes() as f64,
            tunables.large_heap_incremental_limit(),
        );

        let scaled = self.start_bytes as f64 * factor;
        let additive = self.start_bytes as f64 + tunables.gc_max_nursery_bytes() as f64;
        self.incremental_limit_bytes = to_clamped_size(scaled.max(additive)).max(self.start_bytes);

        if let Some(slice) = self.slice_bytes {
            if slice > self.incremental_limit_bytes {
                self.slice_bytes = Some(self.incremental_limit_bytes);
            }
        }
    }

    /// Heap growth factor for the classic model.
    pub fn compute_zone_heap_growth_factor_for_heap_size(
        last_bytes: usize,
        tunables: &SchedulingTunables,
        state: &SchedulingState,
    ) -> f64 {
        // Small zones: keep it simple.
        if last_bytes < 1024 * 1024 {
            return tunables.low_frequency_heap_growth();
        }

        if !state.in_high_frequency_gc_mode() {
            return tunables.low_frequency_heap_growth();
        }

        debug_assert!(tunables.small_heap_size_max_bytes() <= tunables.large_heap_size_min_bytes());
        debug_assert!(
            tunables.high_frequency_large_heap_growth() <= tunables.high_frequency_small_heap_growth()
        );

        linear_interpolate(
            last_bytes as f64,
            tunables.small_heap_size_max_bytes() as f64,
            tunables.high_frequency_small_heap_growth(),
            tunables.large_heap_size_min_bytes() as f64,
            tunables.high_frequency_large_heap_growth(),
        )
    }
}

/// Thresholds for a zone's GC cell bytes.
#[derive(Debug, Clone, Default)]
pub struct GcHeapThreshold(HeapThreshold);

impl Deref for GcHeapThreshold {
    type Target = HeapThreshold;

    fn deref(&self) -> &HeapThreshold {
        &self.0
    }
}

impl GcHeapThreshold {
    /// Mutable access to the shared threshold state.
    #[inline]
    pub fn threshold_mut(&mut self) -> &mut HeapThreshold {
        &mut self.0
    }

    /// Classic trigger: `max(last, base) * growth`, capped so the
    /// incremental limit stays under the hard heap limit.
    pub fn compute_zone_trigger_bytes(
        growth_factor: f64,
        last_bytes: usize,
        tunables: &SchedulingTunables,
    ) -> usize {
        let base = last_bytes.max(tunables.gc_zone_alloc_threshold_base());
        let trigger = base as f64 * growth_factor;
        let trigger_max = tunables.gc_max_bytes() as f64 / tunables.large_heap_incremental_limit();
        to_clamped_size(trigger_max.min(trigger))
    }

    /// Balanced heap limit in bytes.
    ///
    /// `M = W + min(d * sqrt((W + W0) * g / s), 3W)`, floored at
    /// `max(10MB, W + 3MB)`, where `W` is the retained size in MB, `g` the
    /// mutator allocation rate and `s` the collection rate in MB/s.
    pub fn compute_balanced_heap_limit(
        last_bytes: usize,
        allocation_rate: f64,
        collection_rate: f64,
        tunables: &SchedulingTunables,
    ) -> f64 {
        let w = last_bytes as f64 / BYTES_PER_MB;
        let w0 = BALANCED_HEAP_BASE_MB;
        let d = tunables.heap_growth_factor();
        // A zone that freed nothing reports a zero rate; treat it as very
        // slow so growth hits the cap instead of dividing by zero.
        let g = if allocation_rate.is_finite() { allocation_rate.max(0.0) } else { 0.0 };
        let s = if collection_rate.is_finite() {
            collection_rate.max(MIN_COLLECTION_RATE)
        } else {
            DEFAULT_COLLECTION_RATE
        };
        let f = d * ((w + w0) * (g / s)).sqrt();
        let m = w + f.min(MAX_HEAP_GROWTH * w);
        let m = m
            .max(MIN_BALANCED_HEAP_LIMIT_MB)
            .max(w + MIN_BALANCED_HEADROOM_MB);

        m * BYTES_PER_MB
    }

    /// Recompute the start threshold and incremental limit after a
    /// collection retained `last_bytes`.
    pub fn update_start_threshold(
        &mut self,
        last_bytes: usize,
        allocation_rate: Option<f64>,
        collection_rate: Option<f64>,
        tunables: &SchedulingTunables,
        state: &SchedulingState,
    ) {
        if !tunables.balanced_heap_limits_enabled() {
            let growth_factor =
                HeapThreshold::compute_zone_heap_growth_factor_for_heap_size(last_bytes, tunables, state);
            self.0.start_bytes = Self::compute_zone_trigger_bytes(growth_factor, last_bytes, tunables);
        } else {
            let threshold = Self::compute_balanced_heap_limit(
                last_bytes,
                allocation_rate.unwrap_or(DEFAULT_ALLOCATION_RATE),
                collection_rate.unwrap_or(DEFAULT_COLLECTION_RATE),
                tunables,
            );
            let trigger_max = tunables.gc_max_bytes() as f64 / tunables.large_heap_incremental_limit();
            self.0.start_bytes = to_clamped_size(trigger_max.min(threshold));
        }

        self.0.set_incremental_limit_from_start_bytes(last_bytes, tunables);
    }
}

/// Thresholds for malloc memory associated with a zone's cells.
#[derive(Debug, Clone, Default)]
pub struct MallocHeapThreshold(HeapThreshold);

impl Deref for MallocHeapThreshold {
    type Target = HeapThreshold;

    fn deref(&self) -> &HeapThreshold {
        &self.0
    }
}

impl MallocHeapThreshold {
    /// Mutable access to the shared threshold state.
    #[inline]
    pub fn threshold_mut(&mut self) -> &mut HeapThreshold {
        &mut self.0
    }

    /// `max(last, base) * growth`.
    pub fn compute_zone_trigger_bytes(growth_factor: f64, last_bytes: usize, base_bytes: usize) -> usize {
        to_clamped_size(last_bytes.max(base_bytes) as f64 * growth_factor)
    }

    /// Recompute the start threshold and incremental limit.
    pub fn update_start_threshold(
        &mut self,
        last_bytes: usize,
        tunables: &SchedulingTunables,
        state: &SchedulingState,
    ) {
        let growth_factor =
            HeapThreshold::compute_zone_heap_growth_factor_for_heap_size(last_bytes, tunables, state);
        self.0.start_bytes =
            Self::compute_zone_trigger_bytes(growth_factor, last_bytes, tunables.malloc_threshold_base());
        self.0.set_incremental_limit_from_start_bytes(last_bytes, tunables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::ParamKey;
    use std::time::{Duration, Instant};

    const MB: usize = 1024 * 1024;

    fn high_frequency_state(tunables: &SchedulingTunables) -> SchedulingState {
        let mut state = SchedulingState::new();
        let now = Instant::now();
        state.update_high_frequency_mode(Some(now), now + Duration::from_millis(10), tunables);
        assert!(state.in_high_frequency_gc_mode());
        state
    }

    fn heap_size(bytes: usize) -> HeapSize {
        let mut size = HeapSize::default();
        size.add_bytes(bytes);
        size
    }

    #[test]
    fn test_linear_interpolate() {
        assert_eq!(linear_interpolate(0.0, 10.0, 1.0, 20.0, 2.0), 1.0);
        assert_eq!(linear_interpolate(15.0, 10.0, 1.0, 20.0, 2.0), 1.5);
        assert_eq!(linear_interpolate(25.0, 10.0, 1.0, 20.0, 2.0), 2.0);
    }

    #[test]
    fn test_interpolated_growth_factor_scenario() {
        let mut tunables = SchedulingTunables::default();
        tunables.set_parameter(ParamKey::SmallHeapSizeMax, 10).unwrap();
        tunables.set_parameter(ParamKey::LargeHeapSizeMin, 100).unwrap();
        tunables.set_parameter(ParamKey::HighFrequencySmallHeapGrowth, 150).unwrap();
        tunables.set_parameter(ParamKey::HighFrequencyLargeHeapGrowth, 120).unwrap();
        let state = high_frequency_state(&tunables);

        let growth =
            HeapThreshold::compute_zone_heap_growth_factor_for_heap_size(55 * MB, &tunables, &state);
        assert!((growth - 1.35).abs() < 1e-9);

        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(55 * MB, None, None, &tunables, &state);
        let expected = 74.25 * MB as f64;
        assert!((threshold.start_bytes() as f64 - expected).abs() < 2.0);
        assert!(threshold.incremental_limit_bytes() >= threshold.start_bytes());
    }

    #[test]
    fn test_low_frequency_and_small_heaps_use_flat_growth() {
        let tunables = SchedulingTunables::default();
        let idle = SchedulingState::new();
        let busy = high_frequency_state(&tunables);

        let lf = HeapThreshold::compute_zone_heap_growth_factor_for_heap_size(200 * MB, &tunables, &idle);
        assert_eq!(lf, tunables.low_frequency_heap_growth());

        let small = HeapThreshold::compute_zone_heap_growth_factor_for_heap_size(512 * 1024, &tunables, &busy);
        assert_eq!(small, tunables.low_frequency_heap_growth());
    }

    #[test]
    fn test_start_threshold_uses_alloc_threshold_base() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(0, None, None, &tunables, &state);
        assert_eq!(threshold.start_bytes(), (27.0 * 1.5 * MB as f64) as usize);
    }

    #[test]
    fn test_start_threshold_is_capped_by_max_bytes() {
        let mut tunables = SchedulingTunables::default();
        tunables.set_parameter(ParamKey::MaxBytes, 64 * MB as u32).unwrap();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(60 * MB, None, None, &tunables, &state);
        let cap = (64 * MB) as f64 / tunables.large_heap_incremental_limit();
        assert_eq!(threshold.start_bytes(), cap as usize);
    }

    #[test]
    fn test_incremental_limit_adds_max_nursery() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(0, None, None, &tunables, &state);
        // 1.5x of ~40MB is smaller than start + 64MB of nursery.
        assert_eq!(
            threshold.incremental_limit_bytes(),
            threshold.start_bytes() + tunables.gc_max_nursery_bytes()
        );
    }

    #[test]
    fn test_balanced_limit_scenario() {
        let tunables = SchedulingTunables::default();
        let limit = GcHeapThreshold::compute_balanced_heap_limit(20 * MB, 5.0, 200.0, &tunables);
        let limit_mb = limit / MB as f64;
        assert!(limit_mb >= 23.0);
        assert!(limit_mb <= 80.0);
        // 50 * sqrt(25 * 0.025) = 39.5, under the 3W cap of 60.
        assert!((limit_mb - (20.0 + 50.0 * (25.0f64 * 0.025).sqrt())).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_limit_floors() {
        let tunables = SchedulingTunables::default();
        let idle = GcHeapThreshold::compute_balanced_heap_limit(2 * MB, 0.0, 200.0, &tunables);
        assert_eq!(idle, 10.0 * MB as f64);
        let retained = GcHeapThreshold::compute_balanced_heap_limit(40 * MB, 0.0, 200.0, &tunables);
        assert_eq!(retained, 43.0 * MB as f64);
    }

    #[test]
    fn test_balanced_limit_with_degenerate_rates() {
        let tunables = SchedulingTunables::default();

        // Zero collection rate: growth is capped at 3W.
        let stalled = GcHeapThreshold::compute_balanced_heap_limit(20 * MB, 5.0, 0.0, &tunables);
        assert_eq!(stalled, 80.0 * MB as f64);

        for (g, s) in [(0.0, 0.0), (f64::NAN, 100.0), (5.0, f64::NAN), (f64::INFINITY, -1.0)] {
            let m = GcHeapThreshold::compute_balanced_heap_limit(20 * MB, g, s, &tunables);
            assert!(m.is_finite(), "g={g} s={s}");
            assert!(m >= 23.0 * MB as f64 && m <= 80.0 * MB as f64, "g={g} s={s}");
        }

        let mut threshold = GcHeapThreshold::default();
        let mut tunables = tunables;
        tunables.set_parameter(ParamKey::BalancedHeapLimitsEnabled, 1).unwrap();
        threshold.update_start_threshold(20 * MB, Some(5.0), Some(0.0), &tunables, &SchedulingState::new());
        assert!(threshold.start_bytes() <= 80 * MB);
        assert!(threshold.incremental_limit_bytes() >= threshold.start_bytes());
    }

    #[test]
    fn test_balanced_limit_is_monotonic() {
        let tunables = SchedulingTunables::default();
        let mut prev = 0.0;
        for g in [0.5, 1.0, 2.0, 4.0, 8.0] {
            let m = GcHeapThreshold::compute_balanced_heap_limit(30 * MB, g, 100.0, &tunables);
            assert!(m >= prev);
            prev = m;
        }
        let mut prev = 0.0;
        for w in [5, 10, 20, 40, 80] {
            let m = GcHeapThreshold::compute_balanced_heap_limit(w * MB, 3.0, 100.0, &tunables);
            assert!(m >= prev);
            prev = m;
        }
    }

    #[test]
    fn test_balanced_model_selected_by_parameter() {
        let mut tunables = SchedulingTunables::default();
        tunables.set_parameter(ParamKey::BalancedHeapLimitsEnabled, 1).unwrap();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(20 * MB, Some(5.0), Some(200.0), &tunables, &state);
        let expected = GcHeapThreshold::compute_balanced_heap_limit(20 * MB, 5.0, 200.0, &tunables);
        assert_eq!(threshold.start_bytes(), expected as usize);
    }

    #[test]
    fn test_slice_threshold_normal_delay() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(0, None, None, &tunables, &state);

        let size = heap_size(10 * MB);
        threshold.threshold_mut().set_slice_threshold(&size, &tunables, false);
        assert_eq!(threshold.slice_bytes(), Some(10 * MB + tunables.zone_alloc_delay_bytes()));
    }

    #[test]
    fn test_slice_threshold_shrinks_when_urgent() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(0, None, None, &tunables, &state);

        let limit = threshold.incremental_limit_bytes();
        let size = heap_size(limit - 4 * MB);
        threshold.threshold_mut().set_slice_threshold(&size, &tunables, false);
        // 4MB of 16MB urgent headroom left: a quarter of the 1MB delay.
        assert_eq!(threshold.slice_bytes(), Some(limit - 4 * MB + 256 * 1024));
        assert!(threshold.slice_bytes().unwrap() <= limit);
    }

    #[test]
    fn test_slice_threshold_waits_for_background_task() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(0, None, None, &tunables, &state);

        let size = heap_size(10 * MB);
        threshold.threshold_mut().set_slice_threshold(&size, &tunables, true);
        let urgent_point = threshold.incremental_limit_bytes() - tunables.urgent_threshold_bytes();
        assert_eq!(threshold.slice_bytes(), Some(urgent_point));
    }

    #[test]
    fn test_slice_threshold_clamped_by_new_incremental_limit() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(200 * MB, None, None, &tunables, &state);
        let size = heap_size(threshold.incremental_limit_bytes() - MB / 2);
        threshold.threshold_mut().set_slice_threshold(&size, &tunables, false);

        // Shrinking the heap recomputes a smaller limit; the slice follows it.
        threshold.update_start_threshold(0, None, None, &tunables, &state);
        let slice = threshold.slice_bytes().unwrap();
        assert!(slice <= threshold.incremental_limit_bytes());
    }

    #[test]
    fn test_malloc_threshold_uses_malloc_base() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = MallocHeapThreshold::default();
        threshold.update_start_threshold(0, &tunables, &state);
        assert_eq!(threshold.start_bytes(), (38.0 * 1.5 * MB as f64) as usize);
        assert!(threshold.incremental_limit_bytes() >= threshold.start_bytes());
    }

    #[test]
    fn test_eager_alloc_trigger() {
        let tunables = SchedulingTunables::default();
        let state = SchedulingState::new();
        let mut threshold = GcHeapThreshold::default();
        threshold.update_start_threshold(0, None, None, &tunables, &state);
        let start = threshold.start_bytes() as f64;
        assert_eq!(threshold.eager_alloc_trigger(true), start * 0.85);
        assert_eq!(threshold.eager_alloc_trigger(false), start * 0.9);
    }

    #[test]
    fn test_exponential_moving_average() {
        assert_eq!(exponential_moving_average(10.0, 20.0, 0.5), 15.0);
        assert_eq!(exponential_moving_average(10.0, 20.0, 1.0), 20.0);
    }

    #[test]
    fn test_heap_size_tracks_freed_bytes() {
        let mut size = HeapSize::default();
        size.add_bytes(100);
        size.update_on_gc_start();
        size.remove_bytes(30, true);
        size.remove_bytes(10, false);
        assert_eq!(size.bytes(), 60);
        assert_eq!(size.initial_bytes(), 100);
        assert_eq!(size.freed_bytes(), 30);
        size.clear_freed_bytes();
        assert_eq!(size.freed_bytes(), 0);
    }
}
