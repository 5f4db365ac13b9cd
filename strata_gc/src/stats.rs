//! GC statistics and nursery profiling.
//!
//! [`GcStats`] accumulates counters over the heap's lifetime.
//! [`NurseryProfile`] holds per-phase times of a single minor collection and
//! is logged when profiling is enabled and the collection was slow enough.

use crate::GcReason;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Cumulative statistics about collector activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Bytes allocated in the nursery.
    pub nursery_bytes_allocated: AtomicU64,
    /// Cells allocated in the nursery.
    pub nursery_cells_allocated: AtomicU64,
    /// Bytes allocated directly in the tenured heap.
    pub tenured_bytes_allocated: AtomicU64,
    /// Cells allocated directly in the tenured heap.
    pub tenured_cells_allocated: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of minor collections.
    pub minor_collections: AtomicU64,
    /// Number of major collections reported by the tenured collector.
    pub major_collections: AtomicU64,
    /// Total time spent in minor GC (nanoseconds).
    pub minor_gc_time_ns: AtomicU64,
    /// Total time spent in major GC (nanoseconds).
    pub major_gc_time_ns: AtomicU64,

    // =========================================================================
    // Promotion Statistics
    // =========================================================================
    /// Bytes tenured by minor collections.
    pub bytes_tenured: AtomicU64,
    /// Cells tenured by minor collections.
    pub cells_tenured: AtomicU64,
    /// Strings redirected to an existing tenured copy.
    pub strings_deduplicated: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            nursery_bytes_allocated: AtomicU64::new(0),
            nursery_cells_allocated: AtomicU64::new(0),
            tenured_bytes_allocated: AtomicU64::new(0),
            tenured_cells_allocated: AtomicU64::new(0),
            minor_collections: AtomicU64::new(0),
            major_collections: AtomicU64::new(0),
            minor_gc_time_ns: AtomicU64::new(0),
            major_gc_time_ns: AtomicU64::new(0),
            bytes_tenured: AtomicU64::new(0),
            cells_tenured: AtomicU64::new(0),
            strings_deduplicated: AtomicU64::new(0),
        }
    }

    /// Record a nursery allocation.
    #[inline]
    pub fn record_nursery_allocation(&self, size: usize) {
        self.nursery_bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        self.nursery_cells_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a direct tenured allocation.
    #[inline]
    pub fn record_tenured_allocation(&self, size: usize) {
        self.tenured_bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        self.tenured_cells_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished minor GC.
    pub fn record_minor_gc(&self, duration: Duration, tenured_bytes: usize, tenured_cells: usize, deduplicated: usize) {
        self.minor_collections.fetch_add(1, Ordering::Relaxed);
        self.minor_gc_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.bytes_tenured
            .fetch_add(tenured_bytes as u64, Ordering::Relaxed);
        self.cells_tenured
            .fetch_add(tenured_cells as u64, Ordering::Relaxed);
        self.strings_deduplicated
            .fetch_add(deduplicated as u64, Ordering::Relaxed);
    }

    /// Record a major GC reported by the tenured collector.
    pub fn record_major_gc(&self, duration: Duration) {
        self.major_collections.fetch_add(1, Ordering::Relaxed);
        self.major_gc_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get average minor GC pause time.
    pub fn avg_minor_pause(&self) -> Duration {
        let count = self.minor_collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.minor_gc_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / count)
    }

    /// Get total GC time.
    pub fn total_gc_time(&self) -> Duration {
        let minor_ns = self.minor_gc_time_ns.load(Ordering::Relaxed);
        let major_ns = self.major_gc_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(minor_ns + major_ns)
    }

    /// Log a summary of GC statistics.
    pub fn log_summary(&self) {
        info!(
            nursery_cells = self.nursery_cells_allocated.load(Ordering::Relaxed),
            nursery_bytes = %format_bytes(self.nursery_bytes_allocated.load(Ordering::Relaxed)),
            tenured_cells = self.tenured_cells_allocated.load(Ordering::Relaxed),
            tenured_bytes = %format_bytes(self.tenured_bytes_allocated.load(Ordering::Relaxed)),
            "allocations"
        );
        info!(
            minor = self.minor_collections.load(Ordering::Relaxed),
            major = self.major_collections.load(Ordering::Relaxed),
            total_time = ?self.total_gc_time(),
            avg_minor = ?self.avg_minor_pause(),
            "collections"
        );
        info!(
            cells = self.cells_tenured.load(Ordering::Relaxed),
            bytes = %format_bytes(self.bytes_tenured.load(Ordering::Relaxed)),
            deduplicated = self.strings_deduplicated.load(Ordering::Relaxed),
            "promotions"
        );
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Timed phases of a minor collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKey {
    /// Whole collection.
    Total,
    /// Tracing store buffer entries.
    TraceStoreBuffer,
    /// Tracing the root set.
    TraceRoots,
    /// Draining the moved-cell lists.
    CollectToFixedPoint,
    /// Running the embedder's tenured callback.
    ObjectsTenuredCallback,
    /// Sweeping the unique id table.
    SweepUniqueIds,
    /// Rewriting registered buffer pointers.
    UpdateBufferRefs,
    /// Freeing buffers of dead cells.
    FreeMallocedBuffers,
    /// Resetting and poisoning the nursery.
    ClearNursery,
    /// Pretenuring decisions.
    Pretenure,
    /// Resizing the nursery.
    Resize,
}

impl ProfileKey {
    /// Every key, in log order.
    pub const ALL: [ProfileKey; 11] = [
        ProfileKey::Total,
        ProfileKey::TraceStoreBuffer,
        ProfileKey::TraceRoots,
        ProfileKey::CollectToFixedPoint,
        ProfileKey::ObjectsTenuredCallback,
        ProfileKey::SweepUniqueIds,
        ProfileKey::UpdateBufferRefs,
        ProfileKey::FreeMallocedBuffers,
        ProfileKey::ClearNursery,
        ProfileKey::Pretenure,
        ProfileKey::Resize,
    ];

    /// Short column label.
    pub fn label(self) -> &'static str {
        match self {
            ProfileKey::Total => "total",
            ProfileKey::TraceStoreBuffer => "strbuf",
            ProfileKey::TraceRoots => "roots",
            ProfileKey::CollectToFixedPoint => "collct",
            ProfileKey::ObjectsTenuredCallback => "tenCB",
            ProfileKey::SweepUniqueIds => "swpUid",
            ProfileKey::UpdateBufferRefs => "bufRef",
            ProfileKey::FreeMallocedBuffers => "frSlts",
            ProfileKey::ClearNursery => "clear",
            ProfileKey::Pretenure => "pretnr",
            ProfileKey::Resize => "resize",
        }
    }
}

/// Per-phase durations of one minor collection.
#[derive(Debug, Clone, Default)]
pub struct NurseryProfile {
    times: [Duration; ProfileKey::ALL.len()],
}

impl NurseryProfile {
    /// Time recorded for `key`.
    #[inline]
    pub fn get(&self, key: ProfileKey) -> Duration {
        self.times[key as usize]
    }

    pub(crate) fn set(&mut self, key: ProfileKey, duration: Duration) {
        self.times[key as usize] = duration;
    }

    /// Time a phase and record it.
    pub(crate) fn time<R>(&mut self, key: ProfileKey, f: impl FnOnce() -> R) -> R {
        let timer = GcTimer::start(key.label());
        let result = f();
        self.set(key, timer.stop());
        result
    }

    /// Emit the profile line if the collection took at least `threshold`.
    pub fn log_if_slow(&self, threshold: Duration, reason: GcReason) {
        if self.get(ProfileKey::Total) < threshold {
            return;
        }
        info!(reason = ?reason, profile = %self, "minor GC profile");
    }
}

impl fmt::Display for NurseryProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in ProfileKey::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}us", key.label(), self.get(*key).as_micros())?;
        }
        Ok(())
    }
}

/// Timer for measuring GC phases.
pub struct GcTimer {
    start: Instant,
    label: &'static str,
}

impl GcTimer {
    /// Start a new timer with the given label.
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Stop the timer and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        trace!(phase = self.label, ?elapsed, "GC phase");
        elapsed
    }
}
