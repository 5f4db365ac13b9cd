//! Strata Garbage Collector
//!
//! The young generation and heap scheduling core of a generational, moving
//! garbage collector.
//!
//! # Architecture
//!
//! - **Nursery**: Bump-pointer allocation over lazily mapped 256KB chunks.
//!   Live cells are evacuated into the tenured heap by a minor collection and
//!   the nursery is reused from its first chunk.
//!
//! - **Tenuring tracer**: Copies every nursery cell reachable from roots and
//!   the store buffer into the tenured heap exactly once, leaving a relocation
//!   overlay at the old address. Newly tenured cells are threaded onto
//!   per-kind lists which are drained until no new work appears.
//!
//! - **Decommit task**: Chunks released by a nursery shrink are handed to a
//!   helper thread which returns their memory to the OS.
//!
//! - **Scheduling**: Named tunables, the high-frequency GC flag and the
//!   per-zone heap thresholds that decide when the next major collection
//!   should start.
//!
//! # Usage
//!
//! ```ignore
//! use strata_gc::{GcHeap, GcKind, GcReason, Value};
//!
//! let mut heap = GcHeap::new();
//! let zone = heap.create_zone();
//!
//! let obj = heap.new_object(zone, 4).expect("allocation failed");
//! let root = heap.roots_mut().add(Value::from_cell(obj));
//!
//! heap.collect(GcKind::Normal, GcReason::ApiRequest);
//! let moved = heap.roots().get(root);
//! ```
//!
//! # Safety
//!
//! Cell pointers are only stable until the next minor collection. Anything
//! that must survive a collection has to be reachable from the root set or
//! from a tenured cell whose stores went through the heap's barriers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod cell;
pub mod collector;
pub mod config;
pub mod heap;
pub mod memory_tracker;
pub mod roots;
pub mod scheduling;
pub mod trace;
pub mod zone;

mod stats;

pub use cell::{CellPtr, TraceKind, Value};
pub use collector::MinorGcReport;
pub use config::{ConfigError, GcConfig};
pub use heap::{GcHeap, MajorGcReport, Nursery, ZoneSweep};
pub use memory_tracker::{MemoryTracker, MemoryUse};
pub use roots::{BufferRefId, RootId, RootSet};
pub use scheduling::{ParamKey, SchedulingState, SchedulingTunables, TunableError};
pub use stats::{GcStats, NurseryProfile, ProfileKey};
pub use trace::Tracer;
pub use zone::{ZoneAllocator, ZoneId};

/// Why a collection was requested.
///
/// The discriminant is stored in an atomic by [`Nursery::request_minor_gc`],
/// so zero is reserved for "no reason".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// Embedder asked for a collection.
    ApiRequest = 1,
    /// The nursery ran out of space.
    OutOfNursery = 2,
    /// The store buffer's slot list overflowed.
    FullSlotBuffer = 3,
    /// The store buffer's whole-cell list overflowed.
    FullWholeCellBuffer = 4,
    /// A zone's GC heap crossed its start threshold.
    AllocTrigger = 5,
    /// A zone's malloc heap crossed its start threshold.
    TooMuchMalloc = 6,
    /// Final attempt before reporting an allocation failure.
    LastDitch = 7,
    /// The system reported memory pressure.
    MemPressure = 8,
    /// Collection in idle time.
    IdleTime = 9,
    /// Nursery is being evicted before being disabled.
    EvictNursery = 10,
    /// The owning heap is shutting down.
    DestroyRuntime = 11,
}

impl GcReason {
    pub(crate) fn from_u8(raw: u8) -> Option<GcReason> {
        Some(match raw {
            1 => GcReason::ApiRequest,
            2 => GcReason::OutOfNursery,
            3 => GcReason::FullSlotBuffer,
            4 => GcReason::FullWholeCellBuffer,
            5 => GcReason::AllocTrigger,
            6 => GcReason::TooMuchMalloc,
            7 => GcReason::LastDitch,
            8 => GcReason::MemPressure,
            9 => GcReason::IdleTime,
            10 => GcReason::EvictNursery,
            11 => GcReason::DestroyRuntime,
            _ => return None,
        })
    }

    /// Reasons that indicate the process is short of memory.
    #[inline]
    pub fn is_oom_reason(self) -> bool {
        matches!(self, GcReason::LastDitch | GcReason::MemPressure)
    }

    /// Reasons issued while tearing the heap down.
    #[inline]
    pub fn is_shutdown_reason(self) -> bool {
        matches!(self, GcReason::DestroyRuntime)
    }
}

/// Collection flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcKind {
    /// Regular collection.
    #[default]
    Normal,
    /// Release as much memory as possible; the nursery drops to its minimum.
    Shrink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trips_through_u8() {
        for reason in [
            GcReason::ApiRequest,
            GcReason::OutOfNursery,
            GcReason::FullSlotBuffer,
            GcReason::FullWholeCellBuffer,
            GcReason::AllocTrigger,
            GcReason::TooMuchMalloc,
            GcReason::LastDitch,
            GcReason::MemPressure,
            GcReason::IdleTime,
            GcReason::EvictNursery,
            GcReason::DestroyRuntime,
        ] {
            assert_eq!(GcReason::from_u8(reason as u8), Some(reason));
        }
        assert_eq!(GcReason::from_u8(0), None);
    }

    #[test]
    fn test_oom_reasons() {
        assert!(GcReason::LastDitch.is_oom_reason());
        assert!(GcReason::MemPressure.is_oom_reason());
        assert!(!GcReason::OutOfNursery.is_oom_reason());
        assert!(GcReason::DestroyRuntime.is_shutdown_reason());
    }
}
