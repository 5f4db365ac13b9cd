//! Minor (nursery) collection.
//!
//! Every live nursery cell is evacuated into the tenured heap and the
//! nursery is reused from its first chunk:
//!
//! ```text
//!   Idle ─► TracingRoots ─► FixupWorklist ─► Sweep ─► Clear ─► Idle
//!           store buffer     drain moved      uids,
//!           + root set       lists to a       buffer refs,
//!                            fixed point      dead buffers
//! ```
//!
//! A collection always runs to completion. Afterwards no nursery address is
//! reachable from roots or tenured cells; stale addresses held elsewhere can
//! be fixed with [`Nursery::get_forwarded_pointer`] from the objects-tenured
//! callback, which runs before the nursery is cleared.

use super::tenuring::TenuringTracer;
use crate::barrier::StoreBufferEntry;
use crate::cell::CellPtr;
use crate::heap::{CollectionPhase, GcHeap, Nursery};
use crate::stats::{NurseryProfile, ProfileKey};
use crate::trace::{trace_children, NurseryEdgeChecker};
use crate::{GcKind, GcReason};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Result of a minor collection.
#[derive(Debug, Clone)]
pub struct MinorGcReport {
    /// Why the collection ran.
    pub reason: GcReason,
    /// Collection flavour.
    pub kind: GcKind,
    /// Nursery bytes in use when the collection started.
    pub used_bytes: usize,
    /// Bytes copied into the tenured heap.
    pub tenured_bytes: usize,
    /// Cells copied into the tenured heap.
    pub tenured_cells: usize,
    /// Strings merged with an equal tenured string.
    pub deduplicated_strings: usize,
    /// Tenured bytes over used bytes.
    pub promotion_rate: f64,
    /// Malloced buffers of dead cells that were freed, in bytes.
    pub freed_buffer_bytes: usize,
    /// Capacity before resizing.
    pub capacity_before: usize,
    /// Capacity after resizing.
    pub capacity_after: usize,
    /// Zones that switched to tenured string allocation.
    pub pretenured_zones: usize,
    /// Wall time of the whole collection.
    pub duration: Duration,
    /// Per-phase times.
    pub profile: NurseryProfile,
}

/// Run a minor collection on `heap`.
pub(crate) fn collect(heap: &mut GcHeap, kind: GcKind, reason: GcReason) -> MinorGcReport {
    let start = Instant::now();
    let mut profile = NurseryProfile::default();

    heap.nursery.clear_minor_gc_request();
    heap.nursery.begin_collection(start);

    let capacity_before = heap.nursery.capacity();
    let used_bytes = heap.nursery.used_space();
    let tracker = heap.tracker.clone();

    // Tracing and fix-up.
    let (tenured_bytes, tenured_cells, deduplicated_strings) = {
        let GcHeap {
            nursery,
            tenured,
            zones,
            store_buffer,
            roots,
            ..
        } = &mut *heap;

        let mut mover = TenuringTracer::new(nursery, tenured, zones, tracker.as_deref());

        profile.time(ProfileKey::TraceStoreBuffer, || {
            for entry in store_buffer.drain() {
                trace_store_buffer_entry(&mut mover, entry);
            }
        });
        profile.time(ProfileKey::TraceRoots, || roots.trace(&mut mover));

        mover.set_phase(CollectionPhase::FixupWorklist);
        profile.time(ProfileKey::CollectToFixedPoint, || {
            mover.collect_to_fixed_point();
            mover.promote_cell_buffers();
        });

        (mover.tenured_bytes, mover.tenured_cells, mover.deduplicated_strings)
    };

    if let Some(callback) = heap.objects_tenured_callback.as_mut() {
        let nursery = &heap.nursery;
        profile.time(ProfileKey::ObjectsTenuredCallback, || callback(nursery));
    }

    // Sweep.
    heap.nursery.set_phase(CollectionPhase::Sweep);
    profile.time(ProfileKey::SweepUniqueIds, || {
        sweep_unique_ids(&mut heap.nursery, &mut heap.unique_ids)
    });
    profile.time(ProfileKey::UpdateBufferRefs, || {
        heap.roots.update_buffer_refs(&heap.nursery);
    });
    if let Some(tracker) = &tracker {
        let nursery = &heap.nursery;
        tracker.fixup_after_moving_gc(|cell| {
            let mut moved = cell;
            nursery.get_forwarded_pointer(&mut moved).then_some(moved)
        });
    }
    let freed_buffer_bytes =
        profile.time(ProfileKey::FreeMallocedBuffers, || heap.nursery.free_malloced_buffers());

    // Clear.
    heap.nursery.set_phase(CollectionPhase::Clear);
    profile.time(ProfileKey::ClearNursery, || heap.nursery.clear());
    heap.store_buffer.clear();

    heap.nursery
        .record_previous_gc(reason, used_bytes, tenured_bytes, tenured_cells);
    let promotion_rate = heap.nursery.promotion_rate();

    let pretenured_zones = profile.time(ProfileKey::Pretenure, || {
        let mut count = 0;
        for zone in heap.zones.iter_mut() {
            if zone.maybe_pretenure_strings(promotion_rate, &heap.tunables) {
                debug!(zone = zone.id().index(), promotion_rate, "pretenuring strings");
                count += 1;
            }
        }
        count
    });

    profile.time(ProfileKey::Resize, || {
        heap.nursery
            .maybe_resize(kind, reason, &heap.tunables, Instant::now())
    });

    let end = Instant::now();
    heap.nursery.end_collection(end);
    let duration = end.saturating_duration_since(start);
    profile.set(ProfileKey::Total, duration);

    heap.stats
        .record_minor_gc(duration, tenured_bytes, tenured_cells, deduplicated_strings);

    if heap.config.verify_after_minor_gc {
        verify_no_nursery_edges(heap);
    }

    let report = MinorGcReport {
        reason,
        kind,
        used_bytes,
        tenured_bytes,
        tenured_cells,
        deduplicated_strings,
        promotion_rate,
        freed_buffer_bytes,
        capacity_before,
        capacity_after: heap.nursery.capacity(),
        pretenured_zones,
        duration,
        profile,
    };

    debug!(
        reason = ?report.reason,
        tenured_bytes = report.tenured_bytes,
        tenured_cells = report.tenured_cells,
        promotion_rate = report.promotion_rate,
        ?duration,
        capacity = report.capacity_after,
        "minor GC"
    );
    if let Some(threshold) = heap.config.profile_nursery {
        report.profile.log_if_slow(threshold, reason);
    }

    report
}

fn trace_store_buffer_entry(mover: &mut TenuringTracer<'_>, entry: StoreBufferEntry) {
    match entry {
        StoreBufferEntry::Slot { cell, index } => {
            if let Some(cell) = CellPtr::from_raw(cell as *mut u8) {
                // Safety: the barrier only records tenured cells.
                unsafe { mover.trace_slot(cell, index as usize) };
            }
        }
        StoreBufferEntry::WholeCell { cell } => {
            if let Some(cell) = CellPtr::from_raw(cell as *mut u8) {
                // Safety: as above.
                unsafe { mover.trace_whole_cell(cell) };
            }
        }
    }
}

/// Move unique ids of tenured cells to their new address and drop those of
/// dead cells.
fn sweep_unique_ids(nursery: &mut Nursery, unique_ids: &mut FxHashMap<CellPtr, u64>) {
    for cell in nursery.take_cells_with_uid() {
        let Some(uid) = unique_ids.remove(&cell) else {
            continue;
        };
        let mut moved = cell;
        if nursery.get_forwarded_pointer(&mut moved) {
            unique_ids.insert(moved, uid);
        }
    }
}

/// Panic if any root or tenured cell still points into the nursery.
fn verify_no_nursery_edges(heap: &mut GcHeap) {
    let GcHeap {
        nursery,
        tenured,
        roots,
        ..
    } = &mut *heap;

    let mut checker = NurseryEdgeChecker::new(nursery);
    roots.trace(&mut checker);
    tenured.for_each_cell(|cell| {
        // Safety: every tenured cell is initialised.
        unsafe { trace_children(cell, &mut checker) };
    });

    if !checker.is_clean() {
        error!(count = checker.stale.len(), first = ?checker.stale[0], "stale nursery edges after minor GC");
        panic!("{} edges still point into the nursery", checker.stale.len());
    }
}
