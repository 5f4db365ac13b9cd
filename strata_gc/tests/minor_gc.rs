//! End-to-end tests for minor collections.
//!
//! Coverage:
//! - Survival through roots, slots and the store buffer
//! - Strings: deduplication, dependent strings, unique ids
//! - Buffers: dynamic slots, BigInt digits, cell buffers, buffer refs
//! - Nursery exhaustion and requests

use std::cell::RefCell;
use std::rc::Rc;
use strata_gc::cell::{BigIntCell, ObjectCell, StringCell};
use strata_gc::heap::CollectionPhase;
use strata_gc::{
    CellPtr, GcConfig, GcHeap, GcKind, GcReason, MemoryUse, ProfileKey, TraceKind, Value, ZoneId,
};

fn heap() -> (GcHeap, ZoneId) {
    let mut heap = GcHeap::with_config(GcConfig::debug()).expect("valid config");
    let zone = heap.create_zone();
    (heap, zone)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rooted_cell(heap: &GcHeap, root: strata_gc::RootId) -> CellPtr {
    heap.roots()
        .get(root)
        .and_then(Value::as_cell)
        .expect("root holds a cell")
}

// =============================================================================
// Survival
// =============================================================================

mod survival {
    use super::*;

    #[test]
    fn test_rooted_object_is_tenured() {
        let (mut heap, zone) = heap();
        let obj = heap.new_object(zone, 2).unwrap();
        unsafe { heap.set_slot(obj, 0, Value::from_int(7)) };
        let root = heap.roots_mut().add(Value::from_cell(obj));

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);

        let moved = rooted_cell(&heap, root);
        assert_ne!(moved, obj);
        assert!(heap.tenured().contains(moved.addr()));
        assert!(heap.nursery().is_empty());
        assert_eq!(report.tenured_cells, 1);
        assert_eq!(unsafe { heap.get_slot(moved, 0) }, Some(Value::from_int(7)));
        assert_eq!(unsafe { heap.get_slot(moved, 1) }, Some(Value::UNDEFINED));
    }

    #[test]
    fn test_unreachable_cells_are_not_copied() {
        let (mut heap, zone) = heap();
        for _ in 0..100 {
            heap.new_object(zone, 1).unwrap();
        }
        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.tenured_cells, 0);
        assert_eq!(report.promotion_rate, 0.0);
        assert!(report.used_bytes > 0);
    }

    #[test]
    fn test_chain_through_slots_survives() {
        let (mut heap, zone) = heap();
        let head = heap.new_object(zone, 1).unwrap();
        let root = heap.roots_mut().add(Value::from_cell(head));

        let mut prev = head;
        for i in 0..10 {
            let next = heap.new_object(zone, 2).unwrap();
            unsafe {
                heap.set_slot(next, 1, Value::from_int(i));
                heap.set_slot(prev, 0, Value::from_cell(next));
            }
            prev = next;
        }
        // Close a cycle back to the head.
        unsafe { heap.set_slot(prev, 0, Value::from_cell(head)) };

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.tenured_cells, 11);

        let head = rooted_cell(&heap, root);
        let mut cell = head;
        for i in 0..10 {
            cell = unsafe { heap.get_slot(cell, 0) }.and_then(Value::as_cell).unwrap();
            assert!(heap.tenured().contains(cell.addr()));
            assert_eq!(unsafe { heap.get_slot(cell, 1) }, Some(Value::from_int(i)));
        }
        let back = unsafe { heap.get_slot(cell, 0) }.and_then(Value::as_cell);
        assert_eq!(back, Some(head));
    }

    #[test]
    fn test_store_buffer_keeps_nursery_cell_alive() {
        let config = GcConfig {
            generational: false,
            ..GcConfig::debug()
        };
        let mut heap = GcHeap::with_config(config).unwrap();
        let zone = heap.create_zone();
        let holder = heap.new_object(zone, 1).unwrap();
        assert!(heap.tenured().contains(holder.addr()));

        assert!(heap.enable_nursery());
        let young = heap.new_object(zone, 0).unwrap();
        unsafe { heap.set_slot(holder, 0, Value::from_cell(young)) };
        assert_eq!(heap.store_buffer().len(), 1);

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.tenured_cells, 1);
        assert!(heap.store_buffer().is_empty());

        let moved = unsafe { heap.get_slot(holder, 0) }.and_then(Value::as_cell).unwrap();
        assert!(heap.tenured().contains(moved.addr()));
    }

    #[test]
    fn test_shrinking_collection_reports_profile() {
        init_tracing();
        let config = GcConfig {
            profile_nursery: Some(std::time::Duration::ZERO),
            ..GcConfig::debug()
        };
        let mut heap = GcHeap::with_config(config).unwrap();
        let zone = heap.create_zone();
        let obj = heap.new_object(zone, 0).unwrap();
        heap.roots_mut().add(Value::from_cell(obj));

        let report = heap.collect(GcKind::Shrink, GcReason::ApiRequest);
        assert_eq!(report.kind, GcKind::Shrink);
        assert_eq!(report.duration, report.profile.get(ProfileKey::Total));
        assert_eq!(report.capacity_after, heap.nursery().capacity());
    }

    #[test]
    fn test_objects_tenured_callback_sees_forwarding() {
        let (mut heap, zone) = heap();
        let obj = heap.new_object(zone, 0).unwrap();
        heap.roots_mut().add(Value::from_cell(obj));

        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        heap.set_objects_tenured_callback(move |nursery| {
            let mut stale = obj;
            if nursery.get_forwarded_pointer(&mut stale) {
                *sink.borrow_mut() = Some(stale);
            }
        });

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        let forwarded = seen.borrow().expect("callback ran");
        assert!(heap.tenured().contains(forwarded.addr()));
        assert!(report.profile.get(ProfileKey::Total) >= report.profile.get(ProfileKey::ObjectsTenuredCallback));
    }

    #[test]
    fn test_forwarding_is_unavailable_after_collection() {
        // Debug config poisons the cleared nursery.
        let (mut heap, zone) = heap();
        let obj = heap.new_object(zone, 0).unwrap();
        let root = heap.roots_mut().add(Value::from_cell(obj));

        heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(heap.nursery().phase(), CollectionPhase::Idle);

        let mut stale = obj;
        assert!(!heap.get_forwarded_pointer(&mut stale));
        assert_eq!(stale, obj);
        assert!(heap.tenured().contains(rooted_cell(&heap, root).addr()));
    }

    #[test]
    fn test_forwarding_is_unavailable_once_nursery_is_reused() {
        let config = GcConfig {
            poison_nursery: false,
            ..GcConfig::debug()
        };
        let mut heap = GcHeap::with_config(config).unwrap();
        let zone = heap.create_zone();
        let obj = heap.new_object(zone, 0).unwrap();
        heap.roots_mut().add(Value::from_cell(obj));
        heap.collect(GcKind::Normal, GcReason::ApiRequest);

        // The next allocation lands on the old address.
        let reused = heap.new_object(zone, 0).unwrap();
        assert_eq!(reused, obj);

        let mut cell = obj;
        assert!(!heap.get_forwarded_pointer(&mut cell));
        assert_eq!(cell, reused);
    }

    #[test]
    fn test_callback_runs_while_forwarding_is_valid() {
        let (mut heap, zone) = heap();
        let obj = heap.new_object(zone, 0).unwrap();
        heap.roots_mut().add(Value::from_cell(obj));

        let phase = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&phase);
        heap.set_objects_tenured_callback(move |nursery| {
            *sink.borrow_mut() = Some(nursery.phase());
        });
        heap.collect(GcKind::Normal, GcReason::ApiRequest);

        let seen = phase.borrow().expect("callback ran");
        assert!(seen.has_forwarding());
        assert!(!heap.nursery().phase().has_forwarding());
    }
}

// =============================================================================
// Strings
// =============================================================================

mod strings {
    use super::*;

    #[test]
    fn test_equal_strings_are_merged() {
        let (mut heap, zone) = heap();
        let a = heap.new_string(zone, b"shared").unwrap();
        let b = heap.new_string(zone, b"shared").unwrap();
        let c = heap.new_string(zone, b"other").unwrap();
        let ra = heap.roots_mut().add(Value::from_cell(a));
        let rb = heap.roots_mut().add(Value::from_cell(b));
        let rc = heap.roots_mut().add(Value::from_cell(c));

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.deduplicated_strings, 1);
        assert_eq!(report.tenured_cells, 2);

        let (a, b, c) = (rooted_cell(&heap, ra), rooted_cell(&heap, rb), rooted_cell(&heap, rc));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(unsafe { StringCell::chars(a) }, b"shared");
        assert_eq!(unsafe { StringCell::chars(c) }, b"other");
    }

    #[test]
    fn test_strings_with_unique_ids_are_not_merged() {
        let (mut heap, zone) = heap();
        let a = heap.new_string(zone, b"id").unwrap();
        let b = heap.new_string(zone, b"id").unwrap();
        let ra = heap.roots_mut().add(Value::from_cell(a));
        let rb = heap.roots_mut().add(Value::from_cell(b));
        let uid = unsafe { heap.get_or_create_unique_id(b) };

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.deduplicated_strings, 0);

        let (a, b) = (rooted_cell(&heap, ra), rooted_cell(&heap, rb));
        assert_ne!(a, b);
        assert_eq!(heap.unique_id(b), Some(uid));
        assert_eq!(heap.unique_id(a), None);
    }

    #[test]
    fn test_unique_ids_of_dead_cells_are_dropped() {
        let (mut heap, zone) = heap();
        let dead = heap.new_object(zone, 0).unwrap();
        unsafe { heap.get_or_create_unique_id(dead) };
        heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(heap.unique_id(dead), None);
    }

    #[test]
    fn test_dependent_string_keeps_base_alive() {
        let (mut heap, zone) = heap();
        let base = heap.new_string(zone, b"hello world").unwrap();
        let dep = unsafe { heap.new_dependent_string(zone, base, 6, 5) }.unwrap();
        let root = heap.roots_mut().add(Value::from_cell(dep));
        assert_eq!(unsafe { StringCell::chars(dep) }, b"world");

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.tenured_cells, 2);

        let dep = rooted_cell(&heap, root);
        let string = unsafe { StringCell::from_cell(dep) };
        assert!(string.is_dependent());
        assert!(heap.tenured().contains(string.base as usize));
        assert_eq!(unsafe { StringCell::chars(dep) }, b"world");
    }

    #[test]
    fn test_dependent_of_dependent_uses_linear_base() {
        let (mut heap, zone) = heap();
        let base = heap.new_string(zone, b"abcdef").unwrap();
        let dep = unsafe { heap.new_dependent_string(zone, base, 1, 4) }.unwrap();
        let dep2 = unsafe { heap.new_dependent_string(zone, dep, 1, 2) }.unwrap();
        unsafe {
            assert_eq!(StringCell::from_cell(dep2).base, base.as_ptr());
            assert_eq!(StringCell::chars(dep2), b"cd");
            assert!(heap.new_dependent_string(zone, base, 4, 3).is_none());
        }
    }
}

// =============================================================================
// Buffers
// =============================================================================

mod buffers {
    use super::*;

    #[test]
    fn test_dynamic_slots_move_with_object() {
        let (mut heap, zone) = heap();
        let obj = heap.new_object(zone, 1).unwrap();
        let root = heap.roots_mut().add(Value::from_cell(obj));
        unsafe {
            assert!(heap.grow_dynamic_slots(obj, 3));
            heap.set_slot(obj, 3, Value::from_int(33));
        }
        let slots = unsafe { ObjectCell::from_cell(obj).dynamic } as *mut u8;
        assert!(heap.nursery().is_inside(slots as usize));
        let buffer_ref = heap.roots_mut().add_buffer_ref(slots);

        heap.collect(GcKind::Normal, GcReason::ApiRequest);

        let obj = rooted_cell(&heap, root);
        let moved_slots = unsafe { ObjectCell::from_cell(obj).dynamic } as *mut u8;
        assert!(!heap.nursery().is_inside(moved_slots as usize));
        assert!(heap.tenured().owns_buffer(moved_slots));
        assert_eq!(heap.roots().buffer_ref(buffer_ref), Some(moved_slots));
        assert_eq!(unsafe { heap.get_slot(obj, 3) }, Some(Value::from_int(33)));

        let tracker = heap.memory_tracker().unwrap();
        assert_eq!(tracker.gc_association(obj, MemoryUse::ObjectSlots), Some(24));
        heap.roots_mut().remove_buffer_ref(buffer_ref);
    }

    #[test]
    fn test_bigint_digits_survive() {
        let (mut heap, zone) = heap();
        let digits: Vec<u64> = (1..=200).collect();
        let big = heap.new_bigint(zone, &digits, true).unwrap();
        let small = heap.new_bigint(zone, &[5], false).unwrap();
        let rbig = heap.roots_mut().add(Value::from_cell(big));
        let rsmall = heap.roots_mut().add(Value::from_cell(small));

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.tenured_cells, 2);

        let big = unsafe { BigIntCell::from_cell(rooted_cell(&heap, rbig)) };
        assert!(big.is_negative());
        assert_eq!(big.digits(), digits.as_slice());
        let small = unsafe { BigIntCell::from_cell(rooted_cell(&heap, rsmall)) };
        assert!(!small.has_heap_digits());
        assert_eq!(small.digits(), &[5]);
    }

    #[test]
    fn test_dead_owner_buffers_are_freed() {
        let (mut heap, zone) = heap();
        let dead = heap.new_object(zone, 0).unwrap();
        unsafe { heap.allocate_buffer(dead, 8192) }.unwrap();
        assert_eq!(heap.nursery().malloced_buffer_bytes(), 8192);

        let report = heap.collect(GcKind::Normal, GcReason::ApiRequest);
        assert_eq!(report.freed_buffer_bytes, 8192);
        assert_eq!(heap.nursery().malloced_buffer_bytes(), 0);
    }

    #[test]
    fn test_live_owner_buffers_move_to_tenured() {
        let (mut heap, zone) = heap();
        let owner = heap.new_object(zone, 0).unwrap();
        let root = heap.roots_mut().add(Value::from_cell(owner));
        let small = unsafe { heap.allocate_zeroed_buffer(owner, 16) }.unwrap();
        let large = unsafe { heap.allocate_buffer(owner, 4096) }.unwrap();
        unsafe { small.as_ptr().write(0xAB) };

        heap.collect(GcKind::Normal, GcReason::ApiRequest);
        let owner = rooted_cell(&heap, root);

        assert!(heap.tenured().owns_buffer(large.as_ptr()));
        assert_eq!(heap.tenured().owned_buffer_bytes(), 16 + 4096);
        assert_eq!(heap.zone(zone).unwrap().malloc_heap_size().bytes(), 16 + 4096);
        assert_eq!(
            heap.memory_tracker().unwrap().gc_association(owner, MemoryUse::CellBuffer),
            Some(16 + 4096)
        );

        unsafe { heap.free_buffer(owner, large, 4096) };
        assert_eq!(heap.zone(zone).unwrap().malloc_heap_size().bytes(), 16);
    }
}

// =============================================================================
// Scheduling of Minor Collections
// =============================================================================

mod triggers {
    use super::*;

    #[test]
    fn test_full_nursery_collects_and_retries() {
        let config = GcConfig {
            max_nursery_chunks: Some(1),
            ..GcConfig::debug()
        };
        let mut heap = GcHeap::with_config(config).unwrap();
        let zone = heap.create_zone();

        let keep = heap.new_object(zone, 0).unwrap();
        let root = heap.roots_mut().add(Value::from_cell(keep));
        let per_chunk = strata_gc::heap::CHUNK_USABLE_SIZE / ObjectCell::alloc_size(4);
        for _ in 0..per_chunk * 2 {
            let obj = heap.new_object(zone, 4).unwrap();
            assert!(heap.nursery().is_inside(obj.addr()));
        }

        let last = heap.last_minor_report().expect("a collection ran");
        assert_eq!(last.reason, GcReason::OutOfNursery);
        assert!(heap.tenured().contains(rooted_cell(&heap, root).addr()));
        assert!(heap.stats().minor_collections.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_requested_collection_runs_once() {
        let (mut heap, zone) = heap();
        heap.new_object(zone, 0).unwrap();
        assert!(heap.maybe_collect_if_requested().is_none());

        heap.request_minor_gc(GcReason::FullSlotBuffer);
        heap.request_minor_gc(GcReason::ApiRequest);
        assert!(heap.minor_gc_requested());
        assert!(heap.should_collect_nursery(std::time::Instant::now()));

        let report = heap.maybe_collect_if_requested().expect("collected");
        assert_eq!(report.reason, GcReason::FullSlotBuffer);
        assert!(!heap.minor_gc_requested());
    }

    #[test]
    fn test_disabled_nursery_allocates_tenured() {
        let (mut heap, zone) = heap();
        let obj = heap.new_object(zone, 0).unwrap();
        let root = heap.roots_mut().add(Value::from_cell(obj));

        heap.disable_nursery();
        assert!(!heap.nursery().is_enabled());
        assert!(heap.tenured().contains(rooted_cell(&heap, root).addr()));

        let cell = heap.allocate_cell(zone, 32, TraceKind::Object).unwrap();
        assert!(heap.tenured().contains(cell.addr()));
    }
}
