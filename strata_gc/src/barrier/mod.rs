//! Post-write barrier for generational GC.
//!
//! Tenured→nursery edges are recorded in the [`StoreBuffer`] so a minor
//! collection can find them without scanning the tenured heap.

mod store_buffer;

pub use store_buffer::{Overflow, StoreBuffer, StoreBufferEntry, DEFAULT_STORE_BUFFER_ENTRIES};

use crate::cell::{CellPtr, Value};
use crate::heap::Nursery;

/// Whether storing `value` into `holder` creates an edge the store buffer
/// must remember: the holder is tenured and the value is a nursery cell.
#[inline(always)]
pub fn needs_post_barrier(nursery: &Nursery, holder: CellPtr, value: Value) -> bool {
    match value.as_cell() {
        Some(target) => !nursery.is_inside(holder.addr()) && nursery.is_inside(target.addr()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::TraceKind;
    use crate::scheduling::SchedulingTunables;
    use crate::zone::ZoneId;

    #[test]
    fn test_barrier_filters_edges() {
        let tunables = SchedulingTunables::default();
        let mut nursery = Nursery::new(false, None, None);
        assert!(nursery.enable(&tunables));
        let young = nursery
            .allocate_cell(ZoneId(0), 32, TraceKind::Object)
            .expect("alloc");
        let young2 = nursery
            .allocate_cell(ZoneId(0), 32, TraceKind::Object)
            .expect("alloc");

        let mut backing = [0u64; 4];
        let old = CellPtr::from_raw(backing.as_mut_ptr() as *mut u8).unwrap();

        assert!(needs_post_barrier(&nursery, old, Value::from_cell(young)));
        assert!(!needs_post_barrier(&nursery, young2, Value::from_cell(young)));
        assert!(!needs_post_barrier(&nursery, old, Value::from_int(3)));
        assert!(!needs_post_barrier(&nursery, old, Value::from_cell(old)));
    }
}
