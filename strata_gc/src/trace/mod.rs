//! Edge tracing.
//!
//! A [`Tracer`] is handed every outgoing edge of a cell by mutable
//! reference, so a moving tracer can rewrite the edge in place once the
//! target has been relocated.

pub mod tracer;

pub use tracer::{CountingTracer, NurseryEdgeChecker};

use crate::cell::{CellPtr, ObjectCell, StringCell, TraceKind, Value};

/// Visitor for cell edges.
///
/// # Example
///
/// ```ignore
/// struct Forwarder<'a> { nursery: &'a Nursery }
///
/// impl Tracer for Forwarder<'_> {
///     fn on_cell_edge(&mut self, cell: &mut CellPtr) {
///         self.nursery.get_forwarded_pointer(cell);
///     }
/// }
/// ```
pub trait Tracer {
    /// Visit an edge to a cell. The implementation may update it.
    fn on_cell_edge(&mut self, cell: &mut CellPtr);

    /// Visit a value slot. Non-cell values are ignored.
    #[inline]
    fn on_value_edge(&mut self, value: &mut Value) {
        if let Some(mut cell) = value.as_cell() {
            self.on_cell_edge(&mut cell);
            *value = Value::from_cell(cell);
        }
    }
}

/// Report every edge of `cell` to `tracer`.
///
/// # Safety
///
/// `cell` must be live and fully initialised. Edges are read but their
/// targets are not dereferenced.
pub unsafe fn trace_children(cell: CellPtr, tracer: &mut dyn Tracer) {
    unsafe {
        match cell.header().kind() {
            TraceKind::Object => {
                let count = ObjectCell::from_cell(cell).slot_count();
                for index in 0..count {
                    tracer.on_value_edge(&mut *ObjectCell::slot_ptr(cell, index));
                }
            }
            TraceKind::String => {
                let string = StringCell::from_cell(cell);
                if string.is_dependent() {
                    if let Some(mut base) = CellPtr::from_raw(string.base as *mut u8) {
                        tracer.on_cell_edge(&mut base);
                        string.base = base.as_ptr();
                    }
                }
            }
            // Digits are plain data.
            TraceKind::BigInt => {}
        }
    }
}

/// Report one slot of an object.
///
/// # Safety
///
/// `cell` must be a live object with more than `index` slots.
pub unsafe fn trace_slot(cell: CellPtr, index: usize, tracer: &mut dyn Tracer) {
    unsafe { tracer.on_value_edge(&mut *ObjectCell::slot_ptr(cell, index)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellHeader;
    use crate::zone::ZoneId;

    #[test]
    fn test_trace_object_slots() {
        let mut backing = [0u64; 8];
        let obj = CellPtr::from_raw(backing.as_mut_ptr() as *mut u8).unwrap();
        let mut target_backing = [0u64; 4];
        let target = CellPtr::from_raw(target_backing.as_mut_ptr() as *mut u8).unwrap();

        unsafe {
            obj.as_ptr()
                .write(CellHeader::new(TraceKind::Object, ObjectCell::alloc_size(2), ZoneId(0)));
            ObjectCell::init(obj, 2);
            *ObjectCell::slot_ptr(obj, 0) = Value::from_int(1);
            *ObjectCell::slot_ptr(obj, 1) = Value::from_cell(target);

            let mut tracer = CountingTracer::new();
            trace_children(obj, &mut tracer);
            assert_eq!(tracer.cell_edges, 1);
        }
    }
}
