//! Root tracking.
//!
//! GC roots are the starting points for tracing:
//! - Values held by the embedder through [`RootId`] handles
//! - Raw pointers into cell-owned buffers (for example a frame holding the
//!   address of an object's slots), registered through [`BufferRefId`]
//!
//! Root values are rewritten in place when a minor collection moves their
//! target. Buffer pointers are rewritten during the sweep phase once every
//! buffer has been moved.

use crate::cell::Value;
use crate::heap::Nursery;
use crate::trace::Tracer;

/// Handle to a rooted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u32);

/// Handle to a registered buffer pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRefId(u32);

/// Root set for garbage collection.
#[derive(Default)]
pub struct RootSet {
    values: Vec<Option<Value>>,
    free_values: Vec<u32>,
    buffer_refs: Vec<Option<*mut u8>>,
    free_buffer_refs: Vec<u32>,
}

impl RootSet {
    /// Create a new empty root set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root a value.
    pub fn add(&mut self, value: Value) -> RootId {
        match self.free_values.pop() {
            Some(index) => {
                self.values[index as usize] = Some(value);
                RootId(index)
            }
            None => {
                self.values.push(Some(value));
                RootId((self.values.len() - 1) as u32)
            }
        }
    }

    /// Current value of a root; updated by collections.
    pub fn get(&self, id: RootId) -> Option<Value> {
        self.values.get(id.0 as usize).copied().flatten()
    }

    /// Overwrite a root.
    pub fn set(&mut self, id: RootId, value: Value) {
        if let Some(slot @ Some(_)) = self.values.get_mut(id.0 as usize) {
            *slot = Some(value);
        }
    }

    /// Unroot a value. Returns its last value.
    pub fn remove(&mut self, id: RootId) -> Option<Value> {
        let value = self.values.get_mut(id.0 as usize)?.take()?;
        self.free_values.push(id.0);
        Some(value)
    }

    /// Number of rooted values.
    pub fn len(&self) -> usize {
        self.values.len() - self.free_values.len()
    }

    /// Whether nothing is rooted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trace all root values.
    pub fn trace(&mut self, tracer: &mut dyn Tracer) {
        for value in self.values.iter_mut().flatten() {
            tracer.on_value_edge(value);
        }
    }

    // =========================================================================
    // Buffer References
    // =========================================================================

    /// Register a pointer into a cell-owned buffer.
    pub fn add_buffer_ref(&mut self, pointer: *mut u8) -> BufferRefId {
        match self.free_buffer_refs.pop() {
            Some(index) => {
                self.buffer_refs[index as usize] = Some(pointer);
                BufferRefId(index)
            }
            None => {
                self.buffer_refs.push(Some(pointer));
                BufferRefId((self.buffer_refs.len() - 1) as u32)
            }
        }
    }

    /// Current pointer; updated by collections.
    pub fn buffer_ref(&self, id: BufferRefId) -> Option<*mut u8> {
        self.buffer_refs.get(id.0 as usize).copied().flatten()
    }

    /// Forget a buffer pointer.
    pub fn remove_buffer_ref(&mut self, id: BufferRefId) -> Option<*mut u8> {
        let pointer = self.buffer_refs.get_mut(id.0 as usize)?.take()?;
        self.free_buffer_refs.push(id.0);
        Some(pointer)
    }

    /// Rewrite buffer pointers whose buffer moved out of the nursery.
    pub(crate) fn update_buffer_refs(&mut self, nursery: &Nursery) -> usize {
        let mut updated = 0;
        for pointer in self.buffer_refs.iter_mut().flatten() {
            let old = *pointer;
            nursery.forward_buffer_pointer(pointer);
            if *pointer != old {
                updated += 1;
            }
        }
        updated
    }
}
