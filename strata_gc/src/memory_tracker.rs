//! Debug accounting of malloc memory associated with cells.
//!
//! Every byte added to a zone's malloc heap on behalf of a cell must later be
//! removed with the same cell, size and use. The tracker records those
//! associations and panics as soon as the bookkeeping goes wrong, instead of
//! letting the malloc heap size drift.
//!
//! Two maps are kept:
//!
//! - GC associations, keyed by tenured cell and [`MemoryUse`].
//! - Non-GC associations, keyed by an arbitrary address and use, for
//!   memory whose owner is not a cell.
//!
//! Contract violations are programming errors and panic with a diagnostic.

use crate::cell::CellPtr;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use tracing::error;

/// What a tracked allocation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryUse {
    /// Out-of-line slots of an object.
    ObjectSlots,
    /// Out-of-line digits of a big integer.
    BigIntDigits,
    /// Buffers allocated on behalf of a cell; a cell may own several.
    CellBuffer,
    /// A malloced buffer owned by the nursery rather than a cell.
    MallocedBuffer,
}

impl MemoryUse {
    /// Whether the owner is a plain address rather than a cell.
    #[inline]
    pub fn is_non_gc(self) -> bool {
        matches!(self, MemoryUse::MallocedBuffer)
    }

    /// Whether one owner may hold several associations of this use.
    #[inline]
    pub fn allows_multiple_associations(self) -> bool {
        self.is_non_gc() || matches!(self, MemoryUse::CellBuffer)
    }

    /// Human readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            MemoryUse::ObjectSlots => "ObjectSlots",
            MemoryUse::BigIntDigits => "BigIntDigits",
            MemoryUse::CellBuffer => "CellBuffer",
            MemoryUse::MallocedBuffer => "MallocedBuffer",
        }
    }
}

impl fmt::Display for MemoryUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
struct Maps {
    gc: FxHashMap<(CellPtr, MemoryUse), usize>,
    non_gc: FxHashMap<(usize, MemoryUse), usize>,
}

/// Records cell/memory associations and checks every update against them.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    maps: Mutex<Maps>,
}

impl MemoryTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // GC associations
    // =========================================================================

    /// Associate `nbytes` of `use_` memory with a tenured cell.
    pub fn track_gc_memory(&self, cell: CellPtr, nbytes: usize, use_: MemoryUse) {
        debug_assert!(!use_.is_non_gc());
        let mut maps = self.maps.lock();
        match maps.gc.get_mut(&(cell, use_)) {
            Some(value) => {
                if !use_.allows_multiple_associations() {
                    panic!("Association already present: {cell:?} {nbytes:#x} {use_}");
                }
                *value += nbytes;
            }
            None => {
                maps.gc.insert((cell, use_), nbytes);
            }
        }
    }

    /// Remove `nbytes` from an association made by `track_gc_memory`.
    pub fn untrack_gc_memory(&self, cell: CellPtr, nbytes: usize, use_: MemoryUse) {
        let mut maps = self.maps.lock();
        let Some(value) = maps.gc.get_mut(&(cell, use_)) else {
            panic!("Association not found: {cell:?} {nbytes:#x} {use_}");
        };

        if !use_.allows_multiple_associations() && *value != nbytes {
            panic!(
                "Association for {cell:?} {use_} has different size: expected {:#x} but got {nbytes:#x}",
                *value
            );
        }
        if nbytes > *value {
            panic!(
                "Association for {cell:?} {use_} size is too large: expected at most {:#x} but got {nbytes:#x}",
                *value
            );
        }

        *value -= nbytes;
        if *value == 0 {
            maps.gc.remove(&(cell, use_));
        }
    }

    /// Exchange the associations of two cells. `a_tenured`/`b_tenured` tell
    /// whether each cell may hold associations at all.
    pub fn swap_gc_memory(&self, a: CellPtr, a_tenured: bool, b: CellPtr, b_tenured: bool, use_: MemoryUse) {
        let mut maps = self.maps.lock();
        let size_a = maps.gc.remove(&(a, use_)).unwrap_or(0);
        let size_b = maps.gc.remove(&(b, use_)).unwrap_or(0);
        if size_a != 0 && b_tenured {
            maps.gc.insert((b, use_), size_a);
        }
        if size_b != 0 && a_tenured {
            maps.gc.insert((a, use_), size_b);
        }
    }

    /// Bytes currently associated with `cell` for `use_`.
    pub fn gc_association(&self, cell: CellPtr, use_: MemoryUse) -> Option<usize> {
        self.maps.lock().gc.get(&(cell, use_)).copied()
    }

    /// Rewrite keys of cells that moved. `forwarded` returns the new
    /// location of a moved cell.
    pub fn fixup_after_moving_gc(&self, mut forwarded: impl FnMut(CellPtr) -> Option<CellPtr>) {
        let mut maps = self.maps.lock();
        let moved: Vec<_> = maps
            .gc
            .keys()
            .filter_map(|&(cell, use_)| forwarded(cell).map(|to| (cell, to, use_)))
            .collect();
        for (from, to, use_) in moved {
            if let Some(nbytes) = maps.gc.remove(&(from, use_)) {
                maps.gc.insert((to, use_), nbytes);
            }
        }
    }

    // =========================================================================
    // Non-GC associations
    // =========================================================================

    /// Start tracking memory owned by `mem`, with zero bytes.
    pub fn register_non_gc_memory(&self, mem: usize, use_: MemoryUse) {
        let mut maps = self.maps.lock();
        if maps.non_gc.contains_key(&(mem, use_)) {
            panic!("{use_} association {mem:#x} already registered");
        }
        maps.non_gc.insert((mem, use_), 0);
    }

    /// Stop tracking `mem`. Every byte must have been released first.
    pub fn unregister_non_gc_memory(&self, mem: usize, use_: MemoryUse) {
        let mut maps = self.maps.lock();
        match maps.non_gc.get(&(mem, use_)) {
            None => panic!("{use_} association {mem:#x} not found"),
            Some(&nbytes) if nbytes != 0 => {
                panic!("{use_} association {mem:#x} still has {nbytes:#x} bytes associated")
            }
            Some(_) => {
                maps.non_gc.remove(&(mem, use_));
            }
        }
    }

    /// Re-key a registration after its owner moved from `src` to `dst`.
    pub fn move_non_gc_memory(&self, dst: usize, src: usize, use_: MemoryUse) {
        let mut maps = self.maps.lock();
        let Some(nbytes) = maps.non_gc.remove(&(src, use_)) else {
            panic!("{use_} association {src:#x} not found");
        };
        if maps.non_gc.contains_key(&(dst, use_)) {
            panic!("{use_} {dst:#x} already registered");
        }
        maps.non_gc.insert((dst, use_), nbytes);
    }

    /// Add bytes to a registration.
    pub fn inc_non_gc_memory(&self, mem: usize, nbytes: usize, use_: MemoryUse) {
        debug_assert!(use_.is_non_gc());
        let mut maps = self.maps.lock();
        let Some(value) = maps.non_gc.get_mut(&(mem, use_)) else {
            panic!("{use_} allocation {mem:#x} not found");
        };
        *value += nbytes;
    }

    /// Remove bytes from a registration.
    pub fn dec_non_gc_memory(&self, mem: usize, nbytes: usize, use_: MemoryUse) {
        debug_assert!(use_.is_non_gc());
        let mut maps = self.maps.lock();
        let Some(value) = maps.non_gc.get_mut(&(mem, use_)) else {
            panic!("{use_} allocation {mem:#x} not found");
        };
        if nbytes > *value {
            panic!(
                "{use_} allocation {mem:#x} is too large: expected at most {:#x} but got {nbytes:#x} bytes",
                *value
            );
        }
        *value -= nbytes;
    }

    /// Bytes currently registered for `mem`.
    pub fn non_gc_association(&self, mem: usize, use_: MemoryUse) -> Option<usize> {
        self.maps.lock().non_gc.get(&(mem, use_)).copied()
    }

    /// Whether no associations remain.
    pub fn is_empty(&self) -> bool {
        let maps = self.maps.lock();
        maps.gc.is_empty() && maps.non_gc.is_empty()
    }

    /// Report every leftover association and panic if there are any.
    pub fn check_empty_on_destroy(&self) {
        let maps = self.maps.lock();
        let mut ok = true;

        if !maps.gc.is_empty() {
            ok = false;
            error!(count = maps.gc.len(), "missing calls to remove cell memory");
            for ((cell, use_), nbytes) in &maps.gc {
                error!("  {cell:?} {nbytes:#x} {use_}");
            }
        }

        if !maps.non_gc.is_empty() {
            ok = false;
            error!(count = maps.non_gc.len(), "missing calls to release non-GC memory");
            for ((mem, use_), nbytes) in &maps.non_gc {
                error!("  {mem:#x} {nbytes:#x} {use_}");
            }
        }

        assert!(ok, "memory tracker not empty on destroy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(addr: usize) -> CellPtr {
        CellPtr::from_raw(addr as *mut u8).expect("non-null")
    }

    #[test]
    fn test_track_and_untrack() {
        let tracker = MemoryTracker::new();
        let a = cell(0x1000);
        tracker.track_gc_memory(a, 64, MemoryUse::ObjectSlots);
        assert_eq!(tracker.gc_association(a, MemoryUse::ObjectSlots), Some(64));
        tracker.untrack_gc_memory(a, 64, MemoryUse::ObjectSlots);
        assert!(tracker.is_empty());
        tracker.check_empty_on_destroy();
    }

    #[test]
    #[should_panic(expected = "Association already present")]
    fn test_duplicate_association_panics() {
        let tracker = MemoryTracker::new();
        let a = cell(0x1000);
        tracker.track_gc_memory(a, 64, MemoryUse::ObjectSlots);
        tracker.track_gc_memory(a, 64, MemoryUse::ObjectSlots);
    }

    #[test]
    fn test_cell_buffer_associations_accumulate() {
        let tracker = MemoryTracker::new();
        let a = cell(0x1000);
        tracker.track_gc_memory(a, 64, MemoryUse::CellBuffer);
        tracker.track_gc_memory(a, 32, MemoryUse::CellBuffer);
        tracker.untrack_gc_memory(a, 32, MemoryUse::CellBuffer);
        assert_eq!(tracker.gc_association(a, MemoryUse::CellBuffer), Some(64));
    }

    #[test]
    #[should_panic(expected = "has different size")]
    fn test_untrack_size_mismatch_panics() {
        let tracker = MemoryTracker::new();
        let a = cell(0x1000);
        tracker.track_gc_memory(a, 64, MemoryUse::BigIntDigits);
        tracker.untrack_gc_memory(a, 32, MemoryUse::BigIntDigits);
    }

    #[test]
    #[should_panic(expected = "Association not found")]
    fn test_untrack_missing_panics() {
        let tracker = MemoryTracker::new();
        tracker.untrack_gc_memory(cell(0x1000), 8, MemoryUse::CellBuffer);
    }

    #[test]
    fn test_swap_moves_entries() {
        let tracker = MemoryTracker::new();
        let (a, b) = (cell(0x1000), cell(0x2000));
        tracker.track_gc_memory(a, 64, MemoryUse::ObjectSlots);
        tracker.swap_gc_memory(a, true, b, true, MemoryUse::ObjectSlots);
        assert_eq!(tracker.gc_association(a, MemoryUse::ObjectSlots), None);
        assert_eq!(tracker.gc_association(b, MemoryUse::ObjectSlots), Some(64));
    }

    #[test]
    fn test_fixup_rekeys_moved_cells() {
        let tracker = MemoryTracker::new();
        let (a, b) = (cell(0x1000), cell(0x2000));
        tracker.track_gc_memory(a, 16, MemoryUse::ObjectSlots);
        tracker.fixup_after_moving_gc(|c| (c == a).then_some(b));
        assert_eq!(tracker.gc_association(b, MemoryUse::ObjectSlots), Some(16));
        assert_eq!(tracker.gc_association(a, MemoryUse::ObjectSlots), None);
    }

    #[test]
    fn test_non_gc_lifecycle() {
        let tracker = MemoryTracker::new();
        let use_ = MemoryUse::MallocedBuffer;
        tracker.register_non_gc_memory(0x10, use_);
        tracker.inc_non_gc_memory(0x10, 100, use_);
        tracker.move_non_gc_memory(0x20, 0x10, use_);
        assert_eq!(tracker.non_gc_association(0x20, use_), Some(100));
        tracker.dec_non_gc_memory(0x20, 100, use_);
        tracker.unregister_non_gc_memory(0x20, use_);
        assert!(tracker.is_empty());
    }

    #[test]
    #[should_panic(expected = "still has")]
    fn test_unregister_with_bytes_panics() {
        let tracker = MemoryTracker::new();
        let use_ = MemoryUse::MallocedBuffer;
        tracker.register_non_gc_memory(0x10, use_);
        tracker.inc_non_gc_memory(0x10, 8, use_);
        tracker.unregister_non_gc_memory(0x10, use_);
    }

    #[test]
    #[should_panic(expected = "is too large")]
    fn test_dec_too_large_panics() {
        let tracker = MemoryTracker::new();
        let use_ = MemoryUse::MallocedBuffer;
        tracker.register_non_gc_memory(0x10, use_);
        tracker.dec_non_gc_memory(0x10, 8, use_);
    }

    #[test]
    #[should_panic(expected = "not empty on destroy")]
    fn test_leftovers_fail_destroy_check() {
        let tracker = MemoryTracker::new();
        tracker.register_non_gc_memory(0x10, MemoryUse::MallocedBuffer);
        tracker.check_empty_on_destroy();
    }
}
