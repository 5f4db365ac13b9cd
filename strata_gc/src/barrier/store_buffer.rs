//! Store buffer: the remembered set of tenured→nursery edges.
//!
//! The post-write barrier appends an entry whenever a tenured cell is given a
//! pointer into the nursery. A minor collection treats every entry as a root
//! and then clears the buffer; all remembered edges either point into the
//! tenured heap afterwards or were overwritten.
//!
//! Two lists are kept: precise slot entries, and whole-cell entries for
//! cells whose every slot must be rescanned. Either list overflowing asks for
//! a minor collection so the buffer never grows without bound.

use parking_lot::Mutex;

/// Default capacity of each list before a collection is requested.
pub const DEFAULT_STORE_BUFFER_ENTRIES: usize = 4096;

/// One remembered edge source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreBufferEntry {
    /// A single slot of a tenured object.
    Slot {
        /// Address of the tenured cell.
        cell: usize,
        /// Slot index.
        index: u32,
    },
    /// Every edge of a tenured cell.
    WholeCell {
        /// Address of the tenured cell.
        cell: usize,
    },
}

/// Which list overflowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    /// The slot list is full.
    Slots,
    /// The whole-cell list is full.
    WholeCells,
}

/// Remembered set for the post-write barrier.
pub struct StoreBuffer {
    slots: Mutex<Vec<StoreBufferEntry>>,
    whole_cells: Mutex<Vec<StoreBufferEntry>>,
    capacity: usize,
}

impl StoreBuffer {
    /// Create a buffer whose lists each hold `capacity` entries before
    /// reporting overflow.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            whole_cells: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Remember slot `index` of the tenured cell at `cell`.
    #[inline]
    pub fn put_slot(&self, cell: usize, index: u32) -> Option<Overflow> {
        let mut slots = self.slots.lock();
        slots.push(StoreBufferEntry::Slot { cell, index });
        (slots.len() >= self.capacity).then_some(Overflow::Slots)
    }

    /// Remember every edge of the tenured cell at `cell`.
    #[inline]
    pub fn put_whole_cell(&self, cell: usize) -> Option<Overflow> {
        let mut cells = self.whole_cells.lock();
        cells.push(StoreBufferEntry::WholeCell { cell });
        (cells.len() >= self.capacity).then_some(Overflow::WholeCells)
    }

    /// Take every entry, sorted and without duplicates.
    ///
    /// A slot entry is dropped when its cell also has a whole-cell entry.
    pub fn drain(&self) -> Vec<StoreBufferEntry> {
        let mut whole = std::mem::take(&mut *self.whole_cells.lock());
        whole.sort_unstable();
        whole.dedup();

        let mut slots = std::mem::replace(&mut *self.slots.lock(), Vec::with_capacity(self.capacity));
        slots.sort_unstable();
        slots.dedup();
        slots.retain(|entry| match entry {
            StoreBufferEntry::Slot { cell, .. } => whole
                .binary_search(&StoreBufferEntry::WholeCell { cell: *cell })
                .is_err(),
            StoreBufferEntry::WholeCell { .. } => true,
        });

        whole.append(&mut slots);
        whole
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.slots.lock().clear();
        self.whole_cells.lock().clear();
    }

    /// Entries currently held, duplicates included.
    pub fn len(&self) -> usize {
        self.slots.lock().len() + self.whole_cells.lock().len()
    }

    /// Whether no edges are remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_BUFFER_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_drain() {
        let buffer = StoreBuffer::new(16);
        assert!(buffer.is_empty());

        buffer.put_slot(0x100, 2);
        buffer.put_slot(0x100, 2);
        buffer.put_slot(0x80, 0);
        assert_eq!(buffer.len(), 3);

        let entries = buffer.drain();
        assert_eq!(
            entries,
            vec![
                StoreBufferEntry::Slot { cell: 0x80, index: 0 },
                StoreBufferEntry::Slot { cell: 0x100, index: 2 },
            ]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_whole_cell_subsumes_slots() {
        let buffer = StoreBuffer::new(16);
        buffer.put_slot(0x100, 1);
        buffer.put_slot(0x200, 3);
        buffer.put_whole_cell(0x100);

        let entries = buffer.drain();
        assert_eq!(
            entries,
            vec![
                StoreBufferEntry::WholeCell { cell: 0x100 },
                StoreBufferEntry::Slot { cell: 0x200, index: 3 },
            ]
        );
    }

    #[test]
    fn test_overflow_is_reported() {
        let buffer = StoreBuffer::new(2);
        assert_eq!(buffer.put_slot(0x10, 0), None);
        assert_eq!(buffer.put_slot(0x18, 0), Some(Overflow::Slots));
        assert_eq!(buffer.put_whole_cell(0x10), None);
        assert_eq!(buffer.put_whole_cell(0x20), Some(Overflow::WholeCells));

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
