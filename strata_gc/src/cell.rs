//! Cell layouts and tagged values.
//!
//! Every GC thing starts with a [`CellHeader`]. The header's first word holds
//! the trace kind, kind-specific flags and the allocation size; its low bit is
//! reserved for the forwarded marker that a [`RelocationOverlay`] sets when a
//! minor collection moves the cell.
//!
//! ```text
//! word:  | alloc size (56 bits) | flags (5) | kind (2) | F |
//! zone:  u32
//! aux:   u32   (fixed slot count / string length / digit count)
//! ```

use crate::zone::ZoneId;
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

/// Alignment of every cell and nursery buffer.
pub const CELL_ALIGN: usize = 8;

/// Smallest cell: one relocation overlay must fit over any moved cell.
pub const MIN_CELL_SIZE: usize = size_of::<RelocationOverlay>();

const FORWARDED_BIT: usize = 1;
const KIND_SHIFT: u32 = 1;
const KIND_MASK: usize = 0b11;
const FLAGS_SHIFT: u32 = 3;
const FLAGS_MASK: usize = 0b1_1111;
const SIZE_SHIFT: u32 = 8;

/// Round `size` up to the cell alignment.
#[inline]
pub const fn align_cell(size: usize) -> usize {
    (size + CELL_ALIGN - 1) & !(CELL_ALIGN - 1)
}

/// What a cell contains and therefore how it is traced.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    /// Object with fixed and dynamic value slots.
    Object = 0,
    /// Linear or dependent string.
    String = 1,
    /// Arbitrary precision integer.
    BigInt = 2,
}

impl TraceKind {
    #[inline]
    fn from_bits(bits: usize) -> TraceKind {
        match bits {
            0 => TraceKind::Object,
            1 => TraceKind::String,
            _ => TraceKind::BigInt,
        }
    }
}

/// Kind-specific header flags.
pub mod flags {
    /// String borrows its characters from a base string.
    pub const DEPENDENT: u8 = 1 << 0;
    /// String must never be merged with an equal string.
    pub const NON_DEDUP: u8 = 1 << 1;
    /// BigInt is negative.
    pub const NEGATIVE: u8 = 1 << 2;
}

/// Header shared by all cells.
#[repr(C)]
#[derive(Debug)]
pub struct CellHeader {
    word: usize,
    zone: u32,
    aux: u32,
}

impl CellHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = size_of::<CellHeader>();

    /// Build a header for a freshly allocated cell.
    #[inline]
    pub fn new(kind: TraceKind, alloc_size: usize, zone: ZoneId) -> Self {
        debug_assert!(alloc_size % CELL_ALIGN == 0);
        Self {
            word: (alloc_size << SIZE_SHIFT) | ((kind as usize) << KIND_SHIFT),
            zone: zone.0,
            aux: 0,
        }
    }

    /// Trace kind.
    #[inline]
    pub fn kind(&self) -> TraceKind {
        TraceKind::from_bits((self.word >> KIND_SHIFT) & KIND_MASK)
    }

    /// Bytes occupied by the cell, including the header.
    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.word >> SIZE_SHIFT
    }

    /// Owning zone.
    #[inline]
    pub fn zone(&self) -> ZoneId {
        ZoneId(self.zone)
    }

    /// Kind-specific flags.
    #[inline]
    pub fn flags(&self) -> u8 {
        ((self.word >> FLAGS_SHIFT) & FLAGS_MASK) as u8
    }

    /// Test a flag.
    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    /// Set a flag.
    #[inline]
    pub fn set_flag(&mut self, flag: u8) {
        self.word |= ((flag as usize) & FLAGS_MASK) << FLAGS_SHIFT;
    }

    /// Whether a relocation overlay has been written over this cell.
    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.word & FORWARDED_BIT != 0
    }

    /// Kind-specific extra word.
    #[inline]
    pub fn aux(&self) -> u32 {
        self.aux
    }

    #[inline]
    pub(crate) fn set_aux(&mut self, aux: u32) {
        self.aux = aux;
    }
}

/// Pointer to a cell in either the nursery or the tenured heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CellPtr(NonNull<CellHeader>);

impl CellPtr {
    /// Wrap a raw cell address.
    #[inline]
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr as *mut CellHeader).map(CellPtr)
    }

    /// Raw header pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut CellHeader {
        self.0.as_ptr()
    }

    /// Cell address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Borrow the header.
    ///
    /// # Safety
    ///
    /// The cell must be live, or be a nursery cell that has been forwarded
    /// during the current collection.
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a CellHeader {
        unsafe { &*self.0.as_ptr() }
    }

    /// Mutably borrow the header.
    ///
    /// # Safety
    ///
    /// The cell must be live and not aliased.
    #[inline]
    pub unsafe fn header_mut<'a>(self) -> &'a mut CellHeader {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// Whether the cell has been moved by the current minor collection.
    ///
    /// # Safety
    ///
    /// See [`CellPtr::header`].
    #[inline]
    pub unsafe fn is_forwarded(self) -> bool {
        unsafe { self.header().is_forwarded() }
    }

    /// New location of a forwarded cell.
    ///
    /// # Safety
    ///
    /// The cell must be forwarded.
    #[inline]
    pub unsafe fn forwarding_address(self) -> CellPtr {
        unsafe {
            debug_assert!(self.is_forwarded());
            (*(self.as_ptr() as *const RelocationOverlay)).forwarding_address()
        }
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellPtr({:#x})", self.addr())
    }
}

/// Written over a cell's old nursery location once it has been tenured.
///
/// The first word overlays [`CellHeader::word`] so the forwarded bit is seen
/// by anyone reading the stale header. `next` threads all cells of one kind
/// moved during the current collection.
#[repr(C)]
pub struct RelocationOverlay {
    word: usize,
    new_location: NonNull<CellHeader>,
    next: *mut RelocationOverlay,
}

impl RelocationOverlay {
    /// Overwrite `src` with a forwarding record pointing at `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be a nursery cell at least [`MIN_CELL_SIZE`] bytes long
    /// whose contents are no longer needed.
    #[inline]
    pub unsafe fn forward(src: CellPtr, dst: CellPtr) -> *mut RelocationOverlay {
        unsafe {
            let word = (*src.as_ptr()).word | FORWARDED_BIT;
            let overlay = src.as_ptr() as *mut RelocationOverlay;
            overlay.write(RelocationOverlay {
                word,
                new_location: dst.0,
                next: std::ptr::null_mut(),
            });
            overlay
        }
    }

    /// Where the cell now lives.
    #[inline]
    pub fn forwarding_address(&self) -> CellPtr {
        CellPtr(self.new_location)
    }

    /// Next overlay on the same moved list.
    #[inline]
    pub fn next(&self) -> *mut RelocationOverlay {
        self.next
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: *mut RelocationOverlay) {
        self.next = next;
    }
}

// =============================================================================
// Values
// =============================================================================

const TAG_MASK: u64 = 0b111;
const TAG_INT: u64 = 0b001;
const TAG_UNDEFINED: u64 = 0b010;

/// A tagged 64-bit slot value: a cell pointer, a 32-bit integer or undefined.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The undefined value.
    pub const UNDEFINED: Value = Value(TAG_UNDEFINED);

    /// Box an integer.
    #[inline]
    pub const fn from_int(i: i32) -> Value {
        Value(((i as u32 as u64) << 32) | TAG_INT)
    }

    /// Wrap a cell pointer.
    #[inline]
    pub fn from_cell(cell: CellPtr) -> Value {
        debug_assert!(cell.addr() as u64 & TAG_MASK == 0);
        Value(cell.addr() as u64)
    }

    /// The integer payload, if this is an integer.
    #[inline]
    pub fn as_int(self) -> Option<i32> {
        (self.0 & TAG_MASK == TAG_INT).then_some((self.0 >> 32) as u32 as i32)
    }

    /// The cell payload, if this is a cell pointer.
    #[inline]
    pub fn as_cell(self) -> Option<CellPtr> {
        if self.0 & TAG_MASK == 0 && self.0 != 0 {
            CellPtr::from_raw(self.0 as usize as *mut u8)
        } else {
            None
        }
    }

    /// Whether this is undefined.
    #[inline]
    pub fn is_undefined(self) -> bool {
        self.0 == TAG_UNDEFINED
    }

    /// Raw bits.
    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::UNDEFINED
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(i) = self.as_int() {
            write!(f, "Int({i})")
        } else if let Some(cell) = self.as_cell() {
            write!(f, "{cell:?}")
        } else if self.is_undefined() {
            f.write_str("Undefined")
        } else {
            write!(f, "Value({:#x})", self.0)
        }
    }
}

// =============================================================================
// Cell layouts
// =============================================================================

/// Object cell. `header.aux` holds the fixed slot count; fixed slots follow
/// the struct inline.
#[repr(C)]
pub struct ObjectCell {
    /// Common header.
    pub header: CellHeader,
    /// Number of out-of-line slots.
    pub ndynamic: u32,
    _reserved: u32,
    /// Out-of-line slots, null when `ndynamic == 0`.
    pub dynamic: *mut Value,
}

impl ObjectCell {
    /// Allocation size for an object with `nfixed` inline slots.
    #[inline]
    pub const fn alloc_size(nfixed: usize) -> usize {
        size_of::<ObjectCell>() + nfixed * size_of::<Value>()
    }

    /// Initialise the body of a freshly allocated object.
    ///
    /// # Safety
    ///
    /// `cell` must have been allocated with [`ObjectCell::alloc_size`]`(nfixed)`.
    pub unsafe fn init(cell: CellPtr, nfixed: u32) {
        unsafe {
            let obj = cell.as_ptr() as *mut ObjectCell;
            (*obj).header.set_aux(nfixed);
            (*obj).ndynamic = 0;
            (*obj)._reserved = 0;
            (*obj).dynamic = std::ptr::null_mut();
            let fixed = Self::fixed_slots(cell);
            for i in 0..nfixed as usize {
                fixed.add(i).write(Value::UNDEFINED);
            }
        }
    }

    /// # Safety
    ///
    /// `cell` must be a live object.
    #[inline]
    pub unsafe fn from_cell<'a>(cell: CellPtr) -> &'a mut ObjectCell {
        unsafe { &mut *(cell.as_ptr() as *mut ObjectCell) }
    }

    /// # Safety
    ///
    /// `cell` must be a live object.
    #[inline]
    pub unsafe fn fixed_slots(cell: CellPtr) -> *mut Value {
        unsafe { (cell.as_ptr() as *mut u8).add(size_of::<ObjectCell>()) as *mut Value }
    }

    /// Fixed plus dynamic slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.header.aux() as usize + self.ndynamic as usize
    }

    /// Address of slot `index`; fixed slots come first.
    ///
    /// # Safety
    ///
    /// `cell` must be a live object and `index < slot_count()`.
    #[inline]
    pub unsafe fn slot_ptr(cell: CellPtr, index: usize) -> *mut Value {
        unsafe {
            let obj = Self::from_cell(cell);
            let nfixed = obj.header.aux() as usize;
            debug_assert!(index < obj.slot_count());
            if index < nfixed {
                Self::fixed_slots(cell).add(index)
            } else {
                obj.dynamic.add(index - nfixed)
            }
        }
    }
}

/// String cell. `header.aux` holds the length in bytes. Linear strings store
/// their Latin-1 characters inline after the struct; dependent strings point
/// at a linear base.
#[repr(C)]
pub struct StringCell {
    /// Common header.
    pub header: CellHeader,
    /// Linear base of a dependent string, null otherwise.
    pub base: *mut CellHeader,
    /// Offset into the base's characters.
    pub offset: usize,
}

impl StringCell {
    /// Allocation size for a linear string of `len` bytes.
    #[inline]
    pub const fn linear_alloc_size(len: usize) -> usize {
        align_cell(size_of::<StringCell>() + len)
    }

    /// Allocation size of a dependent string.
    pub const DEPENDENT_ALLOC_SIZE: usize = size_of::<StringCell>();

    /// # Safety
    ///
    /// `cell` must be a live string.
    #[inline]
    pub unsafe fn from_cell<'a>(cell: CellPtr) -> &'a mut StringCell {
        unsafe { &mut *(cell.as_ptr() as *mut StringCell) }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.aux() as usize
    }

    /// Whether the string is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the characters live in a base string.
    #[inline]
    pub fn is_dependent(&self) -> bool {
        self.header.has_flag(flags::DEPENDENT)
    }

    /// Whether this string may be merged with an equal tenured string.
    #[inline]
    pub fn is_deduplicatable(&self) -> bool {
        !self.is_dependent() && !self.header.has_flag(flags::NON_DEDUP)
    }

    /// # Safety
    ///
    /// `cell` must be a live linear string.
    #[inline]
    pub unsafe fn inline_chars(cell: CellPtr) -> *mut u8 {
        unsafe { (cell.as_ptr() as *mut u8).add(size_of::<StringCell>()) }
    }

    /// Characters of a live string.
    ///
    /// # Safety
    ///
    /// `cell` must be a live string whose base, if any, is live.
    pub unsafe fn chars<'a>(cell: CellPtr) -> &'a [u8] {
        unsafe {
            let s = Self::from_cell(cell);
            if s.is_dependent() {
                let base = CellPtr(NonNull::new_unchecked(s.base));
                std::slice::from_raw_parts(Self::inline_chars(base).add(s.offset), s.len())
            } else {
                std::slice::from_raw_parts(Self::inline_chars(cell), s.len())
            }
        }
    }
}

/// BigInt cell. `header.aux` holds the digit count. A single digit lives
/// inline; longer magnitudes use a buffer owned by the nursery or malloc.
#[repr(C)]
pub struct BigIntCell {
    /// Common header.
    pub header: CellHeader,
    /// Out-of-line digits, null when the digit count is at most one.
    pub digits: *mut u64,
    /// Inline digit storage.
    pub inline_digit: u64,
}

impl BigIntCell {
    /// Allocation size of a BigInt.
    pub const ALLOC_SIZE: usize = size_of::<BigIntCell>();

    /// # Safety
    ///
    /// `cell` must be a live BigInt.
    #[inline]
    pub unsafe fn from_cell<'a>(cell: CellPtr) -> &'a mut BigIntCell {
        unsafe { &mut *(cell.as_ptr() as *mut BigIntCell) }
    }

    /// Number of 64-bit digits.
    #[inline]
    pub fn digit_length(&self) -> usize {
        self.header.aux() as usize
    }

    /// Whether the digits are stored out of line.
    #[inline]
    pub fn has_heap_digits(&self) -> bool {
        !self.digits.is_null()
    }

    /// Magnitude digits, least significant first.
    pub fn digits(&self) -> &[u64] {
        if self.has_heap_digits() {
            // SAFETY: heap digits are allocated with `digit_length` elements.
            unsafe { std::slice::from_raw_parts(self.digits, self.digit_length()) }
        } else {
            std::slice::from_ref(&self.inline_digit).split_at(self.digit_length()).0
        }
    }

    /// Sign.
    #[inline]
    pub fn is_negative(&self) -> bool {
        self.header.has_flag(flags::NEGATIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(CellHeader::SIZE, 16);
        assert_eq!(MIN_CELL_SIZE, 24);
        assert_eq!(ObjectCell::alloc_size(0), 32);
        assert_eq!(ObjectCell::alloc_size(2), 48);
        assert_eq!(StringCell::linear_alloc_size(0), 32);
        assert_eq!(StringCell::linear_alloc_size(5), 40);
        assert_eq!(BigIntCell::ALLOC_SIZE, 32);
    }

    #[test]
    fn test_header_fields() {
        let mut header = CellHeader::new(TraceKind::String, 40, ZoneId(3));
        assert_eq!(header.kind(), TraceKind::String);
        assert_eq!(header.alloc_size(), 40);
        assert_eq!(header.zone(), ZoneId(3));
        assert!(!header.is_forwarded());

        header.set_flag(flags::DEPENDENT);
        assert!(header.has_flag(flags::DEPENDENT));
        assert!(!header.has_flag(flags::NON_DEDUP));
        assert_eq!(header.kind(), TraceKind::String);
        assert_eq!(header.alloc_size(), 40);
    }

    #[test]
    fn test_value_tags() {
        assert_eq!(Value::from_int(-7).as_int(), Some(-7));
        assert!(Value::from_int(0).as_cell().is_none());
        assert!(Value::UNDEFINED.is_undefined());
        assert!(Value::UNDEFINED.as_cell().is_none());

        let mut backing = [0u64; 4];
        let cell = CellPtr::from_raw(backing.as_mut_ptr() as *mut u8).unwrap();
        let v = Value::from_cell(cell);
        assert_eq!(v.as_cell(), Some(cell));
        assert_eq!(v.as_int(), None);
    }

    #[test]
    fn test_relocation_overlay_sets_forwarded() {
        let mut src = [0u64; 4];
        let mut dst = [0u64; 4];
        let src_cell = CellPtr::from_raw(src.as_mut_ptr() as *mut u8).unwrap();
        let dst_cell = CellPtr::from_raw(dst.as_mut_ptr() as *mut u8).unwrap();
        unsafe {
            src_cell
                .as_ptr()
                .write(CellHeader::new(TraceKind::Object, 32, ZoneId(0)));
            RelocationOverlay::forward(src_cell, dst_cell);
            assert!(src_cell.is_forwarded());
            assert_eq!(src_cell.forwarding_address(), dst_cell);
            assert_eq!(src_cell.header().kind(), TraceKind::Object);
        }
    }
}
