//! Malloc-backed buffers for slots, digits and other cell-owned data.
//!
//! Buffers are 8-byte aligned and freed with the size they were allocated
//! with, which every owner already knows.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use tracing::error;

const BUFFER_ALIGN: usize = 8;

#[inline]
fn layout(nbytes: usize) -> Option<Layout> {
    if nbytes == 0 {
        return None;
    }
    Layout::from_size_align(nbytes, BUFFER_ALIGN).ok()
}

/// Allocate an uninitialised buffer. `None` on OOM or zero size.
pub fn malloc_buffer(nbytes: usize) -> Option<NonNull<u8>> {
    let layout = layout(nbytes)?;
    // Safety: non-zero size.
    NonNull::new(unsafe { alloc::alloc(layout) })
}

/// Allocate a zero-filled buffer. `None` on OOM or zero size.
pub fn malloc_zeroed_buffer(nbytes: usize) -> Option<NonNull<u8>> {
    let layout = layout(nbytes)?;
    // Safety: non-zero size.
    NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
}

/// Resize a buffer from [`malloc_buffer`]. On failure the old buffer is
/// still valid.
///
/// # Safety
///
/// `ptr` must be a live buffer of `old_bytes` from this module.
pub unsafe fn realloc_buffer(ptr: NonNull<u8>, old_bytes: usize, new_bytes: usize) -> Option<NonNull<u8>> {
    let old = layout(old_bytes)?;
    if new_bytes == 0 {
        return None;
    }
    // Safety: guaranteed by the caller; new size is non-zero.
    NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), old, new_bytes) })
}

/// Free a buffer from [`malloc_buffer`].
///
/// # Safety
///
/// `ptr` must be a live buffer of `nbytes` from this module.
pub unsafe fn free_buffer(ptr: NonNull<u8>, nbytes: usize) {
    if let Some(layout) = layout(nbytes) {
        // Safety: guaranteed by the caller.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Abort the process after an allocation that cannot fail did.
///
/// Used where unwinding would leave forwarded cells behind.
#[cold]
pub fn crash_oom_unsafe(what: &str) -> ! {
    error!(what, "out of memory in a region that cannot recover");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_round_trip() {
        let buf = malloc_zeroed_buffer(64).expect("alloc");
        // Safety: 64 bytes just allocated.
        unsafe {
            assert_eq!(*buf.as_ptr().add(63), 0);
            buf.as_ptr().write(7);
            let grown = realloc_buffer(buf, 64, 128).expect("realloc");
            assert_eq!(*grown.as_ptr(), 7);
            free_buffer(grown, 128);
        }
    }

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(malloc_buffer(0).is_none());
    }
}
