//! Miri-compatible platform shim using `std::alloc` as backing store.
//!
//! Miri can't execute real OS syscalls (mmap/VirtualAlloc), so we use the
//! system allocator to provide size-aligned memory. This keeps the unsafe
//! pointer logic in slab/arena/epoch under Miri's strict-provenance checks.

use std::alloc::Layout;

pub unsafe fn map_page(size: usize) -> *mut u8 {
    let layout = Layout::from_size_align(size, size).unwrap();
    unsafe { std::alloc::alloc_zeroed(layout) }
}

pub unsafe fn unmap_page(ptr: *mut u8, size: usize) {
    let layout = Layout::from_size_align(size, size).unwrap();
    unsafe { std::alloc::dealloc(ptr, layout) };
}

pub unsafe fn return_pages_to_os(_ptr: *mut u8, _size: usize) {}
