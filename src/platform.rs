//! OS virtual-memory shim: `map_page`, `unmap_page`, `return_pages_to_os`.
//!
//! This is the only polymorphic seam in the allocator: everything above this
//! module is monomorphic per size class. Implemented per-platform (one
//! submodule per target family), plus a `miri`-friendly fallback so the test
//! suite runs under Miri's strict provenance checks (Miri cannot execute real
//! `mmap`/`VirtualAlloc` syscalls).

#[cfg(all(unix, not(miri)))]
mod unix;

#[cfg(all(windows, not(miri)))]
mod windows;

#[cfg(miri)]
mod miri;

/// Map `size` bytes of fresh, zero-filled virtual memory, aligned to `size`
/// itself (slabs are single self-aligned pages). Returns null on failure.
///
/// # Safety
/// Caller must eventually call [`unmap_page`] with the returned pointer and
/// the same `size`.
#[inline]
pub unsafe fn map_page(size: usize) -> *mut u8 {
    debug_assert!(size.is_power_of_two());
    #[cfg(miri)]
    {
        unsafe { miri::map_page(size) }
    }
    #[cfg(all(windows, not(miri)))]
    {
        unsafe { windows::map_page(size) }
    }
    #[cfg(all(unix, not(miri)))]
    {
        unsafe { unix::map_page(size) }
    }
}

/// Unmap a region previously returned by [`map_page`].
///
/// # Safety
/// `ptr`/`size` must match a live `map_page` allocation.
#[inline]
pub unsafe fn unmap_page(ptr: *mut u8, size: usize) {
    #[cfg(miri)]
    {
        unsafe { miri::unmap_page(ptr, size) };
    }
    #[cfg(all(windows, not(miri)))]
    {
        unsafe { windows::unmap_page(ptr, size) };
    }
    #[cfg(all(unix, not(miri)))]
    {
        unsafe { unix::unmap_page(ptr, size) };
    }
}

/// Advise the OS that a mapped region's physical pages may be discarded
/// without unmapping the virtual address range (`madvise(MADV_DONTNEED)` on
/// Unix, `MEM_DECOMMIT` on Windows). Used by the overflow drain policy to
/// shed RSS for slabs kept in the overflow list.
///
/// # Safety
/// `ptr`/`size` must refer to a live `map_page` region.
#[inline]
pub unsafe fn return_pages_to_os(ptr: *mut u8, size: usize) {
    #[cfg(miri)]
    {
        unsafe { miri::return_pages_to_os(ptr, size) };
    }
    #[cfg(all(windows, not(miri)))]
    {
        unsafe { windows::return_pages_to_os(ptr, size) };
    }
    #[cfg(all(unix, not(miri)))]
    {
        unsafe { unix::return_pages_to_os(ptr, size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        unsafe {
            let ptr = map_page(4096);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 4096, 0, "not aligned to its own size");
            for i in 0..4096 {
                assert_eq!(*ptr.add(i), 0);
            }
            *ptr = 0xAB;
            *ptr.add(4095) = 0xCD;
            assert_eq!(*ptr, 0xAB);
            assert_eq!(*ptr.add(4095), 0xCD);
            unmap_page(ptr, 4096);
        }
    }

    #[test]
    fn map_multiple_sizes() {
        unsafe {
            for size in [4096usize, 8192, 16384] {
                let ptr = map_page(size);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % size, 0);
                unmap_page(ptr, size);
            }
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn return_pages_to_os_does_not_corrupt_other_mappings() {
        unsafe {
            let a = map_page(4096);
            let b = map_page(4096);
            *a.add(10) = 7;
            return_pages_to_os(a, 4096);
            assert_eq!(*b.add(10), 0);
            unmap_page(a, 4096);
            unmap_page(b, 4096);
        }
    }
}
