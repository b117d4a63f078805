//! Per-class empty-slab cache: a bounded LIFO of fully-free slabs plus an
//! unbounded overflow list, consulted by the slow path before a fresh
//! `map_page` call and populated only by the epoch-close reclamation sweep
//! (never by `free_obj` itself — recycling is deferred, never immediate).

use crate::slab::{Slab, SlabList};

/// Bounded LIFO + overflow for one size class. All mutation happens under
/// the owning class mutex (see `arena::ClassArena`): one lock protects every
/// intrusive list link a class owns, cache included.
pub struct EmptyCache {
    lifo: SlabList,
    overflow: SlabList,
    capacity: usize,
}

impl EmptyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lifo: SlabList::new(),
            overflow: SlabList::new(),
            capacity,
        }
    }

    /// Push a newly-recycled EMPTY slab. Goes to the LIFO while under
    /// capacity, otherwise to the overflow list.
    ///
    /// # Safety
    /// `slab` must not already be linked into any list.
    pub unsafe fn push(&mut self, slab: *mut Slab) -> CachePush {
        if self.lifo.count < self.capacity {
            unsafe { self.lifo.push_front(slab) };
            CachePush::Cached
        } else {
            unsafe { self.overflow.push_front(slab) };
            CachePush::Overflowed
        }
    }

    /// Pop a slab for the slow path to recycle. Prefers the LIFO (hot,
    /// recently-freed) over the overflow list.
    pub fn pop(&mut self) -> *mut Slab {
        let s = unsafe { self.lifo.pop_front() };
        if !s.is_null() {
            return s;
        }
        unsafe { self.overflow.pop_front() }
    }

    #[inline]
    pub fn cached_count(&self) -> usize {
        self.lifo.count
    }

    #[inline]
    pub fn overflow_count(&self) -> usize {
        self.overflow.count
    }

    /// Walk every slab currently queued in the overflow list, calling `f`
    /// (typically `platform::return_pages_to_os`) on each. Slabs stay linked
    /// in the overflow list: `return_pages_to_os` only advises the OS that a
    /// page's contents may be discarded (`MADV_DONTNEED`/`MEM_DECOMMIT`), it
    /// does not unmap it, so the pointer must remain reachable for
    /// `ClassArena`'s `Drop` to unmap it at teardown and for `pop` to hand it
    /// back out if the slow path needs it again later. Returns the number of
    /// slabs visited (the full overflow backlog, not a truncated budget —
    /// the watermark only gates *whether* a sweep drains, not how much of
    /// the backlog it covers).
    pub fn drain_overflow(&mut self, mut f: impl FnMut(*mut Slab)) -> usize {
        let mut visited = 0;
        let mut cursor = self.overflow.head;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            f(cursor);
            visited += 1;
            cursor = next;
        }
        visited
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CachePush {
    Cached,
    Overflowed,
}
