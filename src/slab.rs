//! The slab: a single mapped page carved into N fixed-size slots, with an
//! inline header and a trailing atomic bitmap (one bit per slot, 1 = free).
//!
//! A `Slab`'s header lives at the front of the very page it describes —
//! there is no separate metadata arena, since every slab here is a single
//! fixed-size page rather than a variable-length run carved out of a larger
//! mapping and later recombined.

use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::size_class::SizeClassInfo;

/// Where a slab currently lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SlabState {
    /// Linked into a class/epoch arena's PARTIAL list.
    Partial = 0,
    /// Linked into a class/epoch arena's FULL list.
    Full = 1,
    /// Sitting in the empty-slab cache or overflow list, not owned by any epoch.
    EmptyCached = 2,
}

impl SlabState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlabState::Partial,
            1 => SlabState::Full,
            _ => SlabState::EmptyCached,
        }
    }
}

/// Inline header at the front of every mapped slab page.
///
/// `prev`/`next` are mutated only while the owning class mutex is held, so
/// they are plain raw pointers, not atomics.
#[repr(C)]
pub struct Slab {
    /// Size class this slab belongs to.
    pub class: usize,
    /// Epoch this incarnation is assigned to. Rewritten on recycle.
    epoch_id: AtomicU32,
    /// Incremented every time this slab is recycled from the empty cache;
    /// invalidates handles issued against the previous incarnation.
    generation: AtomicU64,
    state: AtomicU8,
    /// Number of currently-free slots. `free_count == popcount(bitmap)` always.
    free_count: AtomicUsize,
    /// Starting bitmap word for the next sequential-mode scan.
    scan_hint: AtomicUsize,
    /// Previous slab in whichever list currently owns this slab.
    pub prev: *mut Slab,
    /// Next slab in whichever list currently owns this slab.
    pub next: *mut Slab,
}

// SAFETY: Slab is shared across threads via `current_partial` and list
// links; all link mutation happens under the owning class mutex, and the
// bitmap/free_count/state fields are atomics with documented orderings.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

/// Size of the inline header, in bytes. Size classes subtract this (plus
/// bitmap bytes) from `slab_page_bytes` to derive `slots_per_slab`.
pub const SLAB_HEADER_BYTES: usize = core::mem::size_of::<Slab>();

impl Slab {
    /// Initialize a freshly mapped page as an empty (all-free) slab of the
    /// given class and epoch, generation 0.
    ///
    /// # Safety
    /// `page` must point to a writable region of at least `info`'s
    /// `SLAB_HEADER_BYTES + bitmap + slots` bytes, freshly mapped or
    /// otherwise not aliased.
    pub unsafe fn init(page: *mut u8, class: usize, epoch_id: u32, info: &SizeClassInfo) -> *mut Slab {
        let slab = page as *mut Slab;
        unsafe {
            ptr::write(
                slab,
                Slab {
                    class,
                    epoch_id: AtomicU32::new(epoch_id),
                    generation: AtomicU64::new(0),
                    state: AtomicU8::new(SlabState::Partial as u8),
                    free_count: AtomicUsize::new(info.slots_per_slab),
                    scan_hint: AtomicUsize::new(0),
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                },
            );
            for w in 0..info.bitmap_words {
                (*slab).bitmap_word_ptr(info, w).write(AtomicU64::new(u64::MAX));
            }
            // Clear any trailing bits beyond slots_per_slab in the last word
            // so a full-bitmap scan can't "find" phantom free slots.
            let total_bits = info.bitmap_words * 64;
            if total_bits > info.slots_per_slab {
                let last_word = info.bitmap_words - 1;
                let valid_bits_in_last = 64 - (total_bits - info.slots_per_slab);
                let mask = if valid_bits_in_last >= 64 {
                    u64::MAX
                } else {
                    (1u64 << valid_bits_in_last) - 1
                };
                (*(*slab).bitmap_word_ptr(info, last_word)).store(mask, Ordering::Relaxed);
            }
        }
        slab
    }

    /// Reinitialize a recycled slab (from the empty cache) for a new epoch.
    /// Bumps the generation so outstanding handles from the prior
    /// incarnation fail as `StaleHandle`.
    ///
    /// # Safety
    /// Caller must hold exclusive access: the slab must not be reachable
    /// from any list or `current_partial` while this runs.
    pub unsafe fn recycle(&self, new_epoch_id: u32, info: &SizeClassInfo) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.epoch_id.store(new_epoch_id, Ordering::Relaxed);
        self.state.store(SlabState::Partial as u8, Ordering::Relaxed);
        self.free_count.store(info.slots_per_slab, Ordering::Relaxed);
        self.scan_hint.store(0, Ordering::Relaxed);
        unsafe {
            for w in 0..info.bitmap_words {
                self.bitmap_word_ptr(info, w).write(AtomicU64::new(u64::MAX));
            }
            let total_bits = info.bitmap_words * 64;
            if total_bits > info.slots_per_slab {
                let last_word = info.bitmap_words - 1;
                let valid_bits_in_last = 64 - (total_bits - info.slots_per_slab);
                let mask = if valid_bits_in_last >= 64 {
                    u64::MAX
                } else {
                    (1u64 << valid_bits_in_last) - 1
                };
                (*self.bitmap_word_ptr(info, last_word)).store(mask, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    fn bitmap_base(&self) -> *mut AtomicU64 {
        let base = self as *const Slab as usize + SLAB_HEADER_BYTES;
        base as *mut AtomicU64
    }

    /// # Safety
    /// `word` must be `< info.bitmap_words`.
    #[inline]
    unsafe fn bitmap_word_ptr(&self, _info: &SizeClassInfo, word: usize) -> *mut AtomicU64 {
        unsafe { self.bitmap_base().add(word) }
    }

    #[inline]
    fn bitmap_word(&self, word: usize) -> &AtomicU64 {
        unsafe { &*self.bitmap_base().add(word) }
    }

    /// Pointer to slot `index`'s memory.
    #[inline]
    pub fn slot_ptr(&self, info: &SizeClassInfo, index: usize) -> *mut u8 {
        let slots_base = self as *const Slab as usize + SLAB_HEADER_BYTES + info.bitmap_words * 8;
        (slots_base + index * info.size) as *mut u8
    }

    #[inline]
    pub fn epoch_id(&self) -> u32 {
        self.epoch_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> SlabState {
        SlabState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_state(&self, state: SlabState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Force `free_count` to match a freshly computed bitmap popcount.
    /// Used only by zombie repair, under the owning class mutex.
    #[inline]
    pub fn reconcile_free_count(&self, popcount: usize) {
        self.free_count.store(popcount, Ordering::Release);
    }

    #[inline]
    pub fn scan_hint(&self) -> usize {
        self.scan_hint.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_scan_hint(&self, word: usize) {
        self.scan_hint.store(word, Ordering::Relaxed);
    }

    /// Popcount of the live bitmap, for zombie reconciliation and tests.
    /// Only counts bits within `slots_per_slab` (trailing padding bits in
    /// the last word are always kept clear by `init`/`recycle`).
    pub fn bitmap_popcount(&self, info: &SizeClassInfo) -> usize {
        let mut total = 0usize;
        for w in 0..info.bitmap_words {
            total += self.bitmap_word(w).load(Ordering::Relaxed).count_ones() as usize;
        }
        total
    }

    /// Attempt to claim one free slot, scanning `info.bitmap_words` words
    /// starting at `start_word` (wrapping). Returns `(slot_index, retries,
    /// became_full)` on success, or `None` if the slab is observed full.
    ///
    /// `became_full` is derived from `free_count`'s own `fetch_sub` return
    /// value (`prev == 1`), not a separate re-read of `free_count()` —
    /// when two threads concurrently claim the last two slots, only the
    /// one whose decrement actually observed `1` may treat the slab as
    /// newly FULL. A second, independent load would let both threads see
    /// `0` and both call `promote_to_full`, corrupting the FULL list.
    ///
    /// CAS uses acquire on success, relaxed on failure, matching the
    /// documented ordering for bitmap claims.
    pub fn try_claim_slot(&self, info: &SizeClassInfo, start_word: usize) -> Option<(usize, u64, bool)> {
        let mut retries = 0u64;
        for offset in 0..info.bitmap_words {
            let w = (start_word + offset) % info.bitmap_words;
            let word = self.bitmap_word(w);
            loop {
                let cur = word.load(Ordering::Relaxed);
                if cur == 0 {
                    break;
                }
                let bit = cur.trailing_zeros();
                let mask = 1u64 << bit;
                match word.compare_exchange_weak(
                    cur,
                    cur & !mask,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let prev = self.free_count.fetch_sub(1, Ordering::Release);
                        let index = w * 64 + bit as usize;
                        return Some((index, retries, prev == 1));
                    }
                    Err(_) => {
                        retries += 1;
                        continue;
                    }
                }
            }
        }
        None
    }

    /// Release slot `index` back to the bitmap. Returns the free count
    /// observed *before* this release (so the caller can tell whether the
    /// slab transitioned FULL -> PARTIAL), or `Err(())` if the slot's bit
    /// was already set — a double free under the same slab generation.
    pub fn release_slot(&self, _info: &SizeClassInfo, index: usize) -> Result<usize, ()> {
        let word = index / 64;
        let bit = index % 64;
        let mask = 1u64 << bit;
        let w = self.bitmap_word(word);
        loop {
            let cur = w.load(Ordering::Relaxed);
            if cur & mask != 0 {
                return Err(());
            }
            match w.compare_exchange_weak(cur, cur | mask, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    let prev = self.free_count.fetch_add(1, Ordering::Release);
                    return Ok(prev);
                }
                Err(_) => continue,
            }
        }
    }
}

/// A doubly-linked intrusive list of slabs, mutated only under the owning
/// class mutex.
pub struct SlabList {
    pub head: *mut Slab,
    pub count: usize,
}

impl Default for SlabList {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    /// # Safety
    /// `slab` must be a valid, non-null pointer not already linked into any list.
    pub unsafe fn push_front(&mut self, slab: *mut Slab) {
        unsafe {
            (*slab).next = self.head;
            (*slab).prev = ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
            self.head = slab;
            self.count += 1;
        }
    }

    /// # Safety
    /// `slab` must currently be linked into this list.
    pub unsafe fn remove(&mut self, slab: *mut Slab) {
        unsafe {
            let prev = (*slab).prev;
            let next = (*slab).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
            self.count -= 1;
        }
    }

    /// # Safety
    /// List pointers must be valid (maintained by `push_front`/`remove`).
    pub unsafe fn pop_front(&mut self) -> *mut Slab {
        let slab = self.head;
        if !slab.is_null() {
            unsafe { self.remove(slab) };
        }
        slab
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::SizeClassRegistry;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn fresh_page(page_bytes: usize) -> (*mut u8, Layout) {
        let layout = Layout::from_size_align(page_bytes, 8).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        (ptr, layout)
    }

    #[test]
    fn init_sets_free_count_and_popcount() {
        let reg = SizeClassRegistry::new(4096);
        let info = reg.info(2);
        let (page, layout) = fresh_page(4096);
        unsafe {
            let slab = Slab::init(page, 2, 7, info);
            assert_eq!((*slab).free_count(), info.slots_per_slab);
            assert_eq!((*slab).bitmap_popcount(info), info.slots_per_slab);
            assert_eq!((*slab).epoch_id(), 7);
            dealloc(page, layout);
        }
    }

    #[test]
    fn claim_and_release_round_trip() {
        let reg = SizeClassRegistry::new(4096);
        let info = reg.info(0);
        let (page, layout) = fresh_page(4096);
        unsafe {
            let slab = &*Slab::init(page, 0, 0, info);
            let (idx, _, _) = slab.try_claim_slot(info, 0).unwrap();
            assert_eq!(slab.free_count(), info.slots_per_slab - 1);
            let prev = slab.release_slot(info, idx).unwrap();
            assert_eq!(prev, info.slots_per_slab - 1);
            assert_eq!(slab.free_count(), info.slots_per_slab);
            assert!(slab.release_slot(info, idx).is_err(), "double free must be rejected");
            dealloc(page, layout);
        }
    }

    #[test]
    fn claim_until_full_then_none() {
        let reg = SizeClassRegistry::new(4096);
        let info = reg.info(0);
        let (page, layout) = fresh_page(4096);
        unsafe {
            let slab = &*Slab::init(page, 0, 0, info);
            for _ in 0..info.slots_per_slab {
                assert!(slab.try_claim_slot(info, 0).is_some());
            }
            assert!(slab.try_claim_slot(info, 0).is_none());
            assert_eq!(slab.free_count(), 0);
            dealloc(page, layout);
        }
    }

    #[test]
    fn slot_pointers_are_distinct_and_in_bounds() {
        let reg = SizeClassRegistry::new(4096);
        let info = reg.info(3);
        let (page, layout) = fresh_page(4096);
        unsafe {
            let slab = &*Slab::init(page, 3, 0, info);
            let page_end = page as usize + 4096;
            for i in 0..info.slots_per_slab {
                let p = slab.slot_ptr(info, i) as usize;
                assert!(p >= page as usize && p + info.size <= page_end);
            }
            dealloc(page, layout);
        }
    }

    #[test]
    fn recycle_resets_state_and_bumps_generation() {
        let reg = SizeClassRegistry::new(4096);
        let info = reg.info(1);
        let (page, layout) = fresh_page(4096);
        unsafe {
            let slab = &*Slab::init(page, 1, 0, info);
            slab.try_claim_slot(info, 0);
            assert_eq!(slab.generation(), 0);
            slab.recycle(5, info);
            assert_eq!(slab.generation(), 1);
            assert_eq!(slab.epoch_id(), 5);
            assert_eq!(slab.free_count(), info.slots_per_slab);
            dealloc(page, layout);
        }
    }

    #[test]
    fn list_push_remove_pop() {
        let reg = SizeClassRegistry::new(4096);
        let info = reg.info(0);
        let (p1, l1) = fresh_page(4096);
        let (p2, l2) = fresh_page(4096);
        unsafe {
            let s1 = Slab::init(p1, 0, 0, info);
            let s2 = Slab::init(p2, 0, 0, info);
            let mut list = SlabList::new();
            list.push_front(s1);
            list.push_front(s2);
            assert_eq!(list.count, 2);
            assert_eq!(list.head, s2);
            list.remove(s1);
            assert_eq!(list.count, 1);
            let popped = list.pop_front();
            assert_eq!(popped, s2);
            assert!(list.is_empty());
            dealloc(p1, l1);
            dealloc(p2, l2);
        }
    }
}
