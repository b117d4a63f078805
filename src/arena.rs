//! Per-class arena: one `ClassArena` per size class, holding the
//! per-epoch-ring-slot PARTIAL/FULL lists, the lock-free `current_partial`
//! fast-path pointer, adaptive scan-mode state, and the shared empty-slab
//! cache for that class.
//!
//! Per-size-class locking, list management, and new-page acquisition all
//! live here: there is no variable-size span to carve or coalesce, so it
//! collapses into one slow path that either reuses a PARTIAL slab, recycles
//! an EMPTY one from the cache, or maps a fresh page.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use tracing::{debug, info, trace, warn};

use crate::empty_cache::{CachePush, EmptyCache};
use crate::error::AllocError;
use crate::handle::{Handle, HandleRegistry};
use crate::platform;
use crate::size_class::SizeClassInfo;
use crate::slab::{Slab, SlabList, SlabState};
use crate::stats::ClassStatsInner;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ScanMode {
    Sequential = 0,
    Randomized = 1,
}

thread_local! {
    static LCG_STATE: Cell<u64> = Cell::new(0x9E37_79B9_7F4A_7C15);
}

/// Thread-local xorshift-ish LCG, used only to spread bitmap scan start
/// points under contention (never for anything security-sensitive).
fn lcg_next() -> u64 {
    LCG_STATE.with(|s| {
        let mut x = s.get();
        if x == 0 {
            x = 0x9E37_79B9_7F4A_7C15;
        }
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        s.set(x);
        x
    })
}

/// Retry-rate EWMA threshold above which a class/epoch flips to RANDOMIZED.
const SCAN_MODE_HIGH_WATERMARK_MILLI: u64 = 300;
/// Threshold below which it reverts to SEQUENTIAL.
const SCAN_MODE_LOW_WATERMARK_MILLI: u64 = 100;
/// EWMA smoothing: new_rate = (sample * ALPHA + old * (1000-ALPHA)) / 1000.
const EWMA_ALPHA_MILLI: u64 = 100;

struct EpochSlot {
    current_partial: AtomicPtr<Slab>,
    scan_mode: AtomicU8,
    /// Retry rate EWMA, fixed-point scaled by 1000 (300 == 0.30).
    retry_ewma_milli: AtomicU64,
    partial: SlabList,
    full: SlabList,
}

impl EpochSlot {
    fn new() -> Self {
        Self {
            current_partial: AtomicPtr::new(ptr::null_mut()),
            scan_mode: AtomicU8::new(ScanMode::Sequential as u8),
            retry_ewma_milli: AtomicU64::new(0),
            partial: SlabList::new(),
            full: SlabList::new(),
        }
    }

    fn scan_mode(&self) -> ScanMode {
        if self.scan_mode.load(Ordering::Relaxed) == ScanMode::Sequential as u8 {
            ScanMode::Sequential
        } else {
            ScanMode::Randomized
        }
    }
}

struct ClassLocked {
    slots: Vec<EpochSlot>,
    empty_cache: EmptyCache,
}

/// Everything the allocator maintains for one size class.
pub struct ClassArena {
    pub class: usize,
    pub info: SizeClassInfo,
    locked: Mutex<ClassLocked>,
    overflow_drain_high_watermark: usize,
    adaptive_scan_enabled: bool,
    slab_page_bytes: usize,
    pub stats: ClassStatsInner,
}

/// Outcome of a successful claim, used by the allocator root to update
/// epoch bookkeeping and return a `Handle`.
pub struct Claimed {
    pub slab_addr: usize,
    pub slot: u32,
    pub generation: u64,
    pub epoch_id: u32,
}

impl ClassArena {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class: usize,
        info: SizeClassInfo,
        ring_size: usize,
        cache_capacity: usize,
        overflow_drain_high_watermark: usize,
        adaptive_scan_enabled: bool,
        slab_page_bytes: usize,
    ) -> Self {
        let mut slots = Vec::with_capacity(ring_size);
        for _ in 0..ring_size {
            slots.push(EpochSlot::new());
        }
        Self {
            class,
            info,
            locked: Mutex::new(ClassLocked {
                slots,
                empty_cache: EmptyCache::new(cache_capacity),
            }),
            overflow_drain_high_watermark,
            adaptive_scan_enabled,
            slab_page_bytes,
            stats: ClassStatsInner::new(),
        }
    }

    /// Acquire the class mutex, probing with `try_lock` first so
    /// `lock_fast_acquire`/`lock_contended` reflect real contention instead
    /// of always going through the blocking path.
    fn lock(&self) -> MutexGuard<'_, ClassLocked> {
        match self.locked.try_lock() {
            Ok(guard) => {
                self.stats.record_lock(true);
                guard
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                self.stats.record_lock(true);
                poisoned.into_inner()
            }
            Err(TryLockError::WouldBlock) => {
                self.stats.record_lock(false);
                match self.locked.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                }
            }
        }
    }

    /// Count slabs in this class/epoch's PARTIAL or FULL lists whose bitmap
    /// is already fully free — a live preview of what the next
    /// `epoch_close` sweep would reclaim, for `stats_epoch`.
    pub fn reclaimable_count(&self, ring_slot: usize) -> u64 {
        let locked = self.lock();
        let slot = &locked.slots[ring_slot];
        let mut count = 0u64;
        for list in [&slot.full, &slot.partial] {
            let mut cursor = list.head;
            while !cursor.is_null() {
                if unsafe { (*cursor).free_count() } == self.info.slots_per_slab {
                    count += 1;
                }
                cursor = unsafe { (*cursor).next };
            }
        }
        count
    }

    /// Reset the arena state for a ring slot that has just been recycled
    /// to a freshly-ACTIVE epoch (called by the allocator root right after
    /// `EpochTable::advance`).
    pub fn reset_slot(&self, ring_slot: usize) {
        let locked = self.lock();
        let slot = &locked.slots[ring_slot];
        slot.current_partial.store(ptr::null_mut(), Ordering::Release);
        slot.scan_mode.store(ScanMode::Sequential as u8, Ordering::Relaxed);
        slot.retry_ewma_milli.store(0, Ordering::Relaxed);
        debug_assert!(slot.partial.is_empty() && slot.full.is_empty());
    }

    /// Null out `current_partial` for a ring slot without touching list
    /// membership. Called by `epoch_close` right after the epoch transitions
    /// to CLOSING, so racing fast-path allocators fall to the slow path and
    /// observe the epoch as no longer ACTIVE.
    pub fn reset_current_partial(&self, ring_slot: usize) {
        let locked = self.lock();
        locked.slots[ring_slot]
            .current_partial
            .store(ptr::null_mut(), Ordering::Release);
    }

    /// Fast + slow path allocation against the given epoch ring slot.
    pub fn alloc(
        &self,
        ring_slot: usize,
        epoch_id: u32,
        handles: &HandleRegistry,
        slab_page_bytes: usize,
    ) -> Result<Claimed, AllocError> {
        self.stats.alloc_count.fetch_add(1, Ordering::Relaxed);

        if let Some(claimed) = self.try_fast_path(ring_slot, epoch_id) {
            return Ok(claimed);
        }
        self.slow_path(ring_slot, epoch_id, handles, slab_page_bytes)
    }

    fn try_fast_path(&self, ring_slot: usize, epoch_id: u32) -> Option<Claimed> {
        let locked = self.lock();
        let slot = &locked.slots[ring_slot];
        let cp = slot.current_partial.load(Ordering::Acquire);
        drop(locked);
        if cp.is_null() {
            return None;
        }
        self.try_claim_from(cp, ring_slot, epoch_id)
    }

    /// Attempt to claim a slot from a specific slab, handling promotion and
    /// zombie repair. Returns `None` if the slab was observed full (the
    /// ordinary, expected race — caller should fall to the slow path).
    fn try_claim_from(&self, cp: *mut Slab, ring_slot: usize, epoch_id: u32) -> Option<Claimed> {
        let slab = unsafe { &*cp };
        let slot_scan_mode = {
            let locked = self.lock();
            locked.slots[ring_slot].scan_mode()
        };
        self.stats.bitmap_alloc_attempts.fetch_add(1, Ordering::Relaxed);

        let start_word = match slot_scan_mode {
            ScanMode::Sequential => slab.scan_hint(),
            ScanMode::Randomized => {
                if self.info.bitmap_words == 0 {
                    0
                } else {
                    (lcg_next() as usize) % self.info.bitmap_words
                }
            }
        };

        match slab.try_claim_slot(&self.info, start_word) {
            Some((idx, retries, became_full)) => {
                self.stats
                    .bitmap_alloc_cas_retries
                    .fetch_add(retries, Ordering::Relaxed);
                self.record_retry_sample(ring_slot, retries > 0);
                if matches!(slot_scan_mode, ScanMode::Sequential) {
                    slab.set_scan_hint((idx / 64 + 1) % self.info.bitmap_words.max(1));
                }
                if became_full {
                    self.promote_to_full(ring_slot, cp);
                }
                Some(Claimed {
                    slab_addr: cp as usize,
                    slot: idx as u32,
                    generation: slab.generation(),
                    epoch_id,
                })
            }
            None => {
                self.check_zombie(ring_slot, cp);
                None
            }
        }
    }

    /// Compare `free_count` against the true bitmap popcount; if they
    /// disagree, the slab's list placement has raced against its bitmap
    /// state (a zombie). Repair in place under the class mutex.
    fn check_zombie(&self, ring_slot: usize, cp: *mut Slab) {
        let slab = unsafe { &*cp };
        let popcount = slab.bitmap_popcount(&self.info);
        if popcount == slab.free_count() {
            return;
        }
        self.stats.zombie_repair_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            class = self.class,
            ring_slot,
            popcount,
            free_count = slab.free_count(),
            "zombie slab detected, repairing list placement"
        );
        let mut locked = self.lock();
        let epoch = &mut locked.slots[ring_slot];
        slab.reconcile_free_count(popcount);
        let was_full = slab.state() == SlabState::Full;
        if popcount == 0 {
            if !was_full {
                unsafe {
                    remove_if_linked(&mut epoch.partial, cp);
                    epoch.full.push_front(cp);
                }
            }
            slab.set_state(SlabState::Full);
            if epoch.current_partial.load(Ordering::Relaxed) == cp {
                epoch.current_partial.store(ptr::null_mut(), Ordering::Release);
            }
        } else {
            if was_full {
                unsafe {
                    remove_if_linked(&mut epoch.full, cp);
                    epoch.partial.push_front(cp);
                }
            }
            slab.set_state(SlabState::Partial);
            if epoch.current_partial.load(Ordering::Relaxed).is_null() {
                epoch.current_partial.store(cp, Ordering::Release);
            }
        }
    }

    fn promote_to_full(&self, ring_slot: usize, cp: *mut Slab) {
        let mut locked = self.lock();
        let slot = &mut locked.slots[ring_slot];
        self.stats
            .current_partial_cas_attempts
            .fetch_add(1, Ordering::Relaxed);
        let swapped = slot
            .current_partial
            .compare_exchange(cp, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if !swapped {
            self.stats
                .current_partial_cas_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        // `try_claim_slot`'s caller only invokes this when its own decrement
        // observed the transition to zero, so exactly one thread should ever
        // reach here per slab per FULL incarnation. Guard on state anyway:
        // relinking an already-FULL slab would push it onto its own list a
        // second time and corrupt the links.
        if unsafe { (*cp).state() } != SlabState::Full {
            unsafe {
                remove_if_linked(&mut slot.partial, cp);
                slot.full.push_front(cp);
            }
            unsafe { (*cp).set_state(SlabState::Full) };
        }
    }

    fn record_retry_sample(&self, ring_slot: usize, had_retry: bool) {
        if !self.adaptive_scan_enabled {
            return;
        }
        let locked = self.lock();
        let slot = &locked.slots[ring_slot];
        let sample = if had_retry { 1000 } else { 0 };
        let old = slot.retry_ewma_milli.load(Ordering::Relaxed);
        let new = (sample * EWMA_ALPHA_MILLI + old * (1000 - EWMA_ALPHA_MILLI)) / 1000;
        slot.retry_ewma_milli.store(new, Ordering::Relaxed);
        let cur_mode = slot.scan_mode();
        if cur_mode == ScanMode::Sequential && new > SCAN_MODE_HIGH_WATERMARK_MILLI {
            slot.scan_mode.store(ScanMode::Randomized as u8, Ordering::Relaxed);
            info!(class = self.class, ring_slot, rate = new, "scan mode -> RANDOMIZED");
        } else if cur_mode == ScanMode::Randomized && new < SCAN_MODE_LOW_WATERMARK_MILLI {
            slot.scan_mode.store(ScanMode::Sequential as u8, Ordering::Relaxed);
            info!(class = self.class, ring_slot, rate = new, "scan mode -> SEQUENTIAL");
        }
    }

    fn slow_path(
        &self,
        ring_slot: usize,
        epoch_id: u32,
        handles: &HandleRegistry,
        slab_page_bytes: usize,
    ) -> Result<Claimed, AllocError> {
        trace!(class = self.class, ring_slot, "slow path entered");
        self.stats.slow_path_hits.fetch_add(1, Ordering::Relaxed);

        loop {
            let candidate = {
                let mut locked = self.lock();
                let slot = &mut locked.slots[ring_slot];
                if slot.current_partial.load(Ordering::Relaxed).is_null() {
                    let head = unsafe { slot.partial.pop_front() };
                    if !head.is_null() {
                        unsafe { slot.partial.push_front(head) };
                        slot.current_partial.store(head, Ordering::Release);
                    }
                }
                let cp = slot.current_partial.load(Ordering::Acquire);
                if !cp.is_null() {
                    Some(cp)
                } else {
                    None
                }
            };

            if let Some(cp) = candidate
                && let Some(claimed) = self.try_claim_from(cp, ring_slot, epoch_id)
            {
                return Ok(claimed);
            }
            if candidate.is_some() {
                // The list-head slab turned out full too; give up on it and
                // fall through to cache/mmap acquisition below.
                let mut locked = self.lock();
                let slot = &mut locked.slots[ring_slot];
                slot.current_partial.store(ptr::null_mut(), Ordering::Release);
            }

            let fresh = {
                let mut locked = self.lock();
                let popped = locked.empty_cache.pop();
                if !popped.is_null() {
                    self.stats.empty_slab_recycled.fetch_add(1, Ordering::Relaxed);
                    unsafe { (*popped).recycle(epoch_id, &self.info) };
                    Some(popped)
                } else {
                    None
                }
            };

            let slab = if let Some(s) = fresh {
                debug!(class = self.class, "slow path: reused cached slab");
                s
            } else {
                self.stats.slow_path_cache_miss.fetch_add(1, Ordering::Relaxed);
                let page = unsafe { platform::map_page(slab_page_bytes) };
                if page.is_null() {
                    return Err(AllocError::OutOfMemory);
                }
                self.stats.new_slab_count.fetch_add(1, Ordering::Relaxed);
                debug!(class = self.class, "slow path: mapped fresh slab");
                let s = unsafe { Slab::init(page, self.class, epoch_id, &self.info) };
                if !handles.insert(s as usize, self.class) {
                    unsafe { platform::unmap_page(page, slab_page_bytes) };
                    return Err(AllocError::OutOfMemory);
                }
                s
            };

            {
                let mut locked = self.lock();
                let slot = &mut locked.slots[ring_slot];
                unsafe { slot.partial.push_front(slab) };
                slot.current_partial.store(slab, Ordering::Release);
            }

            if let Some(claimed) = self.try_claim_from(slab, ring_slot, epoch_id) {
                return Ok(claimed);
            }
            // Freshly initialized/recycled slab must have free slots; if we
            // land here it's a logic bug elsewhere. Loop rather than panic.
        }
    }

    /// Release a slot. Returns `Some(prev_free_count)` on success (`None`
    /// means a double free under the same generation).
    pub fn free(&self, ring_slot: usize, slab: &Slab, slot_idx: u32) -> Result<usize, ()> {
        let result = slab.release_slot(&self.info, slot_idx as usize);
        if let Ok(prev) = result {
            self.stats.free_count.fetch_add(1, Ordering::Relaxed);
            if prev == 0 {
                self.demote_from_full(ring_slot, slab as *const Slab as *mut Slab);
            }
        }
        result
    }

    fn demote_from_full(&self, ring_slot: usize, slab: *mut Slab) {
        let mut locked = self.lock();
        let slot = &mut locked.slots[ring_slot];
        unsafe {
            remove_if_linked(&mut slot.full, slab);
            slot.partial.push_front(slab);
        }
        unsafe { (*slab).set_state(SlabState::Partial) };
        if slot.current_partial.load(Ordering::Relaxed).is_null() {
            slot.current_partial.store(slab, Ordering::Release);
        }
    }

    /// Number of slabs currently mapped (in the PARTIAL or FULL list) for
    /// this ring slot — used by `epoch_close` to compute aggregate RSS
    /// before and after its sweep.
    pub fn mapped_slab_count(&self, ring_slot: usize) -> u64 {
        let locked = self.lock();
        let slot = &locked.slots[ring_slot];
        (slot.partial.count + slot.full.count) as u64
    }

    /// Reclamation sweep for one epoch ring slot, run only from
    /// `epoch_close`. Returns bytes reclaimed to the cache/overflow.
    pub fn sweep_epoch(&self, ring_slot: usize, slab_page_bytes: usize) -> u64 {
        let mut locked = self.lock();
        let ClassLocked { slots, empty_cache } = &mut *locked;
        let slot = &mut slots[ring_slot];
        let mut reclaimed_bytes = 0u64;

        reclaimed_bytes += drain_fully_empty(&mut slot.full, empty_cache, &self.info, &self.stats);
        reclaimed_bytes += drain_fully_empty(&mut slot.partial, empty_cache, &self.info, &self.stats);
        slot.current_partial.store(ptr::null_mut(), Ordering::Release);

        if empty_cache.overflow_count() >= self.overflow_drain_high_watermark {
            let stats = &self.stats;
            empty_cache.drain_overflow(|s| {
                stats.madvise_calls.fetch_add(1, Ordering::Relaxed);
                stats
                    .madvise_bytes
                    .fetch_add(slab_page_bytes as u64, Ordering::Relaxed);
                unsafe {
                    platform::return_pages_to_os(s as *mut u8, slab_page_bytes);
                }
            });
        }

        reclaimed_bytes
    }
}

impl Drop for ClassArena {
    /// Unmap every slab this class still owns: the PARTIAL/FULL lists of
    /// every ring slot, plus the empty cache and its overflow. Teardown is
    /// unconditional, matching the allocator root's scoped-resource
    /// guarantee.
    fn drop(&mut self) {
        let mut locked = match self.locked.get_mut() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        let page_bytes = self.slab_page_bytes;
        for slot in &mut locked.slots {
            unsafe {
                while !slot.full.is_empty() {
                    let s = slot.full.pop_front();
                    platform::unmap_page(s as *mut u8, page_bytes);
                }
                while !slot.partial.is_empty() {
                    let s = slot.partial.pop_front();
                    platform::unmap_page(s as *mut u8, page_bytes);
                }
            }
        }
        unsafe {
            loop {
                let s = locked.empty_cache.pop();
                if s.is_null() {
                    break;
                }
                platform::unmap_page(s as *mut u8, page_bytes);
            }
        }
    }
}

/// Mark slots whose bitmap is entirely free (`free_count == slots_per_slab`)
/// and move them into the empty cache / overflow. Non-empty slabs are left
/// in place (orphaned: no longer reachable as `current_partial`, but their
/// live slots remain valid until freed).
fn drain_fully_empty(
    list: &mut SlabList,
    empty_cache: &mut EmptyCache,
    info: &SizeClassInfo,
    stats: &ClassStatsInner,
) -> u64 {
    let mut reclaimed = 0u64;
    let mut cursor = list.head;
    while !cursor.is_null() {
        let next = unsafe { (*cursor).next };
        let free_count = unsafe { (*cursor).free_count() };
        if free_count == info.slots_per_slab {
            unsafe { list.remove(cursor) };
            unsafe { (*cursor).set_state(SlabState::EmptyCached) };
            match unsafe { empty_cache.push(cursor) } {
                CachePush::Cached => {
                    stats.empty_slab_recycled.fetch_add(1, Ordering::Relaxed);
                }
                CachePush::Overflowed => {
                    stats.empty_slab_overflowed.fetch_add(1, Ordering::Relaxed);
                }
            }
            reclaimed += 1;
        }
        cursor = next;
    }
    reclaimed
}

/// Remove `slab` from `list` only if it is currently linked there.
/// `SlabList::remove` requires the node to be linked; since a slab that is
/// the sole element has null prev/next either way, detect linkage by
/// checking against the list head or non-null neighbors.
unsafe fn remove_if_linked(list: &mut SlabList, slab: *mut Slab) {
    if list.head == slab {
        unsafe { list.remove(slab) };
        return;
    }
    unsafe {
        if !(*slab).prev.is_null() || !(*slab).next.is_null() {
            list.remove(slab);
        }
    }
}
