//! Epoch lifecycle manager: a fixed-capacity ring of epoch records cycling
//! through FREE -> ACTIVE -> CLOSING -> CLOSED -> FREE, plus refcounted
//! domains and a process-wide era counter.
//!
//! Unlike the rest of the allocator, whose hot paths are lock-free, epoch
//! administration (`epoch_advance`, `domain_enter`/`exit`, `epoch_close`) is
//! explicitly *not* on a hot path — callers invoke it at phase boundaries,
//! not per allocation — so it leans on `std::sync::{Mutex, Condvar}` the way
//! the rest of this crate does for anything that may genuinely suspend.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use tracing::{info, trace};

/// Maximum bytes retained from a domain label; longer labels are truncated.
pub const MAX_LABEL_BYTES: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EpochState {
    Free = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl EpochState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EpochState::Free,
            1 => EpochState::Active,
            2 => EpochState::Closing,
            _ => EpochState::Closed,
        }
    }
}

#[derive(Default)]
struct EpochMeta {
    label: Option<String>,
    open_since: Option<Instant>,
    rss_before_close: u64,
    rss_after_close: u64,
}

/// One slot in the epoch ring.
pub struct EpochRecord {
    state: AtomicU8,
    era: AtomicU64,
    domain_refcount: AtomicUsize,
    /// alloc_obj increments, free_obj decrements; reaching zero while
    /// CLOSING wakes a waiting `epoch_close`.
    outstanding: AtomicI64,
    /// Claimed by whichever `epoch_close` call is responsible for draining
    /// and sweeping this incarnation. Distinct from `state`: a domain's
    /// refcount reaching zero also drives ACTIVE -> CLOSING, but that alone
    /// must not let two concurrent `epoch_close` callers both sweep.
    sweep_claimed: AtomicBool,
    drain_mu: Mutex<()>,
    drain_cv: Condvar,
    meta: Mutex<EpochMeta>,
}

impl EpochRecord {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EpochState::Free as u8),
            era: AtomicU64::new(0),
            domain_refcount: AtomicUsize::new(0),
            outstanding: AtomicI64::new(0),
            sweep_claimed: AtomicBool::new(false),
            drain_mu: Mutex::new(()),
            drain_cv: Condvar::new(),
            meta: Mutex::new(EpochMeta::default()),
        }
    }

    /// Atomically claim responsibility for draining and sweeping this
    /// incarnation. Returns `true` for exactly one caller per incarnation,
    /// regardless of whether the ACTIVE -> CLOSING transition happened via
    /// this same call or an earlier `domain_exit`.
    #[inline]
    fn claim_for_sweep(&self) -> bool {
        self.sweep_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn state(&self) -> EpochState {
        EpochState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn era(&self) -> u64 {
        self.era.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == EpochState::Active
    }

    /// Record one more in-flight allocation against this epoch.
    #[inline]
    pub fn note_alloc(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one fewer in-flight allocation. Wakes a waiting
    /// `epoch_close` once the count reaches zero while CLOSING.
    #[inline]
    pub fn note_free(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 && self.state() == EpochState::Closing {
            let _guard = self.drain_mu.lock().unwrap();
            self.drain_cv.notify_all();
        }
    }

    pub fn domain_refcount(&self) -> usize {
        self.domain_refcount.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> Option<String> {
        self.meta.lock().unwrap().label.clone()
    }

    /// Nanoseconds since this epoch incarnation became ACTIVE, or 0 if it
    /// has never been opened (a FREE slot that's never been advanced into).
    pub fn open_since_ns(&self) -> u64 {
        self.meta
            .lock()
            .unwrap()
            .open_since
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// A refcounted handle bound to one ACTIVE epoch.
#[derive(Clone, Copy, Debug)]
pub struct Domain {
    pub epoch_id: u32,
}

/// RSS accounting for a completed `epoch_close` sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub rss_before_close: u64,
    pub rss_after_close: u64,
    /// Whether this call actually performed the close (false if the epoch
    /// was already CLOSING/CLOSED/FREE — the idempotent "second call is a
    /// no-op" case).
    pub performed: bool,
}

/// The fixed-capacity ring of epoch records.
pub struct EpochTable {
    records: Vec<EpochRecord>,
    /// Id of the most recently advanced-to-ACTIVE epoch; `domain_enter`
    /// binds to this one.
    current: AtomicU32,
    next_era: AtomicU64,
}

impl EpochTable {
    pub fn new(ring_size: usize) -> Self {
        let mut records = Vec::with_capacity(ring_size);
        for _ in 0..ring_size {
            records.push(EpochRecord::new());
        }
        Self {
            records,
            current: AtomicU32::new(0),
            next_era: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn record(&self, epoch_id: u32) -> &EpochRecord {
        &self.records[epoch_id as usize % self.records.len()]
    }

    /// Ring-slot index for `epoch_id`, used to index the per-class
    /// `ClassArena` epoch slots 1:1 with the epoch ring.
    #[inline]
    pub fn ring_slot(&self, epoch_id: u32) -> usize {
        epoch_id as usize % self.records.len()
    }

    #[inline]
    pub fn ring_size(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn current_epoch(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// FREE -> ACTIVE: find a free ring slot (scanning from the slot after
    /// the current one), stamp a new era, and publish it as current.
    pub fn advance(&self) -> u32 {
        let n = self.records.len();
        let start = self.current.load(Ordering::Relaxed) as usize;
        for offset in 1..=n {
            let idx = (start + offset) % n;
            let rec = &self.records[idx];
            if rec
                .state
                .compare_exchange(
                    EpochState::Free as u8,
                    EpochState::Active as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let era = self.next_era.fetch_add(1, Ordering::AcqRel);
                rec.era.store(era, Ordering::Release);
                rec.domain_refcount.store(0, Ordering::Relaxed);
                rec.outstanding.store(0, Ordering::Relaxed);
                rec.sweep_claimed.store(false, Ordering::Relaxed);
                {
                    let mut meta = rec.meta.lock().unwrap();
                    meta.label = None;
                    meta.open_since = Some(Instant::now());
                    meta.rss_before_close = 0;
                    meta.rss_after_close = 0;
                }
                self.current.store(idx as u32, Ordering::Release);
                info!(epoch_id = idx, era, "epoch advanced to ACTIVE");
                return idx as u32;
            }
        }
        panic!("epoch ring exhausted: no FREE slot available (ring_size={n})");
    }

    /// Bind to the current epoch, bumping its refcount. Fixes the label on
    /// the first (non-nested) entry; later nested entries never overwrite it.
    pub fn domain_enter(&self, label: &str) -> Domain {
        let epoch_id = self.current_epoch();
        let rec = self.record(epoch_id);
        let prev = rec.domain_refcount.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            let mut meta = rec.meta.lock().unwrap();
            if meta.label.is_none() {
                let mut truncated = label.to_string();
                truncated.truncate(MAX_LABEL_BYTES);
                meta.label = Some(truncated);
            }
        }
        trace!(epoch_id, "domain entered");
        Domain { epoch_id }
    }

    /// Release a domain handle. When the refcount reaches zero, the epoch
    /// begins closing (ACTIVE -> CLOSING); the caller must still invoke
    /// `epoch_close` to drive the drain-and-sweep to completion.
    pub fn domain_exit(&self, domain: Domain) {
        let rec = self.record(domain.epoch_id);
        let prev = rec.domain_refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.begin_closing(domain.epoch_id);
        }
    }

    /// Claim the right to drain and sweep `epoch_id`. Ensures the epoch is
    /// at least CLOSING (driving ACTIVE -> CLOSING itself if nobody has
    /// yet), then atomically claims the sweep. Returns `false` if the epoch
    /// is already CLOSED/FREE, or if another caller already claimed the
    /// sweep for this incarnation.
    pub fn claim_close(&self, epoch_id: u32) -> bool {
        let rec = self.record(epoch_id);
        match rec.state() {
            EpochState::Closed | EpochState::Free => false,
            EpochState::Active => {
                self.begin_closing(epoch_id);
                rec.claim_for_sweep()
            }
            EpochState::Closing => rec.claim_for_sweep(),
        }
    }

    /// ACTIVE -> CLOSING. Idempotent: returns `true` only on the transition
    /// that actually happened.
    pub fn begin_closing(&self, epoch_id: u32) -> bool {
        let rec = self.record(epoch_id);
        let ok = rec
            .state
            .compare_exchange(
                EpochState::Active as u8,
                EpochState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if ok {
            info!(epoch_id, "epoch transitioned to CLOSING");
        }
        ok
    }

    /// Block until `outstanding` drains to zero for this (already CLOSING)
    /// epoch.
    pub fn wait_drained(&self, epoch_id: u32) {
        let rec = self.record(epoch_id);
        if rec.outstanding.load(Ordering::Acquire) == 0 {
            return;
        }
        let guard = rec.drain_mu.lock().unwrap();
        let _guard = rec
            .drain_cv
            .wait_while(guard, |_| rec.outstanding.load(Ordering::Acquire) != 0)
            .unwrap();
    }

    /// CLOSED -> FREE, after the reclamation sweep has run. Records the
    /// final RSS-after figure and frees the ring slot for reuse.
    pub fn finish_close(&self, epoch_id: u32, rss_before: u64, rss_after: u64) {
        let rec = self.record(epoch_id);
        {
            let mut meta = rec.meta.lock().unwrap();
            meta.rss_before_close = rss_before;
            meta.rss_after_close = rss_after;
        }
        rec.state.store(EpochState::Closed as u8, Ordering::Release);
        info!(
            epoch_id,
            rss_before_close = rss_before,
            rss_after_close = rss_after,
            "epoch closed"
        );
        rec.state.store(EpochState::Free as u8, Ordering::Release);
    }

    pub fn rss_report(&self, epoch_id: u32) -> (u64, u64) {
        let meta = self.record(epoch_id).meta.lock().unwrap();
        (meta.rss_before_close, meta.rss_after_close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_cycles_through_free_slots() {
        let table = EpochTable::new(4);
        let e0 = table.advance();
        assert_eq!(table.record(e0).state(), EpochState::Active);
        assert!(table.record(e0).era() >= 1);
    }

    #[test]
    fn domain_enter_exit_tracks_refcount() {
        let table = EpochTable::new(4);
        table.advance();
        let d1 = table.domain_enter("phase-a");
        let d2 = table.domain_enter("phase-a-nested");
        let epoch_id = d1.epoch_id;
        assert_eq!(table.record(epoch_id).domain_refcount(), 2);
        assert_eq!(table.record(epoch_id).label().as_deref(), Some("phase-a"));
        table.domain_exit(d1);
        assert_eq!(table.record(epoch_id).domain_refcount(), 1);
        assert_eq!(table.record(epoch_id).state(), EpochState::Active);
        table.domain_exit(d2);
        assert_eq!(table.record(epoch_id).state(), EpochState::Closing);
    }

    #[test]
    fn begin_closing_is_idempotent() {
        let table = EpochTable::new(4);
        let e0 = table.advance();
        assert!(table.begin_closing(e0));
        assert!(!table.begin_closing(e0));
    }

    #[test]
    fn wait_drained_returns_immediately_when_zero() {
        let table = EpochTable::new(4);
        let e0 = table.advance();
        table.begin_closing(e0);
        table.wait_drained(e0);
    }

    #[test]
    fn note_free_wakes_waiter() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let table = Arc::new(EpochTable::new(4));
        let e0 = table.advance();
        table.record(e0).note_alloc();
        table.begin_closing(e0);

        let t = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.record(e0).note_free();
            })
        };
        table.wait_drained(e0);
        t.join().unwrap();
    }

    #[test]
    fn label_immutable_after_first_entry() {
        let table = EpochTable::new(4);
        table.advance();
        let d1 = table.domain_enter("first");
        let _d2 = table.domain_enter("second");
        assert_eq!(table.record(d1.epoch_id).label().as_deref(), Some("first"));
    }
}
