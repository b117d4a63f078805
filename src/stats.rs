//! Observability counters and the point-in-time snapshots returned by
//! `stats_global`/`stats_class`/`stats_epoch`.
//!
//! Every counter here is a relaxed atomic: they are purely observational
//! and contribute no ordering constraints. The correctness-relevant
//! orderings live on the bitmap words, `free_count`, and `current_partial`
//! in [`crate::slab`] and [`crate::arena`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-class counters, embedded in each `ClassArena`. Per-(class,epoch)
/// figures (`open_since_ns`, `domain_refcount`, `label`, `era`,
/// `rss_before_close`, `rss_after_close`) live on the `EpochRecord` itself
/// (see [`crate::epoch`]) since they are scoped to one epoch incarnation,
/// not to the class for its whole lifetime.
#[derive(Default)]
pub struct ClassStatsInner {
    pub alloc_count: AtomicU64,
    pub free_count: AtomicU64,
    pub slow_path_hits: AtomicU64,
    pub slow_path_cache_miss: AtomicU64,
    pub slow_path_epoch_closed: AtomicU64,
    pub new_slab_count: AtomicU64,

    pub bitmap_alloc_attempts: AtomicU64,
    pub bitmap_alloc_cas_retries: AtomicU64,
    pub bitmap_free_cas_retries: AtomicU64,

    pub current_partial_cas_attempts: AtomicU64,
    pub current_partial_cas_failures: AtomicU64,

    pub lock_acquisitions: AtomicU64,
    pub lock_fast_acquire: AtomicU64,
    pub lock_contended: AtomicU64,

    pub empty_slab_recycled: AtomicU64,
    pub empty_slab_overflowed: AtomicU64,
    pub madvise_calls: AtomicU64,
    pub madvise_bytes: AtomicU64,
    pub madvise_failures: AtomicU64,

    pub zombie_repair_count: AtomicU64,
}

impl ClassStatsInner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `Mutex::try_lock` probe outcome, ahead of the blocking
    /// `lock()` call the slow path actually uses to acquire the mutex.
    /// `lock_acquisitions` counts every eventual acquisition; `lock_fast_acquire`/
    /// `lock_contended` partition it by whether the probe found it free.
    #[inline]
    pub fn record_lock(&self, fast: bool) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        if fast {
            self.lock_fast_acquire.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lock_contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ClassStats {
        ClassStats {
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
            slow_path_hits: self.slow_path_hits.load(Ordering::Relaxed),
            slow_path_cache_miss: self.slow_path_cache_miss.load(Ordering::Relaxed),
            slow_path_epoch_closed: self.slow_path_epoch_closed.load(Ordering::Relaxed),
            new_slab_count: self.new_slab_count.load(Ordering::Relaxed),
            bitmap_alloc_attempts: self.bitmap_alloc_attempts.load(Ordering::Relaxed),
            bitmap_alloc_cas_retries: self.bitmap_alloc_cas_retries.load(Ordering::Relaxed),
            bitmap_free_cas_retries: self.bitmap_free_cas_retries.load(Ordering::Relaxed),
            current_partial_cas_attempts: self.current_partial_cas_attempts.load(Ordering::Relaxed),
            current_partial_cas_failures: self.current_partial_cas_failures.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_fast_acquire: self.lock_fast_acquire.load(Ordering::Relaxed),
            lock_contended: self.lock_contended.load(Ordering::Relaxed),
            empty_slab_recycled: self.empty_slab_recycled.load(Ordering::Relaxed),
            empty_slab_overflowed: self.empty_slab_overflowed.load(Ordering::Relaxed),
            madvise_calls: self.madvise_calls.load(Ordering::Relaxed),
            madvise_bytes: self.madvise_bytes.load(Ordering::Relaxed),
            madvise_failures: self.madvise_failures.load(Ordering::Relaxed),
            zombie_repair_count: self.zombie_repair_count.load(Ordering::Relaxed),
            cache_hit_rate: cache_hit_rate(
                self.new_slab_count.load(Ordering::Relaxed),
                self.slow_path_hits.load(Ordering::Relaxed),
            ),
        }
    }
}

fn cache_hit_rate(new_slab_count: u64, slow_path_hits: u64) -> f64 {
    if slow_path_hits == 0 {
        return 1.0;
    }
    1.0 - (new_slab_count as f64 / slow_path_hits as f64)
}

/// Point-in-time snapshot of one size class's counters, as returned by
/// `stats_class`. `cache_hit_rate` is `1 - (new_slab_count / slow_path_hits)`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClassStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub slow_path_hits: u64,
    pub slow_path_cache_miss: u64,
    pub slow_path_epoch_closed: u64,
    pub new_slab_count: u64,
    pub bitmap_alloc_attempts: u64,
    pub bitmap_alloc_cas_retries: u64,
    pub bitmap_free_cas_retries: u64,
    pub current_partial_cas_attempts: u64,
    pub current_partial_cas_failures: u64,
    pub lock_acquisitions: u64,
    pub lock_fast_acquire: u64,
    pub lock_contended: u64,
    pub empty_slab_recycled: u64,
    pub empty_slab_overflowed: u64,
    pub madvise_calls: u64,
    pub madvise_bytes: u64,
    pub madvise_failures: u64,
    pub zombie_repair_count: u64,
    pub cache_hit_rate: f64,
}

/// Point-in-time snapshot of one (class, epoch) pairing's bookkeeping, as
/// returned by `stats_epoch`. Distinct from `ClassStats`: this is scoped to
/// a single epoch incarnation rather than the class's whole lifetime.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EpochStats {
    pub epoch_id: u32,
    pub era: u64,
    pub open_since_ns: u64,
    pub domain_refcount: usize,
    pub label: Option<String>,
    pub rss_before_close: u64,
    pub rss_after_close: u64,
    pub reclaimable_slab_count: u64,
}

/// Aggregate snapshot across every size class, as returned by
/// `stats_global`.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalStats {
    pub classes: Vec<ClassStats>,
    pub total_alloc_count: u64,
    pub total_free_count: u64,
    pub total_new_slab_count: u64,
    pub total_zombie_repair_count: u64,
}

impl GlobalStats {
    pub(crate) fn from_classes<'a>(classes: impl IntoIterator<Item = &'a ClassStatsInner>) -> Self {
        let snapshots: Vec<ClassStats> = classes.into_iter().map(ClassStatsInner::snapshot).collect();
        let total_alloc_count = snapshots.iter().map(|c| c.alloc_count).sum();
        let total_free_count = snapshots.iter().map(|c| c.free_count).sum();
        let total_new_slab_count = snapshots.iter().map(|c| c.new_slab_count).sum();
        let total_zombie_repair_count = snapshots.iter().map(|c| c.zombie_repair_count).sum();
        Self {
            classes: snapshots,
            total_alloc_count,
            total_free_count,
            total_new_slab_count,
            total_zombie_repair_count,
        }
    }
}

pub(crate) fn class_snapshot(inner: &ClassStatsInner) -> ClassStats {
    inner.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_rate_is_one_with_no_slow_path_hits() {
        assert_eq!(cache_hit_rate(0, 0), 1.0);
    }

    #[test]
    fn cache_hit_rate_reflects_new_slab_ratio() {
        assert!((cache_hit_rate(3, 100) - 0.97).abs() < 1e-9);
    }

    #[test]
    fn class_stats_snapshot_reads_current_counters() {
        let inner = ClassStatsInner::new();
        inner.alloc_count.fetch_add(5, Ordering::Relaxed);
        inner.new_slab_count.fetch_add(1, Ordering::Relaxed);
        inner.slow_path_hits.fetch_add(2, Ordering::Relaxed);
        let snap = inner.snapshot();
        assert_eq!(snap.alloc_count, 5);
        assert_eq!(snap.new_slab_count, 1);
        assert!((snap.cache_hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn global_stats_aggregates_classes() {
        let a = ClassStatsInner::new();
        let b = ClassStatsInner::new();
        a.alloc_count.fetch_add(3, Ordering::Relaxed);
        b.alloc_count.fetch_add(4, Ordering::Relaxed);
        let g = GlobalStats::from_classes([&a, &b]);
        assert_eq!(g.total_alloc_count, 7);
        assert_eq!(g.classes.len(), 2);
    }
}
