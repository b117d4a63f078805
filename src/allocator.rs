//! The allocator root: owns the size-class registry, the epoch ring, one
//! `ClassArena` per size class, and the handle registry, and exposes the
//! public `alloc_obj`/`free_obj`/epoch/stats surface.
//!
//! `Allocator` is an ordinary owned value rather than a process-wide
//! singleton: there is no `GlobalAlloc` front end, and every root here is a
//! caller-created, caller-torn-down resource — callers may instantiate
//! multiple roots, e.g. one per test.

use std::sync::atomic::Ordering;

use tracing::{info, instrument};

use crate::arena::ClassArena;
use crate::config::Config;
use crate::epoch::{CloseReport, Domain, EpochTable};
use crate::error::{AllocError, ConfigError};
use crate::handle::{Handle, HandleRegistry};
use crate::size_class::{NUM_SIZE_CLASSES, SizeClassRegistry};
use crate::slab::Slab;
use crate::stats::{ClassStats, EpochStats, GlobalStats};

/// The allocator root. A scoped resource: `create` maps no pages; `Drop`
/// unmaps every slab this instance ever mapped and invalidates all
/// outstanding handles, on every exit path (including an early return or a
/// panic-driven unwind out of a caller's critical section).
pub struct Allocator {
    registry: SizeClassRegistry,
    epochs: EpochTable,
    arenas: Vec<ClassArena>,
    handles: HandleRegistry,
    slab_page_bytes: usize,
}

/// A handle capacity heuristic: enough buckets for every class's cache
/// capacity plus a generous live-slab margin, rounded up to a power of two
/// by `HandleRegistry::new`. `Config` has no direct "max live slabs" knob,
/// so this is derived from the knobs that do exist.
fn handle_capacity_hint(config: &Config) -> usize {
    let cache_total: usize = config.cache_capacity.iter().sum();
    (cache_total + config.epoch_ring_size * NUM_SIZE_CLASSES * 64).max(4096)
}

impl Allocator {
    /// Validate `config` and construct a fresh allocator. Opens epoch 0 as
    /// the initial ACTIVE epoch, so `epoch_current` returns a usable id
    /// immediately without requiring the caller to call `epoch_advance`
    /// first. No page is mapped until the first `alloc_obj`.
    #[instrument(skip(config))]
    pub fn create(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = SizeClassRegistry::new(config.slab_page_bytes);
        let epochs = EpochTable::new(config.epoch_ring_size);
        let handles = HandleRegistry::new(handle_capacity_hint(&config));

        let mut arenas = Vec::with_capacity(NUM_SIZE_CLASSES);
        for class in 0..NUM_SIZE_CLASSES {
            arenas.push(ClassArena::new(
                class,
                *registry.info(class),
                config.epoch_ring_size,
                config.cache_capacity[class],
                config.overflow_drain_high_watermark,
                config.adaptive_scan_enabled,
                config.slab_page_bytes,
            ));
        }

        let alloc = Self {
            registry,
            epochs,
            arenas,
            handles,
            slab_page_bytes: config.slab_page_bytes,
        };
        let epoch0 = alloc.epochs.advance();
        debug_assert_eq!(epoch0, 0, "first epoch_advance on a fresh ring must yield slot 0");
        info!(slab_page_bytes = config.slab_page_bytes, "allocator created");
        Ok(alloc)
    }

    /// The domain/epoch currently ACTIVE (the most recent `epoch_advance`).
    #[inline]
    pub fn epoch_current(&self) -> u32 {
        self.epochs.current_epoch()
    }

    /// FREE -> ACTIVE on the next ring slot; resets that slot's per-class
    /// arena state (current_partial, scan mode, retry EWMA). Idempotent at
    /// domain granularity: repeated calls while the prior epoch is still
    /// open each still open a fresh epoch, matching `epoch_advance`'s
    /// "idempotent at domain granularity" contract — the domain mechanism,
    /// not this call, is what collapses nested entries onto one epoch.
    pub fn epoch_advance(&self) -> u32 {
        let epoch_id = self.epochs.advance();
        let ring_slot = self.epochs.ring_slot(epoch_id);
        for arena in &self.arenas {
            arena.reset_slot(ring_slot);
        }
        epoch_id
    }

    pub fn epoch_domain_enter(&self, label: &str) -> Domain {
        self.epochs.domain_enter(label)
    }

    pub fn epoch_domain_exit(&self, domain: Domain) {
        self.epochs.domain_exit(domain);
    }

    /// Transition an epoch to CLOSING (installing a null sentinel into
    /// every class's `current_partial` for it so new allocations fall to
    /// the slow path and are rejected), block until drained, then run the
    /// reclamation sweep across every size class. Idempotent: a second call
    /// on an already-CLOSING/CLOSED/FREE epoch returns immediately with
    /// `performed: false` and no RSS figures.
    #[instrument(skip(self))]
    pub fn epoch_close(&self, epoch_id: u32) -> CloseReport {
        if !self.epochs.claim_close(epoch_id) {
            // Either this epoch is CLOSED/FREE already, or another caller
            // (possibly racing on the same `epoch_close`, possibly a
            // `domain_exit` that drove refcount to zero first) already
            // claimed responsibility for draining and sweeping it.
            return CloseReport {
                rss_before_close: 0,
                rss_after_close: 0,
                performed: false,
            };
        }

        let ring_slot = self.epochs.ring_slot(epoch_id);
        // Block new fast-path allocations against this epoch immediately;
        // slow-path callers still racing in will observe CLOSING on their
        // next `alloc_obj` and get `EpochClosed`.
        for arena in &self.arenas {
            arena.reset_current_partial(ring_slot);
        }

        self.epochs.wait_drained(epoch_id);

        let rss_before: u64 = self
            .arenas
            .iter()
            .map(|a| a.mapped_slab_count(ring_slot) * self.slab_page_bytes as u64)
            .sum();

        for arena in &self.arenas {
            let _reclaimed = arena.sweep_epoch(ring_slot, self.slab_page_bytes);
        }

        let rss_after: u64 = self
            .arenas
            .iter()
            .map(|a| a.mapped_slab_count(ring_slot) * self.slab_page_bytes as u64)
            .sum();

        self.epochs.finish_close(epoch_id, rss_before, rss_after);

        CloseReport {
            rss_before_close: rss_before,
            rss_after_close: rss_after,
            performed: true,
        }
    }

    /// Allocate one object of `size` bytes against `epoch_id`.
    pub fn alloc_obj(&self, size: usize, epoch_id: u32) -> Result<(*mut u8, Handle), AllocError> {
        let class = self
            .registry
            .size_to_class(size)
            .ok_or(AllocError::RequestTooLarge)?;

        // Reserve against `outstanding` before checking ACTIVE, not after:
        // if the check ran first, a concurrent `epoch_close` could observe
        // `outstanding == 0` and start sweeping in the window between this
        // thread's check and its increment. Reserving first means
        // `wait_drained` always either sees the reservation or sees this
        // call has already rolled it back.
        let record = self.epochs.record(epoch_id);
        record.note_alloc();
        if !record.is_active() {
            record.note_free();
            self.arenas[class]
                .stats
                .slow_path_epoch_closed
                .fetch_add(1, Ordering::Relaxed);
            return Err(AllocError::EpochClosed);
        }

        let ring_slot = self.epochs.ring_slot(epoch_id);
        let arena = &self.arenas[class];
        match arena.alloc(ring_slot, epoch_id, &self.handles, self.slab_page_bytes) {
            Ok(claimed) => {
                let slab = unsafe { &*(claimed.slab_addr as *const Slab) };
                let ptr = slab.slot_ptr(self.registry.info(class), claimed.slot as usize);
                let handle = Handle {
                    slab_addr: claimed.slab_addr,
                    slot: claimed.slot,
                    generation: claimed.generation,
                };
                Ok((ptr, handle))
            }
            Err(e) => {
                // This allocation never produced a handle; undo the
                // in-flight bump so `epoch_close` doesn't wait on it.
                record.note_free();
                Err(e)
            }
        }
    }

    /// Release a previously allocated object.
    pub fn free_obj(&self, handle: Handle) -> Result<(), AllocError> {
        let class = self
            .handles
            .class_of(handle.slab_addr)
            .ok_or(AllocError::InvalidHandle)?;
        let slab = unsafe { &*(handle.slab_addr as *const Slab) };
        if slab.generation() != handle.generation {
            return Err(AllocError::StaleHandle);
        }

        let epoch_id = slab.epoch_id();
        let ring_slot = self.epochs.ring_slot(epoch_id);
        let arena = &self.arenas[class];
        match arena.free(ring_slot, slab, handle.slot) {
            Ok(_) => {
                self.epochs.record(epoch_id).note_free();
                Ok(())
            }
            // The bit was already set: a double free under the current
            // generation. No taxonomy entry covers this distinctly from a
            // handle that no longer names a live slot, so it surfaces the
            // same way: `InvalidHandle`, never a memory access.
            Err(()) => Err(AllocError::InvalidHandle),
        }
    }

    pub fn stats_global(&self) -> GlobalStats {
        GlobalStats::from_classes(self.arenas.iter().map(|a| &a.stats))
    }

    pub fn stats_class(&self, class: usize) -> Option<ClassStats> {
        self.arenas.get(class).map(|a| crate::stats::class_snapshot(&a.stats))
    }

    pub fn stats_epoch(&self, class: usize, epoch_id: u32) -> Option<EpochStats> {
        let arena = self.arenas.get(class)?;
        let record = self.epochs.record(epoch_id);
        let ring_slot = self.epochs.ring_slot(epoch_id);
        let (rss_before_close, rss_after_close) = self.epochs.rss_report(epoch_id);
        Some(EpochStats {
            epoch_id,
            era: record.era(),
            open_since_ns: record.open_since_ns(),
            domain_refcount: record.domain_refcount(),
            label: record.label(),
            rss_before_close,
            rss_after_close,
            reclaimable_slab_count: arena.reclaimable_count(ring_slot),
        })
    }
}
