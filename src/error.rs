//! Error types for the allocator's public surface.
//!
//! Every fallible operation reachable from caller input returns a typed
//! `Result` instead of panicking. `ZombieRepaired` is deliberately absent
//! from [`AllocError`]: it is an internal counter event, never surfaced —
//! see `stats::ClassStats::zombie_repair_count`.

use thiserror::Error;

/// Failure modes for `alloc_obj`, `free_obj`, and the epoch operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Requested size exceeds the largest size class (768 bytes).
    #[error("requested size exceeds the largest size class")]
    RequestTooLarge,

    /// The epoch targeted by this allocation is not ACTIVE.
    #[error("epoch is closed or closing")]
    EpochClosed,

    /// `map_page` failed to obtain memory from the OS.
    #[error("out of memory")]
    OutOfMemory,

    /// The handle does not decode to any slab/slot this allocator owns.
    #[error("handle does not refer to a known slot")]
    InvalidHandle,

    /// The handle's generation does not match the slab's current generation.
    #[error("handle refers to a recycled slab incarnation")]
    StaleHandle,
}

/// Failure modes for `Config::validate` / `Allocator::create`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `slab_page_bytes` must be a power of two.
    #[error("slab_page_bytes ({0}) is not a power of two")]
    SlabPageBytesNotPowerOfTwo(usize),

    /// `epoch_ring_size` must be nonzero.
    #[error("epoch_ring_size must be nonzero")]
    ZeroEpochRingSize,

    /// A per-class `cache_capacity` entry was zero.
    #[error("cache_capacity for class {0} must be nonzero")]
    ZeroCacheCapacity(usize),

    /// `slab_page_bytes` is a power of two but too small to hold the slab
    /// header plus one slot of the largest size class.
    #[error("slab_page_bytes ({slab_page_bytes}) is too small to hold a slab header and one slot (minimum {min})")]
    SlabPageBytesTooSmall { slab_page_bytes: usize, min: usize },
}
