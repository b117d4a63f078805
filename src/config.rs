//! Runtime configuration for the allocator root.
//!
//! `Config` is an ordinary runtime value: slab page size, ring capacity, and
//! cache sizing are per-instance operational knobs, not compile-time
//! constants. `validate()` is called by `Allocator::create` before any page
//! is mapped.

use crate::error::ConfigError;
use crate::size_class::{MIN_SLAB_PAGE_BYTES, NUM_SIZE_CLASSES};

/// Default slab page size (4 KiB, matching the common OS page size).
pub const DEFAULT_SLAB_PAGE_BYTES: usize = 4096;

/// Default number of epoch ring slots.
pub const DEFAULT_EPOCH_RING_SIZE: usize = 16;

/// Default per-class empty-slab cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Default overflow-list length at which a class's overflow is drained.
pub const DEFAULT_OVERFLOW_DRAIN_HIGH_WATERMARK: usize = 64;

/// Construction-time configuration for an [`Allocator`](crate::allocator::Allocator).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Max EMPTY slabs retained per class before overflowing.
    pub cache_capacity: [usize; NUM_SIZE_CLASSES],
    /// Slab page size in bytes; must be a power of two.
    pub slab_page_bytes: usize,
    /// Number of epoch ring slots.
    pub epoch_ring_size: usize,
    /// Overflow length at which `return_pages_to_os` is invoked for a class.
    pub overflow_drain_high_watermark: usize,
    /// Toggles the sequential/randomized scan-mode switching.
    pub adaptive_scan_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: [DEFAULT_CACHE_CAPACITY; NUM_SIZE_CLASSES],
            slab_page_bytes: DEFAULT_SLAB_PAGE_BYTES,
            epoch_ring_size: DEFAULT_EPOCH_RING_SIZE,
            overflow_drain_high_watermark: DEFAULT_OVERFLOW_DRAIN_HIGH_WATERMARK,
            adaptive_scan_enabled: true,
        }
    }
}

impl Config {
    /// Validate this configuration. Called by `Allocator::create` before any
    /// page is mapped; never panics.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slab_page_bytes == 0 || !self.slab_page_bytes.is_power_of_two() {
            return Err(ConfigError::SlabPageBytesNotPowerOfTwo(self.slab_page_bytes));
        }
        if self.slab_page_bytes < MIN_SLAB_PAGE_BYTES {
            return Err(ConfigError::SlabPageBytesTooSmall {
                slab_page_bytes: self.slab_page_bytes,
                min: MIN_SLAB_PAGE_BYTES,
            });
        }
        if self.epoch_ring_size == 0 {
            return Err(ConfigError::ZeroEpochRingSize);
        }
        for (class, &cap) in self.cache_capacity.iter().enumerate() {
            if cap == 0 {
                return Err(ConfigError::ZeroCacheCapacity(class));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut cfg = Config::default();
        cfg.slab_page_bytes = 4097;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::SlabPageBytesNotPowerOfTwo(4097))
        );
    }

    #[test]
    fn rejects_zero_ring_size() {
        let mut cfg = Config::default();
        cfg.epoch_ring_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroEpochRingSize));
    }

    #[test]
    fn rejects_zero_cache_capacity() {
        let mut cfg = Config::default();
        cfg.cache_capacity[3] = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroCacheCapacity(3)));
    }

    #[test]
    fn rejects_slab_page_bytes_too_small_to_hold_a_slot() {
        let mut cfg = Config::default();
        cfg.slab_page_bytes = 32;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::SlabPageBytesTooSmall {
                slab_page_bytes: 32,
                min: crate::size_class::MIN_SLAB_PAGE_BYTES,
            })
        );
    }
}
