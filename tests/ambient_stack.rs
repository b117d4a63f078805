//! Ambient-stack coverage: error message stability and (under the `serde`
//! feature) snapshot round-tripping. Config validation itself is covered by
//! unit tests alongside `Config` in `src/config.rs`.

use epochslab::{AllocError, ConfigError};

#[test]
fn alloc_error_messages_are_stable() {
    assert_eq!(
        AllocError::RequestTooLarge.to_string(),
        "requested size exceeds the largest size class"
    );
    assert_eq!(AllocError::EpochClosed.to_string(), "epoch is closed or closing");
    assert_eq!(AllocError::OutOfMemory.to_string(), "out of memory");
    assert_eq!(
        AllocError::InvalidHandle.to_string(),
        "handle does not refer to a known slot"
    );
    assert_eq!(
        AllocError::StaleHandle.to_string(),
        "handle refers to a recycled slab incarnation"
    );
}

#[test]
fn config_error_messages_are_stable() {
    assert_eq!(
        ConfigError::SlabPageBytesNotPowerOfTwo(100).to_string(),
        "slab_page_bytes (100) is not a power of two"
    );
    assert_eq!(
        ConfigError::ZeroEpochRingSize.to_string(),
        "epoch_ring_size must be nonzero"
    );
    assert_eq!(
        ConfigError::ZeroCacheCapacity(4).to_string(),
        "cache_capacity for class 4 must be nonzero"
    );
}

#[cfg(feature = "serde")]
#[test]
fn global_stats_round_trips_through_json() {
    use epochslab::{Allocator, Config};

    let alloc = Allocator::create(Config::default()).unwrap();
    let epoch = alloc.epoch_current();
    let (_, handle) = alloc.alloc_obj(128, epoch).unwrap();
    alloc.free_obj(handle).unwrap();

    let snapshot = alloc.stats_global();
    let encoded = serde_json::to_string(&snapshot).unwrap();
    let decoded: epochslab::GlobalStats = serde_json::from_str(&encoded).unwrap();
    assert_eq!(snapshot, decoded);
}

#[cfg(feature = "serde")]
#[test]
fn config_round_trips_through_json() {
    use epochslab::Config;

    let config = Config::default();
    let encoded = serde_json::to_string(&config).unwrap();
    let decoded: Config = serde_json::from_str(&encoded).unwrap();
    assert_eq!(config, decoded);
}
