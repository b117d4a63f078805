//! Opaque allocation handles and the registry that validates them.
//!
//! A [`Handle`] is the only legal token `free_obj` accepts. It carries the
//! slab address, slot index, and the generation observed at allocation
//! time — but `free_obj` never trusts a handle's slab address blindly: a
//! forged or stale pointer must not be dereferenced. [`HandleRegistry`] is
//! a lock-free, open-addressed table mapping known slab addresses to their
//! size class, populated as slabs are mapped and consulted before any
//! dereference, so a handle that doesn't name a slab this allocator ever
//! mapped is rejected as `InvalidHandle` without touching memory.
//!
//! The registry's capacity is fixed at `Allocator::create` time (derived
//! from `Config`) and never resized — resizing would require blocking
//! concurrent callers, which the allocator's resource-scoping rules forbid
//! outside of creation and teardown.

use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque, caller-held allocation token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    pub(crate) slab_addr: usize,
    pub(crate) slot: u32,
    pub(crate) generation: u64,
}

const PRESENT_BIT: u64 = 1 << 63;
const CLASS_BITS: u64 = 0xFF;

/// Lock-free open-addressed map from slab base address to size class index.
pub struct HandleRegistry {
    buckets: Vec<AtomicU64>,
    mask: usize,
}

impl HandleRegistry {
    /// `capacity_hint` is rounded up to the next power of two (minimum 4096).
    pub fn new(capacity_hint: usize) -> Self {
        let cap = capacity_hint.max(4096).next_power_of_two();
        let mut buckets = Vec::with_capacity(cap);
        for _ in 0..cap {
            buckets.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            mask: cap - 1,
        }
    }

    fn hash(addr: usize) -> usize {
        // Slab addresses are page-aligned; fold out the always-zero low
        // bits before mixing so the table doesn't cluster in a handful of
        // buckets.
        let x = (addr >> 12) as u64;
        let x = x ^ (x >> 33);
        let x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
        let x = x ^ (x >> 33);
        x as usize
    }

    /// Register a freshly mapped slab's address and class. Idempotent: a
    /// second registration of the same address is a harmless no-op.
    ///
    /// Returns `false` if the table is full (capacity was chosen too small
    /// for the workload) — the caller should treat this as `OutOfMemory`
    /// rather than leaving the slab unregistered.
    pub fn insert(&self, addr: usize, class: usize) -> bool {
        debug_assert_eq!(addr & (CLASS_BITS as usize), 0, "slab addr must be page-aligned");
        let packed = PRESENT_BIT | ((addr as u64) & !CLASS_BITS) | (class as u64 & CLASS_BITS);
        let start = Self::hash(addr) & self.mask;
        for probe in 0..self.buckets.len() {
            let i = (start + probe) & self.mask;
            let bucket = &self.buckets[i];
            let cur = bucket.load(Ordering::Relaxed);
            if cur == 0 {
                match bucket.compare_exchange(0, packed, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => return true,
                    Err(actual) => {
                        if Self::addr_of(actual) == addr {
                            return true;
                        }
                        continue;
                    }
                }
            }
            if Self::addr_of(cur) == addr {
                return true;
            }
        }
        false
    }

    /// Remove a slab's address from the registry (teardown only).
    pub fn remove(&self, addr: usize) {
        let start = Self::hash(addr) & self.mask;
        for probe in 0..self.buckets.len() {
            let i = (start + probe) & self.mask;
            let bucket = &self.buckets[i];
            let cur = bucket.load(Ordering::Relaxed);
            if cur == 0 {
                return;
            }
            if Self::addr_of(cur) == addr {
                bucket.store(0, Ordering::Release);
                return;
            }
        }
    }

    /// Look up the size class registered for `addr`.
    pub fn class_of(&self, addr: usize) -> Option<usize> {
        let start = Self::hash(addr) & self.mask;
        for probe in 0..self.buckets.len() {
            let i = (start + probe) & self.mask;
            let cur = self.buckets[i].load(Ordering::Acquire);
            if cur == 0 {
                return None;
            }
            if Self::addr_of(cur) == addr {
                return Some((cur & CLASS_BITS) as usize);
            }
        }
        None
    }

    #[inline]
    fn addr_of(packed: u64) -> usize {
        (packed & !PRESENT_BIT & !CLASS_BITS) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let reg = HandleRegistry::new(64);
        assert!(reg.insert(0x1000, 3));
        assert_eq!(reg.class_of(0x1000), Some(3));
        assert_eq!(reg.class_of(0x2000), None);
    }

    #[test]
    fn reinsert_same_address_is_idempotent() {
        let reg = HandleRegistry::new(64);
        assert!(reg.insert(0x4000, 2));
        assert!(reg.insert(0x4000, 2));
        assert_eq!(reg.class_of(0x4000), Some(2));
    }

    #[test]
    fn remove_then_lookup_misses() {
        let reg = HandleRegistry::new(64);
        reg.insert(0x8000, 1);
        reg.remove(0x8000);
        assert_eq!(reg.class_of(0x8000), None);
    }

    #[test]
    fn many_distinct_addresses_all_resolve() {
        let reg = HandleRegistry::new(256);
        let addrs: Vec<usize> = (0..200).map(|i| 0x1_0000_0000 + i * 4096).collect();
        for (i, &a) in addrs.iter().enumerate() {
            assert!(reg.insert(a, i % 8));
        }
        for (i, &a) in addrs.iter().enumerate() {
            assert_eq!(reg.class_of(a), Some(i % 8));
        }
    }
}
