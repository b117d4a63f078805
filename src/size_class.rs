//! Size class table and lookup functions.
//!
//! Objects are bucketed into one of 8 fixed classes covering 64–768 bytes.
//! The table is small and fixed at compile time, but slot geometry (slots
//! per slab, bitmap word count) is resolved once at `Allocator::create` time
//! from `Config::slab_page_bytes`, since slab page size is a runtime knob
//! rather than a build-time constant.

use crate::slab::SLAB_HEADER_BYTES;

/// Number of defined size classes.
pub const NUM_SIZE_CLASSES: usize = 8;

/// The fixed slot sizes, in bytes, smallest to largest.
pub const CLASS_SIZES: [usize; NUM_SIZE_CLASSES] = [64, 96, 128, 192, 256, 384, 512, 768];

/// Largest request size a size class can satisfy.
pub const MAX_CLASS_SIZE: usize = CLASS_SIZES[NUM_SIZE_CLASSES - 1];

/// Smallest `slab_page_bytes` that can hold the header plus at least one
/// slot (and its one-word bitmap) of the largest size class. `Config`
/// rejects anything below this so `SizeClassInfo::compute` never has to
/// reason about a page that can't fit a single slot of some class.
pub const MIN_SLAB_PAGE_BYTES: usize = SLAB_HEADER_BYTES + 8 + MAX_CLASS_SIZE;

/// Per-class slot geometry, derived once from `Config::slab_page_bytes`.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes).
    pub size: usize,
    /// Number of slots carved out of one slab for this class.
    pub slots_per_slab: usize,
    /// Number of `u64` words in the trailing bitmap.
    pub bitmap_words: usize,
}

impl SizeClassInfo {
    /// Derive slot geometry for `size` given a `slab_page_bytes` slab.
    ///
    /// The slab is `SLAB_HEADER_BYTES` of header, followed by a bitmap (one
    /// bit per slot, rounded up to whole `u64` words), followed by the slot
    /// array. Slot count and bitmap size are mutually dependent, so this
    /// solves it in two passes: first ignoring the bitmap's own footprint,
    /// then shrinking until the bitmap plus slots fit.
    fn compute(size: usize, slab_page_bytes: usize) -> Self {
        // `Config::validate` rejects anything below `MIN_SLAB_PAGE_BYTES`
        // before `Allocator::create` ever reaches this call.
        debug_assert!(slab_page_bytes > SLAB_HEADER_BYTES);
        let usable = slab_page_bytes - SLAB_HEADER_BYTES;
        let mut slots = usable / size;
        loop {
            if slots == 0 {
                break;
            }
            let bitmap_words = slots.div_ceil(64);
            let bitmap_bytes = bitmap_words * 8;
            if bitmap_bytes + slots * size <= usable {
                return Self {
                    size,
                    slots_per_slab: slots,
                    bitmap_words,
                };
            }
            slots -= 1;
        }
        Self {
            size,
            slots_per_slab: 0,
            bitmap_words: 0,
        }
    }
}

/// The full set of per-class slot geometries for one allocator instance.
#[derive(Clone, Debug)]
pub struct SizeClassRegistry {
    classes: [SizeClassInfo; NUM_SIZE_CLASSES],
    slab_page_bytes: usize,
}

/// Lookup table covering sizes 0..=768 in 8-byte steps (97 entries).
const LOOKUP_LEN: usize = MAX_CLASS_SIZE / 8 + 1;

const fn build_lookup() -> [u8; LOOKUP_LEN] {
    let mut table = [0u8; LOOKUP_LEN];
    let mut i = 0;
    while i < LOOKUP_LEN {
        let size = i * 8;
        let mut cls = 0usize;
        while cls < NUM_SIZE_CLASSES {
            if CLASS_SIZES[cls] >= size {
                break;
            }
            cls += 1;
        }
        if cls >= NUM_SIZE_CLASSES {
            cls = NUM_SIZE_CLASSES - 1;
        }
        table[i] = cls as u8;
        i += 1;
    }
    table
}

static LOOKUP: [u8; LOOKUP_LEN] = build_lookup();

impl SizeClassRegistry {
    /// Build the registry for a given slab page size. Called once at
    /// `Allocator::create` time.
    pub fn new(slab_page_bytes: usize) -> Self {
        let mut classes = [SizeClassInfo {
            size: 0,
            slots_per_slab: 0,
            bitmap_words: 0,
        }; NUM_SIZE_CLASSES];
        for (cls, &size) in CLASS_SIZES.iter().enumerate() {
            classes[cls] = SizeClassInfo::compute(size, slab_page_bytes);
        }
        Self {
            classes,
            slab_page_bytes,
        }
    }

    /// Map a requested size to its class index. Branch-light: one bounds
    /// check, one table lookup. Returns `None` if `size` exceeds
    /// [`MAX_CLASS_SIZE`].
    #[inline]
    pub fn size_to_class(&self, size: usize) -> Option<usize> {
        if size > MAX_CLASS_SIZE {
            return None;
        }
        let idx = size.div_ceil(8);
        Some(LOOKUP[idx] as usize)
    }

    #[inline]
    pub fn info(&self, class: usize) -> &SizeClassInfo {
        &self.classes[class]
    }

    #[inline]
    pub fn slab_page_bytes(&self) -> usize {
        self.slab_page_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_to_class_exact_boundaries() {
        let reg = SizeClassRegistry::new(4096);
        assert_eq!(reg.size_to_class(1), Some(0));
        assert_eq!(reg.size_to_class(64), Some(0));
        assert_eq!(reg.size_to_class(65), Some(1));
        assert_eq!(reg.size_to_class(768), Some(7));
        assert_eq!(reg.size_to_class(769), None);
    }

    #[test]
    fn slots_per_slab_fit_in_page() {
        let reg = SizeClassRegistry::new(4096);
        for cls in 0..NUM_SIZE_CLASSES {
            let info = reg.info(cls);
            assert!(info.slots_per_slab > 0, "class {cls} has 0 slots");
            let bitmap_bytes = info.bitmap_words * 8;
            let total = SLAB_HEADER_BYTES + bitmap_bytes + info.slots_per_slab * info.size;
            assert!(total <= 4096, "class {cls} overflows the slab page");
        }
    }

    #[test]
    fn larger_page_yields_more_slots() {
        let small = SizeClassRegistry::new(4096);
        let large = SizeClassRegistry::new(16384);
        for cls in 0..NUM_SIZE_CLASSES {
            assert!(large.info(cls).slots_per_slab > small.info(cls).slots_per_slab);
        }
    }
}
