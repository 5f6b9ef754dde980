//! Size-class tables.
//!
//! Classes are an exponent/mantissa encoding of the allocation size:
//! `INTERMEDIATE_BITS` mantissa bits give four classes per power of two,
//! starting at the 16-byte minimum. Small classes run up to and including
//! one slab, medium classes up to (exclusive) one superslab, and everything
//! above is a power-of-two large class handled by the large-object cache.
//!
//! All tables are computed at compile time. Division by an object size is
//! done with the odd-multiplier inverse trick: `size = m << e` with
//! `m ∈ {1,3,5,7}`, so a 32-bit multiply replaces the 64-bit division on
//! the deallocation path.

use crate::config::*;
use crate::mediumslab::Mediumslab;
use crate::superslab::Superslab;

const fn to_exp_mant(value: usize, mantissa_bits: usize, low_bits: usize) -> usize {
    let leading_bit = 1usize << (mantissa_bits + low_bits - 1);
    let mantissa_mask = (1usize << mantissa_bits) - 1;

    let value = value - 1;
    let e = usize::BITS as usize
        - mantissa_bits
        - low_bits
        - ((value | leading_bit).leading_zeros() as usize);
    let b = if e == 0 { 0 } else { 1 };
    let m = (value >> (low_bits + e - b)) & mantissa_mask;

    (e << mantissa_bits) + m
}

const fn from_exp_mant(m_e: usize, mantissa_bits: usize, low_bits: usize) -> usize {
    if mantissa_bits == 0 {
        return 1usize << (m_e + low_bits);
    }
    let m_e = m_e + 1;
    let mantissa_mask = (1usize << mantissa_bits) - 1;
    let m = m_e & mantissa_mask;
    let e = m_e >> mantissa_bits;
    let b = if e == 0 { 0 } else { 1 };
    let extended_m = m + (b << mantissa_bits);
    extended_m << (e - b + low_bits)
}

/// Size to class, usable in const context. `size` must be at least 1.
pub const fn size_to_sizeclass_const(size: usize) -> usize {
    to_exp_mant(size, INTERMEDIATE_BITS, MIN_ALLOC_BITS)
}

/// Class to size, usable in const context.
pub const fn sizeclass_to_size_const(sc: usize) -> usize {
    from_exp_mant(sc, INTERMEDIATE_BITS, MIN_ALLOC_BITS)
}

/// Number of small size classes (16 bytes ..= one slab).
pub const NUM_SMALL_CLASSES: usize = size_to_sizeclass_const(SLAB_SIZE) + 1;
/// Number of small plus medium size classes.
pub const NUM_SIZECLASSES: usize = size_to_sizeclass_const(SUPERSLAB_SIZE);
/// Number of medium size classes (one slab exclusive .. one superslab exclusive).
pub const NUM_MEDIUM_CLASSES: usize = NUM_SIZECLASSES - NUM_SMALL_CLASSES;
/// Smallest medium allocation size.
pub const MIN_MEDIUM_SIZE: usize = sizeclass_to_size_const(NUM_SMALL_CLASSES);
/// Largest medium allocation size.
pub const MAX_MEDIUM_SIZE: usize = sizeclass_to_size_const(NUM_SIZECLASSES - 1);

// Inverse of an odd `d` modulo 2^32 by Newton iteration; five doublings
// cover all 32 bits.
const fn inv_mod_2_32(d: u32) -> u32 {
    let mut x = d;
    let mut i = 0;
    while i < 5 {
        x = x.wrapping_mul(2u32.wrapping_sub(d.wrapping_mul(x)));
        i += 1;
    }
    x
}

/// Per-class constants, all derived at compile time.
pub struct SizeClassTable {
    /// Allocation size of each class.
    pub size: [u32; NUM_SIZECLASSES],
    /// log2 of the natural alignment (the power-of-two factor of the size).
    pub align_bits: [u8; NUM_SIZECLASSES],
    /// Odd factor of the size: size = odd << align_bits.
    pub odd: [u8; NUM_SIZECLASSES],
    /// Multiplicative inverse of `odd` mod 2^32.
    pub mod_inv: [u32; NUM_SIZECLASSES],
    /// Largest multiple bound for the divisibility test.
    pub mod_limit: [u32; NUM_SIZECLASSES],
    /// Mask for the cache-friendly offset: multiples of the minimum
    /// allocation, bounded so a message header at the offset still fits
    /// inside the object.
    pub cache_friendly_mask: [u32; NUM_SIZECLASSES],
    /// Objects per full-size slab.
    pub capacity: [u16; NUM_SMALL_CLASSES],
    /// Objects per short slab (the one carrying the superslab header).
    pub short_capacity: [u16; NUM_SMALL_CLASSES],
    /// Start of the object region within a short slab.
    pub short_offset: [u32; NUM_SMALL_CLASSES],
    /// Objects per medium slab, indexed by `sc - NUM_SMALL_CLASSES`.
    pub medium_capacity: [u16; NUM_MEDIUM_CLASSES],
    /// Start of the object region within a medium slab.
    pub medium_offset: [u32; NUM_MEDIUM_CLASSES],
}

const fn build_table() -> SizeClassTable {
    let mut t = SizeClassTable {
        size: [0; NUM_SIZECLASSES],
        align_bits: [0; NUM_SIZECLASSES],
        odd: [0; NUM_SIZECLASSES],
        mod_inv: [0; NUM_SIZECLASSES],
        mod_limit: [0; NUM_SIZECLASSES],
        cache_friendly_mask: [0; NUM_SIZECLASSES],
        capacity: [0; NUM_SMALL_CLASSES],
        short_capacity: [0; NUM_SMALL_CLASSES],
        short_offset: [0; NUM_SMALL_CLASSES],
        medium_capacity: [0; NUM_MEDIUM_CLASSES],
        medium_offset: [0; NUM_MEDIUM_CLASSES],
    };

    let header = core::mem::size_of::<Superslab>();
    let medium_header = core::mem::size_of::<Mediumslab>();

    let mut sc = 0;
    while sc < NUM_SIZECLASSES {
        let size = sizeclass_to_size_const(sc);
        let e = size.trailing_zeros() as usize;
        let odd = (size >> e) as u32;

        t.size[sc] = size as u32;
        t.align_bits[sc] = e as u8;
        t.odd[sc] = odd as u8;
        t.mod_inv[sc] = inv_mod_2_32(odd);
        t.mod_limit[sc] = (u32::MAX / odd) as u32;

        // Offsets step by the minimum allocation and stay below the power
        // of two covered by both the object and the cache window, so the
        // two header words always land inside the object.
        let span = if size < CACHE_FRIENDLY_WINDOW { size } else { CACHE_FRIENDLY_WINDOW };
        t.cache_friendly_mask[sc] = ((1usize << pow2_bits_down(span)) - MIN_ALLOC_SIZE) as u32;

        if sc < NUM_SMALL_CLASSES {
            let offset = align_up(header, 1 << e);
            t.capacity[sc] = (SLAB_SIZE / size) as u16;
            t.short_offset[sc] = offset as u32;
            t.short_capacity[sc] = if offset >= SLAB_SIZE {
                0
            } else {
                ((SLAB_SIZE - offset) / size) as u16
            };
        } else {
            let mc = sc - NUM_SMALL_CLASSES;
            let offset = align_up(medium_header, 1 << e);
            t.medium_offset[mc] = offset as u32;
            t.medium_capacity[mc] = ((SUPERSLAB_SIZE - offset) / size) as u16;
        }

        sc += 1;
    }

    t
}

/// The size-class table.
pub static TABLE: SizeClassTable = build_table();

// Dense lookup for the small range: index is size rounded up to the
// 16-byte granule.
const SMALL_LOOKUP_LEN: usize = (SLAB_SIZE >> MIN_ALLOC_BITS) + 1;

const fn build_small_lookup() -> [u8; SMALL_LOOKUP_LEN] {
    let mut t = [0u8; SMALL_LOOKUP_LEN];
    let mut i = 1;
    while i < SMALL_LOOKUP_LEN {
        t[i] = size_to_sizeclass_const(i << MIN_ALLOC_BITS) as u8;
        i += 1;
    }
    t
}

static SMALL_LOOKUP: [u8; SMALL_LOOKUP_LEN] = build_small_lookup();

/// Maps a size to its class. Sizes up to one slab use a table lookup;
/// the tail recomputes the encoding. `size` may be 0 (class 0).
#[inline]
pub fn size_to_sizeclass(size: usize) -> usize {
    if size <= SLAB_SIZE {
        SMALL_LOOKUP[(size + MIN_ALLOC_SIZE - 1) >> MIN_ALLOC_BITS] as usize
    } else {
        size_to_sizeclass_const(size)
    }
}

/// The allocation size of a class.
#[inline]
pub fn sizeclass_to_size(sc: usize) -> usize {
    TABLE.size[sc] as usize
}

/// Natural alignment of a class (the largest power of two dividing its size).
#[inline]
pub fn sizeclass_to_alignment(sc: usize) -> usize {
    1 << TABLE.align_bits[sc]
}

/// Whether `rel` (an offset from the start of the object region) falls on an
/// object boundary of class `sc`. One multiply, no division.
#[inline]
pub fn is_start_of_object(sc: usize, rel: usize) -> bool {
    let e = TABLE.align_bits[sc] as usize;
    if rel & ((1 << e) - 1) != 0 {
        return false;
    }
    let q = (rel >> e) as u32;
    q.wrapping_mul(TABLE.mod_inv[sc]) <= TABLE.mod_limit[sc]
}

/// Object index of an offset within the object region of class `sc`.
#[inline]
pub fn index_in_class(sc: usize, rel: usize) -> usize {
    (rel >> TABLE.align_bits[sc]) / TABLE.odd[sc] as usize
}

/// Objects per slab for a small class.
#[inline]
pub fn small_capacity(sc: usize, is_short: bool) -> usize {
    if is_short {
        TABLE.short_capacity[sc] as usize
    } else {
        TABLE.capacity[sc] as usize
    }
}

/// Object-region offset within a slab for a small class.
#[inline]
pub fn small_offset(sc: usize, is_short: bool) -> usize {
    if is_short {
        TABLE.short_offset[sc] as usize
    } else {
        0
    }
}

/// Objects per medium slab.
#[inline]
pub fn medium_capacity(sc: usize) -> usize {
    TABLE.medium_capacity[sc - NUM_SMALL_CLASSES] as usize
}

/// Object-region offset within a medium slab.
#[inline]
pub fn medium_offset(sc: usize) -> usize {
    TABLE.medium_offset[sc - NUM_SMALL_CLASSES] as usize
}

/// Cache-friendly offset for an object of class `sc` at `addr`: where the
/// allocator's own words (free-list links, remote-message headers) live
/// inside the freed object. The offset is a pure function of the containing
/// slab, so every address within the object maps to the same offset and the
/// decoration reverses without extra state. Client pointers are never
/// decorated; the natural-alignment and usable-size guarantees are pinned
/// by the public contract.
#[inline]
pub fn cache_friendly_offset(addr: usize, sc: usize) -> usize {
    let slab_bits = if sc < NUM_SMALL_CLASSES { SLAB_BITS } else { SUPERSLAB_BITS };
    let h = (addr >> slab_bits).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> 16) & TABLE.cache_friendly_mask[sc] as usize
}

/// Decorates an object base with its cache-friendly offset. Applied when
/// free lists are built on the allocation path and when a remote free
/// writes its message header.
#[inline]
pub fn apply_cache_friendly_offset(p: *mut u8, sc: usize) -> *mut u8 {
    (p as usize + cache_friendly_offset(p as usize, sc)) as *mut u8
}

/// Recovers the object base from a decorated address. Reversed on the
/// local-free side: when the hot list hands an object out and when the
/// owner drains an incoming remote message.
#[inline]
pub fn remove_cache_friendly_offset(p: *mut u8, sc: usize) -> *mut u8 {
    (p as usize - cache_friendly_offset(p as usize, sc)) as *mut u8
}

/// Large class for a size (0 is one superslab). The caller bounds the size.
#[inline]
pub fn size_to_large_class(size: usize) -> usize {
    let bits = next_pow2_bits(size);
    if bits <= SUPERSLAB_BITS {
        0
    } else {
        bits - SUPERSLAB_BITS
    }
}

/// Size of a large class.
#[inline]
pub fn large_class_to_size(class: usize) -> usize {
    1 << (class + SUPERSLAB_BITS)
}

// The superslab header must leave room for objects in the short slab of
// every class except, at most, the single slab-sized class.
const _: () = {
    assert!(NUM_SIZECLASSES < 128);
    assert!(MIN_MEDIUM_SIZE > SLAB_SIZE);
    assert!(MAX_MEDIUM_SIZE < SUPERSLAB_SIZE);
    let mut mc = 0;
    while mc < NUM_MEDIUM_CLASSES {
        let size = sizeclass_to_size_const(NUM_SMALL_CLASSES + mc);
        let e = size.trailing_zeros() as usize;
        let offset = align_up(core::mem::size_of::<Mediumslab>(), 1 << e);
        assert!((SUPERSLAB_SIZE - offset) / size >= 1);
        mc += 1;
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_laws() {
        for sc in 0..NUM_SIZECLASSES {
            let size = sizeclass_to_size(sc);
            assert_eq!(size_to_sizeclass(size), sc, "class_of(size_of({sc}))");
        }
        for size in 1..=4096usize {
            let sc = size_to_sizeclass(size);
            assert!(sizeclass_to_size(sc) >= size, "size_of(class_of({size}))");
        }
    }

    #[test]
    fn test_known_classes() {
        assert_eq!(sizeclass_to_size(0), 16);
        assert_eq!(sizeclass_to_size(1), 32);
        assert_eq!(sizeclass_to_size(2), 48);
        assert_eq!(sizeclass_to_size(3), 64);
        assert_eq!(sizeclass_to_size(4), 80);
        assert_eq!(size_to_sizeclass(0), 0);
        assert_eq!(size_to_sizeclass(1), 0);
        assert_eq!(size_to_sizeclass(17), 1);
        assert_eq!(size_to_sizeclass(SLAB_SIZE), NUM_SMALL_CLASSES - 1);
        assert_eq!(size_to_sizeclass(SLAB_SIZE + 1), NUM_SMALL_CLASSES);
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(sizeclass_to_size(NUM_SMALL_CLASSES - 1), SLAB_SIZE);
        assert_eq!(sizeclass_to_size(NUM_SMALL_CLASSES), MIN_MEDIUM_SIZE);
        assert!(MAX_MEDIUM_SIZE < SUPERSLAB_SIZE);
        assert_eq!(size_to_large_class(SUPERSLAB_SIZE), 0);
        assert_eq!(size_to_large_class(SUPERSLAB_SIZE + 1), 1);
        assert_eq!(size_to_large_class(2 * SUPERSLAB_SIZE), 1);
    }

    #[test]
    fn test_divisibility_matches_modulo() {
        for sc in 0..NUM_SIZECLASSES {
            let size = sizeclass_to_size(sc);
            for k in 0..16usize {
                assert!(is_start_of_object(sc, k * size), "sc={sc} k={k}");
                assert!(!is_start_of_object(sc, k * size + 1), "sc={sc} k={k}");
                assert!(!is_start_of_object(sc, k * size + size / 2 + 1), "sc={sc} k={k}");
            }
        }
    }

    #[test]
    fn test_index_in_class() {
        for sc in (0..NUM_SIZECLASSES).step_by(7) {
            let size = sizeclass_to_size(sc);
            for k in [0usize, 1, 2, 9] {
                assert_eq!(index_in_class(sc, k * size), k);
                assert_eq!(index_in_class(sc, k * size + size - 1), k);
            }
        }
    }

    #[test]
    fn test_cache_friendly_offsets_reverse() {
        for sc in 0..NUM_SIZECLASSES {
            let size = sizeclass_to_size(sc);
            let mask = TABLE.cache_friendly_mask[sc] as usize;
            assert_eq!(mask % MIN_ALLOC_SIZE, 0, "sc={sc}");
            // A header at the largest offset still fits in the object.
            assert!(mask + MIN_ALLOC_SIZE <= size, "sc={sc}");

            let slab = if sc < NUM_SMALL_CLASSES {
                1usize << SLAB_BITS
            } else {
                1usize << SUPERSLAB_BITS
            };
            // Second object of slab 7, when the slab holds more than one.
            let second = 7 * slab + if size < slab { size } else { 0 };
            for base in [7 * slab, second, 9 * slab] {
                let off = cache_friendly_offset(base, sc);
                assert!(off <= mask, "sc={sc}");
                assert_eq!(off % MIN_ALLOC_SIZE, 0, "sc={sc}");
                let d = apply_cache_friendly_offset(base as *mut u8, sc);
                assert_eq!(remove_cache_friendly_offset(d, sc), base as *mut u8);
            }
            // All objects of one slab share the offset; that is what makes
            // the decoration reversible.
            assert_eq!(
                cache_friendly_offset(7 * slab, sc),
                cache_friendly_offset(second, sc)
            );
        }
    }

    #[test]
    fn test_cache_friendly_offsets_vary_across_slabs() {
        // Some pair of slabs must stagger for every class wide enough to
        // have a window at all.
        for sc in 0..NUM_SIZECLASSES {
            if TABLE.cache_friendly_mask[sc] == 0 {
                continue;
            }
            let slab = if sc < NUM_SMALL_CLASSES {
                1usize << SLAB_BITS
            } else {
                1usize << SUPERSLAB_BITS
            };
            let varied = (0..64).any(|k| {
                cache_friendly_offset(k * slab, sc) != cache_friendly_offset((k + 1) * slab, sc)
            });
            assert!(varied, "sc={sc} never staggers");
        }
    }

    #[test]
    fn test_capacities_consistent() {
        for sc in 0..NUM_SMALL_CLASSES {
            let size = sizeclass_to_size(sc);
            assert!(small_capacity(sc, false) * size <= SLAB_SIZE);
            let short = small_capacity(sc, true);
            assert!(small_offset(sc, true) + short * size <= SLAB_SIZE);
            // Only the slab-sized class may be unable to use the short slab.
            if short == 0 {
                assert_eq!(size, SLAB_SIZE);
            }
        }
        for sc in NUM_SMALL_CLASSES..NUM_SIZECLASSES {
            let size = sizeclass_to_size(sc);
            let cap = medium_capacity(sc);
            assert!(cap >= 1);
            assert!(medium_offset(sc) + cap * size <= SUPERSLAB_SIZE);
        }
    }
}
