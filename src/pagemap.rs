//! The pagemap: any address to the slab kind at its superslab-aligned base.
//!
//! Entries are one byte per superslab-sized granule of the 48-bit address
//! space. Two variants exist: a flat array whose 16MB reservation relies on
//! the OS demand-paging untouched pages for free, and a three-level tree
//! whose interior nodes are installed lazily behind per-slot lock words.
//! The flat variant is the default on 64-bit targets.
//!
//! Entry values: 0 unmanaged, 1 superslab, 2 medium slab, `b` in
//! `[SUPERSLAB_BITS, 64)` the head of a large region of size `2^b`, and
//! `64 + k` an interior granule whose head is found by repeatedly stepping
//! back `2^k` granules (the offset's lowest set bit), converging in at most
//! log2(region) steps.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::config::*;
use crate::pal::Pal;

/// Pagemap entry values for non-large slabs.
pub mod kind {
    /// Address not managed by this allocator.
    pub const NOT_OURS: u8 = 0;
    /// A superslab (small-object slabs) starts at this granule.
    pub const SUPERSLAB: u8 = 1;
    /// A medium slab starts at this granule.
    pub const MEDIUM: u8 = 2;
}

/// First entry value describing the interior of a large region.
pub const LARGE_INTERIOR_BASE: u8 = 64;

const ENTRY_COUNT: usize = 1 << (ADDRESS_BITS - SUPERSLAB_BITS);
const ADDRESS_MASK: usize = (1 << ADDRESS_BITS) - 1;

#[inline]
fn index_of(addr: usize) -> usize {
    (addr & ADDRESS_MASK) >> SUPERSLAB_BITS
}

/// Current pagemap ABI version.
pub const PAGEMAP_VERSION: u32 = 1;

/// Format descriptor exchanged when two binaries share a pagemap. Consumers
/// must refuse a pagemap whose config differs from their own build.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PagemapConfig {
    /// ABI version, currently 1.
    pub version: u32,
    /// Flat array or lazy tree.
    pub is_flat: bool,
    /// Pointer width of the producing binary.
    pub sizeof_pointer: u8,
    /// log2 of the bytes covered by one entry.
    pub granularity_bits: u64,
    /// Size of one entry in bytes.
    pub entry_size: usize,
}

/// Storage backing the pagemap.
pub trait PagemapStore {
    /// The entry covering `addr`.
    fn get(&self, addr: usize) -> u8;
    /// Stores the entry covering `addr`.
    fn set(&self, addr: usize, value: u8);
    /// Stores `count` consecutive entries starting at the granule of `addr`.
    fn set_range(&self, addr: usize, value: u8, count: usize) {
        let mut a = addr;
        let mut n = count;
        while n > 0 {
            self.set(a, value);
            a += SUPERSLAB_SIZE;
            n -= 1;
        }
    }
    /// Format of this store.
    fn config(&self) -> PagemapConfig;
}

/// Flat pagemap: one fully reserved array, populated by the OS on first
/// touch. 2^24 one-byte entries for a 48-bit address space.
pub struct FlatPagemap {
    base: AtomicPtr<AtomicU8>,
}

impl FlatPagemap {
    /// An uninitialized map; [`FlatPagemap::init`] must run before use.
    pub const fn new() -> Self {
        Self { base: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Reserves and commits the backing array.
    pub fn init<P: Pal>(&self) {
        let (p, _len) = match P::reserve_at_least(ENTRY_COUNT) {
            Some(r) => r,
            None => P::error("out of address space reserving the pagemap"),
        };
        unsafe { P::notify_using(p.as_ptr(), ENTRY_COUNT, false) };
        self.base.store(p.as_ptr().cast::<AtomicU8>(), Ordering::Release);
    }

    #[inline]
    fn entries(&self) -> *mut AtomicU8 {
        let p = self.base.load(Ordering::Acquire);
        debug_assert!(!p.is_null(), "pagemap used before init");
        p
    }
}

impl Default for FlatPagemap {
    fn default() -> Self {
        Self::new()
    }
}

impl PagemapStore for FlatPagemap {
    #[inline]
    fn get(&self, addr: usize) -> u8 {
        unsafe { (*self.entries().add(index_of(addr))).load(Ordering::Relaxed) }
    }

    #[inline]
    fn set(&self, addr: usize, value: u8) {
        unsafe { (*self.entries().add(index_of(addr))).store(value, Ordering::Relaxed) }
    }

    fn config(&self) -> PagemapConfig {
        PagemapConfig {
            version: PAGEMAP_VERSION,
            is_flat: true,
            sizeof_pointer: mem::size_of::<usize>() as u8,
            granularity_bits: SUPERSLAB_BITS as u64,
            entry_size: 1,
        }
    }
}

// Tree layout: 24 index bits split into 3 (root, inline) + 9 (middle) + 12
// (leaf); middle nodes are 512 pointers, leaves 4096 entries, both one page.
const LEAF_BITS: usize = PAGE_BITS;
const MID_BITS: usize = PAGE_BITS - 3;
const ROOT_BITS: usize = ADDRESS_BITS - SUPERSLAB_BITS - MID_BITS - LEAF_BITS;

const LEAF_ENTRIES: usize = 1 << LEAF_BITS;
const MID_ENTRIES: usize = 1 << MID_BITS;
const ROOT_ENTRIES: usize = 1 << ROOT_BITS;

// Slot states for lazy installation: empty, being installed, or a node
// pointer.
const SLOT_EMPTY: usize = 0;
const SLOT_LOCKED: usize = 1;

type MidNode = [AtomicUsize; MID_ENTRIES];
type LeafNode = [AtomicU8; LEAF_ENTRIES];

/// Tree pagemap for platforms where a flat reservation is not free.
/// Interior nodes are allocated on first set; lookups of absent subtrees
/// return [`kind::NOT_OURS`].
pub struct PagemapTree {
    root: [AtomicUsize; ROOT_ENTRIES],
    node_alloc: fn(usize) -> *mut u8,
}

impl PagemapTree {
    /// Creates an empty tree whose nodes come from platform `P`.
    pub const fn new<P: Pal>() -> Self {
        const EMPTY: AtomicUsize = AtomicUsize::new(SLOT_EMPTY);
        Self { root: [EMPTY; ROOT_ENTRIES], node_alloc: alloc_node::<P> }
    }

    /// Reads the slot, returning a node pointer or null if absent. Racing
    /// installers are waited out.
    #[inline]
    fn slot_get(slot: &AtomicUsize) -> usize {
        loop {
            let v = slot.load(Ordering::Acquire);
            if v != SLOT_LOCKED {
                return v;
            }
            core::hint::spin_loop();
        }
    }

    /// Reads the slot, installing a fresh zeroed node if empty. The slot
    /// cycles Empty -> Locked -> Populated; losers of the race spin.
    fn slot_get_or_install(&self, slot: &AtomicUsize, size: usize) -> usize {
        loop {
            let v = slot.load(Ordering::Acquire);
            if v == SLOT_EMPTY {
                if slot
                    .compare_exchange(SLOT_EMPTY, SLOT_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    let node = (self.node_alloc)(size);
                    slot.store(node as usize, Ordering::Release);
                    return node as usize;
                }
            } else if v != SLOT_LOCKED {
                return v;
            }
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn split(ix: usize) -> (usize, usize, usize) {
        (ix >> (MID_BITS + LEAF_BITS), (ix >> LEAF_BITS) & (MID_ENTRIES - 1), ix & (LEAF_ENTRIES - 1))
    }
}

fn alloc_node<P: Pal>(size: usize) -> *mut u8 {
    let (p, _len) = match P::reserve_at_least(size) {
        Some(r) => r,
        None => P::error("out of address space growing the pagemap"),
    };
    // Fresh commits read as zero, which is exactly the empty-node state.
    unsafe { P::notify_using(p.as_ptr(), size, !P::ZERO_ON_COMMIT) };
    p.as_ptr()
}

impl PagemapStore for PagemapTree {
    fn get(&self, addr: usize) -> u8 {
        let (r, m, l) = Self::split(index_of(addr));
        let mid = Self::slot_get(&self.root[r]);
        if mid == SLOT_EMPTY {
            return kind::NOT_OURS;
        }
        let mid = mid as *const MidNode;
        let leaf = Self::slot_get(unsafe { &(*mid)[m] });
        if leaf == SLOT_EMPTY {
            return kind::NOT_OURS;
        }
        let leaf = leaf as *const LeafNode;
        unsafe { (*leaf)[l].load(Ordering::Relaxed) }
    }

    fn set(&self, addr: usize, value: u8) {
        let (r, m, l) = Self::split(index_of(addr));
        let mid = self.slot_get_or_install(&self.root[r], mem::size_of::<MidNode>());
        let mid = mid as *const MidNode;
        let leaf =
            self.slot_get_or_install(unsafe { &(*mid)[m] }, mem::size_of::<LeafNode>());
        let leaf = leaf as *const LeafNode;
        unsafe { (*leaf)[l].store(value, Ordering::Relaxed) }
    }

    fn config(&self) -> PagemapConfig {
        PagemapConfig {
            version: PAGEMAP_VERSION,
            is_flat: false,
            sizeof_pointer: mem::size_of::<usize>() as u8,
            granularity_bits: SUPERSLAB_BITS as u64,
            entry_size: 1,
        }
    }
}

/// The variant used by the process-wide allocator.
#[cfg(target_pointer_width = "64")]
pub type DefaultPagemap = FlatPagemap;
/// The variant used by the process-wide allocator.
#[cfg(not(target_pointer_width = "64"))]
pub type DefaultPagemap = PagemapTree;

/// Marks a large region of `2^size_bits` bytes starting at `base`: the head
/// granule carries the size, interior granules the back-walk encoding.
pub fn set_large_region<PM: PagemapStore>(pm: &PM, base: usize, size_bits: usize) {
    debug_assert!(size_bits >= SUPERSLAB_BITS && size_bits < 64);
    pm.set(base, size_bits as u8);
    let granules = 1usize << (size_bits - SUPERSLAB_BITS);
    let mut k = 1;
    while k < granules {
        let code = LARGE_INTERIOR_BASE + k.trailing_zeros() as u8;
        pm.set(base + (k << SUPERSLAB_BITS), code);
        k += 1;
    }
}

/// Clears the entries of a large region.
pub fn clear_large_region<PM: PagemapStore>(pm: &PM, base: usize, size_bits: usize) {
    let granules = 1usize << (size_bits - SUPERSLAB_BITS);
    pm.set_range(base, kind::NOT_OURS, granules);
}

/// Walks from an interior granule back to the head of its large region.
/// Returns the head address and its entry (the size bits).
pub fn find_large_head<PM: PagemapStore>(pm: &PM, addr: usize) -> (usize, u8) {
    let mut a = align_down(addr, SUPERSLAB_SIZE);
    let mut e = pm.get(a);
    while e >= LARGE_INTERIOR_BASE {
        a -= 1usize << ((e - LARGE_INTERIOR_BASE) as usize + SUPERSLAB_BITS);
        e = pm.get(a);
    }
    (a, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::DefaultPal;

    fn addr(granule: usize) -> usize {
        granule << SUPERSLAB_BITS
    }

    #[test]
    fn test_flat_set_get() {
        let pm = FlatPagemap::new();
        pm.init::<DefaultPal>();

        assert_eq!(pm.get(addr(7)), kind::NOT_OURS);
        pm.set(addr(7), kind::SUPERSLAB);
        assert_eq!(pm.get(addr(7)), kind::SUPERSLAB);
        // Interior addresses of the granule resolve to the same entry.
        assert_eq!(pm.get(addr(7) + 12345), kind::SUPERSLAB);

        pm.set_range(addr(100), kind::MEDIUM, 4);
        for k in 0..4 {
            assert_eq!(pm.get(addr(100 + k)), kind::MEDIUM);
        }
        assert_eq!(pm.get(addr(104)), kind::NOT_OURS);
        assert!(pm.config().is_flat);
    }

    #[test]
    fn test_tree_set_get() {
        let pm = PagemapTree::new::<DefaultPal>();

        assert_eq!(pm.get(addr(3)), kind::NOT_OURS);
        pm.set(addr(3), kind::SUPERSLAB);
        assert_eq!(pm.get(addr(3)), kind::SUPERSLAB);

        // Cross a leaf boundary so a second subtree is installed.
        let far = addr(LEAF_ENTRIES + 5);
        assert_eq!(pm.get(far), kind::NOT_OURS);
        pm.set(far, kind::MEDIUM);
        assert_eq!(pm.get(far), kind::MEDIUM);
        assert!(!pm.config().is_flat);
    }

    #[test]
    fn test_large_region_walk() {
        let pm = FlatPagemap::new();
        pm.init::<DefaultPal>();

        // 2^27 region: 8 granules.
        let base = addr(512);
        set_large_region(&pm, base, 27);
        assert_eq!(pm.get(base), 27);
        for k in 1..8usize {
            let (head, bits) = find_large_head(&pm, base + (k << SUPERSLAB_BITS) + 99);
            assert_eq!(head, base);
            assert_eq!(bits, 27);
        }
        clear_large_region(&pm, base, 27);
        for k in 0..8usize {
            assert_eq!(pm.get(base + (k << SUPERSLAB_BITS)), kind::NOT_OURS);
        }
    }

    #[test]
    fn test_configs_match_across_variants_except_shape() {
        let flat = FlatPagemap::new();
        let tree = PagemapTree::new::<DefaultPal>();
        let (a, b) = (flat.config(), tree.config());
        assert_eq!(a.version, b.version);
        assert_eq!(a.granularity_bits, b.granularity_bits);
        assert_eq!(a.entry_size, b.entry_size);
        assert_ne!(a.is_flat, b.is_flat);
    }
}
