//! Superslab headers.
//!
//! A superslab is a 16MB naturally-aligned region of 256 slabs. The header
//! lives at the start of the first ("short") slab: the owner pointer, the
//! per-slab metadata array and the free-slab chain. The short slab itself is
//! usable for objects, with capacity reduced by the header.
//!
//! The header address is recovered from any interior pointer by masking:
//! the region is aligned to its size. The owner field is read by other
//! threads (remote-free routing); everything else is touched only by the
//! owning allocator.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::config::*;
use crate::dllist::{DlNode, Linked};
use crate::queue::RemoteAllocator;
use crate::slabmeta::{Metaslab, NO_SLAB};

/// Lifecycle of a superslab, recomputed from the header counters whenever a
/// contained slab transitions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SuperslabState {
    /// No free slab.
    Full,
    /// At least one full-size slab is free.
    Available,
    /// Only the short slab is free.
    OnlyShortSlabAvailable,
    /// Every slab is free; the region can return to the global pool.
    Empty,
}

/// Header of a superslab. `repr(C)` with the list node first so superslabs
/// can sit on the allocator's available lists.
#[repr(C)]
pub struct Superslab {
    node: DlNode,
    owner: AtomicPtr<RemoteAllocator>,
    /// Slabs handed out, short slab included.
    used: Cell<u16>,
    /// Head of the free-slab index chain (full-size slabs only).
    free_head: Cell<u8>,
    short_used: Cell<bool>,
    meta: [UnsafeCell<Metaslab>; SLAB_COUNT],
}

// Safety: DlNode is the first field and Superslab is repr(C).
unsafe impl Linked for Superslab {}

impl Superslab {
    /// The superslab containing `addr`.
    #[inline]
    pub fn from_addr(addr: usize) -> *mut Superslab {
        align_down(addr, SUPERSLAB_SIZE) as *mut Superslab
    }

    /// Slab index of an address within its superslab.
    #[inline]
    pub fn index_of(addr: usize) -> usize {
        (addr & (SUPERSLAB_SIZE - 1)) >> SLAB_BITS
    }

    /// Base address of slab `index` within this superslab.
    #[inline]
    pub fn slab_base(&self, index: usize) -> usize {
        (self as *const Superslab as usize) + (index << SLAB_BITS)
    }

    /// The metadata record of slab `index`.
    #[inline]
    pub fn meta(&self, index: usize) -> *mut Metaslab {
        self.meta[index].get()
    }

    /// Superslab and slab index owning a metadata record.
    #[inline]
    pub fn from_meta(meta: *mut Metaslab) -> (*mut Superslab, usize) {
        let ss = Self::from_addr(meta as usize);
        let first = unsafe { (*ss).meta.as_ptr() } as usize;
        let index = (meta as usize - first) / core::mem::size_of::<UnsafeCell<Metaslab>>();
        (ss, index)
    }

    /// Initializes the header of a freshly acquired region: all slabs free,
    /// owned by `owner`.
    ///
    /// # Safety
    /// The region must be committed and not in use by any allocator.
    pub unsafe fn init(this: *mut Superslab, owner: *mut RemoteAllocator) {
        // The region may be fresh or recycled; build the header with raw
        // writes only.
        core::ptr::addr_of_mut!((*this).node).write(DlNode::new());
        core::ptr::addr_of_mut!((*this).used).write(Cell::new(0));
        core::ptr::addr_of_mut!((*this).free_head).write(Cell::new(1));
        core::ptr::addr_of_mut!((*this).short_used).write(Cell::new(false));
        let mut i = 1;
        while i < SLAB_COUNT {
            let m = core::ptr::addr_of_mut!((*this).meta[i]) as *mut Metaslab;
            (*m).link = if i + 1 < SLAB_COUNT { (i + 1) as u8 } else { NO_SLAB };
            i += 1;
        }
        // Publish the owner last; the release store pairs with the acquire
        // load in remote routing.
        core::ptr::addr_of_mut!((*this).owner).write(AtomicPtr::new(core::ptr::null_mut()));
        (*this).owner.store(owner, Ordering::Release);
    }

    /// The owning allocator's remote face.
    #[inline]
    pub fn owner(&self) -> *mut RemoteAllocator {
        self.owner.load(Ordering::Acquire)
    }

    /// Transfers ownership (only while the region is in the global pool).
    pub fn set_owner(&self, owner: *mut RemoteAllocator) {
        self.owner.store(owner, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SuperslabState {
        if self.used.get() == 0 {
            SuperslabState::Empty
        } else if self.free_head.get() != NO_SLAB {
            SuperslabState::Available
        } else if !self.short_used.get() {
            SuperslabState::OnlyShortSlabAvailable
        } else {
            SuperslabState::Full
        }
    }

    /// Takes a free full-size slab. The caller checked availability.
    ///
    /// # Safety
    /// Only the owning allocator may call this.
    pub unsafe fn alloc_slab(&self) -> usize {
        let index = self.free_head.get();
        debug_assert!(index != NO_SLAB);
        self.free_head.set((*self.meta(index as usize)).link);
        self.used.set(self.used.get() + 1);
        index as usize
    }

    /// Takes the short slab. The caller checked availability.
    ///
    /// # Safety
    /// Only the owning allocator may call this.
    pub unsafe fn alloc_short_slab(&self) -> usize {
        debug_assert!(!self.short_used.get());
        self.short_used.set(true);
        self.used.set(self.used.get() + 1);
        0
    }

    /// Returns slab `index` to the superslab.
    ///
    /// # Safety
    /// The slab must hold no live objects and belong to this superslab.
    pub unsafe fn dealloc_slab(&self, index: usize) {
        if index == 0 {
            self.short_used.set(false);
        } else {
            (*self.meta(index)).link = self.free_head.get();
            self.free_head.set(index as u8);
        }
        self.used.set(self.used.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::{DefaultPal, Pal};

    fn fresh() -> *mut Superslab {
        // A real 16MB region so alignment-based recovery works.
        let (p, _) = DefaultPal::reserve_at_least(2 * SUPERSLAB_SIZE).unwrap();
        let base = align_up(p.as_ptr() as usize, SUPERSLAB_SIZE);
        unsafe {
            DefaultPal::notify_using(base as *mut u8, SUPERSLAB_SIZE, false);
        }
        let ss = base as *mut Superslab;
        unsafe { Superslab::init(ss, core::ptr::null_mut()) };
        ss
    }

    #[test]
    fn test_state_transitions() {
        let ss = unsafe { &*fresh() };
        assert_eq!(ss.state(), SuperslabState::Empty);

        let short = unsafe { ss.alloc_short_slab() };
        assert_eq!(short, 0);
        assert_eq!(ss.state(), SuperslabState::Available);

        let mut taken = Vec::new();
        for _ in 1..SLAB_COUNT {
            taken.push(unsafe { ss.alloc_slab() });
        }
        assert_eq!(ss.state(), SuperslabState::Full);

        unsafe { ss.dealloc_slab(short) };
        assert_eq!(ss.state(), SuperslabState::OnlyShortSlabAvailable);

        for i in taken {
            unsafe { ss.dealloc_slab(i) };
        }
        assert_eq!(ss.state(), SuperslabState::Empty);
    }

    #[test]
    fn test_indices_unique() {
        let ss = unsafe { &*fresh() };
        let mut seen = [false; SLAB_COUNT];
        seen[unsafe { ss.alloc_short_slab() }] = true;
        for _ in 1..SLAB_COUNT {
            let i = unsafe { ss.alloc_slab() };
            assert!(!seen[i], "slab {i} handed out twice");
            seen[i] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_meta_round_trip() {
        let ss_ptr = fresh();
        let ss = unsafe { &*ss_ptr };
        for index in [0usize, 1, 17, SLAB_COUNT - 1] {
            let meta = ss.meta(index);
            let (back, i) = Superslab::from_meta(meta);
            assert_eq!(back, ss_ptr);
            assert_eq!(i, index);
            let base = ss.slab_base(index);
            assert_eq!(Superslab::index_of(base), index);
            assert_eq!(Superslab::from_addr(base + 5), ss_ptr);
        }
    }
}
