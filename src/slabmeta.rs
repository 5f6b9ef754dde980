//! Per-slab bookkeeping for small-object slabs.
//!
//! One `Metaslab` per slab, stored in the owning superslab's header. It
//! carries the slab's free-list builder (locally freed objects accumulate
//! here until the allocator steals them onto its per-class hot list), the
//! carve/free counts that drive the slab state machine, and the class-list
//! link.
//!
//! State machine, driven by the counters:
//! - on a class list  ⟺  `free_count > 0` (it has a stealable list)
//! - fully free       ⟺  `free_count == carved == capacity`
//! - the bump target may be fully carved later; `carved` only grows.

use crate::dllist::{DlNode, Linked};
use crate::entropy::LocalEntropy;
use crate::freelist::{FreeListBuilder, FreeListIter, FreeListKey, FreeObject};

/// End-of-chain sentinel for the superslab's free-slab index chain.
pub const NO_SLAB: u8 = 0xFF;

/// Metadata record for one small slab.
#[repr(C)]
pub struct Metaslab {
    node: DlNode,
    free: FreeListBuilder,
    /// Objects currently parked in `free`.
    free_count: u16,
    /// Objects released from the bump region into circulation so far.
    carved: u16,
    sizeclass: u8,
    /// Next free slab index in the superslab chain.
    pub(crate) link: u8,
}

// Safety: DlNode is the first field and Metaslab is repr(C).
unsafe impl Linked for Metaslab {}

impl Metaslab {
    /// Prepares the record for a fresh slab of class `sizeclass`.
    pub fn init(&mut self, sizeclass: u8) {
        self.node = DlNode::new();
        self.free = FreeListBuilder::new();
        self.free_count = 0;
        self.carved = 0;
        self.sizeclass = sizeclass;
    }

    /// The slab's size class.
    #[inline]
    pub fn sizeclass(&self) -> usize {
        self.sizeclass as usize
    }

    /// Objects parked on this slab's own list.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count as usize
    }

    /// Objects carved out of the bump region so far.
    #[inline]
    pub fn carved(&self) -> usize {
        self.carved as usize
    }

    /// Records `n` more objects carved from the bump region.
    #[inline]
    pub fn add_carved(&mut self, n: usize) {
        self.carved += n as u16;
    }

    /// Parks a locally freed object. Returns true when this was the first
    /// free (full -> available transition: the caller lists the slab).
    ///
    /// # Safety
    /// `obj` must belong to this slab and be unreferenced by the client.
    #[inline]
    pub unsafe fn park(
        &mut self,
        obj: *mut FreeObject,
        key: &FreeListKey,
        entropy: &mut LocalEntropy,
    ) -> bool {
        self.free.add(obj, key, entropy);
        self.free_count += 1;
        self.free_count == 1
    }

    /// Whether every object ever carved is parked here and the bump region
    /// is exhausted: the slab can go back to its superslab.
    #[inline]
    pub fn is_unused(&self, capacity: usize) -> bool {
        self.free_count == self.carved && self.carved as usize == capacity
    }

    /// Whether all carved objects are parked (the bump tail may remain);
    /// used by the teardown path to abandon an idle bump slab.
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        self.free_count == self.carved
    }

    /// Steals the parked list for the per-class hot list. The slab leaves
    /// its class list afterwards (nothing stealable remains).
    ///
    /// # Safety
    /// Must be called with the owning allocator's key.
    pub unsafe fn steal(&mut self, key: &FreeListKey) -> FreeListIter {
        self.free_count = 0;
        self.free.close(key)
    }
}
