//! The large-object cache.
//!
//! Freed power-of-two regions (one superslab and up) are parked on a
//! lock-free stack per size class instead of going back to the
//! address-space manager. The stack links live in the first word of each
//! region; a 16-bit tag in the packed head defeats ABA. Physical pages are
//! released according to the configured decommit policy: never, eagerly on
//! free, or lazily when the platform reports memory pressure.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::address_space::AddressSpace;
use crate::config::*;
use crate::pal::Pal;
use crate::sync::CachePadded;

// 48-bit pointers with a 16-bit ABA tag in the top bits.
const PTR_MASK: usize = 0x0000_FFFF_FFFF_FFFF;
const TAG_SHIFT: usize = 48;

#[inline]
fn pack(ptr: *mut RegionNode, tag: usize) -> usize {
    (ptr as usize & PTR_MASK) | (tag << TAG_SHIFT)
}

#[inline]
fn unpack(val: usize) -> (*mut RegionNode, usize) {
    ((val & PTR_MASK) as *mut RegionNode, val >> TAG_SHIFT)
}

/// Commit state of a cached region.
const COMMITTED: usize = 0;
const DECOMMITTED: usize = 1;

/// Link header written into the first word of a cached region. The first
/// page always stays committed to hold it.
#[repr(C)]
struct RegionNode {
    next: *mut RegionNode,
    state: usize,
}

/// Lock-free stack of free regions of one size class.
struct RegionStack {
    head: AtomicUsize,
}

impl RegionStack {
    const fn new() -> Self {
        Self { head: AtomicUsize::new(0) }
    }

    unsafe fn push(&self, node: *mut RegionNode) {
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (head, tag) = unpack(current);
            (*node).next = head;
            let next = pack(node, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    unsafe fn pop(&self) -> Option<*mut RegionNode> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (head, tag) = unpack(current);
            if head.is_null() {
                return None;
            }
            // Regions are never unmapped, so reading the link of a popped
            // candidate is always safe even if we lose the race.
            let next = pack((*head).next, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Per-class stacks of freed large regions.
pub struct LargeHeap<P: Pal> {
    stacks: [CachePadded<RegionStack>; NUM_LARGE_CLASSES],
    cached: [AtomicUsize; NUM_LARGE_CLASSES],
    _pal: PhantomData<fn() -> P>,
}

impl<P: Pal> LargeHeap<P> {
    /// An empty cache.
    pub const fn new() -> Self {
        const STACK: CachePadded<RegionStack> = CachePadded::new(RegionStack::new());
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            stacks: [STACK; NUM_LARGE_CLASSES],
            cached: [ZERO; NUM_LARGE_CLASSES],
            _pal: PhantomData,
        }
    }

    /// Number of regions currently cached for `class`. Diagnostic.
    pub fn cached(&self, class: usize) -> usize {
        self.cached[class].load(Ordering::Relaxed)
    }

    /// Takes a committed region of size `2^(SUPERSLAB_BITS + class)`,
    /// reusing a cached one when possible. `zero` requests zeroed memory.
    ///
    /// Returns `None` when the address space is exhausted.
    pub fn alloc(&self, asm: &AddressSpace<P>, class: usize, zero: bool) -> Option<*mut u8> {
        let size = large_class_size(class);
        if let Some(node) = unsafe { self.stacks[class].pop() } {
            self.cached[class].fetch_sub(1, Ordering::Relaxed);
            let base = node as *mut u8;
            let recommit = unsafe { (*node).state == DECOMMITTED } || DECOMMIT == DecommitPolicy::Eager;
            unsafe {
                if recommit {
                    // Pages past the first were given back; the first page
                    // stayed committed for the link.
                    P::notify_using(base.add(PAGE_SIZE), size - PAGE_SIZE, zero && !P::ZERO_ON_COMMIT);
                    if zero {
                        P::zero(base, PAGE_SIZE);
                    } else {
                        // The first page kept its link header; scrub it so
                        // stale allocator words never leak out.
                        core::ptr::write_bytes(base, 0, core::mem::size_of::<RegionNode>());
                    }
                } else if zero {
                    P::zero(base, size);
                } else {
                    // Scrub the link header so stale allocator words never
                    // leak into a handed-out region.
                    core::ptr::write_bytes(base, 0, core::mem::size_of::<RegionNode>());
                }
            }
            crate::slow_trace!(class, reused = true, "large alloc");
            return Some(base);
        }

        let p = asm.reserve(SUPERSLAB_BITS + class, true)?;
        if zero && !P::ZERO_ON_COMMIT {
            unsafe { P::zero(p.as_ptr(), size) };
        }
        crate::slow_trace!(class, reused = false, "large alloc");
        Some(p.as_ptr())
    }

    /// Returns a region to the cache, applying the decommit policy.
    ///
    /// # Safety
    /// `base` must be an unused region of exactly class `class`, committed
    /// at least in its first page.
    pub unsafe fn dealloc(&self, base: *mut u8, class: usize) {
        let size = large_class_size(class);
        let node = base as *mut RegionNode;
        if DECOMMIT == DecommitPolicy::Eager && size > PAGE_SIZE {
            P::notify_not_using(base.add(PAGE_SIZE), size - PAGE_SIZE);
            (*node).state = DECOMMITTED;
        } else {
            (*node).state = COMMITTED;
        }
        self.stacks[class].push(node);
        self.cached[class].fetch_add(1, Ordering::Relaxed);
        crate::slow_trace!(class, "large dealloc");
    }

    /// Platform memory-pressure hook: under the lazy policy, decommit every
    /// cached region down to its link page.
    pub fn handle_low_memory(&self) {
        if DECOMMIT != DecommitPolicy::Lazy {
            return;
        }
        for class in 0..NUM_LARGE_CLASSES {
            let size = large_class_size(class);
            if size <= PAGE_SIZE {
                continue;
            }
            // Bounded drain: regions pushed back decommitted are not
            // revisited even if other threads interleave.
            let budget = self.cached(class);
            for _ in 0..budget {
                let Some(node) = (unsafe { self.stacks[class].pop() }) else {
                    break;
                };
                unsafe {
                    if (*node).state == COMMITTED {
                        P::notify_not_using((node as *mut u8).add(PAGE_SIZE), size - PAGE_SIZE);
                        (*node).state = DECOMMITTED;
                    }
                    self.stacks[class].push(node);
                }
            }
            crate::slow_trace!(class, "low-memory drain");
        }
    }
}

#[inline]
fn large_class_size(class: usize) -> usize {
    1 << (SUPERSLAB_BITS + class)
}
