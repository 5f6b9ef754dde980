//! Process-wide state and the public allocation surface.
//!
//! All allocators of one heap share a [`Globals`]: the address-space
//! manager, the pagemap, the large-object cache and the allocator pool.
//! The process-wide heap is a statically allocated `Globals` behind a
//! spin-once init (the allocator must work before any heap exists, so
//! construct-on-first-use is not an option); embedders and tests can run
//! additional independent heaps via [`Globals::new_leaked`].
//!
//! The thread-local bootstrap hands each thread an allocator from the pool
//! on first use and releases it at thread exit. Operations arriving after
//! TLS teardown borrow a pool allocator for the single call.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::address_space::AddressSpace;
use crate::allocator::{Allocator, Stats};
use crate::config::*;
use crate::large::LargeHeap;
use crate::mediumslab::Mediumslab;
#[cfg(not(target_pointer_width = "64"))]
use crate::pagemap::PagemapTree;
use crate::pagemap::{
    find_large_head, kind, DefaultPagemap, FlatPagemap, PagemapConfig, PagemapStore,
    LARGE_INTERIOR_BASE,
};
use crate::pal::{DefaultPal, Pal};
use crate::pool::AllocPool;
use crate::sizeclass::*;
use crate::superslab::Superslab;

/// Which edge of the enclosing object an external-pointer query snaps to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Boundary {
    /// First byte of the object.
    Start,
    /// Last byte of the object.
    End,
    /// One past the last byte.
    OnePastEnd,
}

/// Shared state of one heap.
pub struct Globals<P: Pal> {
    /// Power-of-two region source.
    pub address_space: AddressSpace<P>,
    /// Address to slab-kind map.
    pub pagemap: DefaultPagemap,
    /// Free large-region cache.
    pub large: LargeHeap<P>,
    /// Per-thread allocator pool.
    pub pool: AllocPool<P>,
}

impl<P: Pal> Globals<P> {
    /// Constructs the shared state. [`Globals::init`] must run before use.
    pub const fn new() -> Self {
        Self {
            address_space: AddressSpace::new(),
            #[cfg(target_pointer_width = "64")]
            pagemap: FlatPagemap::new(),
            #[cfg(not(target_pointer_width = "64"))]
            pagemap: PagemapTree::new::<P>(),
            large: LargeHeap::new(),
            pool: AllocPool::new(),
        }
    }

    /// One-time setup: reserves the pagemap backing.
    pub fn init(&self) {
        #[cfg(target_pointer_width = "64")]
        self.pagemap.init::<P>();
    }

    /// A fresh, independent heap with static lifetime. Intended for tests
    /// and embedders; the process-wide heap uses static storage instead
    /// (this constructor allocates from the *host* heap).
    pub fn new_leaked() -> &'static Self {
        let g: &'static Self = Box::leak(Box::new(Self::new()));
        g.init();
        g
    }

    /// Size of the allocation containing `p` (the size-class size, not the
    /// requested size), or 0 for an unmanaged address.
    ///
    /// # Safety
    /// `p` must be null, unmanaged, or point into a live allocation.
    pub unsafe fn alloc_size(&self, p: *const u8) -> usize {
        let addr = p as usize;
        match self.pagemap.get(addr) {
            kind::NOT_OURS => 0,
            kind::SUPERSLAB => {
                let ss = Superslab::from_addr(addr);
                let meta = (*ss).meta(Superslab::index_of(addr));
                let sc = (*meta).sizeclass();
                if sc >= NUM_SMALL_CLASSES {
                    0
                } else {
                    sizeclass_to_size(sc)
                }
            }
            kind::MEDIUM => {
                let sc = (*Mediumslab::from_addr(addr)).sizeclass();
                if sc < NUM_SMALL_CLASSES || sc >= NUM_SIZECLASSES {
                    0
                } else {
                    sizeclass_to_size(sc)
                }
            }
            e if e < LARGE_INTERIOR_BASE => 1usize << e,
            _ => {
                let (_, bits) = find_large_head(&self.pagemap, addr);
                1usize << bits
            }
        }
    }

    /// Snaps an interior pointer to a boundary of its enclosing object.
    /// Returns null for unmanaged addresses and header/waste areas.
    ///
    /// # Safety
    /// `p` must be null, unmanaged, or point into a live slab or region.
    pub unsafe fn external_pointer(&self, p: *const u8, boundary: Boundary) -> *mut u8 {
        let addr = p as usize;
        match self.pagemap.get(addr) {
            kind::NOT_OURS => ptr::null_mut(),
            kind::SUPERSLAB => {
                let ss = Superslab::from_addr(addr);
                let index = Superslab::index_of(addr);
                let meta = (*ss).meta(index);
                let sc = (*meta).sizeclass();
                if sc >= NUM_SMALL_CLASSES {
                    return ptr::null_mut();
                }
                let slab_base = (*ss).slab_base(index);
                let offset = small_offset(sc, index == 0);
                let rel = addr - slab_base;
                if rel < offset {
                    return ptr::null_mut();
                }
                let idx = index_in_class(sc, rel - offset);
                if idx >= small_capacity(sc, index == 0) {
                    return ptr::null_mut();
                }
                let size = sizeclass_to_size(sc);
                snap(slab_base + offset + idx * size, size, boundary)
            }
            kind::MEDIUM => {
                let ms = Mediumslab::from_addr(addr);
                let sc = (*ms).sizeclass();
                if sc < NUM_SMALL_CLASSES || sc >= NUM_SIZECLASSES {
                    return ptr::null_mut();
                }
                let offset = medium_offset(sc);
                let rel = addr - ms as usize;
                if rel < offset {
                    return ptr::null_mut();
                }
                let idx = index_in_class(sc, rel - offset);
                if idx >= medium_capacity(sc) {
                    return ptr::null_mut();
                }
                let size = sizeclass_to_size(sc);
                snap(ms as usize + offset + idx * size, size, boundary)
            }
            e if e < LARGE_INTERIOR_BASE => {
                let bits = e as usize;
                snap(align_down(addr, 1 << bits), 1 << bits, boundary)
            }
            _ => {
                let (head, bits) = find_large_head(&self.pagemap, addr);
                snap(head, 1usize << bits, boundary)
            }
        }
    }

    /// Advisory memory-pressure entry point; drains the large cache under
    /// the lazy decommit policy.
    pub fn handle_low_memory(&self) {
        self.large.handle_low_memory();
    }
}

fn snap(start: usize, size: usize, boundary: Boundary) -> *mut u8 {
    (match boundary {
        Boundary::Start => start,
        Boundary::End => start + size - 1,
        Boundary::OnePastEnd => start + size,
    }) as *mut u8
}

// ---- the process-wide heap ----

static GLOBALS: Globals<DefaultPal> = Globals::new();
static GLOBALS_STATE: AtomicU8 = AtomicU8::new(0);

const STATE_EMPTY: u8 = 0;
const STATE_INITING: u8 = 1;
const STATE_READY: u8 = 2;

fn process_low_memory() {
    GLOBALS.large.handle_low_memory();
}

impl Globals<DefaultPal> {
    /// The process-wide heap, initialized on first use.
    pub fn get() -> &'static Globals<DefaultPal> {
        loop {
            match GLOBALS_STATE.load(Ordering::Acquire) {
                STATE_READY => return &GLOBALS,
                STATE_EMPTY => {
                    if GLOBALS_STATE
                        .compare_exchange(
                            STATE_EMPTY,
                            STATE_INITING,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        GLOBALS.init();
                        DefaultPal::register_low_memory_callback(process_low_memory);
                        GLOBALS_STATE.store(STATE_READY, Ordering::Release);
                        return &GLOBALS;
                    }
                }
                _ => DefaultPal::pause(),
            }
        }
    }
}

// ---- thread-local bootstrap ----

struct ThreadGuard {
    alloc: Cell<*mut Allocator<DefaultPal>>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let p = self.alloc.get();
        if !p.is_null() {
            unsafe { Globals::get().pool.release(NonNull::new_unchecked(p)) };
        }
    }
}

thread_local! {
    static THREAD_ALLOC: ThreadGuard = const {
        ThreadGuard { alloc: Cell::new(ptr::null_mut()) }
    };
}

/// Runs `f` on this thread's allocator, acquiring one on first use. After
/// TLS teardown an allocator is borrowed from the pool for the single call.
/// `None` means the address space is exhausted.
fn with_alloc<R>(f: impl FnOnce(&mut Allocator<DefaultPal>) -> R) -> Option<R> {
    let g = Globals::get();
    match THREAD_ALLOC.try_with(|guard| {
        let mut p = guard.alloc.get();
        if p.is_null() {
            p = g.pool.acquire(g)?.as_ptr();
            guard.alloc.set(p);
        }
        Some(p)
    }) {
        Ok(Some(p)) => Some(f(unsafe { &mut *p })),
        Ok(None) => None,
        Err(_) => {
            let a = g.pool.acquire(g)?;
            let r = f(unsafe { &mut *a.as_ptr() });
            unsafe { g.pool.release(a) };
            Some(r)
        }
    }
}

// ---- public allocation API ----

/// Allocates at least `size` bytes aligned to the natural alignment of the
/// size class (at least two pointers). Returns null on out-of-memory.
pub fn alloc(size: usize) -> *mut u8 {
    with_alloc(|a| unsafe { a.alloc(size, false) }).unwrap_or(ptr::null_mut())
}

/// Like [`alloc`], with the memory zeroed.
pub fn alloc_zeroed(size: usize) -> *mut u8 {
    with_alloc(|a| unsafe { a.alloc(size, true) }).unwrap_or(ptr::null_mut())
}

/// Frees an allocation. Null is a no-op; an invalid pointer is fatal.
///
/// # Safety
/// `p` must be null or a pointer returned by this heap's allocation
/// functions, not freed before.
pub unsafe fn dealloc(p: *mut u8) {
    if p.is_null() {
        return;
    }
    if with_alloc(|a| unsafe { a.dealloc(p) }).is_none() {
        DefaultPal::error("no allocator available to free a live pointer");
    }
}

/// Sized free: validates that `size` rounds to the allocation's class, then
/// frees. A mismatch is client misuse and fatal.
///
/// # Safety
/// As for [`dealloc`]; additionally `size` must be the requested size of
/// the original allocation.
pub unsafe fn dealloc_sized(p: *mut u8, size: usize) {
    if p.is_null() {
        return;
    }
    if round_size(size) != Globals::get().alloc_size(p) {
        DefaultPal::error("sized free does not match the allocation's size class");
    }
    dealloc(p);
}

/// Resizes an allocation, preserving contents up to the smaller size.
/// Within the same size class the pointer is returned unchanged.
///
/// # Safety
/// As for [`dealloc`]; `p` must not be used after a successful move.
pub unsafe fn realloc(p: *mut u8, new_size: usize) -> *mut u8 {
    if p.is_null() {
        return alloc(new_size);
    }
    if new_size == 0 {
        dealloc(p);
        return ptr::null_mut();
    }
    let old = Globals::get().alloc_size(p);
    if round_size(new_size) == old {
        return p;
    }
    let q = alloc(new_size);
    if q.is_null() {
        return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(p, q, old.min(new_size));
    dealloc(p);
    q
}

/// The size class size a request rounds up to.
pub fn round_size(size: usize) -> usize {
    if size <= MAX_MEDIUM_SIZE {
        sizeclass_to_size(size_to_sizeclass(size))
    } else {
        1usize << core::cmp::max(next_pow2_bits(size), SUPERSLAB_BITS)
    }
}

/// Size of the allocation containing `p`; 0 for unmanaged addresses.
///
/// # Safety
/// See [`Globals::alloc_size`].
pub unsafe fn alloc_size(p: *const u8) -> usize {
    Globals::get().alloc_size(p)
}

/// Snaps `p` to a boundary of its enclosing allocation; null if unmanaged.
///
/// # Safety
/// See [`Globals::external_pointer`].
pub unsafe fn external_pointer(p: *const u8, boundary: Boundary) -> *mut u8 {
    Globals::get().external_pointer(p, boundary)
}

/// Statistics of the calling thread's allocator.
pub fn thread_stats() -> Option<Stats> {
    with_alloc(|a| a.stats())
}

/// Drains every allocator of the process heap to a fixpoint and reports
/// whether all client memory has been returned. Test support; the process
/// must be quiescent.
///
/// # Safety
/// No other thread may run allocator operations concurrently.
pub unsafe fn debug_check_empty() -> bool {
    let _ = with_alloc(|a| unsafe {
        a.flush();
        a.debug_flush_local();
    });
    Globals::get().pool.debug_check_empty()
}

/// The process pagemap and its format record, for cross-binary sharing.
/// Consumers must verify the config matches their own build before use.
pub fn pagemap_handle() -> (&'static DefaultPagemap, PagemapConfig) {
    let g = Globals::get();
    (&g.pagemap, g.pagemap.config())
}

// ---- GlobalAlloc adapter ----

/// A `GlobalAlloc` over the process heap:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: postalloc::PostAlloc = postalloc::PostAlloc;
/// ```
pub struct PostAlloc;

fn layout_to_size(size: usize, align: usize) -> usize {
    if align <= MIN_ALLOC_SIZE || size >= (1usize << (ADDRESS_BITS - 1)) {
        size
    } else {
        // Pushing the size to a power of two at least `align` lands in a
        // class whose natural alignment covers the request.
        size.next_power_of_two().max(align)
    }
}

unsafe impl GlobalAlloc for PostAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc(layout_to_size(layout.size(), layout.align()))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        alloc_zeroed(layout_to_size(layout.size(), layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        dealloc_sized(ptr, layout_to_size(layout.size(), layout.align()));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        realloc(ptr, layout_to_size(new_size, layout.align()))
    }
}
