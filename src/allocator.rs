//! The per-thread allocator core.
//!
//! Each thread owns one `Allocator`. Small allocations pop the per-class
//! hot free list and are wait-free; the slow path, in order, drains a
//! bounded batch of incoming remote frees, steals a listed slab's free
//! list, carves a page's worth of objects off the bump region, and finally
//! acquires a new slab. Medium allocations pop an index from their slab's
//! free stack; large ones go to the global region cache.
//!
//! Deallocation recovers the slab kind from the pagemap. Objects owned by
//! this allocator go back to their slab's list; foreign objects are stamped
//! and parked in the remote cache. The message queue is the only
//! cross-thread channel, and it is drained cooperatively at the head of
//! every slow-path allocation.

use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr};

use crate::config::*;
use crate::dllist::DlList;
use crate::entropy::LocalEntropy;
use crate::freelist::{FreeListBuilder, FreeListIter, FreeListKey, FreeObject};
use crate::global::Globals;
use crate::mediumslab::Mediumslab;
use crate::pagemap::{clear_large_region, kind, set_large_region, PagemapStore, LARGE_INTERIOR_BASE};
use crate::pal::Pal;
use crate::queue::RemoteAllocator;
use crate::remotecache::RemoteCache;
use crate::sizeclass::*;
use crate::slabmeta::Metaslab;
use crate::superslab::{Superslab, SuperslabState};
use crate::sync::CachePadded;

/// Per-allocator event counters. Plain thread-local fields; read through
/// [`Allocator::stats`].
#[derive(Clone, Copy, Default, Debug)]
pub struct Stats {
    /// Small objects handed out.
    pub small_allocs: u64,
    /// Medium objects handed out.
    pub medium_allocs: u64,
    /// Large regions handed out.
    pub large_allocs: u64,
    /// Frees sent towards other allocators.
    pub remote_sent: u64,
    /// Messages drained from the incoming queue.
    pub remote_received: u64,
    /// Remote-cache posts performed.
    pub remote_posts: u64,
    /// Superslabs taken from the global pool.
    pub superslabs_acquired: u64,
    /// Superslabs returned to the global pool.
    pub superslabs_returned: u64,
    /// Medium slabs taken from the global pool.
    pub medium_slabs_acquired: u64,
    /// Medium slabs returned to the global pool.
    pub medium_slabs_returned: u64,
}

/// Bump state for one small class: a high-water mark into the most recently
/// acquired slab.
#[derive(Clone, Copy)]
struct BumpState {
    ptr: usize,
    remaining: usize,
    meta: *mut Metaslab,
}

impl BumpState {
    const EMPTY: BumpState = BumpState { ptr: 0, remaining: 0, meta: ptr::null_mut() };
}

/// A per-thread allocator. Constructed by the pool inside its own
/// power-of-two reservation, so its address is its identity and carries
/// enough clear low bits to pack a size class.
#[repr(C)]
pub struct Allocator<P: Pal> {
    /// Must be the first field: the queue address is the allocator id.
    remote: CachePadded<RemoteAllocator>,
    fast: [FreeListIter; NUM_SMALL_CLASSES],
    bump: [BumpState; NUM_SMALL_CLASSES],
    small_classes: [DlList<Metaslab>; NUM_SMALL_CLASSES],
    medium_classes: [DlList<Mediumslab>; NUM_MEDIUM_CLASSES],
    super_available: DlList<Superslab>,
    super_only_short: DlList<Superslab>,
    remote_cache: RemoteCache,
    entropy: LocalEntropy,
    key: FreeListKey,
    stats: Stats,
    global: &'static Globals<P>,
    /// Pool bookkeeping: idle-stack link and registry link.
    pub(crate) pool_next: AtomicPtr<Allocator<P>>,
    pub(crate) all_next: AtomicPtr<Allocator<P>>,
    pub(crate) in_use: AtomicBool,
}

impl<P: Pal> Allocator<P> {
    /// log2 of the reservation each allocator lives in; also the number of
    /// clear low bits in every allocator id.
    pub const ALLOC_BITS: usize = next_pow2_bits(mem::size_of::<Self>());
    /// First bit of the id used for remote-cache slot routing; the bits
    /// below it carry the packed size class.
    pub const INITIAL_SHIFT: usize = Self::ALLOC_BITS;
    const CLASS_MASK: usize = (1 << Self::ALLOC_BITS) - 1;

    /// A fresh allocator. The caller places it at a `2^ALLOC_BITS`-aligned
    /// address and then calls [`Allocator::init_remote`].
    pub fn new(global: &'static Globals<P>) -> Self {
        debug_assert!(NUM_SIZECLASSES < (1 << Self::ALLOC_BITS));
        let mut entropy = LocalEntropy::new::<P>();
        let key = FreeListKey::new(&mut entropy);

        const ITER: FreeListIter = FreeListIter::empty();
        const SMALL_LIST: DlList<Metaslab> = DlList::new();
        const MEDIUM_LIST: DlList<Mediumslab> = DlList::new();

        Self {
            remote: CachePadded::new(RemoteAllocator::new()),
            fast: [ITER; NUM_SMALL_CLASSES],
            bump: [BumpState::EMPTY; NUM_SMALL_CLASSES],
            small_classes: [SMALL_LIST; NUM_SMALL_CLASSES],
            medium_classes: [MEDIUM_LIST; NUM_MEDIUM_CLASSES],
            super_available: DlList::new(),
            super_only_short: DlList::new(),
            remote_cache: RemoteCache::new(),
            entropy,
            key,
            stats: Stats::default(),
            global,
            pool_next: AtomicPtr::new(ptr::null_mut()),
            all_next: AtomicPtr::new(ptr::null_mut()),
            in_use: AtomicBool::new(true),
        }
    }

    /// Primes the message queue. Must run once the allocator sits at its
    /// final address (the stub is self-referential).
    ///
    /// # Safety
    /// Call exactly once, before any allocation traffic.
    pub unsafe fn init_remote(&self) {
        self.remote.init();
    }

    /// This allocator's identity: its own address, low `ALLOC_BITS` clear.
    #[inline]
    pub fn id(&self) -> usize {
        self.remote.id()
    }

    /// The shareable queue face, as stored in slab headers.
    #[inline]
    pub fn remote_ptr(&self) -> *mut RemoteAllocator {
        &*self.remote as *const RemoteAllocator as *mut RemoteAllocator
    }

    /// The globals this allocator works against.
    #[inline]
    pub fn global(&self) -> &'static Globals<P> {
        self.global
    }

    /// Event counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Allocates `size` bytes, zeroed when `zero` is set. Returns null on
    /// out-of-memory.
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn alloc(&mut self, size: usize, zero: bool) -> *mut u8 {
        if size <= SLAB_SIZE {
            self.small_alloc(size_to_sizeclass(size), zero)
        } else if size <= MAX_MEDIUM_SIZE {
            self.medium_alloc(size, zero)
        } else {
            self.large_alloc(size, zero)
        }
    }

    /// Frees `p`. Null is a no-op; anything that is not the start of a live
    /// object managed by this heap is fatal.
    ///
    /// # Safety
    /// Only the owning thread may call this; `p` must not be used again.
    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let entry = self.global.pagemap.get(p as usize);
        match entry {
            kind::SUPERSLAB => self.small_dealloc(p),
            kind::MEDIUM => self.medium_dealloc(p),
            e if (e as usize) >= SUPERSLAB_BITS && e < LARGE_INTERIOR_BASE => {
                self.large_dealloc(p, e as usize);
            }
            kind::NOT_OURS => P::error("dealloc of a pointer not owned by this heap"),
            _ => P::error("dealloc of an interior pointer of a large allocation"),
        }
    }

    // ---- small path ----

    #[inline]
    unsafe fn small_alloc(&mut self, sc: usize, zero: bool) -> *mut u8 {
        if !self.fast[sc].is_empty() {
            return self.pop_fast(sc, zero);
        }
        self.small_alloc_slow(sc, zero)
    }

    #[inline]
    unsafe fn pop_fast(&mut self, sc: usize, zero: bool) -> *mut u8 {
        let key = self.key;
        // List entries sit at the cache-friendly offset; the client gets
        // the object base.
        let d = self.fast[sc].take::<P>(&key) as *mut u8;
        let p = remove_cache_friendly_offset(d, sc);
        self.stats.small_allocs += 1;
        if zero {
            ptr::write_bytes(p, 0, sizeclass_to_size(sc));
        }
        p
    }

    unsafe fn small_alloc_slow(&mut self, sc: usize, zero: bool) -> *mut u8 {
        self.handle_message_queue();
        loop {
            if !self.fast[sc].is_empty() {
                return self.pop_fast(sc, zero);
            }
            // A listed slab has a parked free list ready to steal.
            if let Some(meta) = self.small_classes[sc].pop() {
                let key = self.key;
                self.fast[sc] = (*meta.as_ptr()).steal(&key);
                continue;
            }
            if self.bump[sc].remaining > 0 {
                self.carve(sc);
                continue;
            }
            if !self.new_slab(sc) {
                return ptr::null_mut();
            }
        }
    }

    /// Builds a fresh hot list from the bump region: a page's worth of
    /// objects, order shuffled by the randomized builder.
    unsafe fn carve(&mut self, sc: usize) {
        let size = sizeclass_to_size(sc);
        let bump = self.bump[sc];
        let n = core::cmp::max(1, PAGE_SIZE / size).min(bump.remaining / size);
        let key = self.key;

        let mut builder = FreeListBuilder::new();
        for i in 0..n {
            let obj = apply_cache_friendly_offset((bump.ptr + i * size) as *mut u8, sc);
            builder.add(obj as *mut FreeObject, &key, &mut self.entropy);
        }
        self.fast[sc] = builder.close(&key);

        (*bump.meta).add_carved(n);
        self.bump[sc].ptr = bump.ptr + n * size;
        self.bump[sc].remaining = bump.remaining - n * size;
    }

    /// Installs a new bump slab for `sc`: from a partially used superslab,
    /// an only-short superslab, or a fresh region.
    unsafe fn new_slab(&mut self, sc: usize) -> bool {
        if let Some(ss) = self.super_available.head() {
            let ss = ss.as_ptr();
            let prev = (*ss).state();
            let index = (*ss).alloc_slab();
            let next = (*ss).state();
            self.superslab_transition(ss, prev, next);
            self.install_bump(ss, index, sc);
            return true;
        }

        // The short slab cannot host the slab-sized class.
        if small_capacity(sc, true) > 0 {
            if let Some(ss) = self.super_only_short.head() {
                let ss = ss.as_ptr();
                let prev = (*ss).state();
                let index = (*ss).alloc_short_slab();
                let next = (*ss).state();
                self.superslab_transition(ss, prev, next);
                self.install_bump(ss, index, sc);
                return true;
            }
        }

        let g = self.global;
        let Some(base) = g.large.alloc(&g.address_space, 0, false) else {
            return false;
        };
        let ss = base as *mut Superslab;
        Superslab::init(ss, self.remote_ptr());
        g.pagemap.set(base as usize, kind::SUPERSLAB);
        self.stats.superslabs_acquired += 1;
        crate::slow_trace!(superslab = base as usize, sizeclass = sc, "superslab acquired");

        let index = if small_capacity(sc, true) > 0 {
            (*ss).alloc_short_slab()
        } else {
            (*ss).alloc_slab()
        };
        let next = (*ss).state();
        self.superslab_transition(ss, SuperslabState::Empty, next);
        self.install_bump(ss, index, sc);
        true
    }

    unsafe fn install_bump(&mut self, ss: *mut Superslab, index: usize, sc: usize) {
        let meta = (*ss).meta(index);
        (*meta).init(sc as u8);
        let is_short = index == 0;
        let capacity = small_capacity(sc, is_short);
        let base = (*ss).slab_base(index) + small_offset(sc, is_short);
        self.bump[sc] = BumpState {
            ptr: base,
            remaining: capacity * sizeclass_to_size(sc),
            meta,
        };
    }

    unsafe fn small_dealloc(&mut self, p: *mut u8) {
        let addr = p as usize;
        let ss = Superslab::from_addr(addr);
        let index = Superslab::index_of(addr);
        let meta = (*ss).meta(index);
        let sc = (*meta).sizeclass();
        if sc >= NUM_SMALL_CLASSES {
            P::error("dealloc into a slab with a corrupt size class");
        }
        let rel = addr - (*ss).slab_base(index);
        let offset = small_offset(sc, index == 0);
        if rel < offset
            || rel - offset >= small_capacity(sc, index == 0) * sizeclass_to_size(sc)
            || !is_start_of_object(sc, rel - offset)
        {
            P::error("dealloc of a pointer that is not the start of an object");
        }

        let owner = (*ss).owner();
        if owner as usize == self.id() {
            self.small_dealloc_local(ss, index, p);
        } else {
            self.remote_dealloc(owner, sc, p);
        }
    }

    unsafe fn small_dealloc_local(&mut self, ss: *mut Superslab, index: usize, p: *mut u8) {
        let meta = (*ss).meta(index);
        let sc = (*meta).sizeclass();
        let key = self.key;
        let d = apply_cache_friendly_offset(p, sc);
        let first_free = (*meta).park(d as *mut FreeObject, &key, &mut self.entropy);

        let capacity = small_capacity(sc, index == 0);
        if (*meta).is_unused(capacity) {
            // Every object is back: the slab leaves circulation entirely.
            if !first_free {
                self.small_classes[sc].remove(NonNull::new_unchecked(meta));
            }
            if self.bump[sc].meta == meta {
                self.bump[sc] = BumpState::EMPTY;
            }
            self.return_small_slab(ss, index);
        } else if first_free {
            // Full -> available: list the slab for stealing.
            self.small_classes[sc].insert(NonNull::new_unchecked(meta));
        }
    }

    unsafe fn return_small_slab(&mut self, ss: *mut Superslab, index: usize) {
        let prev = (*ss).state();
        (*ss).dealloc_slab(index);
        let next = (*ss).state();
        self.superslab_transition(ss, prev, next);
    }

    /// Moves a superslab between the allocator's lists to match a state
    /// change; an empty superslab goes back to the global region pool.
    unsafe fn superslab_transition(
        &mut self,
        ss: *mut Superslab,
        prev: SuperslabState,
        next: SuperslabState,
    ) {
        use SuperslabState::*;
        if prev == next {
            return;
        }
        match prev {
            Available => self.super_available.remove(NonNull::new_unchecked(ss)),
            OnlyShortSlabAvailable => self.super_only_short.remove(NonNull::new_unchecked(ss)),
            Full | Empty => {}
        }
        match next {
            Available => self.super_available.insert(NonNull::new_unchecked(ss)),
            OnlyShortSlabAvailable => self.super_only_short.insert(NonNull::new_unchecked(ss)),
            Empty => {
                let g = self.global;
                g.pagemap.set(ss as usize, kind::NOT_OURS);
                self.stats.superslabs_returned += 1;
                crate::slow_trace!(superslab = ss as usize, "superslab returned");
                g.large.dealloc(ss as *mut u8, 0);
            }
            Full => {}
        }
    }

    // ---- medium path ----

    unsafe fn medium_alloc(&mut self, size: usize, zero: bool) -> *mut u8 {
        self.handle_message_queue();
        let sc = size_to_sizeclass(size);
        let mc = sc - NUM_SMALL_CLASSES;

        let ms = match self.medium_classes[mc].head() {
            Some(ms) => ms.as_ptr(),
            None => {
                let g = self.global;
                let Some(base) = g.large.alloc(&g.address_space, 0, false) else {
                    return ptr::null_mut();
                };
                let ms = base as *mut Mediumslab;
                Mediumslab::init(ms, self.remote_ptr(), sc as u8);
                g.pagemap.set(base as usize, kind::MEDIUM);
                self.stats.medium_slabs_acquired += 1;
                crate::slow_trace!(slab = base as usize, sizeclass = sc, "medium slab acquired");
                self.medium_classes[mc].insert(NonNull::new_unchecked(ms));
                ms
            }
        };

        let addr = (*ms).alloc();
        if (*ms).is_full() {
            self.medium_classes[mc].remove(NonNull::new_unchecked(ms));
        }
        self.stats.medium_allocs += 1;
        let p = addr as *mut u8;
        if zero {
            ptr::write_bytes(p, 0, sizeclass_to_size(sc));
        }
        p
    }

    unsafe fn medium_dealloc(&mut self, p: *mut u8) {
        let addr = p as usize;
        let ms = Mediumslab::from_addr(addr);
        let sc = (*ms).sizeclass();
        if sc < NUM_SMALL_CLASSES || sc >= NUM_SIZECLASSES {
            P::error("dealloc into a medium slab with a corrupt size class");
        }
        let rel = addr - ms as usize;
        let offset = medium_offset(sc);
        if rel < offset
            || rel - offset >= medium_capacity(sc) * sizeclass_to_size(sc)
            || !is_start_of_object(sc, rel - offset)
        {
            P::error("dealloc of a pointer that is not the start of an object");
        }

        let owner = (*ms).owner();
        if owner as usize != self.id() {
            self.remote_dealloc(owner, sc, p);
            return;
        }

        let mc = sc - NUM_SMALL_CLASSES;
        let was_full = (*ms).is_full();
        (*ms).dealloc(index_in_class(sc, rel - offset));

        if (*ms).is_empty() {
            if !was_full {
                self.medium_classes[mc].remove(NonNull::new_unchecked(ms));
            }
            let g = self.global;
            g.pagemap.set(ms as usize, kind::NOT_OURS);
            self.stats.medium_slabs_returned += 1;
            crate::slow_trace!(slab = ms as usize, "medium slab returned");
            g.large.dealloc(ms as *mut u8, 0);
        } else if was_full {
            self.medium_classes[mc].insert(NonNull::new_unchecked(ms));
        }
    }

    // ---- large path ----

    unsafe fn large_alloc(&mut self, size: usize, zero: bool) -> *mut u8 {
        self.handle_message_queue();
        let bits = core::cmp::max(next_pow2_bits(size), SUPERSLAB_BITS);
        if bits >= ADDRESS_BITS {
            return ptr::null_mut();
        }
        let g = self.global;
        let Some(base) = g.large.alloc(&g.address_space, bits - SUPERSLAB_BITS, zero) else {
            return ptr::null_mut();
        };
        set_large_region(&g.pagemap, base as usize, bits);
        self.stats.large_allocs += 1;
        base
    }

    unsafe fn large_dealloc(&mut self, p: *mut u8, bits: usize) {
        let addr = p as usize;
        if addr & ((1usize << bits) - 1) != 0 {
            P::error("dealloc of an interior pointer of a large allocation");
        }
        let g = self.global;
        clear_large_region(&g.pagemap, addr, bits);
        g.large.dealloc(p, bits - SUPERSLAB_BITS);
    }

    // ---- remote path ----

    unsafe fn remote_dealloc(&mut self, owner: *mut RemoteAllocator, sc: usize, p: *mut u8) {
        debug_assert!(owner as usize & Self::CLASS_MASK == 0);
        let target = owner as usize | sc;
        self.stats.remote_sent += 1;
        // The message header is written at the cache-friendly offset; the
        // owner reverses it when the object comes home.
        let d = apply_cache_friendly_offset(p, sc);
        if self.remote_cache.dealloc(target, d, sizeclass_to_size(sc), Self::INITIAL_SHIFT) {
            self.post();
        }
    }

    /// Drains the outbound remote cache onto the target queues.
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn post(&mut self) {
        self.stats.remote_posts += 1;
        crate::slow_trace!(id = self.id(), "posting remote cache");
        let g = self.global;
        self.remote_cache.post::<P, _>(&g.pagemap, self.id(), Self::INITIAL_SHIFT);
    }

    /// Drains up to a batch of incoming remote frees. Each message runs the
    /// normal dealloc path: a message for a slab whose ownership moved on is
    /// simply forwarded through the remote cache again.
    pub unsafe fn handle_message_queue(&mut self) -> usize {
        let mut handled = 0;
        while handled < REMOTE_BATCH {
            let Some(msg) = self.remote.dequeue() else { break };
            let m = msg.as_ptr();
            if self.remote.is_stub(m) {
                // Cycle the stub to the back: the queue stays non-empty and
                // the message it was retaining becomes dequeueable.
                self.remote.enqueue(m, m);
                continue;
            }
            self.stats.remote_received += 1;
            handled += 1;
            let p = self.message_object(m as *mut u8);
            self.dealloc(p);
        }
        handled
    }

    /// Recovers an object base from an incoming message: the sender wrote
    /// the header at the object's cache-friendly offset, reversed here on
    /// the local-free side.
    unsafe fn message_object(&self, m: *mut u8) -> *mut u8 {
        let addr = m as usize;
        match self.global.pagemap.get(addr) {
            kind::SUPERSLAB => {
                let ss = Superslab::from_addr(addr);
                let sc = (*(*ss).meta(Superslab::index_of(addr))).sizeclass();
                if sc >= NUM_SMALL_CLASSES {
                    P::error("remote message into a slab with a corrupt size class");
                }
                remove_cache_friendly_offset(m, sc)
            }
            kind::MEDIUM => {
                let sc = (*Mediumslab::from_addr(addr)).sizeclass();
                if sc < NUM_SMALL_CLASSES || sc >= NUM_SIZECLASSES {
                    P::error("remote message into a medium slab with a corrupt size class");
                }
                remove_cache_friendly_offset(m, sc)
            }
            _ => P::error("remote message for an unmanaged address"),
        }
    }

    // ---- teardown and debug ----

    /// Drains the incoming queue completely and posts any outbound
    /// residue. Returns the amount of work done (used to detect fixpoints).
    ///
    /// # Safety
    /// Only the owning thread (or the pool, for an idle allocator) may call
    /// this.
    pub unsafe fn flush(&mut self) -> usize {
        let mut work = 0;
        loop {
            let n = self.handle_message_queue();
            work += n;
            if n == 0 && self.remote.queue_is_empty() {
                break;
            }
        }
        if !self.remote_cache.is_empty() {
            self.post();
            work += 1;
        }
        work
    }

    /// Returns every object parked on the hot lists to its home slab and
    /// abandons idle bump slabs, so that quiescent superslabs can leave.
    /// Test support for `debug_check_empty`.
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn debug_flush_local(&mut self) {
        for sc in 0..NUM_SMALL_CLASSES {
            while !self.fast[sc].is_empty() {
                let key = self.key;
                let d = self.fast[sc].take::<P>(&key) as *mut u8;
                self.dealloc(remove_cache_friendly_offset(d, sc));
            }
            let bump = self.bump[sc];
            if !bump.meta.is_null() && (*bump.meta).is_quiescent() {
                if (*bump.meta).free_count() > 0 {
                    self.small_classes[sc].remove(NonNull::new_unchecked(bump.meta));
                }
                let (ss, index) = Superslab::from_meta(bump.meta);
                self.bump[sc] = BumpState::EMPTY;
                self.return_small_slab(ss, index);
            }
        }
    }

    /// Whether the allocator holds no client memory: every slab list empty,
    /// every region returned, nothing queued in either direction.
    pub fn debug_is_empty(&self) -> bool {
        self.fast.iter().all(FreeListIter::is_empty)
            && self.small_classes.iter().all(DlList::is_empty)
            && self.medium_classes.iter().all(DlList::is_empty)
            && self.super_available.is_empty()
            && self.super_only_short.is_empty()
            && self.remote_cache.is_empty()
            && self.remote.queue_is_empty()
            && self.stats.superslabs_acquired == self.stats.superslabs_returned
            && self.stats.medium_slabs_acquired == self.stats.medium_slabs_returned
    }
}

// Layout guarantees the identity packing relies on.
const _: () = {
    assert!(MIN_ALLOC_SIZE == 2 * core::mem::size_of::<usize>());
    assert!(core::mem::size_of::<crate::queue::RemoteMessage>() <= MIN_ALLOC_SIZE);
    assert!(core::mem::size_of::<FreeObject>() <= MIN_ALLOC_SIZE);
};
