//! Lifetime management for per-thread allocators.
//!
//! Allocators are never destroyed: a thread that exits releases its
//! allocator back to the idle stack with its slabs and queue intact, and a
//! later thread picks it up again (outstanding remote frees keep flowing to
//! the queue meanwhile). A registry chain of every allocator ever built
//! supports the debug drain-and-check operations.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::allocator::Allocator;
use crate::global::Globals;
use crate::pal::Pal;
use crate::sync::FlagLock;

/// Pool of per-thread allocators.
pub struct AllocPool<P: Pal> {
    lock: FlagLock,
    idle: AtomicPtr<Allocator<P>>,
    all: AtomicPtr<Allocator<P>>,
}

impl<P: Pal> AllocPool<P> {
    /// An empty pool.
    pub const fn new() -> Self {
        Self {
            lock: FlagLock::new(),
            idle: AtomicPtr::new(ptr::null_mut()),
            all: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Hands out an idle allocator, or builds a new one inside its own
    /// power-of-two reservation. Returns `None` only on address-space
    /// exhaustion.
    pub fn acquire(&self, global: &'static Globals<P>) -> Option<NonNull<Allocator<P>>> {
        {
            let _guard = self.lock.lock();
            let head = self.idle.load(Ordering::Relaxed);
            if let Some(a) = NonNull::new(head) {
                let next = unsafe { a.as_ref() }.pool_next.load(Ordering::Relaxed);
                self.idle.store(next, Ordering::Relaxed);
                unsafe { a.as_ref() }.in_use.store(true, Ordering::Relaxed);
                return Some(a);
            }
        }

        let p = global.address_space.reserve(Allocator::<P>::ALLOC_BITS, true)?;
        let a = p.as_ptr() as *mut Allocator<P>;
        unsafe {
            ptr::write(a, Allocator::new(global));
            (*a).init_remote();
        }

        // Register in the all-allocators chain.
        let mut head = self.all.load(Ordering::Relaxed);
        loop {
            unsafe { (*a).all_next.store(head, Ordering::Relaxed) };
            match self.all.compare_exchange_weak(head, a, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        NonNull::new(a)
    }

    /// Returns an allocator to the idle stack at thread exit. Outbound
    /// remote frees are posted first so they are not stranded while the
    /// allocator sleeps.
    ///
    /// # Safety
    /// The calling thread must be the current owner and must not use the
    /// allocator afterwards.
    pub unsafe fn release(&self, a: NonNull<Allocator<P>>) {
        let alloc = &mut *a.as_ptr();
        alloc.flush();
        alloc.in_use.store(false, Ordering::Relaxed);

        let _guard = self.lock.lock();
        alloc.pool_next.store(self.idle.load(Ordering::Relaxed), Ordering::Relaxed);
        self.idle.store(a.as_ptr(), Ordering::Relaxed);
    }

    /// Every allocator ever constructed, idle or not.
    pub fn iter(&self) -> PoolIter<P> {
        PoolIter { curr: self.all.load(Ordering::Acquire) }
    }

    /// Drains idle allocators' queues and posts their caches until no
    /// further messages are produced.
    ///
    /// # Safety
    /// No other thread may be running allocator operations concurrently.
    pub unsafe fn cleanup_unused(&self) {
        loop {
            let mut work = 0;
            for a in self.iter() {
                let alloc = &mut *a.as_ptr();
                if !alloc.in_use.load(Ordering::Relaxed) {
                    work += alloc.flush();
                }
            }
            if work == 0 {
                break;
            }
        }
    }

    /// Drains everything (including in-use allocators) to a fixpoint and
    /// asserts every allocator is empty. Test support.
    ///
    /// # Safety
    /// No other thread may be running allocator operations concurrently.
    pub unsafe fn debug_check_empty(&self) -> bool {
        loop {
            let mut work = 0;
            for a in self.iter() {
                let alloc = &mut *a.as_ptr();
                work += alloc.flush();
                alloc.debug_flush_local();
            }
            if work == 0 {
                break;
            }
        }
        self.iter().all(|a| unsafe { a.as_ref() }.debug_is_empty())
    }
}

impl<P: Pal> Default for AllocPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the pool registry.
pub struct PoolIter<P: Pal> {
    curr: *mut Allocator<P>,
}

impl<P: Pal> Iterator for PoolIter<P> {
    type Item = NonNull<Allocator<P>>;

    fn next(&mut self) -> Option<NonNull<Allocator<P>>> {
        let a = NonNull::new(self.curr)?;
        self.curr = unsafe { a.as_ref() }.all_next.load(Ordering::Relaxed);
        Some(a)
    }
}
