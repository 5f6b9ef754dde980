//! Spin synchronization for the infrequent paths.
//!
//! The fast paths of the allocator are wait-free and never touch these; the
//! flag lock guards slab acquisition through the address-space manager and
//! the allocator pool's idle list.

use core::sync::atomic::{AtomicBool, Ordering};

pub use crossbeam_utils::CachePadded;

/// A non-reentrant test-and-set spin lock.
pub struct FlagLock {
    flag: AtomicBool,
}

impl FlagLock {
    /// Creates an unlocked flag.
    pub const fn new() -> Self {
        Self { flag: AtomicBool::new(false) }
    }

    /// Acquires the lock, spinning with a CPU hint while contended.
    pub fn lock(&self) -> FlagGuard<'_> {
        loop {
            if self
                .flag
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return FlagGuard { lock: self };
            }
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }
}

impl Default for FlagLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`FlagLock`]; releases on drop.
pub struct FlagGuard<'a> {
    lock: &'a FlagLock,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}
