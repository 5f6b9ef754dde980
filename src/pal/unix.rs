#![cfg(unix)]

use core::ptr::{self, NonNull};
use libc::{c_void, mmap, mprotect, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

use super::Pal;
use crate::config::{align_up, PAGE_SIZE};

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: i32 = MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const RESERVE_FLAGS: i32 = MAP_PRIVATE | MAP_ANONYMOUS;

/// Unix platform: anonymous mmap for reservation, mprotect for commit,
/// madvise for decommit.
pub struct UnixPal;

impl Pal for UnixPal {
    // Anonymous pages are zero-filled on first touch, and decommitted pages
    // are demand-zeroed again.
    const ZERO_ON_COMMIT: bool = true;

    fn reserve_at_least(size: usize) -> Option<(NonNull<u8>, usize)> {
        let len = align_up(size, PAGE_SIZE);
        let p = unsafe { mmap(ptr::null_mut(), len, PROT_NONE, RESERVE_FLAGS, -1, 0) };
        if p == MAP_FAILED {
            return None;
        }
        NonNull::new(p as *mut u8).map(|p| (p, len))
    }

    unsafe fn notify_using(base: *mut u8, len: usize, zero: bool) {
        mprotect(base as *mut c_void, len, PROT_READ | PROT_WRITE);
        if zero {
            Self::zero(base, len);
        }
    }

    unsafe fn notify_not_using(base: *mut u8, len: usize) {
        #[cfg(target_os = "linux")]
        libc::madvise(base as *mut c_void, len, libc::MADV_DONTNEED);
        mprotect(base as *mut c_void, len, PROT_NONE);
    }

    unsafe fn zero(base: *mut u8, len: usize) {
        // For whole pages, replacing the mapping is cheaper than writing it.
        if len >= PAGE_SIZE && (base as usize) % PAGE_SIZE == 0 && len % PAGE_SIZE == 0 {
            let p = mmap(
                base as *mut c_void,
                len,
                PROT_READ | PROT_WRITE,
                RESERVE_FLAGS | MAP_FIXED,
                -1,
                0,
            );
            if p != MAP_FAILED {
                return;
            }
        }
        ptr::write_bytes(base, 0, len);
    }

    #[cfg(target_os = "linux")]
    fn entropy64() -> u64 {
        let mut v: u64 = 0;
        let r = unsafe {
            libc::getrandom((&mut v as *mut u64).cast::<c_void>(), core::mem::size_of::<u64>(), 0)
        };
        if r == core::mem::size_of::<u64>() as isize {
            v
        } else {
            // Kernel source unavailable; fall back to process randomness.
            use core::hash::{BuildHasher, Hasher};
            use std::collections::hash_map::RandomState;
            let mut h = RandomState::new().build_hasher();
            h.write_u64(Self::tick());
            h.finish()
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn entropy64() -> u64 {
        let mut v: u64 = 0;
        let r = unsafe {
            libc::getentropy((&mut v as *mut u64).cast::<c_void>(), core::mem::size_of::<u64>())
        };
        if r == 0 {
            v
        } else {
            use core::hash::{BuildHasher, Hasher};
            use std::collections::hash_map::RandomState;
            let mut h = RandomState::new().build_hasher();
            h.write_u64(Self::tick());
            h.finish()
        }
    }

    fn tick() -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        (ts.tv_sec as u64).wrapping_mul(1_000_000_000).wrapping_add(ts.tv_nsec as u64)
    }

    fn error(msg: &str) -> ! {
        super::report_fatal(msg)
    }
}
