#![cfg(windows)]

use core::ptr::{self, NonNull};
use windows_sys::Win32::Security::Cryptography::{BCryptGenRandom, BCRYPT_USE_SYSTEM_PREFERRED_RNG};
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::GetTickCount64;

use super::Pal;
use crate::config::{align_up, PAGE_SIZE};

/// Windows platform: VirtualAlloc reservation and commit, VirtualFree
/// decommit, BCrypt entropy.
pub struct WindowsPal;

impl Pal for WindowsPal {
    // Freshly committed pages are demand-zero; MEM_DECOMMIT + MEM_COMMIT
    // round-trips back to zero as well.
    const ZERO_ON_COMMIT: bool = true;

    fn reserve_at_least(size: usize) -> Option<(NonNull<u8>, usize)> {
        let len = align_up(size, PAGE_SIZE);
        let p = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
        NonNull::new(p as *mut u8).map(|p| (p, len))
    }

    unsafe fn notify_using(base: *mut u8, len: usize, zero: bool) {
        VirtualAlloc(base as _, len, MEM_COMMIT, PAGE_READWRITE);
        // Committing an already-committed page does not clear it.
        if zero {
            Self::zero(base, len);
        }
    }

    unsafe fn notify_not_using(base: *mut u8, len: usize) {
        VirtualFree(base as _, len, MEM_DECOMMIT);
    }

    unsafe fn zero(base: *mut u8, len: usize) {
        ptr::write_bytes(base, 0, len);
    }

    fn entropy64() -> u64 {
        let mut v = [0u8; 8];
        let status = unsafe {
            BCryptGenRandom(ptr::null_mut(), v.as_mut_ptr(), 8, BCRYPT_USE_SYSTEM_PREFERRED_RNG)
        };
        if status == 0 {
            u64::from_ne_bytes(v)
        } else {
            use core::hash::{BuildHasher, Hasher};
            use std::collections::hash_map::RandomState;
            let mut h = RandomState::new().build_hasher();
            h.write_u64(Self::tick());
            h.finish()
        }
    }

    fn tick() -> u64 {
        // Millisecond resolution is sufficient for stats.
        unsafe { GetTickCount64() }.wrapping_mul(1_000_000)
    }

    fn error(msg: &str) -> ! {
        super::report_fatal(msg)
    }
}
