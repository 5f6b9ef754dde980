//! Platform abstraction layer.
//!
//! The core only ever talks to the operating system through [`Pal`]: address
//! reservation, commit/decommit, entropy, timing and fatal-error reporting.
//! This allows the allocator to run against the real OS (`UnixPal`,
//! `WindowsPal`) or against instrumented stand-ins in tests.

use core::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPal;
#[cfg(windows)]
pub use windows::WindowsPal;

/// The platform used by the process-wide allocator.
#[cfg(unix)]
pub type DefaultPal = UnixPal;
/// The platform used by the process-wide allocator.
#[cfg(windows)]
pub type DefaultPal = WindowsPal;

/// Operating-system services required by the allocator core.
///
/// All methods are associated functions: a platform is a zero-sized type
/// selecting an implementation, never carried state.
pub trait Pal: 'static {
    /// Pages handed out by `notify_using` after a decommit (or fresh from a
    /// reservation) read as zero without an explicit `zero` call.
    const ZERO_ON_COMMIT: bool;

    /// Reserves at least `size` bytes of address space, page aligned and
    /// uncommitted. Returns the base and the actual length, or `None` when
    /// the platform has no address space left.
    fn reserve_at_least(size: usize) -> Option<(NonNull<u8>, usize)>;

    /// Commits `len` bytes at `base`. If `zero` is requested the range reads
    /// as zero afterwards even if it held data before.
    ///
    /// # Safety
    /// `base..base+len` must lie inside a reservation from this platform.
    unsafe fn notify_using(base: *mut u8, len: usize, zero: bool);

    /// Decommits `len` bytes at `base`; contents are unspecified afterwards.
    ///
    /// # Safety
    /// `base..base+len` must lie inside a reservation from this platform.
    unsafe fn notify_not_using(base: *mut u8, len: usize);

    /// Zeroes a committed range.
    ///
    /// # Safety
    /// `base..base+len` must be committed and writable.
    unsafe fn zero(base: *mut u8, len: usize);

    /// 64 bits of entropy. The default draws from the standard library's
    /// per-process randomness, for platforms without a kernel source.
    fn entropy64() -> u64 {
        use core::hash::{BuildHasher, Hasher};
        use std::collections::hash_map::RandomState;
        let mut h = RandomState::new().build_hasher();
        h.write_u64(Self::tick());
        h.finish()
    }

    /// Registers a callback fired on physical memory pressure. Advisory;
    /// platforms without a pressure signal ignore the registration.
    fn register_low_memory_callback(_cb: fn()) {}

    /// CPU relaxation hint for spin loops.
    #[inline]
    fn pause() {
        core::hint::spin_loop();
    }

    /// Monotonic timestamp in nanoseconds, for statistics.
    fn tick() -> u64;

    /// Reports a fatal condition (client misuse or heap corruption) and
    /// terminates. Never returns.
    fn error(msg: &str) -> !;
}

/// Shared fatal-error path for the OS platforms: report and abort without
/// unwinding (the heap cannot be trusted once corruption is detected).
pub(crate) fn report_fatal(msg: &str) -> ! {
    eprintln!("postalloc fatal error: {msg}");
    std::process::abort();
}

/// A platform for unit tests: identical to the host platform except that
/// fatal errors panic instead of aborting, so tests can observe them.
#[cfg(test)]
pub(crate) struct PanicPal;

#[cfg(test)]
impl Pal for PanicPal {
    const ZERO_ON_COMMIT: bool = DefaultPal::ZERO_ON_COMMIT;

    fn reserve_at_least(size: usize) -> Option<(NonNull<u8>, usize)> {
        DefaultPal::reserve_at_least(size)
    }

    unsafe fn notify_using(base: *mut u8, len: usize, zero: bool) {
        DefaultPal::notify_using(base, len, zero)
    }

    unsafe fn notify_not_using(base: *mut u8, len: usize) {
        DefaultPal::notify_not_using(base, len)
    }

    unsafe fn zero(base: *mut u8, len: usize) {
        DefaultPal::zero(base, len)
    }

    fn entropy64() -> u64 {
        DefaultPal::entropy64()
    }

    fn tick() -> u64 {
        DefaultPal::tick()
    }

    fn error(msg: &str) -> ! {
        panic!("postalloc fatal error: {msg}");
    }
}
