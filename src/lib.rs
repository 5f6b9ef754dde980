//! # `postalloc` - Message-Passing Memory Allocator
//!
//! A `malloc`/`free` replacement built around one idea: a freeing thread
//! never contends with the allocating thread on the fast path. Every thread
//! owns an allocator with size-classed slab free lists; freeing an object
//! that belongs to another thread's allocator enqueues a message onto that
//! allocator's mailbox instead of touching its lists. The owner drains its
//! mailbox cooperatively on its own slow path.
//!
//! ## Key properties
//!
//! - **Wait-free fast paths**: small alloc and local free are plain loads
//!   and stores; cross-thread free is one atomic exchange
//! - **O(1) size classes**: compile-time tables, reciprocal division on the
//!   free path, no size headers on objects
//! - **Hardened free lists**: XOR-encoded links and keyed predecessor
//!   signatures (`checks` feature), randomized list construction (`random`)
//! - **Lazy physical memory**: power-of-two region cache with configurable
//!   decommit, down to a low-memory pressure hook
//!
//! ## Example
//!
//! ```rust
//! let p = postalloc::alloc(24);
//! assert!(!p.is_null());
//! assert!(postalloc::round_size(24) >= 24);
//! unsafe {
//!     assert!(postalloc::alloc_size(p) >= 24);
//!     postalloc::dealloc(p);
//! }
//! ```
//!
//! Or as the global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: postalloc::PostAlloc = postalloc::PostAlloc;
//! ```

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::missing_safety_doc)]

/// Internal tracing shim; compiles to nothing without the `tracing` feature.
#[macro_export]
#[doc(hidden)]
macro_rules! slow_trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        {
            tracing::trace!($($arg)*);
        }
    }};
}

pub mod address_space;
pub mod allocator;
pub mod config;
pub mod dllist;
pub mod entropy;
pub mod freelist;
pub mod global;
pub mod large;
pub mod mediumslab;
pub mod pagemap;
pub mod pal;
pub mod pool;
pub mod queue;
pub mod remotecache;
pub mod sizeclass;
pub mod slabmeta;
pub mod superslab;
pub mod sync;

pub use allocator::{Allocator, Stats};
pub use global::{
    alloc, alloc_size, alloc_zeroed, dealloc, dealloc_sized, debug_check_empty, external_pointer,
    pagemap_handle, realloc, round_size, thread_stats, Boundary, Globals, PostAlloc,
};
pub use pagemap::PagemapConfig;

// Compile-time layout checks the identity and packing schemes rest on.
const _: () = {
    use crate::config::*;
    use crate::sizeclass::{NUM_SIZECLASSES, NUM_SMALL_CLASSES};

    // Two-pointer minimum objects hold the free-list or message header.
    assert!(MIN_ALLOC_SIZE >= 2 * core::mem::size_of::<usize>());

    // The superslab header must fit inside the short slab.
    assert!(core::mem::size_of::<superslab::Superslab>() < SLAB_SIZE);

    // The medium header must fit below the smallest medium object offset.
    assert!(core::mem::size_of::<mediumslab::Mediumslab>() <= SUPERSLAB_SIZE / 2);

    // Size classes must pack into the clear low bits of an allocator id
    // (allocators are several KB, so their reservations are at least 2^12).
    assert!(NUM_SIZECLASSES < (1 << PAGE_BITS));
    assert!(NUM_SMALL_CLASSES < NUM_SIZECLASSES);

    // Remote routing windows must divide the word evenly enough to
    // terminate before the shift guard trips in practice.
    assert!(REMOTE_SLOTS.is_power_of_two());
    assert!(REMOTE_SLOT_BITS < ADDRESS_BITS);
};
