//! Outbound batching of cross-thread frees.
//!
//! A freeing thread never touches the owner's free lists: the object is
//! stamped with the owner's identity and size class and parked in one of 64
//! slot lists, selected by a window of the target id's bits. When the byte
//! budget runs out the whole cache is posted: each slot's chain goes to the
//! allocator owning its head object with a single queue enqueue.
//!
//! Chain nodes live at each object's cache-friendly offset (applied by the
//! sender, reversed by the owner at local free), so the header writes of a
//! free burst do not all land in the same cache sets.
//!
//! One slot is special: the one the *poster's own* id hashes to. Chains
//! landing there may mix targets that share those id bits with the poster,
//! so they are re-dealt using the next-higher window of id bits and posted
//! in a further round. Each round shifts by `REMOTE_SLOT_BITS`; distinct
//! ids must differ somewhere, so the residue empties in
//! O(log(#allocators) / REMOTE_SLOT_BITS) rounds. Exhausting the 64-bit
//! shift budget would mean two distinct allocators share an id and is
//! treated as fatal.

use core::ptr;
use core::sync::atomic::Ordering;

use crate::config::*;
use crate::mediumslab::Mediumslab;
use crate::pagemap::{kind, PagemapStore};
use crate::pal::Pal;
use crate::queue::{RemoteAllocator, RemoteMessage};
use crate::superslab::Superslab;

/// Per-thread outbound cache of remote frees.
pub struct RemoteCache {
    /// Chain heads; null when the slot is empty.
    head: [*mut RemoteMessage; REMOTE_SLOTS],
    /// Chain tails for O(1) append.
    last: [*mut RemoteMessage; REMOTE_SLOTS],
    /// Bytes left before a forced post.
    capacity: isize,
}

impl RemoteCache {
    /// An empty cache with a full byte budget.
    pub const fn new() -> Self {
        Self {
            head: [ptr::null_mut(); REMOTE_SLOTS],
            last: [ptr::null_mut(); REMOTE_SLOTS],
            capacity: REMOTE_CACHE as isize,
        }
    }

    /// Slot for an id under the given shift window.
    #[inline]
    pub fn slot(id: usize, shift: usize) -> usize {
        (id >> shift) & (REMOTE_SLOTS - 1)
    }

    /// Whether all slots are empty.
    pub fn is_empty(&self) -> bool {
        self.head.iter().all(|h| h.is_null())
    }

    /// Stamps `p` as a remote free for `target` (id | sizeclass) and parks
    /// it. Returns true when the byte budget is exhausted and the caller
    /// must post.
    ///
    /// # Safety
    /// `p` must be a freed object of at least two words, owned by the
    /// allocator identified in `target`.
    pub unsafe fn dealloc(&mut self, target: usize, p: *mut u8, size: usize, shift: usize) -> bool {
        let msg = p as *mut RemoteMessage;
        (*msg).target = target;
        self.append(Self::slot(target, shift), msg);
        self.capacity -= size as isize;
        self.capacity <= 0
    }

    unsafe fn append(&mut self, slot: usize, msg: *mut RemoteMessage) {
        if self.last[slot].is_null() {
            self.head[slot] = msg;
        } else {
            (*self.last[slot]).next.store(msg, Ordering::Relaxed);
        }
        self.last[slot] = msg;
    }

    unsafe fn take(&mut self, slot: usize) -> Option<(*mut RemoteMessage, *mut RemoteMessage)> {
        if self.last[slot].is_null() {
            return None;
        }
        let chain = (self.head[slot], self.last[slot]);
        self.head[slot] = ptr::null_mut();
        self.last[slot] = ptr::null_mut();
        Some(chain)
    }

    /// Drains every slot onto the target message queues and resets the byte
    /// budget. `my_id` is the posting allocator's identity and
    /// `initial_shift` its id alignment in bits.
    ///
    /// # Safety
    /// All parked objects must carry valid targets resolvable through `pm`.
    pub unsafe fn post<P: Pal, PM: PagemapStore>(
        &mut self,
        pm: &PM,
        my_id: usize,
        initial_shift: usize,
    ) {
        let mut shift = initial_shift;
        loop {
            if shift + REMOTE_SLOT_BITS > usize::BITS as usize {
                P::error("remote free routing exhausted the id bits");
            }
            let my_slot = Self::slot(my_id, shift);

            for slot in 0..REMOTE_SLOTS {
                if slot == my_slot {
                    continue;
                }
                if let Some((first, last)) = self.take(slot) {
                    let target = resolve_owner::<P, PM>(pm, first);
                    (*target).enqueue(first, last);
                }
            }

            match self.take(my_slot) {
                None => break,
                Some((first, last)) => {
                    // Re-deal the residue with the next window of id bits.
                    shift += REMOTE_SLOT_BITS;
                    let mut m = first;
                    loop {
                        let next = (*m).next.load(Ordering::Relaxed);
                        self.append(Self::slot((*m).target, shift), m);
                        if m == last {
                            break;
                        }
                        m = next;
                    }
                }
            }
        }
        self.capacity = REMOTE_CACHE as isize;
    }
}

impl Default for RemoteCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the allocator owning a message's object via the pagemap and the
/// slab header. A non-slab entry here means the cache was fed a corrupt
/// target, which is fatal.
unsafe fn resolve_owner<P: Pal, PM: PagemapStore>(
    pm: &PM,
    msg: *mut RemoteMessage,
) -> *mut RemoteAllocator {
    let addr = msg as usize;
    match pm.get(addr) {
        kind::SUPERSLAB => (*Superslab::from_addr(addr)).owner(),
        kind::MEDIUM => (*Mediumslab::from_addr(addr)).owner(),
        _ => P::error("remote free of an unmanaged address"),
    }
}
