//! Intrusive free lists threaded through the freed objects themselves.
//!
//! While an object is free its first word carries the encoded `next` link
//! and, when the `checks` feature is on, its second word carries a signed
//! predecessor token. The signature binds each object to the address of its
//! predecessor under two per-allocator keys, so an attacker who overwrites a
//! freed object cannot splice the list without knowing the keys; `next` is
//! additionally XORed with a third key so a heap scan reveals no pointer
//! graph.
//!
//! Lists are built through [`FreeListBuilder`], which keeps two parallel
//! queues when randomization is enabled and picks one per object with a
//! single entropy bit; closing appends the second queue to the first.

use core::ptr;

use crate::entropy::LocalEntropy;
use crate::pal::Pal;

/// Number of builder queues (two when randomization is on).
pub const NUM_QUEUES: usize = if cfg!(feature = "random") { 2 } else { 1 };

/// A freed object viewed as allocator data. The minimum allocation size is
/// two words, exactly this header.
#[repr(C)]
pub struct FreeObject {
    next: *mut FreeObject,
    signed_prev: usize,
}

/// Per-allocator free-list keys. `k1`/`k2` feed the predecessor signature,
/// `xor` encodes the stored links.
#[derive(Clone, Copy)]
pub struct FreeListKey {
    k1: usize,
    k2: usize,
    xor: usize,
}

impl FreeListKey {
    /// Draws a fresh key set from the allocator's entropy.
    pub fn new(entropy: &mut LocalEntropy) -> Self {
        if cfg!(feature = "checks") {
            Self {
                k1: entropy.next_u64() as usize,
                k2: entropy.next_u64() as usize,
                xor: entropy.next_u64() as usize,
            }
        } else {
            Self { k1: 0, k2: 0, xor: 0 }
        }
    }

    #[inline]
    fn encode(&self, p: *mut FreeObject) -> *mut FreeObject {
        (p as usize ^ self.xor) as *mut FreeObject
    }

    #[inline]
    fn decode(&self, p: *mut FreeObject) -> *mut FreeObject {
        (p as usize ^ self.xor) as *mut FreeObject
    }

    /// Signature an object at `this` must carry when its predecessor on the
    /// list is at `prev` (0 for the list head).
    #[inline]
    fn sign(&self, prev: usize, this: usize) -> usize {
        prev.wrapping_add(self.k1).wrapping_mul(this.wrapping_add(self.k2))
    }
}

/// A consuming iterator over a closed free list. This is the per-class hot
/// list: `take` is the small-allocation fast path.
#[derive(Clone, Copy)]
pub struct FreeListIter {
    head: *mut FreeObject,
    prev: usize,
}

impl FreeListIter {
    /// An exhausted iterator.
    pub const fn empty() -> Self {
        Self { head: ptr::null_mut(), prev: 0 }
    }

    /// Whether the list is exhausted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// The next object without consuming it.
    #[inline]
    pub fn peek(&self) -> *mut FreeObject {
        self.head
    }

    /// Pops the head, verifying its predecessor signature first when checks
    /// are enabled. A mismatch is heap corruption and is fatal.
    ///
    /// # Safety
    /// The iterator must be non-empty and built with the same `key`.
    #[inline]
    pub unsafe fn take<P: Pal>(&mut self, key: &FreeListKey) -> *mut FreeObject {
        let obj = self.head;
        debug_assert!(!obj.is_null());
        if cfg!(feature = "checks") && (*obj).signed_prev != key.sign(self.prev, obj as usize) {
            P::error("free list corruption: signature mismatch");
        }
        self.head = key.decode((*obj).next);
        self.prev = obj as usize;
        obj
    }
}

/// Builds a free list in place over freed objects.
///
/// With randomization each added object lands in one of two queues chosen by
/// an entropy bit; `close` terminates both and splices them, so consecutive
/// frees do not yield consecutive reallocation order.
pub struct FreeListBuilder {
    head: [*mut FreeObject; NUM_QUEUES],
    tail: [*mut FreeObject; NUM_QUEUES],
}

impl FreeListBuilder {
    /// An empty builder.
    pub const fn new() -> Self {
        Self {
            head: [ptr::null_mut(); NUM_QUEUES],
            tail: [ptr::null_mut(); NUM_QUEUES],
        }
    }

    /// Whether nothing has been added since the last close.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let mut q = 0;
        while q < NUM_QUEUES {
            if !self.head[q].is_null() {
                return false;
            }
            q += 1;
        }
        true
    }

    /// Appends a freed object.
    ///
    /// # Safety
    /// `obj` must point to a free object of at least `MIN_ALLOC_SIZE` bytes,
    /// owned by the calling allocator.
    #[inline]
    pub unsafe fn add(&mut self, obj: *mut FreeObject, key: &FreeListKey, entropy: &mut LocalEntropy) {
        let q = if NUM_QUEUES == 2 && entropy.next_bit() { 1 } else { 0 };
        let tail = self.tail[q];
        if tail.is_null() {
            self.head[q] = obj;
            if cfg!(feature = "checks") {
                (*obj).signed_prev = key.sign(0, obj as usize);
            }
        } else {
            (*tail).next = key.encode(obj);
            if cfg!(feature = "checks") {
                (*obj).signed_prev = key.sign(tail as usize, obj as usize);
            }
        }
        self.tail[q] = obj;
    }

    /// Terminates the queues, splices the second onto the first and returns
    /// the result as an iterator. The builder is empty afterwards.
    ///
    /// # Safety
    /// Must be called with the same `key` the objects were added under.
    pub unsafe fn close(&mut self, key: &FreeListKey) -> FreeListIter {
        let mut head = self.head[0];
        let mut tail = self.tail[0];

        let mut q = 1;
        while q < NUM_QUEUES {
            let (h, t) = (self.head[q], self.tail[q]);
            if !h.is_null() {
                if head.is_null() {
                    head = h;
                } else {
                    (*tail).next = key.encode(h);
                    if cfg!(feature = "checks") {
                        // Re-sign the splice point: its predecessor is now
                        // the tail of the first queue, not the list head.
                        (*h).signed_prev = key.sign(tail as usize, h as usize);
                    }
                }
                tail = t;
            }
            q += 1;
        }

        if !tail.is_null() {
            (*tail).next = key.encode(ptr::null_mut());
        }

        *self = Self::new();
        FreeListIter { head, prev: 0 }
    }
}

impl Default for FreeListBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_ALLOC_SIZE;
    use crate::pal::{DefaultPal, PanicPal};

    fn keys() -> (FreeListKey, LocalEntropy) {
        let mut e = LocalEntropy::new::<DefaultPal>();
        (FreeListKey::new(&mut e), e)
    }

    #[test]
    fn test_build_and_drain() {
        let (key, mut entropy) = keys();
        let mut blocks = [[0usize; 2]; 32];
        let ptrs: Vec<*mut FreeObject> =
            blocks.iter_mut().map(|b| b.as_mut_ptr() as *mut FreeObject).collect();

        let mut builder = FreeListBuilder::new();
        unsafe {
            for &p in &ptrs {
                builder.add(p, &key, &mut entropy);
            }
            let mut iter = builder.close(&key);
            let mut seen = Vec::new();
            while !iter.is_empty() {
                seen.push(iter.take::<DefaultPal>(&key));
            }
            seen.sort();
            let mut expect = ptrs.clone();
            expect.sort();
            assert_eq!(seen, expect);
        }
        assert!(builder.is_empty());
    }

    #[test]
    fn test_object_header_is_two_words() {
        assert_eq!(core::mem::size_of::<FreeObject>(), MIN_ALLOC_SIZE);
    }

    #[cfg(feature = "checks")]
    #[test]
    #[should_panic(expected = "free list corruption")]
    fn test_corruption_is_fatal() {
        let (key, mut entropy) = keys();
        let mut blocks = [[0usize; 2]; 8];
        let ptrs: Vec<*mut FreeObject> =
            blocks.iter_mut().map(|b| b.as_mut_ptr() as *mut FreeObject).collect();

        let mut builder = FreeListBuilder::new();
        unsafe {
            for &p in &ptrs {
                builder.add(p, &key, &mut entropy);
            }
            let mut iter = builder.close(&key);
            // Scribble over every signature; whichever object comes first
            // must trip the check.
            for &p in &ptrs {
                (*p).signed_prev = 0xDEAD_BEEF;
            }
            while !iter.is_empty() {
                iter.take::<PanicPal>(&key);
            }
        }
    }

    #[cfg(feature = "random")]
    #[test]
    fn test_close_order_randomized() {
        // With two queues the drain order should differ from insertion order
        // for at least one of a handful of builds.
        let (key, mut entropy) = keys();
        let mut shuffled = false;
        for _ in 0..8 {
            let mut blocks = [[0usize; 2]; 32];
            let ptrs: Vec<*mut FreeObject> =
                blocks.iter_mut().map(|b| b.as_mut_ptr() as *mut FreeObject).collect();
            let mut builder = FreeListBuilder::new();
            unsafe {
                for &p in &ptrs {
                    builder.add(p, &key, &mut entropy);
                }
                let mut iter = builder.close(&key);
                let mut seen = Vec::new();
                while !iter.is_empty() {
                    seen.push(iter.take::<DefaultPal>(&key));
                }
                if seen != ptrs {
                    shuffled = true;
                }
            }
        }
        assert!(shuffled);
    }
}
