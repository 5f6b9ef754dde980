//! The cross-thread deallocation message queue.
//!
//! One queue per allocator, living on its own cache line at the very start
//! of the allocator so that the allocator's address doubles as its identity.
//! Any thread may enqueue (one atomic exchange, wait-free); only the owning
//! thread dequeues. The queue is primed with a stub message and is never
//! empty, which keeps a branch off the enqueue path: `dequeue` returns the
//! previous front, so the most recently enqueued message is retained as the
//! new stub until more traffic pushes it out.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicPtr, Ordering};

/// A freed object in flight between allocators. The object's own first two
/// words are overwritten with this header at the remote-free boundary.
#[repr(C)]
pub struct RemoteMessage {
    pub(crate) next: AtomicPtr<RemoteMessage>,
    /// Target allocator id in the high bits, size class in the low bits
    /// (the id is aligned past the class bits by construction).
    pub(crate) target: usize,
}

impl RemoteMessage {
    /// An inert message.
    pub const fn new() -> Self {
        Self { next: AtomicPtr::new(ptr::null_mut()), target: 0 }
    }

    /// The packed target word.
    #[inline]
    pub fn target(&self) -> usize {
        self.target
    }
}

impl Default for RemoteMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// Intrusive multi-producer single-consumer queue of [`RemoteMessage`].
pub struct MpscQueue {
    back: AtomicPtr<RemoteMessage>,
    /// Owned by the consumer; producers never read it.
    front: UnsafeCell<*mut RemoteMessage>,
}

// Safety: `back` is atomic; `front` is only touched by the consumer, which
// is enforced by the ownership discipline of the allocator.
unsafe impl Send for MpscQueue {}
unsafe impl Sync for MpscQueue {}

impl MpscQueue {
    /// An unprimed queue; [`MpscQueue::init`] must run before any traffic.
    pub const fn new() -> Self {
        Self {
            back: AtomicPtr::new(ptr::null_mut()),
            front: UnsafeCell::new(ptr::null_mut()),
        }
    }

    /// Primes the queue with its permanent stub. After this the queue is
    /// never observed empty by producers.
    ///
    /// # Safety
    /// `stub` must outlive the queue and must not be enqueued elsewhere.
    pub unsafe fn init(&self, stub: *mut RemoteMessage) {
        (*stub).next.store(ptr::null_mut(), Ordering::Relaxed);
        self.back.store(stub, Ordering::Relaxed);
        *self.front.get() = stub;
    }

    /// Appends the chain `first..=last`. Wait-free: one exchange and two
    /// release stores.
    ///
    /// # Safety
    /// `first..=last` must be a well-formed chain owned by the caller, and
    /// the queue must have been initialized.
    pub unsafe fn enqueue(&self, first: *mut RemoteMessage, last: *mut RemoteMessage) {
        (*last).next.store(ptr::null_mut(), Ordering::Release);
        let prev = self.back.swap(last, Ordering::AcqRel);
        // Publish the chain. Between the swap and this store the queue is
        // momentarily disconnected; the consumer reads that as "no progress".
        (*prev).next.store(first, Ordering::Release);
    }

    /// Takes the next message, or `None` when no progress is possible right
    /// now. The returned pointer may be the stub, which the consumer skips.
    ///
    /// # Safety
    /// Only the owning (consumer) thread may call this.
    pub unsafe fn dequeue(&self) -> Option<NonNull<RemoteMessage>> {
        let front = *self.front.get();
        let next = (*front).next.load(Ordering::Relaxed);
        if next.is_null() {
            return None;
        }
        *self.front.get() = next;
        // Pair with the producers' release stores before handing the
        // message's payload to the consumer.
        fence(Ordering::Acquire);
        NonNull::new(front)
    }

    /// Consumer-side emptiness hint.
    #[inline]
    pub fn is_empty(&self) -> bool {
        unsafe {
            let front = *self.front.get();
            (*front).next.load(Ordering::Relaxed).is_null()
        }
    }
}

/// The shareable face of an allocator: its message queue plus the stub that
/// primes it. This sits at offset zero of the allocator (on its own cache
/// line), so its address doubles as the allocator's identity and the low
/// `log2(sizeof(allocator))` bits of that identity are always clear.
#[repr(C)]
pub struct RemoteAllocator {
    queue: MpscQueue,
    stub: UnsafeCell<RemoteMessage>,
}

// Safety: the queue is thread-safe by design; the stub is only written
// during init and by the queue machinery itself.
unsafe impl Send for RemoteAllocator {}
unsafe impl Sync for RemoteAllocator {}

impl RemoteAllocator {
    /// An unprimed remote face; [`RemoteAllocator::init`] must run once the
    /// allocator has reached its final address.
    pub const fn new() -> Self {
        Self { queue: MpscQueue::new(), stub: UnsafeCell::new(RemoteMessage::new()) }
    }

    /// Primes the queue with the embedded stub.
    ///
    /// # Safety
    /// Must be called exactly once, after the allocator is placed.
    pub unsafe fn init(&self) {
        self.queue.init(self.stub.get());
    }

    /// The owning allocator's identity.
    #[inline]
    pub fn id(&self) -> usize {
        self as *const RemoteAllocator as usize
    }

    /// Whether `m` is this queue's permanent stub.
    #[inline]
    pub fn is_stub(&self, m: *mut RemoteMessage) -> bool {
        core::ptr::eq(m, self.stub.get())
    }

    /// Enqueues a chain of messages from any thread.
    ///
    /// # Safety
    /// See [`MpscQueue::enqueue`].
    pub unsafe fn enqueue(&self, first: *mut RemoteMessage, last: *mut RemoteMessage) {
        self.queue.enqueue(first, last);
    }

    /// Dequeues the next message; owner thread only.
    ///
    /// # Safety
    /// See [`MpscQueue::dequeue`].
    pub unsafe fn dequeue(&self) -> Option<NonNull<RemoteMessage>> {
        self.queue.dequeue()
    }

    /// Consumer-side emptiness hint.
    #[inline]
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct Node(RemoteMessage);

    fn msg(target: usize) -> Box<Node> {
        let mut n = Box::new(Node(RemoteMessage::new()));
        n.0.target = target;
        n
    }

    #[test]
    fn test_fifo_per_producer() {
        let q = MpscQueue::new();
        let mut stub = RemoteMessage::new();
        unsafe {
            q.init(&mut stub);
            assert!(q.is_empty());

            let mut a = msg(1);
            let mut b = msg(2);
            let mut c = msg(3);
            let (pa, pb, pc): (*mut RemoteMessage, *mut RemoteMessage, *mut RemoteMessage) =
                (&mut a.0, &mut b.0, &mut c.0);
            q.enqueue(pa, pa);
            q.enqueue(pb, pb);
            q.enqueue(pc, pc);

            // First dequeue hands back the stub.
            let first = q.dequeue().unwrap();
            assert_eq!(first.as_ptr(), &mut stub as *mut RemoteMessage);
            assert_eq!(q.dequeue().unwrap().as_ref().target(), 1);
            assert_eq!(q.dequeue().unwrap().as_ref().target(), 2);
            // The last message is retained as the new stub.
            assert!(q.dequeue().is_none());
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_chain_enqueue() {
        let q = MpscQueue::new();
        let mut stub = RemoteMessage::new();
        unsafe {
            q.init(&mut stub);

            let mut a = msg(10);
            let mut b = msg(11);
            let (pa, pb): (*mut RemoteMessage, *mut RemoteMessage) = (&mut a.0, &mut b.0);
            (*pa).next.store(pb, Ordering::Relaxed);
            q.enqueue(pa, pb);
            let mut c = msg(12);
            let pc: *mut RemoteMessage = &mut c.0;
            q.enqueue(pc, pc);

            q.dequeue().unwrap(); // stub
            assert_eq!(q.dequeue().unwrap().as_ref().target(), 10);
            assert_eq!(q.dequeue().unwrap().as_ref().target(), 11);
            assert!(q.dequeue().is_none());
        }
    }

    #[test]
    fn test_concurrent_producers() {
        const PER_THREAD: usize = 1000;
        const THREADS: usize = 4;

        let q = Arc::new(MpscQueue::new());
        let stub = Box::leak(Box::new(RemoteMessage::new()));
        unsafe { q.init(stub) };

        thread::scope(|s| {
            for t in 0..THREADS {
                let q = Arc::clone(&q);
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let m: *mut RemoteMessage = &mut Box::leak(msg(t * PER_THREAD + i + 1)).0;
                        unsafe { q.enqueue(m, m) };
                    }
                });
            }

            let mut seen = vec![false; THREADS * PER_THREAD + 1];
            let mut count = 0;
            let mut last_per_thread = vec![0usize; THREADS];
            while count < THREADS * PER_THREAD - 1 {
                let Some(m) = (unsafe { q.dequeue() }) else {
                    thread::yield_now();
                    continue;
                };
                let target = unsafe { m.as_ref() }.target();
                if target == 0 {
                    continue; // stub
                }
                assert!(!seen[target], "duplicate message {target}");
                seen[target] = true;
                // FIFO within each producer.
                let t = (target - 1) / PER_THREAD;
                assert!(target > last_per_thread[t]);
                last_per_thread[t] = target;
                count += 1;
            }
        });
    }
}
