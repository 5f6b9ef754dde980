//! Cross-thread deallocation: remote caches, posting, and queue draining.

use std::thread;

use postalloc::allocator::Allocator;
use postalloc::global::Globals;
use postalloc::pal::DefaultPal;

fn heap() -> &'static Globals<DefaultPal> {
    Globals::new_leaked()
}

fn acquire(g: &'static Globals<DefaultPal>) -> &'static mut Allocator<DefaultPal> {
    unsafe { &mut *g.pool.acquire(g).expect("out of address space").as_ptr() }
}

#[test]
fn test_cross_thread_free_returns_objects() {
    const COUNT: usize = 10_000;
    let g = heap();
    let a = acquire(g);

    let ptrs: Vec<usize> = unsafe { (0..COUNT).map(|_| a.alloc(48, false) as usize).collect() };
    assert!(ptrs.iter().all(|&p| p != 0));
    let superslabs = a.stats().superslabs_acquired;

    let sent = thread::spawn(move || {
        let b = acquire(g);
        unsafe {
            for &p in &ptrs {
                b.dealloc(p as *mut u8);
            }
        }
        let sent = b.stats().remote_sent;
        unsafe { g.pool.release(b.into()) };
        sent
    })
    .join()
    .unwrap();
    assert_eq!(sent, COUNT as u64);

    // Drain the mailbox; every object must come home.
    unsafe { a.flush() };
    assert_eq!(a.stats().remote_received, COUNT as u64);

    // Re-allocating the same class must reuse the returned objects rather
    // than grow the heap.
    let again: Vec<usize> = unsafe { (0..COUNT).map(|_| a.alloc(48, false) as usize).collect() };
    assert_eq!(a.stats().superslabs_acquired, superslabs);
    unsafe {
        for p in again {
            a.dealloc(p as *mut u8);
        }
        a.flush();
        a.debug_flush_local();
    }
    assert!(unsafe { g.pool.debug_check_empty() });
}

#[test]
fn test_many_producers_single_consumer() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 2500;
    let g = heap();
    let a = acquire(g);

    let batches: Vec<Vec<usize>> = (0..PRODUCERS)
        .map(|_| unsafe { (0..PER_PRODUCER).map(|_| a.alloc(32, false) as usize).collect() })
        .collect();

    thread::scope(|s| {
        for batch in batches {
            s.spawn(move || {
                let b = acquire(g);
                unsafe {
                    for p in batch {
                        b.dealloc(p as *mut u8);
                    }
                }
                unsafe { g.pool.release(b.into()) };
            });
        }
    });

    // The producers are idle again; draining them is a no-op but must
    // converge.
    unsafe { g.pool.cleanup_unused() };

    unsafe {
        a.flush();
        a.debug_flush_local();
    }
    assert_eq!(a.stats().remote_received, (PRODUCERS * PER_PRODUCER) as u64);
    assert!(unsafe { g.pool.debug_check_empty() });
}

#[test]
fn test_remote_medium_objects() {
    let g = heap();
    let a = acquire(g);

    let ptrs: Vec<usize> = unsafe { (0..32).map(|_| a.alloc(100_000, false) as usize).collect() };

    thread::spawn(move || {
        let b = acquire(g);
        unsafe {
            for &p in &ptrs {
                b.dealloc(p as *mut u8);
            }
        }
        unsafe { g.pool.release(b.into()) };
    })
    .join()
    .unwrap();

    unsafe {
        a.flush();
        a.debug_flush_local();
    }
    assert_eq!(a.stats().remote_received, 32);
    assert_eq!(
        a.stats().medium_slabs_acquired,
        a.stats().medium_slabs_returned
    );
    assert!(unsafe { g.pool.debug_check_empty() });
}

#[test]
fn test_allocator_reuse_after_thread_exit() {
    let g = heap();

    let first = thread::spawn(move || {
        let a = g.pool.acquire(g).unwrap();
        unsafe {
            let p = (*a.as_ptr()).alloc(128, false);
            (*a.as_ptr()).dealloc(p);
            g.pool.release(a);
        }
        a.as_ptr() as usize
    })
    .join()
    .unwrap();

    // A later thread picks up the idle allocator rather than building a
    // fresh one.
    let second = thread::spawn(move || {
        let a = g.pool.acquire(g).unwrap();
        unsafe { g.pool.release(a) };
        a.as_ptr() as usize
    })
    .join()
    .unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_pool_registry_walks_all() {
    let g = heap();
    let a = g.pool.acquire(g).unwrap();
    let b = g.pool.acquire(g).unwrap();
    let ids: Vec<usize> = g.pool.iter().map(|p| p.as_ptr() as usize).collect();
    assert!(ids.contains(&(a.as_ptr() as usize)));
    assert!(ids.contains(&(b.as_ptr() as usize)));
    unsafe {
        g.pool.release(a);
        g.pool.release(b);
    }
}
