//! The public process-heap surface: thread-local bootstrap, `GlobalAlloc`
//! adapter, realloc, and the pagemap ABI record.
//!
//! These tests share the process singleton, so they stick to operations
//! that are safe under the harness's parallel test threads.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use std::sync::mpsc;
use std::thread;

use postalloc::{
    alloc, alloc_size, alloc_zeroed, dealloc, dealloc_sized, external_pointer, pagemap_handle,
    realloc, round_size, thread_stats, Boundary, PostAlloc,
};

#[test]
fn test_basic_round_trip() {
    let p = alloc(100);
    assert!(!p.is_null());
    unsafe {
        ptr::write_bytes(p, 0x77, 100);
        assert!(alloc_size(p) >= 100);
        assert_eq!(external_pointer(p.add(50), Boundary::Start), p);
        dealloc(p);
    }
}

#[test]
fn test_round_size_is_alloc_size() {
    for size in [1usize, 16, 24, 1000, 70_000, 1 << 25] {
        let p = alloc(size);
        assert!(!p.is_null());
        unsafe {
            assert_eq!(alloc_size(p), round_size(size));
            dealloc_sized(p, size);
        }
    }
}

#[test]
fn test_alloc_zeroed() {
    let p = alloc_zeroed(256);
    unsafe {
        for i in 0..256 {
            assert_eq!(*p.add(i), 0);
        }
        dealloc(p);
    }
}

#[test]
fn test_dealloc_null_is_noop() {
    unsafe { dealloc(ptr::null_mut()) };
}

#[test]
fn test_realloc_preserves_contents() {
    unsafe {
        let p = alloc(40);
        for i in 0..40 {
            *p.add(i) = i as u8;
        }
        // Same class: pointer unchanged.
        let q = realloc(p, 41);
        assert_eq!(q, p);
        // Growth into another class: contents move.
        let r = realloc(q, 4000);
        assert!(!r.is_null());
        for i in 0..40 {
            assert_eq!(*r.add(i), i as u8);
        }
        // Shrink far enough to change class again.
        let s = realloc(r, 16);
        for i in 0..16 {
            assert_eq!(*s.add(i), i as u8);
        }
        dealloc(s);

        assert!(realloc(alloc(8), 0).is_null());
    }
}

#[test]
fn test_global_alloc_adapter_alignment() {
    unsafe {
        for align in [8usize, 16, 64, 256, 4096] {
            let layout = Layout::from_size_align(100, align).unwrap();
            let p = PostAlloc.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "align={align}");
            ptr::write_bytes(p, 1, 100);
            PostAlloc.dealloc(p, layout);
        }

        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = PostAlloc.alloc_zeroed(layout);
        for i in 0..64 {
            assert_eq!(*p.add(i), 0);
        }
        let q = PostAlloc.realloc(p, layout, 1024);
        assert!(!q.is_null());
        PostAlloc.dealloc(q, Layout::from_size_align(1024, 8).unwrap());
    }
}

#[test]
fn test_thread_stats_available() {
    let p = alloc(32);
    let stats = thread_stats().unwrap();
    assert!(stats.small_allocs >= 1);
    unsafe { dealloc(p) };
}

#[test]
fn test_pagemap_abi_record() {
    let (_, config) = pagemap_handle();
    assert_eq!(config.version, 1);
    assert_eq!(config.sizeof_pointer as usize, core::mem::size_of::<usize>());
    assert_eq!(config.granularity_bits, 24);
    assert_eq!(config.entry_size, 1);
    assert_eq!(config.is_flat, cfg!(target_pointer_width = "64"));
}

#[test]
fn test_cross_thread_churn() {
    // Producer/consumer pairs freeing each other's objects through the
    // process heap; exercises the remote path under the public API.
    const ROUNDS: usize = 2000;
    let (to_b, from_a) = mpsc::channel::<usize>();
    let (to_a, from_b) = mpsc::channel::<usize>();

    let b = thread::spawn(move || {
        for p in from_a {
            unsafe { dealloc(p as *mut u8) };
            let q = alloc(56);
            assert!(!q.is_null());
            to_a.send(q as usize).unwrap();
        }
    });

    for _ in 0..ROUNDS {
        let p = alloc(56);
        assert!(!p.is_null());
        unsafe { ptr::write_bytes(p, 0x42, 56) };
        to_b.send(p as usize).unwrap();
        let q = from_b.recv().unwrap();
        unsafe { dealloc(q as *mut u8) };
    }
    drop(to_b);
    b.join().unwrap();
}
