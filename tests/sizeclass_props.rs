//! Property tests for the size-class tables and the pagemap.

use proptest::prelude::*;

use postalloc::config::*;
use postalloc::pagemap::{kind, FlatPagemap, PagemapStore, PagemapTree};
use postalloc::pal::DefaultPal;
use postalloc::round_size;
use postalloc::sizeclass::*;

proptest! {
    #[test]
    fn prop_size_class_round_trip(size in 1usize..SUPERSLAB_SIZE) {
        let sc = size_to_sizeclass(size);
        prop_assert!(sc < NUM_SIZECLASSES);
        let class_size = sizeclass_to_size(sc);
        prop_assert!(class_size >= size);
        prop_assert_eq!(size_to_sizeclass(class_size), sc);
    }

    #[test]
    fn prop_class_size_round_trip(sc in 0usize..NUM_SIZECLASSES) {
        prop_assert_eq!(size_to_sizeclass(sizeclass_to_size(sc)), sc);
    }

    #[test]
    fn prop_alignment_divides_size(sc in 0usize..NUM_SIZECLASSES) {
        let size = sizeclass_to_size(sc);
        let align = sizeclass_to_alignment(sc);
        prop_assert!(align >= MIN_ALLOC_SIZE);
        prop_assert_eq!(size % align, 0);
    }

    #[test]
    fn prop_round_size_covers(size in 1usize..(1usize << 30)) {
        let rounded = round_size(size);
        prop_assert!(rounded >= size);
        // Rounding is idempotent.
        prop_assert_eq!(round_size(rounded), rounded);
    }

    #[test]
    fn prop_divisibility_matches_modulo(sc in 0usize..NUM_SIZECLASSES, rel in 0usize..SUPERSLAB_SIZE) {
        let size = sizeclass_to_size(sc);
        prop_assert_eq!(is_start_of_object(sc, rel), rel % size == 0);
    }

    #[test]
    fn prop_index_matches_division(sc in 0usize..NUM_SIZECLASSES, rel in 0usize..SUPERSLAB_SIZE) {
        let size = sizeclass_to_size(sc);
        prop_assert_eq!(index_in_class(sc, rel), rel / size);
    }

    #[test]
    fn prop_classes_are_monotone(sc in 0usize..NUM_SIZECLASSES - 1) {
        prop_assert!(sizeclass_to_size(sc) < sizeclass_to_size(sc + 1));
    }
}

fn flat() -> &'static FlatPagemap {
    use std::sync::OnceLock;
    static MAP: OnceLock<FlatPagemap> = OnceLock::new();
    MAP.get_or_init(|| {
        let pm = FlatPagemap::new();
        pm.init::<DefaultPal>();
        pm
    })
}

fn tree() -> &'static PagemapTree {
    use std::sync::OnceLock;
    static MAP: OnceLock<PagemapTree> = OnceLock::new();
    MAP.get_or_init(PagemapTree::new::<DefaultPal>)
}

proptest! {
    #[test]
    fn prop_flat_pagemap_set_get(granule in 0usize..(1 << 20), value in 1u8..64) {
        let pm = flat();
        let addr = granule << SUPERSLAB_BITS;
        pm.set(addr, value);
        prop_assert_eq!(pm.get(addr), value);
        prop_assert_eq!(pm.get(addr + SUPERSLAB_SIZE / 2), value);
        pm.set(addr, kind::NOT_OURS);
    }

    #[test]
    fn prop_tree_pagemap_set_range(granule in 0usize..(1 << 20), count in 1usize..16, value in 1u8..64) {
        let pm = tree();
        let addr = granule << SUPERSLAB_BITS;
        pm.set_range(addr, value, count);
        for k in 0..count {
            prop_assert_eq!(pm.get(addr + (k << SUPERSLAB_BITS)), value);
        }
        pm.set_range(addr, kind::NOT_OURS, count);
    }
}
