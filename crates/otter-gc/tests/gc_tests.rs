//! GC correctness tests
//!
//! These tests drive the collector through its public API and check that
//! reachable objects survive young and full collections with their contents
//! intact.

use std::sync::Arc;
use std::time::Duration;

use otter_gc::{
    Collector, GcCause, GcConfig, GcError, HeapLayout, ManualClock, MarkWord, RootHandle, Shape, SizingConfig, SpoolConfig,
};

fn config(young: usize, old: usize) -> GcConfig {
    GcConfig {
        layout: HeapLayout::two_generation(young, old).with_geometry(128, 16),
        sizing: SizingConfig {
            min_young_words: 128,
            max_young_words: young,
            min_old_words: 128,
            max_old_words: old,
            ..SizingConfig::default()
        },
        ..GcConfig::default()
    }
}

fn collector(young: usize, old: usize) -> Collector {
    Collector::with_clock(config(young, old), Arc::new(ManualClock::new())).unwrap()
}

/// Allocate an object with `refs` reference fields and one payload word
fn node(gc: &mut Collector, refs: u32, value: u64) -> otter_gc::Address {
    let obj = gc.allocate(Shape::new(refs, 1)).unwrap();
    gc.set_raw(obj, 0, value);
    obj
}

#[test]
fn test_young_collection_promotes_reachable_graph() {
    let mut gc = collector(512, 1024);
    let a = node(&mut gc, 1, 1);
    let b = node(&mut gc, 0, 2);
    let _garbage = node(&mut gc, 0, 3);
    gc.write_ref(a, 0, Some(b)).unwrap();
    let root = gc.root(a);

    gc.collect(GcCause::AllocationFailure).unwrap();

    assert_eq!(gc.stats().young_collections, 1);
    assert_eq!(gc.stats().full_collections, 0);
    let heap = gc.heap();
    assert_eq!(heap.generation(heap.young()).used_words(), 0);

    let a = gc.resolve(root);
    let b = gc.read_ref(a, 0).unwrap();
    assert_eq!(gc.heap().generation_of(a), Some(gc.heap().old()));
    assert_eq!(gc.heap().generation_of(b), Some(gc.heap().old()));
    assert_eq!(gc.raw(a, 0), 1);
    assert_eq!(gc.raw(b, 0), 2);
    assert_eq!(gc.stats().promoted_words, 7);
    assert!(gc.verify().is_ok());
}

#[test]
fn test_write_barrier_keeps_young_object_alive() {
    let mut gc = collector(512, 1024);
    let holder = node(&mut gc, 1, 10);
    let root = gc.root(holder);
    // Moves the holder into the old generation
    gc.collect(GcCause::Explicit).unwrap();
    let holder = gc.resolve(root);
    assert_eq!(gc.heap().generation_of(holder), Some(gc.heap().old()));

    let child = node(&mut gc, 0, 20);
    gc.write_ref(holder, 0, Some(child)).unwrap();
    assert_eq!(gc.remembered_sets().occupied_cards(), 1);

    gc.collect(GcCause::AllocationFailure).unwrap();

    let child = gc.read_ref(holder, 0).unwrap();
    assert_eq!(gc.heap().generation_of(child), Some(gc.heap().old()));
    assert_eq!(gc.raw(child, 0), 20);
    assert_eq!(gc.remembered_sets().occupied_cards(), 0);
}

#[test]
fn test_old_to_old_store_is_not_remembered() {
    let mut gc = collector(512, 1024);
    let a = node(&mut gc, 1, 1);
    let b = node(&mut gc, 0, 2);
    let ra = gc.root(a);
    let rb = gc.root(b);
    gc.collect(GcCause::Explicit).unwrap();

    let (a, b) = (gc.resolve(ra), gc.resolve(rb));
    gc.write_ref(a, 0, Some(b)).unwrap();
    assert_eq!(gc.remembered_sets().occupied_cards(), 0);
}

#[test]
fn test_promotion_failure_falls_back_to_full_collection() {
    let mut gc = collector(256, 128);
    // 20 linked nodes of 10 words; only 12 fit into the old generation
    let mut head = None;
    for i in 0..20 {
        let obj = gc.allocate(Shape::new(1, 7)).unwrap();
        gc.set_raw(obj, 0, i);
        gc.write_ref(obj, 0, head).unwrap();
        head = Some(obj);
    }
    let root = gc.root(head.unwrap());

    gc.collect(GcCause::AllocationFailure).unwrap();

    assert_eq!(gc.stats().promotion_failures, 1);
    assert_eq!(gc.stats().full_collections, 1);
    assert!(!gc.is_poisoned());
    assert_eq!(gc.heap().used_words(), 200);

    let mut cursor = Some(gc.resolve(root));
    let mut expected = 20;
    while let Some(obj) = cursor {
        expected -= 1;
        assert_eq!(gc.raw(obj, 0), expected);
        cursor = gc.read_ref(obj, 0);
    }
    assert_eq!(expected, 0);
    assert!(gc.verify().is_ok());
}

#[test]
fn test_explicit_collection_compacts_to_bottom() {
    let mut gc = collector(512, 1024);
    let a = node(&mut gc, 0, 1);
    let _ = node(&mut gc, 0, 0);
    let b = node(&mut gc, 0, 2);
    let _ = node(&mut gc, 0, 0);
    let ra = gc.root(a);
    let rb = gc.root(b);

    gc.collect(GcCause::Explicit).unwrap();

    let old = gc.heap().generation(gc.heap().old());
    let bottom = old.bottom();
    assert_eq!(old.used_words(), 6);
    assert_eq!(gc.resolve(ra), bottom);
    assert_eq!(gc.resolve(rb), bottom.offset(3));
    assert_eq!(gc.raw(gc.resolve(rb), 0), 2);
    assert_eq!(gc.stats().last_reclaimed_words, 6);
}

#[test]
fn test_weak_reference_cleared_when_unreachable() {
    let mut gc = collector(512, 1024);
    let dead = node(&mut gc, 0, 1);
    let live = node(&mut gc, 0, 2);
    let root = gc.root(live);
    let weak_dead = gc.weak_ref(dead);
    let weak_live = gc.weak_ref(live);

    gc.collect(GcCause::AllocationFailure).unwrap();

    assert_eq!(gc.resolve_weak(weak_dead), None);
    assert_eq!(gc.resolve_weak(weak_live), Some(gc.resolve(root)));

    gc.unroot(root);
    gc.collect(GcCause::Explicit).unwrap();
    assert_eq!(gc.resolve_weak(weak_live), None);
}

#[test]
fn test_identity_hash_survives_collections() {
    let mut gc = collector(512, 1024);
    let obj = node(&mut gc, 0, 5);
    let hashed = MarkWord::Neutral { hash: 77, age: 0 };
    gc.set_header(obj, hashed);
    let root = gc.root(obj);

    gc.collect(GcCause::AllocationFailure).unwrap();
    assert_eq!(gc.header(gc.resolve(root)), hashed);

    gc.collect(GcCause::Explicit).unwrap();
    assert_eq!(gc.header(gc.resolve(root)), hashed);
    assert_eq!(gc.raw(gc.resolve(root), 0), 5);
}

#[test]
fn test_oversized_allocation_is_out_of_memory() {
    let mut gc = collector(256, 256);
    let err = gc.allocate(Shape::new(0, 300)).unwrap_err();
    assert_eq!(err, GcError::OutOfMemory { size_words: 302 });
    assert!(!gc.is_poisoned());
    assert!(gc.allocate(Shape::new(0, 1)).is_ok());
}

#[test]
fn test_stats_accumulate() {
    let mut gc = collector(256, 1024);
    for _ in 0..10 {
        gc.allocate(Shape::new(0, 8)).unwrap();
    }
    assert_eq!(gc.stats().allocated_words, 100);
    gc.collect(GcCause::AllocationFailure).unwrap();
    gc.collect(GcCause::Explicit).unwrap();
    let stats = gc.stats();
    assert_eq!(stats.young_collections, 1);
    assert_eq!(stats.full_collections, 1);
    assert!(stats.total_pause >= stats.last_pause);
}

#[test]
fn test_recommended_sizes_stay_within_bounds() {
    let clock = Arc::new(ManualClock::new());
    let mut gc = Collector::with_clock(config(512, 2048), clock.clone()).unwrap();
    let keep = node(&mut gc, 0, 0);
    gc.root(keep);
    for i in 0..2000 {
        node(&mut gc, 0, i);
        clock.advance(Duration::from_micros(50));
    }
    assert!(gc.stats().young_collections > 0);
    let sizing = &gc.config().sizing;
    let young = gc.recommended_young_size();
    let old = gc.recommended_old_size();
    assert!((sizing.min_young_words..=sizing.max_young_words).contains(&young));
    assert!((sizing.min_old_words..=sizing.max_old_words).contains(&old));
    assert!(gc.young_limit() <= 512);
}

#[test]
fn test_heap_verifies_across_many_cycles() {
    const SLOTS: usize = 8;
    let mut gc = collector(512, 2048);
    let table = gc.allocate(Shape::new(4, 0)).unwrap();
    let table_root = gc.root(table);

    let mut slots: Vec<(RootHandle, u64)> = Vec::new();
    for i in 0..SLOTS as u64 {
        let obj = node(&mut gc, 2, i);
        slots.push((gc.root(obj), i));
    }

    for i in SLOTS as u64..3000 {
        let obj = node(&mut gc, 2, i);
        let slot = i as usize % SLOTS;
        let neighbour = gc.resolve(slots[(slot + 3) % SLOTS].0);
        gc.write_ref(obj, 0, Some(neighbour)).unwrap();

        let table = gc.resolve(table_root);
        gc.write_ref(table, (i % 4) as usize, Some(obj)).unwrap();

        // Cut the replaced node loose so live chains stay short
        let (handle, _) = slots[slot];
        let replaced = gc.resolve(handle);
        gc.write_ref(replaced, 0, None).unwrap();
        gc.unroot(handle);
        slots[slot] = (gc.root(obj), i);

        if i % 100 == 0 {
            assert!(gc.verify().is_ok());
            for (handle, value) in &slots {
                assert_eq!(gc.raw(gc.resolve(*handle), 0), *value);
            }
        }
    }

    assert!(gc.stats().young_collections > 10);
    assert!(!gc.is_poisoned());
    gc.collect(GcCause::Explicit).unwrap();
    assert!(gc.verify().is_ok());
}

#[test]
fn test_hashed_headers_survive_small_spool_blocks() {
    let mut config = config(512, 2048);
    config.spool = SpoolConfig {
        block_capacity: 2,
        scratch_blocks: 1,
        max_blocks: None,
    };
    let mut gc = Collector::with_clock(config, Arc::new(ManualClock::new())).unwrap();

    for round in 0..4u32 {
        // a hashed linked list, promoted one link at a time
        let mut head = None;
        for i in 0..9u32 {
            let obj = node(&mut gc, 1, i as u64);
            gc.set_header(obj, MarkWord::Neutral { hash: round * 100 + i + 1, age: 0 });
            gc.write_ref(obj, 0, head).unwrap();
            head = Some(obj);
        }
        let root = gc.root(head.unwrap());
        gc.collect(GcCause::AllocationFailure).unwrap();

        let mut cursor = Some(gc.resolve(root));
        let mut expected = 9;
        while let Some(obj) = cursor {
            expected -= 1;
            assert_eq!(gc.header(obj), MarkWord::Neutral { hash: round * 100 + expected + 1, age: 0 });
            assert_eq!(gc.raw(obj, 0), expected as u64);
            cursor = gc.read_ref(obj, 0);
        }
        assert_eq!(expected, 0);
        gc.unroot(root);
    }
    assert_eq!(gc.stats().young_collections, 4);
    assert!(gc.promotion_tracker().no_promotions());
    assert!(gc.verify().is_ok());
}

#[test]
fn test_verify_reports_interior_pointer() {
    let mut gc = collector(512, 1024);
    let a = node(&mut gc, 1, 1);
    gc.write_ref(a, 0, Some(a.offset(1))).unwrap();
    let err = gc.verify().unwrap_err();
    assert!(matches!(err, GcError::HeapCorrupted(_)));
}
