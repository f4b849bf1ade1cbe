//! Collection cycles with a single mutator: what survives, what is reclaimed.

mod common;

use pup_gc::heap::REGION_SIZE;
use pup_gc::{Convergence, GcConfig, GcError, Heap, HeapKind};

use common::{
    garbage, list, list_values, manual_config, manual_config_without_copying, node, with_mutator,
    Nodes,
};

#[test]
fn test_reachable_objects_survive() {
    let (model, counters) = Nodes::new();
    let heap = Heap::new(manual_config_without_copying(), model).unwrap();

    with_mutator(&heap, |m, gc| {
        let head = m.root(list(m, 1_000));
        garbage(m, 2 * REGION_SIZE);

        let stats = gc.collect(m);
        assert_eq!(stats.threads_converged, 1);
        assert_eq!(stats.objects_marked, 1_000);
        assert_eq!(stats.live_objects, 1_000);
        assert!(stats.regions_swept >= 2);

        let expected: Vec<u64> = (0..1_000).rev().collect();
        assert_eq!(list_values(head.get()), expected);
    });
    assert!(counters.destroyed() > 0);
}

#[test]
fn test_unreachable_regions_are_reclaimed() {
    let (model, counters) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();

    let stats = with_mutator(&heap, |m, gc| {
        garbage(m, 4 * REGION_SIZE);
        let before = heap.global_regions();
        assert!(before >= 3);

        let stats = gc.collect(m);
        assert_eq!(stats.regions_swept, before);
        assert_eq!(heap.global_regions(), 0);
        stats
    });

    assert_eq!(stats.objects_marked, 0);
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.regions_reclaimed, stats.regions_swept);
    assert_eq!(stats.regions_evacuated, 0);
    assert_eq!(counters.destroyed(), stats.garbage_objects);
}

#[test]
fn test_dead_objects_stay_dead_when_the_mark_flips_back() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config_without_copying(), model).unwrap();

    with_mutator(&heap, |m, gc| {
        let keep = m.root(Some(node(m, 0, 42)));
        garbage(m, REGION_SIZE);

        // Cycle 1 keeps the region for `keep` and finds its neighbours dead.
        let first = gc.collect(m);
        assert_eq!(first.live_objects, 1);
        assert!(first.garbage_objects > 0);

        // Cycle 2 traces with the mark the neighbours were allocated with.
        let second = gc.collect(m);
        assert_ne!(second.mark, first.mark);
        assert_eq!(second.objects_marked, 1);
        assert_eq!(second.live_objects, 1);

        keep.set(None);
        let third = gc.collect(m);
        assert_eq!(third.objects_marked, 0);
        assert_eq!(third.live_objects, 0);
        assert!(third.regions_reclaimed >= 1);
    });
}

/// An unrooted object left in the local region at one cycle must still be
/// dead after the region fills up and the mark has flipped back.
fn local_garbage_stays_dead(config: GcConfig) {
    let (model, counters) = Nodes::new();
    let heap = Heap::new(config, model).unwrap();

    with_mutator(&heap, |m, gc| {
        let _lost = m.alloc(16, HeapKind::Object);
        let first = gc.collect(m);
        assert_eq!(first.objects_marked, 0);

        // Fill the region so it reaches the global list.
        garbage(m, REGION_SIZE);
        assert_eq!(heap.global_regions(), 1);

        let second = gc.collect(m);
        assert_eq!(second.mark, first.mark ^ 1);
        assert_eq!(second.regions_swept, 1);
        assert_eq!(second.live_objects, 0);
        assert_eq!(second.regions_reclaimed, 1);
        assert_eq!(second.regions_evacuated, 0);
        assert_eq!(second.objects_copied, 0);
    });
    assert_eq!(counters.copied(), 0);
}

#[test]
fn test_local_garbage_stays_dead_with_copying() {
    local_garbage_stays_dead(manual_config());
}

#[test]
fn test_local_garbage_stays_dead_without_copying() {
    local_garbage_stays_dead(manual_config_without_copying());
}

#[test]
fn test_local_garbage_stays_dead_concurrent() {
    local_garbage_stays_dead(
        manual_config_without_copying().with_convergence(Convergence::Concurrent),
    );
}

#[test]
fn test_objects_allocated_between_cycles_survive() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config_without_copying(), model).unwrap();

    with_mutator(&heap, |m, gc| {
        let first = gc.collect(m);
        let fresh = node(m, 0, 9);
        let root = m.root(Some(fresh));
        garbage(m, 2 * REGION_SIZE);

        let second = gc.collect(m);
        assert_eq!(second.cycle, first.cycle + 1);
        assert_eq!(root.get().map(common::value), Some(9));
    });
}

#[test]
fn test_collect_from_mutator_is_rejected() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();

    assert!(matches!(heap.collect(), Err(GcError::CollectFromMutator)));

    drop(mutator);
    let stats = heap.collect().unwrap();
    assert_eq!(stats.threads_converged, 0);
}

#[test]
fn test_collect_from_a_mutator_of_another_heap() {
    let (model_a, _) = Nodes::new();
    let (model_b, _) = Nodes::new();
    let a = Heap::new(manual_config(), model_a).unwrap();
    let b = Heap::new(manual_config(), model_b).unwrap();
    let _mutator = a.attach_current_thread().unwrap();

    let stats = b.collect().unwrap();
    assert_eq!(stats.threads_converged, 0);
    assert_eq!(b.cycle_stats(), Some(stats));
}

#[test]
fn test_cycle_stats_track_the_latest_cycle() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    assert_eq!(heap.cycle_stats(), None);

    let first = heap.collect().unwrap();
    let second = heap.collect().unwrap();
    assert_eq!(first.cycle, 1);
    assert_eq!(second.cycle, 2);
    assert_ne!(first.mark, second.mark);
    assert_eq!(heap.cycle_stats(), Some(second));
}
