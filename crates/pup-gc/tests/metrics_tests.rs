//! Integration tests for cycle statistics and cumulative heap metrics.

mod common;

use std::time::Duration;

use pup_gc::heap::REGION_SIZE;
use pup_gc::Heap;

use common::{garbage, manual_config, node, with_mutator, Nodes};

/// Phase times never add up to more than the whole cycle.
#[test]
fn test_phase_times_within_duration() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();

    let stats = with_mutator(&heap, |m, gc| {
        let _root = m.root(Some(node(m, 0, 1)));
        garbage(m, 3 * REGION_SIZE);
        gc.collect(m)
    });

    let phases = stats.phases;
    let total = phases.converge + phases.trace + phases.copy + phases.sweep;
    assert!(
        total <= stats.duration + Duration::from_micros(100),
        "phases ({total:?}) exceed the cycle ({:?})",
        stats.duration
    );
}

#[test]
fn test_totals_accumulate_over_cycles() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();

    let all = with_mutator(&heap, |m, gc| {
        let _root = m.root(Some(node(m, 0, 1)));
        (0..3)
            .map(|_| {
                garbage(m, 2 * REGION_SIZE);
                gc.collect(m)
            })
            .collect::<Vec<_>>()
    });

    let metrics = heap.metrics();
    assert_eq!(metrics.total_cycles(), 3);
    assert_eq!(metrics.total_attaches(), 1);
    assert_eq!(
        metrics.total_regions_reclaimed(),
        all.iter().map(|s| s.regions_reclaimed).sum::<usize>()
    );
    assert_eq!(
        metrics.total_regions_evacuated(),
        all.iter().map(|s| s.regions_evacuated).sum::<usize>()
    );
    assert_eq!(
        metrics.total_objects_copied(),
        all.iter().map(|s| s.objects_copied).sum::<usize>()
    );
    assert_eq!(
        metrics.total_garbage_objects(),
        all.iter().map(|s| s.garbage_objects).sum::<usize>()
    );
    assert!(metrics.total_regions_reclaimed() >= 3);
    assert!(metrics.total_cycle_time() >= all.iter().map(|s| s.duration).sum::<Duration>());
    assert_eq!(metrics.history(), all);
}

#[test]
fn test_regions_mapped_counts_attach_and_refills() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    assert_eq!(heap.metrics().total_regions_mapped(), 0);

    let mutator = heap.attach_current_thread().unwrap();
    assert_eq!(heap.metrics().total_regions_mapped(), 1);
    garbage(&mutator, 3 * REGION_SIZE);
    assert!(heap.metrics().total_regions_mapped() >= 4);
}
