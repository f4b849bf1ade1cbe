//! Heaps that walk mutator stacks at safepoints.
//!
//! Rust frames carry no stack maps, so every frame a walk meets here is
//! unmapped and skipped; shadow roots still have to come through.

mod common;

use std::sync::Arc;

use pup_gc::heap::REGION_SIZE;
use pup_gc::stack::{scan_frames, BacktraceCursor, Safepoint, StackMap, StackMapRegistry};
use pup_gc::Heap;

use common::{garbage, list, list_values, manual_config, with_mutator, Nodes};

fn registry_with_foreign_map() -> Arc<StackMapRegistry> {
    let registry = StackMapRegistry::new();
    registry.insert(
        "pup_main",
        StackMap::new(vec![Safepoint {
            address: 0x1000,
            frame_size: 32,
            live_offsets: vec![8, 16],
        }]),
    );
    Arc::new(registry)
}

#[test]
fn test_walk_skips_unmapped_frames() {
    let maps = registry_with_foreign_map();
    assert!(!maps.is_empty());

    let mut cursor = BacktraceCursor::capture();
    assert!(cursor.depth() > 0);
    let mut slots = Vec::new();
    let mapped = scan_frames(&mut cursor, maps.as_ref(), &mut |slot| slots.push(slot)).unwrap();
    assert_eq!(mapped, 0);
    assert!(slots.is_empty());
}

#[test]
fn test_heap_with_stack_maps_keeps_shadow_roots() {
    let (model, _) = Nodes::new();
    let heap = Heap::with_stack_maps(manual_config(), model, registry_with_foreign_map()).unwrap();

    with_mutator(&heap, |m, gc| {
        let head = m.root(list(m, 100));
        garbage(m, 2 * REGION_SIZE);

        let stats = gc.collect(m);
        assert_eq!(stats.objects_marked, 100);
        assert_eq!(list_values(head.get()).len(), 100);
    });
}

#[cfg(unix)]
#[test]
fn test_heap_with_symbol_stack_maps() {
    use pup_gc::stack::SymbolStackMaps;

    let (model, _) = Nodes::new();
    let heap =
        Heap::with_stack_maps(manual_config(), model, Arc::new(SymbolStackMaps::new())).unwrap();

    with_mutator(&heap, |m, gc| {
        let head = m.root(list(m, 10));
        for _ in 0..3 {
            gc.collect(m);
        }
        assert_eq!(list_values(head.get()), (0..10).rev().collect::<Vec<u64>>());
    });
}
