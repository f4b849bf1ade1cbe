//! Allocation tests: layout, region hand-off and the large-object limit.

mod common;

use std::process::Command;

use pup_gc::heap::{footprint, LARGE_OBJECT_THRESHOLD, OBJECT_ALIGN, REGION_SIZE};
use pup_gc::{GcError, Heap, HeapKind};

use common::{manual_config, Nodes};

/// Set in the child process of `test_oversized_allocation_aborts`.
const ABORT_CHILD_ENV: &str = "PUP_GC_OVERSIZED_CHILD";

#[test]
fn test_allocations_do_not_overlap() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();

    let mut spans = Vec::new();
    for i in 0..2_000usize {
        let size = (i * 37) % (LARGE_OBJECT_THRESHOLD + 1);
        let object = mutator.alloc(size, HeapKind::Attribute);
        assert_eq!(object.addr() % OBJECT_ALIGN, 0);
        // SAFETY: freshly allocated.
        unsafe {
            assert_eq!(object.size(), size);
            assert_eq!(object.kind(), HeapKind::Attribute);
            std::ptr::write_bytes(object.as_ptr(), (i % 251) as u8, size);
        }
        spans.push((object.addr(), size, (i % 251) as u8));
    }

    for &(addr, size, byte) in &spans {
        // SAFETY: nothing has been collected; each payload holds `size` bytes.
        let payload = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
        assert!(payload.iter().all(|&b| b == byte), "object at {addr:#x} was overwritten");
    }

    spans.sort_unstable();
    for pair in spans.windows(2) {
        let (addr, size, _) = pair[0];
        assert!(addr + size <= pair[1].0, "objects at {addr:#x} and {:#x} overlap", pair[1].0);
    }
}

#[test]
fn test_zero_sized_objects_are_distinct() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();

    let a = mutator.alloc(0, HeapKind::Object);
    let b = mutator.alloc(0, HeapKind::Object);
    assert_ne!(a, b);
    assert_eq!(b.addr() - a.addr(), footprint(0));
}

#[test]
fn test_objects_are_zeroed() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();

    let object = mutator.alloc(256, HeapKind::Object);
    // SAFETY: 256-byte payload.
    let payload = unsafe { std::slice::from_raw_parts(object.as_ptr(), 256) };
    assert!(payload.iter().all(|&b| b == 0));
}

#[test]
fn test_full_regions_move_to_global_list() {
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();
    assert_eq!(heap.global_regions(), 0);

    let per_region = REGION_SIZE / footprint(LARGE_OBJECT_THRESHOLD);
    for _ in 0..per_region * 3 {
        mutator.alloc(LARGE_OBJECT_THRESHOLD, HeapKind::Object);
    }
    assert!(heap.global_regions() >= 2);
    assert!(heap.metrics().total_regions_mapped() >= 3);
}

#[test]
fn test_many_small_objects_then_teardown() {
    let (model, counters) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    {
        let mutator = heap.attach_current_thread().unwrap();
        for _ in 0..100_000 {
            mutator.alloc(13, HeapKind::Object);
        }
    }
    drop(heap);
    assert_eq!(counters.destroyed(), 100_000);
}

#[test]
fn test_free_alloc_requires_attachment() {
    assert!(matches!(
        pup_gc::alloc(16, HeapKind::Object),
        Err(GcError::NotAttached)
    ));

    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();
    let object = pup_gc::alloc(16, HeapKind::Object).unwrap();
    // SAFETY: just allocated.
    assert_eq!(unsafe { object.size() }, 16);
    pup_gc::safepoint_check();
    drop(mutator);

    assert!(matches!(
        pup_gc::alloc(16, HeapKind::Object),
        Err(GcError::NotAttached)
    ));
}

#[test]
#[ignore = "runs as the child process of test_oversized_allocation_aborts"]
fn oversized_allocation_child() {
    if std::env::var_os(ABORT_CHILD_ENV).is_none() {
        return;
    }
    let (model, _) = Nodes::new();
    let heap = Heap::new(manual_config(), model).unwrap();
    let mutator = heap.attach_current_thread().unwrap();
    mutator.alloc(LARGE_OBJECT_THRESHOLD + 1, HeapKind::Object);
}

#[test]
fn test_oversized_allocation_aborts() {
    let output = Command::new(std::env::current_exe().unwrap())
        .args(["oversized_allocation_child", "--exact", "--ignored", "--nocapture"])
        .env(ABORT_CHILD_ENV, "1")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("pup-gc fatal") && stderr.contains("large-object threshold"),
        "unexpected stderr: {stderr}"
    );
}
