//! Loom tests for the reference queue.
//!
//! Producers publish segments concurrently; the single consumer must see
//! every entry exactly once.

use std::ptr::NonNull;
use std::sync::Arc;

use pup_gc::{ObjectRef, QueueEntry, RefQueue, SEGMENT_CAPACITY};

fn entry(n: usize) -> QueueEntry {
    let addr = NonNull::new(((n + 1) * 16) as *mut u8).unwrap();
    // SAFETY: never dereferenced; the queue only stores the address.
    QueueEntry::Value(unsafe { ObjectRef::from_raw(addr) })
}

fn drain(queue: &RefQueue) -> Vec<QueueEntry> {
    let mut seen = Vec::new();
    // SAFETY: the calling thread is the only consumer.
    while let Some(segment) = unsafe { queue.pop_segment() } {
        seen.extend_from_slice(segment.entries());
        queue.recycle(segment);
    }
    seen
}

/// Two writers publish concurrently; nothing is lost.
#[test]
#[ignore = "loom test - run with cargo test loom_refqueue --release"]
fn test_concurrent_publish_loses_nothing() {
    loom::model(|| {
        let queue = Arc::new(RefQueue::new());

        let writers: Vec<_> = (0..2)
            .map(|t| {
                let queue = Arc::clone(&queue);
                loom::thread::spawn(move || {
                    let mut writer = queue.writer();
                    writer.push(entry(t * 2));
                    writer.push(entry(t * 2 + 1));
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut seen = drain(&queue);
        seen.sort_by_key(|e| match e {
            QueueEntry::Value(object) => object.addr(),
            QueueEntry::Root(slot) | QueueEntry::Field(slot) => slot.addr(),
        });
        assert_eq!(seen, (0..4).map(entry).collect::<Vec<_>>());
        assert!(queue.is_empty());
    });
}

/// The consumer pops while a writer publishes.
#[test]
#[ignore = "loom test - run with cargo test loom_refqueue --release"]
fn test_pop_during_publish() {
    loom::model(|| {
        let queue = Arc::new(RefQueue::new());

        let writer = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                let mut writer = queue.writer();
                for n in 0..SEGMENT_CAPACITY + 1 {
                    writer.push(entry(n));
                }
                writer.published()
            }
        });

        let early = drain(&queue).len();
        let published = writer.join().unwrap();
        let late = drain(&queue).len();

        assert!(published >= 1);
        assert_eq!(early + late, SEGMENT_CAPACITY + 1);
    });
}
