//! Shared fixtures for the integration tests.
//!
//! `Nodes` is a toy object model. Every object is laid out as
//!
//! ```text
//! word 0        number of reference fields n
//! words 1..=n   references
//! word n + 1    an opaque u64 value
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pup_gc::{
    CopyContext, CopyPolicy, CycleStats, GcConfig, Heap, HeapKind, MutatorGuard, ObjectModel,
    ObjectRef, Slot,
};

const WORD: usize = std::mem::size_of::<u64>();

/// Counts the callbacks the collector made into the model.
#[derive(Debug, Default)]
pub struct Counters {
    destroyed: AtomicUsize,
    copied: AtomicUsize,
}

impl Counters {
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn copied(&self) -> usize {
        self.copied.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Nodes {
    pub counters: Arc<Counters>,
}

impl Nodes {
    pub fn new() -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Self {
                counters: Arc::clone(&counters),
            },
            counters,
        )
    }
}

impl ObjectModel for Nodes {
    fn each_reference(&self, object: ObjectRef, visit: &mut dyn FnMut(Slot)) {
        // SAFETY: the collector only asks about live objects.
        let size = unsafe { object.size() };
        if size < 2 * WORD {
            return;
        }
        let fields = field_count(object).min(size / WORD - 2);
        for i in 0..fields {
            // SAFETY: bounded by the payload size above.
            visit(unsafe { object.slot((i + 1) * WORD) });
        }
    }

    fn destroy_instance(&self, _object: ObjectRef) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn gc_copy_instance(&self, object: ObjectRef, ctx: &mut CopyContext<'_>) -> ObjectRef {
        self.counters.copied.fetch_add(1, Ordering::SeqCst);
        ctx.copy_verbatim(object)
    }
}

fn word(object: ObjectRef, index: usize) -> *mut u64 {
    // SAFETY: payloads are 16-byte aligned and callers stay in bounds.
    unsafe { object.as_ptr().cast::<u64>().add(index) }
}

fn field_count(object: ObjectRef) -> usize {
    // SAFETY: word 0 exists in every node.
    unsafe { word(object, 0).read() as usize }
}

/// Allocates a node with `fields` empty references and `value`.
pub fn node(mutator: &MutatorGuard<'_>, fields: usize, value: u64) -> ObjectRef {
    let object = mutator.alloc((fields + 2) * WORD, HeapKind::Object);
    // SAFETY: the payload holds fields + 2 words.
    unsafe {
        word(object, 0).write(fields as u64);
        word(object, fields + 1).write(value);
    }
    object
}

pub fn value(object: ObjectRef) -> u64 {
    // SAFETY: the value word follows the references.
    unsafe { word(object, field_count(object) + 1).read() }
}

pub fn set_field(object: ObjectRef, index: usize, target: Option<ObjectRef>) {
    assert!(index < field_count(object));
    // SAFETY: index checked against the field count.
    unsafe { object.slot((index + 1) * WORD) }.store(target);
}

pub fn field(object: ObjectRef, index: usize) -> Option<ObjectRef> {
    assert!(index < field_count(object));
    // SAFETY: index checked against the field count.
    unsafe { object.slot((index + 1) * WORD) }.load()
}

/// Builds a list of `len` nodes whose values count down from `len - 1` to 0
/// and returns its head.
pub fn list(mutator: &MutatorGuard<'_>, len: u64) -> Option<ObjectRef> {
    let mut head = None;
    for value in 0..len {
        let object = node(mutator, 1, value);
        set_field(object, 0, head);
        head = Some(object);
    }
    head
}

/// Values along the list starting at `head`.
pub fn list_values(head: Option<ObjectRef>) -> Vec<u64> {
    let mut values = Vec::new();
    let mut cursor = head;
    while let Some(object) = cursor {
        values.push(value(object));
        cursor = field(object, 0);
    }
    values
}

/// Allocates unreachable nodes until at least `bytes` of payload are used.
pub fn garbage(mutator: &MutatorGuard<'_>, bytes: usize) -> usize {
    let size = 1024;
    let count = bytes.div_ceil(size);
    for _ in 0..count {
        // Payloads are zeroed, so these are leaves with no references.
        mutator.alloc(size, HeapKind::Object);
    }
    count
}

/// A configuration without the background collector, so that tests decide
/// when cycles run.
pub fn manual_config() -> GcConfig {
    GcConfig::default()
        .with_background_collector(false)
        .with_safepoint_warn_after(Duration::from_secs(5))
}

pub fn manual_config_without_copying() -> GcConfig {
    manual_config().with_copy_policy(CopyPolicy::Disabled)
}

// ============================================================================
// Driving collections for a single mutator
// ============================================================================

/// Lets a mutator ask the test's main thread for a collection.
pub struct Collections {
    requests: Sender<()>,
    done: Receiver<CycleStats>,
}

impl Collections {
    /// Requests one cycle and serves safepoints until it has finished.
    pub fn collect(&self, mutator: &MutatorGuard<'_>) -> CycleStats {
        self.requests.send(()).unwrap();
        loop {
            mutator.safepoint();
            match self.done.try_recv() {
                Ok(stats) => return stats,
                Err(TryRecvError::Empty) => thread::yield_now(),
                Err(TryRecvError::Disconnected) => panic!("collector side went away"),
            }
        }
    }
}

/// Runs `body` as a mutator on a fresh thread. Every collection it requests
/// through [`Collections`] runs on the calling thread.
pub fn with_mutator<R, F>(heap: &Heap, body: F) -> R
where
    R: Send,
    F: FnOnce(&MutatorGuard<'_>, &Collections) -> R + Send,
{
    thread::scope(|scope| {
        let (requests, request_rx) = mpsc::channel();
        let (done_tx, done) = mpsc::channel();
        let worker = scope.spawn(move || {
            let mutator = heap.attach_current_thread().unwrap();
            let collections = Collections { requests, done };
            body(&mutator, &collections)
        });
        for () in request_rx {
            let stats = heap.collect().unwrap();
            if done_tx.send(stats).is_err() {
                break;
            }
        }
        worker.join().unwrap()
    })
}
