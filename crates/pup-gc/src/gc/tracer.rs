//! Heap tracer: drains the reference queue to closure.

use crate::gc::refqueue::{QueueEntry, QueueWriter, RefQueue, Segment};
use crate::heap::{ObjectRef, Slot};
use crate::model::ObjectModel;

/// Drains a [`RefQueue`], marking every reachable object with `mark`.
///
/// The order in which segments come off the queue is arbitrary; marking is
/// idempotent, so duplicate entries and cycles are harmless.
pub(crate) struct Tracer<'a> {
    model: &'a dyn ObjectModel,
    queue: &'a RefQueue,
    writer: QueueWriter<'a>,
    mark: u8,
    roots: Vec<Slot>,
    marked: usize,
}

impl<'a> Tracer<'a> {
    pub(crate) const fn new(model: &'a dyn ObjectModel, queue: &'a RefQueue, mark: u8) -> Self {
        Self {
            model,
            queue,
            writer: queue.writer(),
            mark,
            roots: Vec::new(),
            marked: 0,
        }
    }

    /// Processes segments until neither the shared queue nor the tracer's
    /// own pending segment holds anything.
    ///
    /// Must only run on the heap's collector (the queue's single consumer).
    pub(crate) fn drain(&mut self) {
        loop {
            // SAFETY: the collector is the only consumer of the queue.
            let segment =
                unsafe { self.queue.pop_segment() }.or_else(|| self.writer.take_pending());
            let Some(segment) = segment else { break };
            self.scan_segment(&segment);
            self.queue.recycle(segment);
        }
    }

    fn scan_segment(&mut self, segment: &Segment) {
        for &entry in segment.entries() {
            let object = match entry {
                QueueEntry::Root(slot) => {
                    self.roots.push(slot);
                    slot.load()
                }
                QueueEntry::Field(slot) => slot.load(),
                QueueEntry::Value(object) => Some(object),
            };
            if let Some(object) = object {
                self.scan_object(object);
            }
        }
    }

    /// Marks `object` and, if it was not marked yet, queues its references.
    pub(crate) fn scan_object(&mut self, object: ObjectRef) -> bool {
        if !object.mark_reachable(self.mark) {
            return false;
        }
        self.marked += 1;
        let writer = &mut self.writer;
        self.model
            .each_reference(object, &mut |slot| writer.push(QueueEntry::Field(slot)));
        true
    }

    /// Objects newly marked by this tracer.
    pub(crate) const fn marked(&self) -> usize {
        self.marked
    }

    /// Root slots seen during the drain, for the copy phase.
    pub(crate) fn into_roots(self) -> Vec<Slot> {
        self.roots
    }
}
