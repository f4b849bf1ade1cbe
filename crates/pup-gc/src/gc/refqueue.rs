//! Segmented lock-free reference queue.
//!
//! Producers (mutators scanning their roots, the tracer visiting object
//! fields) fill a private [`Segment`] through a [`QueueWriter`] and publish
//! it once it is full. The collector pops whole segments. Segments are
//! recycled through a bounded pool instead of going back to the allocator.

use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicPtr;

use crossbeam_queue::ArrayQueue;

use crate::error::fatal;
use crate::heap::{ObjectRef, Slot};
use crate::lockfree::{Linked, TreiberStack};

/// Entries per segment.
pub const SEGMENT_CAPACITY: usize = 200;

/// Segments kept for reuse.
const POOL_CAPACITY: usize = 64;

/// One unit of tracing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntry {
    /// A root slot (stack or shadow root). Its address is kept so the copy
    /// phase can rewrite it.
    Root(Slot),
    /// A reference field of a heap object.
    Field(Slot),
    /// A reference captured by value, for roots whose slot may change once
    /// the mutator resumes.
    Value(ObjectRef),
}

/// A fixed-capacity batch of queue entries.
pub struct Segment {
    next: AtomicPtr<Segment>,
    len: usize,
    entries: [MaybeUninit<QueueEntry>; SEGMENT_CAPACITY],
}

impl Linked for Segment {
    fn link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

impl Segment {
    fn new() -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            len: 0,
            entries: [MaybeUninit::uninit(); SEGMENT_CAPACITY],
        })
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the segment holds no entry.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` once no further entry fits.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len == SEGMENT_CAPACITY
    }

    fn push(&mut self, entry: QueueEntry) {
        if self.is_full() {
            fatal!("reference queue segment {:p} has no free space", self);
        }
        self.entries[self.len].write(entry);
        self.len += 1;
    }

    /// The entries, in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[QueueEntry] {
        // SAFETY: the first `len` entries are initialized and `QueueEntry`
        // is `Copy`, so `MaybeUninit<QueueEntry>` has the same layout.
        unsafe { std::slice::from_raw_parts(self.entries.as_ptr().cast(), self.len) }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment").field("len", &self.len).finish()
    }
}

/// The shared queue of published segments.
pub struct RefQueue {
    segments: TreiberStack<Segment>,
    pool: ArrayQueue<Box<Segment>>,
}

impl fmt::Debug for RefQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefQueue")
            .field("empty", &self.is_empty())
            .field("pooled", &self.pool.len())
            .finish()
    }
}

impl Default for RefQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RefQueue {
    /// Creates an empty queue with the default retry limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retry_limit(1000)
    }

    /// Creates an empty queue whose push/pop loops abort after `limit`
    /// failed compare-and-swap attempts.
    #[must_use]
    pub fn with_retry_limit(limit: u32) -> Self {
        Self {
            segments: TreiberStack::new("reference queue", limit),
            pool: ArrayQueue::new(POOL_CAPACITY),
        }
    }

    /// Returns `true` if no published segment is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Starts a producer with its own private segment.
    #[must_use]
    pub const fn writer(&self) -> QueueWriter<'_> {
        QueueWriter {
            queue: self,
            current: None,
            published: 0,
        }
    }

    fn fresh_segment(&self) -> Box<Segment> {
        self.pool.pop().unwrap_or_else(Segment::new)
    }

    fn publish(&self, segment: Box<Segment>) {
        let segment = NonNull::from(Box::leak(segment));
        // SAFETY: the segment was just leaked from its box and is on no stack.
        unsafe { self.segments.push(segment) };
    }

    /// Pops one published segment.
    ///
    /// # Safety
    ///
    /// At most one thread may pop at a time. The collector is the only
    /// consumer of a heap's queue.
    pub unsafe fn pop_segment(&self) -> Option<Box<Segment>> {
        // SAFETY: single consumer, forwarded from the caller; every node on
        // the stack was leaked from a `Box<Segment>` by `publish`.
        unsafe { self.segments.pop() }.map(|node| unsafe { Box::from_raw(node.as_ptr()) })
    }

    /// Returns a drained segment to the pool.
    pub fn recycle(&self, mut segment: Box<Segment>) {
        segment.len = 0;
        *segment.next.get_mut() = ptr::null_mut();
        // A full pool just drops the segment.
        let _ = self.pool.push(segment);
    }
}

impl Drop for RefQueue {
    fn drop(&mut self) {
        for node in self.segments.take_all() {
            // SAFETY: every node was leaked from a box by `publish`.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

/// A producer's handle: fills a private segment and publishes it when full.
/// Dropping the writer publishes whatever is left.
pub struct QueueWriter<'q> {
    queue: &'q RefQueue,
    current: Option<Box<Segment>>,
    published: usize,
}

impl fmt::Debug for QueueWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWriter")
            .field("pending", &self.current.as_ref().map_or(0, |s| s.len()))
            .field("published", &self.published)
            .finish()
    }
}

impl QueueWriter<'_> {
    /// Appends an entry, publishing the private segment once it fills up.
    pub fn push(&mut self, entry: QueueEntry) {
        let segment = self
            .current
            .get_or_insert_with(|| self.queue.fresh_segment());
        segment.push(entry);
        if segment.is_full() {
            self.flush();
        }
    }

    /// Publishes the private segment if it holds anything.
    pub fn flush(&mut self) {
        match self.current.take() {
            Some(segment) if !segment.is_empty() => {
                self.published += 1;
                self.queue.publish(segment);
            }
            Some(segment) => self.current = Some(segment),
            None => {}
        }
    }

    /// Number of segments published so far.
    #[must_use]
    pub const fn published(&self) -> usize {
        self.published
    }

    /// Takes the unpublished segment, if it holds anything. The tracer uses
    /// this to keep working on its own output without a round trip through
    /// the shared stack.
    pub(crate) fn take_pending(&mut self) -> Option<Box<Segment>> {
        self.current.take_if(|segment| !segment.is_empty())
    }
}

impl Drop for QueueWriter<'_> {
    fn drop(&mut self) {
        self.flush();
        if let Some(segment) = self.current.take() {
            self.queue.recycle(segment);
        }
    }
}
