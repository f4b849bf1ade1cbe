//! Collector-global state: the mark value, the cycle counter and the
//! reference queue.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::gc::refqueue::RefQueue;

/// State written only by the collector (under the cycle lock) and read by
/// mutators and the signal handler.
pub(crate) struct GcState {
    mark: AtomicU8,
    cycle: AtomicU64,
    pub(crate) queue: RefQueue,
}

impl GcState {
    pub(crate) fn new(retry_limit: u32) -> Self {
        Self {
            mark: AtomicU8::new(0),
            cycle: AtomicU64::new(0),
            queue: RefQueue::with_retry_limit(retry_limit),
        }
    }

    /// The mark value of the current (or last) cycle.
    pub(crate) fn mark(&self) -> u8 {
        self.mark.load(Ordering::Acquire)
    }

    /// Id of the current (or last) cycle; 0 before the first.
    pub(crate) fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Starts a cycle: bumps the id and flips the mark. Both are published
    /// before any stop request of the cycle goes out.
    pub(crate) fn begin_cycle(&self) -> (u64, u8) {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let mark = self.mark.fetch_xor(1, Ordering::SeqCst) ^ 1;
        (cycle, mark)
    }
}
