//! Collection statistics.
//!
//! Everything here is observational: the collector records into it but never
//! reads it back to make a decision.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Cycle id, starting at 1.
    pub cycle: u64,
    /// Mark value the cycle traced with.
    pub mark: u8,
    /// Mutators that met the collector at a safepoint.
    pub threads_converged: usize,
    /// Slow-safepoint warnings logged while converging.
    pub safepoint_timeouts: u32,
    /// Objects marked by the trace.
    pub objects_marked: usize,
    /// Marked objects in the regions examined by the sweep.
    pub live_objects: usize,
    /// Unmarked objects in the regions examined by the sweep.
    pub garbage_objects: usize,
    /// Regions examined by the sweep.
    pub regions_swept: usize,
    /// Regions unmapped because nothing in them was marked.
    pub regions_reclaimed: usize,
    /// Sparse regions whose survivors were copied out.
    pub regions_evacuated: usize,
    /// Objects copied out of evacuated regions.
    pub objects_copied: usize,
    /// Total cycle duration.
    pub duration: Duration,
    /// Per-phase durations.
    pub phases: PhaseTimes,
}

/// Wall-clock time spent in each phase of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimes {
    /// Requesting and awaiting every mutator's safepoint.
    pub converge: Duration,
    /// Draining the reference queue.
    pub trace: Duration,
    /// Evacuating sparse regions and fixing references.
    pub copy: Duration,
    /// Classifying and reclaiming regions.
    pub sweep: Duration,
}

/// Captures phase durations for one cycle.
#[derive(Debug)]
pub(crate) struct PhaseTimer {
    started: Instant,
    current: Instant,
    times: PhaseTimes,
}

impl PhaseTimer {
    pub(crate) fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            current: now,
            times: PhaseTimes::default(),
        }
    }

    fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.current;
        self.current = now;
        elapsed
    }

    pub(crate) fn end_converge(&mut self) {
        self.times.converge = self.lap();
    }

    pub(crate) fn end_trace(&mut self) {
        self.times.trace = self.lap();
    }

    pub(crate) fn end_copy(&mut self) {
        self.times.copy = self.lap();
    }

    pub(crate) fn end_sweep(&mut self) {
        self.times.sweep = self.lap();
    }

    pub(crate) fn finish(self) -> (Duration, PhaseTimes) {
        (self.started.elapsed(), self.times)
    }
}

/// Cycles kept in [`HeapMetrics::history`].
const HISTORY_SIZE: usize = 64;

/// Cumulative statistics of one heap.
#[derive(Debug)]
pub struct HeapMetrics {
    cycles: AtomicU64,
    attaches: AtomicUsize,
    regions_mapped: AtomicUsize,
    regions_reclaimed: AtomicUsize,
    regions_evacuated: AtomicUsize,
    objects_copied: AtomicUsize,
    garbage_objects: AtomicUsize,
    safepoint_timeouts: AtomicU64,
    pause_ns: AtomicU64,
    history: Mutex<VecDeque<CycleStats>>,
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            attaches: AtomicUsize::new(0),
            regions_mapped: AtomicUsize::new(0),
            regions_reclaimed: AtomicUsize::new(0),
            regions_evacuated: AtomicUsize::new(0),
            objects_copied: AtomicUsize::new(0),
            garbage_objects: AtomicUsize::new(0),
            safepoint_timeouts: AtomicU64::new(0),
            pause_ns: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record_attach(&self) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_region_mapped(&self) {
        self.regions_mapped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle(&self, stats: &CycleStats) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.regions_reclaimed
            .fetch_add(stats.regions_reclaimed, Ordering::Relaxed);
        self.regions_evacuated
            .fetch_add(stats.regions_evacuated, Ordering::Relaxed);
        self.objects_copied
            .fetch_add(stats.objects_copied, Ordering::Relaxed);
        self.garbage_objects
            .fetch_add(stats.garbage_objects, Ordering::Relaxed);
        self.safepoint_timeouts
            .fetch_add(u64::from(stats.safepoint_timeouts), Ordering::Relaxed);
        let pause = u64::try_from(stats.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(pause, Ordering::Relaxed);

        let mut history = self.history.lock();
        if history.len() == HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(*stats);
    }

    /// Completed collection cycles.
    #[inline]
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Threads that ever attached.
    #[inline]
    #[must_use]
    pub fn total_attaches(&self) -> usize {
        self.attaches.load(Ordering::Relaxed)
    }

    /// Regions mapped for mutators. Copy targets are not counted.
    #[inline]
    #[must_use]
    pub fn total_regions_mapped(&self) -> usize {
        self.regions_mapped.load(Ordering::Relaxed)
    }

    /// Regions reclaimed because nothing in them was marked.
    #[inline]
    #[must_use]
    pub fn total_regions_reclaimed(&self) -> usize {
        self.regions_reclaimed.load(Ordering::Relaxed)
    }

    /// Regions emptied by evacuation.
    #[inline]
    #[must_use]
    pub fn total_regions_evacuated(&self) -> usize {
        self.regions_evacuated.load(Ordering::Relaxed)
    }

    /// Objects moved by the copy phase.
    #[inline]
    #[must_use]
    pub fn total_objects_copied(&self) -> usize {
        self.objects_copied.load(Ordering::Relaxed)
    }

    /// Unmarked objects found by the sweep.
    #[inline]
    #[must_use]
    pub fn total_garbage_objects(&self) -> usize {
        self.garbage_objects.load(Ordering::Relaxed)
    }

    /// Slow-safepoint warnings.
    #[inline]
    #[must_use]
    pub fn total_safepoint_timeouts(&self) -> u64 {
        self.safepoint_timeouts.load(Ordering::Relaxed)
    }

    /// Total time spent in cycles.
    #[inline]
    #[must_use]
    pub fn total_cycle_time(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Statistics of the most recent cycles, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<CycleStats> {
        self.history.lock().iter().copied().collect()
    }
}
