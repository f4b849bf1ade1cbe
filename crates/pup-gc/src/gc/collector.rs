//! The collection cycle and the background collector thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::GcError;
use crate::gc::copy;
use crate::gc::sweep;
use crate::gc::tracer::Tracer;
use crate::heap::Shared;
use crate::metrics::{CycleStats, PhaseTimer};
use crate::safepoint::{self, GateRelease};
use crate::thread::ThreadInfo;
use crate::tracing::{cycle_span, log_phase_end, log_slow_safepoint, phase_span, GcPhase};

// ============================================================================
// Cycle
// ============================================================================

/// Runs one full collection cycle on the calling thread.
///
/// Cycles are serialized by the heap's cycle lock, which also keeps threads
/// from attaching or detaching mid-cycle.
pub(crate) fn run_cycle(heap: &Shared) -> CycleStats {
    let _cycle_lock = heap.cycle_lock.lock();
    let mut timer = PhaseTimer::start();

    let (cycle, mark) = heap.state.begin_cycle();
    let _span = cycle_span(cycle, mark);
    tracing::debug!(phase = ?GcPhase::Flip, mark, "mark flipped");
    // Parked mutators are released when this guard drops, after the sweep.
    let gate = GateRelease::new(&heap.gate, cycle);

    let (converged, safepoint_timeouts) = converge(heap);
    timer.end_converge();

    let (objects_marked, roots) = {
        let _phase = phase_span(GcPhase::Trace);
        let mut tracer = Tracer::new(heap.model.as_ref(), &heap.state.queue, mark);
        tracer.drain();
        let retired = sweep::retire_local(&converged, mark);
        tracing::trace!(retired, "unreached local objects retired");
        log_phase_end(GcPhase::Trace, tracer.marked());
        (tracer.marked(), tracer.into_roots())
    };
    timer.end_trace();

    let policy = heap
        .config
        .holds_mutators()
        .then_some(heap.config.copy_policy)
        .filter(|policy| policy.is_enabled());
    let classes = sweep::classify(heap.regions.take_all(), mark, policy);

    let evacuation = if classes.sparse.is_empty() {
        None
    } else {
        let _phase = phase_span(GcPhase::Copy);
        let evacuation = copy::evacuate(heap.model.as_ref(), mark, &classes.sparse);
        let local_regions: Vec<_> = heap
            .threads
            .active()
            .filter_map(ThreadInfo::local_region)
            .collect();
        copy::fix_references(
            heap.model.as_ref(),
            mark,
            &evacuation.forwarding,
            &roots,
            classes
                .survivors
                .iter()
                .chain(&evacuation.targets)
                .chain(&local_regions)
                .copied(),
        );
        log_phase_end(GcPhase::Copy, evacuation.forwarding.len());
        Some(evacuation)
    };
    timer.end_copy();

    let destroyed = {
        let _phase = phase_span(GcPhase::Sweep);
        let mut destroyed = sweep::reclaim(heap.model.as_ref(), &classes.dead, None);
        destroyed += sweep::reclaim(
            heap.model.as_ref(),
            &classes.sparse,
            evacuation.as_ref().map(|e| &e.forwarding),
        );
        let targets = evacuation.as_ref().map_or(&[][..], |e| &e.targets[..]);
        for &region in classes.survivors.iter().chain(targets) {
            // SAFETY: survivors and copy targets belong to the collector
            // until they go back on the list.
            unsafe { heap.regions.push(region) };
        }
        log_phase_end(GcPhase::Sweep, destroyed);
        destroyed
    };
    timer.end_sweep();
    drop(gate);

    let (duration, phases) = timer.finish();
    let stats = CycleStats {
        cycle,
        mark,
        threads_converged: converged.len(),
        safepoint_timeouts,
        objects_marked,
        live_objects: classes.live_objects,
        garbage_objects: classes.garbage_objects,
        regions_swept: classes.examined(),
        regions_reclaimed: classes.dead.len(),
        regions_evacuated: classes.sparse.len(),
        objects_copied: evacuation.as_ref().map_or(0, |e| e.forwarding.len()),
        duration,
        phases,
    };
    tracing::debug!(
        cycle,
        live = stats.live_objects,
        garbage = stats.garbage_objects,
        destroyed,
        reclaimed = stats.regions_reclaimed,
        evacuated = stats.regions_evacuated,
        "cycle complete"
    );
    heap.record(stats);
    stats
}

/// Requests a safepoint from every attached thread, one at a time, and
/// waits for each rendezvous. Returns the threads met and the number of
/// slow-safepoint warnings.
fn converge(heap: &Shared) -> (Vec<&ThreadInfo>, u32) {
    let _phase = phase_span(GcPhase::Converge);
    let warn_after = heap.config.safepoint_warn_after;
    let mut converged = Vec::new();
    let mut warnings = 0;
    for info in heap.threads.iter() {
        if !info.request_stop() {
            continue;
        }
        safepoint::notify(&heap.config, info);
        warnings += info.rendezvous.arrive_with_warning(warn_after, |waited| {
            log_slow_safepoint(info.id(), info.name(), waited);
        });
        converged.push(info);
    }
    log_phase_end(GcPhase::Converge, converged.len());
    (converged, warnings)
}

// ============================================================================
// Background collector
// ============================================================================

/// Stop flag of the background collector.
pub(crate) struct Timer {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Timer {
    pub(crate) const fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Asks the collector thread to exit after its current cycle.
    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleeps until `deadline`. Returns `false` if stopped meanwhile.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }
}

/// Spawns the background collector.
pub(crate) fn spawn(heap: Arc<Shared>) -> Result<JoinHandle<()>, GcError> {
    std::thread::Builder::new()
        .name("pup-gc-collector".to_owned())
        .spawn(move || run(&heap))
        .map_err(GcError::CollectorSpawn)
}

fn run(heap: &Shared) {
    tracing::debug!(interval = ?heap.config.collect_interval, "collector started");
    let mut deadline = Instant::now() + heap.config.collect_interval;
    while heap.timer.sleep_until(deadline) {
        run_cycle(heap);
        deadline = Instant::now() + heap.config.collect_interval;
    }
    tracing::debug!("collector stopped");
}
