//! The mutator side of the safepoint protocol.
//!
//! Per thread the protocol moves through
//! `RUNNING -> GC_REQUESTED -> AT_SAFEPOINT -> RUNNING`:
//!
//! 1. The collector CASes the thread's state to `GC_REQUESTED` and, in
//!    signal mode, sends the safepoint signal. The handler snapshots the
//!    global mark and raises the thread's `gc_waiting` hint.
//! 2. At its next [`check`], the thread sees the request, moves to
//!    `AT_SAFEPOINT`, scans its roots into the reference queue and meets the
//!    collector on its rendezvous.
//! 3. Under `Hold` convergence it then parks on the cycle gate until the
//!    collector has finished; otherwise it resumes right away.

mod rendezvous;
#[cfg(unix)]
mod signal;

pub(crate) use rendezvous::{CycleGate, GateRelease, Rendezvous};

use crate::config::{GcConfig, RequestMode};
use crate::error::{fatal, GcError};
use crate::gc::refqueue::QueueEntry;
use crate::heap::{Shared, Slot};
use crate::stack::{self, BacktraceCursor};
use crate::thread::ThreadInfo;

/// Installs whatever the configured request mode needs.
pub(crate) fn prepare(config: &GcConfig) -> Result<(), GcError> {
    match config.request_mode {
        #[cfg(unix)]
        RequestMode::Signal => signal::install(config.safepoint_signal),
        #[cfg(not(unix))]
        RequestMode::Signal => Err(GcError::InvalidConfig(
            "signal requests are only supported on unix",
        )),
        RequestMode::Polling => Ok(()),
    }
}

/// Delivers a stop request that is already recorded in `info`'s state.
pub(crate) fn notify(config: &GcConfig, info: &ThreadInfo) {
    if config.request_mode != RequestMode::Signal {
        return;
    }
    #[cfg(unix)]
    if let Err(err) = signal::send(info.pthread(), config.safepoint_signal) {
        fatal!(
            "failed to signal thread {} ({}): {err}",
            info.id(),
            info.name()
        );
    }
}

/// The fast path run at every safepoint.
#[inline]
pub(crate) fn check(heap: &Shared, info: &ThreadInfo) {
    let requested = match heap.config.request_mode {
        RequestMode::Signal => info.stop_hinted(),
        RequestMode::Polling => info.stop_requested(),
    };
    if requested {
        serve(heap, info);
    }
}

/// Serves a stop request: scan, rendezvous, optionally park.
#[cold]
pub(crate) fn serve(heap: &Shared, info: &ThreadInfo) {
    if !info.enter_safepoint() {
        return;
    }
    let cycle = heap.state.cycle();
    let mark = heap.state.mark();
    info.record_snapshot(mark);

    let roots = scan_roots(heap, info);
    tracing::trace!(thread = info.id(), cycle, roots, "roots scanned");

    info.adopt_snapshot();
    info.rendezvous.arrive();
    if heap.config.holds_mutators() {
        heap.gate.wait(cycle);
    }
    info.leave_safepoint();
}

/// Pushes the thread's roots onto the reference queue.
///
/// Under `Hold` the slots themselves are queued so the copy phase can rewrite
/// them. A concurrent mutator keeps running after the rendezvous, so its
/// slots are read now and queued by value.
fn scan_roots(heap: &Shared, info: &ThreadInfo) -> usize {
    let by_slot = heap.config.holds_mutators();
    let mut writer = heap.state.queue.writer();
    let mut count = 0;
    let mut capture = |slot: Slot| {
        if by_slot {
            writer.push(QueueEntry::Root(slot));
            count += 1;
        } else if let Some(object) = slot.load() {
            writer.push(QueueEntry::Value(object));
            count += 1;
        }
    };

    for slot in info.shadow_roots() {
        capture(slot);
    }

    if !heap.stack_maps.is_empty() {
        let mut cursor = BacktraceCursor::capture();
        if let Err(err) = stack::scan_frames(&mut cursor, heap.stack_maps.as_ref(), &mut capture) {
            fatal!("stack scan of thread {} failed: {err}", info.id());
        }
    }

    drop(writer);
    count
}
