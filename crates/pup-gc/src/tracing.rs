//! Spans and events of the collection cycle.

use ::tracing::{span, Level};

/// Phases of a collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcPhase {
    /// Flip the global mark value.
    Flip,
    /// Request and await every mutator's safepoint.
    Converge,
    /// Drain the reference queue.
    Trace,
    /// Evacuate sparse regions.
    Copy,
    /// Reclaim dead regions.
    Sweep,
}

/// Enters the span that covers a whole cycle.
pub(crate) fn cycle_span(cycle: u64, mark: u8) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_cycle", cycle, mark).entered()
}

/// Enters the span of one phase, nested in the cycle span.
pub(crate) fn phase_span(phase: GcPhase) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
}

/// Logs the end of a phase with the number of items it handled.
pub(crate) fn log_phase_end(phase: GcPhase, count: usize) {
    ::tracing::debug!(phase = ?phase, count, "phase_end");
}

/// Logs a mutator that has not reached a safepoint yet.
pub(crate) fn log_slow_safepoint(thread: u64, name: &str, waited: std::time::Duration) {
    ::tracing::warn!(
        thread,
        name,
        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        "mutator has not reached a safepoint; still waiting"
    );
}
