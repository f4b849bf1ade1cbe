//! Blocking primitives of the safepoint protocol.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A reusable two-party barrier between the collector and one mutator.
///
/// Whichever side arrives first waits for the other; the second arrival
/// releases both and resets the barrier for the next cycle.
pub(crate) struct Rendezvous {
    state: Mutex<Phase>,
    released: Condvar,
}

struct Phase {
    waiting: bool,
    generation: u64,
}

impl Rendezvous {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(Phase {
                waiting: false,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Mutator side: waits without a timeout.
    pub(crate) fn arrive(&self) {
        let mut phase = self.state.lock();
        if self.release(&mut phase) {
            return;
        }
        let generation = phase.generation;
        while phase.generation == generation {
            self.released.wait(&mut phase);
        }
    }

    /// Collector side: waits, calling `on_slow` with the total time waited
    /// every time another `warn_after` passes without the mutator arriving.
    /// Never gives up.
    ///
    /// Returns how many times `on_slow` was called.
    pub(crate) fn arrive_with_warning(
        &self,
        warn_after: Duration,
        mut on_slow: impl FnMut(Duration),
    ) -> u32 {
        let mut phase = self.state.lock();
        if self.release(&mut phase) {
            return 0;
        }
        let generation = phase.generation;
        let started = Instant::now();
        let mut warnings = 0;
        while phase.generation == generation {
            let timed_out = self.released.wait_for(&mut phase, warn_after).timed_out();
            if timed_out && phase.generation == generation {
                warnings += 1;
                on_slow(started.elapsed());
            }
        }
        warnings
    }

    /// Releases a waiting partner. Otherwise records this arrival and
    /// returns `false`.
    fn release(&self, phase: &mut Phase) -> bool {
        if phase.waiting {
            phase.waiting = false;
            phase.generation = phase.generation.wrapping_add(1);
            self.released.notify_all();
            true
        } else {
            phase.waiting = true;
            false
        }
    }
}

/// Holds parked mutators until the collector finishes a cycle.
pub(crate) struct CycleGate {
    opened: Mutex<u64>,
    cond: Condvar,
}

impl CycleGate {
    pub(crate) const fn new() -> Self {
        Self {
            opened: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Lets every mutator parked for `cycle` (or an earlier one) continue.
    pub(crate) fn open(&self, cycle: u64) {
        let mut opened = self.opened.lock();
        if *opened < cycle {
            *opened = cycle;
        }
        self.cond.notify_all();
    }

    /// Blocks until `cycle` has been opened.
    pub(crate) fn wait(&self, cycle: u64) {
        let mut opened = self.opened.lock();
        while *opened < cycle {
            self.cond.wait(&mut opened);
        }
    }
}

/// Opens the gate for a cycle when dropped, so parked mutators are released
/// even if the cycle unwinds.
pub(crate) struct GateRelease<'a> {
    gate: &'a CycleGate,
    cycle: u64,
}

impl<'a> GateRelease<'a> {
    pub(crate) const fn new(gate: &'a CycleGate, cycle: u64) -> Self {
        Self { gate, cycle }
    }
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        self.gate.open(self.cycle);
    }
}
