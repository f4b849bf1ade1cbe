//! Heap configuration.

use std::time::Duration;

use crate::error::GcError;

/// What a mutator does after meeting the collector at a safepoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Convergence {
    /// The mutator stays parked until the whole cycle (trace, copy, sweep)
    /// has finished. Required for copying.
    #[default]
    Hold,
    /// The mutator resumes right after the rendezvous while the collector
    /// traces and sweeps concurrently.
    ///
    /// There is no write barrier: a mutator that moves the only reference to
    /// an untraced object into an object allocated after its own safepoint can
    /// hide that object from the trace.
    Concurrent,
}

/// Which old regions the collector evacuates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPolicy {
    /// Never copy; regions are only reclaimed when fully dead.
    Disabled,
    /// Evacuate regions whose live bytes are at most `max_live_percent` of
    /// the region capacity.
    SparseRegions {
        /// Threshold in percent, 0..=100.
        max_live_percent: u8,
    },
}

impl Default for CopyPolicy {
    fn default() -> Self {
        Self::SparseRegions {
            max_live_percent: 25,
        }
    }
}

impl CopyPolicy {
    /// Returns whether a region with `live_bytes` of `capacity` should be evacuated.
    #[must_use]
    pub const fn evacuates(self, live_bytes: usize, capacity: usize) -> bool {
        match self {
            Self::Disabled => false,
            Self::SparseRegions { max_live_percent } => {
                live_bytes * 100 <= max_live_percent as usize * capacity
            }
        }
    }

    /// Returns `true` unless copying is disabled.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// How the collector delivers a stop request to a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Send `safepoint_signal` to the thread; its handler raises the
    /// thread-local "GC waiting" flag.
    Signal,
    /// Raise a flag in the thread's registry entry that the safepoint check
    /// polls. Higher worst-case latency, no signal delivery needed.
    Polling,
}

impl Default for RequestMode {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Signal
        } else {
            Self::Polling
        }
    }
}

/// Configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Period of the background collector.
    pub collect_interval: Duration,
    /// Whether `Heap::new` spawns the background collector thread.
    pub background_collector: bool,
    /// How long the collector waits for one mutator before logging a warning.
    /// It keeps waiting afterwards.
    pub safepoint_warn_after: Duration,
    /// Failed compare-and-swap attempts after which a lock-free loop is
    /// declared broken and the process aborts.
    pub cas_retry_limit: u32,
    /// Mutator behavior after the rendezvous.
    pub convergence: Convergence,
    /// Region evacuation policy.
    pub copy_policy: CopyPolicy,
    /// Stop-request delivery.
    pub request_mode: RequestMode,
    /// Signal number used in [`RequestMode::Signal`].
    pub safepoint_signal: i32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_millis(500),
            background_collector: true,
            safepoint_warn_after: Duration::from_secs(1),
            cas_retry_limit: 1000,
            convergence: Convergence::default(),
            copy_policy: CopyPolicy::default(),
            request_mode: RequestMode::default(),
            safepoint_signal: default_signal(),
        }
    }
}

#[cfg(unix)]
const fn default_signal() -> i32 {
    libc::SIGUSR2
}

#[cfg(not(unix))]
const fn default_signal() -> i32 {
    0
}

impl GcConfig {
    /// Sets the background collection period.
    #[must_use]
    pub const fn with_collect_interval(mut self, interval: Duration) -> Self {
        self.collect_interval = interval;
        self
    }

    /// Enables or disables the background collector thread.
    #[must_use]
    pub const fn with_background_collector(mut self, enabled: bool) -> Self {
        self.background_collector = enabled;
        self
    }

    /// Sets the slow-safepoint warning interval.
    #[must_use]
    pub const fn with_safepoint_warn_after(mut self, after: Duration) -> Self {
        self.safepoint_warn_after = after;
        self
    }

    /// Sets the compare-and-swap retry limit.
    #[must_use]
    pub const fn with_cas_retry_limit(mut self, limit: u32) -> Self {
        self.cas_retry_limit = limit;
        self
    }

    /// Sets the convergence mode.
    #[must_use]
    pub const fn with_convergence(mut self, convergence: Convergence) -> Self {
        self.convergence = convergence;
        self
    }

    /// Sets the copy policy.
    #[must_use]
    pub const fn with_copy_policy(mut self, policy: CopyPolicy) -> Self {
        self.copy_policy = policy;
        self
    }

    /// Sets the stop-request delivery mode.
    #[must_use]
    pub const fn with_request_mode(mut self, mode: RequestMode) -> Self {
        self.request_mode = mode;
        self
    }

    /// Sets the safepoint signal number.
    #[must_use]
    pub const fn with_safepoint_signal(mut self, signal: i32) -> Self {
        self.safepoint_signal = signal;
        self
    }

    /// Returns whether mutators stay parked for the whole cycle.
    #[must_use]
    pub const fn holds_mutators(&self) -> bool {
        matches!(self.convergence, Convergence::Hold)
    }

    /// Checks the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] for zero durations, a zero retry
    /// limit, a copy percentage above 100, copying under concurrent
    /// convergence, or signal delivery on a platform without it.
    pub fn validate(&self) -> Result<(), GcError> {
        if self.collect_interval.is_zero() {
            return Err(GcError::InvalidConfig("collect_interval must be non-zero"));
        }
        if self.safepoint_warn_after.is_zero() {
            return Err(GcError::InvalidConfig(
                "safepoint_warn_after must be non-zero",
            ));
        }
        if self.cas_retry_limit == 0 {
            return Err(GcError::InvalidConfig("cas_retry_limit must be non-zero"));
        }
        if let CopyPolicy::SparseRegions { max_live_percent } = self.copy_policy {
            if max_live_percent > 100 {
                return Err(GcError::InvalidConfig(
                    "max_live_percent must be at most 100",
                ));
            }
        }
        if self.convergence == Convergence::Concurrent && self.copy_policy.is_enabled() {
            return Err(GcError::InvalidConfig(
                "copying requires Convergence::Hold",
            ));
        }
        if self.request_mode == RequestMode::Signal && !cfg!(unix) {
            return Err(GcError::InvalidConfig(
                "signal requests are only supported on unix",
            ));
        }
        Ok(())
    }
}
