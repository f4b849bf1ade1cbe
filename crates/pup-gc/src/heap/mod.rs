//! The heap: regions, the threads that allocate from them and the collector
//! that reclaims them.

pub(crate) mod object;
pub(crate) mod region;
pub(crate) mod region_list;

pub use object::{
    footprint, rounded_size, HeapKind, ObjectRef, Slot, HEADER_SIZE, LARGE_OBJECT_THRESHOLD,
    OBJECT_ALIGN,
};
pub use region::{REGION_CAPACITY, REGION_MASK, REGION_SIZE};

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::GcConfig;
use crate::error::{fatal, GcError};
use crate::gc::collector::{self, Timer};
use crate::gc::state::GcState;
use crate::gc::sweep;
use crate::metrics::{CycleStats, HeapMetrics};
use crate::model::ObjectModel;
use crate::safepoint::{self, CycleGate};
use crate::stack::{NoStackMaps, StackMapSource};
use crate::thread::{self, MutatorGuard, ThreadInfo, ThreadRegistry};

use region::Region;
use region_list::RegionList;

// ============================================================================
// Shared
// ============================================================================

/// Everything the collector, the mutators and the signal handler share.
pub(crate) struct Shared {
    pub(crate) config: GcConfig,
    pub(crate) model: Box<dyn ObjectModel>,
    pub(crate) stack_maps: Arc<dyn StackMapSource>,
    pub(crate) regions: RegionList,
    pub(crate) threads: ThreadRegistry,
    pub(crate) state: GcState,
    pub(crate) gate: CycleGate,
    /// Held for a whole cycle, and by attach and detach.
    pub(crate) cycle_lock: Mutex<()>,
    pub(crate) metrics: HeapMetrics,
    pub(crate) timer: Timer,
    last_stats: Mutex<Option<CycleStats>>,
    next_thread_id: AtomicU64,
}

impl Shared {
    fn new(
        config: GcConfig,
        model: Box<dyn ObjectModel>,
        stack_maps: Arc<dyn StackMapSource>,
    ) -> Self {
        let retry_limit = config.cas_retry_limit;
        Self {
            config,
            model,
            stack_maps,
            regions: RegionList::new(retry_limit),
            threads: ThreadRegistry::new(retry_limit),
            state: GcState::new(retry_limit),
            gate: CycleGate::new(),
            cycle_lock: Mutex::new(()),
            metrics: HeapMetrics::new(),
            timer: Timer::new(),
            last_stats: Mutex::new(None),
            next_thread_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Maps a fresh region for a mutator.
    pub(crate) fn map_region(&self) -> Result<NonNull<Region>, GcError> {
        let region = Region::allocate().map_err(|source| GcError::RegionMap {
            size: REGION_SIZE,
            source,
        })?;
        self.metrics.record_region_mapped();
        Ok(region)
    }

    /// Allocates `size` payload bytes for the thread `info`.
    ///
    /// The object carries the thread's current mark. A full local region is
    /// handed to the global list and replaced.
    #[inline]
    pub(crate) fn alloc(&self, info: &ThreadInfo, size: usize, kind: HeapKind) -> ObjectRef {
        if size > LARGE_OBJECT_THRESHOLD {
            fatal!(
                "allocation of {size} bytes exceeds the large-object threshold of \
                 {LARGE_OBJECT_THRESHOLD} bytes; large objects are not supported"
            );
        }
        let mark = info.current_mark();
        if let Some(region) = info.local_region() {
            // SAFETY: the local region is owned by the calling thread.
            let local = unsafe { region.as_ref() };
            if local.have_room_for(size) {
                return local.make_room_for(size, kind, mark);
            }
        }
        self.alloc_slow(info, size, kind, mark)
    }

    #[cold]
    fn alloc_slow(&self, info: &ThreadInfo, size: usize, kind: HeapKind, mark: u8) -> ObjectRef {
        if let Some(full) = info.local_region() {
            // SAFETY: the thread never allocates from `full` again.
            unsafe { self.regions.push(full) };
        }
        let region = Region::allocate().unwrap_or_else(|err| {
            fatal!("failed to map a region for thread {}: {err}", info.id())
        });
        self.metrics.record_region_mapped();
        info.set_local_region(Some(region));
        // SAFETY: freshly mapped and owned by the calling thread.
        unsafe { region.as_ref() }.make_room_for(size, kind, mark)
    }

    pub(crate) fn record(&self, stats: CycleStats) {
        self.metrics.record_cycle(&stats);
        *self.last_stats.lock() = Some(stats);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(info) = self.threads.active().next() {
            fatal!(
                "heap dropped while thread {} ({}) is still attached",
                info.id(),
                info.name()
            );
        }
        let regions = self.regions.take_all();
        let destroyed = sweep::reclaim(self.model.as_ref(), &regions, None);
        // SAFETY: no thread is attached and the collector has stopped.
        let threads = unsafe { self.threads.free_all() };
        tracing::debug!(
            regions = regions.len(),
            objects = destroyed,
            threads,
            "heap torn down"
        );
    }
}

// ============================================================================
// Heap
// ============================================================================

/// A garbage-collected heap with its collector.
///
/// Threads allocate after attaching with
/// [`attach_current_thread`](Self::attach_current_thread). Unless disabled in
/// the configuration, a background thread runs a collection cycle every
/// `collect_interval`; [`collect`](Self::collect) runs one on demand.
///
/// Dropping the heap stops the collector, calls
/// [`ObjectModel::destroy_instance`] for every remaining object and unmaps
/// every region.
pub struct Heap {
    shared: Arc<Shared>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.shared.config)
            .field("cycle", &self.shared.state.cycle())
            .field("regions", &self.shared.regions.len())
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Creates a heap whose mutators keep their references in shadow roots
    /// ([`MutatorGuard::root`]).
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, if the safepoint signal handler
    /// cannot be installed, or if the collector thread cannot be spawned.
    pub fn new(config: GcConfig, model: impl ObjectModel) -> Result<Self, GcError> {
        Self::with_stack_maps(config, model, Arc::new(NoStackMaps))
    }

    /// Creates a heap whose mutators' stacks are scanned with `stack_maps`.
    ///
    /// # Errors
    ///
    /// See [`Heap::new`].
    pub fn with_stack_maps(
        config: GcConfig,
        model: impl ObjectModel,
        stack_maps: Arc<dyn StackMapSource>,
    ) -> Result<Self, GcError> {
        config.validate()?;
        safepoint::prepare(&config)?;
        let shared = Arc::new(Shared::new(config, Box::new(model), stack_maps));
        let collector = if shared.config.background_collector {
            Some(collector::spawn(Arc::clone(&shared))?)
        } else {
            None
        };
        tracing::debug!(config = ?shared.config, "heap created");
        Ok(Self {
            shared,
            collector: Mutex::new(collector),
        })
    }

    /// Attaches the calling thread as a mutator.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::AlreadyAttached`] if the thread is attached to any
    /// heap, or [`GcError::RegionMap`] if its first region cannot be mapped.
    pub fn attach_current_thread(&self) -> Result<MutatorGuard<'_>, GcError> {
        thread::attach(&self.shared)
    }

    /// Runs one collection cycle on the calling thread and returns its
    /// statistics.
    ///
    /// Blocks until every attached mutator has reached a safepoint.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::CollectFromMutator`] if the calling thread is a
    /// mutator of this heap: it would wait for its own safepoint forever.
    pub fn collect(&self) -> Result<CycleStats, GcError> {
        if let Some(info) = thread::current() {
            // SAFETY: the calling thread's own entry is alive while attached.
            if unsafe { info.as_ref() }.belongs_to(&self.shared) {
                return Err(GcError::CollectFromMutator);
            }
        }
        Ok(collector::run_cycle(&self.shared))
    }

    /// Statistics of the most recent cycle.
    #[must_use]
    pub fn cycle_stats(&self) -> Option<CycleStats> {
        *self.shared.last_stats.lock()
    }

    /// Cumulative statistics.
    #[must_use]
    pub fn metrics(&self) -> &HeapMetrics {
        &self.shared.metrics
    }

    /// The configuration the heap was created with.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// Regions waiting on the global list for the next sweep.
    #[must_use]
    pub fn global_regions(&self) -> usize {
        self.shared.regions.len()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shared.timer.stop();
        if let Some(handle) = self.collector.lock().take() {
            if handle.join().is_err() {
                tracing::error!("collector thread panicked");
            }
        }
    }
}
