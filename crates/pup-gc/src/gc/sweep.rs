//! Region classification and reclamation.

use std::ptr::NonNull;

use crate::config::CopyPolicy;
use crate::error::fatal;
use crate::gc::copy::Forwarding;
use crate::heap::region::{Region, REGION_CAPACITY};
use crate::model::ObjectModel;
use crate::thread::ThreadInfo;

/// The regions taken off the global list, sorted by what happens to them.
#[derive(Default)]
pub(crate) struct Sweep {
    /// No marked object: reclaimed.
    pub(crate) dead: Vec<NonNull<Region>>,
    /// Few marked objects: evacuated, then reclaimed.
    pub(crate) sparse: Vec<NonNull<Region>>,
    /// Kept as they are.
    pub(crate) survivors: Vec<NonNull<Region>>,
    pub(crate) live_objects: usize,
    pub(crate) garbage_objects: usize,
}

impl Sweep {
    pub(crate) fn examined(&self) -> usize {
        self.dead.len() + self.sparse.len() + self.survivors.len()
    }
}

/// Sorts `regions` by their census under `mark`.
///
/// `policy` is `None` when copying is off for this cycle. Unmarked objects of
/// surviving regions are retired.
pub(crate) fn classify(regions: Vec<NonNull<Region>>, mark: u8, policy: Option<CopyPolicy>) -> Sweep {
    let mut sweep = Sweep::default();
    for region in regions {
        // SAFETY: regions taken off the global list belong to the collector.
        let r = unsafe { region.as_ref() };
        let census = r.census(mark);
        sweep.live_objects += census.live_objects;
        sweep.garbage_objects += census.objects - census.live_objects;

        if census.live_objects == 0 {
            sweep.dead.push(region);
        } else if policy.is_some_and(|p| p.evacuates(census.live_bytes, REGION_CAPACITY)) {
            sweep.sparse.push(region);
        } else {
            r.retire_unmarked(mark, r.top());
            sweep.survivors.push(region);
        }
    }
    sweep
}

/// Retires the unmarked objects that `threads` allocated before adopting
/// `mark`. Their local regions only reach [`classify`] once full, possibly
/// after the mark has flipped back.
///
/// Runs after the trace and before any region of this cycle is reclaimed.
pub(crate) fn retire_local(threads: &[&ThreadInfo], mark: u8) -> usize {
    threads
        .iter()
        .filter_map(|info| info.allocation_boundary())
        .map(|(region, top)| {
            // SAFETY: the region was local at the rendezvous and only the
            // collector reclaims regions, later in this cycle.
            unsafe { region.as_ref() }.retire_unmarked(mark, top)
        })
        .sum()
}

/// Write-protects, destroys and unmaps `regions`. Objects listed in
/// `forwarding` were copied and are not destroyed.
///
/// Returns the number of objects destroyed.
pub(crate) fn reclaim(
    model: &dyn ObjectModel,
    regions: &[NonNull<Region>],
    forwarding: Option<&Forwarding>,
) -> usize {
    let mut destroyed = 0;
    for &region in regions {
        // SAFETY: see `classify`.
        let r = unsafe { region.as_ref() };
        if !r.is_read_only() {
            if let Err(err) = r.protect_read_only() {
                fatal!("failed to write-protect region {}: {err}", r.id());
            }
        }
        let id = r.id();
        for object in r.objects() {
            if forwarding.is_some_and(|f| f.is_forwarded(object)) {
                continue;
            }
            model.destroy_instance(object);
            destroyed += 1;
        }
        // SAFETY: the region is off every list and nothing refers into it.
        if let Err(err) = unsafe { Region::release(region) } {
            tracing::error!(region = id, %err, "failed to unmap region");
        }
    }
    destroyed
}
