//! Evacuation of sparse regions.
//!
//! Runs only while every mutator is parked. Source regions are write-protected
//! first, survivors are copied through the object model, and forwarding is
//! kept in a collector-side table so nothing is ever written into a protected
//! region. Afterwards every recorded root slot and every reference field of a
//! surviving object is rewritten to the forwarded address.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::error::fatal;
use crate::heap::object::LARGE_OBJECT_THRESHOLD;
use crate::heap::region::Region;
use crate::heap::{HeapKind, ObjectRef, Slot};
use crate::model::{CopyContext, ObjectModel};

/// The collector's copy target: regions that receive survivors.
pub(crate) struct CopySpace {
    mark: u8,
    current: Option<NonNull<Region>>,
    filled: Vec<NonNull<Region>>,
}

impl CopySpace {
    pub(crate) const fn new(mark: u8) -> Self {
        Self {
            mark,
            current: None,
            filled: Vec::new(),
        }
    }

    /// `alloc_for_gc_copy`: allocates from the copy target, mapping a new
    /// target region when the current one is full.
    pub(crate) fn alloc(&mut self, size: usize, kind: HeapKind) -> ObjectRef {
        if size > LARGE_OBJECT_THRESHOLD {
            fatal!(
                "large object copy of {size} bytes is not supported (threshold {LARGE_OBJECT_THRESHOLD})"
            );
        }
        let region = match self.current {
            // SAFETY: copy targets belong to the collector until `finish`.
            Some(region) if unsafe { region.as_ref() }.have_room_for(size) => region,
            _ => {
                if let Some(full) = self.current.take() {
                    self.filled.push(full);
                }
                let region = Region::allocate()
                    .unwrap_or_else(|err| fatal!("failed to map a copy target region: {err}"));
                self.current = Some(region);
                region
            }
        };
        // SAFETY: see above.
        unsafe { region.as_ref() }.make_room_for(size, kind, self.mark)
    }

    /// Returns every region that received copies.
    pub(crate) fn finish(mut self) -> Vec<NonNull<Region>> {
        self.filled.extend(self.current.take());
        self.filled
    }
}

/// Old address to new address for every evacuated object.
#[derive(Default)]
pub(crate) struct Forwarding {
    table: HashMap<ObjectRef, ObjectRef>,
}

impl Forwarding {
    pub(crate) fn get(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.table.get(&object).copied()
    }

    pub(crate) fn is_forwarded(&self, object: ObjectRef) -> bool {
        self.table.contains_key(&object)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Rewrites `slot` if it refers to an evacuated object.
    pub(crate) fn fix(&self, slot: Slot) {
        if let Some(new) = slot.load().and_then(|old| self.get(old)) {
            slot.store(Some(new));
        }
    }
}

/// Result of an evacuation.
pub(crate) struct Evacuation {
    pub(crate) forwarding: Forwarding,
    pub(crate) targets: Vec<NonNull<Region>>,
}

/// Write-protects `sources` and copies their marked objects.
pub(crate) fn evacuate(model: &dyn ObjectModel, mark: u8, sources: &[NonNull<Region>]) -> Evacuation {
    for region in sources {
        // SAFETY: the regions were taken off the global list by the collector.
        let region = unsafe { region.as_ref() };
        if let Err(err) = region.protect_read_only() {
            fatal!("failed to write-protect region {}: {err}", region.id());
        }
    }

    let mut space = CopySpace::new(mark);
    let mut forwarding = Forwarding::default();
    for region in sources {
        // SAFETY: see above.
        let region = unsafe { region.as_ref() };
        for object in region.objects().filter(|o| o.is_marked(mark)) {
            let copy = model.gc_copy_instance(object, &mut CopyContext::new(&mut space));
            forwarding.table.insert(object, copy);
        }
    }
    tracing::debug!(objects = forwarding.len(), "evacuated");

    Evacuation {
        forwarding,
        targets: space.finish(),
    }
}

/// Rewrites references to evacuated objects.
///
/// `roots` are the root slots recorded during the trace; `regions` are the
/// regions whose marked objects may hold references (survivors, copy targets
/// and the mutators' local regions).
pub(crate) fn fix_references(
    model: &dyn ObjectModel,
    mark: u8,
    forwarding: &Forwarding,
    roots: &[Slot],
    regions: impl IntoIterator<Item = NonNull<Region>>,
) {
    for &slot in roots {
        forwarding.fix(slot);
    }
    let mut fix = |slot: Slot| forwarding.fix(slot);
    for region in regions {
        // SAFETY: every listed region is mapped and writable for the
        // duration of the fix-up.
        let region = unsafe { region.as_ref() };
        debug_assert!(!region.is_read_only());
        for object in region.objects().filter(|o| o.is_marked(mark)) {
            model.each_reference(object, &mut fix);
        }
    }
}
