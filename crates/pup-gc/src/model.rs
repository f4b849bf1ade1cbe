//! The seam between the collector and the language's object model.

use std::ptr;

use crate::gc::copy::CopySpace;
use crate::heap::{HeapKind, ObjectRef, Slot};

/// Callbacks the collector needs from the object model.
///
/// The collector knows an object only by its header (size and kind). Every
/// question about an object's contents goes through this trait.
pub trait ObjectModel: Send + Sync + 'static {
    /// Calls `visit` once for every reference field of `object`.
    ///
    /// Called by the tracer, by the copy phase's fix-up pass and never for
    /// an object whose region is already reclaimed.
    fn each_reference(&self, object: ObjectRef, visit: &mut dyn FnMut(Slot));

    /// Called once for every object whose region is reclaimed, and for every
    /// object still alive when the heap is dropped.
    ///
    /// The region may already be write-protected and the object's references
    /// may dangle: implementations must neither write to the object nor
    /// follow its references.
    fn destroy_instance(&self, object: ObjectRef) {
        let _ = object;
    }

    /// Produces a copy of a live object using `ctx` for storage.
    ///
    /// The source object is read-only while this runs. References inside the
    /// copy may keep their old values: the collector rewrites them afterwards.
    fn gc_copy_instance(&self, object: ObjectRef, ctx: &mut CopyContext<'_>) -> ObjectRef {
        ctx.copy_verbatim(object)
    }
}

/// Allocation access for [`ObjectModel::gc_copy_instance`].
pub struct CopyContext<'a> {
    space: &'a mut CopySpace,
}

impl<'a> CopyContext<'a> {
    pub(crate) fn new(space: &'a mut CopySpace) -> Self {
        Self { space }
    }

    /// Allocates zeroed storage in the collector's copy-target region.
    ///
    /// The new object already carries the current cycle's mark.
    pub fn alloc(&mut self, size: usize, kind: HeapKind) -> ObjectRef {
        self.space.alloc(size, kind)
    }

    /// Allocates an object of the same size and kind as `object` and copies
    /// the payload byte for byte.
    pub fn copy_verbatim(&mut self, object: ObjectRef) -> ObjectRef {
        // SAFETY: objects handed to `gc_copy_instance` are live.
        let (size, kind) = unsafe { (object.size(), object.kind()) };
        let copy = self.alloc(size, kind);
        // SAFETY: both payloads are at least `size` bytes and live in
        // different regions.
        unsafe { ptr::copy_nonoverlapping(object.as_ptr(), copy.as_ptr(), size) };
        copy
    }
}
