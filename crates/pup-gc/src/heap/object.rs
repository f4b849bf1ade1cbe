//! Object headers, object handles and reference slots.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ============================================================================
// Constants
// ============================================================================

/// Bytes of header in front of every object's payload.
pub const HEADER_SIZE: usize = 16;

/// Payload sizes are rounded up to a multiple of this.
pub const OBJECT_ALIGN: usize = 16;

/// Largest payload the region allocator accepts. Larger requests abort.
pub const LARGE_OBJECT_THRESHOLD: usize = 4096;

/// Mark of an object found dead in a region that survives. Never equal to a
/// cycle's mark, so a stale mark cannot read as live two cycles later.
const RETIRED: u8 = 2;

/// Kind tag stored in every object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeapKind {
    /// A language-level object.
    Object = 1,
    /// An attribute (instance variable) table entry.
    Attribute = 2,
}

impl HeapKind {
    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Object),
            2 => Some(Self::Attribute),
            _ => None,
        }
    }
}

/// Rounds a payload size to the stored size. Empty payloads still take one
/// unit so that every object address lies strictly inside its region.
#[must_use]
pub const fn rounded_size(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    (size + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
}

/// Bytes an object of payload `size` occupies in a region, header included.
#[must_use]
pub const fn footprint(size: usize) -> usize {
    HEADER_SIZE + rounded_size(size)
}

// ============================================================================
// ObjectHeader
// ============================================================================

#[repr(C, align(16))]
pub(crate) struct ObjectHeader {
    size: u32,
    kind: u8,
    mark: AtomicU8,
    _reserved: [u8; 10],
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == HEADER_SIZE);

impl ObjectHeader {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn new(size: usize, kind: HeapKind, mark: u8) -> Self {
        Self {
            size: size as u32,
            kind: kind as u8,
            mark: AtomicU8::new(mark),
            _reserved: [0; 10],
        }
    }

    pub(crate) const fn size(&self) -> usize {
        self.size as usize
    }
}

// ============================================================================
// ObjectRef
// ============================================================================

/// Handle to the payload of a heap object.
///
/// An `ObjectRef` is a plain address: it does not keep the object alive. The
/// object it names is valid while it is reachable from a root, or until the
/// collector moves it (in which case every traced slot is rewritten to the
/// new address). `Option<ObjectRef>` is pointer-sized, so objects store their
/// references as `Option<ObjectRef>` words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<u8>);

// SAFETY: an ObjectRef is an address into the shared heap; the heap is
// designed to be used from every attached thread.
unsafe impl Send for ObjectRef {}
// SAFETY: see above.
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wraps a payload pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload address of an object allocated by this crate
    /// for any method that reads the header or payload to be sound.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Returns the payload pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Returns the payload address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn header(self) -> &'static ObjectHeader {
        // SAFETY: the header sits right in front of every payload the
        // allocator hands out; regions are never unmapped while a traced
        // reference to one of their objects exists.
        unsafe { &*self.0.as_ptr().sub(HEADER_SIZE).cast::<ObjectHeader>() }
    }

    /// Requested payload size in bytes.
    ///
    /// # Safety
    ///
    /// The object must still be live.
    #[must_use]
    pub unsafe fn size(self) -> usize {
        self.header().size()
    }

    /// Kind tag given at allocation.
    ///
    /// # Safety
    ///
    /// The object must still be live.
    #[must_use]
    pub unsafe fn kind(self) -> HeapKind {
        match HeapKind::from_tag(self.header().kind) {
            Some(kind) => kind,
            None => crate::error::fatal!(
                "corrupt object header at {:#x}: kind tag {}",
                self.addr(),
                self.header().kind
            ),
        }
    }

    /// Returns the reference slot at byte `offset` of the payload.
    ///
    /// # Safety
    ///
    /// The object must still be live.
    ///
    /// # Panics
    ///
    /// Panics if the slot is misaligned or does not fit in the payload.
    #[must_use]
    pub unsafe fn slot(self, offset: usize) -> Slot {
        let size = unsafe { self.size() };
        assert!(
            offset % std::mem::align_of::<usize>() == 0
                && offset + std::mem::size_of::<usize>() <= size,
            "slot offset {offset} outside a {size}-byte payload"
        );
        // SAFETY: bounds checked above; the payload pointer is non-null.
        unsafe { Slot::from_raw(NonNull::new_unchecked(self.as_ptr().add(offset).cast())) }
    }

    /// Marks the object with `mark`.
    ///
    /// Returns `true` if the object did not carry `mark` before, i.e. it is
    /// newly reached in this cycle. Marking twice returns `false` the second
    /// time.
    pub(crate) fn mark_reachable(self, mark: u8) -> bool {
        self.header().mark.swap(mark, Ordering::AcqRel) != mark
    }

    pub(crate) fn is_marked(self, mark: u8) -> bool {
        self.header().mark.load(Ordering::Acquire) == mark
    }

    /// Stamps an unreachable object so that no later cycle counts it live.
    pub(crate) fn retire(self) {
        self.header().mark.store(RETIRED, Ordering::Relaxed);
    }

    pub(crate) fn is_retired(self) -> bool {
        self.header().mark.load(Ordering::Relaxed) == RETIRED
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0)
    }
}

// ============================================================================
// Slot
// ============================================================================

/// Address of a word that holds an `Option<ObjectRef>`.
///
/// Slots are what the reference queue carries: the tracer reads through them
/// and the copy phase writes forwarded addresses back into them. Accesses
/// are relaxed atomic word operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Slot(NonNull<*mut u8>);

// SAFETY: slots point into the heap, a stack parked at a safepoint, or a
// boxed shadow root; all accesses are atomic.
unsafe impl Send for Slot {}
// SAFETY: see above.
unsafe impl Sync for Slot {}

impl Slot {
    /// Wraps the address of a reference word.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned and stay valid for as long as the slot can be
    /// read or written by the collector.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<*mut u8>) -> Self {
        Self(ptr)
    }

    /// Returns the slot address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn atomic(self) -> &'static AtomicPtr<u8> {
        // SAFETY: validity and alignment are guaranteed by `from_raw`'s
        // contract; every access to the word goes through atomics.
        unsafe { AtomicPtr::from_ptr(self.0.as_ptr()) }
    }

    /// Reads the reference stored in the slot.
    #[must_use]
    pub fn load(self) -> Option<ObjectRef> {
        NonNull::new(self.atomic().load(Ordering::Relaxed)).map(ObjectRef)
    }

    /// Stores a reference into the slot.
    pub fn store(self, value: Option<ObjectRef>) {
        let raw = value.map_or(std::ptr::null_mut(), ObjectRef::as_ptr);
        self.atomic().store(raw, Ordering::Relaxed);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({:p})", self.0)
    }
}
