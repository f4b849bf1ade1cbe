//! Fixed-size bump-allocated regions.
//!
//! A region is a 1 MiB mapping aligned to its own size. Its control data sits
//! in the first bytes of the mapping, followed by objects laid out back to
//! back as `[header][payload]`. Masking any object address with
//! [`REGION_MASK`] yields the owning region.

use std::io;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use sys_alloc::{Mmap, MmapOptions, Protection};

use super::object::{footprint, HeapKind, ObjectHeader, ObjectRef, HEADER_SIZE};
use crate::lockfree::Linked;

// ============================================================================
// Constants
// ============================================================================

/// Size and alignment of every region.
pub const REGION_SIZE: usize = 1 << 20;

/// Mask that maps an address inside a region to the region base.
pub const REGION_MASK: usize = !(REGION_SIZE - 1);

/// Offset of the first object header.
const DATA_OFFSET: usize = 64;

/// Bytes available for objects in one region.
pub const REGION_CAPACITY: usize = REGION_SIZE - DATA_OFFSET;

/// Magic number for validating regions ("PUPR" in ASCII).
const MAGIC_REGION: u32 = 0x5055_5052;

const _: () = assert!(mem::size_of::<Region>() <= DATA_OFFSET);
const _: () = assert!(DATA_OFFSET % mem::align_of::<ObjectHeader>() == 0);

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Region
// ============================================================================

/// Control block at the start of each region.
#[repr(C)]
pub(crate) struct Region {
    magic: u32,
    /// Set while the collector has the region write-protected.
    read_only: AtomicBool,
    next: AtomicPtr<Region>,
    /// Offset of the first free byte.
    bump: AtomicUsize,
    id: u64,
    map: ManuallyDrop<Mmap>,
}

impl Linked for Region {
    fn link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

/// Object counts of one region for the current mark.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Census {
    pub(crate) objects: usize,
    pub(crate) live_objects: usize,
    pub(crate) live_bytes: usize,
}

impl Region {
    /// Maps a fresh, zeroed region.
    pub(crate) fn allocate() -> io::Result<NonNull<Self>> {
        // SAFETY: the mapping is only reached through the region pointer,
        // which `release` invalidates together with the mapping.
        let map = unsafe {
            MmapOptions::new()
                .len(REGION_SIZE)
                .align(REGION_SIZE)
                .map_anon()?
        };
        let base = NonNull::new(map.ptr().cast::<Self>())
            .ok_or_else(|| io::Error::other("mapping returned a null address"))?;
        let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the mapping is fresh, writable and large enough for the
        // control block; nothing else references it yet.
        unsafe {
            base.as_ptr().write(Self {
                magic: MAGIC_REGION,
                read_only: AtomicBool::new(false),
                next: AtomicPtr::new(ptr::null_mut()),
                bump: AtomicUsize::new(DATA_OFFSET),
                id,
                map: ManuallyDrop::new(map),
            });
        }
        Ok(base)
    }

    /// Unmaps a region.
    ///
    /// # Safety
    ///
    /// No reference into the region may be used afterwards, and the region
    /// must not be on any list.
    pub(crate) unsafe fn release(region: NonNull<Self>) -> io::Result<()> {
        // SAFETY: the caller hands over a live region.
        debug_assert!(unsafe { region.as_ref() }.is_valid());
        // SAFETY: the map handle is moved out exactly once; the control block
        // is never read again.
        let map = unsafe { ptr::read(&raw const (*region.as_ptr()).map) };
        ManuallyDrop::into_inner(map).unmap()
    }

    fn base(&self) -> *mut u8 {
        ptr::from_ref(self).cast_mut().cast::<u8>()
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.magic == MAGIC_REGION
    }

    /// Offset of the first free byte. Objects below it are complete.
    pub(crate) fn top(&self) -> usize {
        self.bump.load(Ordering::Acquire)
    }

    pub(crate) fn have_room_for(&self, size: usize) -> bool {
        self.bump.load(Ordering::Relaxed) + footprint(size) <= REGION_SIZE
    }

    /// Bump-allocates an object. Callers check [`have_room_for`] first.
    ///
    /// The payload is zero: regions are never reused after release.
    ///
    /// [`have_room_for`]: Self::have_room_for
    pub(crate) fn make_room_for(&self, size: usize, kind: HeapKind, mark: u8) -> ObjectRef {
        let offset = self.bump.load(Ordering::Relaxed);
        debug_assert!(offset + footprint(size) <= REGION_SIZE);
        // SAFETY: the owner is the only writer of the bump pointer and the
        // range [offset, offset + footprint) is in bounds and unused.
        unsafe {
            let header = self.base().add(offset);
            header
                .cast::<ObjectHeader>()
                .write(ObjectHeader::new(size, kind, mark));
            self.bump.store(offset + footprint(size), Ordering::Release);
            ObjectRef::from_raw(NonNull::new_unchecked(header.add(HEADER_SIZE)))
        }
    }

    /// Iterates over every object allocated so far.
    pub(crate) fn objects(&self) -> Objects<'_> {
        self.objects_until(self.top())
    }

    /// Iterates over the objects below `end`, an earlier value of [`top`].
    /// The owner may keep allocating above it meanwhile.
    ///
    /// [`top`]: Self::top
    pub(crate) fn objects_until(&self, end: usize) -> Objects<'_> {
        debug_assert!(self.is_valid());
        debug_assert!(end <= self.top());
        Objects {
            region: self,
            offset: DATA_OFFSET,
            end,
        }
    }

    /// Retires every object below `end` that is not marked with `mark`, so
    /// it never reads as live again. Returns the number retired this time.
    pub(crate) fn retire_unmarked(&self, mark: u8, end: usize) -> usize {
        let mut retired = 0;
        for object in self.objects_until(end) {
            if !object.is_marked(mark) && !object.is_retired() {
                object.retire();
                retired += 1;
            }
        }
        retired
    }

    pub(crate) fn census(&self, mark: u8) -> Census {
        let mut census = Census::default();
        for object in self.objects() {
            census.objects += 1;
            if object.is_marked(mark) {
                census.live_objects += 1;
                census.live_bytes += footprint(object.header().size());
            }
        }
        census
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Write-protects the whole region. The control block becomes read-only
    /// too, so the region must already be off every list.
    pub(crate) fn protect_read_only(&self) -> io::Result<()> {
        self.read_only.store(true, Ordering::Release);
        self.map.protect(Protection::ReadOnly)
    }
}

pub(crate) struct Objects<'a> {
    region: &'a Region,
    offset: usize,
    end: usize,
}

impl Iterator for Objects<'_> {
    type Item = ObjectRef;

    fn next(&mut self) -> Option<ObjectRef> {
        if self.offset >= self.end {
            return None;
        }
        // SAFETY: offsets below the bump pointer always start a header
        // written by `make_room_for`.
        unsafe {
            let header = self.region.base().add(self.offset);
            let size = (*header.cast::<ObjectHeader>()).size();
            self.offset += footprint(size);
            Some(ObjectRef::from_raw(NonNull::new_unchecked(
                header.add(HEADER_SIZE),
            )))
        }
    }
}
