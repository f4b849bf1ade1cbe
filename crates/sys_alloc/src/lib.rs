use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Alignments requested through [`MmapOptions::align`] that are at or below this
/// value are satisfied for free.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Access protection of a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Pages may be read and written.
    ReadWrite,
    /// Pages may only be read; a write faults.
    ReadOnly,
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
#[derive(Debug)]
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` for a zero-length mapping.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Changes the access protection of the whole mapping.
    ///
    /// Switching a mapping to [`Protection::ReadOnly`] makes any later write to
    /// it fault. No handler for that fault is installed here.
    pub fn protect(&self, protection: Protection) -> io::Result<()> {
        // SAFETY: the range is exactly the one this handle owns.
        unsafe { self.inner.protect(protection) }
    }

    /// Unmaps the region now, reporting a failure instead of ignoring it the
    /// way dropping the handle does.
    pub fn unmap(self) -> io::Result<()> {
        self.inner.unmap()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self { len: 0, align: 0 }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the mapping to be a multiple of `align`.
    ///
    /// `align` must be a power of two. Alignments above the allocation
    /// granularity are obtained by over-reserving and trimming the excess.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Creates an anonymous, zero-filled, read-write memory map.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the `Mmap` is alive; any raw
    /// pointer derived from it dangles once the handle is dropped.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let inner = if self.align > allocation_granularity() {
            unsafe { os::MmapInner::map_anon_aligned(self.len, self.align)? }
        } else {
            unsafe { os::MmapInner::map_anon(self.len)? }
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
