use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Protection;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

#[derive(Debug)]
pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping wherever the kernel places it.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let ptr = unsafe { raw_map(len)? };
        Ok(Self { ptr, len })
    }

    /// Maps `len` bytes whose start is a multiple of `align`.
    ///
    /// Reserves `len + align` bytes and unmaps the unaligned head and the
    /// excess tail, leaving exactly `len` bytes mapped.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap` and `munmap`.
    pub unsafe fn map_anon_aligned(len: usize, align: usize) -> io::Result<Self> {
        let reserve_len = len
            .checked_add(align)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

        let base = unsafe { raw_map(reserve_len)? } as usize;
        let aligned = (base + align - 1) & !(align - 1);
        let head = aligned - base;
        let tail = reserve_len - head - len;

        unsafe {
            if head > 0 {
                libc::munmap(base as *mut libc::c_void, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    /// Changes the protection of the whole mapping.
    ///
    /// # Safety
    ///
    /// Callers must not hold writable references into the range when making it
    /// read-only.
    pub unsafe fn protect(&self, protection: Protection) -> io::Result<()> {
        let prot = match protection {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadOnly => libc::PROT_READ,
        };
        if unsafe { libc::mprotect(self.ptr, self.len, prot) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn unmap(self) -> io::Result<()> {
        let res = unsafe { libc::munmap(self.ptr, self.len) };
        std::mem::forget(self);
        if res != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

unsafe fn raw_map(len: usize) -> io::Result<*mut libc::c_void> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr)
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
