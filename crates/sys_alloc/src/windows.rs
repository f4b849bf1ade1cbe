use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::Protection;

/// Attempts at re-reserving an aligned address that another thread may steal
/// between the release and the re-reserve.
#[cfg(not(miri))]
const ALIGNED_MAP_ATTEMPTS: usize = 16;

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

#[derive(Debug)]
pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    #[cfg(miri)]
    align: usize,
}

impl MmapInner {
    /// Creates a new anonymous memory mapping wherever the system places it.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            unsafe { Self::miri_alloc(len, allocation_granularity()) }
        }
        #[cfg(not(miri))]
        {
            let ptr =
                unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    /// Maps `len` bytes whose start is a multiple of `align`.
    ///
    /// Windows cannot partially release a reservation, so an oversized range is
    /// reserved to find an aligned address, released, and re-reserved at it.
    pub unsafe fn map_anon_aligned(len: usize, align: usize) -> io::Result<Self> {
        #[cfg(miri)]
        {
            unsafe { Self::miri_alloc(len, align) }
        }
        #[cfg(not(miri))]
        {
            let reserve_len = len
                .checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;

            for _ in 0..ALIGNED_MAP_ATTEMPTS {
                let reservation =
                    unsafe { VirtualAlloc(ptr::null(), reserve_len, MEM_RESERVE, PAGE_READWRITE) };
                if reservation.is_null() {
                    return Err(Error::last_os_error());
                }
                let aligned = ((reservation as usize) + align - 1) & !(align - 1);
                unsafe { VirtualFree(reservation, 0, MEM_RELEASE) };

                let ptr = unsafe {
                    VirtualAlloc(
                        aligned as *const std::ffi::c_void,
                        len,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(Self { ptr, len });
                }
            }
            Err(Error::from(io::ErrorKind::AddrInUse))
        }
    }

    pub unsafe fn protect(&self, protection: Protection) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = protection;
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let flags = match protection {
                Protection::ReadWrite => PAGE_READWRITE,
                Protection::ReadOnly => PAGE_READONLY,
            };
            let mut old: PAGE_PROTECTION_FLAGS = 0;
            if unsafe { VirtualProtect(self.ptr, self.len, flags, &mut old) } == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub fn unmap(self) -> io::Result<()> {
        #[cfg(miri)]
        {
            drop(self);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            // MEM_RELEASE requires dwSize to be 0
            let ok = unsafe { VirtualFree(self.ptr, 0, MEM_RELEASE) };
            mem::forget(self);
            if ok == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    #[cfg(miri)]
    unsafe fn miri_alloc(len: usize, align: usize) -> io::Result<Self> {
        use std::alloc::{alloc_zeroed, Layout};
        // Miri doesn't support VirtualAlloc, use std::alloc
        let layout =
            Layout::from_size_align(len, align).map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::from(io::ErrorKind::OutOfMemory));
        }
        Ok(Self {
            ptr: ptr.cast::<std::ffi::c_void>(),
            len,
            align,
        })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, self.align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
