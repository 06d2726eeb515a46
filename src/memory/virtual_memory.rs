//! Page-granular memory from the operating system.
//!
//! Every platform provides the same four primitives: report the page size,
//! map fresh read-write pages, switch a mapping between read-write and
//! read-execute, and unmap it again.

use once_cell::sync::OnceCell;

use super::*;
use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct MemoryRegion {
    pointer: *mut u8,
    size: usize,
}

impl MemoryRegion {
    pub const EMPTY: Self = Self::new(core::ptr::null_mut(), 0);

    pub const fn new(pointer: *mut u8, size: usize) -> Self {
        Self { pointer, size }
    }

    pub fn start(&self) -> usize {
        self.pointer as _
    }

    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    pub fn pointer(&self) -> *mut u8 {
        self.pointer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.pointer.is_null()
    }

    pub fn contains(&self, address: usize) -> bool {
        (address >= self.start()) && (address < self.end())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
}

/// Operating system page mapping.
///
/// # Safety
///
/// `map` must return page-aligned, read-write memory of at least `size` bytes
/// that stays valid until it is passed to `unmap`.
pub unsafe trait VirtualMemoryImpl: 'static + Sized {
    fn calculate_page_size() -> usize;

    /// Maps `size` bytes of zeroed read-write memory. `size` is a multiple of
    /// the page size.
    fn map(size: usize) -> Result<*mut u8>;

    /// # Safety
    ///
    /// `address` and `size` must describe a mapping returned by [`Self::map`]
    /// that has not been unmapped yet.
    unsafe fn unmap(address: *mut u8, size: usize) -> Result<()>;

    /// # Safety
    ///
    /// `address` must be page aligned and `[address, address + size)` must lie
    /// inside a live mapping returned by [`Self::map`].
    unsafe fn protect(address: *mut u8, size: usize, mode: Protection) -> Result<()>;
}

#[cfg(unix)]
pub mod posix {
    use core::ptr::null_mut;

    use super::*;
    use crate::error::last_os_error;

    pub struct PosixVirtualMemory;

    unsafe impl VirtualMemoryImpl for PosixVirtualMemory {
        fn calculate_page_size() -> usize {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size <= 0 {
                4096
            } else {
                size as usize
            }
        }

        fn map(size: usize) -> Result<*mut u8> {
            assert!(
                is_aligned(size, page_size()),
                "{} not aligned to page size",
                size
            );

            let result = unsafe {
                libc::mmap(
                    null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if result.is_null() || result == libc::MAP_FAILED {
                return Err(Error::Allocation {
                    size,
                    source: last_os_error(),
                });
            }

            Ok(result.cast())
        }

        unsafe fn unmap(address: *mut u8, size: usize) -> Result<()> {
            if size == 0 {
                return Ok(());
            }

            if libc::munmap(address.cast(), size) != 0 {
                return Err(Error::Release {
                    address: address as usize,
                    size,
                    source: last_os_error(),
                });
            }

            Ok(())
        }

        unsafe fn protect(address: *mut u8, size: usize, mode: Protection) -> Result<()> {
            let prot = match mode {
                Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
                Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            };

            if libc::mprotect(address.cast(), size, prot) != 0 {
                return Err(Error::Protect {
                    address: address as usize,
                    size,
                    mode,
                    source: last_os_error(),
                });
            }

            Ok(())
        }
    }
}

#[cfg(windows)]
pub mod win {
    use winapi::um::memoryapi::*;
    use winapi::um::sysinfoapi::*;
    use winapi::um::winnt::*;

    use core::mem::MaybeUninit;
    use core::ptr::null_mut;

    use super::*;
    use crate::error::last_os_error;

    pub struct WinVirtualMemory;

    unsafe impl VirtualMemoryImpl for WinVirtualMemory {
        fn calculate_page_size() -> usize {
            unsafe {
                let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed().assume_init();

                GetSystemInfo(&mut info as LPSYSTEM_INFO);

                info.dwPageSize as usize
            }
        }

        fn map(size: usize) -> Result<*mut u8> {
            assert!(is_aligned(size, page_size()));

            let address =
                unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };

            if address.is_null() {
                return Err(Error::Allocation {
                    size,
                    source: last_os_error(),
                });
            }

            Ok(address.cast())
        }

        unsafe fn unmap(address: *mut u8, size: usize) -> Result<()> {
            // MEM_RELEASE frees the whole reservation and requires a zero size.
            if VirtualFree(address.cast(), 0, MEM_RELEASE) == 0 {
                return Err(Error::Release {
                    address: address as usize,
                    size,
                    source: last_os_error(),
                });
            }

            Ok(())
        }

        unsafe fn protect(address: *mut u8, size: usize, mode: Protection) -> Result<()> {
            let prot = match mode {
                Protection::ReadWrite => PAGE_READWRITE,
                Protection::ReadExecute => PAGE_EXECUTE_READ,
            };

            let mut old = 0;
            if VirtualProtect(address.cast(), size, prot, &mut old) == 0 {
                return Err(Error::Protect {
                    address: address as usize,
                    size,
                    mode,
                    source: last_os_error(),
                });
            }

            Ok(())
        }
    }
}

#[cfg(miri)]
pub mod miri {
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    use super::*;

    /// Heap-backed stand-in; miri cannot model page protection.
    pub struct MiriVirtualMemory;

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, page_size()).map_err(|e| Error::Allocation {
            size,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })
    }

    unsafe impl VirtualMemoryImpl for MiriVirtualMemory {
        fn calculate_page_size() -> usize {
            4096
        }

        fn map(size: usize) -> Result<*mut u8> {
            assert!(is_aligned(size, page_size()));
            let address = unsafe { alloc_zeroed(layout(size)?) };
            if address.is_null() {
                return Err(Error::Allocation {
                    size,
                    source: std::io::ErrorKind::OutOfMemory.into(),
                });
            }
            Ok(address)
        }

        unsafe fn unmap(address: *mut u8, size: usize) -> Result<()> {
            dealloc(address, layout(size)?);
            Ok(())
        }

        unsafe fn protect(_: *mut u8, _: usize, _: Protection) -> Result<()> {
            Ok(())
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        pub type PlatformVirtualMemory = miri::MiriVirtualMemory;
    } else if #[cfg(windows)] {
        pub type PlatformVirtualMemory = win::WinVirtualMemory;
    } else if #[cfg(unix)] {
        pub type PlatformVirtualMemory = posix::PosixVirtualMemory;
    } else {
        compile_error!("page-mapped code memory is only available on unix and windows");
    }
}

/// System page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
    *PAGE_SIZE.get_or_init(PlatformVirtualMemory::calculate_page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let size = page_size();
        assert!(is_power_of_two(size));
        assert!(size >= 4096);
    }

    #[test]
    fn map_protect_unmap() {
        let size = page_size();
        let address = PlatformVirtualMemory::map(size).expect("map");
        assert!(is_aligned_ptr(address, size));

        unsafe {
            address.write(0xC3);
            PlatformVirtualMemory::protect(address, size, Protection::ReadExecute)
                .expect("protect rx");
            assert_eq!(address.read(), 0xC3);
            PlatformVirtualMemory::protect(address, size, Protection::ReadWrite)
                .expect("protect rw");
            address.add(1).write(0x90);
            assert_eq!(address.add(1).read(), 0x90);
            PlatformVirtualMemory::unmap(address, size).expect("unmap");
        }
    }

    #[test]
    fn region_bounds() {
        let region = MemoryRegion::new(0x1000 as *mut u8, 0x20);
        assert_eq!(region.end(), 0x1020);
        assert!(region.contains(0x1000));
        assert!(region.contains(0x101f));
        assert!(!region.contains(0x1020));
        assert!(MemoryRegion::EMPTY.is_null());
    }
}
