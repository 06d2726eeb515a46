//! Allocation strategies for code buffer memory.
//!
//! The strategy is a type parameter of [`CodeBuffer`](crate::CodeBuffer), so
//! it is fixed at compile time. [`PageAllocator`] maps whole pages and can
//! flip them between writable and executable; [`HeapAllocator`] uses the
//! global allocator and cannot.

use core::marker::PhantomData;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use super::virtual_memory::{page_size, MemoryRegion, PlatformVirtualMemory, Protection, VirtualMemoryImpl};
use super::*;
use crate::error::{Error, Result};

/// A source of raw code memory.
///
/// # Safety
///
/// `allocate` must hand out exclusively owned, zeroed, read-write memory of at
/// least the requested size that stays valid until passed back to `release`.
pub unsafe trait RegionAllocator: 'static + Sized {
    /// Backend name used in diagnostics.
    const NAME: &'static str;

    /// Whether [`Self::protect`] can succeed.
    const SUPPORTS_PROTECTION: bool;

    /// Allocates at least `size` bytes. The returned region may be larger
    /// than requested.
    fn allocate(size: usize) -> Result<MemoryRegion>;

    /// # Safety
    ///
    /// `region` must be exactly what [`Self::allocate`] returned and must not
    /// be used afterwards.
    unsafe fn release(region: MemoryRegion) -> Result<()>;

    /// # Safety
    ///
    /// `region` must be a live region returned by [`Self::allocate`]. No
    /// references into it may be written through while it is executable.
    unsafe fn protect(region: MemoryRegion, mode: Protection) -> Result<()> {
        let _ = (region, mode);
        Err(Error::ProtectionUnsupported { backend: Self::NAME })
    }
}

/// Code memory from the global heap, aligned to the instruction word.
pub struct HeapAllocator;

impl HeapAllocator {
    fn layout(size: usize) -> Result<Layout> {
        if size == 0 {
            return Err(Error::Allocation {
                size,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "zero-sized code allocation",
                ),
            });
        }
        Layout::from_size_align(size, CODE_ALIGNMENT).map_err(|e| Error::Allocation {
            size,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })
    }
}

unsafe impl RegionAllocator for HeapAllocator {
    const NAME: &'static str = "heap";
    const SUPPORTS_PROTECTION: bool = false;

    fn allocate(size: usize) -> Result<MemoryRegion> {
        let pointer = unsafe { alloc_zeroed(Self::layout(size)?) };
        if pointer.is_null() {
            return Err(Error::Allocation {
                size,
                source: std::io::ErrorKind::OutOfMemory.into(),
            });
        }

        log::trace!("heap: allocated {} bytes at {:p}", size, pointer);
        Ok(MemoryRegion::new(pointer, size))
    }

    unsafe fn release(region: MemoryRegion) -> Result<()> {
        log::trace!("heap: releasing {} bytes at {:p}", region.size(), region.pointer());
        dealloc(region.pointer(), Self::layout(region.size())?);
        Ok(())
    }
}

/// Code memory mapped directly from the operating system, one or more whole
/// pages per allocation.
pub struct PageAllocator<VM: VirtualMemoryImpl = PlatformVirtualMemory> {
    marker: PhantomData<&'static VM>,
}

unsafe impl<VM: VirtualMemoryImpl> RegionAllocator for PageAllocator<VM> {
    const NAME: &'static str = "page";
    const SUPPORTS_PROTECTION: bool = true;

    fn allocate(size: usize) -> Result<MemoryRegion> {
        let mapped = checked_round_up(size, page_size()).ok_or_else(|| Error::Allocation {
            size,
            source: std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "code allocation size overflows when rounded to pages",
            ),
        })?;
        let pointer = VM::map(mapped)?;

        log::trace!(
            "page: mapped {} bytes ({} requested) at {:p}",
            mapped,
            size,
            pointer
        );
        Ok(MemoryRegion::new(pointer, mapped))
    }

    unsafe fn release(region: MemoryRegion) -> Result<()> {
        log::trace!("page: unmapping {} bytes at {:p}", region.size(), region.pointer());
        VM::unmap(region.pointer(), region.size())
    }

    unsafe fn protect(region: MemoryRegion, mode: Protection) -> Result<()> {
        log::trace!(
            "page: {:?} for {} bytes at {:p}",
            mode,
            region.size(),
            region.pointer()
        );
        VM::protect(region.pointer(), region.size(), mode)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "heap-backend")] {
        pub type DefaultAllocator = HeapAllocator;
    } else {
        pub type DefaultAllocator = PageAllocator;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocation_is_word_aligned_and_zeroed() {
        let region = HeapAllocator::allocate(37).unwrap();
        assert_eq!(region.size(), 37);
        assert!(is_aligned_ptr(region.pointer(), CODE_ALIGNMENT));
        let bytes = unsafe { core::slice::from_raw_parts(region.pointer(), region.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { HeapAllocator::release(region).unwrap() };
    }

    #[test]
    fn heap_cannot_protect() {
        let region = HeapAllocator::allocate(16).unwrap();
        let err = unsafe { HeapAllocator::protect(region, Protection::ReadExecute) }.unwrap_err();
        assert!(matches!(err, Error::ProtectionUnsupported { backend: "heap" }));
        unsafe { HeapAllocator::release(region).unwrap() };
    }

    #[test]
    fn page_allocation_size_overflow_is_an_error() {
        let err = <PageAllocator>::allocate(usize::MAX - 10).unwrap_err();
        assert!(matches!(err, Error::Allocation { size, .. } if size == usize::MAX - 10));
    }

    #[test]
    fn page_allocation_rounds_to_pages() {
        let region = <PageAllocator>::allocate(100).unwrap();
        assert_eq!(region.size(), page_size());
        assert!(is_aligned_ptr(region.pointer(), page_size()));
        unsafe {
            <PageAllocator>::protect(region, Protection::ReadExecute).unwrap();
            <PageAllocator>::protect(region, Protection::ReadWrite).unwrap();
            <PageAllocator>::release(region).unwrap();
        }
    }
}
