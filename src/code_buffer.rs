use core::fmt;
use core::marker::PhantomData;

use num_traits::ToBytes;

use crate::error::{Error, Result};
use crate::executable::ExecutableCode;
use crate::memory::allocator::{DefaultAllocator, RegionAllocator};
use crate::memory::virtual_memory::{MemoryRegion, Protection};
use crate::memory::{is_aligned_ptr, is_power_of_two, padding_for, CODE_ALIGNMENT};

/// Zero-fill on reset and the extra consistency checks.
const DIAGNOSTICS: bool = cfg!(any(debug_assertions, feature = "diagnostics"));

/// A fixed-capacity region that machine code is assembled into.
///
/// Bytes are appended at a cursor and may later be patched in place. Once a
/// unit of code is complete the owner acknowledges it with [`set_clean`],
/// [`reset`] or [`finalize`]; dropping a buffer that still holds
/// unacknowledged writes panics.
///
/// The memory either comes from `A` (managed) or from the caller
/// ([`CodeBuffer::from_raw`]), in which case it is never released here.
///
/// [`set_clean`]: CodeBuffer::set_clean
/// [`reset`]: CodeBuffer::reset
/// [`finalize`]: CodeBuffer::finalize
pub struct CodeBuffer<A: RegionAllocator = DefaultAllocator> {
    /// Backing memory. For managed buffers this is exactly what `A` returned
    /// and may be larger than `capacity`.
    region: MemoryRegion,
    capacity: usize,
    cursor: usize,
    dirty: bool,
    managed: bool,
    protection: Protection,
    marker: PhantomData<A>,
}

unsafe impl<A: RegionAllocator> Send for CodeBuffer<A> {}

impl<A: RegionAllocator> CodeBuffer<A> {
    /// Allocates a buffer of `capacity` bytes.
    ///
    /// A zero capacity produces an empty buffer without backing memory.
    ///
    /// # Panics
    ///
    /// If the allocator fails or returns memory that is not word aligned.
    pub fn with_capacity(capacity: usize) -> Self {
        match Self::try_with_capacity(capacity) {
            Ok(buffer) => buffer,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::from_parts(MemoryRegion::EMPTY, 0, true));
        }

        let region = A::allocate(capacity)?;
        if !is_aligned_ptr(region.pointer(), CODE_ALIGNMENT) {
            let address = region.start();
            if let Err(err) = unsafe { A::release(region) } {
                log::error!("{}", err);
            }
            return Err(Error::Misaligned {
                address,
                alignment: CODE_ALIGNMENT,
            });
        }

        Ok(Self::from_parts(region, capacity, true))
    }

    /// Wraps caller-owned memory. The buffer never releases it.
    ///
    /// # Safety
    ///
    /// `pointer` must be valid for reads and writes of `capacity` bytes for
    /// the lifetime of the buffer and must not be accessed through any other
    /// path meanwhile. Protection changes are forwarded to `A`, so they also
    /// require page-aligned memory that `A` knows how to protect.
    ///
    /// # Panics
    ///
    /// If `pointer` is null.
    pub unsafe fn from_raw(pointer: *mut u8, capacity: usize) -> Self {
        assert!(!pointer.is_null(), "cannot wrap a null code buffer");
        Self::from_parts(MemoryRegion::new(pointer, capacity), capacity, false)
    }

    fn from_parts(region: MemoryRegion, capacity: usize, managed: bool) -> Self {
        Self {
            region,
            capacity,
            cursor: 0,
            dirty: false,
            managed,
            protection: Protection::ReadWrite,
            marker: PhantomData,
        }
    }

    /// Switches the memory to read+execute.
    ///
    /// # Panics
    ///
    /// If `A` cannot change protection or the operating system refuses. With
    /// the `strict` feature, also if the buffer is dirty.
    pub fn make_executable(&mut self) {
        #[cfg(feature = "strict")]
        assert!(
            !self.dirty,
            "code buffer made executable while dirty; call set_clean() first"
        );
        self.set_protection(Protection::ReadExecute);
    }

    /// Switches the memory back to read+write.
    ///
    /// # Panics
    ///
    /// Same as [`CodeBuffer::make_executable`], minus the dirty check.
    pub fn make_writable(&mut self) {
        self.set_protection(Protection::ReadWrite);
    }

    fn set_protection(&mut self, mode: Protection) {
        if !A::SUPPORTS_PROTECTION {
            panic!("{}", Error::ProtectionUnsupported { backend: A::NAME });
        }

        if !self.region.is_null() {
            if let Err(err) = unsafe { A::protect(self.region, mode) } {
                panic!("{}", err);
            }
        }
        self.protection = mode;
    }

    /// Appends `data` at the cursor.
    pub fn emit_data(&mut self, data: &[u8]) {
        self.ensure_space_for(data.len());
        self.assert_writable();
        self.dirty = true;
        if data.is_empty() {
            return;
        }
        unsafe {
            self.cursor_ptr()
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        self.cursor += data.len();
    }

    /// Overwrites already emitted bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// If `offset + data.len()` is past the cursor.
    pub fn update_data(&mut self, offset: usize, data: &[u8]) {
        let in_bounds = offset
            .checked_add(data.len())
            .is_some_and(|end| end <= self.cursor);
        assert!(
            in_bounds,
            "code buffer patch of {} bytes at offset {} extends past cursor {}",
            data.len(),
            offset,
            self.cursor
        );
        self.assert_writable();
        self.dirty = true;
        if data.is_empty() {
            return;
        }
        unsafe {
            self.region
                .pointer()
                .add(offset)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
    }

    pub fn emit_zeroed_bytes(&mut self, n: usize) {
        self.ensure_space_for(n);
        self.assert_writable();
        self.dirty = true;
        if n == 0 {
            return;
        }
        unsafe {
            self.cursor_ptr().write_bytes(0, n);
        }
        self.cursor += n;
    }

    /// Pads with zeros up to the next instruction word boundary.
    pub fn align(&mut self) {
        self.align_to(CODE_ALIGNMENT);
    }

    /// Pads with zeros until the cursor offset is a multiple of `boundary`,
    /// which must be a power of two.
    pub fn align_to(&mut self, boundary: usize) {
        assert!(
            is_power_of_two(boundary),
            "code buffer alignment {} is not a power of two",
            boundary
        );
        let padding = padding_for(self.cursor, boundary);
        debug_assert!(padding < boundary);
        self.emit_zeroed_bytes(padding);
    }

    /// Appends the bytes of `string` followed by a NUL terminator.
    pub fn emit_string(&mut self, string: &str) {
        self.ensure_space_for(string.len() + 1);
        self.emit_data(string.as_bytes());
        self.emit_u8(0);
    }

    /// Appends `value` in little-endian byte order.
    pub fn emit<T: ToBytes>(&mut self, value: T) {
        self.emit_data(value.to_le_bytes().as_ref());
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.emit(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit(value);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit(value);
    }

    /// Rewinds the cursor to start reusing the buffer from scratch.
    ///
    /// With diagnostics enabled, writable managed memory is zero-filled first
    /// so stale code cannot be mistaken for fresh output. Executable memory
    /// keeps its contents and its protection.
    pub fn reset(&mut self) {
        if DIAGNOSTICS
            && self.managed
            && !self.region.is_null()
            && self.protection == Protection::ReadWrite
        {
            unsafe {
                self.region.pointer().write_bytes(0, self.capacity);
            }
        }
        log::debug!(
            "reset code buffer at {:p}, discarding {} bytes",
            self.region.pointer(),
            self.cursor
        );
        self.cursor = 0;
        self.set_clean();
    }

    /// Moves the cursor back to `offset`, discarding everything after it.
    pub fn rewind(&mut self, offset: usize) {
        assert!(
            offset <= self.cursor,
            "cannot rewind code buffer forward from {} to {}",
            self.cursor,
            offset
        );
        self.cursor = offset;
        self.dirty = true;
    }

    /// Acknowledges every write so far.
    pub fn set_clean(&mut self) {
        self.dirty = false;
    }

    /// Capacity is fixed at construction; this always panics.
    pub fn grow(&mut self, new_capacity: usize) -> ! {
        panic!(
            "code buffer overflow: cannot grow from {} to {} bytes, allocate a larger buffer instead",
            self.capacity, new_capacity
        );
    }

    pub fn ensure_space_for(&mut self, amount: usize) {
        if !self.has_space_for(amount) {
            self.grow(self.cursor.saturating_add(amount));
        }
    }

    pub fn has_space_for(&self, amount: usize) -> bool {
        amount <= self.remaining_bytes()
    }

    pub fn remaining_bytes(&self) -> usize {
        self.capacity - self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor_offset(&self) -> usize {
        self.cursor
    }

    pub fn size_in_bytes(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn is_executable(&self) -> bool {
        self.protection == Protection::ReadExecute
    }

    pub fn start_address(&self) -> *const u8 {
        self.region.pointer()
    }

    pub fn start_address_mut(&mut self) -> *mut u8 {
        self.region.pointer()
    }

    pub fn cursor_address(&self) -> *const u8 {
        self.region.pointer().wrapping_add(self.cursor)
    }

    pub fn offset_address(&self, offset: usize) -> *const u8 {
        assert!(
            offset <= self.cursor,
            "code buffer offset {} is past cursor {}",
            offset,
            self.cursor
        );
        self.region.pointer().wrapping_add(offset)
    }

    /// The bytes emitted so far.
    pub fn data(&self) -> &[u8] {
        if self.region.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.region.pointer(), self.cursor) }
    }

    /// Acknowledges all writes and turns the buffer into runnable code.
    ///
    /// # Panics
    ///
    /// If `A` cannot make memory executable.
    pub fn finalize(mut self) -> ExecutableCode<A> {
        self.set_clean();
        self.make_executable();
        log::debug!(
            "finalized {} bytes of code at {:p}",
            self.cursor,
            self.region.pointer()
        );
        ExecutableCode::new(self)
    }

    fn cursor_ptr(&mut self) -> *mut u8 {
        unsafe { self.region.pointer().add(self.cursor) }
    }

    fn assert_writable(&self) {
        assert!(
            self.protection == Protection::ReadWrite,
            "write to code buffer at {:p} while it is executable",
            self.region.pointer()
        );
    }
}

impl<A: RegionAllocator> Drop for CodeBuffer<A> {
    fn drop(&mut self) {
        if self.dirty && !std::thread::panicking() {
            panic!(
                "code buffer dropped while dirty ({} bytes emitted); call set_clean(), reset() or finalize() first",
                self.cursor
            );
        }

        if self.managed && !self.region.is_null() {
            if let Err(err) = unsafe { A::release(self.region) } {
                log::error!("{}", err);
            }
        }
    }
}

impl<A: RegionAllocator> fmt::Debug for CodeBuffer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("backend", &A::NAME)
            .field("start", &self.region.pointer())
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("dirty", &self.dirty)
            .field("managed", &self.managed)
            .field("protection", &self.protection)
            .finish()
    }
}
