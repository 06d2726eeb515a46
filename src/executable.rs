use core::fmt;
use core::mem::size_of;

use crate::code_buffer::CodeBuffer;
use crate::memory::allocator::{DefaultAllocator, RegionAllocator};

/// Finalized, read+execute code produced by [`CodeBuffer::finalize`].
///
/// Dropping the handle releases the underlying memory.
pub struct ExecutableCode<A: RegionAllocator = DefaultAllocator> {
    buffer: CodeBuffer<A>,
}

impl<A: RegionAllocator> ExecutableCode<A> {
    pub(crate) fn new(buffer: CodeBuffer<A>) -> Self {
        debug_assert!(buffer.is_executable() && !buffer.is_dirty());
        Self { buffer }
    }

    pub fn start(&self) -> *const u8 {
        self.buffer.start_address()
    }

    pub fn end(&self) -> *const u8 {
        self.buffer.cursor_address()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.size_in_bytes()
    }

    pub fn contains(&self, address: *const u8) -> bool {
        let start = self.start() as usize;
        let end = self.end() as usize;
        let address = address as usize;
        address >= start && address < end
    }

    /// The finalized machine code.
    pub fn code(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Reinterprets the start of the code as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// The code must be a valid function for the current target with the
    /// signature and calling convention of `F`, and the returned pointer must
    /// not be called after `self` is dropped.
    pub unsafe fn entry_point<F: Copy>(&self) -> F {
        self.entry_point_at(0)
    }

    /// Like [`ExecutableCode::entry_point`], for a function starting at
    /// `offset` bytes into the code.
    ///
    /// # Safety
    ///
    /// Same as [`ExecutableCode::entry_point`].
    pub unsafe fn entry_point_at<F: Copy>(&self, offset: usize) -> F {
        assert_eq!(
            size_of::<F>(),
            size_of::<*const u8>(),
            "entry point type must be a function pointer"
        );
        assert!(
            offset < self.size_in_bytes(),
            "entry point offset {} outside {} bytes of code",
            offset,
            self.size_in_bytes()
        );
        let address = self.start().add(offset);
        core::mem::transmute_copy(&address)
    }

    /// Returns the memory to the writable state for further emission. The
    /// cursor is kept where it was.
    pub fn into_writable(self) -> CodeBuffer<A> {
        let mut buffer = self.buffer;
        buffer.make_writable();
        buffer
    }
}

impl<A: RegionAllocator> fmt::Debug for ExecutableCode<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableCode")
            .field("start", &self.start())
            .field("size", &self.size_in_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::allocator::PageAllocator;
    use crate::CodeBuffer;

    #[test]
    fn finalize_exposes_code_range() {
        let mut buffer = CodeBuffer::<PageAllocator>::with_capacity(32);
        buffer.emit_data(&[0x90, 0x90, 0xc3]);
        let start = buffer.start_address();

        let code = buffer.finalize();
        assert_eq!(code.start(), start);
        assert_eq!(code.size_in_bytes(), 3);
        assert_eq!(code.code(), &[0x90, 0x90, 0xc3]);
        assert!(code.contains(start));
        assert!(code.contains(start.wrapping_add(2)));
        assert!(!code.contains(code.end()));
    }

    #[test]
    fn into_writable_continues_emission() {
        let mut buffer = CodeBuffer::<PageAllocator>::with_capacity(32);
        buffer.emit_data(&[1, 2]);
        let mut buffer = buffer.finalize().into_writable();
        assert!(!buffer.is_dirty());
        assert!(!buffer.is_executable());
        assert_eq!(buffer.cursor_offset(), 2);
        buffer.emit_data(&[3]);
        assert_eq!(buffer.data(), &[1, 2, 3]);
        buffer.set_clean();
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn entry_point_outside_code_panics() {
        let code = CodeBuffer::<PageAllocator>::with_capacity(32).finalize();
        let _: extern "C" fn() = unsafe { code.entry_point() };
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    fn finalized_code_runs() {
        let mut buffer = CodeBuffer::<PageAllocator>::with_capacity(64);
        // mov eax, 42; ret
        buffer.emit_data(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
        let code = buffer.finalize();
        let function: extern "C" fn() -> i32 = unsafe { code.entry_point() };
        assert_eq!(function(), 42);
    }
}
