//! A fixed-capacity code buffer for JIT compilers.
//!
//! An assembler appends encoded instructions to a [`CodeBuffer`], patches
//! forward references in place, and finally flips the memory to executable
//! with [`CodeBuffer::finalize`]:
//!
//! ```no_run
//! use jitbuf::{CodeBuffer, PageAllocator};
//!
//! let mut buffer = CodeBuffer::<PageAllocator>::with_capacity(64);
//! buffer.emit_data(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]); // mov eax, 42; ret
//! let code = buffer.finalize();
//! let answer: extern "C" fn() -> i32 = unsafe { code.entry_point() };
//! assert_eq!(answer(), 42);
//! ```
//!
//! Memory comes from a [`RegionAllocator`] chosen at compile time. The default
//! maps pages from the operating system; enabling the `heap-backend` feature
//! switches it to the global heap, which cannot be made executable.

pub mod code_buffer;
pub mod error;
pub mod executable;
pub mod memory;

pub use code_buffer::CodeBuffer;
pub use error::{Error, Result};
pub use executable::ExecutableCode;
pub use memory::allocator::{DefaultAllocator, HeapAllocator, PageAllocator, RegionAllocator};
pub use memory::virtual_memory::{page_size, Protection};
