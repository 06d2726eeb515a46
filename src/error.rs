use std::io;

use crate::memory::virtual_memory::Protection;

/// Failures reported by the memory backends.
///
/// [`CodeBuffer`](crate::CodeBuffer) treats every one of these as fatal; the
/// `Result` surface exists for [`CodeBuffer::try_with_capacity`](crate::CodeBuffer::try_with_capacity)
/// and for callers driving an allocator directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate {size} bytes of code memory: {source}")]
    Allocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("allocator returned {address:#x}, which is not aligned to {alignment} bytes")]
    Misaligned { address: usize, alignment: usize },

    #[error("failed to release {size} bytes of code memory at {address:#x}: {source}")]
    Release {
        address: usize,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to change protection of {size} bytes at {address:#x} to {mode:?}: {source}")]
    Protect {
        address: usize,
        size: usize,
        mode: Protection,
        #[source]
        source: io::Error,
    },

    #[error("the {backend} backend cannot change memory protection")]
    ProtectionUnsupported { backend: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Captures the calling thread's last OS error.
pub(crate) fn last_os_error() -> io::Error {
    io::Error::from_raw_os_error(errno::errno().0)
}
