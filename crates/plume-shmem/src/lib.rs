//! Shared-memory building blocks for the plume command-streaming transport.
//!
//! This crate provides:
//! - [`Region`]: an OS-backed, shareable block of memory named by a move-only
//!   handle, with four capability levels (see [`Capability`]).
//! - [`Mapping`]: an RAII virtual-memory view of exactly one region.
//! - [`Cursor`]: resilient sequential read/write over a region too large (or
//!   an address space too fragmented) to map in one piece.
//! - [`sem`]: a counting semaphore over a futex word living inside a shared
//!   mapping, used by the transport for cross-process wakeups.
//!
//! Regions are backed by `memfd_create` with grow/shrink seals, so a region's
//! size can never change after creation. Handles move between processes as
//! file descriptors; [`Region::from_handle`] performs the safety checks an
//! untrusted handle must pass before this process will map it.

mod cursor;
mod mapping;
mod region;
pub mod sem;

pub use cursor::Cursor;
pub use mapping::Mapping;
pub use region::{Capability, Region};

/// Errors from region/mapping/cursor operations.
///
/// `Exhausted` and `MapFailed` are recoverable: callers such as the stream
/// writer treat them as "try smaller / try later", not as connection
/// failures.
#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    /// The OS refused to provide backing memory (fd limits, memory limits).
    #[error("shared memory exhausted: {0}")]
    Exhausted(std::io::Error),

    /// A mapping could not be established (address-space exhaustion).
    #[error("mapping failed: {0}")]
    MapFailed(std::io::Error),

    /// The requested capability does not permit the operation.
    #[error("operation not permitted for {0:?} region")]
    Capability(Capability),

    /// A handle received from another process failed the safety checks.
    #[error("unsafe foreign handle: {0}")]
    UnsafeHandle(&'static str),

    /// Read/write outside the region bounds, or through an invalidated
    /// cursor.
    #[error("out of range: offset {offset} len {len} in region of {size} bytes")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    /// The cursor's chunk size shrank below the allocation granularity
    /// without a successful mapping.
    #[error("cursor could not map any chunk at the allocation granularity")]
    GranularityFloor,

    /// Underlying OS error not covered above.
    #[error("os error: {0}")]
    Os(std::io::Error),
}

/// System allocation granularity (page size). Mappings and cursor chunks are
/// aligned to this.
pub fn allocation_granularity() -> usize {
    // SAFETY: sysconf is always safe to call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}

pub(crate) fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}
