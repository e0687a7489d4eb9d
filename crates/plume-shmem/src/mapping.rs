use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ShmemError;

/// Process-wide count of live mappings, for leak diagnostics.
static ACTIVE_MAPPINGS: AtomicUsize = AtomicUsize::new(0);

/// A local virtual-memory view of one [`Region`](crate::Region).
///
/// Move-only; unmaps on drop. Reads and writes are bounds-checked memcpys.
/// Concurrent mutation is only legal for the control region, whose contents
/// are accessed through atomics via [`Mapping::as_ptr`]; data buffers are
/// exclusively owned by one side at a time per the transport protocol.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

// SAFETY: the mapping points at shared memory, not thread-local state; all
// cross-thread/cross-process access is synchronized by the transport protocol
// (atomics in the control block, exclusive buffer ownership elsewhere).
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// # Safety
    ///
    /// `ptr` must be a live `mmap` result of `len` bytes; the caller hands
    /// over the munmap obligation.
    pub(crate) unsafe fn from_raw(ptr: *mut u8, len: usize, writable: bool) -> Mapping {
        ACTIVE_MAPPINGS.fetch_add(1, Ordering::Relaxed);
        Mapping {
            ptr: NonNull::new_unchecked(ptr),
            len,
            writable,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Raw base pointer, for callers that overlay an atomic structure
    /// (the control block) on the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy bytes out of the mapping.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), ShmemError> {
        self.check(offset, buf.len())?;
        // SAFETY: bounds checked above; source and destination cannot overlap
        // because `buf` is a Rust-owned slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy bytes into the mapping.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), ShmemError> {
        if !self.writable {
            return Err(ShmemError::UnsafeHandle("mapping is read-only"));
        }
        self.check(offset, buf.len())?;
        // SAFETY: bounds checked above; non-overlapping for the same reason
        // as read_at.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.as_ptr().add(offset), buf.len());
        }
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), ShmemError> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(ShmemError::OutOfRange {
                offset: offset as u64,
                len,
                size: self.len as u64,
            });
        }
        Ok(())
    }

    /// Number of live mappings in this process.
    pub fn active_count() -> usize {
        ACTIVE_MAPPINGS.load(Ordering::Relaxed)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and have not been
        // unmapped before.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
        ACTIVE_MAPPINGS.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Region;

    #[test]
    fn read_back_what_was_written() {
        let region = Region::create(4096).unwrap();
        let map = region.map().unwrap();
        map.write_at(100, b"plume").unwrap();
        let mut got = [0u8; 5];
        map.read_at(100, &mut got).unwrap();
        assert_eq!(&got, b"plume");
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let region = Region::create(4096).unwrap();
        let map = region.map().unwrap();
        assert!(map.write_at(4090, &[0u8; 16]).is_err());
        let mut buf = [0u8; 16];
        assert!(map.read_at(usize::MAX - 4, &mut buf).is_err());
    }

    #[test]
    fn clone_and_original_share_contents() {
        let region = Region::create(4096).unwrap();
        let clone = region.try_clone().unwrap();

        let a = region.map().unwrap();
        let b = clone.map().unwrap();

        a.write_at(0, &[1, 2, 3, 4]).unwrap();
        let mut got = [0u8; 4];
        b.read_at(0, &mut got).unwrap();
        assert_eq!(got, [1, 2, 3, 4]);

        // And the other direction.
        b.write_at(2, &[9]).unwrap();
        a.read_at(0, &mut got).unwrap();
        assert_eq!(got, [1, 2, 9, 4]);
    }

    #[test]
    fn mapping_counter_tracks_drops() {
        let before = Mapping::active_count();
        let region = Region::create(4096).unwrap();
        let map = region.map().unwrap();
        assert_eq!(Mapping::active_count(), before + 1);
        drop(map);
        assert_eq!(Mapping::active_count(), before);
    }
}
