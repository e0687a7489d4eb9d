use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::mapping::Mapping;
use crate::{allocation_granularity, last_os_error, ShmemError};

/// Capability level of a [`Region`].
///
/// The capability decides which mappings a region may produce and whether its
/// handle may be duplicated:
///
/// - `Mutable`: writable mappings, clonable.
/// - `ReadOnly`: read-only mappings, clonable.
/// - `MutableOrReadOnly`: writable mappings; clones may be downgraded to
///   read-only before being handed to a less trusted peer.
/// - `Freezable`: writable mappings until [`Region::freeze`], which is a
///   one-way conversion to `ReadOnly`. Not clonable: the single-writer
///   guarantee would be unenforceable with a second handle in the wild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Mutable,
    ReadOnly,
    MutableOrReadOnly,
    Freezable,
}

impl Capability {
    fn writable(self) -> bool {
        !matches!(self, Capability::ReadOnly)
    }

    fn clonable(self) -> bool {
        !matches!(self, Capability::Freezable)
    }
}

/// An OS-backed, shareable block of memory.
///
/// Backed by a sealed memfd: `F_SEAL_GROW | F_SEAL_SHRINK` are applied at
/// creation, so `size()` can never change for the region's lifetime. The
/// handle is a move-only [`OwnedFd`]; duplication only happens through the
/// explicit [`Region::try_clone`], which creates a second OS-level reference.
#[derive(Debug)]
pub struct Region {
    fd: OwnedFd,
    /// Read-only fd retained at creation for `Freezable` regions so that
    /// `freeze()` does not need to reopen anything.
    ro_fd: Option<OwnedFd>,
    capability: Capability,
    size: u64,
}

impl Region {
    /// Create a new `Mutable` region of `size` bytes.
    ///
    /// Returns `Err(ShmemError::Exhausted)` when the OS cannot provide
    /// backing memory; callers must treat that as recoverable.
    pub fn create(size: u64) -> Result<Region, ShmemError> {
        Self::create_with(size, Capability::Mutable)
    }

    /// Create a `MutableOrReadOnly` region: like [`Region::create`], but the
    /// creator acknowledges clones may be downgraded for an untrusted peer.
    pub fn create_mutable_or_read_only(size: u64) -> Result<Region, ShmemError> {
        Self::create_with(size, Capability::MutableOrReadOnly)
    }

    /// Create a `Freezable` region.
    ///
    /// Retains a second, read-only OS reference up front so [`Region::freeze`]
    /// can swap handles without reopening.
    pub fn create_freezable(size: u64) -> Result<Region, ShmemError> {
        let mut region = Self::create_with(size, Capability::Freezable)?;
        region.ro_fd = Some(reopen_read_only(&region.fd)?);
        Ok(region)
    }

    fn create_with(size: u64, capability: Capability) -> Result<Region, ShmemError> {
        if size == 0 {
            return Err(ShmemError::OutOfRange {
                offset: 0,
                len: 0,
                size: 0,
            });
        }
        let name = CString::new("plume-region").expect("static name");
        // SAFETY: name is a valid C string; flags are valid for memfd_create.
        let raw = unsafe {
            libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
        };
        if raw < 0 {
            return Err(ShmemError::Exhausted(last_os_error()));
        }
        // SAFETY: memfd_create succeeded, raw is an open fd we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: fd is valid; ftruncate with a non-negative length.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(ShmemError::Exhausted(last_os_error()));
        }

        // Size is an invariant for the region's lifetime.
        // SAFETY: fd is a memfd created with MFD_ALLOW_SEALING.
        if unsafe {
            libc::fcntl(
                fd.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_GROW | libc::F_SEAL_SHRINK,
            )
        } < 0
        {
            return Err(ShmemError::Os(last_os_error()));
        }

        Ok(Region {
            fd,
            ro_fd: None,
            capability,
            size,
        })
    }

    /// Adopt a handle received from another process.
    ///
    /// The peer is untrusted: before this process will map the handle it must
    /// look like an anonymous shared-memory object and nothing else. A
    /// compromised peer could otherwise hand us an image-backed file and have
    /// us map foreign code as data.
    pub fn from_handle(
        fd: OwnedFd,
        capability: Capability,
        expected_size: u64,
    ) -> Result<Region, ShmemError> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is valid and stat points to writable memory of the right size.
        if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } < 0 {
            return Err(ShmemError::Os(last_os_error()));
        }
        // SAFETY: fstat succeeded and initialized the buffer.
        let stat = unsafe { stat.assume_init() };

        if stat.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Err(ShmemError::UnsafeHandle("not a regular memory object"));
        }
        // memfds are anonymous: they have no directory entry. Note the mode
        // bits are useless here (memfd_create reports 0777); anonymity plus
        // the size check is what excludes image-backed files.
        if stat.st_nlink != 0 {
            return Err(ShmemError::UnsafeHandle("handle is backed by a named file"));
        }
        if stat.st_size as u64 != expected_size || expected_size == 0 {
            return Err(ShmemError::UnsafeHandle("size mismatch"));
        }

        Ok(Region {
            fd,
            ro_fd: None,
            capability,
            size: expected_size,
        })
    }

    /// Size in bytes. Never changes after creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Duplicate the OS handle, creating a second region referring to the
    /// same memory. `Freezable` regions cannot be cloned.
    pub fn try_clone(&self) -> Result<Region, ShmemError> {
        if !self.capability.clonable() {
            return Err(ShmemError::Capability(self.capability));
        }
        let fd = self.fd.try_clone().map_err(ShmemError::Exhausted)?;
        Ok(Region {
            fd,
            ro_fd: None,
            capability: self.capability,
            size: self.size,
        })
    }

    /// Clone as a read-only handle. Only meaningful for `MutableOrReadOnly`
    /// regions being handed to a peer that must not write.
    pub fn clone_read_only(&self) -> Result<Region, ShmemError> {
        if self.capability != Capability::MutableOrReadOnly {
            return Err(ShmemError::Capability(self.capability));
        }
        let fd = reopen_read_only(&self.fd)?;
        Ok(Region {
            fd,
            ro_fd: None,
            capability: Capability::ReadOnly,
            size: self.size,
        })
    }

    /// One-way conversion of a `Freezable` region to `ReadOnly`.
    ///
    /// Seals future writes at the OS level: mappings that already exist stay
    /// valid and writable, but no handle derived from this point on can
    /// produce a writable mapping anywhere in the system.
    pub fn freeze(mut self) -> Result<Region, ShmemError> {
        if self.capability != Capability::Freezable {
            return Err(ShmemError::Capability(self.capability));
        }
        // SAFETY: fd is a sealable memfd.
        if unsafe {
            libc::fcntl(
                self.fd.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_FUTURE_WRITE,
            )
        } < 0
        {
            return Err(ShmemError::Os(last_os_error()));
        }
        let fd = match self.ro_fd.take() {
            Some(ro) => ro,
            // create_freezable retains the read-only fd, but a region adopted
            // via from_handle may not have one.
            None => reopen_read_only(&self.fd)?,
        };
        Ok(Region {
            fd,
            ro_fd: None,
            capability: Capability::ReadOnly,
            size: self.size,
        })
    }

    /// Map the whole region.
    ///
    /// Address-space exhaustion is reported as `ShmemError::MapFailed`;
    /// callers must treat it as recoverable (the [`Cursor`](crate::Cursor)
    /// retries with smaller chunks).
    pub fn map(&self) -> Result<Mapping, ShmemError> {
        self.map_range(0, self.size as usize)
    }

    /// Map `len` bytes starting at `offset`. `offset` must be a multiple of
    /// the allocation granularity.
    pub fn map_range(&self, offset: u64, len: usize) -> Result<Mapping, ShmemError> {
        let granularity = allocation_granularity() as u64;
        if offset % granularity != 0 || len == 0 || offset + len as u64 > self.size {
            return Err(ShmemError::OutOfRange {
                offset,
                len,
                size: self.size,
            });
        }
        let prot = if self.capability.writable() {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: fd is valid, offset/len are within the region and
        // page-aligned; MAP_SHARED mappings of a memfd alias no Rust object.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmemError::MapFailed(last_os_error()));
        }
        // SAFETY: mmap succeeded; Mapping takes over the munmap obligation.
        Ok(unsafe { Mapping::from_raw(ptr as *mut u8, len, self.capability.writable()) })
    }

    /// Hand the raw handle over, consuming the region. Used when shipping the
    /// handle to another process.
    pub fn into_handle(self) -> OwnedFd {
        self.fd
    }
}

fn reopen_read_only(fd: &OwnedFd) -> Result<OwnedFd, ShmemError> {
    let path = CString::new(format!("/proc/self/fd/{}", fd.as_raw_fd())).expect("no nul");
    // SAFETY: path is a valid C string.
    let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(ShmemError::Os(last_os_error()));
    }
    // SAFETY: open succeeded, raw is an fd we own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
