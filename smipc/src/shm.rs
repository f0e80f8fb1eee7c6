//! POSIX shared-memory object mapping.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{Error, Result};
use crate::PAGE_SIZE;

/// A mapped POSIX SHM object.
///
/// The backing descriptor is closed as soon as the mapping is established;
/// the mapping itself keeps the object alive. The creator unlinks the
/// object name on drop, later openers only unmap.
#[derive(Debug)]
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    name: CString,
    owner: bool,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create, size, and map a new SHM object.
    ///
    /// # Safety
    ///
    /// The caller must ensure `len` matches the layout that every process
    /// mapping this object expects.
    pub unsafe fn create(name: &str, len: usize) -> Result<Self> {
        Self::map(name, len, true)
    }

    /// Map an existing SHM object.
    ///
    /// # Safety
    ///
    /// The object must have been created with the same `len` and layout.
    pub unsafe fn open(name: &str, len: usize) -> Result<Self> {
        Self::map(name, len, false)
    }

    unsafe fn map(name: &str, len: usize, create: bool) -> Result<Self> {
        debug_assert!(
            len % PAGE_SIZE == 0,
            "shm length {} is not page aligned",
            len
        );

        let cname = name_to_cstring(name)?;
        let oflag = if create {
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR
        } else {
            OFlag::O_RDWR
        };
        let mode = if create {
            Mode::S_IRUSR | Mode::S_IWUSR
        } else {
            Mode::empty()
        };

        let fd = shm_open(cname.as_c_str(), oflag, mode).map_err(|e| {
            // Opening a peer that never existed (or has exited) is the
            // common failure here; report it as a missing device.
            if !create && e == nix::errno::Errno::ENOENT {
                Error::NoDev
            } else {
                Error::from(e)
            }
        })?;

        if create {
            if let Err(e) = ftruncate(&fd, len as i64) {
                let _ = shm_unlink(cname.as_c_str());
                return Err(e.into());
            }
        }

        let length = NonZeroUsize::new(len).ok_or(Error::InvalidArg)?;
        let ptr = match unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                if create {
                    let _ = shm_unlink(cname.as_c_str());
                }
                return Err(e.into());
            }
        };
        // The descriptor is no longer needed once mapped.
        drop(fd);

        Ok(Self {
            ptr: ptr.cast(),
            len,
            name: cname,
            owner: create,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
        if self.owner {
            let _ = shm_unlink(self.name.as_c_str());
        }
    }
}

fn name_to_cstring(name: &str) -> Result<CString> {
    // shm object names must have exactly one leading '/'.
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(name).map_err(|_| Error::InvalidArg)
}
