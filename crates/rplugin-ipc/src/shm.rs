//! POSIX shared-memory mapping, generalized from the macOS-only original to
//! Linux where `mremap` lets the audio region grow in place once the real
//! buffer size and channel counts are known (spec §4.3's two-phase sizing:
//! a small fixed control region mapped eagerly, a variably-sized audio
//! region mapped lazily once the first `SetBufferSize`/channel counts are
//! known).

use std::ffi::CString;
use std::path::Path;
use std::ptr;

use rplugin_core::{Error, Result};

/// A POSIX shared-memory mapping owned by this process. `unlink` is left to
/// the creator (the client); the server only ever opens and maps.
pub struct SharedMapping {
    ptr: *mut libc::c_void,
    len: usize,
    fd: libc::c_int,
}

// SAFETY: the mapping is only ever accessed through atomics or through
// byte-level copies guarded by the ring's own synchronization; the raw
// pointer itself carries no interior aliasing beyond that.
unsafe impl Send for SharedMapping {}

impl SharedMapping {
    /// Creates (or truncates) a POSIX shared-memory object at `name` sized
    /// to `len` bytes and maps it read-write.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: `c_name` is NUL-terminated and valid for the call.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: `fd` is a valid, just-opened descriptor.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
        Self::map(fd, len)
    }

    /// Opens an existing shared-memory object by path (used by the helper
    /// side, which never creates the region itself).
    pub fn open_existing(path: &Path, len: usize) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: `c_path` is NUL-terminated; `O_RDWR` matches the
        // creator's mode.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Self::map(fd, len)
    }

    fn map(fd: libc::c_int, len: usize) -> Result<Self> {
        // SAFETY: `fd` is a valid, appropriately sized descriptor; the
        // returned pointer is checked for `MAP_FAILED` before use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
        Ok(Self { ptr, len, fd })
    }

    /// Grows the mapping to `new_len`, using `mremap` on Linux to avoid an
    /// unmap/remap cycle that would invalidate pointers the ring still
    /// holds into the control region. `ftruncate` must already have been
    /// called by the owning side before this is invoked.
    #[cfg(target_os = "linux")]
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if unsafe { libc::ftruncate(self.fd, new_len as libc::off_t) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: `self.ptr` is the pointer returned by a prior mmap/mremap
        // over `self.fd`, `self.len` matches its current size.
        let new_ptr = unsafe {
            libc::mremap(self.ptr, self.len, new_len, libc::MREMAP_MAYMOVE)
        };
        if new_ptr == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        self.ptr = new_ptr;
        self.len = new_len;
        Ok(())
    }

    /// Portable fallback for non-Linux targets: unmap and remap, which is
    /// safe here because callers only keep the header's process-local
    /// wrapper value around, never a raw pointer across a resize.
    #[cfg(not(target_os = "linux"))]
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if unsafe { libc::ftruncate(self.fd, new_len as libc::off_t) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        unsafe { libc::munmap(self.ptr, self.len) };
        let mapped = Self::map(self.fd, new_len)?;
        self.ptr = mapped.ptr;
        self.len = mapped.len;
        std::mem::forget(mapped);
        Ok(())
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
            libc::close(self.fd);
        }
    }
}

/// Removes a shared-memory object by name. Only the creator calls this,
/// during client-side teardown.
pub fn unlink(name: &str) -> Result<()> {
    let c_name = CString::new(name)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: `c_name` is NUL-terminated.
    unsafe { libc::shm_unlink(c_name.as_ptr()) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn create_map_write_read_round_trips() {
        let name = "/rplugin_shm_test_basic";
        let mapping = SharedMapping::create(name, 4096).unwrap();
        unsafe {
            ptr::write_bytes(mapping.as_ptr(), 0xAB, 16);
            assert_eq!(*mapping.as_ptr(), 0xAB);
        }
        drop(mapping);
        unlink(name).unwrap();
    }

    #[test]
    #[serial]
    fn resize_grows_mapping_and_preserves_prefix() {
        let name = "/rplugin_shm_test_resize";
        let mut mapping = SharedMapping::create(name, 4096).unwrap();
        unsafe {
            ptr::write_bytes(mapping.as_ptr(), 0x42, 4096);
        }
        mapping.resize(8192).unwrap();
        assert_eq!(mapping.len(), 8192);
        unsafe {
            assert_eq!(*mapping.as_ptr(), 0x42);
        }
        drop(mapping);
        unlink(name).unwrap();
    }
}
