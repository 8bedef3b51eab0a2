//! Named shared-memory segment handle: create-or-attach, attach-only,
//! close and unlink, over an arbitrary byte buffer of caller-chosen size.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use crate::error::{Error, Result};

/// Whether a segment was created by us (and should be unlinked on teardown
/// when `auto_unlink` is set) or merely attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Created,
    Attached,
}

/// A mapped, named shared-memory region.
///
/// Dropping a `Segment` only unmaps it; it never unlinks the backing OS
/// object. A segment is released when the last handle closes, and deleted
/// only when a process explicitly unlinks it.
pub struct Segment {
    name: String,
    ptr: NonNull<u8>,
    size: usize,
    origin: Origin,
    unmapped: bool,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn os_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

impl Segment {
    /// Try to attach to `name`; if absent, create it with `size` bytes,
    /// zero-initialized.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        assert!(size > 0);
        let os = os_name(name);

        match Self::attach(name) {
            Ok(segment) => Ok(segment),
            Err(Error::CannotAttach { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Self::create(name, &os, size)
            }
            Err(other) => Err(other),
        }
    }

    fn create(name: &str, os_name: &str, size: usize) -> Result<Self> {
        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        let raw_fd = match mman::shm_open(os_name, flags, mode) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::EEXIST) => {
                // Lost a race with another creator; attach instead.
                return Self::attach(name);
            }
            Err(e) => {
                return Err(Error::CannotAttach {
                    name: name.to_string(),
                    source: io::Error::from(e),
                })
            }
        };

        let handle = unsafe { std::fs::File::from_raw_fd(raw_fd) };
        handle.set_len(size as u64).map_err(Error::Io)?;

        let segment = Self::map(name, &handle, size, Origin::Created)?;
        drop(handle);

        tracing::debug!(name, size, "created shared memory segment");
        Ok(segment)
    }

    /// Attach to an existing segment; fails with `CannotAttach` if absent.
    pub fn attach(name: &str) -> Result<Self> {
        let os = os_name(name);
        let flags = OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        let raw_fd = mman::shm_open(os.as_str(), flags, mode).map_err(|e| Error::CannotAttach {
            name: name.to_string(),
            source: io::Error::from(e),
        })?;

        let handle = unsafe { std::fs::File::from_raw_fd(raw_fd) };
        let size = handle
            .metadata()
            .map_err(Error::Io)?
            .len()
            .try_into()
            .expect("segment size fits in usize");

        let segment = Self::map(name, &handle, size, Origin::Attached)?;
        drop(handle);

        tracing::debug!(name, size, "attached shared memory segment");
        Ok(segment)
    }

    fn map(name: &str, handle: &std::fs::File, size: usize, origin: Origin) -> Result<Self> {
        let len = std::num::NonZeroUsize::new(size)
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "zero-size segment")))?;

        let ptr = unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                handle.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| Error::Io(io::Error::from(e)))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "mmap returned null pointer")))?;

        Ok(Segment {
            name: name.to_string(),
            ptr,
            size,
            origin,
            unmapped: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn created_by_us(&self) -> bool {
        self.origin == Origin::Created
    }

    /// Raw mutable access to the mapped region. All readers/writers are
    /// expected to use the atomic/volatile accessors in `control.rs` and
    /// `stream.rs`; this is the single unsafe seam.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    fn unmap(&mut self) {
        if !self.unmapped {
            unsafe {
                let _ = mman::munmap(self.ptr.as_ptr().cast(), self.size);
            }
            self.unmapped = true;
        }
    }

    /// Close the handle; idempotent.
    pub fn close(mut self) {
        self.unmap();
    }

    /// Remove the named segment from the host namespace. Tolerant of an
    /// already-absent segment when `ignore_errors` is set.
    pub fn unlink_by_name(name: &str, ignore_errors: bool) -> Result<()> {
        let os = os_name(name);
        match mman::shm_unlink(os.as_str()) {
            Ok(()) => {
                tracing::debug!(name, "unlinked shared memory segment");
                Ok(())
            }
            Err(nix::errno::Errno::ENOENT) if ignore_errors => Ok(()),
            Err(e) => Err(Error::CannotAttach {
                name: name.to_string(),
                source: io::Error::from(e),
            }),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "/sharedmap-test-{tag}-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        )
    }

    #[test]
    fn create_then_attach_then_unlink() {
        let name = unique_name("segment");

        let created = Segment::open_or_create(&name, 4096).unwrap();
        assert!(created.created_by_us());
        assert_eq!(created.size(), 4096);

        let attached = Segment::attach(&name).unwrap();
        assert!(!attached.created_by_us());
        assert_eq!(attached.size(), 4096);

        created.as_mut_slice()[0] = 0xAB;
        assert_eq!(attached.as_slice()[0], 0xAB);

        attached.close();
        created.close();

        Segment::unlink_by_name(&name, false).unwrap();
    }

    #[test]
    fn unlink_missing_is_tolerated_when_ignoring_errors() {
        let name = unique_name("missing");
        Segment::unlink_by_name(&name, true).unwrap();
        assert!(Segment::unlink_by_name(&name, false).is_err());
    }

    #[test]
    fn attach_to_absent_segment_fails() {
        let name = unique_name("absent");
        assert!(matches!(Segment::attach(&name), Err(Error::CannotAttach { .. })));
    }
}
