//! Mapped-region pool: one growable `mmap` window over the whole file.
//!
//! Pointers into a window are invalidated by any call that may remap it.
//! `MmapGuard` is a scoped acquisition — an `RwLockReadGuard` that keeps
//! `remap` from running (and the backing pages from disappearing) for as
//! long as it's alive, and nothing longer.
//!
//! Built directly on `libc::mmap`/`munmap`/`msync` rather than pulling in a
//! separate mmap crate.

use std::sync::RwLock;

use crate::error::{Error, ErrorCode, Result};
use crate::types::SyncFlags;

struct Window {
    ptr: *mut u8,
    len: usize,
}

// The pointer is a raw mmap base address; access to the bytes it points at
// is synchronized by the engine's own locks, not by this type.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    fn unmapped() -> Self {
        Window {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }
}

/// A single contiguous `mmap` window over a file, remappable as the file
/// grows or shrinks.
pub struct MmapPool {
    fd: std::os::unix::io::RawFd,
    window: RwLock<Window>,
}

impl MmapPool {
    /// Map the first `len` bytes of `fd`. `len` must already be rounded up
    /// to a page boundary by the caller (the FSM always requests
    /// page-aligned lengths).
    pub fn new(fd: std::os::unix::io::RawFd, len: u64) -> Result<Self> {
        let pool = MmapPool {
            fd,
            window: RwLock::new(Window::unmapped()),
        };
        if len > 0 {
            pool.remap(len)?;
        }
        Ok(pool)
    }

    /// OS page size, used by the FSM for page-aligned allocation.
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Replace the current window with a fresh mapping covering `[0, len)`.
    /// Invalidates every outstanding `MmapGuard` by construction: this
    /// takes the write side of the lock, which cannot be acquired while any
    /// guard (a read-lock holder) is alive.
    pub fn remap(&self, len: u64) -> Result<()> {
        let len = len as usize;
        let mut window = self.window.write().unwrap();

        let new_ptr = if len == 0 {
            std::ptr::null_mut()
        } else {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::from(std::io::Error::last_os_error()));
            }
            ptr as *mut u8
        };

        if !window.ptr.is_null() {
            unsafe {
                libc::munmap(window.ptr as *mut libc::c_void, window.len);
            }
        }

        window.ptr = new_ptr;
        window.len = len;
        Ok(())
    }

    /// Flush dirty pages in `[offset, offset+len)` to disk.
    pub fn sync(&self, offset: u64, len: u64, flags: SyncFlags) -> Result<()> {
        let window = self.window.read().unwrap();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::new(ErrorCode::Overflow))?;
        if end as usize > window.len {
            return Err(Error::new(ErrorCode::NotMapped));
        }
        let ms_flags = if flags.contains(SyncFlags::FDATASYNC) {
            libc::MS_ASYNC
        } else {
            libc::MS_SYNC
        };
        let rc = unsafe {
            libc::msync(
                window.ptr.add(offset as usize) as *mut libc::c_void,
                len as usize,
                ms_flags,
            )
        };
        if rc != 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Acquire a scoped, read-only view of the current mapping.
    pub fn acquire(&self) -> MmapGuard<'_> {
        MmapGuard {
            guard: self.window.read().unwrap(),
        }
    }
}

impl Drop for MmapPool {
    fn drop(&mut self) {
        let window = self.window.get_mut().unwrap();
        if !window.ptr.is_null() {
            unsafe {
                libc::munmap(window.ptr as *mut libc::c_void, window.len);
            }
        }
    }
}

/// Scoped read/write access into the current mapping. Dropping the guard
/// releases the hold that keeps `remap` from running; it must never be
/// retained across a call that can trigger one.
pub struct MmapGuard<'a> {
    guard: std::sync::RwLockReadGuard<'a, Window>,
}

impl MmapGuard<'_> {
    pub fn len(&self) -> usize {
        self.guard.len
    }

    pub fn is_empty(&self) -> bool {
        self.guard.len == 0
    }

    /// Borrow `[offset, offset+len)` for reading.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::new(ErrorCode::Overflow))?;
        if end > self.guard.len {
            return Err(Error::new(ErrorCode::NotMapped));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.guard.ptr.add(start), len) })
    }

    /// Borrow `[offset, offset+len)` for writing.
    ///
    /// Safe under the engine's own lock discipline: the FSM/KVBLK/SBLK
    /// layers only call this while holding the per-database write lock (or
    /// the engine write lock for whole-file operations), so no two callers
    /// ever hold overlapping mutable views at once.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::new(ErrorCode::Overflow))?;
        if end > self.guard.len {
            return Err(Error::new(ErrorCode::NotMapped));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.guard.ptr.add(start), len) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::file::RawFile;
    use crate::os::unix::UnixFile;

    fn page_aligned_len() -> u64 {
        MmapPool::page_size() as u64
    }

    #[test]
    fn write_through_guard_is_visible_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let file = UnixFile::open(&path, true, false).unwrap();
        let len = page_aligned_len();
        file.set_len(len).unwrap();

        let pool = MmapPool::new(file.raw_fd(), len).unwrap();
        {
            let guard = pool.acquire();
            let buf = guard.slice_mut(0, 5).unwrap();
            buf.copy_from_slice(b"hello");
        }
        pool.sync(0, len, SyncFlags::FSYNC).unwrap();

        let mut readback = [0u8; 5];
        file.read_at(&mut readback, 0).unwrap();
        assert_eq!(&readback, b"hello");
    }

    #[test]
    fn remap_grows_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let file = UnixFile::open(&path, true, false).unwrap();
        let len = page_aligned_len();
        file.set_len(len).unwrap();

        let pool = MmapPool::new(file.raw_fd(), len).unwrap();
        assert_eq!(pool.acquire().len(), len as usize);

        file.set_len(len * 2).unwrap();
        pool.remap(len * 2).unwrap();
        assert_eq!(pool.acquire().len(), (len * 2) as usize);
    }

    #[test]
    fn out_of_range_slice_is_not_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let file = UnixFile::open(&path, true, false).unwrap();
        let len = page_aligned_len();
        file.set_len(len).unwrap();
        let pool = MmapPool::new(file.raw_fd(), len).unwrap();
        let guard = pool.acquire();
        assert!(guard.slice(len, 1).is_err());
    }
}
