//! Unix `RawFile` implementation.
//!
//! Plain `libc` syscalls (`pread`/`pwrite`/`fsync`/`fdatasync`/`ftruncate`/
//! `fcntl` advisory locks) — no shared-memory region, no device
//! characteristics probing, no VFS registry.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorCode, Result};
use crate::os::file::RawFile;
use crate::types::SyncFlags;

#[cfg(target_os = "linux")]
fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

fn error_from_errno() -> Error {
    let errno = get_errno();
    let msg = std::io::Error::from_raw_os_error(errno).to_string();
    let code = match errno {
        libc::ENOENT => ErrorCode::InvalidArgs,
        libc::EACCES | libc::EPERM => ErrorCode::ReadOnly,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::NoFreeSpace,
        libc::EAGAIN => ErrorCode::InvalidState,
        libc::ENOMEM => ErrorCode::Alloc,
        _ => ErrorCode::IoErrno,
    };
    Error::with_message(code, msg)
}

/// An open file, backing one engine instance.
pub struct UnixFile {
    fd: RawFd,
}

// A raw fd is freely shareable across threads; all mutation goes through
// positional syscalls (no shared cursor) or the OS-level advisory lock.
unsafe impl Send for UnixFile {}
unsafe impl Sync for UnixFile {}

impl UnixFile {
    /// Open (creating if necessary) the file at `path` for read/write.
    pub fn open(path: &std::path::Path, create: bool, readonly: bool) -> Result<Self> {
        let c_path =
            CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
                Error::new(ErrorCode::InvalidArgs)
            })?;

        let mut oflags = if readonly {
            libc::O_RDONLY
        } else {
            libc::O_RDWR
        };
        if create && !readonly {
            oflags |= libc::O_CREAT;
        }

        let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644) };
        if fd < 0 {
            return Err(error_from_errno());
        }
        Ok(UnixFile { fd })
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl RawFile for UnixFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset as i64) + done as i64,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(error_from_errno());
            }
            if n == 0 {
                return Err(Error::with_message(
                    ErrorCode::IoErrno,
                    "short read past end of file",
                ));
            }
            done += n as usize;
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                    (offset as i64) + done as i64,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(error_from_errno());
            }
            done += n as usize;
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut stat) } != 0 {
            return Err(error_from_errno());
        }
        Ok(stat.st_size as u64)
    }

    fn set_len(&self, size: u64) -> Result<()> {
        if unsafe { libc::ftruncate(self.fd, size as i64) } != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::FDATASYNC) {
            unsafe { platform_fdatasync(self.fd) }
        } else {
            unsafe { libc::fsync(self.fd) }
        };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> Result<()> {
        let l_type = if exclusive {
            libc::F_WRLCK
        } else {
            libc::F_RDLCK
        } as libc::c_short;
        let flock = libc::flock {
            l_type,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        loop {
            let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLK, &flock) };
            if rc == 0 {
                return Ok(());
            }
            let errno = get_errno();
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EACCES {
                return Err(Error::new(ErrorCode::InvalidState));
            }
            return Err(error_from_errno());
        }
    }

    fn unlock(&self) -> Result<()> {
        let flock = libc::flock {
            l_type: libc::F_UNLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETLK, &flock) } != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let f = UnixFile::open(&path, true, false).unwrap();
        f.set_len(4096).unwrap();
        f.write_at(b"hello", 10).unwrap();
        let mut buf = [0u8; 5];
        f.read_at(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(f.len().unwrap(), 4096);
    }

    #[test]
    fn lock_then_unlock_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let f = UnixFile::open(&path, true, false).unwrap();
        f.set_len(64).unwrap();
        f.lock(true).unwrap();
        f.unlock().unwrap();
    }
}
