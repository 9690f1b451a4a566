//! Async I/O over raw file descriptors.
//!
//! The supervisor and the exec sessions deal in pipe ends and pty masters,
//! plain kernel fds with no tokio type of their own. [`FdIo`] registers one
//! with the reactor and exposes the minimal read/write surface the callers
//! need.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

/// A non-blocking fd (pipe end or pty master) driven by the tokio reactor.
pub struct FdIo {
    inner: AsyncFd<OwnedFd>,
}

impl FdIo {
    /// Register `fd` with the reactor, switching it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` is end-of-stream; a pty master
    /// reports a closed slave side as `EIO`, which is mapped to `Ok(0)`.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: fd is owned by `inner` and open; buf is a live
                // stack or heap buffer of the given length.
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.inner.writable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: fd is owned by `inner` and open; buf is a live
                // buffer of the given length.
                let n = unsafe {
                    libc::write(inner.as_raw_fd(), buf.as_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Read to end-of-stream, appending to `out`.
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> io::Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(()),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.inner.get_ref().as_raw_fd()
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fd is open; F_GETFL/F_SETFL take no pointers.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
