//! Connection handles and raw descriptor extraction
//!
//! `splice(2)` and epoll operate on descriptors, so every connection handed to
//! a transport must expose the OS socket it wraps. The descriptor is only
//! borrowed: the proxy that owns the connection stays responsible for closing it.

use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use crate::error::DescriptorError;

/// An established full-duplex byte stream owned by the proxy
pub trait Connection: Send + Sync {
    /// The socket behind this connection, if it has one.
    fn socket_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Read through a shared handle (both directions use the same connection).
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write through a shared handle.
    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize>;

    /// Name used in log lines
    fn label(&self) -> String;
}

impl Connection for TcpStream {
    fn socket_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }

    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn label(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => format!("tcp fd {}", self.as_raw_fd()),
        }
    }
}

impl Connection for UnixStream {
    fn socket_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }

    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn label(&self) -> String {
        format!("unix fd {}", self.as_raw_fd())
    }
}

/// Borrow the socket descriptor behind `conn`.
///
/// Fails with [`DescriptorError::NotOwned`] when the connection has no
/// descriptor or the descriptor is not a socket, and with
/// [`DescriptorError::ControlFailure`] when the kernel rejects it (closed fd).
pub fn raw_fd(conn: &dyn Connection) -> Result<BorrowedFd<'_>, DescriptorError> {
    let fd = conn
        .socket_fd()
        .ok_or_else(|| DescriptorError::NotOwned(conn.label()))?;

    let mut stat = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `fd` is a live borrowed descriptor and `stat` is a valid out pointer.
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
    if rc < 0 {
        return Err(DescriptorError::ControlFailure {
            label: conn.label(),
            source: io::Error::last_os_error(),
        });
    }

    // SAFETY: fstat succeeded, so the struct is initialised.
    let mode = unsafe { stat.assume_init() }.st_mode;
    if mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(DescriptorError::NotOwned(conn.label()));
    }

    Ok(fd)
}
