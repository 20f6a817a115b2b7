//! One `splice(2)` call and the classification of its result

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr;
use std::sync::Arc;

/// The syscall seam the engine splices through.
///
/// [`KernelSplice`] is the real thing; tests wrap it to fragment or record
/// individual transfers.
pub trait SpliceSyscall: Send + Sync {
    fn splice(&self, fd_in: BorrowedFd<'_>, fd_out: BorrowedFd<'_>, len: usize)
        -> io::Result<usize>;
}

/// `splice(2)` with `SPLICE_F_MOVE | SPLICE_F_NONBLOCK` and no offsets
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSplice;

impl SpliceSyscall for KernelSplice {
    fn splice(
        &self,
        fd_in: BorrowedFd<'_>,
        fd_out: BorrowedFd<'_>,
        len: usize,
    ) -> io::Result<usize> {
        // SAFETY: both descriptors are borrowed for the duration of the call and
        // null offsets are valid for pipes and sockets.
        let n = unsafe {
            libc::splice(
                fd_in.as_raw_fd(),
                ptr::null_mut(),
                fd_out.as_raw_fd(),
                ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };

        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl<T: SpliceSyscall + ?Sized> SpliceSyscall for Arc<T> {
    fn splice(
        &self,
        fd_in: BorrowedFd<'_>,
        fd_out: BorrowedFd<'_>,
        len: usize,
    ) -> io::Result<usize> {
        (**self).splice(fd_in, fd_out, len)
    }
}

/// What a single splice achieved
#[derive(Debug)]
pub enum Outcome {
    /// Bytes moved, always non-zero.
    Moved(usize),
    /// Zero bytes moved or the peer is gone (reset, broken pipe, closed handle).
    EndOfStream,
    /// Retry once the relevant descriptor is ready.
    WouldBlock,
    /// Anything else.
    Fatal(io::Error),
}

/// Splice up to `max_len` bytes from `src` to `dst` and classify the result.
///
/// `EINTR` is retried in place and never reported.
pub fn splice_once<S: SpliceSyscall + ?Sized>(
    sys: &S,
    src: BorrowedFd<'_>,
    dst: BorrowedFd<'_>,
    max_len: usize,
) -> Outcome {
    loop {
        return match sys.splice(src, dst, max_len) {
            Ok(0) => Outcome::EndOfStream,
            Ok(n) => Outcome::Moved(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::WouldBlock,
            Err(e) if is_peer_termination(&e) => Outcome::EndOfStream,
            Err(e) => Outcome::Fatal(e),
        };
    }
}

/// Errors that mean the other end went away rather than that something broke.
pub fn is_peer_termination(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    ) || err.raw_os_error() == Some(libc::EBADF)
}
