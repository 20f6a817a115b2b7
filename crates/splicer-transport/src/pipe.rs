//! Kernel pipe used as the intermediate hop for socket-to-socket splicing
//!
//! `splice(2)` only moves data between a pipe and another descriptor, so a
//! zero-copy socket transfer goes `source -> pipe.write` then
//! `pipe.read -> destination`.

use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// Fallback transfer size when the system setting cannot be read (64 KiB)
pub const DEFAULT_PIPE_SIZE: usize = 64 << 10;

/// Where Linux exposes the largest pipe size an unprivileged process may set
pub const PIPE_MAX_SIZE_PATH: &str = "/proc/sys/fs/pipe-max-size";

/// Pipe transfer size, read once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSize(NonZeroUsize);

impl PipeSize {
    /// Returns `None` for zero.
    pub fn new(bytes: usize) -> Option<Self> {
        NonZeroUsize::new(bytes).map(Self)
    }

    /// Read the system pipe size limit, falling back to [`DEFAULT_PIPE_SIZE`].
    pub fn detect() -> Self {
        Self::from_file(Path::new(PIPE_MAX_SIZE_PATH))
    }

    pub fn from_file(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw).unwrap_or_else(|| {
                warn!(
                    "Unparsable pipe size {:?} in {}, falling back to {} bytes",
                    raw.trim(),
                    path.display(),
                    DEFAULT_PIPE_SIZE
                );
                Self::default()
            }),
            Err(e) => {
                warn!(
                    "Failed to read {}: {}, falling back to {} bytes",
                    path.display(),
                    e,
                    DEFAULT_PIPE_SIZE
                );
                Self::default()
            }
        }
    }

    /// Parse the contents of `pipe-max-size` (a decimal, usually newline terminated).
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<usize>().ok().and_then(Self::new)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for PipeSize {
    fn default() -> Self {
        Self(NonZeroUsize::new(DEFAULT_PIPE_SIZE).unwrap_or(NonZeroUsize::MIN))
    }
}

impl fmt::Display for PipeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

impl FromStr for PipeSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid pipe size '{}': expected a positive integer", s))
    }
}

/// A unidirectional kernel buffer owned by exactly one transfer direction.
///
/// Both ends are closed when the pipe is dropped, on every exit path.
#[derive(Debug)]
pub struct KernelPipe {
    read: OwnedFd,
    write: OwnedFd,
    capacity: usize,
}

impl KernelPipe {
    /// Create a non-blocking pipe and try to grow it to `size`.
    ///
    /// A failed resize is logged and ignored: splicing still works with the
    /// kernel's default size, it just takes more calls.
    pub fn create(size: PipeSize) -> TransportResult<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(TransportError::PipeCreation(io::Error::last_os_error()));
        }

        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        let pipe = Self {
            read,
            write,
            capacity: size.get(),
        };

        match pipe.resize(size) {
            Ok(actual) => debug!(
                "Pipe {}/{} sized to {} bytes",
                fds[0], fds[1], actual
            ),
            Err(e) => warn!("Could not set pipe size to {}: {}", size, e),
        }

        Ok(pipe)
    }

    fn resize(&self, size: PipeSize) -> io::Result<usize> {
        let requested = libc::c_int::try_from(size.get()).unwrap_or(libc::c_int::MAX);
        // SAFETY: plain fcntl on a descriptor we own.
        let rc = unsafe { libc::fcntl(self.write.as_raw_fd(), libc::F_SETPIPE_SZ, requested) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Size the kernel actually allocated (rounded up to whole pages).
    #[cfg(test)]
    fn kernel_capacity(&self) -> io::Result<usize> {
        // SAFETY: plain fcntl on a descriptor we own.
        let rc = unsafe { libc::fcntl(self.read.as_raw_fd(), libc::F_GETPIPE_SZ) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Configured transfer size, the `len` of every source-to-pipe splice.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn read_end(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    pub fn write_end(&self) -> BorrowedFd<'_> {
        self.write.as_fd()
    }
}
