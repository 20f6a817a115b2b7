//! epoll registry: the only place a transfer direction suspends

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tracing::trace;

use crate::error::{TransportError, TransportResult};

/// Interest set for the watched source: readable, peer hang-up and errors.
/// `EPOLLERR` and `EPOLLHUP` are always reported, listing them keeps intent explicit.
const SOURCE_INTEREST: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Interest for a single write-readiness retry.
const WRITABLE_ONCE: u32 = (libc::EPOLLOUT | libc::EPOLLONESHOT) as u32;

/// Event bits reported for a watched descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u32);

impl Readiness {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    /// Peer shut down its write side (`EPOLLRDHUP`) or both sides are closed (`EPOLLHUP`).
    pub fn is_hangup(self) -> bool {
        self.0 & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }

    /// Pending socket error, typically a reset.
    pub fn is_error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }
}

/// Result of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Ready(Readiness),
    /// A signal interrupted the wait; not a real event.
    Interrupted,
}

/// One epoll instance watching at most one descriptor.
///
/// Dropping the monitor removes the registration and closes the instance.
#[derive(Debug)]
pub struct EventMonitor {
    epfd: OwnedFd,
    watched: Option<RawFd>,
}

impl EventMonitor {
    pub fn create() -> TransportResult<Self> {
        // SAFETY: epoll_create1 has no pointer arguments.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(TransportError::MonitorCreation(io::Error::last_os_error()));
        }

        Ok(Self {
            // SAFETY: freshly created descriptor, owned from here on.
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            watched: None,
        })
    }

    /// Watch `fd` for read-readiness, hang-up and error conditions.
    pub fn watch(&mut self, fd: BorrowedFd<'_>) -> TransportResult<()> {
        self.unwatch();
        self.register(fd, SOURCE_INTEREST)?;
        self.watched = Some(fd.as_raw_fd());
        Ok(())
    }

    /// Remove the current registration, if any.
    pub fn unwatch(&mut self) {
        if let Some(fd) = self.watched.take() {
            // SAFETY: EPOLL_CTL_DEL ignores the event pointer on modern kernels.
            let rc = unsafe {
                libc::epoll_ctl(
                    self.epfd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                )
            };
            if rc < 0 {
                // The owner may already have closed the socket, which removed it for us
                trace!(
                    "epoll deregistration of fd {} failed: {}",
                    fd,
                    io::Error::last_os_error()
                );
            }
        }
    }

    fn register(&self, fd: BorrowedFd<'_>, interest: u32) -> TransportResult<()> {
        let raw = fd.as_raw_fd();
        let mut event = libc::epoll_event {
            events: interest,
            u64: raw as u64,
        };
        // SAFETY: `event` outlives the call and `fd` is borrowed for it.
        let rc = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, raw, &mut event)
        };
        if rc < 0 {
            return Err(TransportError::Register {
                fd: raw,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Block with no timeout until the watched descriptor reports an event.
    pub fn wait(&self) -> TransportResult<Wait> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: room for exactly one event, as advertised by maxevents.
        let n = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), &mut event, 1, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wait::Interrupted);
            }
            return Err(TransportError::Wait(err));
        }
        if n == 0 {
            return Ok(Wait::Interrupted);
        }

        let bits = event.events;
        Ok(Wait::Ready(Readiness(bits)))
    }

    /// Block until `fd` is writable, through a throwaway one-shot registration
    /// that lives only for this retry.
    pub fn await_writable(fd: BorrowedFd<'_>) -> TransportResult<Readiness> {
        let monitor = Self::create()?;
        monitor.register(fd, WRITABLE_ONCE)?;
        loop {
            if let Wait::Ready(readiness) = monitor.wait()? {
                return Ok(readiness);
            }
        }
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        self.unwatch();
    }
}
