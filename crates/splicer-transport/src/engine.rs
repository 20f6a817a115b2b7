//! Zero-copy duplex transport engine
//!
//! One [`DuplexTransport::run`] call drives one direction of one proxied
//! connection through two splices bridged by a private kernel pipe:
//!
//! ```text
//! WaitingForSourceReadable --Moved(n)--> DrainingToDestination { pending: n }
//!          ^                                   |
//!          +------------ pending == 0 ---------+
//! ```
//!
//! The source is never read again while bytes from the previous read are still
//! in the pipe, so a partial destination write cannot drop or duplicate data.

use std::os::fd::{AsRawFd, BorrowedFd};

use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::fd::{raw_fd, Connection};
use crate::monitor::{EventMonitor, Wait};
use crate::pipe::{KernelPipe, PipeSize};
use crate::splice::{splice_once, KernelSplice, Outcome, SpliceSyscall};
use crate::transport::Transport;

/// Consecutive source-side faults tolerated before a direction gives up
pub const DEFAULT_MAX_CONSECUTIVE_FAULTS: u32 = 3;

/// Settings computed once per process and copied into every engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub pipe_size: PipeSize,
    pub max_consecutive_faults: u32,
}

impl EngineConfig {
    /// Read the pipe size from the system, keep the default fault budget.
    pub fn detect() -> Self {
        Self {
            pipe_size: PipeSize::detect(),
            ..Self::default()
        }
    }

    pub fn with_pipe_size(mut self, pipe_size: PipeSize) -> Self {
        self.pipe_size = pipe_size;
        self
    }

    pub fn with_max_consecutive_faults(mut self, faults: u32) -> Self {
        self.max_consecutive_faults = faults;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipe_size: PipeSize::default(),
            max_consecutive_faults: DEFAULT_MAX_CONSECUTIVE_FAULTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForSourceReadable,
    DrainingToDestination { pending: usize },
    Terminated,
}

/// `splice(2)` based implementation of [`Transport`]
#[derive(Debug, Clone)]
pub struct DuplexTransport<S = KernelSplice> {
    config: EngineConfig,
    sys: S,
}

impl DuplexTransport {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_syscall(config, KernelSplice)
    }
}

impl<S: SpliceSyscall> DuplexTransport<S> {
    /// Use a custom syscall seam, mostly useful to observe transfers in tests.
    pub fn with_syscall(config: EngineConfig, sys: S) -> Self {
        Self { config, sys }
    }

    /// Forward bytes from `source` to `destination` until the source ends,
    /// either side goes away, or a transfer fault terminates the direction.
    ///
    /// Both descriptors must be non-blocking sockets. The pipe and the epoll
    /// instance are released on every return path.
    pub fn run(
        &self,
        source: BorrowedFd<'_>,
        destination: BorrowedFd<'_>,
    ) -> TransportResult<()> {
        let pipe = KernelPipe::create(self.config.pipe_size)?;
        let mut monitor = EventMonitor::create()?;
        monitor.watch(source)?;

        let mut direction = Direction {
            sys: &self.sys,
            source,
            destination,
            pipe,
            monitor,
            max_faults: self.config.max_consecutive_faults.max(1),
            faults: 0,
            delivered: 0,
        };

        let mut state = State::WaitingForSourceReadable;
        while state != State::Terminated {
            state = direction.step(state)?;
        }

        direction.monitor.unwatch();
        debug!(
            "Splice {} -> {} finished after {} bytes",
            source.as_raw_fd(),
            destination.as_raw_fd(),
            direction.delivered
        );
        Ok(())
    }
}

impl<S: SpliceSyscall> Transport for DuplexTransport<S> {
    fn name(&self) -> &'static str {
        "splice"
    }

    fn transport(
        &self,
        source: &dyn Connection,
        destination: &dyn Connection,
    ) -> TransportResult<()> {
        let src = raw_fd(source)?;
        let dst = raw_fd(destination)?;

        debug!(
            source = %source.label(),
            destination = %destination.label(),
            pipe_size = self.config.pipe_size.get(),
            "Starting splice transport"
        );
        self.run(src, dst)
    }
}

/// Resources and accounting owned by one running direction
struct Direction<'a, S> {
    sys: &'a S,
    source: BorrowedFd<'a>,
    destination: BorrowedFd<'a>,
    pipe: KernelPipe,
    monitor: EventMonitor,
    max_faults: u32,
    faults: u32,
    delivered: u64,
}

impl<S: SpliceSyscall> Direction<'_, S> {
    fn step(&mut self, state: State) -> TransportResult<State> {
        match state {
            State::WaitingForSourceReadable => self.fill(),
            State::DrainingToDestination { pending } => self.drain(pending),
            State::Terminated => Ok(State::Terminated),
        }
    }

    /// Wait for the source, then move at most one pipe's worth into the pipe.
    fn fill(&mut self) -> TransportResult<State> {
        let readiness = match self.monitor.wait()? {
            Wait::Ready(readiness) => readiness,
            Wait::Interrupted => return Ok(State::WaitingForSourceReadable),
        };

        if readiness.is_error() {
            debug!(
                "Error condition on fd {} (events {:#x}), closing direction",
                self.source.as_raw_fd(),
                readiness.bits()
            );
            self.monitor.unwatch();
            return Ok(State::Terminated);
        }
        // A hang-up still carries whatever the peer sent before it; the splice
        // below reports EndOfStream once that is consumed.
        if readiness.is_hangup() {
            trace!("Hang-up on fd {}, draining what is left", self.source.as_raw_fd());
        }

        match splice_once(
            self.sys,
            self.source,
            self.pipe.write_end(),
            self.pipe.capacity(),
        ) {
            Outcome::Moved(n) => {
                self.faults = 0;
                trace!("Spliced {} bytes fd {} -> pipe", n, self.source.as_raw_fd());
                Ok(State::DrainingToDestination { pending: n })
            }
            Outcome::EndOfStream => {
                debug!("Peer closed fd {}", self.source.as_raw_fd());
                self.monitor.unwatch();
                Ok(State::Terminated)
            }
            Outcome::WouldBlock => Ok(State::WaitingForSourceReadable),
            Outcome::Fatal(e) => {
                self.faults += 1;
                if self.faults >= self.max_faults {
                    return Err(TransportError::TransferFault {
                        attempts: self.faults,
                        source: e,
                    });
                }
                warn!(
                    "Splice from fd {} failed ({}/{}): {}",
                    self.source.as_raw_fd(),
                    self.faults,
                    self.max_faults,
                    e
                );
                Ok(State::WaitingForSourceReadable)
            }
        }
    }

    /// Move exactly the `pending` bytes sitting in the pipe to the destination.
    fn drain(&mut self, pending: usize) -> TransportResult<State> {
        match splice_once(
            self.sys,
            self.pipe.read_end(),
            self.destination,
            pending,
        ) {
            Outcome::Moved(sent) if sent >= pending => {
                self.delivered += sent as u64;
                trace!("Drained {} bytes pipe -> fd {}", sent, self.destination.as_raw_fd());
                Ok(State::WaitingForSourceReadable)
            }
            Outcome::Moved(sent) => {
                self.delivered += sent as u64;
                trace!(
                    "Partial drain to fd {}: {} sent, {} remaining",
                    self.destination.as_raw_fd(),
                    sent,
                    pending - sent
                );
                Ok(State::DrainingToDestination {
                    pending: pending - sent,
                })
            }
            Outcome::WouldBlock => {
                // Resume with the exact remainder once the destination has room
                EventMonitor::await_writable(self.destination)?;
                Ok(State::DrainingToDestination { pending })
            }
            Outcome::EndOfStream => {
                debug!(
                    "Destination fd {} gone with {} bytes undelivered",
                    self.destination.as_raw_fd(),
                    pending
                );
                self.monitor.unwatch();
                Ok(State::Terminated)
            }
            Outcome::Fatal(e) => Err(TransportError::TransferFault {
                attempts: 1,
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Read, Write};
    use std::net::Shutdown;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails every source splice with EINVAL
    struct AlwaysInvalid {
        calls: AtomicU32,
    }

    impl SpliceSyscall for AlwaysInvalid {
        fn splice(&self, _: BorrowedFd<'_>, _: BorrowedFd<'_>, _: usize) -> io::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    /// Replays canned results in call order and records each requested length.
    /// Nothing moves through the kernel, so the source stays readable.
    struct Scripted {
        results: Mutex<VecDeque<io::Result<usize>>>,
        requested: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(results: Vec<io::Result<usize>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<usize> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl SpliceSyscall for Scripted {
        fn splice(&self, _: BorrowedFd<'_>, _: BorrowedFd<'_>, len: usize) -> io::Result<usize> {
            self.requested.lock().unwrap().push(len);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("engine spliced past the end of the script")
        }
    }

    fn einval() -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_config_builders() {
        let config = EngineConfig::default()
            .with_pipe_size(PipeSize::new(4).unwrap())
            .with_max_consecutive_faults(5);
        assert_eq!(config.pipe_size.get(), 4);
        assert_eq!(config.max_consecutive_faults, 5);
        assert_eq!(
            EngineConfig::default().max_consecutive_faults,
            DEFAULT_MAX_CONSECUTIVE_FAULTS
        );
    }

    #[test]
    fn test_forwards_until_end_of_stream() {
        let (src, mut writer) = nonblocking_pair();
        let (dst, mut reader) = nonblocking_pair();

        writer.write_all(b"hello splice").unwrap();
        writer.shutdown(Shutdown::Write).unwrap();

        DuplexTransport::new(EngineConfig::default())
            .run(src.as_fd(), dst.as_fd())
            .unwrap();

        drop(dst);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello splice");
    }

    #[test]
    fn test_consecutive_faults_terminate() {
        let (src, mut writer) = nonblocking_pair();
        let (dst, _reader) = nonblocking_pair();
        writer.write_all(b"data").unwrap();

        let engine = DuplexTransport::with_syscall(
            EngineConfig::default().with_max_consecutive_faults(3),
            AlwaysInvalid {
                calls: AtomicU32::new(0),
            },
        );

        // Level-triggered readiness keeps waking the loop while data is unread
        match engine.run(src.as_fd(), dst.as_fd()) {
            Err(TransportError::TransferFault { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected transfer fault, got {:?}", other),
        }
        assert_eq!(engine.sys.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_fault_budget_means_one() {
        let (src, mut writer) = nonblocking_pair();
        let (dst, _reader) = nonblocking_pair();
        writer.write_all(b"data").unwrap();

        let engine = DuplexTransport::with_syscall(
            EngineConfig::default().with_max_consecutive_faults(0),
            AlwaysInvalid {
                calls: AtomicU32::new(0),
            },
        );
        assert!(matches!(
            engine.run(src.as_fd(), dst.as_fd()),
            Err(TransportError::TransferFault { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_drain_fault_terminates_immediately() {
        let (src, mut writer) = nonblocking_pair();
        let (dst, _reader) = nonblocking_pair();
        writer.write_all(b"data").unwrap();

        // Budget of 3 applies to the source only
        let engine = DuplexTransport::with_syscall(
            EngineConfig::default().with_pipe_size(PipeSize::new(16).unwrap()),
            Scripted::new(vec![Ok(4), einval()]),
        );
        assert!(matches!(
            engine.run(src.as_fd(), dst.as_fd()),
            Err(TransportError::TransferFault { attempts: 1, .. })
        ));
        assert_eq!(engine.sys.requested(), vec![16, 4]);
    }

    #[test]
    fn test_drain_end_of_stream_with_pending_terminates() {
        let (src, mut writer) = nonblocking_pair();
        let (dst, _reader) = nonblocking_pair();
        writer.write_all(b"data").unwrap();

        let engine = DuplexTransport::with_syscall(
            EngineConfig::default().with_pipe_size(PipeSize::new(16).unwrap()),
            Scripted::new(vec![Ok(4), Ok(1), Ok(0)]),
        );
        engine.run(src.as_fd(), dst.as_fd()).unwrap();

        // No fill after the pipe came up short
        assert_eq!(engine.sys.requested(), vec![16, 4, 3]);
    }

    #[test]
    fn test_partial_drains_resume_with_remainder() {
        let (src, mut writer) = nonblocking_pair();
        let (dst, _reader) = nonblocking_pair();
        writer.write_all(b"data").unwrap();

        let engine = DuplexTransport::with_syscall(
            EngineConfig::default().with_pipe_size(PipeSize::new(16).unwrap()),
            Scripted::new(vec![Ok(10), Ok(3), Ok(7), Ok(0)]),
        );
        engine.run(src.as_fd(), dst.as_fd()).unwrap();

        // fill 10, drain 10 (3 sent), drain 7, fill hits end of stream
        assert_eq!(engine.sys.requested(), vec![16, 10, 7, 16]);
    }
}
