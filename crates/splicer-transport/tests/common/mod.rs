//! Shared helpers for the transport integration tests

#![allow(dead_code)]

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Mutex;

use rand::Rng;
use splicer_transport::{KernelSplice, SpliceSyscall};

pub fn listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").unwrap()
}

/// Loopback TCP pair: `(peer, engine_side)`. Only the engine side is
/// non-blocking, the peer is driven by plain blocking test code.
pub fn tcp_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (engine_side, _) = listener.accept().unwrap();
    engine_side.set_nonblocking(true).unwrap();
    (peer, engine_side)
}

/// Deterministic payload that makes reordering visible
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// One successful splice observed by [`Recorder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    /// source -> pipe
    Fill { moved: usize },
    /// pipe -> destination
    Drain { requested: usize, moved: usize },
}

/// Records every transfer touching the source or destination socket and can
/// fragment destination writes to force partial drains.
pub struct Recorder {
    source: RawFd,
    destination: RawFd,
    fragment: bool,
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    pub fn new(source: &impl AsRawFd, destination: &impl AsRawFd, fragment: bool) -> Self {
        Self {
            source: source.as_raw_fd(),
            destination: destination.as_raw_fd(),
            fragment,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn drains(&self) -> Vec<(usize, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Drain { requested, moved } => Some((requested, moved)),
                Call::Fill { .. } => None,
            })
            .collect()
    }

    /// Replays the log and checks the pending-drain accounting: a fill only
    /// happens on an empty pipe and a drain asks for exactly what is pending.
    pub fn assert_accounting(&self) -> usize {
        let mut pending = 0usize;
        let mut delivered = 0usize;
        for call in self.calls() {
            match call {
                Call::Fill { moved } => {
                    assert_eq!(pending, 0, "source read while {} bytes pending", pending);
                    pending = moved;
                }
                Call::Drain { requested, moved } => {
                    assert_eq!(requested, pending, "drain asked for more than pending");
                    assert!(moved <= requested);
                    pending -= moved;
                    delivered += moved;
                }
            }
        }
        assert_eq!(pending, 0, "bytes left in the pipe");
        delivered
    }
}

impl SpliceSyscall for Recorder {
    fn splice(
        &self,
        fd_in: BorrowedFd<'_>,
        fd_out: BorrowedFd<'_>,
        len: usize,
    ) -> io::Result<usize> {
        if fd_out.as_raw_fd() == self.destination {
            let asked = if self.fragment && len > 1 {
                rand::thread_rng().gen_range(1..=len)
            } else {
                len
            };
            let result = KernelSplice.splice(fd_in, fd_out, asked);
            if let Ok(moved) = result {
                if moved > 0 {
                    self.calls.lock().unwrap().push(Call::Drain {
                        requested: len,
                        moved,
                    });
                }
            }
            return result;
        }

        let result = KernelSplice.splice(fd_in, fd_out, len);
        if fd_in.as_raw_fd() == self.source {
            if let Ok(moved) = result {
                if moved > 0 {
                    self.calls.lock().unwrap().push(Call::Fill { moved });
                }
            }
        }
        result
    }
}
