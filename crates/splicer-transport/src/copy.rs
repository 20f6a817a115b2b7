//! User-space copy loop, the drop-in alternative to the splice engine

use std::io;
use std::os::fd::BorrowedFd;

use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::fd::{raw_fd, Connection};
use crate::monitor::EventMonitor;
use crate::splice::is_peer_termination;
use crate::transport::Transport;

/// Default copy buffer (16KB)
pub const DEFAULT_COPY_BUFFER: usize = 16 * 1024;

/// Copies through a heap buffer; waits on the same readiness primitives as
/// the splice engine when a non-blocking socket is not ready.
#[derive(Debug, Clone)]
pub struct CopyTransport {
    buffer_size: usize,
}

impl CopyTransport {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

impl Default for CopyTransport {
    fn default() -> Self {
        Self::new(DEFAULT_COPY_BUFFER)
    }
}

impl Transport for CopyTransport {
    fn name(&self) -> &'static str {
        "userspace"
    }

    fn transport(
        &self,
        source: &dyn Connection,
        destination: &dyn Connection,
    ) -> TransportResult<()> {
        let src_fd = raw_fd(source)?;
        let dst_fd = raw_fd(destination)?;

        let mut monitor = EventMonitor::create()?;
        monitor.watch(src_fd)?;

        let mut buffer = vec![0u8; self.buffer_size];
        let mut total = 0u64;
        loop {
            let n = match source.read_bytes(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    monitor.wait()?;
                    continue;
                }
                Err(e) if is_peer_termination(&e) => break,
                Err(e) => {
                    debug!(
                        "Transfer error from {} to {}: {}",
                        source.label(),
                        destination.label(),
                        e
                    );
                    return Err(TransportError::Io(e));
                }
            };

            if !write_all(destination, dst_fd, &buffer[..n])? {
                break;
            }
            total += n as u64;
        }

        debug!(
            "Copied {} bytes from {} to {}",
            total,
            source.label(),
            destination.label()
        );
        Ok(())
    }
}

/// Returns `Ok(false)` when the destination went away mid-write.
fn write_all(
    destination: &dyn Connection,
    fd: BorrowedFd<'_>,
    mut data: &[u8],
) -> TransportResult<bool> {
    while !data.is_empty() {
        match destination.write_bytes(data) {
            Ok(0) => return Ok(false),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                EventMonitor::await_writable(fd)?;
            }
            Err(e) if is_peer_termination(&e) => return Ok(false),
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(true)
}
