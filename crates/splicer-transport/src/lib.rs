//! Zero-copy TCP transport
//!
//! Moves bytes between two established sockets with `splice(2)` through a
//! kernel pipe, multiplexing readiness with epoll. A plain copy loop satisfies
//! the same [`Transport`] contract and can be swapped in by configuration.
//!
//! Linux only.

pub mod copy;
pub mod engine;
pub mod error;
pub mod fd;
pub mod monitor;
pub mod pipe;
pub mod splice;
pub mod transport;

pub use copy::CopyTransport;
pub use engine::{DuplexTransport, EngineConfig, DEFAULT_MAX_CONSECUTIVE_FAULTS};
pub use error::{DescriptorError, TransportError, TransportResult};
pub use fd::{raw_fd, Connection};
pub use monitor::{EventMonitor, Readiness, Wait};
pub use pipe::{KernelPipe, PipeSize, DEFAULT_PIPE_SIZE};
pub use splice::{is_peer_termination, splice_once, KernelSplice, Outcome, SpliceSyscall};
pub use transport::{Transport, TransportKind};
