//! Acknowledging echo server
//!
//! Upstream side of the demonstration pair: every chunk a client sends is
//! answered with `ACK: ` followed by the chunk itself.

mod server;

pub use server::{EchoServer, EchoServerConfig, EchoServerError, ACK_PREFIX, READ_BUFFER_SIZE};
