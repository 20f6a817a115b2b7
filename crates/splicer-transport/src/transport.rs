//! Transport trait shared by every forwarding strategy

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::copy::CopyTransport;
use crate::engine::{DuplexTransport, EngineConfig};
use crate::error::TransportResult;
use crate::fd::Connection;

/// Moves bytes from one connection to another, one direction per call.
///
/// Blocks until the source ends, either peer goes away, or the direction
/// fails. `Ok(())` covers every orderly ending; the proxy owns both
/// connections and closes them once both directions have returned.
pub trait Transport: Send + Sync {
    /// Short name used in logs and configuration
    fn name(&self) -> &'static str;

    fn transport(
        &self,
        source: &dyn Connection,
        destination: &dyn Connection,
    ) -> TransportResult<()>;
}

/// Strategy selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Zero-copy `splice(2)` engine
    #[default]
    Splice,
    /// Plain read/write loop through a user-space buffer
    Userspace,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Splice => "splice",
            TransportKind::Userspace => "userspace",
        }
    }

    /// Build the strategy once; the result is shared by every connection.
    pub fn build(self, config: EngineConfig) -> Arc<dyn Transport> {
        match self {
            TransportKind::Splice => Arc::new(DuplexTransport::new(config)),
            TransportKind::Userspace => Arc::new(CopyTransport::default()),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "splice" | "tcpsplice" => Ok(TransportKind::Splice),
            "userspace" | "copy" => Ok(TransportKind::Userspace),
            other => Err(format!(
                "unknown transport '{}': expected 'splice' or 'userspace'",
                other
            )),
        }
    }
}
