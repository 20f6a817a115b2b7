//! Transport errors

use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Failure to reach the raw socket behind a [`Connection`](crate::Connection)
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("connection {0} is not backed by an OS socket")]
    NotOwned(String),

    #[error("descriptor of {label} is not usable: {source}")]
    ControlFailure {
        label: String,
        #[source]
        source: io::Error,
    },
}

/// Errors that abort one direction of a proxied connection.
///
/// Peer termination (reset, broken pipe, end of stream) is not an error and
/// never shows up here.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Descriptor access failed: {0}")]
    DescriptorAccess(#[from] DescriptorError),

    #[error("Failed to create kernel pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("Failed to create epoll instance: {0}")]
    MonitorCreation(#[source] io::Error),

    #[error("Failed to register fd {fd} with epoll: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("Waiting for events failed: {0}")]
    Wait(#[source] io::Error),

    #[error("Transfer fault after {attempts} consecutive failure(s): {source}")]
    TransferFault {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when the direction failed before moving any byte, because a
    /// descriptor, pipe or epoll instance could not be obtained.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            TransportError::DescriptorAccess(_)
                | TransportError::PipeCreation(_)
                | TransportError::MonitorCreation(_)
                | TransportError::Register { .. }
        )
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_failures() {
        let err = TransportError::from(DescriptorError::NotOwned("mem".to_string()));
        assert!(err.is_setup_failure());
        assert!(TransportError::PipeCreation(io::Error::from_raw_os_error(libc::EMFILE))
            .is_setup_failure());

        let fault = TransportError::TransferFault {
            attempts: 3,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(!fault.is_setup_failure());
        assert!(fault.to_string().contains("3 consecutive"));
    }
}
