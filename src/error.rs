//! Typed error hierarchy for gosh-core
//!
//! Every error type includes context about what went wrong and whether
//! the operation can be retried. Transient conditions (disk-cache
//! pressure, a single malformed datagram) are *not* errors: the pool
//! expresses pressure by returning `None` and the uTP layer silently
//! drops bad packets.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the transport/disk core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Network-related errors (UDP send/bind failures, resets, timeouts)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Disk-cache errors (mmap setup, pinning)
    #[error("Disk cache error at {path:?}: {message}")]
    DiskCache {
        kind: DiskErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Protocol-level errors (bencode, uTP framing)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// The manager or pool is shutting down
    #[error("Core is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused by peer
    ConnectionRefused,
    /// Peer sent a RESET
    ConnectionReset,
    /// Retransmissions exhausted
    Timeout,
    /// UDP socket send failed
    SendFailed,
    /// Datagram exceeded the path MTU
    MessageTooLarge,
    /// Other network error
    Other,
}

/// Disk cache error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskErrorKind {
    /// mmap cache file could not be created or mapped
    MmapFailed,
    /// mlock/VirtualLock failed
    LockFailed,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Bencode parsing error
    BencodeParse,
    /// uTP header malformed or wrong version
    UtpHeader,
    /// uTP extension chain malformed
    UtpExtension,
    /// Ack for a sequence number that was never sent
    ImpossibleAck,
}

impl CoreError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::DiskCache { kind, .. } => matches!(kind, DiskErrorKind::Io),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::SendFailed
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a disk cache error
    pub fn disk(kind: DiskErrorKind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::DiskCache {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset => NetworkErrorKind::ConnectionReset,
            ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            _ => NetworkErrorKind::Other,
        };
        CoreError::network(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let e = CoreError::network(NetworkErrorKind::Timeout, "retransmits exhausted");
        assert!(e.is_retryable());

        let e = CoreError::network(NetworkErrorKind::ConnectionRefused, "refused");
        assert!(!e.is_retryable());

        let e = CoreError::protocol(ProtocolErrorKind::BencodeParse, "bad int");
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let e: CoreError = io.into();
        match e {
            CoreError::Network { kind, .. } => assert_eq!(kind, NetworkErrorKind::ConnectionReset),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
