//! Typed error hierarchy for the engine
//!
//! Every error carries enough context to decide whether the failure is
//! local to one peer or tracker (drop and continue) or fatal for the
//! torrent (auto-stop and surface through `notify_error`).

use std::sync::Arc;

use thiserror::Error;

/// Main error type for the torrent engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connection, timeout, DNS, etc.)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Storage backend errors
    #[error("Storage error: {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    /// Protocol-level errors (peer wire, tracker, bencode)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Invalid input from the embedder
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

    /// Engine has been closed
    #[error("Engine is closed")]
    Closed,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset
    ConnectionReset,
    /// Connection timeout
    Timeout,
    /// TLS/SSL error
    Tls,
    /// Server returned error status
    HttpStatus(u16),
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Read or write past the torrent's data
    OutOfBounds,
    /// Backend refused the operation
    PermissionDenied,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Invalid URL
    InvalidUrl,
    /// Invalid magnet URI
    InvalidMagnet,
    /// Invalid metainfo structure
    InvalidInfo,
    /// Piece hash verification failed
    HashMismatch,
    /// Tracker error
    TrackerError,
    /// Peer wire protocol violation
    PeerProtocol,
    /// Bencode parsing error
    BencodeParse,
    /// Resume record malformed or mismatched
    ResumeError,
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            Self::Protocol { kind, .. } => matches!(
                kind,
                ProtocolErrorKind::TrackerError | ProtocolErrorKind::PeerProtocol
            ),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionReset
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Storage {
            kind,
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

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// A fatal error as delivered through `notify_error`.
///
/// Fatal errors are broadcast to every subscriber, so the underlying
/// `EngineError` is shared behind an `Arc`.
pub type FatalError = Arc<EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else if let Some(status) = err.status() {
            NetworkErrorKind::HttpStatus(status.as_u16())
        } else {
            NetworkErrorKind::Other
        };

        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionRefused
        );

        Self::Network {
            kind,
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidUrl,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = EngineError::network(NetworkErrorKind::Timeout, "slow peer");
        assert!(timeout.is_retryable());

        let refused = EngineError::network(NetworkErrorKind::ConnectionRefused, "nope");
        assert!(!refused.is_retryable());

        let bad_input = EngineError::invalid_input("listen_port", "out of range");
        assert!(!bad_input.is_retryable());

        let tracker = EngineError::protocol(ProtocolErrorKind::TrackerError, "503");
        assert!(tracker.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EngineError = io.into();
        match err {
            EngineError::Storage { kind, .. } => {
                assert_eq!(kind, StorageErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
