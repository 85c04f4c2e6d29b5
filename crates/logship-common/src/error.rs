//! Error types for Logship
//!
//! This module defines the common error type used throughout the pipeline.

use crate::types::{AckCode, StreamKeyError};
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for Logship operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Logship
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write to {path} failed: {source}")]
    Writer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Client buffering errors
    #[error("payload of {size} bytes exceeds buffer capacity {capacity}")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("invalid stream key: {0}")]
    InvalidStreamKey(#[from] StreamKeyError),

    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    // Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message rejected by server: {0}")]
    Rejected(AckCode),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    // Storage errors
    #[error("versions exhausted for {path}: more than {max_versions} files in one bucket")]
    VersionsExhausted { path: String, max_versions: u32 },

    #[error("writer is closed: {0}")]
    WriterClosed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),

    #[error("dedup store error: {0}")]
    DedupStore(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Wrap an I/O failure on a rotated file
    pub fn writer(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Writer {
            path: path.into(),
            source,
        }
    }

    /// Check if the failed operation may succeed when retried unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Timeout
            | Self::NotConnected
            | Self::ConnectionFailed(_)
            | Self::BackendUnavailable(_) => true,
            Self::Rejected(code) => *code != AckCode::BufferOverflow,
            _ => false,
        }
    }

    /// Acknowledgement code reported to a client for this failure
    #[must_use]
    pub const fn ack_code(&self) -> AckCode {
        match self {
            Self::PayloadTooLarge { .. } => AckCode::BufferOverflow,
            Self::BackendUnavailable(_) => AckCode::BackendUnavailable,
            Self::Rejected(code) => *code,
            _ => AckCode::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Rejected(AckCode::BackendUnavailable).is_retryable());
        assert!(!Error::Rejected(AckCode::BufferOverflow).is_retryable());
        assert!(
            !Error::VersionsExhausted {
                path: "x".into(),
                max_versions: 3
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_ack_code() {
        assert_eq!(
            Error::BackendUnavailable("disk".into()).ack_code(),
            AckCode::BackendUnavailable
        );
        assert_eq!(
            Error::PayloadTooLarge {
                size: 10,
                capacity: 5
            }
            .ack_code(),
            AckCode::BufferOverflow
        );
        assert_eq!(Error::internal("boom").ack_code(), AckCode::Generic);
    }
}
