//! Error types for the thingsync-client crate.

use std::time::Duration;

/// Errors surfaced by client operations and delivered to completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The transport failed to connect, publish, subscribe, unsubscribe or disconnect
    #[error("Connection error: {0}")]
    Connection(String),

    /// A synchronous call's deadline elapsed before the operation resolved
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation is not allowed in the current client state
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote service answered with a rejected acknowledgement
    #[error("Request rejected with code {code}: {message}")]
    AckRejected {
        /// Numeric code carried in the rejection
        code: u16,
        /// Human readable reason carried in the rejection
        message: String,
    },

    /// The local document version diverged from the one a report was built for
    #[error("Version conflict: expected local version {expected}, found {actual}")]
    VersionConflict {
        /// Version captured when the report was rendered
        expected: i64,
        /// Version observed when the report was about to be sent
        actual: i64,
    },
}

impl ClientError {
    /// Shorthand for the "not connected" configuration error.
    pub(crate) fn not_connected() -> Self {
        ClientError::Configuration("client is not connected".to_string())
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}

/// Convenience type alias for Results using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;
