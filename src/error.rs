//! Error types for key-value operations.
//!
//! One taxonomy is shared by every backend and by the connection proxy:
//! connection failures, CAS mismatches, value encoding failures and opaque
//! backend errors. A missing key is not an error; reads return `Ok(None)`.

use thiserror::Error;

/// Errors that can occur during key-value operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend connection could not be established.
    ///
    /// Terminal for a [`ConnectionProxy`](crate::ConnectionProxy): every
    /// queued and future call on that proxy fails with the same message.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Conditional write rejected because the stored state did not match
    /// the expected token (or the expected absence of the key).
    #[error("cas mismatch for key: {key}")]
    CasMismatch { key: String },

    /// A stored value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// The backend reported a failure unrelated to CAS semantics.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No registered and available backend matches the requested name.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Configuration could not be parsed or applied.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for key-value operations.
pub type Result<T> = std::result::Result<T, KvError>;

impl KvError {
    /// Create a CAS mismatch error for the given key.
    pub fn cas_mismatch(key: impl Into<String>) -> Self {
        KvError::CasMismatch { key: key.into() }
    }

    /// Returns true if the caller can re-read and retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::CasMismatch { .. })
    }

    /// Returns true if this is a CAS mismatch.
    pub fn is_cas_mismatch(&self) -> bool {
        matches!(self, KvError::CasMismatch { .. })
    }

    /// Returns true if this error came from connection establishment.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, KvError::ConnectionError(_))
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::EncodingError(err.to_string())
    }
}

impl From<toml::de::Error> for KvError {
    fn from(err: toml::de::Error) -> Self {
        KvError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::cas_mismatch("test-key");
        assert!(err.to_string().contains("cas mismatch"));
        assert!(err.to_string().contains("test-key"));
    }

    #[test]
    fn test_connection_error_display() {
        let err = KvError::ConnectionError("refused".to_string());
        assert_eq!(err.to_string(), "connection error: refused");
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(KvError::cas_mismatch("k").is_retryable());
        assert!(!KvError::ConnectionError("test".to_string()).is_retryable());
        assert!(!KvError::EncodingError("test".to_string()).is_retryable());
        assert!(!KvError::BackendError("test".to_string()).is_retryable());
    }

    #[test]
    fn test_json_error_is_encoding_error() {
        let err: KvError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, KvError::EncodingError(_)));
    }
}
