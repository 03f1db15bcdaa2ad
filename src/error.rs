//! Unified error handling for the persistence subsystem.
//!
//! Every store operation, local or remote, reports failures through
//! [`PersistenceError`]. The variant tells the caller what to do next:
//! `Unavailable` is retried by the sync controller, `CorruptData` aborts the
//! pass for that record, and `LocalWriteFailed` goes straight back to whoever
//! asked for the write.

use thiserror::Error;

/// Unified error type for persistence and synchronization operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error), uniffi(flat_error))]
pub enum PersistenceError {
    /// Network or disk could not be reached. Retryable.
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },
    /// Stored bytes could not be decoded into a record.
    #[error("Corrupt data for '{key}': {message}")]
    CorruptData { key: String, message: String },
    /// A local write was rejected (disk full, permissions, constraint).
    #[error("Local write failed: {message}")]
    LocalWriteFailed { message: String },
    /// Invalid configuration supplied at construction time.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PersistenceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        PersistenceError::Unavailable {
            message: message.into(),
        }
    }

    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        PersistenceError::CorruptData {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn write_failed(message: impl Into<String>) -> Self {
        PersistenceError::LocalWriteFailed {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PersistenceError::Config {
            message: message.into(),
        }
    }

    /// Whether a later attempt can be expected to succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Unavailable { .. })
    }
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Extension trait for mapping SQLite errors onto the taxonomy.
///
/// Whether a SQLite failure is a read or a write is only known at the call
/// site, so the caller picks the mapping.
pub trait SqlResultExt<T> {
    /// A failed read means the database could not be reached.
    fn or_unavailable(self, context: &str) -> Result<T>;

    /// A failed write is surfaced to the caller as a local write failure.
    fn or_write_failed(self, context: &str) -> Result<T>;
}

impl<T> SqlResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn or_unavailable(self, context: &str) -> Result<T> {
        self.map_err(|e| PersistenceError::unavailable(format!("{}: {}", context, e)))
    }

    fn or_write_failed(self, context: &str) -> Result<T> {
        self.map_err(|e| PersistenceError::write_failed(format!("{}: {}", context, e)))
    }
}

/// Extension trait for decode failures.
pub trait DecodeResultExt<T> {
    /// Decoding failed: the stored bytes under `key` are corrupt.
    fn or_corrupt(self, key: &str) -> Result<T>;
}

impl<T> DecodeResultExt<T> for std::result::Result<T, rmp_serde::decode::Error> {
    fn or_corrupt(self, key: &str) -> Result<T> {
        self.map_err(|e| PersistenceError::corrupt(key, e.to_string()))
    }
}

impl<T> DecodeResultExt<T> for std::result::Result<T, serde_json::Error> {
    fn or_corrupt(self, key: &str) -> Result<T> {
        self.map_err(|e| PersistenceError::corrupt(key, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PersistenceError::corrupt("run/1000", "unexpected end of input");
        assert!(err.to_string().contains("run/1000"));
        assert!(err.to_string().contains("unexpected end of input"));
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(PersistenceError::unavailable("offline").is_retryable());
        assert!(!PersistenceError::corrupt("k", "bad").is_retryable());
        assert!(!PersistenceError::write_failed("disk full").is_retryable());
        assert!(!PersistenceError::config("bad url").is_retryable());
    }

    #[test]
    fn test_sql_result_ext() {
        let read: std::result::Result<(), rusqlite::Error> = Err(rusqlite::Error::InvalidQuery);
        assert!(matches!(
            read.or_unavailable("list runs"),
            Err(PersistenceError::Unavailable { .. })
        ));
        let write: std::result::Result<(), rusqlite::Error> = Err(rusqlite::Error::InvalidQuery);
        assert!(matches!(
            write.or_write_failed("save run"),
            Err(PersistenceError::LocalWriteFailed { .. })
        ));
    }

    #[test]
    fn test_decode_result_ext() {
        let decoded: std::result::Result<u32, serde_json::Error> = serde_json::from_str("{");
        match decoded.or_corrupt("aggregate") {
            Err(PersistenceError::CorruptData { key, .. }) => assert_eq!(key, "aggregate"),
            other => panic!("expected CorruptData, got {:?}", other),
        }
    }
}
