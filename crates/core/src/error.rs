//! Error types for the search layer
//!
//! Every fallible operation in the workspace returns [`Result`]. The variants
//! mirror the failure classes callers branch on: malformed input, missing data
//! sources, internal failures, and indexes known to be incomplete.

use std::io;
use thiserror::Error;

/// Result type alias for search-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the search layer
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed options, incompatible persisted plan, out-of-range reference
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Missing view, index, shard or collection
    #[error("data source not found: {0}")]
    DataSourceNotFound(String),

    /// Failed to acquire a transaction, build a snapshot or prepare a filter
    #[error("internal error: {0}")]
    Internal(String),

    /// The index is known to be missing data
    #[error("index out of sync: {0}")]
    OutOfSync(String),

    /// A filter expression that cannot be turned into an index query
    #[error("unsupported filter expression: {0}")]
    UnsupportedFilter(String),

    /// I/O error (segment files, manifest, directory lock)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected on disk
    #[error("data corruption: {0}")]
    Corruption(String),
}

impl Error {
    /// Create a [`Error::BadParameter`]
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }

    /// Create a [`Error::DataSourceNotFound`]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::DataSourceNotFound(msg.into())
    }

    /// Create a [`Error::Internal`]
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a [`Error::OutOfSync`]
    pub fn out_of_sync(msg: impl Into<String>) -> Self {
        Error::OutOfSync(msg.into())
    }

    /// Create a [`Error::UnsupportedFilter`]
    pub fn unsupported_filter(msg: impl Into<String>) -> Self {
        Error::UnsupportedFilter(msg.into())
    }

    /// Create a [`Error::Serialization`]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Error::Serialization(msg.into())
    }

    /// Create a [`Error::Corruption`]
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// True for [`Error::BadParameter`]
    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Error::BadParameter(_))
    }

    /// True for [`Error::DataSourceNotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DataSourceNotFound(_))
    }

    /// True for [`Error::Internal`]
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    /// True for [`Error::OutOfSync`]
    pub fn is_out_of_sync(&self) -> bool {
        matches!(self, Error::OutOfSync(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_bad_parameter() {
        let err = Error::bad_parameter("invalid option 'parallelism'");
        let msg = err.to_string();
        assert!(msg.contains("bad parameter"));
        assert!(msg.contains("parallelism"));
        assert!(err.is_bad_parameter());
    }

    #[test]
    fn test_error_display_io() {
        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_predicates_are_exclusive() {
        let err = Error::out_of_sync("index 42");
        assert!(err.is_out_of_sync());
        assert!(!err.is_bad_parameter());
        assert!(!err.is_not_found());
        assert!(!err.is_internal());
    }

    #[test]
    fn test_error_from_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
