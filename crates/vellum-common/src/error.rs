//! Error types for Vellum.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using VellumError.
pub type Result<T> = std::result::Result<T, VellumError>;

/// Errors that can occur in Vellum operations.
///
/// Absent keys and duplicate keys are ordinary outcomes of index
/// operations and are reported through return values, not through
/// this enum.
#[derive(Debug, Error)]
pub enum VellumError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: PageId, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: VellumError = io_err.into();
        assert!(matches!(err, VellumError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_buffer_pool_full_display() {
        let err = VellumError::BufferPoolFull;
        assert_eq!(err.to_string(), "Buffer pool full, unable to allocate frame");
    }

    #[test]
    fn test_page_not_found_display() {
        let err = VellumError::PageNotFound {
            page_id: PageId(42),
        };
        assert_eq!(err.to_string(), "Page not found: 42");
    }

    #[test]
    fn test_page_corrupted_display() {
        let err = VellumError::PageCorrupted {
            page_id: PageId(7),
            reason: "bad kind tag".to_string(),
        };
        assert_eq!(err.to_string(), "Page corrupted: 7, reason: bad kind tag");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(VellumError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VellumError>();
    }
}
