//! Error types for the exmem library.

use thiserror::Error;

/// Result type alias using ExmemError.
pub type Result<T> = std::result::Result<T, ExmemError>;

/// Errors that can occur in exmem operations.
#[derive(Debug, Error)]
pub enum ExmemError {
    // I/O plumbing errors (opening files, reading configuration)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Block manager errors
    #[error("no configured disk has a free extent of {requested} bytes")]
    NoSpace { requested: u64 },

    // Request errors
    #[error("I/O failed on disk {disk} at offset {offset}, length {length}: {source}")]
    IoFailed {
        disk: u32,
        offset: u64,
        length: usize,
        source: std::io::Error,
    },

    #[error("request was cancelled before completion")]
    Cancelled,

    // B+ tree errors
    #[error("tree height {height} exceeds the pinnable path of the node cache ({cache_slots} slots)")]
    TreeTooTall { height: u32, cache_slots: usize },

    #[error("every cache slot is pinned, cannot evict")]
    CacheExhausted,

    #[error("key not found")]
    KeyNotFound,

    #[error("the comparator's sentinel key is reserved and cannot be inserted")]
    BadKey,

    // Configuration errors
    #[error("bad disk configuration: {0}")]
    BadConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: ExmemError = io_err.into();
        assert!(matches!(err, ExmemError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_no_space_display() {
        let err = ExmemError::NoSpace { requested: 4096 };
        assert_eq!(
            err.to_string(),
            "no configured disk has a free extent of 4096 bytes"
        );
    }

    #[test]
    fn test_io_failed_display() {
        let err = ExmemError::IoFailed {
            disk: 2,
            offset: 1 << 20,
            length: 4096,
            source: IoError::new(ErrorKind::UnexpectedEof, "short read"),
        };
        let text = err.to_string();
        assert!(text.contains("disk 2"));
        assert!(text.contains("offset 1048576"));
        assert!(text.contains("short read"));
    }

    #[test]
    fn test_tree_too_tall_display() {
        let err = ExmemError::TreeTooTall {
            height: 5,
            cache_slots: 3,
        };
        assert!(err.to_string().contains("height 5"));
        assert!(err.to_string().contains("3 slots"));
    }

    #[test]
    fn test_bad_config_display() {
        let err = ExmemError::BadConfig("line 3: unknown driver 'nvme'".to_string());
        assert_eq!(
            err.to_string(),
            "bad disk configuration: line 3: unknown driver 'nvme'"
        );
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(ExmemError::KeyNotFound)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ExmemError>();
    }
}
