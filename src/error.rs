//! Error types for atlas-idb
//!
//! Provides a unified error type for all backing store operations.

use thiserror::Error;

/// Result type alias using IdbError
pub type Result<T> = std::result::Result<T, IdbError>;

/// `ENOSPC` on every unix we build for.
const ENOSPC: i32 = 28;

/// Unified error type for backing store operations
#[derive(Debug, Error)]
pub enum IdbError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Disk full")]
    DiskFull,

    // -------------------------------------------------------------------------
    // Data Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(&'static str),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Blob Errors
    // -------------------------------------------------------------------------
    #[error("Blob write failed: {0}")]
    BlobWriteFailed(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IdbError {
    /// Corruption from external causes and broken internal invariants both
    /// send the store down the destroy-and-recreate path.
    pub fn is_corruption(&self) -> bool {
        matches!(self, IdbError::Corruption(_) | IdbError::InternalInconsistency(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IdbError::NotFound(_))
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, IdbError::DiskFull)
    }
}

impl From<std::io::Error> for IdbError {
    fn from(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            IdbError::DiskFull
        } else {
            IdbError::Io(err)
        }
    }
}

impl From<bincode::Error> for IdbError {
    fn from(err: bincode::Error) -> Self {
        IdbError::Serialization(err.to_string())
    }
}
