//! Error types for StripeFS
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for StripeFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeFS
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Journal errors
    #[error("journal not found")]
    JournalNotFound,

    #[error("journal is read-only")]
    JournalReadOnly,

    #[error("shutting down")]
    ShuttingDown,

    // Encoding errors
    #[error("record requires version {version}, understand up to {supported}")]
    IncompatibleVersion { version: u8, supported: u8 },

    #[error("record truncated: need {need} bytes, {have} available")]
    TruncatedRecord { need: usize, have: usize },

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    // Object store errors
    #[error("object store error: {0}")]
    ObjectStore(String),
}
