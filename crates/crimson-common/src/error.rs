//! Error types for Crimson
//!
//! This module defines the common error type used throughout the system
//! and its mapping onto POSIX error numbers for the wire protocol.

use thiserror::Error;

/// Common result type for Crimson operations
pub type Result<T> = std::result::Result<T, Error>;

/// POSIX error numbers used on the wire
pub mod errno {
    pub const ENOENT: u32 = 2;
    pub const EIO: u32 = 5;
    pub const EBADF: u32 = 9;
    pub const EEXIST: u32 = 17;
    pub const EINVAL: u32 = 22;
    pub const ENOTEMPTY: u32 = 39;
    pub const EPROTO: u32 = 71;
    pub const ENOTSUP: u32 = 95;
}

/// Common error type for Crimson
#[derive(Debug, Error)]
pub enum Error {
    // Store errors
    #[error("no such collection: {0}")]
    NoSuchCollection(String),

    #[error("no such object: {0}")]
    NoSuchObject(String),

    #[error("no such attribute key: {0}")]
    NoSuchAttributeKey(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("object already exists: {0}")]
    ObjectExists(String),

    #[error("operation not supported: {0}")]
    OperationNotSupported(&'static str),

    #[error("out of range: offset {offset} + length {length} beyond end {end}")]
    OutOfRange { offset: u64, length: u64, end: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cursor invalidated by removal")]
    InvalidCursor,

    #[error("handle used after close")]
    InvalidHandle,

    #[error("collection not empty: {0}")]
    CollectionNotEmpty(String),

    // Wire errors
    #[error("protocol error ({phase}): {detail}")]
    Protocol { phase: String, detail: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an operation not supported error
    pub fn not_supported(op: &'static str) -> Self {
        Self::OperationNotSupported(op)
    }

    /// Create a protocol error with a phase label
    pub fn protocol(phase: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Protocol {
            phase: phase.into(),
            detail: detail.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchCollection(_) | Self::NoSuchObject(_) | Self::NoSuchAttributeKey(_)
        )
    }

    /// Get the POSIX error number carried in wire replies
    #[must_use]
    pub fn errno(&self) -> u32 {
        match self {
            Self::NoSuchCollection(_)
            | Self::NoSuchObject(_)
            | Self::NoSuchAttributeKey(_) => errno::ENOENT,

            Self::CollectionExists(_) | Self::ObjectExists(_) => errno::EEXIST,

            Self::OperationNotSupported(_) => errno::ENOTSUP,

            Self::OutOfRange { .. } | Self::InvalidArgument(_) | Self::InvalidCursor => {
                errno::EINVAL
            }

            Self::InvalidHandle => errno::EBADF,

            Self::CollectionNotEmpty(_) => errno::ENOTEMPTY,

            Self::Protocol { .. } => errno::EPROTO,

            Self::Io(_) => errno::EIO,
        }
    }
}
