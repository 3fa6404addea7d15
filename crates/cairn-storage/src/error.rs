//! Storage error types.

use crate::ObjectId;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred on the storage medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The object bytes or identifier are malformed.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Stored bytes no longer match their identifier.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// zlib compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// The requested reference does not exist.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// A compare-and-swap saw a different value than the caller expected.
    #[error("reference conflict on {name}: expected {expected:?}, found {found:?}")]
    RefConflict {
        /// Reference name.
        name: String,
        /// Value the caller expected.
        expected: Option<ObjectId>,
        /// Value actually stored.
        found: Option<ObjectId>,
    },

    /// The reference name or target is invalid.
    #[error("invalid reference: {0}")]
    InvalidRef(String),

    /// The repository does not exist.
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// The repository already exists.
    #[error("repository already exists: {0}")]
    RepoExists(String),
}

impl StorageError {
    /// Returns true if the error originates from the storage medium itself.
    ///
    /// Such failures are fatal for the hosting process; everything else is a
    /// per-request condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Corruption(_) | Self::Compression(_)
        )
    }
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
