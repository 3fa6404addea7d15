//! Git protocol error types.

use cairn_storage::{ObjectId, StorageError};
use thiserror::Error;

/// Errors that can occur during git protocol operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The pack stream is malformed, truncated or fails its checksum.
    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    /// A referenced object is neither in the pack nor in the store.
    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),

    /// A reference moved underneath a compare-and-swap.
    #[error("reference conflict on {name}: expected {expected:?}, found {found:?}")]
    RefConflict {
        /// Reference name.
        name: String,
        /// Value the client believed current.
        expected: Option<ObjectId>,
        /// Value actually stored.
        found: Option<ObjectId>,
    },

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Returns true if the error comes from the storage medium or the
    /// transport, rather than from what the peer sent.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_fatal(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

impl From<StorageError> for GitError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RefConflict {
                name,
                expected,
                found,
            } => Self::RefConflict {
                name,
                expected,
                found,
            },
            other => Self::Storage(other),
        }
    }
}
