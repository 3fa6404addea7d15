//! Git object storage for Cairn.
//!
//! This crate provides content-addressed storage for git objects
//! (blobs, trees, commits, tags) and compare-and-swap reference tables.
//!
//! Three [`ObjectStore`] backends are available:
//!
//! - [`MemoryStore`]: sharded in-memory map.
//! - [`FsStore`]: git-compatible loose objects on disk.
//! - [`CachedStore`]: LRU read cache over any other backend.

mod cache;
pub mod compression;
mod error;
mod fs;
mod object;
mod refs;
mod store;
mod traits;

pub use cache::{CacheConfig, CacheStats, CachedStore};
pub use compression::CompressionLevel;
pub use error::{Result, StorageError};
pub use fs::FsStore;
pub use object::{GitObject, ObjectId, ObjectType, OBJECT_ID_HEX_LEN, OBJECT_ID_LEN};
pub use refs::{check_ref_format, RefStore, Reference};
pub use store::{MemoryStore, RepoStore, Repository};
pub use traits::ObjectStore;
