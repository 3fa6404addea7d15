//! Object store capability trait.
//!
//! Every backend (memory, filesystem, cached) exposes the same
//! content-addressed contract, so protocol code only ever sees
//! `&dyn ObjectStore`.

use crate::{GitObject, ObjectId, ObjectType, Result};
use bytes::Bytes;
use std::sync::Arc;

/// Content-addressed object storage.
///
/// Writes are idempotent: storing identical content twice yields the same
/// id and leaves a single copy. Implementations must make concurrent writes
/// of the same id safe without locking the whole store, and must never
/// expose a partially written object to readers.
pub trait ObjectStore: Send + Sync {
    /// Stores an object if absent and returns its ID.
    fn put(&self, object: GitObject) -> Result<ObjectId>;

    /// Retrieves an object by ID.
    ///
    /// Returns [`crate::StorageError::ObjectNotFound`] when absent.
    fn get(&self, id: &ObjectId) -> Result<GitObject>;

    /// Checks if an object exists.
    fn contains(&self, id: &ObjectId) -> Result<bool>;

    /// Returns the number of distinct objects in the store.
    fn len(&self) -> Result<usize>;

    /// Lists all object IDs.
    fn list_objects(&self) -> Result<Vec<ObjectId>>;

    /// Returns true if the store is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Hashes and stores raw content of the given type.
    fn store(&self, object_type: ObjectType, data: Bytes) -> Result<ObjectId> {
        self.put(GitObject::new(object_type, data))
    }

    /// Batch put operation.
    fn put_batch(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        objects.into_iter().map(|obj| self.put(obj)).collect()
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        (**self).put(object)
    }

    fn get(&self, id: &ObjectId) -> Result<GitObject> {
        (**self).get(id)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        (**self).contains(id)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        (**self).list_objects()
    }

    fn put_batch(&self, objects: Vec<GitObject>) -> Result<Vec<ObjectId>> {
        (**self).put_batch(objects)
    }
}
