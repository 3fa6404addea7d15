//! Filesystem object store using git's loose object layout.
//!
//! Each object lives at `<root>/<first 2 hex>/<remaining 38 hex>` as the
//! zlib-compressed canonical encoding. Files are written to a temporary
//! sibling, synced, then linked into place without clobbering, so readers
//! only ever observe complete objects.

use crate::compression::{compress, decompress, CompressionLevel, CompressionStats};
use crate::{GitObject, ObjectId, ObjectStore, Result, StorageError, OBJECT_ID_HEX_LEN};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Loose-object store rooted at a directory.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    level: CompressionLevel,
    stats: CompressionStats,
}

impl FsStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_compression(root, CompressionLevel::default())
    }

    /// Opens a store with an explicit compression level.
    pub fn with_compression(root: impl Into<PathBuf>, level: CompressionLevel) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::info!(path = %root.display(), "Opened filesystem object store");
        Ok(Self {
            root,
            level,
            stats: CompressionStats::default(),
        })
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the aggregate compression ratio of objects written so far.
    pub fn compression_ratio(&self) -> f64 {
        self.stats.compression_ratio()
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        let (prefix, rest) = hex.split_at(2);
        self.root.join(prefix).join(rest)
    }
}

impl ObjectStore for FsStore {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        let id = object.id;
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }

        let compressed = compress(&object, self.level)?;
        self.stats.record(object.size() as u64, compressed.len() as u64);

        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidObject(format!("bad object path for {}", id)))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.as_file().sync_all()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                tracing::trace!(id = %id, bytes = compressed.len(), "Wrote loose object");
                Ok(id)
            }
            // A concurrent writer of the same content got there first.
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(id),
            Err(e) => Err(StorageError::Io(e.error)),
        }
    }

    fn get(&self, id: &ObjectId) -> Result<GitObject> {
        let bytes = match fs::read(self.object_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::ObjectNotFound(*id))
            }
            Err(e) => return Err(e.into()),
        };

        let object = decompress(&bytes)
            .map_err(|e| StorageError::Corruption(format!("object {}: {}", id, e)))?;
        if object.id != *id {
            tracing::error!(expected = %id, actual = %object.id, "Loose object hash mismatch");
            return Err(StorageError::Corruption(format!(
                "object {} rehashes to {}",
                id, object.id
            )));
        }
        Ok(object)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.object_path(id).is_file())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.list_objects()?.len())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for prefix in fs::read_dir(&self.root)? {
            let prefix = prefix?;
            let prefix_name = prefix.file_name();
            let Some(prefix_str) = prefix_name.to_str() else {
                continue;
            };
            if prefix_str.len() != 2 || !prefix.file_type()?.is_dir() {
                continue;
            }

            for entry in fs::read_dir(prefix.path())? {
                let name = entry?.file_name();
                let Some(rest) = name.to_str() else {
                    continue;
                };
                // Skips in-flight temporary files.
                if rest.len() != OBJECT_ID_HEX_LEN - 2 {
                    continue;
                }
                if let Ok(id) = ObjectId::from_hex(&format!("{}{}", prefix_str, rest)) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let obj = GitObject::blob(b"hello\n".to_vec());
        let id = store.put(obj.clone()).unwrap();

        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(dir
            .path()
            .join("ce")
            .join("013625030ba8dba906f756967f9e9ca394464a")
            .is_file());
        assert_eq!(store.get(&id).unwrap(), obj);
        assert!(store.contains(&id).unwrap());
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let obj = GitObject::blob(b"same".to_vec());
        store.put(obj.clone()).unwrap();
        store.put(obj).unwrap();

        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let id = ObjectId::from_bytes([9u8; 20]);

        assert!(matches!(
            store.get(&id),
            Err(StorageError::ObjectNotFound(_))
        ));
        assert!(!store.contains(&id).unwrap());
    }

    #[test]
    fn test_tampered_object_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let id = store.put(GitObject::blob(b"original".to_vec())).unwrap();
        let other = compress(&GitObject::blob(b"tampered".to_vec()), CompressionLevel::Fast).unwrap();
        fs::write(store.object_path(&id), other).unwrap();

        assert!(matches!(store.get(&id), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_truncated_object_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let id = store.put(GitObject::blob(vec![b'x'; 4096])).unwrap();
        let path = store.object_path(&id);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = store.get(&id).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_list_objects_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();

        let a = store.put(GitObject::blob(b"a".to_vec())).unwrap();
        let b = store.put(GitObject::blob(b"b".to_vec())).unwrap();
        fs::write(dir.path().join("README"), b"not an object").unwrap();
        fs::write(store.object_path(&a).with_extension("tmp"), b"partial").unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list_objects().unwrap(), expected);
    }

    #[test]
    fn test_reopen_sees_objects() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FsStore::open(dir.path()).unwrap();
            store.put(GitObject::blob(b"durable".to_vec())).unwrap()
        };
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(&store.get(&id).unwrap().data[..], b"durable");
    }

    #[test]
    fn test_concurrent_identical_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsStore::open(dir.path()).unwrap());
        let obj = GitObject::blob(vec![42u8; 10_000]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let obj = obj.clone();
                std::thread::spawn(move || store.put(obj).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), obj.id);
        }

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&obj.id).unwrap(), obj);
    }
}
