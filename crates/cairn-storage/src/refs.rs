//! Git reference management.
//!
//! References are mutated only through [`RefStore::compare_and_swap`], which
//! checks the caller's expected value and applies the new one under the
//! table lock. Two writers racing on the same name therefore serialize: one
//! wins, the other observes [`StorageError::RefConflict`].

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maximum depth followed when resolving symbolic references.
const MAX_SYMREF_DEPTH: usize = 5;

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }
}

/// Thread-safe reference table with optional on-disk persistence.
#[derive(Debug, Default)]
pub struct RefStore {
    refs: RwLock<BTreeMap<String, Reference>>,
    path: Option<PathBuf>,
}

impl RefStore {
    /// Creates a new empty in-memory reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a reference store persisted as JSON at `path`.
    ///
    /// A missing file yields an empty table; it is created on first write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let refs = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Corruption(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            refs: RwLock::new(refs),
            path: Some(path),
        })
    }

    /// Gets a reference by name.
    pub fn get(&self, name: &str) -> Result<Reference> {
        self.refs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Returns the object a direct reference points at, if any.
    pub fn read(&self, name: &str) -> Option<ObjectId> {
        self.refs.read().get(name).and_then(Reference::as_direct)
    }

    /// Sets a symbolic reference.
    pub fn set_symbolic(&self, name: &str, target: &str) {
        let mut refs = self.refs.write();
        let previous = refs.insert(name.to_string(), Reference::Symbolic(target.to_string()));
        if let Err(e) = self.persist(&refs) {
            tracing::warn!(name = %name, error = %e, "Failed to persist symbolic reference");
            match previous {
                Some(prev) => refs.insert(name.to_string(), prev),
                None => refs.remove(name),
            };
        }
    }

    /// Atomically replaces `name` if it currently equals `expected`.
    ///
    /// `expected == None` requires the reference to be absent (create);
    /// `new == None` removes it (delete). Symbolic references cannot be
    /// targeted directly.
    pub fn compare_and_swap(
        &self,
        name: &str,
        expected: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()> {
        let mut refs = self.refs.write();

        let current = match refs.get(name) {
            Some(Reference::Symbolic(target)) => {
                return Err(StorageError::InvalidRef(format!(
                    "{} is a symbolic reference to {}",
                    name, target
                )))
            }
            Some(Reference::Direct(id)) => Some(*id),
            None => None,
        };

        if current != expected {
            return Err(StorageError::RefConflict {
                name: name.to_string(),
                expected,
                found: current,
            });
        }

        match new {
            Some(id) => {
                refs.insert(name.to_string(), Reference::Direct(id));
            }
            None => {
                refs.remove(name);
            }
        }

        if let Err(e) = self.persist(&refs) {
            match current {
                Some(id) => refs.insert(name.to_string(), Reference::Direct(id)),
                None => refs.remove(name),
            };
            return Err(e);
        }

        tracing::debug!(name = %name, old = ?current, new = ?new, "Reference updated");
        Ok(())
    }

    /// Lists all references with a given prefix, sorted by name.
    pub fn list(&self, prefix: &str) -> Vec<(String, Reference)> {
        self.refs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, refr)| (name.clone(), refr.clone()))
            .collect()
    }

    /// Lists all references sorted by name.
    pub fn list_all(&self) -> Vec<(String, Reference)> {
        self.list("")
    }

    /// Resolves a name, following symbolic references.
    pub fn resolve(&self, name: &str) -> Result<ObjectId> {
        let refs = self.refs.read();
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match refs.get(&current) {
                Some(Reference::Direct(id)) => return Ok(*id),
                Some(Reference::Symbolic(target)) => current = target.clone(),
                None => return Err(StorageError::RefNotFound(current)),
            }
        }
        Err(StorageError::InvalidRef(format!(
            "symbolic reference chain too deep: {}",
            name
        )))
    }

    /// Resolves HEAD to the commit it ultimately points at.
    pub fn resolve_head(&self) -> Result<ObjectId> {
        self.resolve("HEAD")
    }

    /// Returns the target of HEAD if it is symbolic.
    pub fn head_target(&self) -> Option<String> {
        match self.get("HEAD").ok()? {
            Reference::Symbolic(target) => Some(target),
            Reference::Direct(_) => None,
        }
    }

    /// Gets the current branch name (if HEAD is symbolic).
    pub fn current_branch(&self) -> Option<String> {
        self.head_target()
            .and_then(|target| target.strip_prefix("refs/heads/").map(str::to_string))
    }

    fn persist(&self, refs: &BTreeMap<String, Reference>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_vec_pretty(refs)
            .map_err(|e| StorageError::InvalidRef(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

/// Validates a reference name the way `git check-ref-format` does for
/// names pushed by clients.
pub fn check_ref_format(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(StorageError::InvalidRef(format!(
            "{}: {}",
            name, reason
        )))
    };

    if !name.starts_with("refs/") {
        return invalid("must start with refs/");
    }
    if name.ends_with('/') || name.ends_with('.') || name.ends_with(".lock") {
        return invalid("bad suffix");
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return invalid("forbidden sequence");
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return invalid("forbidden character");
    }
    if name.split('/').any(|part| part.is_empty() || part.starts_with('.')) {
        return invalid("bad path component");
    }
    Ok(())
}
