//! In-memory object store and repository management.

use crate::{GitObject, ObjectId, ObjectStore, RefStore, Reference, Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Number of independently locked shards in [`MemoryStore`].
const SHARD_COUNT: usize = 64;

type Shard = RwLock<HashMap<ObjectId, GitObject>>;

/// In-memory content-addressed object store.
///
/// Objects are spread over shards keyed by the first id byte, so writers of
/// different ids rarely contend and writers of the same id serialize on one
/// shard only.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Box<[Shard]>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new empty object store.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, id: &ObjectId) -> &Shard {
        &self.shards[id.as_bytes()[0] as usize % SHARD_COUNT]
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        let id = object.id;
        self.shard(&id).write().entry(id).or_insert(object);
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.shard(id)
            .read()
            .get(id)
            .cloned()
            .ok_or(StorageError::ObjectNotFound(*id))
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.shard(id).read().contains_key(id))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.shards.iter().map(|s| s.read().len()).sum())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().copied().collect::<Vec<_>>())
            .collect())
    }
}

/// A git repository: a reference table over the shared object namespace.
pub struct Repository {
    /// Repository name.
    pub name: String,
    /// Repository owner.
    pub owner: String,
    /// Shared object store.
    pub objects: Arc<dyn ObjectStore>,
    /// Reference store.
    pub refs: Arc<RefStore>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Creates an empty repository over the given object store.
    ///
    /// HEAD starts out symbolic to `refs/heads/main`.
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self::with_refs(owner, name, objects, RefStore::new())
    }

    /// Creates a repository with an existing reference store.
    pub fn with_refs(
        owner: impl Into<String>,
        name: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        refs: RefStore,
    ) -> Self {
        if refs.get("HEAD").is_err() {
            refs.set_symbolic("HEAD", "refs/heads/main");
        }
        Self {
            name: name.into(),
            owner: owner.into(),
            objects,
            refs: Arc::new(refs),
        }
    }

    /// Returns the `owner/name` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Gets the current HEAD commit.
    pub fn head(&self) -> Result<ObjectId> {
        self.refs.resolve_head()
    }

    /// Gets the current branch name.
    pub fn current_branch(&self) -> Option<String> {
        self.refs.current_branch()
    }

    /// Lists all references sorted by name.
    pub fn list_refs(&self) -> Vec<(String, Reference)> {
        self.refs.list_all()
    }
}

/// Registry of repositories sharing one object namespace.
pub struct RepoStore {
    objects: Arc<dyn ObjectStore>,
    refs_dir: Option<PathBuf>,
    repos: RwLock<HashMap<String, Arc<Repository>>>,
}

impl Default for RepoStore {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

impl RepoStore {
    /// Creates a registry whose repositories share `objects`.
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            refs_dir: None,
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// Persists every repository's references as `<dir>/<owner>/<name>.refs.json`.
    ///
    /// Repositories with a reference file already on disk are loaded.
    pub fn persistent(objects: Arc<dyn ObjectStore>, refs_dir: impl Into<PathBuf>) -> Result<Self> {
        let refs_dir = refs_dir.into();
        std::fs::create_dir_all(&refs_dir)?;

        let store = Self {
            objects,
            refs_dir: Some(refs_dir.clone()),
            repos: RwLock::new(HashMap::new()),
        };

        for owner_entry in std::fs::read_dir(&refs_dir)? {
            let owner_entry = owner_entry?;
            if !owner_entry.file_type()?.is_dir() {
                continue;
            }
            let owner = owner_entry.file_name().to_string_lossy().into_owned();
            for file in std::fs::read_dir(owner_entry.path())? {
                let path = file?.path();
                let Some(name) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(".refs.json"))
                else {
                    continue;
                };
                let refs = RefStore::open(&path)?;
                let repo = Repository::with_refs(&owner, name, store.objects.clone(), refs);
                store
                    .repos
                    .write()
                    .insert(format!("{}/{}", owner, name), Arc::new(repo));
            }
        }

        tracing::debug!(
            dir = %refs_dir.display(),
            repos = store.repos.read().len(),
            "Loaded persisted repositories"
        );
        Ok(store)
    }

    /// Returns the shared object store.
    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        self.objects.clone()
    }

    /// Creates a new repository.
    pub fn create(&self, owner: &str, name: &str) -> Result<Arc<Repository>> {
        validate_path_segment(owner)?;
        validate_path_segment(name)?;

        let mut repos = self.repos.write();
        let key = format!("{}/{}", owner, name);

        if repos.contains_key(&key) {
            return Err(StorageError::RepoExists(key));
        }

        let refs = match &self.refs_dir {
            Some(dir) => {
                let owner_dir = dir.join(owner);
                std::fs::create_dir_all(&owner_dir)?;
                RefStore::open(owner_dir.join(format!("{}.refs.json", name)))?
            }
            None => RefStore::new(),
        };

        let repo = Arc::new(Repository::with_refs(owner, name, self.objects.clone(), refs));
        repos.insert(key, repo.clone());
        tracing::info!(owner = %owner, name = %name, "Repository created");
        Ok(repo)
    }

    /// Gets a repository by owner and name.
    pub fn get(&self, owner: &str, name: &str) -> Result<Arc<Repository>> {
        let key = format!("{}/{}", owner, name);
        self.repos
            .read()
            .get(&key)
            .cloned()
            .ok_or(StorageError::RepoNotFound(key))
    }

    /// Gets a repository, creating it when absent.
    pub fn get_or_create(&self, owner: &str, name: &str) -> Result<Arc<Repository>> {
        match self.get(owner, name) {
            Ok(repo) => Ok(repo),
            Err(StorageError::RepoNotFound(_)) => match self.create(owner, name) {
                Err(StorageError::RepoExists(_)) => self.get(owner, name),
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    /// Lists all repositories sorted by key.
    pub fn list(&self) -> Vec<Arc<Repository>> {
        let mut repos: Vec<_> = self.repos.read().values().cloned().collect();
        repos.sort_by_key(|r| r.key());
        repos
    }
}

fn validate_path_segment(segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && segment.len() <= 100
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidRef(format!(
            "invalid repository path segment: {:?}",
            segment
        )))
    }
}
