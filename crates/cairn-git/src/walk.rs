//! Object graph traversal.
//!
//! Edges are read straight out of object content: commit `tree`/`parent`
//! headers, tag `object` headers and binary tree entries. Submodule entries
//! (mode `160000`) point into another repository and are never followed.

use crate::{GitError, Result};
use cairn_storage::{GitObject, ObjectId, ObjectStore, ObjectType, StorageError, OBJECT_ID_LEN};
use std::collections::{HashSet, VecDeque};

const GITLINK_MODE: &[u8] = b"160000";

fn invalid(id: &ObjectId, msg: &str) -> GitError {
    GitError::Storage(StorageError::InvalidObject(format!("{}: {}", id, msg)))
}

/// A single entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Octal file mode, e.g. `100644`.
    pub mode: String,
    /// Entry name.
    pub name: String,
    /// Object id of the entry.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Returns true for submodule links.
    pub fn is_gitlink(&self) -> bool {
        self.mode.as_bytes() == GITLINK_MODE
    }
}

/// Header fields of a commit that link it into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLinks {
    /// Root tree.
    pub tree: ObjectId,
    /// Parent commits in order.
    pub parents: Vec<ObjectId>,
}

fn header_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n').take_while(|line| !line.is_empty())
}

fn header_id(object: &GitObject, value: &[u8]) -> Result<ObjectId> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|hex| ObjectId::from_hex(hex).ok())
        .ok_or_else(|| invalid(&object.id, "malformed object id in header"))
}

/// Parses the `tree` and `parent` headers of a commit.
pub fn parse_commit(object: &GitObject) -> Result<CommitLinks> {
    let mut tree = None;
    let mut parents = Vec::new();
    for line in header_lines(&object.data) {
        if let Some(value) = line.strip_prefix(b"tree ") {
            tree = Some(header_id(object, value)?);
        } else if let Some(value) = line.strip_prefix(b"parent ") {
            parents.push(header_id(object, value)?);
        }
    }
    let tree = tree.ok_or_else(|| invalid(&object.id, "commit without tree"))?;
    Ok(CommitLinks { tree, parents })
}

/// Parses the target of an annotated tag.
pub fn parse_tag(object: &GitObject) -> Result<(ObjectId, ObjectType)> {
    let mut target = None;
    let mut kind = None;
    for line in header_lines(&object.data) {
        if let Some(value) = line.strip_prefix(b"object ") {
            target = Some(header_id(object, value)?);
        } else if let Some(value) = line.strip_prefix(b"type ") {
            let name = std::str::from_utf8(value).unwrap_or_default();
            kind = Some(ObjectType::parse(name)?);
        }
    }
    match (target, kind) {
        (Some(target), Some(kind)) => Ok((target, kind)),
        _ => Err(invalid(&object.id, "tag without object or type")),
    }
}

/// Parses the binary entries of a tree.
pub fn parse_tree(object: &GitObject) -> Result<Vec<TreeEntry>> {
    let data = &object.data[..];
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let space = data[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| invalid(&object.id, "tree entry without mode"))?;
        let mode = &data[pos..pos + space];
        pos += space + 1;

        let nul = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| invalid(&object.id, "tree entry without name"))?;
        let name = &data[pos..pos + nul];
        pos += nul + 1;

        let id_bytes = data
            .get(pos..pos + OBJECT_ID_LEN)
            .ok_or_else(|| invalid(&object.id, "truncated tree entry"))?;
        pos += OBJECT_ID_LEN;

        entries.push(TreeEntry {
            mode: String::from_utf8_lossy(mode).into_owned(),
            name: String::from_utf8_lossy(name).into_owned(),
            id: ObjectId::from_slice(id_bytes)?,
        });
    }
    Ok(entries)
}

/// Returns the ids an object points at.
pub fn links(object: &GitObject) -> Result<Vec<ObjectId>> {
    match object.object_type {
        ObjectType::Commit => {
            let commit = parse_commit(object)?;
            let mut out = Vec::with_capacity(commit.parents.len() + 1);
            out.push(commit.tree);
            out.extend(commit.parents);
            Ok(out)
        }
        ObjectType::Tag => Ok(vec![parse_tag(object)?.0]),
        ObjectType::Tree => Ok(parse_tree(object)?
            .into_iter()
            .filter(|entry| !entry.is_gitlink())
            .map(|entry| entry.id)
            .collect()),
        ObjectType::Blob => Ok(Vec::new()),
    }
}

fn fetch(store: &dyn ObjectStore, id: &ObjectId) -> Result<Option<GitObject>> {
    match store.get(id) {
        Ok(object) => Ok(Some(object)),
        Err(StorageError::ObjectNotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Walks the graph from `roots`, never entering `stop`.
///
/// With `strict`, a missing object fails the walk; otherwise it is skipped.
fn walk(
    store: &dyn ObjectStore,
    roots: impl IntoIterator<Item = ObjectId>,
    stop: &HashSet<ObjectId>,
    strict: bool,
) -> Result<Vec<(ObjectId, ObjectType)>> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: VecDeque<ObjectId> = VecDeque::new();
    let mut out = Vec::new();

    for root in roots {
        if !stop.contains(&root) && seen.insert(root) {
            queue.push_back(root);
        }
    }

    while let Some(id) = queue.pop_front() {
        let Some(object) = fetch(store, &id)? else {
            if strict {
                return Err(GitError::UnknownObject(id));
            }
            continue;
        };
        for next in links(&object)? {
            if !stop.contains(&next) && seen.insert(next) {
                queue.push_back(next);
            }
        }
        out.push((id, object.object_type));
    }
    Ok(out)
}

/// Returns every object reachable from `roots`, roots included.
pub fn reachable(
    store: &dyn ObjectStore,
    roots: impl IntoIterator<Item = ObjectId>,
) -> Result<HashSet<ObjectId>> {
    Ok(walk(store, roots, &HashSet::new(), true)?
        .into_iter()
        .map(|(id, _)| id)
        .collect())
}

fn type_rank(object_type: ObjectType) -> u8 {
    match object_type {
        ObjectType::Commit => 0,
        ObjectType::Tag => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
    }
}

/// Objects reachable from `wants` but not from `haves`.
///
/// Haves the store does not know are ignored. The result is ordered
/// commits, tags, trees, blobs; within a type it follows walk order.
pub fn missing_closure(
    store: &dyn ObjectStore,
    wants: &[ObjectId],
    haves: &[ObjectId],
) -> Result<Vec<ObjectId>> {
    let have_closure: HashSet<ObjectId> = walk(store, haves.iter().copied(), &HashSet::new(), false)?
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    let mut objects = walk(store, wants.iter().copied(), &have_closure, true)?;
    objects.sort_by_key(|(_, object_type)| type_rank(*object_type));
    Ok(objects.into_iter().map(|(id, _)| id).collect())
}

/// Verifies that every object reachable from `tip` is present and parses.
///
/// The closure of `known` tips is taken as complete; the walk stops there.
/// Fails with [`GitError::UnknownObject`] on the first hole.
pub fn check_connected(store: &dyn ObjectStore, tip: &ObjectId, known: &[ObjectId]) -> Result<()> {
    let known_closure: HashSet<ObjectId> = walk(store, known.iter().copied(), &HashSet::new(), false)?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    walk(store, [*tip], &known_closure, true).map(|_| ())
}

/// Returns true if `ancestor` is reachable from `descendant` via parents.
///
/// A commit is its own ancestor.
pub fn is_ancestor(
    store: &dyn ObjectStore,
    ancestor: &ObjectId,
    descendant: &ObjectId,
) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*descendant]);

    while let Some(id) = queue.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        let object = fetch(store, &id)?.ok_or(GitError::UnknownObject(id))?;
        if object.object_type != ObjectType::Commit {
            continue;
        }
        queue.extend(parse_commit(&object)?.parents);
    }
    Ok(false)
}
