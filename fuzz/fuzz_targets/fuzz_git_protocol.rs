//! Fuzz target for the fetch and push handlers.
//!
//! Arbitrary request bodies are fed to upload-pack and receive-pack against
//! a one-commit repository. Handlers may refuse, but must not panic or move
//! the branch unless a valid push produced it.

#![no_main]

use cairn_git::{receive_pack, upload_pack, TransferOptions};
use cairn_storage::{GitObject, MemoryStore, ObjectStore, Repository};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;
use std::sync::Arc;

const SIG: &str = "Fuzz <fuzz@example.com> 0 +0000";

fn repository() -> (Repository, cairn_storage::ObjectId) {
    let repo = Repository::new("fuzz", "target", Arc::new(MemoryStore::new()));
    let blob = GitObject::blob(b"seed".to_vec());
    let tree = GitObject::tree(&[("100644", "seed", blob.id)]);
    let commit = GitObject::commit(&tree.id, &[], SIG, SIG, "seed\n");
    let id = commit.id;
    let _ = repo.objects.put_batch(vec![blob, tree, commit]);
    let _ = repo.refs.compare_and_swap("refs/heads/main", None, Some(id));
    (repo, id)
}

fuzz_target!(|data: &[u8]| {
    let (repo, head) = repository();

    let mut output = Vec::new();
    let _ = upload_pack(&mut Cursor::new(data), &mut output, &repo);
    assert_eq!(repo.head().ok(), Some(head));

    let mut output = Vec::new();
    if let Ok(report) = receive_pack(
        &mut Cursor::new(data),
        &mut output,
        &repo,
        &TransferOptions::default(),
    ) {
        if report.updates.is_empty() {
            assert_eq!(repo.head().ok(), Some(head));
        }
    }
});
