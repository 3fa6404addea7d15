//! End-to-end transfer tests.
//!
//! These tests drive the fetch and push services the way a git client
//! would over smart HTTP:
//! 1. Alice pushes an initial commit into an empty repository
//! 2. Bob clones it, commits on top, and pushes
//! 3. Alice fetches and receives only Bob's new objects
//!
//! They also cover racing pushes and damaged packs against the
//! filesystem backend.

use std::io::{Cursor, Read};
use std::sync::{Arc, Barrier};
use std::thread;

use cairn_git::{
    advertise_refs, parse_report, receive_pack, upload_pack, write_push_request, Command,
    PackBuilder, PackParser, PktLineReader, PktLineWriter, PushCapabilities, PushReport, Service,
    TransferOptions,
};
use cairn_storage::{FsStore, GitObject, MemoryStore, ObjectId, ObjectStore, RepoStore, Repository};

const ALICE: &str = "Alice <alice@example.com> 1700000000 +0000";
const BOB: &str = "Bob <bob@example.com> 1700000100 +0000";

/// Creates a commit with a single README, returning its ID and objects.
fn make_commit(
    readme: &str,
    parents: &[ObjectId],
    author: &str,
    message: &str,
) -> (ObjectId, Vec<GitObject>) {
    let blob = GitObject::blob(readme.as_bytes().to_vec());
    let tree = GitObject::tree(&[("100644", "README.md", blob.id)]);
    let commit = GitObject::commit(&tree.id, parents, author, author, message);
    (commit.id, vec![commit, tree, blob])
}

/// Simulates `git push`, returning the report parsed from the response.
fn simulate_push(
    repo: &Repository,
    objects: &[GitObject],
    old_id: ObjectId,
    new_id: ObjectId,
    ref_name: &str,
) -> PushReport {
    let mut builder = PackBuilder::new().with_deltas(true);
    for obj in objects {
        builder.add(obj.clone());
    }
    let pack = builder.build().unwrap();

    let command = Command {
        old_id,
        new_id,
        ref_name: ref_name.to_string(),
        force: false,
    };
    let caps = PushCapabilities {
        report_status: true,
        ofs_delta: true,
        ..Default::default()
    };
    let mut request = Vec::new();
    write_push_request(&mut request, &[command], &caps, Some(&pack)).unwrap();

    let mut output = Vec::new();
    receive_pack(
        &mut Cursor::new(request),
        &mut output,
        repo,
        &TransferOptions::default(),
    )
    .unwrap();
    parse_report(&mut Cursor::new(output)).unwrap()
}

/// Simulates `git fetch`, writing the received objects into `local`.
fn simulate_fetch(
    repo: &Repository,
    wants: &[ObjectId],
    haves: &[ObjectId],
    local: &dyn ObjectStore,
) -> Vec<ObjectId> {
    let mut request = Vec::new();
    {
        let mut writer = PktLineWriter::new(&mut request);
        for (i, want) in wants.iter().enumerate() {
            if i == 0 {
                writer
                    .write_line(&format!("want {} side-band-64k ofs-delta agent=git/2.43", want))
                    .unwrap();
            } else {
                writer.write_line(&format!("want {}", want)).unwrap();
            }
        }
        writer.flush_pkt().unwrap();
        for have in haves {
            writer.write_line(&format!("have {}", have)).unwrap();
        }
        writer.write_line("done").unwrap();
    }

    let mut output = Vec::new();
    let report = upload_pack(&mut Cursor::new(request), &mut output, repo).unwrap();
    assert!(report.error.is_none(), "fetch refused: {:?}", report.error);

    let mut reader = PktLineReader::new(Cursor::new(output));
    let status = reader.read().unwrap().unwrap();
    let status = status.as_str().unwrap();
    assert!(status == "NAK" || status.starts_with("ACK "), "{}", status);

    let mut pack = Vec::new();
    for pkt in reader.read_until_flush().unwrap() {
        let data = pkt.data().unwrap();
        if data[0] == 1 {
            pack.extend_from_slice(&data[1..]);
        }
    }
    let mut decoded = PackParser::new(&pack).decode(local).unwrap();
    decoded.write_to(local).unwrap()
}

#[test]
fn test_two_clients_collaborate() {
    let repos = RepoStore::default();
    let repo = repos.create("alice", "demo").unwrap();

    // Alice pushes the first commit.
    let (c1, objects) = make_commit("# Demo\n", &[], ALICE, "Initial commit\n");
    let report = simulate_push(&repo, &objects, ObjectId::NULL, c1, "refs/heads/main");
    assert!(report.is_ok(), "{:?}", report);
    assert_eq!(repo.head().unwrap(), c1);

    // Bob clones.
    let bob_store = MemoryStore::new();
    let received = simulate_fetch(&repo, &[c1], &[], &bob_store);
    assert_eq!(received.len(), 3);
    assert!(bob_store.contains(&c1).unwrap());

    // Bob commits on top and pushes.
    let (c2, objects) = make_commit("# Demo\n\nBy Bob.\n", &[c1], BOB, "Credit Bob\n");
    bob_store.put_batch(objects.clone()).unwrap();
    let report = simulate_push(&repo, &objects, c1, c2, "refs/heads/main");
    assert!(report.is_ok(), "{:?}", report);
    assert_eq!(repo.head().unwrap(), c2);

    // Alice fetches with her commit as common ground.
    let alice_store = MemoryStore::new();
    alice_store
        .put_batch(make_commit("# Demo\n", &[], ALICE, "Initial commit\n").1)
        .unwrap();
    let received = simulate_fetch(&repo, &[c2], &[c1], &alice_store);
    assert_eq!(received.len(), 3);
    assert!(received.contains(&c2));
    assert!(alice_store.contains(&c2).unwrap());
}

#[test]
fn test_stale_push_is_rejected() {
    let repo = Repository::new("alice", "demo", Arc::new(MemoryStore::new()));
    let (c1, first) = make_commit("one", &[], ALICE, "one\n");
    assert!(simulate_push(&repo, &first, ObjectId::NULL, c1, "refs/heads/main").is_ok());

    // Bob still believes main is absent.
    let (c2, second) = make_commit("two", &[], BOB, "two\n");
    let report = simulate_push(&repo, &second, ObjectId::NULL, c2, "refs/heads/main");
    assert_eq!(report.statuses[0].rejection.as_deref(), Some("RefConflict"));
    assert_eq!(repo.head().unwrap(), c1);
}

#[test]
fn test_concurrent_pushes_single_winner() {
    let repo = Arc::new(Repository::new(
        "alice",
        "demo",
        Arc::new(MemoryStore::new()),
    ));
    let (base, objects) = make_commit("base", &[], ALICE, "base\n");
    assert!(simulate_push(&repo, &objects, ObjectId::NULL, base, "refs/heads/main").is_ok());

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let repo = Arc::clone(&repo);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let (id, objects) =
                    make_commit(&format!("change {}", i), &[base], BOB, "change\n");
                barrier.wait();
                (id, simulate_push(&repo, &objects, base, id, "refs/heads/main"))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(repo.head().unwrap(), winners[0].0);
    for (_, report) in results.iter().filter(|(_, r)| !r.is_ok()) {
        assert_eq!(report.statuses[0].rejection.as_deref(), Some("RefConflict"));
    }
}

#[test]
fn test_damaged_pack_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::open(dir.path().join("objects")).unwrap());
    let repo = Repository::new("alice", "demo", store.clone());

    let (c1, objects) = make_commit("payload", &[], ALICE, "one\n");
    let mut builder = PackBuilder::new();
    for obj in &objects {
        builder.add(obj.clone());
    }
    let pack = builder.build().unwrap();

    for damaged in [pack[..pack.len() - 7].to_vec(), {
        let mut p = pack.clone();
        p[20] ^= 0xff;
        p
    }] {
        let command = Command {
            old_id: ObjectId::NULL,
            new_id: c1,
            ref_name: "refs/heads/main".to_string(),
            force: false,
        };
        let caps = PushCapabilities {
            report_status: true,
            ..Default::default()
        };
        let mut request = Vec::new();
        write_push_request(&mut request, &[command], &caps, Some(&damaged)).unwrap();
        let mut output = Vec::new();
        let report = receive_pack(
            &mut Cursor::new(request),
            &mut output,
            &repo,
            &TransferOptions::default(),
        )
        .unwrap();

        assert!(report.unpack_error.is_some());
        assert_eq!(store.len().unwrap(), 0);
        assert!(repo.refs.read("refs/heads/main").is_none());
    }
}

#[test]
fn test_advertisement_after_push() {
    let repo = Repository::new("alice", "demo", Arc::new(MemoryStore::new()));
    let (c1, objects) = make_commit("one", &[], ALICE, "one\n");
    assert!(simulate_push(&repo, &objects, ObjectId::NULL, c1, "refs/heads/main").is_ok());

    let mut output = Vec::new();
    advertise_refs(&mut output, &repo, Service::UploadPack).unwrap();
    let mut text = String::new();
    Cursor::new(output).read_to_string(&mut text).unwrap();
    assert!(text.contains(&format!("{} HEAD\0", c1)));
    assert!(text.contains(&format!("{} refs/heads/main\n", c1)));
}
