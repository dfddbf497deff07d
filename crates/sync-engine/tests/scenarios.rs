//! End-to-end tests for the sync engine.
//!
//! Drives whole passes against `InMemoryFs` vaults and a shared
//! `InMemoryRemote`, the way two devices would sync through one server.

use std::sync::Arc;

use sync_engine::{
    ActionKind, ActivityState, ContentHash, FileId, FileIndex, FileIndexEntry, FileSystem,
    InMemoryFs, InMemoryRemote, RemoteStore, SyncAction, SyncConfig, SyncEngine, VectorClock,
};

type Engine = SyncEngine<Arc<InMemoryFs>, Arc<InMemoryRemote>>;

// ============================================================================
// Helpers
// ============================================================================

/// Open an engine for `device` over `fs`, sharing `remote`.
async fn open(device: &str, fs: &Arc<InMemoryFs>, remote: &Arc<InMemoryRemote>) -> Engine {
    SyncEngine::open_with(
        Arc::clone(fs),
        Arc::clone(remote),
        SyncConfig::default(),
        device.parse().unwrap(),
    )
    .await
    .expect("Failed to open engine")
}

/// Persist an index as if an earlier pass had synced these files.
async fn seed_index(fs: &InMemoryFs, entries: &[(&str, FileId, VectorClock, &[u8])]) {
    let mut index = FileIndex::new();
    index.set_many(entries.iter().map(|(path, id, clock, content)| {
        (
            path.to_string(),
            FileIndexEntry::new(*id, clock.clone(), Some(ContentHash::of(content))),
        )
    }));
    index.save(fs).await.expect("Failed to seed index");
}

/// Sync and fold the report into the remote, like a server confirming it.
async fn sync_and_confirm(engine: &Engine) -> sync_engine::SyncReport {
    let report = engine.sync().await.expect("Sync pass failed");
    let rejected = engine.remote().apply_report(&report);
    assert!(rejected.is_empty(), "remote rejected uploads: {:?}", rejected);
    report
}

/// Sync until nothing is left to plan. Every pass must succeed.
async fn sync_until_settled(engine: &Engine) {
    for pass in 1..=5 {
        if engine.plan().await.unwrap().is_empty() {
            return;
        }
        let report = sync_and_confirm(engine).await;
        assert!(report.is_success(), "pass {} failed: {:?}", pass, report.errors);
    }
    panic!("vault did not settle within five passes");
}

/// Vault files outside `.sync/`, in path order.
async fn vault_files(fs: &InMemoryFs) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    for path in fs.file_paths() {
        if !path.starts_with(".sync/") {
            let content = fs.read(&path).await.unwrap();
            files.push((path, content));
        }
    }
    files
}

async fn remote_paths(remote: &InMemoryRemote) -> Vec<String> {
    let mut paths: Vec<String> = remote
        .list_files()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    paths.sort();
    paths
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_a_new_local_file_is_uploaded() {
    let fs = Arc::new(InMemoryFs::new());
    let remote = Arc::new(InMemoryRemote::new());
    fs.write("notes/a.md", b"# Note A\n\nbody").await.unwrap();
    let engine = open("D1", &fs, &remote).await;

    let plan = engine.plan().await.unwrap();
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].kind(), ActionKind::Upload);
    assert_eq!(plan.actions[0].path(), "notes/a.md");

    let report = sync_and_confirm(&engine).await;
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].title, "Note A");

    let index = engine.index_snapshot().await;
    let entry = index.get("notes/a.md").expect("index entry created");
    assert_eq!(entry.file_id, report.completed[0].file_id);
    assert_eq!(entry.vector_clock, VectorClock::from([("D1", 1)]));

    let detail = engine.status_detail();
    let uploads: Vec<_> = detail
        .recent
        .iter()
        .filter(|a| a.action == ActionKind::Upload && a.state == ActivityState::Completed)
        .collect();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "notes/a.md");
}

#[tokio::test]
async fn scenario_b_concurrent_edit_becomes_conflict_copy() {
    let fs = Arc::new(InMemoryFs::new());
    let remote = Arc::new(InMemoryRemote::new());
    let id = FileId::new();

    seed_index(&fs, &[("a.md", id, VectorClock::from([("D1", 1)]), b"base")]).await;
    fs.write("a.md", b"local edit").await.unwrap();
    remote.insert_with_id(
        id,
        "a.md",
        b"remote edit",
        VectorClock::from([("D1", 1), ("D2", 1)]),
    );

    let engine = open("D1", &fs, &remote).await;
    let plan = engine.plan().await.unwrap();
    assert_eq!(plan.actions.len(), 1);
    match &plan.actions[0] {
        SyncAction::Conflict {
            conflict_rename,
            local_vector_clock,
            ..
        } => {
            assert_eq!(conflict_rename, "a (conflict).md");
            assert_eq!(*local_vector_clock, VectorClock::from([("D1", 2)]));
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    let report = sync_and_confirm(&engine).await;
    assert_eq!(report.completed[0].action, ActionKind::Conflict);

    assert_eq!(fs.read("a.md").await.unwrap(), b"local edit");
    assert_eq!(fs.read("a (conflict).md").await.unwrap(), b"remote edit");

    let index = engine.index_snapshot().await;
    let canonical = index.get("a.md").unwrap();
    assert_eq!(canonical.file_id, id);
    assert_eq!(canonical.vector_clock, VectorClock::from([("D1", 2), ("D2", 1)]));

    // Exactly one new identity, distinct from the original
    let ids: Vec<FileId> = index.get_all().map(|(_, e)| e.file_id).collect();
    assert_eq!(ids.len(), 2);
    let copy_id = index.get("a (conflict).md").unwrap().file_id;
    assert_ne!(copy_id, id);

    // The canonical version on the remote is now the local one
    let on_remote = remote.file(&id).unwrap();
    assert_eq!(on_remote.content_hash, ContentHash::of(b"local edit"));

    // Next pass publishes the preserved copy
    let next = sync_and_confirm(&engine).await;
    assert_eq!(next.completed.len(), 1);
    assert_eq!(next.completed[0].path, "a (conflict).md");
    assert_eq!(next.completed[0].action, ActionKind::Upload);
    assert_eq!(remote.file(&copy_id).unwrap().path, "a (conflict).md");
}

#[tokio::test]
async fn scenario_c_local_delete_propagates() {
    let fs = Arc::new(InMemoryFs::new());
    let remote = Arc::new(InMemoryRemote::new());
    let id = FileId::new();
    let clock = VectorClock::from([("D1", 1)]);

    seed_index(&fs, &[("gone.md", id, clock.clone(), b"x")]).await;
    remote.insert_with_id(id, "gone.md", b"x", clock);

    let engine = open("D1", &fs, &remote).await;
    let plan = engine.plan().await.unwrap();
    assert_eq!(
        plan.actions,
        vec![SyncAction::Delete {
            file_id: id,
            path: "gone.md".into(),
        }]
    );

    let report = sync_and_confirm(&engine).await;
    assert_eq!(report.deleted, vec![id]);
    assert!(engine.index_snapshot().await.get("gone.md").is_none());
    assert!(remote.file(&id).is_none());
}

#[tokio::test]
async fn scenario_d_one_failure_does_not_sink_the_batch() {
    let fs = Arc::new(InMemoryFs::new());
    let remote = Arc::new(InMemoryRemote::new());

    let mut failing = None;
    for i in 0..5 {
        let desc = remote.insert_file(
            &format!("f{}.md", i),
            format!("file {}", i).as_bytes(),
            VectorClock::from([("D2", 1)]),
        );
        if i == 2 {
            remote.fail_transfers(desc.file_id);
            failing = Some(desc.file_id);
        }
    }

    let engine = open("D1", &fs, &remote).await;
    let report = engine.sync().await.unwrap();

    assert_eq!(report.completed.len(), 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(Some(report.errors[0].action.file_id()), failing);

    let index = engine.index_snapshot().await;
    assert_eq!(index.len(), 4);
    assert!(index.get("f2.md").is_none());
    assert!(!fs.exists("f2.md").await.unwrap());

    let detail = engine.status_detail();
    assert!(detail.error.is_some());
    assert_eq!(detail.failed().count(), 1);

    // The persisted index matches what the engine holds
    let persisted = FileIndex::load(fs.as_ref()).await.unwrap();
    assert_eq!(persisted.len(), 4);
}

// ============================================================================
// Cross-device properties
// ============================================================================

#[tokio::test]
async fn upload_then_download_preserves_content_hash() {
    let remote = Arc::new(InMemoryRemote::new());
    let laptop_fs = Arc::new(InMemoryFs::new());
    let phone_fs = Arc::new(InMemoryFs::new());

    let bytes = "---\ntitle: Shared\n---\nunicode: \u{2713}\n".as_bytes();
    laptop_fs.write("shared.md", bytes).await.unwrap();

    let laptop = open("laptop", &laptop_fs, &remote).await;
    let up = sync_and_confirm(&laptop).await;

    let phone = open("phone", &phone_fs, &remote).await;
    let down = sync_and_confirm(&phone).await;

    assert_eq!(up.completed[0].content_hash, down.completed[0].content_hash);
    assert_eq!(down.completed[0].title, "Shared");
    assert_eq!(phone_fs.read("shared.md").await.unwrap(), bytes);
    assert_eq!(
        phone.index_snapshot().await.get("shared.md").unwrap().file_id,
        up.completed[0].file_id
    );
}

#[tokio::test]
async fn identical_concurrent_edits_never_conflict() {
    let remote = Arc::new(InMemoryRemote::new());
    let id = FileId::new();
    let base = VectorClock::from([("D1", 1)]);

    let fs = Arc::new(InMemoryFs::new());
    seed_index(&fs, &[("a.md", id, base.clone(), b"v1")]).await;
    fs.write("a.md", b"same fix").await.unwrap();
    remote.insert_with_id(id, "a.md", b"same fix", VectorClock::from([("D1", 1), ("D2", 1)]));

    let engine = open("D1", &fs, &remote).await;
    let plan = engine.plan().await.unwrap();
    assert!(plan.actions.is_empty());
    assert_eq!(plan.clock_merges.len(), 1);

    let report = engine.sync().await.unwrap();
    assert!(report.completed.is_empty());
    assert!(report.errors.is_empty());

    let entry = engine.index_snapshot().await.get("a.md").cloned().unwrap();
    assert_eq!(entry.vector_clock, VectorClock::from([("D1", 1), ("D2", 1)]));

    // Converged: nothing left to do
    assert!(engine.plan().await.unwrap().is_empty());
}

#[tokio::test]
async fn two_devices_converge_after_conflict() {
    let remote = Arc::new(InMemoryRemote::new());
    let fs1 = Arc::new(InMemoryFs::new());
    let fs2 = Arc::new(InMemoryFs::new());

    fs1.write("todo.md", b"- milk").await.unwrap();
    let d1 = open("D1", &fs1, &remote).await;
    sync_and_confirm(&d1).await;

    let d2 = open("D2", &fs2, &remote).await;
    sync_and_confirm(&d2).await;

    // Both edit the same file before either syncs again
    fs1.write("todo.md", b"- milk\n- eggs").await.unwrap();
    fs2.write("todo.md", b"- milk\n- bread").await.unwrap();

    sync_and_confirm(&d2).await;
    let report = sync_and_confirm(&d1).await;
    assert_eq!(report.completed[0].action, ActionKind::Conflict);

    // D1 publishes the conflict copy, then D2 catches up
    sync_and_confirm(&d1).await;
    sync_and_confirm(&d2).await;

    for fs in [&fs1, &fs2] {
        assert_eq!(fs.read("todo.md").await.unwrap(), b"- milk\n- eggs");
        assert_eq!(
            fs.read("todo (conflict).md").await.unwrap(),
            b"- milk\n- bread"
        );
    }
    assert!(d1.plan().await.unwrap().is_empty());
    assert!(d2.plan().await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_edit_resurrects_locally_deleted_file() {
    let fs = Arc::new(InMemoryFs::new());
    let remote = Arc::new(InMemoryRemote::new());
    let id = FileId::new();

    seed_index(&fs, &[("keep.md", id, VectorClock::from([("D1", 1)]), b"v1")]).await;
    remote.insert_with_id(
        id,
        "keep.md",
        b"v2 from elsewhere",
        VectorClock::from([("D1", 1), ("D2", 1)]),
    );

    let engine = open("D1", &fs, &remote).await;
    let report = engine.sync().await.unwrap();

    assert_eq!(report.completed[0].action, ActionKind::Download);
    assert_eq!(fs.read("keep.md").await.unwrap(), b"v2 from elsewhere");
    assert!(report.deleted.is_empty());
}

#[tokio::test]
async fn local_edit_survives_remote_replacement_at_same_path() {
    let fs = Arc::new(InMemoryFs::new());
    let remote = Arc::new(InMemoryRemote::new());
    let old = FileId::new();

    // Another device deleted the file and created a new one under the same name
    seed_index(&fs, &[("a.md", old, VectorClock::from([("D1", 1)]), b"v1")]).await;
    fs.write("a.md", b"local edit").await.unwrap();
    remote.insert_file("a.md", b"replacement", VectorClock::from([("D2", 1)]));

    let engine = open("D1", &fs, &remote).await;
    let first = sync_and_confirm(&engine).await;
    assert!(first.is_success(), "errors: {:?}", first.errors);

    sync_until_settled(&engine).await;

    let files = vault_files(&fs).await;
    let mut contents: Vec<&[u8]> = files.iter().map(|(_, c)| c.as_slice()).collect();
    contents.sort();
    assert_eq!(contents, vec![&b"local edit"[..], &b"replacement"[..]]);

    let paths: Vec<String> = files.into_iter().map(|(p, _)| p).collect();
    assert_eq!(remote_paths(&remote).await, paths);
}

#[tokio::test]
async fn two_devices_creating_the_same_path_keep_both_files() {
    let remote = Arc::new(InMemoryRemote::new());
    let fs1 = Arc::new(InMemoryFs::new());
    let fs2 = Arc::new(InMemoryFs::new());
    fs1.write("a.md", b"from one").await.unwrap();
    fs2.write("a.md", b"from two").await.unwrap();

    let d1 = open("D1", &fs1, &remote).await;
    let d2 = open("D2", &fs2, &remote).await;

    // Both upload before either sees the other's file
    let r1 = d1.sync().await.unwrap();
    let r2 = d2.sync().await.unwrap();
    assert!(remote.apply_report(&r1).is_empty());
    assert!(remote.apply_report(&r2).is_empty());

    for _ in 0..3 {
        let report = sync_and_confirm(&d1).await;
        assert!(report.is_success(), "errors: {:?}", report.errors);
        let report = sync_and_confirm(&d2).await;
        assert!(report.is_success(), "errors: {:?}", report.errors);
    }
    assert!(d1.plan().await.unwrap().is_empty());
    assert!(d2.plan().await.unwrap().is_empty());

    let files = vault_files(&fs1).await;
    assert_eq!(files, vault_files(&fs2).await);
    let mut contents: Vec<&[u8]> = files.iter().map(|(_, c)| c.as_slice()).collect();
    contents.sort();
    assert_eq!(contents, vec![&b"from one"[..], &b"from two"[..]]);

    let paths: Vec<String> = files.into_iter().map(|(p, _)| p).collect();
    assert_eq!(remote_paths(&remote).await, paths);
}
