//! Credential store merge-protocol tests

use plclink_core::core::psk::{ImportOutcome, MergeDecision, PskStore};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Byte-level snapshot of a store's psk directory
fn snapshot(project: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    let dir = project.join("psk");
    if !dir.is_dir() {
        return files;
    }
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        files.insert(
            entry.file_name().to_string_lossy().into_owned(),
            fs::read(entry.path()).unwrap(),
        );
    }
    files
}

/// A store with two identities and an archive exported from another
/// store that shares one of the IDs
fn stores_with_conflict() -> (tempfile::TempDir, tempfile::TempDir, std::path::PathBuf) {
    let local_dir = tempdir().unwrap();
    let local = PskStore::new(local_dir.path());
    local.upsert("shared", "local-secret", "tcp://10.0.0.1:61131").unwrap();
    local.upsert("local-only", "keep-me", "tcp://10.0.0.2:61131").unwrap();

    let remote_dir = tempdir().unwrap();
    let remote = PskStore::new(remote_dir.path());
    remote.upsert("shared", "remote-secret", "tcp://10.1.1.1:61131").unwrap();
    remote.upsert("remote-only", "new-secret", "tcp://10.1.1.2:61131").unwrap();

    let archive = remote_dir.path().join("bundle.zip");
    remote
        .export(&["shared".to_string(), "remote-only".to_string()], &archive)
        .unwrap();

    (local_dir, remote_dir, archive)
}

#[test]
fn cancel_leaves_store_byte_identical() {
    let (local_dir, _remote_dir, archive) = stores_with_conflict();
    let store = PskStore::new(local_dir.path());
    let before = snapshot(local_dir.path());

    let outcome = store
        .import(&archive, &mut |_existing, _imported| MergeDecision::Cancel)
        .unwrap();
    assert!(matches!(outcome, ImportOutcome::Cancelled));

    assert_eq!(snapshot(local_dir.path()), before);
    let records = store.load().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(store.secret("shared").unwrap(), "local-secret");
}

#[test]
fn replace_all_is_sticky_and_skips_the_resolver() {
    let local_dir = tempdir().unwrap();
    let local = PskStore::new(local_dir.path());
    local.upsert("a", "old-a", "tcp://old:1").unwrap();
    local.upsert("b", "old-b", "tcp://old:2").unwrap();
    local.upsert("c", "old-c", "tcp://old:3").unwrap();

    let remote_dir = tempdir().unwrap();
    let remote = PskStore::new(remote_dir.path());
    remote.upsert("a", "new-a", "tcp://new:1").unwrap();
    remote.upsert("b", "new-b", "tcp://new:2").unwrap();
    remote.upsert("c", "new-c", "tcp://new:3").unwrap();
    let archive = remote_dir.path().join("bundle.zip");
    remote
        .export(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            &archive,
        )
        .unwrap();

    let mut resolver_calls = 0;
    let outcome = local
        .import(&archive, &mut |_existing, _imported| {
            resolver_calls += 1;
            MergeDecision::ReplaceAll
        })
        .unwrap();

    assert_eq!(resolver_calls, 1, "ReplaceAll must be reused, not re-asked");
    assert!(matches!(outcome, ImportOutcome::Applied(_)));
    for id in ["a", "b", "c"] {
        assert_eq!(local.secret(id).unwrap(), format!("new-{id}"));
    }
}

#[test]
fn keep_all_is_sticky_and_preserves_local_state() {
    let (local_dir, _remote_dir, archive) = stores_with_conflict();
    let store = PskStore::new(local_dir.path());

    let mut resolver_calls = 0;
    let outcome = store
        .import(&archive, &mut |_existing, _imported| {
            resolver_calls += 1;
            MergeDecision::KeepAll
        })
        .unwrap();

    assert_eq!(resolver_calls, 1);
    assert!(matches!(outcome, ImportOutcome::Applied(_)));
    // conflicting ID untouched, new ID still added
    assert_eq!(store.secret("shared").unwrap(), "local-secret");
    assert_eq!(store.secret("remote-only").unwrap(), "new-secret");
}

#[test]
fn new_ids_are_added_with_their_secrets() {
    let (local_dir, _remote_dir, archive) = stores_with_conflict();
    let store = PskStore::new(local_dir.path());

    let outcome = store
        .import(&archive, &mut |_existing, _imported| MergeDecision::Keep)
        .unwrap();
    let ImportOutcome::Applied(records) = outcome else {
        panic!("import was cancelled");
    };

    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert!(ids.contains(&"remote-only"));
    // the new ID survives a reload: its secret file was extracted
    let reloaded = store.load().unwrap();
    assert!(reloaded.iter().any(|r| r.id == "remote-only"));
    assert_eq!(store.secret("remote-only").unwrap(), "new-secret");
}

#[test]
fn replace_takes_imported_metadata() {
    let (local_dir, _remote_dir, archive) = stores_with_conflict();
    let store = PskStore::new(local_dir.path());

    store
        .import(&archive, &mut |_existing, _imported| MergeDecision::Replace)
        .unwrap();

    let records = store.load().unwrap();
    let shared = records.iter().find(|r| r.id == "shared").unwrap();
    assert_eq!(shared.last_uri.as_deref(), Some("tcp://10.1.1.1:61131"));
    assert_eq!(store.secret("shared").unwrap(), "remote-secret");
    // untouched local identity is still there
    assert_eq!(store.secret("local-only").unwrap(), "keep-me");
}

#[test]
fn export_bundles_only_selected_secrets() {
    let local_dir = tempdir().unwrap();
    let store = PskStore::new(local_dir.path());
    store.upsert("wanted", "s1", "tcp://a:1").unwrap();
    store.upsert("unwanted", "s2", "tcp://b:2").unwrap();

    let archive = local_dir.path().join("partial.zip");
    store.export(&["wanted".to_string()], &archive).unwrap();

    let file = fs::File::open(&archive).unwrap();
    let zip = zip::ZipArchive::new(file).unwrap();
    let names: Vec<&str> = zip.file_names().collect();
    assert!(names.contains(&"management.json"));
    assert!(names.contains(&"wanted.secret"));
    assert!(!names.contains(&"unwanted.secret"));
}

#[test]
fn import_into_empty_store() {
    let (_local_dir, _remote_dir, archive) = stores_with_conflict();

    let fresh_dir = tempdir().unwrap();
    let fresh = PskStore::new(fresh_dir.path());
    let outcome = fresh
        .import(&archive, &mut |_existing, _imported| {
            panic!("no conflicts possible in an empty store")
        })
        .unwrap();

    let ImportOutcome::Applied(records) = outcome else {
        panic!("import was cancelled");
    };
    assert_eq!(records.len(), 2);
    assert_eq!(fresh.secret("shared").unwrap(), "remote-secret");
    assert_eq!(fresh.secret("remote-only").unwrap(), "new-secret");
}
