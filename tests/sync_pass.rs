//! End-to-end sync pass scenarios: insert round-trips, conflict
//! resolution, and the no-op update guard.

mod fixtures;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bson::{doc, Bson};
use tether::core::with_version;
use tether::store::LocalCollection;
use tether::test_harness::SyncHarness;
use tether::{DocumentVersion, Namespace, DOCUMENT_VERSION_FIELD};

use fixtures::wait_until;

fn settled_insert(harness: &SyncHarness, namespace: &Namespace) {
    harness
        .sync
        .insert_one(namespace, &doc! { "_id": 1, "x": "a" })
        .expect("insert");
    assert!(harness.sync.do_sync_pass());
    assert!(harness.sync.do_sync_pass());
}

#[test]
fn clean_insert_round_trip() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    settled_insert(&harness, &ns);

    let remote = harness
        .remote_coll(&ns)
        .document(&Bson::Int32(1))
        .expect("remote document");
    assert_eq!(remote.get_str("x").expect("x"), "a");
    let version = remote
        .get_document(DOCUMENT_VERSION_FIELD)
        .expect("remote version");
    assert_eq!(version.get_i32("spv").expect("spv"), 1);
    assert_eq!(version.get_i64("v").expect("v"), 0);
    assert!(!version.get_str("id").expect("id").is_empty());

    let local = harness
        .local_coll(&ns)
        .find_one(&doc! { "_id": 1 })
        .expect("find")
        .expect("local document");
    assert_eq!(local, doc! { "_id": 1, "x": "a" });

    let row = harness
        .docs_coll()
        .find_one(&doc! { "document_id": 1 })
        .expect("find")
        .expect("config row");
    let state = row.get_document("state").expect("state");
    assert_eq!(state.get("last_uncommitted_change_event"), Some(&Bson::Null));
}

#[test]
fn conflicting_update_resolved_remote_wins() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    settled_insert(&harness, &ns);

    // Concurrent writers: a local update races a remote replace from
    // another instance.
    harness
        .sync
        .update_one(&ns, &doc! { "_id": 1 }, &doc! { "$set": { "x": "local" } }, false)
        .expect("update");
    let remote_version = DocumentVersion {
        sync_protocol_version: 1,
        instance_id: "H".into(),
        version_counter: 0,
    };
    harness
        .remote_coll(&ns)
        .seed(with_version(&doc! { "_id": 1, "x": "remote" }, &remote_version));

    assert!(harness.sync.do_sync_pass());

    let local = harness
        .local_coll(&ns)
        .find_one(&doc! { "_id": 1 })
        .expect("find")
        .expect("local document");
    assert_eq!(local, doc! { "_id": 1, "x": "remote" });

    let remote = harness
        .remote_coll(&ns)
        .document(&Bson::Int32(1))
        .expect("remote document");
    assert_eq!(remote.get_str("x").expect("x"), "remote");

    let row = harness
        .docs_coll()
        .find_one(&doc! { "document_id": 1 })
        .expect("find")
        .expect("config row");
    let state = row.get_document("state").expect("state");
    assert_eq!(state.get("last_uncommitted_change_event"), Some(&Bson::Null));
    let acked = state
        .get_document("last_known_remote_version")
        .expect("acked version");
    assert_eq!(acked.get_str("id").expect("id"), "H");
    assert_eq!(acked.get_i64("v").expect("v"), 0);
}

#[test]
fn empty_update_is_dropped_without_a_remote_call() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    settled_insert(&harness, &ns);

    let remote = harness.remote_coll(&ns);
    let inserts = remote.insert_calls.load(Ordering::SeqCst);
    let updates = remote.update_calls.load(Ordering::SeqCst);
    let deletes = remote.delete_calls.load(Ordering::SeqCst);

    // Setting x to its current value diffs to nothing.
    harness
        .sync
        .update_one(&ns, &doc! { "_id": 1 }, &doc! { "$set": { "x": "a" } }, false)
        .expect("update");
    assert!(harness.sync.do_sync_pass());

    assert_eq!(remote.insert_calls.load(Ordering::SeqCst), inserts);
    assert_eq!(remote.update_calls.load(Ordering::SeqCst), updates);
    assert_eq!(remote.delete_calls.load(Ordering::SeqCst), deletes);

    let version = remote
        .document(&Bson::Int32(1))
        .expect("remote document")
        .get_document(DOCUMENT_VERSION_FIELD)
        .cloned()
        .expect("remote version");
    assert_eq!(version.get_i64("v").expect("v"), 0);
}

#[test]
fn update_pushes_a_translated_update_with_a_bumped_version() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    settled_insert(&harness, &ns);

    let before = harness
        .remote_coll(&ns)
        .document(&Bson::Int32(1))
        .expect("remote document");
    let writer = before
        .get_document(DOCUMENT_VERSION_FIELD)
        .expect("version")
        .get_str("id")
        .expect("id")
        .to_string();

    harness
        .sync
        .update_one(&ns, &doc! { "_id": 1 }, &doc! { "$set": { "x": "b" } }, false)
        .expect("update");
    assert!(harness.sync.do_sync_pass());

    let after = harness
        .remote_coll(&ns)
        .document(&Bson::Int32(1))
        .expect("remote document");
    assert_eq!(after.get_str("x").expect("x"), "b");
    let version = after.get_document(DOCUMENT_VERSION_FIELD).expect("version");
    assert_eq!(version.get_str("id").expect("id"), writer);
    assert_eq!(version.get_i64("v").expect("v"), 1);

    // Committed cleanly: nothing pending, local matches remote sans version.
    let local = harness
        .local_coll(&ns)
        .find_one(&doc! { "_id": 1 })
        .expect("find")
        .expect("local document");
    assert_eq!(local, doc! { "_id": 1, "x": "b" });
}

#[test]
fn passes_do_not_run_while_disconnected_or_logged_out() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness
        .sync
        .insert_one(&ns, &doc! { "_id": 1, "x": "a" })
        .expect("insert");

    harness.network.set_connected(false);
    assert!(!harness.sync.do_sync_pass());
    assert!(harness.remote_coll(&ns).document(&Bson::Int32(1)).is_none());

    harness.network.set_connected(true);
    harness.auth.set_logged_in(false);
    assert!(!harness.sync.do_sync_pass());
    assert!(harness.remote_coll(&ns).document(&Bson::Int32(1)).is_none());

    harness.auth.set_logged_in(true);
    assert!(harness.sync.do_sync_pass());
    assert!(wait_until(Duration::from_secs(1), || {
        harness.remote_coll(&ns).document(&Bson::Int32(1)).is_some()
    }));
}

#[test]
fn local_wins_resolution_keeps_pushing_the_local_state() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_local_wins(&ns);
    settled_insert(&harness, &ns);

    harness
        .sync
        .update_one(&ns, &doc! { "_id": 1 }, &doc! { "$set": { "x": "local" } }, false)
        .expect("update");
    let remote_version = DocumentVersion {
        sync_protocol_version: 1,
        instance_id: "H".into(),
        version_counter: 0,
    };
    harness
        .remote_coll(&ns)
        .seed(with_version(&doc! { "_id": 1, "x": "remote" }, &remote_version));

    // First pass resolves the conflict locally; the follow-up pass commits
    // the resolution against the acknowledged remote version.
    assert!(harness.sync.do_sync_pass());
    assert!(harness.sync.do_sync_pass());

    let remote = harness
        .remote_coll(&ns)
        .document(&Bson::Int32(1))
        .expect("remote document");
    assert_eq!(remote.get_str("x").expect("x"), "local");
    let local = harness
        .local_coll(&ns)
        .find_one(&doc! { "_id": 1 })
        .expect("find")
        .expect("local document");
    assert_eq!(local, doc! { "_id": 1, "x": "local" });
}
