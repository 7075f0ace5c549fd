//! CRUD staging semantics: coalescence, desync, pausing and resuming.

mod fixtures;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bson::{doc, Bson};
use tether::store::LocalCollection;
use tether::test_harness::{RemoteOp, SyncHarness};
use tether::{Namespace, RemoteError};

use fixtures::wait_until;

#[test]
fn insert_then_delete_coalesces_to_nothing() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness.network.set_connected(false);

    harness
        .sync
        .insert_one(&ns, &doc! { "_id": 2 })
        .expect("insert");
    let deleted = harness
        .sync
        .delete_one(&ns, &doc! { "_id": 2 })
        .expect("delete");
    assert_eq!(deleted.deleted_count, 1);

    assert!(harness.sync.get_synchronized_document_ids(&ns).is_empty());
    assert!(harness.local_coll(&ns).is_empty());
    assert!(harness.undo_coll(&ns).is_empty());
    assert!(harness.docs_coll().is_empty());

    harness.network.set_connected(true);
    assert!(harness.sync.do_sync_pass());
    let remote = harness.remote_coll(&ns);
    assert_eq!(remote.insert_calls.load(Ordering::SeqCst), 0);
    assert_eq!(remote.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(remote.delete_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn delete_stages_a_pending_delete_and_desyncs_on_commit() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness
        .sync
        .insert_one(&ns, &doc! { "_id": 1, "x": "a" })
        .expect("insert");
    assert!(harness.sync.do_sync_pass());

    harness
        .sync
        .delete_one(&ns, &doc! { "_id": 1 })
        .expect("delete");
    assert!(harness.local_coll(&ns).is_empty());
    // The delete is pending, not yet pushed.
    assert!(harness.remote_coll(&ns).document(&Bson::Int32(1)).is_some());

    assert!(harness.sync.do_sync_pass());
    assert!(harness.remote_coll(&ns).document(&Bson::Int32(1)).is_none());
    assert!(harness.sync.get_synchronized_document_ids(&ns).is_empty());
}

#[test]
fn unsynchronized_documents_are_not_deleted() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    // Present locally but tracked by no config.
    harness
        .local_coll(&ns)
        .insert_one(&doc! { "_id": 9, "x": 1 })
        .expect("seed");

    let deleted = harness
        .sync
        .delete_one(&ns, &doc! { "_id": 9 })
        .expect("delete");
    assert_eq!(deleted.deleted_count, 0);
    assert_eq!(harness.local_coll(&ns).len(), 1);
}

#[test]
fn a_failing_remote_write_pauses_the_document() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness
        .sync
        .insert_one(&ns, &doc! { "_id": 1, "x": "a" })
        .expect("insert");
    assert!(harness.sync.do_sync_pass());

    harness
        .sync
        .update_one(&ns, &doc! { "_id": 1 }, &doc! { "$set": { "x": "b" } }, false)
        .expect("update");
    harness.remote_coll(&ns).fail_next(
        RemoteOp::Update,
        RemoteError::Service {
            code: tether::remote::RemoteErrorCode::Unknown,
            message: "boom".into(),
        },
    );
    assert!(harness.sync.do_sync_pass());

    assert_eq!(
        harness.sync.get_paused_document_ids(&ns),
        vec![Bson::Int32(1)]
    );
    assert!(wait_until(Duration::from_secs(1), || !harness
        .errors
        .is_empty()));

    // A paused document is skipped by the pass until something changes it.
    assert!(harness.sync.do_sync_pass());
    assert_eq!(
        harness
            .remote_coll(&ns)
            .document(&Bson::Int32(1))
            .expect("remote document")
            .get_str("x")
            .expect("x"),
        "a"
    );

    // A local write resumes it.
    harness
        .sync
        .update_one(&ns, &doc! { "_id": 1 }, &doc! { "$set": { "x": "c" } }, false)
        .expect("update");
    assert!(harness.sync.get_paused_document_ids(&ns).is_empty());
    assert!(harness.sync.do_sync_pass());
    assert_eq!(
        harness
            .remote_coll(&ns)
            .document(&Bson::Int32(1))
            .expect("remote document")
            .get_str("x")
            .expect("x"),
        "c"
    );
}

#[test]
fn resume_sync_for_document_unfreezes_without_a_write() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness
        .sync
        .insert_one(&ns, &doc! { "_id": 1, "x": "a" })
        .expect("insert");
    harness.remote_coll(&ns).fail_next(
        RemoteOp::Insert,
        RemoteError::Service {
            code: tether::remote::RemoteErrorCode::Unknown,
            message: "boom".into(),
        },
    );
    assert!(harness.sync.do_sync_pass());
    assert_eq!(
        harness.sync.get_paused_document_ids(&ns),
        vec![Bson::Int32(1)]
    );

    assert!(harness.sync.resume_sync_for_document(&ns, &Bson::Int32(1)));
    assert!(harness.sync.get_paused_document_ids(&ns).is_empty());
    assert!(harness.sync.do_sync_pass());
    assert!(harness.remote_coll(&ns).document(&Bson::Int32(1)).is_some());
}

#[test]
fn desync_forgets_the_config_but_keeps_the_local_copy() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness
        .sync
        .insert_one(&ns, &doc! { "_id": 1, "x": "a" })
        .expect("insert");
    assert!(harness.sync.do_sync_pass());

    harness
        .sync
        .desync_document_ids(&ns, &[Bson::Int32(1)])
        .expect("desync");
    assert!(harness.sync.get_synchronized_document_ids(&ns).is_empty());
    assert_eq!(harness.local_coll(&ns).len(), 1);
    assert!(harness.docs_coll().is_empty());
}

#[test]
fn update_many_stages_only_modified_documents() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);
    harness
        .sync
        .insert_many(
            &ns,
            &[doc! { "_id": 1, "x": "a" }, doc! { "_id": 2, "x": "b" }],
        )
        .expect("insert");
    assert!(harness.sync.do_sync_pass());

    // Both match, but only _id 1 actually changes.
    let result = harness
        .sync
        .update_many(&ns, &doc! {}, &doc! { "$set": { "x": "b" } }, false)
        .expect("update many");
    assert_eq!(result.matched_count, 2);

    assert!(harness.sync.do_sync_pass());
    let remote = harness.remote_coll(&ns);
    let one = remote.document(&Bson::Int32(1)).expect("one");
    let two = remote.document(&Bson::Int32(2)).expect("two");
    assert_eq!(one.get_str("x").expect("x"), "b");
    assert_eq!(two.get_str("x").expect("x"), "b");
    let version_one = one
        .get_document(tether::DOCUMENT_VERSION_FIELD)
        .expect("version");
    assert_eq!(version_one.get_i64("v").expect("v"), 1);
    // The document the update did not modify keeps its version.
    let version_two = two
        .get_document(tether::DOCUMENT_VERSION_FIELD)
        .expect("version");
    assert_eq!(version_two.get_i64("v").expect("v"), 0);
}

#[test]
fn sync_document_ids_pulls_the_remote_copy_down() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);

    let version = tether::DocumentVersion {
        sync_protocol_version: 1,
        instance_id: "W".into(),
        version_counter: 3,
    };
    harness.remote_coll(&ns).seed(tether::core::with_version(
        &doc! { "_id": 7, "x": "remote" },
        &version,
    ));

    harness
        .sync
        .sync_document_ids(&ns, &[Bson::Int32(7)])
        .expect("sync ids");
    assert!(harness.sync.do_sync_pass());

    let local = harness
        .local_coll(&ns)
        .find_one(&doc! { "_id": 7 })
        .expect("find")
        .expect("local document");
    assert_eq!(local, doc! { "_id": 7, "x": "remote" });
}
