//! Crash recovery: undo replay, pending-write reapplication, desync on
//! malformed versions, and the orphan sweep.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson};
use tether::core::with_version;
use tether::store::memory::MemoryStore;
use tether::store::{LocalCollection, LocalStore};
use tether::sync::DocumentSyncConfig;
use tether::test_harness::{SyncHarness, TEST_INSTANCE_KEY};
use tether::{ChangeEvent, DocumentVersion, Namespace};

use fixtures::wait_until;

fn config_db() -> String {
    format!("sync_config{TEST_INSTANCE_KEY}")
}

fn seed_namespace_row(store: &MemoryStore, ns: &Namespace) {
    store
        .collection(&config_db(), "namespaces")
        .insert_one(&doc! {
            "_id": ns.to_string(),
            "database": ns.database(),
            "collection": ns.collection(),
        })
        .expect("seed namespace row");
}

fn committed_version(id: &str) -> DocumentVersion {
    DocumentVersion {
        sync_protocol_version: 1,
        instance_id: id.into(),
        version_counter: 0,
    }
}

/// A crash after the local delete and the pending-write staging, but before
/// the undo cleanup: recovery restores the pre-image, reapplies the staged
/// delete, and leaves the pending event for the next pass to push.
#[test]
fn crash_mid_delete_replays_the_pending_delete() {
    let store = Arc::new(MemoryStore::new());
    let ns = Namespace::new("t", "c");
    seed_namespace_row(&store, &ns);

    let version = committed_version("G");
    let config = DocumentSyncConfig::new(ns.clone(), Bson::Int32(1));
    config.set_pending_writes_complete(Some(version.clone()));
    config.stage_pending_write(2, ChangeEvent::for_local_delete(ns.clone(), Bson::Int32(1), true));
    store
        .collection(&config_db(), "documents")
        .insert_one(&config.to_row().expect("row"))
        .expect("seed config row");

    // The interrupted deleteOne: pre-image journaled, local row gone,
    // undo cleanup never ran.
    store
        .collection(&ns.undo_database(), ns.collection())
        .insert_one(&doc! { "_id": 1, "x": "a" })
        .expect("seed undo row");

    let harness = SyncHarness::with_store(store);
    harness.sync.wait_until_initialized();
    harness
        .remote_coll(&ns)
        .seed(with_version(&doc! { "_id": 1, "x": "a" }, &version));

    // Recovery reapplied the pending delete and cleared the journal.
    assert!(harness.local_coll(&ns).is_empty());
    assert!(harness.undo_coll(&ns).is_empty());
    let row = harness
        .docs_coll()
        .find_one(&doc! { "document_id": 1 })
        .expect("find")
        .expect("config row");
    let pending = row
        .get_document("state")
        .expect("state")
        .get_document("last_uncommitted_change_event")
        .expect("pending event");
    assert_eq!(pending.get_str("operation").expect("operation"), "delete");

    // The next pass pushes the delete remotely and desyncs.
    harness.configure_remote_wins(&ns);
    assert!(harness.sync.do_sync_pass());
    assert!(harness.remote_coll(&ns).document(&Bson::Int32(1)).is_none());
    assert!(harness.sync.get_synchronized_document_ids(&ns).is_empty());
}

/// A crash after the local delete but before any pending write was staged:
/// recovery restores the pre-image and the operation is as if it never
/// happened.
#[test]
fn crash_before_staging_restores_the_pre_image() {
    let store = Arc::new(MemoryStore::new());
    let ns = Namespace::new("t", "c");
    seed_namespace_row(&store, &ns);

    let config = DocumentSyncConfig::new(ns.clone(), Bson::Int32(1));
    config.set_pending_writes_complete(Some(committed_version("G")));
    store
        .collection(&config_db(), "documents")
        .insert_one(&config.to_row().expect("row"))
        .expect("seed config row");
    store
        .collection(&ns.undo_database(), ns.collection())
        .insert_one(&doc! { "_id": 1, "x": "a" })
        .expect("seed undo row");

    let harness = SyncHarness::with_store(store);
    harness.sync.wait_until_initialized();

    assert_eq!(
        harness
            .local_coll(&ns)
            .find_one(&doc! { "_id": 1 })
            .expect("find"),
        Some(doc! { "_id": 1, "x": "a" })
    );
    assert!(harness.undo_coll(&ns).is_empty());
}

/// A remote document whose version field is not a subdocument: the document
/// is desynced, the exception listener fires once, and the local copy is
/// left in place.
#[test]
fn malformed_remote_version_desyncs_the_document() {
    let harness = SyncHarness::new();
    let ns = Namespace::new("t", "c");
    harness.configure_remote_wins(&ns);

    harness
        .local_coll(&ns)
        .insert_one(&doc! { "_id": 1, "x": "a" })
        .expect("seed local");
    harness
        .remote_coll(&ns)
        .seed(doc! { "_id": 1, "x": "b", tether::DOCUMENT_VERSION_FIELD: "garbage" });
    harness
        .sync
        .sync_document_ids(&ns, &[Bson::Int32(1)])
        .expect("sync ids");

    assert!(harness.sync.do_sync_pass());

    assert!(harness.sync.get_synchronized_document_ids(&ns).is_empty());
    assert_eq!(
        harness
            .local_coll(&ns)
            .find_one(&doc! { "_id": 1 })
            .expect("find"),
        Some(doc! { "_id": 1, "x": "a" })
    );
    assert!(wait_until(Duration::from_secs(1), || harness.errors.len() == 1));
    let (id, message) = harness.errors.errors().remove(0);
    assert_eq!(id, Bson::Int32(1));
    assert!(message.contains("malformed document version"), "{message}");
}

/// Local documents referenced by no config are swept at startup; this is
/// what reclaims crashed inserts and desynced copies.
#[test]
fn recovery_sweeps_unreferenced_local_documents() {
    let store = Arc::new(MemoryStore::new());
    let ns = Namespace::new("t", "c");
    seed_namespace_row(&store, &ns);

    let config = DocumentSyncConfig::new(ns.clone(), Bson::Int32(1));
    store
        .collection(&config_db(), "documents")
        .insert_one(&config.to_row().expect("row"))
        .expect("seed config row");
    let local = store.collection(&ns.user_database(), ns.collection());
    local.insert_one(&doc! { "_id": 1, "x": "kept" }).expect("seed");
    local.insert_one(&doc! { "_id": 2, "x": "orphan" }).expect("seed");

    let harness = SyncHarness::with_store(store);
    harness.sync.wait_until_initialized();

    assert_eq!(
        harness.local_coll(&ns).dump(),
        vec![doc! { "_id": 1, "x": "kept" }]
    );
}

/// Recovery is idempotent: a second cold start over the recovered state is
/// a no-op.
#[test]
fn recovery_is_idempotent_across_restarts() {
    let store = Arc::new(MemoryStore::new());
    let ns = Namespace::new("t", "c");
    seed_namespace_row(&store, &ns);

    let config = DocumentSyncConfig::new(ns.clone(), Bson::Int32(1));
    config.set_pending_writes_complete(Some(committed_version("G")));
    store
        .collection(&config_db(), "documents")
        .insert_one(&config.to_row().expect("row"))
        .expect("seed config row");
    store
        .collection(&ns.undo_database(), ns.collection())
        .insert_one(&doc! { "_id": 1, "x": "a" })
        .expect("seed undo row");

    let first = SyncHarness::with_store(Arc::clone(&store));
    first.sync.wait_until_initialized();
    let after_first = first.local_coll(&ns).dump();
    drop(first);

    let second = SyncHarness::with_store(store);
    second.sync.wait_until_initialized();
    assert_eq!(second.local_coll(&ns).dump(), after_first);
    assert!(second.undo_coll(&ns).is_empty());
}
