//! Crash recovery: replay the undo journal and pending-write metadata to
//! return each namespace to a known good state.
//!
//! Runs on engine start (and reinitialize) before any pass. Idempotent and
//! re-entrant: no undo row is deleted until the user collection is in the
//! desired state with respect to it, and the orphan sweep is safe to repeat.

use std::collections::BTreeSet;

use bson::{doc, Bson};
use tracing::{debug, info};

use crate::core::{DocumentKey, OperationType};
use crate::store::LocalCollection;

use super::config::{DocumentConfigMap, NamespaceSyncConfig};
use super::engine::Engine;
use super::{write_lock, SyncError};

impl Engine {
    pub(crate) fn recover(&self) -> Result<(), SyncError> {
        let instance = self.instance_config();
        for ns_config in instance.namespace_configs() {
            // The guard is held across the whole namespace recovery so no
            // CRUD mutation interleaves.
            let docs = write_lock(ns_config.docs());
            let result = self.recover_namespace(&ns_config, &docs);
            drop(docs);
            result?;
        }
        Ok(())
    }

    fn recover_namespace(
        &self,
        ns_config: &NamespaceSyncConfig,
        docs: &DocumentConfigMap,
    ) -> Result<(), SyncError> {
        let namespace = ns_config.namespace();
        let store = self.local_store();
        let local_coll = store.collection(&namespace.user_database(), namespace.collection());
        let undo_coll = store.collection(&namespace.undo_database(), namespace.collection());

        let undo_docs = undo_coll.find(&bson::Document::new())?;
        let mut recovered: BTreeSet<DocumentKey> = BTreeSet::new();

        // An undo row means a write was interrupted; restore the pre-image.
        for undo_doc in &undo_docs {
            let Some(document_id) = undo_doc.get("_id").cloned() else {
                continue;
            };
            local_coll.find_one_and_replace(&doc! { "_id": document_id.clone() }, undo_doc, true)?;
            recovered.insert(DocumentKey::new(document_id));
        }
        if !undo_docs.is_empty() {
            info!(ns = %namespace, restored = undo_docs.len(), "restored undo pre-images");
        }

        // If a recovered document carries a pending write, the failure
        // happened after the pending write was staged but before the undo
        // row was cleared; restore the state the pending write describes.
        for config in docs.values() {
            if !recovered.contains(&config.key()) {
                continue;
            }
            let Some(pending) = config.last_uncommitted_change_event() else {
                continue;
            };
            let filter = doc! { "_id": config.document_id().clone() };
            match &pending.operation {
                OperationType::Insert | OperationType::Update | OperationType::Replace => {
                    let full = pending.full_document.as_ref().ok_or(SyncError::Invariant(
                        "pending write without a full document",
                    ))?;
                    local_coll.find_one_and_replace(&filter, full, true)?;
                }
                OperationType::Delete => {
                    local_coll.delete_one(&filter)?;
                }
                OperationType::Unknown(_) => {
                    // Nothing should ever stage an unknown pending write;
                    // stop rather than corrupt further.
                    return Err(SyncError::Invariant(
                        "pending write with an unknown operation type",
                    ));
                }
            }
            debug!(
                ns = %namespace,
                document_id = ?config.document_id(),
                op = pending.operation.as_str(),
                "reapplied pending write during recovery"
            );
        }

        // Only now is it safe to clear the undo rows; failing above simply
        // reruns recovery as a no-op next start.
        for key in &recovered {
            undo_coll.delete_one(&key.id_filter())?;
        }

        // Local documents referenced by no config are leftovers of crashed
        // inserts/upserts or of desync; sweep them.
        let synced_ids: Vec<Bson> = docs.keys().map(|key| key.value().clone()).collect();
        local_coll.delete_many(&doc! { "_id": { "$nin": synced_ids } })?;
        Ok(())
    }
}
