//! Local-first CRUD over synchronized documents.
//!
//! Every mutation stages a pending change event (coalescing with any
//! earlier one), brackets the local write with undo pre-images, and leaves
//! the remote push to the next sync pass. Local errors surface directly to
//! the caller; sync-side errors never do.

use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use tracing::debug;

use crate::core::{
    sanitize_document, ChangeEvent, DocumentKey, Namespace, OperationType, UpdateDescription,
    DOCUMENT_VERSION_FIELD,
};
use crate::store::{DeleteResult, LocalCollection, ReturnDocument, UpdateResult};

use super::config::add_and_get_config;
use super::engine::{DataSynchronizer, Engine};
use super::{write_lock, SyncError};

impl Engine {
    pub(crate) fn sync_document_ids(
        &self,
        namespace: &Namespace,
        ids: &[Bson],
    ) -> Result<(), SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let ns_config = self.namespace_config_or_create(namespace)?;
        let docs_coll = self.docs_collection();
        let mut added = false;
        {
            let mut docs = write_lock(ns_config.docs());
            for id in ids {
                let (config, created) = add_and_get_config(&mut docs, namespace, id);
                if created {
                    self.persist_doc_config(&*docs_coll, &config)?;
                    added = true;
                }
            }
        }
        if added {
            self.trigger_listening(namespace);
        }
        Ok(())
    }

    /// Stops synchronizing the given ids. Uncommitted writes are lost; the
    /// local copies stay put until the recovery orphan sweep.
    pub(crate) fn desync_document_ids(
        &self,
        namespace: &Namespace,
        ids: &[Bson],
    ) -> Result<(), SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let Some(ns_config) = self.instance_config().namespace_config(namespace) else {
            return Ok(());
        };
        let docs_coll = self.docs_collection();
        let mut removed = false;
        {
            let mut docs = write_lock(ns_config.docs());
            for id in ids {
                if let Some(config) = docs.remove(&DocumentKey::from(id)) {
                    docs_coll.delete_one(&config.write_filter())?;
                    removed = true;
                }
            }
        }
        if removed {
            self.trigger_listening(namespace);
        }
        Ok(())
    }

    pub(crate) fn insert_one(
        &self,
        namespace: &Namespace,
        document: &Document,
    ) -> Result<Bson, SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let ns_config = self.namespace_config_or_create(namespace)?;
        let local_coll = self.local_collection(namespace);
        let docs_coll = self.docs_collection();

        let mut doc_for_storage = sanitize_document(document);
        if !doc_for_storage.contains_key("_id") {
            doc_for_storage.insert("_id", ObjectId::new());
        }
        let document_id = doc_for_storage
            .get("_id")
            .cloned()
            .ok_or(SyncError::Invariant("insert lost its _id"))?;

        let event;
        {
            let mut docs = write_lock(ns_config.docs());
            local_coll.insert_one(&doc_for_storage)?;
            event = ChangeEvent::for_local_insert(namespace.clone(), doc_for_storage, true);
            let (config, _) = add_and_get_config(&mut docs, namespace, &document_id);
            config.stage_pending_write(self.logical_time(), event.clone());
            self.persist_doc_config(&*docs_coll, &config)?;
        }
        self.trigger_listening(namespace);
        self.emit_event(&ns_config, &event);
        Ok(document_id)
    }

    pub(crate) fn insert_many(
        &self,
        namespace: &Namespace,
        documents: &[Document],
    ) -> Result<Vec<Bson>, SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let ns_config = self.namespace_config_or_create(namespace)?;
        let local_coll = self.local_collection(namespace);
        let docs_coll = self.docs_collection();

        let mut docs_for_storage = Vec::with_capacity(documents.len());
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            let mut doc = sanitize_document(document);
            if !doc.contains_key("_id") {
                doc.insert("_id", ObjectId::new());
            }
            if let Some(id) = doc.get("_id").cloned() {
                ids.push(id);
            }
            docs_for_storage.push(doc);
        }

        let mut events = Vec::with_capacity(docs_for_storage.len());
        {
            let mut docs = write_lock(ns_config.docs());
            local_coll.insert_many(&docs_for_storage)?;
            for (doc, id) in docs_for_storage.into_iter().zip(&ids) {
                let event = ChangeEvent::for_local_insert(namespace.clone(), doc, true);
                let (config, _) = add_and_get_config(&mut docs, namespace, id);
                config.stage_pending_write(self.logical_time(), event.clone());
                self.persist_doc_config(&*docs_coll, &config)?;
                events.push(event);
            }
        }
        self.trigger_listening(namespace);
        for event in &events {
            self.emit_event(&ns_config, event);
        }
        Ok(ids)
    }

    pub(crate) fn update_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let ns_config = self.namespace_config_or_create(namespace)?;
        let local_coll = self.local_collection(namespace);
        let undo_coll = self.undo_collection(namespace);
        let docs_coll = self.docs_collection();

        let event;
        let document_id;
        let trigger_namespace;
        {
            let mut docs = write_lock(ns_config.docs());

            let before = local_coll.find_one(filter)?;
            if before.is_none() && !upsert {
                return Ok(UpdateResult::default());
            }
            if let Some(before) = &before {
                undo_coll.insert_one(before)?;
            }

            let after = local_coll.find_one_and_update(filter, update, upsert, ReturnDocument::After)?;
            let Some(after) = after else {
                // Deleted between the lookup and the update; nothing done.
                if let Some(before) = &before {
                    if let Some(id) = before.get("_id") {
                        undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                    }
                }
                return Ok(UpdateResult::default());
            };
            document_id = after
                .get("_id")
                .cloned()
                .ok_or(SyncError::Invariant("updated document without an _id"))?;
            let after = self.sanitize_cached_document(&*local_coll, after, &document_id)?;

            if before.is_none() && upsert {
                trigger_namespace = true;
                let (config, _) = add_and_get_config(&mut docs, namespace, &document_id);
                event = ChangeEvent::for_local_insert(namespace.clone(), after, true);
                config.stage_pending_write(self.logical_time(), event.clone());
                self.persist_doc_config(&*docs_coll, &config)?;
            } else {
                trigger_namespace = false;
                let before_doc = before.clone().unwrap_or_default();
                let Some(config) = docs.get(&DocumentKey::from(&document_id)).map(Arc::clone)
                else {
                    // The filter matched a document we are not synchronizing;
                    // the local write stands but nothing is staged.
                    debug!(ns = %namespace, document_id = ?document_id, "update hit an unsynchronized document");
                    if let Some(id) = before_doc.get("_id") {
                        undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                    }
                    return Ok(UpdateResult {
                        matched_count: 1,
                        modified_count: 1,
                        upserted_id: None,
                    });
                };
                event = ChangeEvent::for_local_update(
                    namespace.clone(),
                    document_id.clone(),
                    UpdateDescription::diff(&before_doc, &after),
                    after,
                    true,
                );
                config.stage_pending_write(self.logical_time(), event.clone());
                self.persist_doc_config(&*docs_coll, &config)?;
            }

            if let Some(before) = &before {
                if let Some(id) = before.get("_id") {
                    undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                }
            }
        }

        if trigger_namespace {
            self.trigger_listening(namespace);
        }
        self.emit_event(&ns_config, &event);
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: 1,
            upserted_id: trigger_namespace.then(|| document_id),
        })
    }

    pub(crate) fn update_many(
        &self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult, SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let ns_config = self.namespace_config_or_create(namespace)?;
        let local_coll = self.local_collection(namespace);
        let undo_coll = self.undo_collection(namespace);
        let docs_coll = self.docs_collection();

        let result;
        let mut events = Vec::new();
        let mut upserted = false;
        {
            let mut docs = write_lock(ns_config.docs());

            let before_docs = local_coll.find(filter)?;
            let mut before_by_id: Vec<(Bson, Document)> = Vec::new();
            let mut ids = Vec::new();
            for before in before_docs {
                let Some(id) = before.get("_id").cloned() else {
                    continue;
                };
                undo_coll.insert_one(&before)?;
                ids.push(id.clone());
                before_by_id.push((id, before));
            }

            // Refilter by the matched ids so documents inserted concurrently
            // are not swept into this update.
            let scoped_filter = if upsert {
                filter.clone()
            } else {
                doc! { "_id": { "$in": ids.clone() } }
            };
            result = local_coll.update_many(&scoped_filter, update, upsert)?;

            let after_filter = match &result.upserted_id {
                Some(id) => doc! { "_id": id.clone() },
                None => scoped_filter,
            };
            for after in local_coll.find(&after_filter)? {
                let Some(id) = after.get("_id").cloned() else {
                    continue;
                };
                let before = before_by_id
                    .iter()
                    .find(|(bid, _)| DocumentKey::from(bid) == DocumentKey::from(&id))
                    .map(|(_, doc)| doc.clone());
                if before.is_none() && result.upserted_id.is_none() {
                    continue;
                }
                let after = self.sanitize_cached_document(&*local_coll, after, &id)?;

                if let Some(before) = &before {
                    if *before == after {
                        // Matched but unmodified; leave nothing staged.
                        undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                        continue;
                    }
                }

                let event = match &before {
                    None => {
                        upserted = true;
                        let (config, _) = add_and_get_config(&mut docs, namespace, &id);
                        let event =
                            ChangeEvent::for_local_insert(namespace.clone(), after, true);
                        config.stage_pending_write(self.logical_time(), event.clone());
                        self.persist_doc_config(&*docs_coll, &config)?;
                        event
                    }
                    Some(before) => {
                        let Some(config) = docs.get(&DocumentKey::from(&id)).map(Arc::clone)
                        else {
                            undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                            continue;
                        };
                        let event = ChangeEvent::for_local_update(
                            namespace.clone(),
                            id.clone(),
                            UpdateDescription::diff(before, &after),
                            after,
                            true,
                        );
                        config.stage_pending_write(self.logical_time(), event.clone());
                        self.persist_doc_config(&*docs_coll, &config)?;
                        event
                    }
                };
                undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                events.push(event);
            }
        }

        if upserted {
            self.trigger_listening(namespace);
        }
        for event in &events {
            self.emit_event(&ns_config, event);
        }
        Ok(result)
    }

    pub(crate) fn delete_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> Result<DeleteResult, SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let Some(ns_config) = self.instance_config().namespace_config(namespace) else {
            return Ok(DeleteResult::default());
        };
        let local_coll = self.local_collection(namespace);
        let undo_coll = self.undo_collection(namespace);
        let docs_coll = self.docs_collection();

        let event;
        let result;
        let mut desynced = false;
        {
            let mut docs = write_lock(ns_config.docs());

            let Some(doc_to_delete) = local_coll.find_one(filter)? else {
                return Ok(DeleteResult::default());
            };
            let Some(document_id) = doc_to_delete.get("_id").cloned() else {
                return Ok(DeleteResult::default());
            };
            let Some(config) = docs.get(&DocumentKey::from(&document_id)).map(Arc::clone) else {
                // Not a synchronized document; leave it alone.
                return Ok(DeleteResult::default());
            };

            undo_coll.insert_one(&doc_to_delete)?;
            result = local_coll.delete_one(filter)?;
            event = ChangeEvent::for_local_delete(namespace.clone(), document_id.clone(), true);

            // An unpushed insert deleted again collapses to nothing at all.
            if config
                .last_uncommitted_change_event()
                .is_some_and(|pending| pending.operation == OperationType::Insert)
            {
                docs.remove(&config.key());
                docs_coll.delete_one(&config.write_filter())?;
                undo_coll.delete_one(&doc! { "_id": document_id.clone() })?;
                desynced = true;
            } else {
                config.stage_pending_write(self.logical_time(), event.clone());
                self.persist_doc_config(&*docs_coll, &config)?;
                undo_coll.delete_one(&doc! { "_id": document_id.clone() })?;
            }
        }

        if desynced {
            self.trigger_listening(namespace);
            return Ok(result);
        }
        self.emit_event(&ns_config, &event);
        Ok(result)
    }

    pub(crate) fn delete_many(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> Result<DeleteResult, SyncError> {
        self.wait_until_initialized();
        let _op = self.ongoing.enter();
        let Some(ns_config) = self.instance_config().namespace_config(namespace) else {
            return Ok(DeleteResult::default());
        };
        let local_coll = self.local_collection(namespace);
        let undo_coll = self.undo_collection(namespace);
        let docs_coll = self.docs_collection();

        let result;
        let mut events = Vec::new();
        {
            let mut docs = write_lock(ns_config.docs());

            let to_delete = local_coll.find(filter)?;
            let mut ids = Vec::new();
            for doc_to_delete in &to_delete {
                let Some(id) = doc_to_delete.get("_id").cloned() else {
                    continue;
                };
                undo_coll.insert_one(doc_to_delete)?;
                ids.push(id);
            }

            result = local_coll.delete_many(filter)?;

            for id in ids {
                let Some(config) = docs.get(&DocumentKey::from(&id)).map(Arc::clone) else {
                    undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                    continue;
                };
                if config
                    .last_uncommitted_change_event()
                    .is_some_and(|pending| pending.operation == OperationType::Insert)
                {
                    docs.remove(&config.key());
                    docs_coll.delete_one(&config.write_filter())?;
                    undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                    continue;
                }
                let event = ChangeEvent::for_local_delete(namespace.clone(), id.clone(), true);
                config.stage_pending_write(self.logical_time(), event.clone());
                self.persist_doc_config(&*docs_coll, &config)?;
                undo_coll.delete_one(&doc! { "_id": id.clone() })?;
                events.push(event);
            }
        }

        self.trigger_listening(namespace);
        for event in &events {
            self.emit_event(&ns_config, event);
        }
        Ok(result)
    }

    /// Strips the version field should a local update have smuggled it in,
    /// both from the returned image and from the stored document.
    fn sanitize_cached_document(
        &self,
        local_coll: &dyn LocalCollection,
        document: Document,
        document_id: &Bson,
    ) -> Result<Document, SyncError> {
        if !document.contains_key(DOCUMENT_VERSION_FIELD) {
            return Ok(document);
        }
        local_coll.find_one_and_update(
            &doc! { "_id": document_id.clone() },
            &doc! { "$unset": { DOCUMENT_VERSION_FIELD: 1 } },
            false,
            ReturnDocument::After,
        )?;
        Ok(sanitize_document(&document))
    }
}

impl DataSynchronizer {
    /// Requests that documents be synchronized by id. Actual material shows
    /// up on a later pass.
    pub fn sync_document_ids(&self, namespace: &Namespace, ids: &[Bson]) -> crate::Result<()> {
        self.engine()
            .sync_document_ids(namespace, ids)
            .map_err(Into::into)
    }

    /// Stops synchronizing documents by id. Uncommitted writes are lost.
    pub fn desync_document_ids(&self, namespace: &Namespace, ids: &[Bson]) -> crate::Result<()> {
        self.engine()
            .desync_document_ids(namespace, ids)
            .map_err(Into::into)
    }

    pub fn get_synchronized_namespaces(&self) -> Vec<Namespace> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        self.engine().instance_config().synchronized_namespaces()
    }

    pub fn get_synchronized_document_ids(&self, namespace: &Namespace) -> Vec<Bson> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        self.engine()
            .instance_config()
            .namespace_config(namespace)
            .map(|ns_config| ns_config.synchronized_document_ids())
            .unwrap_or_default()
    }

    /// Ids frozen by an unrecoverable error, awaiting resume.
    pub fn get_paused_document_ids(&self, namespace: &Namespace) -> Vec<Bson> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        self.engine()
            .instance_config()
            .namespace_config(namespace)
            .map(|ns_config| {
                ns_config
                    .document_configs()
                    .into_iter()
                    .filter(|config| config.is_paused())
                    .map(|config| config.document_id().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Unfreezes a paused document. Returns whether the document is now
    /// syncing again.
    pub fn resume_sync_for_document(&self, namespace: &Namespace, document_id: &Bson) -> bool {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        let Some(ns_config) = self.engine().instance_config().namespace_config(namespace) else {
            return false;
        };
        let Some(config) = ns_config.document_config(document_id) else {
            return false;
        };
        config.set_paused(false);
        let docs_coll = self.engine().docs_collection();
        let _ = self.engine().persist_doc_config(&*docs_coll, &config);
        !config.is_paused()
    }

    pub fn insert_one(&self, namespace: &Namespace, document: &Document) -> crate::Result<Bson> {
        self.engine()
            .insert_one(namespace, document)
            .map_err(Into::into)
    }

    pub fn insert_many(
        &self,
        namespace: &Namespace,
        documents: &[Document],
    ) -> crate::Result<Vec<Bson>> {
        self.engine()
            .insert_many(namespace, documents)
            .map_err(Into::into)
    }

    pub fn update_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> crate::Result<UpdateResult> {
        self.engine()
            .update_one(namespace, filter, update, upsert)
            .map_err(Into::into)
    }

    pub fn update_many(
        &self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> crate::Result<UpdateResult> {
        self.engine()
            .update_many(namespace, filter, update, upsert)
            .map_err(Into::into)
    }

    pub fn delete_one(&self, namespace: &Namespace, filter: &Document) -> crate::Result<DeleteResult> {
        self.engine().delete_one(namespace, filter).map_err(Into::into)
    }

    pub fn delete_many(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> crate::Result<DeleteResult> {
        self.engine()
            .delete_many(namespace, filter)
            .map_err(Into::into)
    }

    pub fn find(&self, namespace: &Namespace, filter: &Document) -> crate::Result<Vec<Document>> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        Ok(self.engine().local_collection(namespace).find(filter)?)
    }

    pub fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> crate::Result<Option<Document>> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        Ok(self.engine().local_collection(namespace).find_one(filter)?)
    }

    pub fn count(&self, namespace: &Namespace, filter: &Document) -> crate::Result<u64> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        Ok(self.engine().local_collection(namespace).count(filter)?)
    }

    pub fn aggregate(
        &self,
        namespace: &Namespace,
        pipeline: &[Document],
    ) -> crate::Result<Vec<Document>> {
        self.engine().wait_until_initialized();
        let _op = self.engine().ongoing.enter();
        Ok(self.engine().local_collection(namespace).aggregate(pipeline)?)
    }
}
