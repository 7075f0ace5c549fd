//! Persistent synchronization state: instance, namespace and document
//! configs, plus pending-write coalescence.
//!
//! A document config exists iff the document is being synchronized. Configs
//! are persisted as rows of `sync_config<instanceKey>.documents` and loaded
//! wholesale at engine initialization.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::core::{
    ChangeEvent, DocumentKey, DocumentVersion, Namespace, OperationType, VersionInfo,
};
use crate::store::{LocalCollection, LocalStore, StoreResult};

use super::handlers::{ChangeEventListener, ConflictHandler};
use super::{mutex_lock, read_lock, write_lock, SyncError};

pub type DocumentConfigMap = BTreeMap<DocumentKey, Arc<DocumentSyncConfig>>;

/// Logical time meaning "never resolved".
pub const NEVER_RESOLVED: i64 = -1;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DocumentState {
    last_known_remote_version: Option<DocumentVersion>,
    last_uncommitted_change_event: Option<ChangeEvent>,
    last_resolution: i64,
    is_stale: bool,
    is_paused: bool,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self {
            last_known_remote_version: None,
            last_uncommitted_change_event: None,
            last_resolution: NEVER_RESOLVED,
            // Fresh configs are stale: the first pass fetches the current
            // remote copy instead of waiting for a stream event.
            is_stale: true,
            is_paused: false,
        }
    }
}

/// Per-document synchronization state.
#[derive(Debug)]
pub struct DocumentSyncConfig {
    namespace: Namespace,
    document_id: Bson,
    state: Mutex<DocumentState>,
}

impl DocumentSyncConfig {
    pub fn new(namespace: Namespace, document_id: Bson) -> Self {
        Self {
            namespace,
            document_id,
            state: Mutex::new(DocumentState::default()),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn document_id(&self) -> &Bson {
        &self.document_id
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::from(&self.document_id)
    }

    pub fn has_uncommitted_writes(&self) -> bool {
        mutex_lock(&self.state)
            .last_uncommitted_change_event
            .is_some()
    }

    pub fn last_uncommitted_change_event(&self) -> Option<ChangeEvent> {
        mutex_lock(&self.state).last_uncommitted_change_event.clone()
    }

    pub fn last_known_remote_version(&self) -> Option<DocumentVersion> {
        mutex_lock(&self.state).last_known_remote_version.clone()
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo::from_version(self.last_known_remote_version())
    }

    pub fn last_resolution(&self) -> i64 {
        mutex_lock(&self.state).last_resolution
    }

    pub fn is_stale(&self) -> bool {
        mutex_lock(&self.state).is_stale
    }

    pub fn set_stale(&self, stale: bool) {
        mutex_lock(&self.state).is_stale = stale;
    }

    pub fn is_paused(&self) -> bool {
        mutex_lock(&self.state).is_paused
    }

    pub fn set_paused(&self, paused: bool) {
        mutex_lock(&self.state).is_paused = paused;
    }

    /// Whether the incoming version carries nothing we have not already
    /// applied or authored: both sides versioned, same writer, incoming
    /// counter not ahead of ours.
    pub fn has_committed_version(&self, incoming: &VersionInfo) -> bool {
        let state = mutex_lock(&self.state);
        match (&state.last_known_remote_version, incoming.version()) {
            (Some(local), Some(remote)) => {
                local.instance_id == remote.instance_id
                    && remote.version_counter <= local.version_counter
            }
            _ => false,
        }
    }

    /// Stages a local write: coalesces onto any existing pending event,
    /// stamps the logical time, and resumes a paused document.
    pub fn stage_pending_write(&self, logical_t: i64, event: ChangeEvent) {
        let mut state = mutex_lock(&self.state);
        let existing = state.last_uncommitted_change_event.take();
        state.last_uncommitted_change_event = Some(coalesce(existing, event));
        state.last_resolution = logical_t;
        state.is_paused = false;
    }

    /// Records a conflict resolution: the pending event is replaced outright
    /// and the remote version is acknowledged.
    pub fn set_pending_write_resolved(
        &self,
        logical_t: i64,
        at_version: Option<DocumentVersion>,
        event: ChangeEvent,
    ) {
        let mut state = mutex_lock(&self.state);
        state.last_uncommitted_change_event = Some(event);
        state.last_known_remote_version = at_version;
        state.last_resolution = logical_t;
    }

    /// Clears pending-write metadata after a successful commit and
    /// acknowledges the committed version.
    pub fn set_pending_writes_complete(&self, at_version: Option<DocumentVersion>) {
        let mut state = mutex_lock(&self.state);
        state.last_uncommitted_change_event = None;
        state.last_known_remote_version = at_version;
        state.is_stale = false;
    }

    /// Filter selecting this config's persisted row.
    pub fn write_filter(&self) -> Document {
        doc! {
            "namespace": self.namespace.to_string(),
            "document_id": self.document_id.clone(),
        }
    }

    pub fn to_row(&self) -> Result<Document, SyncError> {
        let state = mutex_lock(&self.state).clone();
        let mut row = self.write_filter();
        row.insert("database", self.namespace.database());
        row.insert("collection", self.namespace.collection());
        row.insert("state", bson::to_document(&state)?);
        Ok(row)
    }

    pub fn from_row(row: &Document) -> Result<Self, SyncError> {
        let database = row
            .get_str("database")
            .map_err(|e| SyncError::Decode(format!("document config row: {e}")))?;
        let collection = row
            .get_str("collection")
            .map_err(|e| SyncError::Decode(format!("document config row: {e}")))?;
        let document_id = row
            .get("document_id")
            .cloned()
            .ok_or_else(|| SyncError::Decode("document config row missing document_id".into()))?;
        let state: DocumentState = row
            .get_document("state")
            .map_err(|e| SyncError::Decode(format!("document config row: {e}")))
            .and_then(|d| bson::from_document(d.clone()).map_err(SyncError::from))?;
        Ok(Self {
            namespace: Namespace::new(database, collection),
            document_id,
            state: Mutex::new(state),
        })
    }
}

/// Coalesces a new local operation onto an existing pending one so at most
/// one uncommitted change event is retained per document.
fn coalesce(existing: Option<ChangeEvent>, new_event: ChangeEvent) -> ChangeEvent {
    let Some(existing) = existing else {
        return new_event;
    };
    match (&existing.operation, &new_event.operation) {
        // An unpushed insert absorbs later updates and replaces wholesale.
        (OperationType::Insert, OperationType::Update)
        | (OperationType::Insert, OperationType::Replace) => ChangeEvent {
            operation: OperationType::Insert,
            update_description: None,
            ..new_event
        },
        // Re-creation after an unpushed delete: the remote row still exists,
        // so push it as a replace.
        (OperationType::Delete, OperationType::Insert) => ChangeEvent {
            operation: OperationType::Replace,
            update_description: None,
            ..new_event
        },
        (OperationType::Update, OperationType::Update) => {
            let merged = match (
                existing.update_description,
                new_event.update_description.clone(),
            ) {
                (Some(older), Some(newer)) => Some(older.merge(&newer)),
                (older, newer) => newer.or(older),
            };
            ChangeEvent {
                operation: OperationType::Update,
                update_description: merged,
                ..new_event
            }
        }
        (OperationType::Replace, OperationType::Update) => ChangeEvent {
            operation: OperationType::Replace,
            update_description: None,
            ..new_event
        },
        _ => new_event,
    }
}

#[derive(Default)]
struct NamespaceHandlers {
    conflict: Option<Arc<dyn ConflictHandler>>,
    listener: Option<Arc<dyn ChangeEventListener>>,
}

/// Per-namespace synchronization state. The `docs` lock is the namespace
/// config lock of the locking hierarchy: a sync pass holds its write guard
/// for the duration of reconciliation.
pub struct NamespaceSyncConfig {
    namespace: Namespace,
    docs: RwLock<DocumentConfigMap>,
    stale: AtomicBool,
    handlers: Mutex<NamespaceHandlers>,
}

impl NamespaceSyncConfig {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            docs: RwLock::new(BTreeMap::new()),
            stale: AtomicBool::new(false),
            handlers: Mutex::new(NamespaceHandlers::default()),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub(crate) fn docs(&self) -> &RwLock<DocumentConfigMap> {
        &self.docs
    }

    pub fn document_config(&self, id: &Bson) -> Option<Arc<DocumentSyncConfig>> {
        read_lock(&self.docs).get(&DocumentKey::from(id)).cloned()
    }

    pub fn document_configs(&self) -> Vec<Arc<DocumentSyncConfig>> {
        read_lock(&self.docs).values().cloned().collect()
    }

    pub fn synchronized_document_ids(&self) -> Vec<Bson> {
        read_lock(&self.docs)
            .keys()
            .map(|key| key.value().clone())
            .collect()
    }

    pub fn is_configured(&self) -> bool {
        mutex_lock(&self.handlers).conflict.is_some()
    }

    pub fn configure(
        &self,
        conflict: Arc<dyn ConflictHandler>,
        listener: Option<Arc<dyn ChangeEventListener>>,
    ) {
        let mut handlers = mutex_lock(&self.handlers);
        handlers.conflict = Some(conflict);
        handlers.listener = listener;
    }

    pub fn conflict_handler(&self) -> Option<Arc<dyn ConflictHandler>> {
        mutex_lock(&self.handlers).conflict.clone()
    }

    pub fn change_listener(&self) -> Option<Arc<dyn ChangeEventListener>> {
        mutex_lock(&self.handlers).listener.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Marked on stream (re)open: events may have been missed, so the next
    /// remote-to-local pass performs a full-document catch-up.
    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::SeqCst);
    }

    /// Ids needing a full-document catch-up this pass.
    pub(crate) fn stale_document_keys(&self, docs: &DocumentConfigMap) -> BTreeSet<DocumentKey> {
        if self.is_stale() {
            docs.keys().cloned().collect()
        } else {
            docs.iter()
                .filter(|(_, config)| config.is_stale())
                .map(|(key, _)| key.clone())
                .collect()
        }
    }

    pub fn to_row(&self) -> Document {
        doc! {
            "_id": self.namespace.to_string(),
            "database": self.namespace.database(),
            "collection": self.namespace.collection(),
        }
    }

    pub fn from_row(row: &Document) -> Result<Self, SyncError> {
        let database = row
            .get_str("database")
            .map_err(|e| SyncError::Decode(format!("namespace config row: {e}")))?;
        let collection = row
            .get_str("collection")
            .map_err(|e| SyncError::Decode(format!("namespace config row: {e}")))?;
        Ok(Self::new(Namespace::new(database, collection)))
    }
}

/// Adds (or finds) the config for a document id within a held namespace map
/// guard. Returns the config and whether it was newly created.
pub(crate) fn add_and_get_config(
    docs: &mut DocumentConfigMap,
    namespace: &Namespace,
    id: &Bson,
) -> (Arc<DocumentSyncConfig>, bool) {
    let key = DocumentKey::from(id);
    if let Some(config) = docs.get(&key) {
        return (Arc::clone(config), false);
    }
    let config = Arc::new(DocumentSyncConfig::new(namespace.clone(), id.clone()));
    docs.insert(key, Arc::clone(&config));
    (config, true)
}

/// Instance-wide synchronization state: one namespace config per configured
/// namespace, persisted through the local store.
pub struct InstanceSyncConfig {
    instance_key: String,
    namespaces: RwLock<BTreeMap<Namespace, Arc<NamespaceSyncConfig>>>,
}

impl InstanceSyncConfig {
    pub fn config_database(instance_key: &str) -> String {
        format!("sync_config{instance_key}")
    }

    /// An empty configuration, used before background initialization loads
    /// the persisted one.
    pub fn empty(instance_key: &str) -> Self {
        Self {
            instance_key: instance_key.to_string(),
            namespaces: RwLock::new(BTreeMap::new()),
        }
    }

    /// Loads (or seeds) the persisted instance configuration.
    pub fn load(instance_key: &str, store: &Arc<dyn LocalStore>) -> Result<Self, SyncError> {
        let db = Self::config_database(instance_key);
        let instances = store.collection(&db, "instances");
        if instances.count(&Document::new())? == 0 {
            instances.insert_one(&doc! { "_id": instance_key })?;
        }

        let mut namespaces: BTreeMap<Namespace, Arc<NamespaceSyncConfig>> = BTreeMap::new();
        for row in store.collection(&db, "namespaces").find(&Document::new())? {
            let ns_config = NamespaceSyncConfig::from_row(&row)?;
            namespaces.insert(ns_config.namespace().clone(), Arc::new(ns_config));
        }
        for row in store.collection(&db, "documents").find(&Document::new())? {
            let doc_config = DocumentSyncConfig::from_row(&row)?;
            let ns_config = namespaces
                .entry(doc_config.namespace().clone())
                .or_insert_with(|| {
                    Arc::new(NamespaceSyncConfig::new(doc_config.namespace().clone()))
                });
            write_lock(ns_config.docs()).insert(doc_config.key(), Arc::new(doc_config));
        }

        Ok(Self {
            instance_key: instance_key.to_string(),
            namespaces: RwLock::new(namespaces),
        })
    }

    pub fn instance_key(&self) -> &str {
        &self.instance_key
    }

    pub fn documents_collection(&self, store: &Arc<dyn LocalStore>) -> Arc<dyn LocalCollection> {
        store.collection(&Self::config_database(&self.instance_key), "documents")
    }

    pub fn namespaces_collection(&self, store: &Arc<dyn LocalStore>) -> Arc<dyn LocalCollection> {
        store.collection(&Self::config_database(&self.instance_key), "namespaces")
    }

    pub fn namespace_configs(&self) -> Vec<Arc<NamespaceSyncConfig>> {
        read_lock(&self.namespaces).values().cloned().collect()
    }

    pub fn namespace_config(&self, namespace: &Namespace) -> Option<Arc<NamespaceSyncConfig>> {
        read_lock(&self.namespaces).get(namespace).cloned()
    }

    /// Finds or creates a namespace config, persisting the row on creation.
    pub fn namespace_config_or_create(
        &self,
        namespace: &Namespace,
        store: &Arc<dyn LocalStore>,
    ) -> StoreResult<(Arc<NamespaceSyncConfig>, bool)> {
        if let Some(existing) = self.namespace_config(namespace) {
            return Ok((existing, false));
        }
        let mut namespaces = write_lock(&self.namespaces);
        if let Some(existing) = namespaces.get(namespace) {
            return Ok((Arc::clone(existing), false));
        }
        let config = Arc::new(NamespaceSyncConfig::new(namespace.clone()));
        self.namespaces_collection(store)
            .find_one_and_replace(&doc! { "_id": namespace.to_string() }, &config.to_row(), true)?;
        namespaces.insert(namespace.clone(), Arc::clone(&config));
        Ok((config, true))
    }

    pub fn synchronized_namespaces(&self) -> Vec<Namespace> {
        read_lock(&self.namespaces).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::UpdateDescription;

    use super::*;

    fn ns() -> Namespace {
        Namespace::new("app", "items")
    }

    fn insert_event(x: i32) -> ChangeEvent {
        ChangeEvent::for_local_insert(ns(), doc! { "_id": 1, "x": x }, true)
    }

    fn update_event(desc: UpdateDescription, doc: Document) -> ChangeEvent {
        ChangeEvent::for_local_update(ns(), Bson::Int32(1), desc, doc, true)
    }

    #[test]
    fn staging_onto_nothing_keeps_the_event() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
        config.stage_pending_write(3, insert_event(1));
        let pending = config.last_uncommitted_change_event().expect("pending");
        assert_eq!(pending.operation, OperationType::Insert);
        assert_eq!(config.last_resolution(), 3);
        assert!(config.has_uncommitted_writes());
    }

    #[test]
    fn insert_absorbs_update_and_replace() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
        config.stage_pending_write(1, insert_event(1));
        config.stage_pending_write(
            2,
            update_event(
                UpdateDescription::diff(&doc! { "_id": 1, "x": 1 }, &doc! { "_id": 1, "x": 2 }),
                doc! { "_id": 1, "x": 2 },
            ),
        );
        let pending = config.last_uncommitted_change_event().expect("pending");
        assert_eq!(pending.operation, OperationType::Insert);
        assert_eq!(pending.full_document, Some(doc! { "_id": 1, "x": 2 }));
        assert!(pending.update_description.is_none());
    }

    #[test]
    fn updates_merge_their_descriptions() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
        config.stage_pending_write(
            1,
            update_event(
                UpdateDescription {
                    updated_fields: doc! { "a": 1 },
                    removed_fields: vec![],
                },
                doc! { "_id": 1, "a": 1 },
            ),
        );
        config.stage_pending_write(
            2,
            update_event(
                UpdateDescription {
                    updated_fields: doc! { "b": 2 },
                    removed_fields: vec!["a".into()],
                },
                doc! { "_id": 1, "b": 2 },
            ),
        );
        let pending = config.last_uncommitted_change_event().expect("pending");
        let desc = pending.update_description.expect("description");
        assert_eq!(desc.updated_fields, doc! { "b": 2 });
        assert_eq!(desc.removed_fields, vec!["a".to_string()]);
    }

    #[test]
    fn insert_after_delete_becomes_replace() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
        config.stage_pending_write(1, ChangeEvent::for_local_delete(ns(), Bson::Int32(1), true));
        config.stage_pending_write(2, insert_event(5));
        let pending = config.last_uncommitted_change_event().expect("pending");
        assert_eq!(pending.operation, OperationType::Replace);
        assert_eq!(pending.full_document, Some(doc! { "_id": 1, "x": 5 }));
    }

    #[test]
    fn delete_wins_over_update_and_replace() {
        for earlier in [
            update_event(UpdateDescription::default(), doc! { "_id": 1 }),
            ChangeEvent::for_local_replace(ns(), Bson::Int32(1), doc! { "_id": 1 }, true),
        ] {
            let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
            config.stage_pending_write(1, earlier);
            config.stage_pending_write(2, ChangeEvent::for_local_delete(ns(), Bson::Int32(1), true));
            let pending = config.last_uncommitted_change_event().expect("pending");
            assert_eq!(pending.operation, OperationType::Delete);
        }
    }

    #[test]
    fn staging_resumes_a_paused_document() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
        config.set_paused(true);
        config.stage_pending_write(1, insert_event(1));
        assert!(!config.is_paused());
    }

    #[test]
    fn committed_version_requires_same_writer_and_no_newer_counter() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(1));
        let version = DocumentVersion::fresh();
        config.set_pending_writes_complete(Some(version.clone()));

        let same = VersionInfo::from_version(Some(version.clone()));
        assert!(config.has_committed_version(&same));

        let newer = VersionInfo::from_version(Some(version.next()));
        assert!(!config.has_committed_version(&newer));

        let other_writer = VersionInfo::from_version(Some(DocumentVersion::fresh()));
        assert!(!config.has_committed_version(&other_writer));

        assert!(!config.has_committed_version(&VersionInfo::none()));
    }

    #[test]
    fn config_rows_round_trip() {
        let config = DocumentSyncConfig::new(ns(), Bson::Int32(9));
        config.stage_pending_write(4, insert_event(1));
        let row = config.to_row().expect("row");
        let back = DocumentSyncConfig::from_row(&row).expect("parse");
        assert_eq!(back.document_id(), &Bson::Int32(9));
        assert_eq!(back.namespace(), &ns());
        assert_eq!(back.last_resolution(), 4);
        assert!(back.has_uncommitted_writes());
    }

    #[test]
    fn stale_namespace_marks_every_document_stale() {
        let ns_config = NamespaceSyncConfig::new(ns());
        let mut docs = DocumentConfigMap::new();
        let (one, _) = add_and_get_config(&mut docs, &ns(), &Bson::Int32(1));
        let (two, _) = add_and_get_config(&mut docs, &ns(), &Bson::Int32(2));
        one.set_stale(false);
        two.set_stale(false);
        assert!(ns_config.stale_document_keys(&docs).is_empty());
        two.set_stale(true);
        assert_eq!(ns_config.stale_document_keys(&docs).len(), 1);
        ns_config.set_stale(true);
        assert_eq!(ns_config.stale_document_keys(&docs).len(), 2);
    }
}
