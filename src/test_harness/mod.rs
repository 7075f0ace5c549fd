//! Test support: a scripted fake remote service with controllable change
//! streams, toggleable network/auth monitors, and a ready-wired harness
//! around an in-memory local store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bson::{doc, Bson, Document};

use crate::config::EngineConfig;
use crate::core::{ChangeEvent, DocumentKey, Namespace};
use crate::remote::monitor::{
    AuthMonitor, AuthStateListener, NetworkMonitor, NetworkStateListener,
};
use crate::remote::{
    ChangeStream, ChangeStreamSender, RemoteClient, RemoteCollection, RemoteDeleteResult,
    RemoteError, RemoteErrorCode, RemoteUpdateResult, UpdateSpec,
};
use crate::store::memory::{apply_update, matches, MemoryCollection, MemoryStore};
use crate::sync::{
    ChangeEventListener, ConflictHandler, DataSynchronizer, ExceptionListener, HandlerError,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fake remote document service: map-backed collections plus broadcast
/// change streams fed by tests (or by its own writes).
#[derive(Default)]
pub struct FakeRemote {
    collections: Mutex<BTreeMap<Namespace, Arc<FakeRemoteCollection>>>,
    offline: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every remote call fail with `NetworkDown` until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn collection_handle(&self, namespace: &Namespace) -> Arc<FakeRemoteCollection> {
        let mut collections = lock(&self.collections);
        Arc::clone(
            collections
                .entry(namespace.clone())
                .or_insert_with(|| Arc::new(FakeRemoteCollection::new(namespace.clone()))),
        )
    }
}

impl RemoteClient for FakeRemote {
    fn collection(&self, namespace: &Namespace) -> Arc<dyn RemoteCollection> {
        self.collection_handle(namespace)
    }

    fn stream_function(&self, name: &str, args: Document) -> Result<ChangeStream, RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::NetworkDown);
        }
        if name != "watch" {
            return Err(RemoteError::Service {
                code: RemoteErrorCode::FunctionNotFound,
                message: format!("no such function: {name}"),
            });
        }
        let database = args
            .get_str("database")
            .map_err(|e| RemoteError::Decode(format!("watch args: {e}")))?;
        let collection = args
            .get_str("collection")
            .map_err(|e| RemoteError::Decode(format!("watch args: {e}")))?;
        let namespace = Namespace::new(database, collection);
        let (sender, stream) = ChangeStream::channel();
        lock(&self.collection_handle(&namespace).streams).push(sender);
        Ok(stream)
    }
}

/// Which remote operation a scripted failure applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemoteOp {
    Find,
    Insert,
    Update,
    Delete,
}

pub struct FakeRemoteCollection {
    namespace: Namespace,
    rows: RwLock<BTreeMap<DocumentKey, Document>>,
    streams: Mutex<Vec<ChangeStreamSender>>,
    failures: Mutex<BTreeMap<RemoteOp, RemoteError>>,
    pub insert_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub find_calls: AtomicUsize,
}

impl FakeRemoteCollection {
    fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            rows: RwLock::new(BTreeMap::new()),
            streams: Mutex::new(Vec::new()),
            failures: Mutex::new(BTreeMap::new()),
            insert_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Places a document directly, bypassing streams and counters — for
    /// arranging "someone else wrote this" scenarios.
    pub fn seed(&self, document: Document) {
        let Some(id) = document.get("_id").cloned() else {
            return;
        };
        self.write_rows()
            .insert(DocumentKey::new(id), document);
    }

    pub fn remove(&self, id: &Bson) {
        self.write_rows().remove(&DocumentKey::from(id));
    }

    pub fn document(&self, id: &Bson) -> Option<Document> {
        self.read_rows().get(&DocumentKey::from(id)).cloned()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.read_rows().values().cloned().collect()
    }

    /// Fails the next remote call of the given kind with the given error.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        lock(&self.failures).insert(op, error);
    }

    /// Pushes an event into every open change stream for this namespace.
    pub fn push_event(&self, event: ChangeEvent) {
        lock(&self.streams).retain(|stream| stream.is_open() && stream.send(event.clone()));
    }

    pub fn open_stream_count(&self) -> usize {
        let mut streams = lock(&self.streams);
        streams.retain(|stream| stream.is_open());
        streams.len()
    }

    fn take_failure(&self, op: RemoteOp) -> Option<RemoteError> {
        lock(&self.failures).remove(&op)
    }

    fn read_rows(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DocumentKey, Document>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rows(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DocumentKey, Document>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteCollection for FakeRemoteCollection {
    fn find(&self, filter: &Document) -> Result<Vec<Document>, RemoteError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure(RemoteOp::Find) {
            return Err(err);
        }
        Ok(self
            .read_rows()
            .values()
            .filter(|doc| matches(doc, filter))
            .cloned()
            .collect())
    }

    fn find_one(&self, filter: &Document) -> Result<Option<Document>, RemoteError> {
        self.find(filter).map(|docs| docs.into_iter().next())
    }

    fn insert_one(&self, document: &Document) -> Result<(), RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure(RemoteOp::Insert) {
            return Err(err);
        }
        let Some(id) = document.get("_id").cloned() else {
            return Err(RemoteError::Decode("insert without _id".into()));
        };
        let mut rows = self.write_rows();
        let key = DocumentKey::new(id.clone());
        if rows.contains_key(&key) {
            return Err(RemoteError::Service {
                code: RemoteErrorCode::MongodbError,
                message: format!("E11000 duplicate key error: _id: {id}"),
            });
        }
        rows.insert(key, document.clone());
        Ok(())
    }

    fn update_one(
        &self,
        filter: &Document,
        update: UpdateSpec,
    ) -> Result<RemoteUpdateResult, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure(RemoteOp::Update) {
            return Err(err);
        }
        let mut rows = self.write_rows();
        let found = rows
            .iter()
            .find(|(_, doc)| matches(doc, filter))
            .map(|(key, doc)| (key.clone(), doc.clone()));
        let Some((key, existing)) = found else {
            return Ok(RemoteUpdateResult::default());
        };
        let updated = match update {
            UpdateSpec::Replacement(mut replacement) => {
                if !replacement.contains_key("_id") {
                    if let Some(id) = existing.get("_id") {
                        replacement.insert("_id", id.clone());
                    }
                }
                replacement
            }
            UpdateSpec::Update(update) => apply_update(&existing, &update)
                .map_err(|e| RemoteError::Decode(e.to_string()))?,
        };
        rows.insert(key, updated);
        Ok(RemoteUpdateResult {
            matched_count: 1,
            upserted_id: None,
        })
    }

    fn delete_one(&self, filter: &Document) -> Result<RemoteDeleteResult, RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure(RemoteOp::Delete) {
            return Err(err);
        }
        let mut rows = self.write_rows();
        let found = rows
            .iter()
            .find(|(_, doc)| matches(doc, filter))
            .map(|(key, _)| key.clone());
        match found {
            Some(key) => {
                rows.remove(&key);
                Ok(RemoteDeleteResult { deleted_count: 1 })
            }
            None => Ok(RemoteDeleteResult::default()),
        }
    }
}

#[derive(Default)]
pub struct TestNetworkMonitor {
    connected: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn NetworkStateListener>>>,
}

impl TestNetworkMonitor {
    pub fn connected() -> Self {
        let monitor = Self::default();
        monitor.connected.store(true, Ordering::SeqCst);
        monitor
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_network_state_changed(connected);
        }
    }
}

impl NetworkMonitor for TestNetworkMonitor {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>) {
        lock(&self.listeners).push(listener);
    }

    fn remove_state_listener(&self, listener: &Arc<dyn NetworkStateListener>) {
        lock(&self.listeners).retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

#[derive(Default)]
pub struct TestAuthMonitor {
    logged_in: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn AuthStateListener>>>,
}

impl TestAuthMonitor {
    pub fn logged_in() -> Self {
        let monitor = Self::default();
        monitor.logged_in.store(true, Ordering::SeqCst);
        monitor
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_auth_state_changed(logged_in);
        }
    }
}

impl AuthMonitor for TestAuthMonitor {
    fn try_is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn add_state_listener(&self, listener: Arc<dyn AuthStateListener>) {
        lock(&self.listeners).push(listener);
    }

    fn remove_state_listener(&self, listener: &Arc<dyn AuthStateListener>) {
        lock(&self.listeners).retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

/// Captures per-document errors delivered to the exception listener.
#[derive(Default)]
pub struct ErrorCollector {
    errors: Mutex<Vec<(Bson, String)>>,
}

impl ErrorCollector {
    pub fn errors(&self) -> Vec<(Bson, String)> {
        lock(&self.errors).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.errors).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.errors).is_empty()
    }
}

impl ExceptionListener for ErrorCollector {
    fn on_error(&self, document_id: &Bson, error: &crate::error::Error) {
        lock(&self.errors).push((document_id.clone(), error.to_string()));
    }
}

/// Captures change events delivered to the namespace listener.
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<(Bson, ChangeEvent)>>,
}

impl EventCollector {
    pub fn events(&self) -> Vec<(Bson, ChangeEvent)> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }
}

impl ChangeEventListener for EventCollector {
    fn on_event(&self, document_id: &Bson, event: &ChangeEvent) {
        lock(&self.events).push((document_id.clone(), event.clone()));
    }
}

pub const TEST_INSTANCE_KEY: &str = "test";

/// A fully wired synchronizer over in-memory collaborators. The background
/// sync thread is disabled; tests drive passes via `do_sync_pass`.
pub struct SyncHarness {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<FakeRemote>,
    pub network: Arc<TestNetworkMonitor>,
    pub auth: Arc<TestAuthMonitor>,
    pub errors: Arc<ErrorCollector>,
    pub events: Arc<EventCollector>,
    pub sync: DataSynchronizer,
}

impl SyncHarness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let remote = Arc::new(FakeRemote::new());
        let network = Arc::new(TestNetworkMonitor::connected());
        let auth = Arc::new(TestAuthMonitor::logged_in());
        let sync = DataSynchronizer::new(
            EngineConfig::with_instance_key(TEST_INSTANCE_KEY),
            Arc::clone(&store) as Arc<dyn crate::store::LocalStore>,
            Arc::clone(&remote) as Arc<dyn RemoteClient>,
            Arc::clone(&network) as Arc<dyn NetworkMonitor>,
            Arc::clone(&auth) as Arc<dyn AuthMonitor>,
        );
        sync.disable_sync_thread();
        Self {
            store,
            remote,
            network,
            auth,
            errors: Arc::new(ErrorCollector::default()),
            events: Arc::new(EventCollector::default()),
            sync,
        }
    }

    /// Configures the namespace with a resolver that always takes the
    /// remote side.
    pub fn configure_remote_wins(&self, namespace: &Namespace) {
        self.configure(namespace, Arc::new(remote_wins));
    }

    /// Configures the namespace with a resolver that always keeps the
    /// local side.
    pub fn configure_local_wins(&self, namespace: &Namespace) {
        self.configure(namespace, Arc::new(local_wins));
    }

    pub fn configure(&self, namespace: &Namespace, handler: Arc<dyn ConflictHandler>) {
        self.sync
            .configure(
                namespace,
                handler,
                Some(Arc::clone(&self.events) as Arc<dyn ChangeEventListener>),
                Some(Arc::clone(&self.errors) as Arc<dyn ExceptionListener>),
            )
            .expect("configure namespace");
    }

    pub fn local_coll(&self, namespace: &Namespace) -> Arc<MemoryCollection> {
        self.store
            .memory_collection(&namespace.user_database(), namespace.collection())
    }

    pub fn undo_coll(&self, namespace: &Namespace) -> Arc<MemoryCollection> {
        self.store
            .memory_collection(&namespace.undo_database(), namespace.collection())
    }

    pub fn docs_coll(&self) -> Arc<MemoryCollection> {
        self.store
            .memory_collection(&format!("sync_config{TEST_INSTANCE_KEY}"), "documents")
    }

    pub fn remote_coll(&self, namespace: &Namespace) -> Arc<FakeRemoteCollection> {
        self.remote.collection_handle(namespace)
    }

    /// Waits for the namespace's change stream to come up.
    pub fn wait_for_stream_open(&self, namespace: &Namespace, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.sync.is_stream_open(namespace) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn remote_wins(
    _id: &Bson,
    _local: &ChangeEvent,
    remote: &ChangeEvent,
) -> Result<Option<Document>, HandlerError> {
    Ok(remote.full_document.clone())
}

fn local_wins(
    _id: &Bson,
    local: &ChangeEvent,
    _remote: &ChangeEvent,
) -> Result<Option<Document>, HandlerError> {
    Ok(local.full_document.clone())
}

/// Convenience for `doc!{"_id": id}`.
pub fn id_filter(id: i32) -> Document {
    doc! { "_id": id }
}
