//! The data synchronizer: lifecycle, the remote-to-local and
//! local-to-remote passes, and conflict resolution.
//!
//! Lock order within a pass is always (stream-buffer write, then namespace
//! config write); the control lock is never held across remote I/O. Listener
//! retriggering discovered mid-pass is deferred until the pass releases its
//! guards, since these locks are not reentrant.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};

use bson::{doc, Bson, Document};
use crossbeam::channel::Sender;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::{
    sanitize_document, with_version, ChangeEvent, DocumentKey, DocumentVersion, Namespace,
    OperationType, UpdateDescription, VersionInfo, DOCUMENT_VERSION_FIELD, SYNC_PROTOCOL_VERSION,
};
use crate::remote::dispatch::{DispatchGroup, EventDispatcher};
use crate::remote::monitor::{
    AuthMonitor, AuthStateListener, NetworkMonitor, NetworkStateListener,
};
use crate::remote::{RemoteClient, RemoteCollection, UpdateSpec};
use crate::store::{LocalCollection, LocalStore, WriteModel};

use super::batch::BatchOps;
use super::config::{
    DocumentConfigMap, DocumentSyncConfig, InstanceSyncConfig, NamespaceSyncConfig,
};
use super::handlers::{ChangeEventListener, ConflictHandler, ExceptionListener};
use super::listener::EventBuffer;
use super::pool::ListenerPool;
use super::runner::{self, RunnerMessage};
use super::{mutex_lock, read_lock, write_lock, SyncError};

pub(crate) struct Control {
    pub(crate) configured: bool,
    pub(crate) running: bool,
    pub(crate) sync_thread_enabled: bool,
    pub(crate) listeners_enabled: bool,
}

pub(crate) struct RunnerHandle {
    pub(crate) thread: Option<JoinHandle<()>>,
    pub(crate) wake: Option<Sender<RunnerMessage>>,
}

/// Blocks callers until background initialization (and recovery) completes.
pub(crate) struct InitGate {
    done: Mutex<bool>,
    cond: Condvar,
}

impl InitGate {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn begin(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub(crate) fn finish(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// How one remote change event is handled against a document config.
enum Disposition {
    /// The document saw a local write at this logical time; skip this pass.
    Deferred,
    /// Nothing to do (self-authored or stale event).
    Dropped,
    /// Apply the event to the local copy.
    Apply,
    /// Report the error and pause the document.
    Fail(SyncError),
    /// Report the error and stop synchronizing the document.
    Desync(SyncError),
    /// Run conflict resolution against this (possibly synthesized) event.
    Conflict(ChangeEvent),
}

pub(crate) struct Engine {
    pub(crate) weak_self: Weak<Engine>,
    pub(crate) config: EngineConfig,
    pub(crate) local: RwLock<Arc<dyn LocalStore>>,
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) network: Arc<dyn NetworkMonitor>,
    pub(crate) auth: Arc<dyn AuthMonitor>,
    pub(crate) sync_config: RwLock<Arc<InstanceSyncConfig>>,
    pub(crate) pool: ListenerPool,
    pub(crate) control: Mutex<Control>,
    /// Serializes sync passes without blocking control-plane operations.
    pub(crate) pass_gate: Mutex<()>,
    pub(crate) logical_t: AtomicI64,
    pub(crate) listeners_lock: Mutex<()>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) exception_listener: RwLock<Option<Arc<dyn ExceptionListener>>>,
    pub(crate) ongoing: DispatchGroup,
    pub(crate) init: InitGate,
    pub(crate) runner: Mutex<RunnerHandle>,
    network_listener: Mutex<Option<Arc<dyn NetworkStateListener>>>,
    auth_listener: Mutex<Option<Arc<dyn AuthStateListener>>>,
}

struct EngineNetworkListener {
    engine: Weak<Engine>,
}

impl NetworkStateListener for EngineNetworkListener {
    fn on_network_state_changed(&self, connected: bool) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if connected {
            engine.start();
            engine.wake_runner();
        } else {
            engine.stop();
        }
    }
}

struct EngineAuthListener {
    engine: Weak<Engine>,
}

impl AuthStateListener for EngineAuthListener {
    fn on_auth_state_changed(&self, logged_in: bool) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if logged_in {
            engine.start();
            engine.wake_runner();
        } else {
            engine.stop();
        }
    }
}

impl Engine {
    pub(crate) fn instance_config(&self) -> Arc<InstanceSyncConfig> {
        Arc::clone(&read_lock(&self.sync_config))
    }

    pub(crate) fn local_store(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&read_lock(&self.local))
    }

    pub(crate) fn local_collection(&self, namespace: &Namespace) -> Arc<dyn LocalCollection> {
        self.local_store()
            .collection(&namespace.user_database(), namespace.collection())
    }

    pub(crate) fn undo_collection(&self, namespace: &Namespace) -> Arc<dyn LocalCollection> {
        self.local_store()
            .collection(&namespace.undo_database(), namespace.collection())
    }

    pub(crate) fn docs_collection(&self) -> Arc<dyn LocalCollection> {
        self.instance_config().documents_collection(&self.local_store())
    }

    pub(crate) fn logical_time(&self) -> i64 {
        self.logical_t.load(Ordering::SeqCst)
    }

    pub(crate) fn wake_runner(&self) {
        if let Some(wake) = mutex_lock(&self.runner).wake.as_ref() {
            let _ = wake.send(RunnerMessage::Wake);
        }
    }

    pub(crate) fn wait_until_initialized(&self) {
        self.init.wait();
    }

    // ---- lifecycle ----

    pub(crate) fn initialize_and_recover(&self) {
        if let Err(err) = self.initialize() {
            error!(error = %err, "initialization failed");
        }
        if let Err(err) = self.recover() {
            error!(error = %err, "recovery failed; will retry on next start");
        }
        self.init.finish();
    }

    fn initialize(&self) -> Result<(), SyncError> {
        let store = self.local_store();
        let instance = Arc::new(InstanceSyncConfig::load(&self.config.instance_key, &store)?);
        self.pool.clear();
        for ns_config in instance.namespace_configs() {
            self.pool.add_namespace(ns_config);
        }
        *write_lock(&self.sync_config) = instance;
        Ok(())
    }

    pub(crate) fn configure(
        &self,
        namespace: &Namespace,
        conflict_handler: Arc<dyn ConflictHandler>,
        change_listener: Option<Arc<dyn ChangeEventListener>>,
        exception_listener: Option<Arc<dyn ExceptionListener>>,
    ) -> Result<(), SyncError> {
        self.wait_until_initialized();
        if let Some(listener) = exception_listener {
            *write_lock(&self.exception_listener) = Some(listener);
        }
        let ns_config = self.namespace_config_or_create(namespace)?;
        ns_config.configure(conflict_handler, change_listener);

        let newly_configured = {
            let mut control = mutex_lock(&self.control);
            if control.configured {
                false
            } else {
                control.configured = true;
                true
            }
        };
        if newly_configured {
            self.trigger_listening(namespace);
        }
        let running = mutex_lock(&self.control).running;
        if !running {
            self.start();
        }
        Ok(())
    }

    pub(crate) fn namespace_config_or_create(
        &self,
        namespace: &Namespace,
    ) -> Result<Arc<NamespaceSyncConfig>, SyncError> {
        let instance = self.instance_config();
        let store = self.local_store();
        let (config, created) = instance.namespace_config_or_create(namespace, &store)?;
        if created {
            self.pool.add_namespace(Arc::clone(&config));
        }
        Ok(config)
    }

    pub(crate) fn start(&self) {
        let mut control = mutex_lock(&self.control);
        if !control.configured {
            return;
        }
        self.pool.stop();
        if control.listeners_enabled {
            self.pool.start();
        }
        if control.sync_thread_enabled && !control.running {
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            let (thread, wake) = runner::spawn(&this);
            let mut runner = mutex_lock(&self.runner);
            runner.thread = thread;
            runner.wake = Some(wake);
            control.running = true;
        }
    }

    pub(crate) fn stop(&self) {
        let mut control = mutex_lock(&self.control);
        let (wake, thread) = {
            let mut runner = mutex_lock(&self.runner);
            (runner.wake.take(), runner.thread.take())
        };
        if thread.is_none() {
            return;
        }
        self.pool.stop();
        drop(wake);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        control.running = false;
    }

    pub(crate) fn close(&self) {
        self.wait_until_initialized();
        self.ongoing.block_and_wait();
        if let Some(listener) = mutex_lock(&self.network_listener).take() {
            self.network.remove_state_listener(&listener);
        }
        if let Some(listener) = mutex_lock(&self.auth_listener).take() {
            self.auth.remove_state_listener(&listener);
        }
        self.dispatcher.close();
        self.stop();
        // stop() is a no-op when no runner was ever started; the listeners
        // still need tearing down.
        self.pool.stop();
    }

    pub(crate) fn reinitialize(&self, local: Arc<dyn LocalStore>) {
        self.ongoing.block_and_wait();
        *write_lock(&self.local) = local;
        self.init.begin();
        let Some(this) = self.weak_self.upgrade() else {
            self.ongoing.unblock();
            return;
        };
        let spawned = thread::Builder::new()
            .name("sync-init".into())
            .spawn(move || {
                this.stop();
                this.initialize_and_recover();
                this.start();
                this.ongoing.unblock();
            });
        if spawned.is_err() {
            self.init.finish();
            self.ongoing.unblock();
        }
    }

    /// Reloads the persisted configuration, dropping in-memory settings
    /// (handlers, listener registrations) on the floor.
    pub(crate) fn wipe_in_memory_settings(&self) {
        self.wait_until_initialized();
        {
            let mut control = mutex_lock(&self.control);
            control.configured = false;
        }
        self.stop();
        if let Err(err) = self.initialize() {
            error!(error = %err, "wipe failed to reload configuration");
        }
    }

    pub(crate) fn ensure_listeners_started(&self) {
        let Ok(control) = self.control.try_lock() else {
            return;
        };
        if control.configured && control.listeners_enabled {
            self.pool.start();
        }
    }

    /// Restarts (or retires) the stream for a namespace after its id set
    /// changed. Skipped when the control plane is busy; the periodic runner
    /// re-arms listeners after every pass.
    pub(crate) fn trigger_listening(&self, namespace: &Namespace) {
        let Ok(control) = self.control.try_lock() else {
            return;
        };
        let instance = self.instance_config();
        let Some(ns_config) = instance.namespace_config(namespace) else {
            return;
        };
        if ns_config.synchronized_document_ids().is_empty() {
            self.pool.remove_namespace(namespace);
            return;
        }
        if !ns_config.is_configured() {
            return;
        }
        self.pool.add_namespace(Arc::clone(&ns_config));
        self.pool.stop_namespace(namespace);
        if control.listeners_enabled {
            self.pool.start_namespace(namespace);
        }
    }

    // ---- the sync pass ----

    pub(crate) fn do_sync_pass(&self) -> bool {
        match self.control.try_lock() {
            Ok(control) => {
                if !control.configured {
                    return false;
                }
            }
            Err(_) => return false,
        }
        let Ok(_pass) = self.pass_gate.try_lock() else {
            return false;
        };

        let previous = self.logical_t.load(Ordering::SeqCst);
        let t = if previous == i64::MAX {
            info!("reached max logical time; resetting back to 0");
            1
        } else {
            previous + 1
        };
        self.logical_t.store(t, Ordering::SeqCst);

        info!(t, "sync pass start");
        if !self.network.is_connected() {
            info!(t, "sync pass end, network disconnected");
            return false;
        }
        if !self.auth.try_is_logged_in() {
            info!(t, "sync pass end, logged out");
            return false;
        }

        let result = self
            .sync_remote_to_local(t)
            .and_then(|()| self.sync_local_to_remote(t));
        match result {
            Ok(()) => {
                info!(t, "sync pass end");
                true
            }
            Err(err) if err.aborts_pass() => {
                info!(t, error = %err, "sync pass aborted");
                false
            }
            Err(err) => {
                error!(t, error = %err, "sync pass failed");
                false
            }
        }
    }

    /// Remote-to-local: drain buffered stream events and catch up stale ids
    /// with full-document lookups, reconciling each against the document
    /// config.
    fn sync_remote_to_local(&self, t: i64) -> Result<(), SyncError> {
        debug!(t, "remote-to-local start");
        let instance = self.instance_config();
        let mut retrigger = BTreeSet::new();
        let mut outcome = Ok(());

        for ns_config in instance.namespace_configs() {
            let namespace = ns_config.namespace().clone();
            let stream_lock = self.pool.lock_for_namespace(&namespace);
            let mut buffer = write_lock(&stream_lock);
            let mut docs = write_lock(ns_config.docs());
            let result =
                self.r2l_namespace(t, &instance, &ns_config, &mut buffer, &mut docs, &mut retrigger);
            drop(docs);
            drop(buffer);
            if let Err(err) = result {
                outcome = Err(err);
                break;
            }
        }

        for namespace in retrigger {
            self.trigger_listening(&namespace);
        }
        debug!(t, "remote-to-local end");
        outcome
    }

    fn r2l_namespace(
        &self,
        t: i64,
        instance: &Arc<InstanceSyncConfig>,
        ns_config: &Arc<NamespaceSyncConfig>,
        buffer: &mut EventBuffer,
        docs: &mut DocumentConfigMap,
        retrigger: &mut BTreeSet<Namespace>,
    ) -> Result<(), SyncError> {
        let namespace = ns_config.namespace().clone();
        let store = self.local_store();
        let local_coll = store.collection(&namespace.user_database(), namespace.collection());
        let undo_coll = store.collection(&namespace.undo_database(), namespace.collection());
        let docs_coll = instance.documents_collection(&store);
        let remote_coll = self.remote.collection(&namespace);

        let events = buffer.take_all();
        let mut unseen = ns_config.stale_document_keys(docs);
        let latest_from_stale: Vec<Document> = if unseen.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<Bson> = unseen.iter().map(|key| key.value().clone()).collect();
            remote_coll.find(&doc! { "_id": { "$in": ids } })?
        };

        let mut batch = BatchOps::new();
        let mut ids_from_events: BTreeSet<DocumentKey> = BTreeSet::new();

        for (key, event) in events {
            debug!(
                t,
                ns = %namespace,
                op = event.operation.as_str(),
                "remote-to-local consuming event"
            );
            let Some(config) = docs.get(&key).map(Arc::clone) else {
                continue;
            };
            if config.is_paused() {
                continue;
            }
            unseen.remove(&key);
            ids_from_events.insert(key);
            self.apply_remote_event(
                t, ns_config, docs, &docs_coll, &remote_coll, &config, event, &mut batch, retrigger,
            )?;
            self.maybe_commit(&mut batch, &*local_coll, &*undo_coll, &*docs_coll)?;
        }

        // Stale ids with a current remote copy: synthesize a replace.
        for latest in latest_from_stale {
            let Some(id) = latest.get("_id").cloned() else {
                continue;
            };
            let key = DocumentKey::new(id.clone());
            if ids_from_events.contains(&key) {
                continue;
            }
            unseen.remove(&key);
            let Some(config) = docs.get(&key).map(Arc::clone) else {
                continue;
            };
            if config.is_paused() {
                continue;
            }
            let event = ChangeEvent::for_local_replace(namespace.clone(), id, latest, false);
            self.apply_remote_event(
                t, ns_config, docs, &docs_coll, &remote_coll, &config, event, &mut batch, retrigger,
            )?;
            config.set_stale(false);
            self.maybe_commit(&mut batch, &*local_coll, &*undo_coll, &*docs_coll)?;
        }

        // Stale ids with no remote copy left: synthesize a delete, unless we
        // never saw a committed version for the document (first-time sync).
        for key in std::mem::take(&mut unseen) {
            let Some(config) = docs.get(&key).map(Arc::clone) else {
                continue;
            };
            if config.last_known_remote_version().is_none() || config.is_paused() {
                config.set_stale(false);
                continue;
            }
            let event = ChangeEvent::for_local_delete(
                namespace.clone(),
                key.value().clone(),
                config.has_uncommitted_writes(),
            );
            self.apply_remote_event(
                t, ns_config, docs, &docs_coll, &remote_coll, &config, event, &mut batch, retrigger,
            )?;
            config.set_stale(false);
            self.maybe_commit(&mut batch, &*local_coll, &*undo_coll, &*docs_coll)?;
        }

        batch.commit(&*local_coll, &*undo_coll, &*docs_coll)?;
        ns_config.set_stale(false);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_remote_event(
        &self,
        t: i64,
        ns_config: &Arc<NamespaceSyncConfig>,
        docs: &mut DocumentConfigMap,
        docs_coll: &Arc<dyn LocalCollection>,
        remote_coll: &Arc<dyn RemoteCollection>,
        config: &Arc<DocumentSyncConfig>,
        event: ChangeEvent,
        batch: &mut BatchOps,
        retrigger: &mut BTreeSet<Namespace>,
    ) -> Result<(), SyncError> {
        match self.classify_remote_event(t, config, &event, remote_coll)? {
            Disposition::Deferred => {
                debug!(
                    t,
                    ns = %ns_config.namespace(),
                    document_id = ?config.document_id(),
                    "have writes from current pass; waiting until next pass"
                );
            }
            Disposition::Dropped => {}
            Disposition::Fail(err) => {
                self.emit_error(config, docs_coll, err);
            }
            Disposition::Desync(err) => {
                self.emit_error(config, docs_coll, err);
                self.desync_in_pass(docs, config, batch, retrigger);
            }
            Disposition::Apply => match &event.operation {
                OperationType::Insert | OperationType::Update | OperationType::Replace => {
                    let full = event.full_document.clone().ok_or(SyncError::Invariant(
                        "non-delete remote event without a full document",
                    ))?;
                    let at_version = match VersionInfo::from_remote_document(Some(&full)) {
                        Ok(info) => info.into_version(),
                        Err(err) => {
                            self.emit_error(config, docs_coll, err.into());
                            self.desync_in_pass(docs, config, batch, retrigger);
                            return Ok(());
                        }
                    };
                    debug!(
                        t,
                        ns = %ns_config.namespace(),
                        document_id = ?config.document_id(),
                        "replacing local with remote document, no local pending writes"
                    );
                    self.apply_committed_replace(
                        ns_config,
                        config,
                        sanitize_document(&full),
                        at_version,
                        batch,
                    )?;
                }
                OperationType::Delete => {
                    debug!(
                        t,
                        ns = %ns_config.namespace(),
                        document_id = ?config.document_id(),
                        "deleting local, no local pending writes"
                    );
                    self.delete_from_remote(ns_config, docs, config, batch, retrigger);
                }
                OperationType::Unknown(_) => {
                    return Err(SyncError::Invariant(
                        "unknown operation classified as applicable",
                    ));
                }
            },
            Disposition::Conflict(remote_event) => {
                self.resolve_conflict(
                    t,
                    ns_config,
                    docs,
                    docs_coll,
                    config,
                    remote_event,
                    batch,
                    retrigger,
                )?;
            }
        }
        Ok(())
    }

    /// The remote-to-local decision tree: defer, drop, apply, fail, desync
    /// or raise a conflict.
    fn classify_remote_event(
        &self,
        t: i64,
        config: &Arc<DocumentSyncConfig>,
        event: &ChangeEvent,
        remote_coll: &Arc<dyn RemoteCollection>,
    ) -> Result<Disposition, SyncError> {
        if config.has_uncommitted_writes() && config.last_resolution() == t {
            return Ok(Disposition::Deferred);
        }

        let remote_version = match VersionInfo::from_remote_document(event.full_document.as_ref())
        {
            Ok(info) => info,
            Err(err) => return Ok(Disposition::Desync(err.into())),
        };
        if let Some(version) = remote_version.version() {
            if version.sync_protocol_version != SYNC_PROTOCOL_VERSION {
                return Ok(Disposition::Desync(SyncError::UnsupportedProtocolVersion(
                    version.sync_protocol_version,
                )));
            }
        }

        if config.has_committed_version(&remote_version) {
            debug!(
                t,
                document_id = ?config.document_id(),
                "remote change event was generated by us; dropping"
            );
            return Ok(Disposition::Dropped);
        }

        if config.last_uncommitted_change_event().is_none() {
            return Ok(match &event.operation {
                OperationType::Insert
                | OperationType::Update
                | OperationType::Replace
                | OperationType::Delete => Disposition::Apply,
                OperationType::Unknown(name) => {
                    Disposition::Fail(SyncError::UnknownOperationType(name.clone()))
                }
            });
        }

        // A write is pending: drop if provably stale, otherwise conflict.
        let local_version = config.version_info();
        let (Some(local), Some(remote)) = (local_version.version(), remote_version.version())
        else {
            // The absence of a version is effectively a version; a versionless
            // side with a pending write always conflicts.
            debug!(
                t,
                document_id = ?config.document_id(),
                "remote or local version empty with a write pending; raising conflict"
            );
            return Ok(Disposition::Conflict(event.clone()));
        };

        if local.instance_id == remote.instance_id {
            return if remote.version_counter <= local.version_counter {
                debug!(t, document_id = ?config.document_id(), "remote change event is stale; dropping");
                Ok(Disposition::Dropped)
            } else {
                debug!(
                    t,
                    document_id = ?config.document_id(),
                    "remote event has a higher counter with a write pending; raising conflict"
                );
                Ok(Disposition::Conflict(event.clone()))
            };
        }

        // Different writers: the stream may be behind, so consult the newest
        // remote copy before deciding.
        let namespace = config.namespace().clone();
        let document_id = config.document_id().clone();
        let newest = remote_coll.find_one(&doc! { "_id": document_id.clone() })?;
        match newest {
            None => {
                debug!(
                    t,
                    document_id = ?config.document_id(),
                    "latest lookup indicates a remote delete with a write pending; raising conflict"
                );
                Ok(Disposition::Conflict(ChangeEvent::for_local_delete(
                    namespace,
                    document_id,
                    config.has_uncommitted_writes(),
                )))
            }
            Some(newest_doc) => {
                let newest_version = match VersionInfo::from_remote_document(Some(&newest_doc)) {
                    Ok(info) => info,
                    Err(err) => return Ok(Disposition::Desync(err.into())),
                };
                if newest_version
                    .version()
                    .is_some_and(|v| v.instance_id == local.instance_id)
                {
                    debug!(
                        t,
                        document_id = ?config.document_id(),
                        "latest lookup indicates a stale stream event; dropping"
                    );
                    Ok(Disposition::Dropped)
                } else {
                    debug!(
                        t,
                        document_id = ?config.document_id(),
                        "latest lookup indicates a remote replace with a write pending; raising conflict"
                    );
                    Ok(Disposition::Conflict(ChangeEvent::for_local_replace(
                        namespace,
                        document_id,
                        newest_doc,
                        config.has_uncommitted_writes(),
                    )))
                }
            }
        }
    }

    /// Local-to-remote: push every pending write, detecting conflicts via
    /// versioned filters and duplicate keys.
    fn sync_local_to_remote(&self, t: i64) -> Result<(), SyncError> {
        debug!(t, "local-to-remote start");
        let instance = self.instance_config();
        let mut retrigger = BTreeSet::new();
        let mut outcome = Ok(());

        for ns_config in instance.namespace_configs() {
            let namespace = ns_config.namespace().clone();
            let stream_lock = self.pool.lock_for_namespace(&namespace);
            let mut buffer = write_lock(&stream_lock);
            let mut docs = write_lock(ns_config.docs());
            let result =
                self.l2r_namespace(t, &instance, &ns_config, &mut buffer, &mut docs, &mut retrigger);
            drop(docs);
            drop(buffer);
            if let Err(err) = result {
                outcome = Err(err);
                break;
            }
        }

        for namespace in retrigger {
            self.trigger_listening(&namespace);
        }
        debug!(t, "local-to-remote end");
        outcome
    }

    fn l2r_namespace(
        &self,
        t: i64,
        instance: &Arc<InstanceSyncConfig>,
        ns_config: &Arc<NamespaceSyncConfig>,
        buffer: &mut EventBuffer,
        docs: &mut DocumentConfigMap,
        retrigger: &mut BTreeSet<Namespace>,
    ) -> Result<(), SyncError> {
        let namespace = ns_config.namespace().clone();
        let store = self.local_store();
        let local_coll = store.collection(&namespace.user_database(), namespace.collection());
        let undo_coll = store.collection(&namespace.undo_database(), namespace.collection());
        let docs_coll = instance.documents_collection(&store);
        let remote_coll = self.remote.collection(&namespace);

        let mut batch = BatchOps::new();
        let configs: Vec<Arc<DocumentSyncConfig>> = docs.values().cloned().collect();

        for config in configs {
            if !config.has_uncommitted_writes() || config.is_paused() {
                continue;
            }
            if config.last_resolution() == t {
                debug!(
                    t,
                    ns = %namespace,
                    document_id = ?config.document_id(),
                    "has writes from current pass; waiting until next pass"
                );
                continue;
            }
            let Some(local_event) = config.last_uncommitted_change_event() else {
                continue;
            };
            let document_id = config.document_id().clone();
            let id_filter = doc! { "_id": document_id.clone() };
            debug!(
                t,
                ns = %namespace,
                document_id = ?document_id,
                op = local_event.operation.as_str(),
                "processing local operation"
            );

            let mut conflicted = false;

            // An unprocessed remote event we did not author is a conflict.
            if let Some(unprocessed) = buffer.take(&config.key()) {
                match VersionInfo::from_remote_document(unprocessed.full_document.as_ref()) {
                    Err(err) => {
                        self.emit_error(&config, &docs_coll, err.into());
                        self.desync_in_pass(docs, &config, &mut batch, retrigger);
                        continue;
                    }
                    Ok(version) => {
                        if !config.has_committed_version(&version) {
                            debug!(
                                t,
                                document_id = ?document_id,
                                "version differs on unprocessed change event; raising conflict"
                            );
                            conflicted = true;
                        }
                    }
                }
            }

            let local_version = config.version_info();
            let mut next_version: Option<DocumentVersion> = None;
            // The delete arm looks the remote document up; remember it so
            // conflict synthesis does not fetch twice.
            let mut fetched_remote: Option<Option<Document>> = None;

            if !conflicted {
                match &local_event.operation {
                    OperationType::Insert => {
                        let Some(local_doc) = &local_event.full_document else {
                            self.emit_error(
                                &config,
                                &docs_coll,
                                SyncError::Invariant("insert event without a full document"),
                            );
                            continue;
                        };
                        let version = DocumentVersion::fresh();
                        match remote_coll.insert_one(&with_version(local_doc, &version)) {
                            Ok(()) => next_version = Some(version),
                            Err(err) if err.is_duplicate_key() => {
                                debug!(
                                    t,
                                    document_id = ?document_id,
                                    "duplicate key on insert; raising conflict"
                                );
                                conflicted = true;
                            }
                            Err(err) if err.aborts_pass() => return Err(err.into()),
                            Err(err) => {
                                self.emit_error(&config, &docs_coll, err.into());
                                continue;
                            }
                        }
                    }
                    OperationType::Replace => {
                        let Some(local_doc) = &local_event.full_document else {
                            self.emit_error(
                                &config,
                                &docs_coll,
                                SyncError::Invariant("replace event without a full document"),
                            );
                            continue;
                        };
                        let version = local_version.next_version();
                        let filter = local_version.versioned_filter(&document_id);
                        match remote_coll
                            .update_one(&filter, UpdateSpec::Replacement(with_version(local_doc, &version)))
                        {
                            Ok(result) if result.matched_count == 0 => {
                                debug!(
                                    t,
                                    document_id = ?document_id,
                                    "version differs on replaced document or document deleted; raising conflict"
                                );
                                conflicted = true;
                            }
                            Ok(_) => next_version = Some(version),
                            Err(err) if err.aborts_pass() => return Err(err.into()),
                            Err(err) => {
                                self.emit_error(&config, &docs_coll, err.into());
                                continue;
                            }
                        }
                    }
                    OperationType::Update => {
                        let Some(description) = &local_event.update_description else {
                            self.emit_error(
                                &config,
                                &docs_coll,
                                SyncError::Invariant("update event without a description"),
                            );
                            continue;
                        };
                        if description.is_empty() {
                            // A no-op update would bump the version for
                            // nothing; drop it without touching the remote.
                            debug!(
                                t,
                                document_id = ?document_id,
                                "empty update description; dropping event"
                            );
                            continue;
                        }
                        let version = local_version.next_version();
                        let mut update = description.to_update_document();
                        let mut sets = update.get_document("$set").cloned().unwrap_or_default();
                        sets.insert(DOCUMENT_VERSION_FIELD, version.to_document());
                        update.insert("$set", sets);
                        let filter = local_version.versioned_filter(&document_id);
                        match remote_coll.update_one(&filter, UpdateSpec::Update(update)) {
                            Ok(result) if result.matched_count == 0 => {
                                debug!(
                                    t,
                                    document_id = ?document_id,
                                    "version differs on updated document or document deleted; raising conflict"
                                );
                                conflicted = true;
                            }
                            Ok(_) => next_version = Some(version),
                            Err(err) if err.aborts_pass() => return Err(err.into()),
                            Err(err) => {
                                self.emit_error(&config, &docs_coll, err.into());
                                continue;
                            }
                        }
                    }
                    OperationType::Delete => {
                        let filter = local_version.versioned_filter(&document_id);
                        match remote_coll.delete_one(&filter) {
                            Ok(result) if result.deleted_count == 0 => {
                                let newest = match remote_coll.find_one(&id_filter) {
                                    Ok(doc) => doc,
                                    Err(err) if err.aborts_pass() => return Err(err.into()),
                                    Err(err) => {
                                        self.emit_error(&config, &docs_coll, err.into());
                                        continue;
                                    }
                                };
                                fetched_remote = Some(newest.clone());
                                if newest.is_some() {
                                    debug!(
                                        t,
                                        document_id = ?document_id,
                                        "version differs on removed document; raising conflict"
                                    );
                                    conflicted = true;
                                } else {
                                    self.desync_in_pass(docs, &config, &mut batch, retrigger);
                                    batch.touch(&document_id);
                                }
                            }
                            Ok(_) => {
                                self.desync_in_pass(docs, &config, &mut batch, retrigger);
                                batch.touch(&document_id);
                            }
                            Err(err) if err.aborts_pass() => return Err(err.into()),
                            Err(err) => {
                                self.emit_error(&config, &docs_coll, err.into());
                                continue;
                            }
                        }
                    }
                    OperationType::Unknown(name) => {
                        self.emit_error(
                            &config,
                            &docs_coll,
                            SyncError::UnknownOperationType(name.clone()),
                        );
                        continue;
                    }
                }
            }

            if !conflicted {
                let committed = local_event.with_committed_writes();
                self.emit_event(ns_config, &committed);
                config.set_pending_writes_complete(next_version);
                if committed.operation != OperationType::Delete {
                    batch.push_config(WriteModel::ReplaceOne {
                        filter: config.write_filter(),
                        replacement: config.to_row()?,
                        upsert: true,
                    });
                }
            } else {
                let remote_event = match fetched_remote {
                    Some(newest) => synthesized_remote_event(&namespace, &document_id, newest),
                    None => {
                        let newest = match remote_coll.find_one(&id_filter) {
                            Ok(doc) => doc,
                            Err(err) if err.aborts_pass() => return Err(err.into()),
                            Err(err) => {
                                self.emit_error(&config, &docs_coll, err.into());
                                continue;
                            }
                        };
                        synthesized_remote_event(&namespace, &document_id, newest)
                    }
                };
                self.resolve_conflict(
                    t,
                    ns_config,
                    docs,
                    &docs_coll,
                    &config,
                    remote_event,
                    &mut batch,
                    retrigger,
                )?;
            }
            self.maybe_commit(&mut batch, &*local_coll, &*undo_coll, &*docs_coll)?;
        }

        batch.commit(&*local_coll, &*undo_coll, &*docs_coll)?;
        Ok(())
    }

    // ---- conflict resolution ----

    /// Resolves a conflict between a pending local write and a remote event
    /// via the namespace's conflict handler.
    #[allow(clippy::too_many_arguments)]
    fn resolve_conflict(
        &self,
        t: i64,
        ns_config: &Arc<NamespaceSyncConfig>,
        docs: &mut DocumentConfigMap,
        docs_coll: &Arc<dyn LocalCollection>,
        config: &Arc<DocumentSyncConfig>,
        remote_event: ChangeEvent,
        batch: &mut BatchOps,
        retrigger: &mut BTreeSet<Namespace>,
    ) -> Result<(), SyncError> {
        let namespace = ns_config.namespace().clone();
        let Some(handler) = ns_config.conflict_handler() else {
            warn!(
                t,
                ns = %namespace,
                document_id = ?config.document_id(),
                "no conflict resolver set; cannot resolve yet"
            );
            return Ok(());
        };
        let Some(local_event) = config.last_uncommitted_change_event() else {
            return Err(SyncError::Invariant("conflict raised without a pending write"));
        };
        debug!(
            t,
            ns = %namespace,
            document_id = ?config.document_id(),
            local_op = local_event.operation.as_str(),
            remote_op = remote_event.operation.as_str(),
            "resolving conflict"
        );

        let local_user = local_event.for_user();
        let remote_user = remote_event.for_user();
        let resolution = match handler.resolve(config.document_id(), &local_user, &remote_user) {
            Ok(resolution) => resolution,
            Err(err) => {
                self.emit_error(config, docs_coll, SyncError::Handler(err.to_string()));
                return Ok(());
            }
        };

        let remote_version = if remote_event.operation == OperationType::Delete {
            // A remote delete carries no version. The document may be
            // reinserted versionless before we commit; that surfaces as a
            // later conflict.
            None
        } else {
            match VersionInfo::from_remote_document(remote_event.full_document.as_ref()) {
                Ok(info) => info.into_version(),
                Err(err) => {
                    self.emit_error(config, docs_coll, err.into());
                    self.desync_in_pass(docs, config, batch, retrigger);
                    return Ok(());
                }
            }
        };

        let accept_remote = match (&remote_user.full_document, &resolution) {
            (None, None) => true,
            (Some(remote_doc), Some(resolved)) => remote_doc == resolved,
            _ => false,
        };

        match resolution {
            None => {
                debug!(
                    t,
                    ns = %namespace,
                    document_id = ?config.document_id(),
                    accept_remote,
                    "conflict resolved to delete"
                );
                if accept_remote {
                    self.delete_from_remote(ns_config, docs, config, batch, retrigger);
                } else {
                    self.delete_from_resolution(t, ns_config, config, remote_version, batch)?;
                }
            }
            Some(mut resolved) => {
                if !resolved.contains_key("_id") {
                    if let Some(id) = remote_event.document_key.get("_id") {
                        resolved.insert("_id", id.clone());
                    }
                }
                let doc_for_storage = sanitize_document(&resolved);
                debug!(
                    t,
                    ns = %namespace,
                    document_id = ?config.document_id(),
                    accept_remote,
                    "conflict resolved to replacement"
                );
                if accept_remote {
                    self.apply_committed_replace(
                        ns_config,
                        config,
                        doc_for_storage,
                        remote_version,
                        batch,
                    )?;
                } else {
                    self.update_from_resolution(
                        t,
                        ns_config,
                        config,
                        doc_for_storage,
                        remote_version,
                        &remote_event,
                        batch,
                    )?;
                }
            }
        }
        Ok(())
    }

    // ---- batched write helpers ----

    /// Local replace-or-upsert with pending writes cleared; the remote side
    /// already holds (or authored) this state.
    fn apply_committed_replace(
        &self,
        ns_config: &Arc<NamespaceSyncConfig>,
        config: &Arc<DocumentSyncConfig>,
        doc_for_storage: Document,
        at_version: Option<DocumentVersion>,
        batch: &mut BatchOps,
    ) -> Result<(), SyncError> {
        let document_id = config.document_id().clone();
        config.set_pending_writes_complete(at_version);
        let event = ChangeEvent::for_local_replace(
            ns_config.namespace().clone(),
            document_id.clone(),
            doc_for_storage.clone(),
            false,
        );
        self.emit_event(ns_config, &event);
        batch.push_config(WriteModel::ReplaceOne {
            filter: config.write_filter(),
            replacement: config.to_row()?,
            upsert: true,
        });
        batch.push_local(WriteModel::ReplaceOne {
            filter: doc! { "_id": document_id.clone() },
            replacement: doc_for_storage,
            upsert: true,
        });
        batch.touch(&document_id);
        Ok(())
    }

    /// Local replace with pending writes retained; the resolution still has
    /// to be pushed remotely on a later pass.
    #[allow(clippy::too_many_arguments)]
    fn update_from_resolution(
        &self,
        t: i64,
        ns_config: &Arc<NamespaceSyncConfig>,
        config: &Arc<DocumentSyncConfig>,
        doc_for_storage: Document,
        at_version: Option<DocumentVersion>,
        remote_event: &ChangeEvent,
        batch: &mut BatchOps,
    ) -> Result<(), SyncError> {
        let namespace = ns_config.namespace().clone();
        let document_id = config.document_id().clone();
        let event = if remote_event.operation == OperationType::Delete {
            // The remote side no longer has the document; it will be
            // re-created by the pending write.
            ChangeEvent::for_local_insert(namespace, doc_for_storage.clone(), true)
        } else {
            let base = remote_event
                .full_document
                .as_ref()
                .map(sanitize_document)
                .unwrap_or_default();
            ChangeEvent::for_local_update(
                namespace,
                document_id.clone(),
                UpdateDescription::diff(&base, &doc_for_storage),
                doc_for_storage.clone(),
                true,
            )
        };
        config.set_pending_write_resolved(t, at_version, event.clone());
        self.emit_event(ns_config, &event);
        batch.push_config(WriteModel::ReplaceOne {
            filter: config.write_filter(),
            replacement: config.to_row()?,
            upsert: true,
        });
        batch.push_local(WriteModel::ReplaceOne {
            filter: doc! { "_id": document_id.clone() },
            replacement: doc_for_storage,
            upsert: true,
        });
        batch.touch(&document_id);
        Ok(())
    }

    /// Local delete with a pending delete retained against the acknowledged
    /// remote version.
    fn delete_from_resolution(
        &self,
        t: i64,
        ns_config: &Arc<NamespaceSyncConfig>,
        config: &Arc<DocumentSyncConfig>,
        at_version: Option<DocumentVersion>,
        batch: &mut BatchOps,
    ) -> Result<(), SyncError> {
        let document_id = config.document_id().clone();
        let event = ChangeEvent::for_local_delete(
            ns_config.namespace().clone(),
            document_id.clone(),
            true,
        );
        config.set_pending_write_resolved(t, at_version, event.clone());
        self.emit_event(ns_config, &event);
        batch.push_config(WriteModel::ReplaceOne {
            filter: config.write_filter(),
            replacement: config.to_row()?,
            upsert: true,
        });
        batch.push_local(WriteModel::DeleteOne {
            filter: doc! { "_id": document_id.clone() },
        });
        batch.touch(&document_id);
        Ok(())
    }

    /// Local delete plus desync: the remote deletion is authoritative.
    fn delete_from_remote(
        &self,
        ns_config: &Arc<NamespaceSyncConfig>,
        docs: &mut DocumentConfigMap,
        config: &Arc<DocumentSyncConfig>,
        batch: &mut BatchOps,
        retrigger: &mut BTreeSet<Namespace>,
    ) {
        let document_id = config.document_id().clone();
        self.desync_in_pass(docs, config, batch, retrigger);
        batch.push_local(WriteModel::DeleteOne {
            filter: doc! { "_id": document_id.clone() },
        });
        batch.touch(&document_id);
        let event =
            ChangeEvent::for_local_delete(ns_config.namespace().clone(), document_id, false);
        self.emit_event(ns_config, &event);
    }

    /// Removes the document config (in the held map guard and, via the
    /// batch, its persisted row). The local document itself is left alone;
    /// the recovery orphan sweep reclaims it.
    pub(crate) fn desync_in_pass(
        &self,
        docs: &mut DocumentConfigMap,
        config: &Arc<DocumentSyncConfig>,
        batch: &mut BatchOps,
        retrigger: &mut BTreeSet<Namespace>,
    ) {
        docs.remove(&config.key());
        batch.push_config(WriteModel::DeleteOne {
            filter: config.write_filter(),
        });
        retrigger.insert(config.namespace().clone());
    }

    fn maybe_commit(
        &self,
        batch: &mut BatchOps,
        local_coll: &dyn LocalCollection,
        undo_coll: &dyn LocalCollection,
        docs_coll: &dyn LocalCollection,
    ) -> Result<(), SyncError> {
        if batch.size() >= self.config.max_batch_bytes {
            batch.commit(local_coll, undo_coll, docs_coll)?;
        }
        Ok(())
    }

    // ---- emission ----

    pub(crate) fn emit_event(&self, ns_config: &NamespaceSyncConfig, event: &ChangeEvent) {
        let _serialized = mutex_lock(&self.listeners_lock);
        let Some(listener) = ns_config.change_listener() else {
            return;
        };
        let Some(document_id) = event.document_id().cloned() else {
            return;
        };
        let user_event = event.for_user();
        self.dispatcher
            .dispatch(move || listener.on_event(&document_id, &user_event));
    }

    /// Reports a per-document error to the exception listener and freezes
    /// the document.
    pub(crate) fn emit_error(
        &self,
        config: &Arc<DocumentSyncConfig>,
        docs_coll: &Arc<dyn LocalCollection>,
        err: SyncError,
    ) {
        let error = crate::error::Error::from(err);
        error!(
            ns = %config.namespace(),
            document_id = ?config.document_id(),
            error = %error,
            "pausing document"
        );
        config.set_paused(true);
        if let Err(persist_err) = self.persist_doc_config(&**docs_coll, config) {
            warn!(error = %persist_err, "failed to persist paused document config");
        }
        let listener = read_lock(&self.exception_listener).clone();
        if let Some(listener) = listener {
            let document_id = config.document_id().clone();
            self.dispatcher
                .dispatch(move || listener.on_error(&document_id, &error));
        }
    }

    pub(crate) fn persist_doc_config(
        &self,
        docs_coll: &dyn LocalCollection,
        config: &DocumentSyncConfig,
    ) -> Result<(), SyncError> {
        let row = config.to_row()?;
        docs_coll.find_one_and_replace(&config.write_filter(), &row, true)?;
        Ok(())
    }
}

fn synthesized_remote_event(
    namespace: &Namespace,
    document_id: &Bson,
    newest: Option<Document>,
) -> ChangeEvent {
    match newest {
        None => ChangeEvent::for_local_delete(namespace.clone(), document_id.clone(), false),
        Some(doc) => {
            ChangeEvent::for_local_replace(namespace.clone(), document_id.clone(), doc, false)
        }
    }
}

/// The user-facing synchronizer handle. Construction kicks off background
/// initialization and crash recovery; `wait_until_initialized` (called by
/// every public operation) blocks until both finish.
pub struct DataSynchronizer {
    engine: Arc<Engine>,
}

impl DataSynchronizer {
    pub fn new(
        config: EngineConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        network: Arc<dyn NetworkMonitor>,
        auth: Arc<dyn AuthMonitor>,
    ) -> Self {
        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            weak_self: weak.clone(),
            pool: ListenerPool::new(Arc::clone(&remote), Arc::clone(&network), Arc::clone(&auth)),
            sync_config: RwLock::new(Arc::new(InstanceSyncConfig::empty(&config.instance_key))),
            local: RwLock::new(local),
            remote,
            network: Arc::clone(&network),
            auth: Arc::clone(&auth),
            config,
            control: Mutex::new(Control {
                configured: false,
                running: false,
                sync_thread_enabled: true,
                listeners_enabled: true,
            }),
            pass_gate: Mutex::new(()),
            logical_t: AtomicI64::new(0),
            listeners_lock: Mutex::new(()),
            dispatcher: EventDispatcher::new(),
            exception_listener: RwLock::new(None),
            ongoing: DispatchGroup::new(),
            init: InitGate::new(),
            runner: Mutex::new(RunnerHandle {
                thread: None,
                wake: None,
            }),
            network_listener: Mutex::new(None),
            auth_listener: Mutex::new(None),
        });

        let network_listener: Arc<dyn NetworkStateListener> = Arc::new(EngineNetworkListener {
            engine: Arc::downgrade(&engine),
        });
        engine.network.add_state_listener(Arc::clone(&network_listener));
        *mutex_lock(&engine.network_listener) = Some(network_listener);

        let auth_listener: Arc<dyn AuthStateListener> = Arc::new(EngineAuthListener {
            engine: Arc::downgrade(&engine),
        });
        engine.auth.add_state_listener(Arc::clone(&auth_listener));
        *mutex_lock(&engine.auth_listener) = Some(auth_listener);

        {
            let init_engine = Arc::clone(&engine);
            let spawned = thread::Builder::new()
                .name("sync-init".into())
                .spawn(move || init_engine.initialize_and_recover());
            if spawned.is_err() {
                // No thread: initialize inline so waiters are not stranded.
                engine.initialize_and_recover();
            }
        }

        Self { engine }
    }

    pub fn wait_until_initialized(&self) {
        self.engine.wait_until_initialized();
    }

    /// Registers the conflict handler (required for syncing to begin) and
    /// optional listeners for a namespace, then starts the engine.
    pub fn configure(
        &self,
        namespace: &Namespace,
        conflict_handler: Arc<dyn ConflictHandler>,
        change_listener: Option<Arc<dyn ChangeEventListener>>,
        exception_listener: Option<Arc<dyn ExceptionListener>>,
    ) -> crate::Result<()> {
        self.engine
            .configure(namespace, conflict_handler, change_listener, exception_listener)
            .map_err(Into::into)
    }

    pub fn start(&self) {
        self.engine.start();
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Drains in-flight operations and tears the engine down.
    pub fn close(&self) {
        self.engine.close();
    }

    /// Runs one synchronization pass in both directions. Returns whether the
    /// pass ran to completion.
    pub fn do_sync_pass(&self) -> bool {
        self.engine.do_sync_pass()
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.engine.control).running
    }

    /// Disables the background sync thread; passes must then be driven
    /// manually via `do_sync_pass`.
    pub fn disable_sync_thread(&self) {
        mutex_lock(&self.engine.control).sync_thread_enabled = false;
    }

    pub fn disable_listeners(&self) {
        mutex_lock(&self.engine.control).listeners_enabled = false;
    }

    pub fn are_all_streams_open(&self) -> bool {
        self.engine.pool.are_all_streams_open()
    }

    pub fn is_stream_open(&self, namespace: &Namespace) -> bool {
        self.engine.pool.is_open(namespace)
    }

    /// Swaps the local store handle and re-runs initialize + recover while
    /// user operations are blocked out.
    pub fn reinitialize(&self, local: Arc<dyn LocalStore>) {
        self.engine.reinitialize(local);
    }

    pub fn wipe_in_memory_settings(&self) {
        self.engine.wipe_in_memory_settings();
    }

    pub fn add_watcher(
        &self,
        namespace: &Namespace,
    ) -> Option<(u64, super::listener::WatcherReceiver)> {
        self.engine.pool.add_watcher(namespace)
    }

    pub fn remove_watcher(&self, namespace: &Namespace, id: u64) {
        self.engine.pool.remove_watcher(namespace, id);
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}
