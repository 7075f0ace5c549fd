//! Per-namespace change stream listener.
//!
//! Owns an open change stream and a dedicated thread that blocks on
//! `next_event`, buffering each event by document id (later events overwrite
//! earlier ones for the same id) and fanning out to registered watchers.
//! The buffer's `RwLock` doubles as the namespace stream lock: a sync pass
//! holds the write guard for the duration of reconciliation, so no event is
//! ingested mid-pass.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use bson::Bson;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::core::{ChangeEvent, DocumentKey, Namespace};
use crate::remote::monitor::{AuthMonitor, NetworkMonitor};
use crate::remote::{watch_request, ChangeStream, RemoteClient, RemoteError};

use super::config::NamespaceSyncConfig;
use super::{mutex_lock, write_lock};

/// Buffered, unprocessed remote events keyed by document id.
#[derive(Default)]
pub struct EventBuffer {
    events: BTreeMap<DocumentKey, ChangeEvent>,
}

impl EventBuffer {
    pub fn insert(&mut self, key: DocumentKey, event: ChangeEvent) {
        self.events.insert(key, event);
    }

    /// Snapshot-and-clear.
    pub fn take_all(&mut self) -> BTreeMap<DocumentKey, ChangeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Fetch-and-remove one event. Reading it assumes the caller will
    /// process it.
    pub fn take(&mut self, key: &DocumentKey) -> Option<ChangeEvent> {
        self.events.remove(key)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Messages delivered to watchers; the error arm fires once when the
/// listener closes.
pub type WatcherReceiver = Receiver<Result<ChangeEvent, RemoteError>>;

struct ListenerState {
    thread: Option<JoinHandle<()>>,
    stream: Option<Arc<ChangeStream>>,
    watchers: BTreeMap<u64, Sender<Result<ChangeEvent, RemoteError>>>,
}

pub struct NamespaceStreamListener {
    namespace: Namespace,
    ns_config: Arc<NamespaceSyncConfig>,
    remote: Arc<dyn RemoteClient>,
    network: Arc<dyn NetworkMonitor>,
    auth: Arc<dyn AuthMonitor>,
    buffer: Arc<RwLock<EventBuffer>>,
    state: Mutex<ListenerState>,
    interrupted: AtomicBool,
    next_watcher_id: AtomicU64,
}

impl NamespaceStreamListener {
    pub(crate) fn new(
        ns_config: Arc<NamespaceSyncConfig>,
        remote: Arc<dyn RemoteClient>,
        network: Arc<dyn NetworkMonitor>,
        auth: Arc<dyn AuthMonitor>,
        buffer: Arc<RwLock<EventBuffer>>,
    ) -> Self {
        Self {
            namespace: ns_config.namespace().clone(),
            ns_config,
            remote,
            network,
            auth,
            buffer,
            state: Mutex::new(ListenerState {
                thread: None,
                stream: None,
                watchers: BTreeMap::new(),
            }),
            interrupted: AtomicBool::new(false),
            next_watcher_id: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Spawns (or respawns) the stream thread. A thread that exited because
    /// its stream closed or could not open is replaced.
    pub fn start(self: Arc<Self>) {
        let mut state = mutex_lock(&self.state);
        if let Some(handle) = &state.thread {
            if !handle.is_finished() {
                return;
            }
            if let Some(handle) = state.thread.take() {
                drop(state);
                let _ = handle.join();
                state = mutex_lock(&self.state);
                if state.thread.is_some() {
                    return;
                }
            }
        }
        self.interrupted.store(false, Ordering::SeqCst);
        let listener = Arc::clone(&self);
        let name = format!("sync-stream-{}", self.namespace);
        state.thread = thread::Builder::new()
            .name(name)
            .spawn(move || listener.run())
            .ok();
    }

    /// Interrupts the stream thread and waits for it to exit. Watchers
    /// receive a failed result.
    pub fn stop(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let handle = {
            let mut state = mutex_lock(&self.state);
            if let Some(stream) = &state.stream {
                stream.cancel();
            }
            state.thread.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.close();
    }

    pub fn is_open(&self) -> bool {
        mutex_lock(&self.state)
            .stream
            .as_ref()
            .is_some_and(|stream| stream.is_open())
    }

    pub fn add_watcher(&self) -> (u64, WatcherReceiver) {
        let (tx, rx) = channel::unbounded();
        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        mutex_lock(&self.state).watchers.insert(id, tx);
        (id, rx)
    }

    pub fn remove_watcher(&self, id: u64) {
        mutex_lock(&self.state).watchers.remove(&id);
    }

    /// Snapshot and clear the buffered events.
    pub fn take_events(&self) -> BTreeMap<DocumentKey, ChangeEvent> {
        write_lock(&self.buffer).take_all()
    }

    /// Fetch and remove the buffered event for one id, if any.
    pub fn take_event_for_id(&self, id: &Bson) -> Option<ChangeEvent> {
        write_lock(&self.buffer).take(&DocumentKey::from(id))
    }

    fn run(&self) {
        if self.interrupted.load(Ordering::SeqCst) {
            return;
        }
        let stream = match self.open_stream() {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(err) => {
                warn!(ns = %self.namespace, error = %err, "stream open failed");
                return;
            }
        };
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
            match stream.next_event() {
                Ok(event) => self.store_event(event),
                Err(RemoteError::Interrupted) | Err(RemoteError::StreamClosed) => {
                    info!(ns = %self.namespace, "stream end");
                    break;
                }
                Err(err) => {
                    warn!(ns = %self.namespace, error = %err, "stream error; closing");
                    break;
                }
            }
        }
        self.close();
    }

    /// Opens a change stream filtered to the currently-synchronized ids.
    /// Returns `None` without opening when disconnected, logged out, or
    /// there is nothing to watch. A successful open marks the namespace
    /// stale: events may have been missed while no stream was up.
    fn open_stream(&self) -> Result<Option<Arc<ChangeStream>>, RemoteError> {
        debug!(ns = %self.namespace, "stream open start");
        if !self.network.is_connected() {
            debug!(ns = %self.namespace, "stream not opened, network disconnected");
            return Ok(None);
        }
        let ids = self.ns_config.synchronized_document_ids();
        if ids.is_empty() {
            debug!(ns = %self.namespace, "stream not opened, no synchronized documents");
            return Ok(None);
        }
        if !self.auth.try_is_logged_in() {
            debug!(ns = %self.namespace, "stream not opened, logged out");
            return Ok(None);
        }

        let args = watch_request(&self.namespace, ids);
        let stream = Arc::new(self.remote.stream_function("watch", args)?);
        if !stream.is_open() {
            return Ok(None);
        }
        mutex_lock(&self.state).stream = Some(Arc::clone(&stream));
        self.ns_config.set_stale(true);
        info!(ns = %self.namespace, "stream open");
        Ok(Some(stream))
    }

    fn store_event(&self, event: ChangeEvent) {
        let Some(id) = event.document_id().cloned() else {
            return;
        };
        debug!(
            ns = %self.namespace,
            op = event.operation.as_str(),
            document_id = ?id,
            "stream event buffered"
        );
        write_lock(&self.buffer).insert(DocumentKey::new(id), event.clone());

        let mut state = mutex_lock(&self.state);
        state
            .watchers
            .retain(|_, watcher| watcher.send(Ok(event.clone())).is_ok());
    }

    /// Drops the stream handle and fails out the watchers.
    fn close(&self) {
        let mut state = mutex_lock(&self.state);
        if let Some(stream) = state.stream.take() {
            stream.cancel();
        }
        for (_, watcher) in std::mem::take(&mut state.watchers) {
            let _ = watcher.send(Err(RemoteError::StreamClosed));
        }
    }
}
