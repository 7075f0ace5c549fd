//! The per-instance pool of namespace stream listeners.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use bson::Bson;
use tracing::debug;

use crate::core::{ChangeEvent, DocumentKey, Namespace};
use crate::remote::monitor::{AuthMonitor, NetworkMonitor};
use crate::remote::RemoteClient;

use super::config::NamespaceSyncConfig;
use super::listener::{EventBuffer, NamespaceStreamListener, WatcherReceiver};
use super::{mutex_lock, read_lock, write_lock};

pub struct ListenerPool {
    remote: Arc<dyn RemoteClient>,
    network: Arc<dyn NetworkMonitor>,
    auth: Arc<dyn AuthMonitor>,
    listeners: RwLock<BTreeMap<Namespace, Arc<NamespaceStreamListener>>>,
    /// Stream-buffer locks outlive their listeners so a pass can hold a
    /// namespace's lock across listener restarts.
    locks: Mutex<BTreeMap<Namespace, Arc<RwLock<EventBuffer>>>>,
}

impl ListenerPool {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        network: Arc<dyn NetworkMonitor>,
        auth: Arc<dyn AuthMonitor>,
    ) -> Self {
        Self {
            remote,
            network,
            auth,
            listeners: RwLock::new(BTreeMap::new()),
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// The per-namespace stream lock guarding the event buffer. A sync pass
    /// takes its write guard for the duration of reconciliation.
    pub fn lock_for_namespace(&self, namespace: &Namespace) -> Arc<RwLock<EventBuffer>> {
        let mut locks = mutex_lock(&self.locks);
        Arc::clone(locks.entry(namespace.clone()).or_default())
    }

    /// Registers an idle (not started) listener for a namespace.
    pub fn add_namespace(&self, ns_config: Arc<NamespaceSyncConfig>) {
        let namespace = ns_config.namespace().clone();
        let buffer = self.lock_for_namespace(&namespace);
        let mut listeners = write_lock(&self.listeners);
        if listeners.contains_key(&namespace) {
            return;
        }
        debug!(ns = %namespace, "listener added");
        listeners.insert(
            namespace,
            Arc::new(NamespaceStreamListener::new(
                ns_config,
                Arc::clone(&self.remote),
                Arc::clone(&self.network),
                Arc::clone(&self.auth),
                buffer,
            )),
        );
    }

    /// Stops and evicts a namespace's listener.
    pub fn remove_namespace(&self, namespace: &Namespace) {
        let removed = write_lock(&self.listeners).remove(namespace);
        if let Some(listener) = removed {
            debug!(ns = %namespace, "listener removed");
            listener.stop();
        }
    }

    pub fn listener(&self, namespace: &Namespace) -> Option<Arc<NamespaceStreamListener>> {
        read_lock(&self.listeners).get(namespace).cloned()
    }

    pub fn start_namespace(&self, namespace: &Namespace) {
        if let Some(listener) = self.listener(namespace) {
            listener.start();
        }
    }

    pub fn stop_namespace(&self, namespace: &Namespace) {
        if let Some(listener) = self.listener(namespace) {
            listener.stop();
        }
    }

    pub fn start(&self) {
        for listener in self.all() {
            listener.start();
        }
    }

    pub fn stop(&self) {
        for listener in self.all() {
            listener.stop();
        }
    }

    /// Stops everything and drops all listeners; used by wipe/reinitialize.
    pub fn clear(&self) {
        let listeners: Vec<_> = {
            let mut map = write_lock(&self.listeners);
            std::mem::take(&mut *map).into_values().collect()
        };
        for listener in listeners {
            listener.stop();
        }
        mutex_lock(&self.locks).clear();
    }

    pub fn are_all_streams_open(&self) -> bool {
        self.all().iter().all(|listener| listener.is_open())
    }

    pub fn is_open(&self, namespace: &Namespace) -> bool {
        self.listener(namespace)
            .map(|listener| listener.is_open())
            .unwrap_or(false)
    }

    pub fn take_events(&self, namespace: &Namespace) -> BTreeMap<DocumentKey, ChangeEvent> {
        self.listener(namespace)
            .map(|listener| listener.take_events())
            .unwrap_or_default()
    }

    pub fn take_event_for_id(&self, namespace: &Namespace, id: &Bson) -> Option<ChangeEvent> {
        self.listener(namespace)
            .and_then(|listener| listener.take_event_for_id(id))
    }

    pub fn add_watcher(&self, namespace: &Namespace) -> Option<(u64, WatcherReceiver)> {
        self.listener(namespace).map(|listener| listener.add_watcher())
    }

    pub fn remove_watcher(&self, namespace: &Namespace, id: u64) {
        if let Some(listener) = self.listener(namespace) {
            listener.remove_watcher(id);
        }
    }

    fn all(&self) -> Vec<Arc<NamespaceStreamListener>> {
        read_lock(&self.listeners).values().cloned().collect()
    }
}
