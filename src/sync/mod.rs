//! The synchronization engine: configs, stream listeners, the pass loop,
//! conflict resolution, CRUD and crash recovery.

mod batch;
mod config;
mod crud;
mod engine;
mod handlers;
mod listener;
mod pool;
mod recovery;
mod runner;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::core::VersionParseError;
use crate::remote::RemoteError;
use crate::store::StoreError;

pub use batch::MAX_BATCH_BYTES;
pub use config::{
    DocumentSyncConfig, InstanceSyncConfig, NamespaceSyncConfig, NEVER_RESOLVED,
};
pub use engine::DataSynchronizer;
pub use handlers::{
    ChangeEventListener, ConflictHandler, ExceptionListener, HandlerError, TypedConflictHandler,
};
pub use listener::{EventBuffer, NamespaceStreamListener, WatcherReceiver};
pub use pool::ListenerPool;

/// Errors raised by the engine itself while reconciling.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network down")]
    NetworkDown,
    #[error("not logged in")]
    LoggedOut,
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Version(#[from] VersionParseError),
    #[error("unsupported sync protocol version {0}")]
    UnsupportedProtocolVersion(i32),
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),
    #[error("conflict handler failed: {0}")]
    Handler(String),
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl SyncError {
    /// Whether this error aborts the current pass cleanly (to be retried
    /// with back-off) rather than pausing a single document.
    pub fn aborts_pass(&self) -> bool {
        match self {
            SyncError::NetworkDown | SyncError::LoggedOut | SyncError::Interrupted => true,
            SyncError::Remote(err) => err.aborts_pass(),
            _ => false,
        }
    }
}

impl From<bson::ser::Error> for SyncError {
    fn from(err: bson::ser::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<bson::de::Error> for SyncError {
    fn from(err: bson::de::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

// Lock poisoning carries no recovery value here: the guarded structures are
// all crash-consistent through the store, so we adopt the poisoned state.
pub(crate) fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
