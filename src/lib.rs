#![forbid(unsafe_code)]

//! Offline-first bidirectional document synchronization.
//!
//! `tether` keeps a local document store consistent with a remote document
//! service. Per namespace (database + collection), it tracks documents by
//! primary id and reconciles local pending writes against remote changes on
//! a periodic cycle: offline-capable CRUD, at-most-once application of
//! remote changes, write/write conflict detection with a user-supplied
//! resolver, and atomic crash recovery through an undo journal.

pub mod config;
pub mod core;
pub mod error;
pub mod remote;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod test_harness;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working vocabulary at the crate root.
pub use crate::config::{EngineConfig, LoggingConfig};
pub use crate::core::{
    sanitize_document, ChangeEvent, DocumentKey, DocumentVersion, Namespace, OperationType,
    UpdateDescription, VersionInfo, VersionParseError, DOCUMENT_VERSION_FIELD,
    SYNC_PROTOCOL_VERSION,
};
pub use crate::remote::monitor::{AuthMonitor, NetworkMonitor};
pub use crate::remote::{RemoteClient, RemoteError};
pub use crate::store::{LocalCollection, LocalStore, StoreError};
pub use crate::sync::{
    ChangeEventListener, ConflictHandler, DataSynchronizer, ExceptionListener, HandlerError,
    SyncError, TypedConflictHandler,
};
