//! Remote document service contract: collections, stream functions and the
//! change-stream handle the listener blocks on.

pub mod dispatch;
pub mod monitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::{Bson, Document};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ChangeEvent, Namespace};

/// Wire error codes surfaced by the remote service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    MongodbError,
    FunctionNotFound,
    InvalidSession,
    Unknown,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network down")]
    NetworkDown,
    #[error("not logged in")]
    LoggedOut,
    #[error("interrupted")]
    Interrupted,
    #[error("remote service error ({code:?}): {message}")]
    Service {
        code: RemoteErrorCode,
        message: String,
    },
    #[error("change stream closed")]
    StreamClosed,
    #[error("decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Duplicate keys are reported as a `MongodbError` whose message carries
    /// the server's E11000 marker.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(
            self,
            RemoteError::Service {
                code: RemoteErrorCode::MongodbError,
                message,
            } if message.contains("E11000")
        )
    }

    /// Errors that abort the current sync pass cleanly rather than pausing a
    /// single document.
    pub fn aborts_pass(&self) -> bool {
        matches!(
            self,
            RemoteError::NetworkDown | RemoteError::LoggedOut | RemoteError::Interrupted
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteUpdateResult {
    pub matched_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteDeleteResult {
    pub deleted_count: u64,
}

/// The payload of a remote `update_one`.
#[derive(Clone, Debug)]
pub enum UpdateSpec {
    /// Operator update (`$set` / `$unset` ...).
    Update(Document),
    /// Full replacement document.
    Replacement(Document),
}

pub trait RemoteCollection: Send + Sync {
    fn find(&self, filter: &Document) -> Result<Vec<Document>, RemoteError>;

    fn find_one(&self, filter: &Document) -> Result<Option<Document>, RemoteError>;

    fn insert_one(&self, document: &Document) -> Result<(), RemoteError>;

    fn update_one(
        &self,
        filter: &Document,
        update: UpdateSpec,
    ) -> Result<RemoteUpdateResult, RemoteError>;

    fn delete_one(&self, filter: &Document) -> Result<RemoteDeleteResult, RemoteError>;
}

pub trait RemoteClient: Send + Sync {
    fn collection(&self, namespace: &Namespace) -> Arc<dyn RemoteCollection>;

    /// Opens a server-side stream function. The engine only ever calls
    /// `"watch"` with a `{database, collection, ids}` body.
    fn stream_function(&self, name: &str, args: Document) -> Result<ChangeStream, RemoteError>;
}

enum StreamSignal {
    Event(ChangeEvent),
    Error(RemoteError),
}

/// Receiving half of an open change stream. `next_event` blocks until an
/// event arrives, the stream errors, the producer closes, or `cancel` is
/// called from another thread.
pub struct ChangeStream {
    events: Receiver<StreamSignal>,
    cancel_rx: Receiver<()>,
    cancel_tx: Sender<()>,
    open: Arc<AtomicBool>,
}

impl ChangeStream {
    /// Builds a connected (producer, consumer) pair.
    pub fn channel() -> (ChangeStreamSender, ChangeStream) {
        let (tx, rx) = channel::unbounded();
        let (cancel_tx, cancel_rx) = channel::unbounded();
        let open = Arc::new(AtomicBool::new(true));
        (
            ChangeStreamSender {
                sender: tx,
                open: Arc::clone(&open),
            },
            ChangeStream {
                events: rx,
                cancel_rx,
                cancel_tx,
                open,
            },
        )
    }

    pub fn next_event(&self) -> Result<ChangeEvent, RemoteError> {
        crossbeam::channel::select! {
            recv(self.events) -> signal => match signal {
                Ok(StreamSignal::Event(event)) => Ok(event),
                Ok(StreamSignal::Error(err)) => Err(err),
                Err(_) => {
                    self.open.store(false, Ordering::SeqCst);
                    Err(RemoteError::StreamClosed)
                }
            },
            recv(self.cancel_rx) -> _ => {
                self.open.store(false, Ordering::SeqCst);
                Err(RemoteError::Interrupted)
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Unblocks a pending `next_event` with `Interrupted` and marks the
    /// stream closed.
    pub fn cancel(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.cancel_tx.send(());
    }
}

/// Producing half of a change stream, held by the remote client (or a test
/// harness) feeding events in.
#[derive(Clone)]
pub struct ChangeStreamSender {
    sender: Sender<StreamSignal>,
    open: Arc<AtomicBool>,
}

impl ChangeStreamSender {
    pub fn send(&self, event: ChangeEvent) -> bool {
        self.sender.send(StreamSignal::Event(event)).is_ok()
    }

    pub fn error(&self, error: RemoteError) {
        let _ = self.sender.send(StreamSignal::Error(error));
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// The `{database, collection, ids}` body of a watch request.
pub fn watch_request(namespace: &Namespace, ids: impl IntoIterator<Item = Bson>) -> Document {
    let mut args = Document::new();
    args.insert("database", namespace.database());
    args.insert("collection", namespace.collection());
    args.insert("ids", Bson::Array(ids.into_iter().collect()));
    args
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn duplicate_key_detection_requires_code_and_marker() {
        let dup = RemoteError::Service {
            code: RemoteErrorCode::MongodbError,
            message: "E11000 duplicate key error".into(),
        };
        assert!(dup.is_duplicate_key());
        let wrong_code = RemoteError::Service {
            code: RemoteErrorCode::Unknown,
            message: "E11000".into(),
        };
        assert!(!wrong_code.is_duplicate_key());
        let wrong_message = RemoteError::Service {
            code: RemoteErrorCode::MongodbError,
            message: "other".into(),
        };
        assert!(!wrong_message.is_duplicate_key());
    }

    #[test]
    fn cancel_unblocks_next_event() {
        let (_tx, stream) = ChangeStream::channel();
        stream.cancel();
        assert_eq!(stream.next_event(), Err(RemoteError::Interrupted));
        assert!(!stream.is_open());
    }

    #[test]
    fn dropped_sender_closes_stream() {
        let (tx, stream) = ChangeStream::channel();
        drop(tx);
        assert_eq!(stream.next_event(), Err(RemoteError::StreamClosed));
    }

    #[test]
    fn watch_request_body_shape() {
        let args = watch_request(
            &Namespace::new("app", "items"),
            [Bson::Int32(1), Bson::Int32(2)],
        );
        assert_eq!(
            args,
            doc! { "database": "app", "collection": "items", "ids": [1, 2] }
        );
    }
}
