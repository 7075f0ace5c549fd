//! User-supplied hooks: conflict resolvers, change listeners, error
//! listeners, and serde-typed adapters over the raw-document forms.

use std::marker::PhantomData;

use bson::{Bson, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::core::ChangeEvent;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("conflict handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Resolves a write/write conflict. Returning `None` deletes the document;
/// returning a document replaces it. Events arrive sanitized.
pub trait ConflictHandler: Send + Sync {
    fn resolve(
        &self,
        document_id: &Bson,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> Result<Option<Document>, HandlerError>;
}

impl<F> ConflictHandler for F
where
    F: Fn(&Bson, &ChangeEvent, &ChangeEvent) -> Result<Option<Document>, HandlerError>
        + Send
        + Sync,
{
    fn resolve(
        &self,
        document_id: &Bson,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> Result<Option<Document>, HandlerError> {
        self(document_id, local_event, remote_event)
    }
}

/// Observes committed and staged change events for a namespace.
pub trait ChangeEventListener: Send + Sync {
    fn on_event(&self, document_id: &Bson, event: &ChangeEvent);
}

impl<F> ChangeEventListener for F
where
    F: Fn(&Bson, &ChangeEvent) + Send + Sync,
{
    fn on_event(&self, document_id: &Bson, event: &ChangeEvent) {
        self(document_id, event)
    }
}

/// Receives per-document errors raised during sync passes.
pub trait ExceptionListener: Send + Sync {
    fn on_error(&self, document_id: &Bson, error: &crate::error::Error);
}

impl<F> ExceptionListener for F
where
    F: Fn(&Bson, &crate::error::Error) + Send + Sync,
{
    fn on_error(&self, document_id: &Bson, error: &crate::error::Error) {
        self(document_id, error)
    }
}

/// Adapts a typed resolver `(id, local, remote) -> resolution` to the
/// raw-document handler by decoding sanitized full documents via serde.
pub struct TypedConflictHandler<T, F> {
    resolve: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypedConflictHandler<T, F>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: Fn(&Bson, Option<T>, Option<T>) -> Result<Option<T>, HandlerError> + Send + Sync,
{
    pub fn new(resolve: F) -> Self {
        Self {
            resolve,
            _marker: PhantomData,
        }
    }
}

impl<T, F> ConflictHandler for TypedConflictHandler<T, F>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: Fn(&Bson, Option<T>, Option<T>) -> Result<Option<T>, HandlerError> + Send + Sync,
{
    fn resolve(
        &self,
        document_id: &Bson,
        local_event: &ChangeEvent,
        remote_event: &ChangeEvent,
    ) -> Result<Option<Document>, HandlerError> {
        let local = local_event
            .decode_full_document::<T>()
            .map_err(|e| HandlerError::new(format!("decoding local event: {e}")))?;
        let remote = remote_event
            .decode_full_document::<T>()
            .map_err(|e| HandlerError::new(format!("decoding remote event: {e}")))?;
        match (self.resolve)(document_id, local, remote)? {
            None => Ok(None),
            Some(resolved) => bson::to_document(&resolved)
                .map(Some)
                .map_err(|e| HandlerError::new(format!("encoding resolution: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use serde::Deserialize;

    use crate::core::Namespace;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item {
        #[serde(rename = "_id")]
        id: i32,
        x: String,
    }

    #[test]
    fn typed_handler_decodes_and_encodes() {
        let handler = TypedConflictHandler::new(
            |_id: &Bson, _local: Option<Item>, remote: Option<Item>| Ok(remote),
        );
        let ns = Namespace::new("app", "items");
        let local =
            ChangeEvent::for_local_replace(ns.clone(), Bson::Int32(1), doc! { "_id": 1, "x": "l" }, true);
        let remote =
            ChangeEvent::for_local_replace(ns, Bson::Int32(1), doc! { "_id": 1, "x": "r" }, false);
        let resolved = handler
            .resolve(&Bson::Int32(1), &local, &remote)
            .expect("resolve");
        assert_eq!(resolved, Some(doc! { "_id": 1, "x": "r" }));
    }
}
