//! Change events: the unit of information flowing between the local and the
//! remote side, both off the wire and synthesized locally.

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use super::diff::UpdateDescription;
use super::namespace::Namespace;
use super::version::sanitize_document;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    /// An operation name this engine does not understand. Processing one
    /// surfaces an `UnknownOperationType` error and pauses the document.
    Unknown(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Unknown(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            other => OperationType::Unknown(other.to_string()),
        }
    }
}

impl From<OperationType> for String {
    fn from(op: OperationType) -> Self {
        op.as_str().to_string()
    }
}

impl From<String> for OperationType {
    fn from(name: String) -> Self {
        OperationType::from_name(&name)
    }
}

/// One observed or staged mutation of a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Opaque stream-assigned id; empty for locally synthesized events.
    pub id: Document,
    pub operation: OperationType,
    /// The document after the change. `None` for deletes.
    pub full_document: Option<Document>,
    pub namespace: Namespace,
    /// The primary-id singleton, `{_id: ...}`.
    pub document_key: Document,
    /// Present for updates only.
    pub update_description: Option<UpdateDescription>,
    /// Whether the change is still waiting to be committed remotely.
    pub has_uncommitted_writes: bool,
}

impl ChangeEvent {
    pub fn for_local_insert(namespace: Namespace, document: Document, write_pending: bool) -> Self {
        let document_key = id_singleton(&document);
        Self {
            id: Document::new(),
            operation: OperationType::Insert,
            full_document: Some(document),
            namespace,
            document_key,
            update_description: None,
            has_uncommitted_writes: write_pending,
        }
    }

    pub fn for_local_update(
        namespace: Namespace,
        document_id: Bson,
        update: UpdateDescription,
        full_document_after: Document,
        write_pending: bool,
    ) -> Self {
        Self {
            id: Document::new(),
            operation: OperationType::Update,
            full_document: Some(full_document_after),
            namespace,
            document_key: doc! { "_id": document_id },
            update_description: Some(update),
            has_uncommitted_writes: write_pending,
        }
    }

    pub fn for_local_replace(
        namespace: Namespace,
        document_id: Bson,
        document: Document,
        write_pending: bool,
    ) -> Self {
        Self {
            id: Document::new(),
            operation: OperationType::Replace,
            full_document: Some(document),
            namespace,
            document_key: doc! { "_id": document_id },
            update_description: None,
            has_uncommitted_writes: write_pending,
        }
    }

    pub fn for_local_delete(namespace: Namespace, document_id: Bson, write_pending: bool) -> Self {
        Self {
            id: Document::new(),
            operation: OperationType::Delete,
            full_document: None,
            namespace,
            document_key: doc! { "_id": document_id },
            update_description: None,
            has_uncommitted_writes: write_pending,
        }
    }

    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.get("_id")
    }

    /// The event as handed to user code: full document sanitized of the
    /// version field.
    pub fn for_user(&self) -> ChangeEvent {
        ChangeEvent {
            full_document: self.full_document.as_ref().map(sanitize_document),
            ..self.clone()
        }
    }

    /// A copy marking the write as committed.
    pub fn with_committed_writes(&self) -> ChangeEvent {
        ChangeEvent {
            has_uncommitted_writes: false,
            ..self.clone()
        }
    }

    /// Decodes the (sanitized) full document into a user type.
    pub fn decode_full_document<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, bson::de::Error> {
        match &self.full_document {
            None => Ok(None),
            Some(doc) => bson::from_document(sanitize_document(doc)).map(Some),
        }
    }
}

fn id_singleton(document: &Document) -> Document {
    match document.get("_id") {
        Some(id) => doc! { "_id": id.clone() },
        None => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use crate::core::version::{with_version, DocumentVersion, DOCUMENT_VERSION_FIELD};

    use super::*;

    fn ns() -> Namespace {
        Namespace::new("app", "items")
    }

    #[test]
    fn operation_type_round_trips_names() {
        assert_eq!(OperationType::from_name("insert"), OperationType::Insert);
        assert_eq!(
            OperationType::from_name("rename"),
            OperationType::Unknown("rename".into())
        );
        assert_eq!(OperationType::Unknown("rename".into()).as_str(), "rename");
    }

    #[test]
    fn user_events_are_sanitized() {
        let versioned = with_version(&doc! { "_id": 1, "x": "a" }, &DocumentVersion::fresh());
        let event = ChangeEvent::for_local_replace(ns(), Bson::Int32(1), versioned, false);
        let user = event.for_user();
        assert!(!user
            .full_document
            .expect("full document")
            .contains_key(DOCUMENT_VERSION_FIELD));
    }

    #[test]
    fn delete_events_carry_no_document() {
        let event = ChangeEvent::for_local_delete(ns(), Bson::Int32(1), true);
        assert_eq!(event.operation, OperationType::Delete);
        assert!(event.full_document.is_none());
        assert_eq!(event.document_id(), Some(&Bson::Int32(1)));
    }

    #[test]
    fn events_survive_config_persistence() {
        let event = ChangeEvent::for_local_insert(ns(), doc! { "_id": 2, "x": 1 }, true);
        let row = bson::to_document(&event).expect("encode");
        let back: ChangeEvent = bson::from_document(row).expect("decode");
        assert_eq!(back, event);
    }
}
