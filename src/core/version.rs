//! The per-document version vector embedded in remote documents.
//!
//! Wire format: a subdocument at top-level field `__stitch_sync_version`
//! with integer `spv` (protocol version), string `id` (writer instance GUID)
//! and long `v` (monotonic counter). Absence of the field is itself a
//! version: it marks a document last written by a non-sync client.

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Top-level field carrying the version subdocument on remote documents.
pub const DOCUMENT_VERSION_FIELD: &str = "__stitch_sync_version";

/// The only protocol version this engine emits or accepts.
pub const SYNC_PROTOCOL_VERSION: i32 = 1;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed document version: {reason}")]
pub struct VersionParseError {
    pub reason: String,
}

impl VersionParseError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A writer's version vector for one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    #[serde(rename = "spv")]
    pub sync_protocol_version: i32,
    #[serde(rename = "id")]
    pub instance_id: String,
    #[serde(rename = "v")]
    pub version_counter: i64,
}

impl DocumentVersion {
    /// Mints a brand-new version under a fresh writer GUID, counter 0.
    /// Used on the first remote insert of a document.
    pub fn fresh() -> Self {
        Self {
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
            instance_id: Uuid::new_v4().to_string(),
            version_counter: 0,
        }
    }

    /// The successor version: same writer, counter incremented.
    pub fn next(&self) -> Self {
        Self {
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
            instance_id: self.instance_id.clone(),
            version_counter: self.version_counter + 1,
        }
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "spv": self.sync_protocol_version,
            "id": self.instance_id.clone(),
            "v": self.version_counter,
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self, VersionParseError> {
        let spv = match doc.get("spv") {
            Some(Bson::Int32(v)) => *v,
            Some(Bson::Int64(v)) => i32::try_from(*v)
                .map_err(|_| VersionParseError::new("spv out of range"))?,
            Some(other) => {
                return Err(VersionParseError::new(format!(
                    "spv must be an integer, found {}",
                    bson_type_name(other)
                )))
            }
            None => return Err(VersionParseError::new("missing spv")),
        };
        let instance_id = match doc.get("id") {
            Some(Bson::String(id)) => id.clone(),
            Some(other) => {
                return Err(VersionParseError::new(format!(
                    "id must be a string, found {}",
                    bson_type_name(other)
                )))
            }
            None => return Err(VersionParseError::new("missing id")),
        };
        let version_counter = match doc.get("v") {
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Int32(v)) => i64::from(*v),
            Some(other) => {
                return Err(VersionParseError::new(format!(
                    "v must be an integer, found {}",
                    bson_type_name(other)
                )))
            }
            None => return Err(VersionParseError::new("missing v")),
        };
        Ok(Self {
            sync_protocol_version: spv,
            instance_id,
            version_counter,
        })
    }
}

/// A possibly-absent version, as read off a remote document or a document
/// config. "No version" is a legitimate state and participates in conflict
/// decisions as such.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    version: Option<DocumentVersion>,
}

impl VersionInfo {
    pub fn none() -> Self {
        Self { version: None }
    }

    pub fn from_version(version: Option<DocumentVersion>) -> Self {
        Self { version }
    }

    /// Extracts the embedded version from a remote document, if any.
    ///
    /// A missing document or a missing field yields "no version". A field
    /// that is present but not a well-formed subdocument is an error; the
    /// caller's policy is to desync the affected document, not abort.
    pub fn from_remote_document(doc: Option<&Document>) -> Result<Self, VersionParseError> {
        match doc.and_then(|d| d.get(DOCUMENT_VERSION_FIELD)) {
            None => Ok(Self::none()),
            Some(Bson::Document(sub)) => Ok(Self {
                version: Some(DocumentVersion::from_document(sub)?),
            }),
            Some(other) => Err(VersionParseError::new(format!(
                "expected a subdocument, found {}",
                bson_type_name(other)
            ))),
        }
    }

    pub fn has_version(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&DocumentVersion> {
        self.version.as_ref()
    }

    pub fn into_version(self) -> Option<DocumentVersion> {
        self.version
    }

    /// The filter matching this document at exactly this version. Used for
    /// remote replace/update/delete so a concurrent writer surfaces as
    /// `matched == 0`.
    pub fn versioned_filter(&self, document_id: &Bson) -> Document {
        match &self.version {
            Some(v) => doc! {
                "_id": document_id.clone(),
                DOCUMENT_VERSION_FIELD: v.to_document(),
            },
            None => doc! {
                "_id": document_id.clone(),
                DOCUMENT_VERSION_FIELD: doc! { "$exists": false },
            },
        }
    }

    /// The version to attach to the next remote write of this document.
    pub fn next_version(&self) -> DocumentVersion {
        match &self.version {
            Some(v) => v.next(),
            None => DocumentVersion::fresh(),
        }
    }
}

/// Strips the version field. Idempotent; the returned document never
/// contains `__stitch_sync_version`.
pub fn sanitize_document(doc: &Document) -> Document {
    let mut out = doc.clone();
    out.remove(DOCUMENT_VERSION_FIELD);
    out
}

/// Returns a copy of the document carrying the given version.
pub fn with_version(doc: &Document, version: &DocumentVersion) -> Document {
    let mut out = doc.clone();
    out.insert(DOCUMENT_VERSION_FIELD, version.to_document());
    out
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "document",
        Bson::Boolean(_) => "boolean",
        Bson::Null => "null",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "dateTime",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_version_starts_at_zero() {
        let v = DocumentVersion::fresh();
        assert_eq!(v.sync_protocol_version, 1);
        assert_eq!(v.version_counter, 0);
        assert!(!v.instance_id.is_empty());
    }

    #[test]
    fn next_version_increments_and_keeps_instance() {
        let v = DocumentVersion::fresh();
        let n = v.next();
        assert_eq!(n.version_counter, v.version_counter + 1);
        assert_eq!(n.instance_id, v.instance_id);
    }

    #[test]
    fn version_round_trips_through_wire_document() {
        let v = DocumentVersion::fresh();
        let parsed = DocumentVersion::from_document(&v.to_document()).expect("parse");
        assert_eq!(parsed, v);
    }

    #[test]
    fn missing_field_is_no_version() {
        let info = VersionInfo::from_remote_document(Some(&doc! { "_id": 1 })).expect("parse");
        assert!(!info.has_version());
    }

    #[test]
    fn non_document_version_field_is_an_error() {
        let doc = doc! { "_id": 1, DOCUMENT_VERSION_FIELD: "garbage" };
        assert!(VersionInfo::from_remote_document(Some(&doc)).is_err());
    }

    #[test]
    fn malformed_subdocument_is_an_error() {
        let doc = doc! { "_id": 1, DOCUMENT_VERSION_FIELD: { "spv": "one" } };
        assert!(VersionInfo::from_remote_document(Some(&doc)).is_err());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let versioned = with_version(&doc! { "_id": 1, "x": "a" }, &DocumentVersion::fresh());
        let once = sanitize_document(&versioned);
        assert!(!once.contains_key(DOCUMENT_VERSION_FIELD));
        assert_eq!(sanitize_document(&once), once);
    }

    #[test]
    fn versioned_filter_requires_absence_when_unversioned() {
        let filter = VersionInfo::none().versioned_filter(&Bson::Int32(1));
        assert_eq!(
            filter.get_document(DOCUMENT_VERSION_FIELD).expect("filter"),
            &doc! { "$exists": false }
        );
    }
}
