//! Core data model: namespaces, document keys, version vectors, change
//! events and structural diffs.

mod diff;
mod event;
mod key;
mod namespace;
mod version;

pub use diff::UpdateDescription;
pub use event::{ChangeEvent, OperationType};
pub use key::DocumentKey;
pub use namespace::Namespace;
pub use version::{
    sanitize_document, with_version, DocumentVersion, VersionInfo, VersionParseError,
    DOCUMENT_VERSION_FIELD, SYNC_PROTOCOL_VERSION,
};

pub(crate) use diff::{remove_path, set_path};
pub(crate) use key::cmp_bson;
