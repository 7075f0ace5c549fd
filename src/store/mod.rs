//! Local embedded document store contract.
//!
//! The engine consumes the store through these traits only. Bulk writes may
//! be non-atomic across documents but must be atomic per document; the store
//! is not expected to provide transactions.

pub mod memory;

use std::sync::Arc;

use bson::{Bson, Document};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("unsupported pipeline stage: {0}")]
    UnsupportedPipelineStage(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One write against a collection, for batched application.
#[derive(Clone, Debug)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    UpdateOne {
        filter: Document,
        update: Document,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Which image `find_one_and_update` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    After,
}

pub trait LocalCollection: Send + Sync {
    fn find(&self, filter: &Document) -> StoreResult<Vec<Document>>;

    fn find_one(&self, filter: &Document) -> StoreResult<Option<Document>>;

    fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
        returning: ReturnDocument,
    ) -> StoreResult<Option<Document>>;

    fn find_one_and_replace(
        &self,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StoreResult<Option<Document>>;

    fn insert_one(&self, document: &Document) -> StoreResult<()>;

    fn insert_many(&self, documents: &[Document]) -> StoreResult<()>;

    fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    fn update_many(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    fn delete_one(&self, filter: &Document) -> StoreResult<DeleteResult>;

    fn delete_many(&self, filter: &Document) -> StoreResult<DeleteResult>;

    /// Applies the models in order. Atomic per document only.
    fn bulk_write(&self, models: &[WriteModel]) -> StoreResult<()>;

    fn count(&self, filter: &Document) -> StoreResult<u64>;

    fn aggregate(&self, pipeline: &[Document]) -> StoreResult<Vec<Document>>;
}

pub trait LocalStore: Send + Sync {
    fn collection(&self, database: &str, collection: &str) -> Arc<dyn LocalCollection>;
}
