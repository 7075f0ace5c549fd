//! Batched local writes with undo-journal bracketing.
//!
//! A pass streams (local write, config write) pairs into a `BatchOps`,
//! committing whenever the accumulated payload crosses the byte bound. Each
//! commit brackets the touched documents with undo pre-images so a crash
//! mid-write is recoverable.

use std::collections::BTreeSet;

use bson::{doc, Bson, Document};

use crate::core::DocumentKey;
use crate::store::{LocalCollection, StoreResult, WriteModel};

/// Upper bound on one committed batch of local writes.
pub const MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;

#[derive(Default)]
pub struct BatchOps {
    local_models: Vec<WriteModel>,
    config_models: Vec<WriteModel>,
    ids: BTreeSet<DocumentKey>,
    size: usize,
}

impl BatchOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.local_models.is_empty() && self.config_models.is_empty() && self.ids.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn push_local(&mut self, model: WriteModel) {
        self.size += model_size(&model);
        self.local_models.push(model);
    }

    pub fn push_config(&mut self, model: WriteModel) {
        self.size += model_size(&model);
        self.config_models.push(model);
    }

    pub fn touch(&mut self, id: &Bson) {
        self.ids.insert(DocumentKey::from(id));
    }

    pub fn merge(&mut self, other: BatchOps) {
        self.size += other.size;
        self.local_models.extend(other.local_models);
        self.config_models.extend(other.config_models);
        self.ids.extend(other.ids);
    }

    /// Applies the batch: undo pre-images in, local writes, config writes,
    /// undo pre-images out. Clears the batch on success.
    pub fn commit(
        &mut self,
        local_coll: &dyn LocalCollection,
        undo_coll: &dyn LocalCollection,
        docs_coll: &dyn LocalCollection,
    ) -> StoreResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        let id_values: Vec<Bson> = self.ids.iter().map(|key| key.value().clone()).collect();
        let id_filter = doc! { "_id": { "$in": id_values } };

        let pre_images = local_coll.find(&id_filter)?;
        if !pre_images.is_empty() {
            undo_coll.insert_many(&pre_images)?;
        }
        if !self.local_models.is_empty() {
            local_coll.bulk_write(&self.local_models)?;
        }
        if !self.config_models.is_empty() {
            docs_coll.bulk_write(&self.config_models)?;
        }
        if !pre_images.is_empty() {
            undo_coll.delete_many(&id_filter)?;
        }

        self.local_models.clear();
        self.config_models.clear();
        self.ids.clear();
        self.size = 0;
        Ok(())
    }
}

fn model_size(model: &WriteModel) -> usize {
    match model {
        WriteModel::InsertOne { document } => document_size(document),
        WriteModel::ReplaceOne {
            filter,
            replacement,
            ..
        } => document_size(filter) + document_size(replacement),
        WriteModel::UpdateOne { filter, update } => document_size(filter) + document_size(update),
        WriteModel::DeleteOne { filter } | WriteModel::DeleteMany { filter } => {
            document_size(filter)
        }
    }
}

/// Serialized-size estimate, computed without a fallible encode.
fn document_size(doc: &Document) -> usize {
    // int32 length prefix + trailing NUL
    5 + doc
        .iter()
        .map(|(key, value)| 1 + key.len() + 1 + value_size(value))
        .sum::<usize>()
}

fn value_size(value: &Bson) -> usize {
    match value {
        Bson::Double(_) | Bson::Int64(_) | Bson::DateTime(_) | Bson::Timestamp(_) => 8,
        Bson::Int32(_) => 4,
        Bson::Boolean(_) => 1,
        Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey => 0,
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => 5 + s.len(),
        Bson::ObjectId(_) => 12,
        Bson::Decimal128(_) => 16,
        Bson::Binary(b) => 5 + b.bytes.len(),
        Bson::Document(d) => document_size(d),
        Bson::Array(items) => {
            5 + items
                .iter()
                .enumerate()
                .map(|(i, v)| 1 + index_digits(i) + 1 + value_size(v))
                .sum::<usize>()
        }
        Bson::RegularExpression(r) => r.pattern.len() + r.options.len() + 2,
        Bson::JavaScriptCodeWithScope(c) => 4 + 5 + c.code.len() + document_size(&c.scope),
        Bson::DbPointer(_) => 12 + 5,
    }
}

fn index_digits(i: usize) -> usize {
    if i == 0 {
        1
    } else {
        (i.checked_ilog10().unwrap_or(0) + 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use crate::store::memory::MemoryStore;
    use crate::store::LocalStore;

    use super::*;

    #[test]
    fn commit_brackets_writes_with_undo_pre_images() {
        let store = MemoryStore::new();
        let local = store.collection("sync_user_app", "items");
        let undo = store.collection("sync_undo_app", "items");
        let docs = store.collection("sync_configk", "documents");
        local.insert_one(&doc! { "_id": 1, "x": "old" }).expect("seed");

        let mut batch = BatchOps::new();
        batch.touch(&Bson::Int32(1));
        batch.push_local(WriteModel::ReplaceOne {
            filter: doc! { "_id": 1 },
            replacement: doc! { "_id": 1, "x": "new" },
            upsert: true,
        });
        batch
            .commit(local.as_ref(), undo.as_ref(), docs.as_ref())
            .expect("commit");

        assert!(batch.is_empty());
        assert_eq!(
            local.find_one(&doc! { "_id": 1 }).expect("find"),
            Some(doc! { "_id": 1, "x": "new" })
        );
        // Undo rows are cleared once the batch lands.
        assert_eq!(undo.count(&Document::new()).expect("count"), 0);
    }

    #[test]
    fn size_accumulates_with_models() {
        let mut batch = BatchOps::new();
        assert_eq!(batch.size(), 0);
        batch.push_local(WriteModel::InsertOne {
            document: doc! { "_id": 1, "payload": "x".repeat(100) },
        });
        assert!(batch.size() > 100);
    }
}
