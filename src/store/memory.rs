//! Map-backed local store. One `BTreeMap` per collection keyed by `_id`.
//!
//! Filter support covers what the engine and its CRUD surface actually
//! issue: top-level (dotted) equality plus `$in` / `$nin` / `$exists`.
//! Updates support `$set` / `$unset` / `$inc` and bare replacement
//! documents. Aggregation supports `$match` and `$limit`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bson::oid::ObjectId;
use bson::{Bson, Document};

use crate::core::{cmp_bson, remove_path, set_path, DocumentKey};

use super::{
    DeleteResult, LocalCollection, LocalStore, ReturnDocument, StoreError, StoreResult,
    UpdateResult, WriteModel,
};

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<(String, String), Arc<MemoryCollection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle for tests and harnesses that want to inspect rows.
    pub fn memory_collection(&self, database: &str, collection: &str) -> Arc<MemoryCollection> {
        let mut map = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry((database.to_string(), collection.to_string()))
                .or_default(),
        )
    }
}

impl LocalStore for MemoryStore {
    fn collection(&self, database: &str, collection: &str) -> Arc<dyn LocalCollection> {
        self.memory_collection(database, collection)
    }
}

#[derive(Default)]
pub struct MemoryCollection {
    rows: RwLock<BTreeMap<DocumentKey, Document>>,
}

impl MemoryCollection {
    /// All rows in key order. Test/inspection helper.
    pub fn dump(&self) -> Vec<Document> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DocumentKey, Document>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DocumentKey, Document>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_locked(
        rows: &mut BTreeMap<DocumentKey, Document>,
        document: &Document,
    ) -> StoreResult<DocumentKey> {
        let mut doc = document.clone();
        let id = match doc.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                doc.insert("_id", id.clone());
                id
            }
        };
        let key = DocumentKey::new(id.clone());
        if rows.contains_key(&key) {
            return Err(StoreError::DuplicateKey(format!("_id: {id}")));
        }
        rows.insert(key.clone(), doc);
        Ok(key)
    }

    fn apply_model(
        rows: &mut BTreeMap<DocumentKey, Document>,
        model: &WriteModel,
    ) -> StoreResult<()> {
        match model {
            WriteModel::InsertOne { document } => {
                Self::insert_locked(rows, document)?;
            }
            WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                let found = rows
                    .iter()
                    .find(|(_, doc)| matches(doc, filter))
                    .map(|(key, doc)| (key.clone(), doc.clone()));
                match found {
                    Some((key, existing)) => {
                        let mut doc = replacement.clone();
                        if !doc.contains_key("_id") {
                            if let Some(id) = existing.get("_id") {
                                doc.insert("_id", id.clone());
                            }
                        }
                        rows.insert(key, doc);
                    }
                    None if *upsert => {
                        let mut doc = replacement.clone();
                        if !doc.contains_key("_id") {
                            if let Some(id) = filter.get("_id") {
                                if !matches!(id, Bson::Document(_)) {
                                    doc.insert("_id", id.clone());
                                }
                            }
                        }
                        Self::insert_locked(rows, &doc)?;
                    }
                    None => {}
                }
            }
            WriteModel::UpdateOne { filter, update } => {
                let found = rows
                    .iter()
                    .find(|(_, doc)| matches(doc, filter))
                    .map(|(key, _)| key.clone());
                if let Some(key) = found {
                    let updated = {
                        let doc = rows.get(&key).cloned().unwrap_or_default();
                        apply_update(&doc, update)?
                    };
                    rows.insert(key, updated);
                }
            }
            WriteModel::DeleteOne { filter } => {
                let found = rows
                    .iter()
                    .find(|(_, doc)| matches(doc, filter))
                    .map(|(key, _)| key.clone());
                if let Some(key) = found {
                    rows.remove(&key);
                }
            }
            WriteModel::DeleteMany { filter } => {
                rows.retain(|_, doc| !matches(doc, filter));
            }
        }
        Ok(())
    }
}

impl LocalCollection for MemoryCollection {
    fn find(&self, filter: &Document) -> StoreResult<Vec<Document>> {
        Ok(self
            .read()
            .values()
            .filter(|doc| matches(doc, filter))
            .cloned()
            .collect())
    }

    fn find_one(&self, filter: &Document) -> StoreResult<Option<Document>> {
        Ok(self
            .read()
            .values()
            .find(|doc| matches(doc, filter))
            .cloned())
    }

    fn find_one_and_update(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
        returning: ReturnDocument,
    ) -> StoreResult<Option<Document>> {
        let mut rows = self.write();
        let found = rows
            .iter()
            .find(|(_, doc)| matches(doc, filter))
            .map(|(key, doc)| (key.clone(), doc.clone()));
        match found {
            Some((key, before)) => {
                let after = apply_update(&before, update)?;
                rows.insert(key, after.clone());
                Ok(Some(match returning {
                    ReturnDocument::Before => before,
                    ReturnDocument::After => after,
                }))
            }
            None if upsert => {
                let seed = upsert_seed(filter);
                let after = apply_update(&seed, update)?;
                let key = Self::insert_locked(&mut rows, &after)?;
                let inserted = rows.get(&key).cloned();
                Ok(match returning {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => inserted,
                })
            }
            None => Ok(None),
        }
    }

    fn find_one_and_replace(
        &self,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StoreResult<Option<Document>> {
        let mut rows = self.write();
        let found = rows
            .iter()
            .find(|(_, doc)| matches(doc, filter))
            .map(|(key, doc)| (key.clone(), doc.clone()));
        match found {
            Some((key, before)) => {
                let mut doc = replacement.clone();
                if !doc.contains_key("_id") {
                    if let Some(id) = before.get("_id") {
                        doc.insert("_id", id.clone());
                    }
                }
                rows.insert(key, doc);
                Ok(Some(before))
            }
            None if upsert => {
                let mut doc = replacement.clone();
                if !doc.contains_key("_id") {
                    if let Some(id) = filter.get("_id") {
                        if !matches!(id, Bson::Document(_)) {
                            doc.insert("_id", id.clone());
                        }
                    }
                }
                Self::insert_locked(&mut rows, &doc)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn insert_one(&self, document: &Document) -> StoreResult<()> {
        let mut rows = self.write();
        Self::insert_locked(&mut rows, document)?;
        Ok(())
    }

    fn insert_many(&self, documents: &[Document]) -> StoreResult<()> {
        let mut rows = self.write();
        for document in documents {
            Self::insert_locked(&mut rows, document)?;
        }
        Ok(())
    }

    fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        let mut rows = self.write();
        let found = rows
            .iter()
            .find(|(_, doc)| matches(doc, filter))
            .map(|(key, doc)| (key.clone(), doc.clone()));
        match found {
            Some((key, before)) => {
                let after = apply_update(&before, update)?;
                let modified = u64::from(after != before);
                rows.insert(key, after);
                Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: modified,
                    upserted_id: None,
                })
            }
            None if upsert => {
                let seed = upsert_seed(filter);
                let after = apply_update(&seed, update)?;
                let key = Self::insert_locked(&mut rows, &after)?;
                Ok(UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                    upserted_id: Some(key.into_value()),
                })
            }
            None => Ok(UpdateResult::default()),
        }
    }

    fn update_many(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        let mut rows = self.write();
        let keys: Vec<DocumentKey> = rows
            .iter()
            .filter(|(_, doc)| matches(doc, filter))
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() && upsert {
            let seed = upsert_seed(filter);
            let after = apply_update(&seed, update)?;
            let key = Self::insert_locked(&mut rows, &after)?;
            return Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(key.into_value()),
            });
        }
        let mut modified = 0;
        for key in &keys {
            let before = rows.get(key).cloned().unwrap_or_default();
            let after = apply_update(&before, update)?;
            if after != before {
                modified += 1;
            }
            rows.insert(key.clone(), after);
        }
        Ok(UpdateResult {
            matched_count: keys.len() as u64,
            modified_count: modified,
            upserted_id: None,
        })
    }

    fn delete_one(&self, filter: &Document) -> StoreResult<DeleteResult> {
        let mut rows = self.write();
        let found = rows
            .iter()
            .find(|(_, doc)| matches(doc, filter))
            .map(|(key, _)| key.clone());
        match found {
            Some(key) => {
                rows.remove(&key);
                Ok(DeleteResult { deleted_count: 1 })
            }
            None => Ok(DeleteResult::default()),
        }
    }

    fn delete_many(&self, filter: &Document) -> StoreResult<DeleteResult> {
        let mut rows = self.write();
        let before = rows.len();
        rows.retain(|_, doc| !matches(doc, filter));
        Ok(DeleteResult {
            deleted_count: (before - rows.len()) as u64,
        })
    }

    fn bulk_write(&self, models: &[WriteModel]) -> StoreResult<()> {
        let mut rows = self.write();
        for model in models {
            Self::apply_model(&mut rows, model)?;
        }
        Ok(())
    }

    fn count(&self, filter: &Document) -> StoreResult<u64> {
        Ok(self.read().values().filter(|doc| matches(doc, filter)).count() as u64)
    }

    fn aggregate(&self, pipeline: &[Document]) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self.read().values().cloned().collect();
        for stage in pipeline {
            let (name, spec) = stage
                .iter()
                .next()
                .ok_or_else(|| StoreError::InvalidFilter("empty pipeline stage".into()))?;
            match (name.as_str(), spec) {
                ("$match", Bson::Document(filter)) => {
                    docs.retain(|doc| matches(doc, filter));
                }
                ("$limit", Bson::Int32(n)) => docs.truncate((*n).max(0) as usize),
                ("$limit", Bson::Int64(n)) => docs.truncate((*n).max(0) as usize),
                (other, _) => {
                    return Err(StoreError::UnsupportedPipelineStage(other.to_string()))
                }
            }
        }
        Ok(docs)
    }
}

/// Seed document for an upsert: the filter's equality fields.
fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter.iter() {
        if key.starts_with('$') || matches!(value, Bson::Document(_)) {
            continue;
        }
        seed.insert(key.clone(), value.clone());
    }
    seed
}

/// Whether a document satisfies a filter: dotted-path equality plus
/// `$in` / `$nin` / `$exists`.
pub(crate) fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| {
        let actual = get_path(doc, path);
        match expected {
            Bson::Document(spec) if is_operator_spec(spec) => {
                spec.iter().all(|(op, operand)| match (op.as_str(), operand) {
                    ("$in", Bson::Array(values)) => actual
                        .map(|a| values.iter().any(|v| bson_eq(a, v)))
                        .unwrap_or(false),
                    ("$nin", Bson::Array(values)) => actual
                        .map(|a| !values.iter().any(|v| bson_eq(a, v)))
                        .unwrap_or(true),
                    ("$exists", Bson::Boolean(want)) => actual.is_some() == *want,
                    _ => false,
                })
            }
            expected => actual.map(|a| bson_eq(a, expected)).unwrap_or(false),
        }
    })
}

fn is_operator_spec(spec: &Document) -> bool {
    spec.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

fn bson_eq(a: &Bson, b: &Bson) -> bool {
    cmp_bson(a, b) == std::cmp::Ordering::Equal
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => match doc.get(head) {
            Some(Bson::Document(sub)) => get_path(sub, rest),
            _ => None,
        },
    }
}

/// Applies an update document. Operator updates support `$set` / `$unset` /
/// `$inc`; anything else is treated as a full replacement (preserving `_id`).
pub(crate) fn apply_update(before: &Document, update: &Document) -> StoreResult<Document> {
    let operator_update = update.keys().any(|k| k.starts_with('$'));
    if !operator_update {
        let mut doc = update.clone();
        if !doc.contains_key("_id") {
            if let Some(id) = before.get("_id") {
                doc.insert("_id", id.clone());
            }
        }
        return Ok(doc);
    }
    let mut out = before.clone();
    for (op, spec) in update.iter() {
        let spec = match spec {
            Bson::Document(spec) => spec,
            _ => {
                return Err(StoreError::InvalidUpdate(format!(
                    "{op} operand must be a document"
                )))
            }
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in spec.iter() {
                    set_path(&mut out, path, value.clone());
                }
            }
            "$unset" => {
                for (path, _) in spec.iter() {
                    remove_path(&mut out, path);
                }
            }
            "$inc" => {
                for (path, delta) in spec.iter() {
                    let current = get_path(&out, path).cloned().unwrap_or(Bson::Int64(0));
                    let next = match (current, delta) {
                        (Bson::Int32(a), Bson::Int32(b)) => Bson::Int32(a + b),
                        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(i64::from(a) + b),
                        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
                        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a + b),
                        (Bson::Double(a), Bson::Double(b)) => Bson::Double(a + b),
                        _ => {
                            return Err(StoreError::InvalidUpdate(format!(
                                "$inc on non-numeric field {path}"
                            )))
                        }
                    };
                    set_path(&mut out, path, next);
                }
            }
            other => {
                return Err(StoreError::InvalidUpdate(format!(
                    "unsupported update operator {other}"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn coll() -> MemoryCollection {
        MemoryCollection::default()
    }

    #[test]
    fn insert_and_find_by_equality() {
        let c = coll();
        c.insert_one(&doc! { "_id": 1, "x": "a" }).expect("insert");
        c.insert_one(&doc! { "_id": 2, "x": "b" }).expect("insert");
        let found = c.find(&doc! { "x": "b" }).expect("find");
        assert_eq!(found, vec![doc! { "_id": 2, "x": "b" }]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let c = coll();
        c.insert_one(&doc! { "_id": 1 }).expect("insert");
        let err = c.insert_one(&doc! { "_id": 1 }).expect_err("duplicate");
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn in_and_nin_filters() {
        let c = coll();
        for id in 1..=4 {
            c.insert_one(&doc! { "_id": id }).expect("insert");
        }
        let picked = c
            .find(&doc! { "_id": { "$in": [1, 3] } })
            .expect("find");
        assert_eq!(picked.len(), 2);
        c.delete_many(&doc! { "_id": { "$nin": [1, 3] } })
            .expect("delete");
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn exists_filter_matches_field_presence() {
        let c = coll();
        c.insert_one(&doc! { "_id": 1, "v": 1 }).expect("insert");
        c.insert_one(&doc! { "_id": 2 }).expect("insert");
        let without = c
            .find(&doc! { "v": { "$exists": false } })
            .expect("find");
        assert_eq!(without, vec![doc! { "_id": 2 }]);
    }

    #[test]
    fn update_one_applies_set_and_unset() {
        let c = coll();
        c.insert_one(&doc! { "_id": 1, "a": 1, "b": 2 }).expect("insert");
        let result = c
            .update_one(&doc! { "_id": 1 }, &doc! { "$set": { "a": 9 }, "$unset": { "b": 1 } }, false)
            .expect("update");
        assert_eq!(result.matched_count, 1);
        assert_eq!(
            c.find_one(&doc! { "_id": 1 }).expect("find"),
            Some(doc! { "_id": 1, "a": 9 })
        );
    }

    #[test]
    fn upsert_creates_from_filter_and_update() {
        let c = coll();
        let result = c
            .update_one(&doc! { "_id": 5 }, &doc! { "$set": { "x": "a" } }, true)
            .expect("upsert");
        assert_eq!(result.upserted_id, Some(Bson::Int32(5)));
        assert_eq!(
            c.find_one(&doc! { "_id": 5 }).expect("find"),
            Some(doc! { "_id": 5, "x": "a" })
        );
    }

    #[test]
    fn replacement_update_preserves_id() {
        let c = coll();
        c.insert_one(&doc! { "_id": 1, "old": true }).expect("insert");
        c.update_one(&doc! { "_id": 1 }, &doc! { "fresh": true }, false)
            .expect("replace");
        assert_eq!(
            c.find_one(&doc! { "_id": 1 }).expect("find"),
            Some(doc! { "fresh": true, "_id": 1 })
        );
    }

    #[test]
    fn bulk_write_applies_models_in_order() {
        let c = coll();
        c.bulk_write(&[
            WriteModel::InsertOne {
                document: doc! { "_id": 1, "x": 1 },
            },
            WriteModel::ReplaceOne {
                filter: doc! { "_id": 1 },
                replacement: doc! { "_id": 1, "x": 2 },
                upsert: false,
            },
            WriteModel::InsertOne {
                document: doc! { "_id": 2 },
            },
            WriteModel::DeleteOne {
                filter: doc! { "_id": 2 },
            },
        ])
        .expect("bulk");
        assert_eq!(c.dump(), vec![doc! { "_id": 1, "x": 2 }]);
    }

    #[test]
    fn aggregate_match_and_limit() {
        let c = coll();
        for id in 1..=5 {
            c.insert_one(&doc! { "_id": id, "even": id % 2 == 0 }).expect("insert");
        }
        let out = c
            .aggregate(&[doc! { "$match": { "even": false } }, doc! { "$limit": 2 }])
            .expect("aggregate");
        assert_eq!(out.len(), 2);
        let err = c.aggregate(&[doc! { "$group": {} }]).expect_err("unsupported");
        assert!(matches!(err, StoreError::UnsupportedPipelineStage(_)));
    }

    #[test]
    fn find_one_and_update_returns_requested_image() {
        let c = coll();
        c.insert_one(&doc! { "_id": 1, "n": 1 }).expect("insert");
        let after = c
            .find_one_and_update(
                &doc! { "_id": 1 },
                &doc! { "$inc": { "n": 1 } },
                false,
                ReturnDocument::After,
            )
            .expect("update");
        assert_eq!(after, Some(doc! { "_id": 1, "n": 2 }));
    }
}
