//! Structural diff between two documents, expressed as dotted-path updates.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// The minimal `{updated_fields, removed_fields}` such that applying it to
/// the before-image yields the after-image. Paths into nested documents use
/// dot notation; arrays are treated as opaque values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }

    /// Diffs two documents.
    pub fn diff(before: &Document, after: &Document) -> Self {
        let mut desc = UpdateDescription::default();
        diff_into("", before, after, &mut desc);
        desc
    }

    /// Coalesces a newer description onto this one. The newer description's
    /// sets win; its removals cancel earlier sets at the same path.
    pub fn merge(&self, newer: &UpdateDescription) -> UpdateDescription {
        let mut updated = self.updated_fields.clone();
        let mut removed: Vec<String> = self.removed_fields.clone();
        for path in &newer.removed_fields {
            updated.remove(path);
            if !removed.contains(path) {
                removed.push(path.clone());
            }
        }
        for (path, value) in newer.updated_fields.iter() {
            removed.retain(|r| r != path);
            updated.insert(path.clone(), value.clone());
        }
        UpdateDescription {
            updated_fields: updated,
            removed_fields: removed,
        }
    }

    /// Applies this description to a base document.
    pub fn apply_to(&self, base: &Document) -> Document {
        let mut out = base.clone();
        for path in &self.removed_fields {
            remove_path(&mut out, path);
        }
        for (path, value) in self.updated_fields.iter() {
            set_path(&mut out, path, value.clone());
        }
        out
    }

    /// Renders `{$set: ..., $unset: ...}` suitable for an update operation.
    /// Empty sections are omitted.
    pub fn to_update_document(&self) -> Document {
        let mut update = Document::new();
        if !self.updated_fields.is_empty() {
            update.insert("$set", self.updated_fields.clone());
        }
        if !self.removed_fields.is_empty() {
            let mut unsets = Document::new();
            for path in &self.removed_fields {
                unsets.insert(path.clone(), true);
            }
            update.insert("$unset", unsets);
        }
        update
    }
}

fn diff_into(prefix: &str, before: &Document, after: &Document, out: &mut UpdateDescription) {
    for (key, before_value) in before.iter() {
        let path = join_path(prefix, key);
        match after.get(key) {
            None => out.removed_fields.push(path),
            Some(after_value) if after_value == before_value => {}
            Some(Bson::Document(after_sub)) => {
                if let Bson::Document(before_sub) = before_value {
                    diff_into(&path, before_sub, after_sub, out);
                } else {
                    out.updated_fields
                        .insert(path, Bson::Document(after_sub.clone()));
                }
            }
            Some(after_value) => {
                out.updated_fields.insert(path, after_value.clone());
            }
        }
    }
    for (key, after_value) in after.iter() {
        if !before.contains_key(key) {
            out.updated_fields
                .insert(join_path(prefix, key), after_value.clone());
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Sets a dotted path, creating intermediate subdocuments as needed.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head.to_string(), Document::new());
            }
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                set_path(sub, rest, value);
            }
        }
    }
}

/// Removes a dotted path if present.
pub(crate) fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                remove_path(sub, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn diff_of_identical_documents_is_empty() {
        let d = doc! { "a": 1, "b": { "c": "x" } };
        assert!(UpdateDescription::diff(&d, &d).is_empty());
    }

    #[test]
    fn diff_applied_to_before_yields_after() {
        let before = doc! { "a": 1, "b": { "c": "x", "d": 2 }, "gone": true };
        let after = doc! { "a": 1, "b": { "c": "y" }, "new": [1, 2] };
        let desc = UpdateDescription::diff(&before, &after);
        assert_eq!(desc.apply_to(&before), after);
    }

    #[test]
    fn diff_uses_dotted_paths_for_nested_changes() {
        let before = doc! { "b": { "c": "x", "d": 2 } };
        let after = doc! { "b": { "c": "y", "d": 2 } };
        let desc = UpdateDescription::diff(&before, &after);
        assert_eq!(desc.updated_fields, doc! { "b.c": "y" });
        assert!(desc.removed_fields.is_empty());
    }

    #[test]
    fn merge_lets_newer_sets_win_and_removals_cancel() {
        let older = UpdateDescription {
            updated_fields: doc! { "a": 1, "b": 2 },
            removed_fields: vec!["c".into()],
        };
        let newer = UpdateDescription {
            updated_fields: doc! { "b": 3, "c": 4 },
            removed_fields: vec!["a".into()],
        };
        let merged = older.merge(&newer);
        assert_eq!(merged.updated_fields, doc! { "b": 3, "c": 4 });
        assert_eq!(merged.removed_fields, vec!["a".to_string()]);
    }

    #[test]
    fn to_update_document_omits_empty_sections() {
        let desc = UpdateDescription {
            updated_fields: doc! { "x": 1 },
            removed_fields: Vec::new(),
        };
        assert_eq!(desc.to_update_document(), doc! { "$set": { "x": 1 } });
        assert!(UpdateDescription::default().to_update_document().is_empty());
    }
}
