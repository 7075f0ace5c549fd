//! Namespace identity: a (database, collection) pair.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a logical collection on both the local and the remote side.
///
/// Equality and ordering are by the (database, collection) pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Database holding the user-visible copies of synchronized documents.
    pub fn user_database(&self) -> String {
        format!("sync_user_{}", self.database)
    }

    /// Database holding pre-images written before every local mutation.
    pub fn undo_database(&self) -> String {
        format!("sync_undo_{}", self.database)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_equality_is_by_pair() {
        assert_eq!(Namespace::new("app", "items"), Namespace::new("app", "items"));
        assert_ne!(Namespace::new("app", "items"), Namespace::new("app", "other"));
        assert_ne!(Namespace::new("app", "items"), Namespace::new("alt", "items"));
    }

    #[test]
    fn derived_database_names() {
        let ns = Namespace::new("app", "items");
        assert_eq!(ns.user_database(), "sync_user_app");
        assert_eq!(ns.undo_database(), "sync_undo_app");
        assert_eq!(ns.to_string(), "app.items");
    }
}
