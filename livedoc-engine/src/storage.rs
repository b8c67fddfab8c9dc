//! In-memory persistence adapter.
//!
//! [`MemoryStorage`] keeps every stored value in a `HashMap` behind an
//! async-aware read-write lock. It is mostly useful in tests, and to share a
//! "persisted" state between several collections of one process.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};
use mea::rwlock::RwLock;

use livedoc_core::{error::DocumentStoreResult, storage::StorageAdapter};

type StoreMap = HashMap<String, Bson>;

/// Thread-safe in-memory [`StorageAdapter`].
///
/// Clones share the same underlying map.
///
/// # Example
///
/// ```ignore
/// use livedoc_engine::{Collection, storage::MemoryStorage};
///
/// let storage = MemoryStorage::new();
/// let todos = Collection::builder("todos").storage(storage.clone()).open().await?;
/// todos.insert(doc! { "title": "write docs" })?;
/// ```
#[derive(Default, Clone, Debug)]
pub struct MemoryStorage {
    store: Arc<RwLock<StoreMap>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw value under `key`, bypassing the document-list shape.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<Bson>) {
        self.store.write().await.insert(key.into(), value.into());
    }

    /// Returns the documents stored under `key`, if the value is a document list.
    pub async fn documents(&self, key: &str) -> Option<Vec<Document>> {
        match self.store.read().await.get(key) {
            Some(Bson::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_document().cloned())
                    .collect(),
            ),
            _ => None,
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys = self.store.read().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>> {
        Ok(self.store.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        let value = Bson::Array(documents.into_iter().map(Bson::Document).collect());
        self.store.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn clones_share_state() {
        let storage = MemoryStorage::new();
        let other = storage.clone();

        storage.set("todos", vec![doc! { "id": "a" }]).await.unwrap();

        assert_eq!(other.documents("todos").await, Some(vec![doc! { "id": "a" }]));
        assert_eq!(other.keys().await, vec!["todos"]);
        assert_eq!(other.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn raw_values_are_returned_as_is() {
        let storage = MemoryStorage::new();
        storage.put("odd", "not a list").await;

        assert_eq!(storage.get("odd").await.unwrap(), Some(Bson::from("not a list")));
        assert_eq!(storage.documents("odd").await, None);
    }
}
