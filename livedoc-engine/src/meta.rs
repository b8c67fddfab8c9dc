//! Per-collection metadata.
//!
//! Every collection keeps a small key/value record in the reserved `_meta`
//! collection, stored under the same adapter as the collection itself. The
//! record is the `_meta` document whose id is the owning collection's name.

use bson::{Bson, de::deserialize_from_bson};
use serde::de::DeserializeOwned;

use livedoc_core::{
    document::ID_FIELD,
    error::{DocumentStoreError, DocumentStoreResult},
    modifier::Modifier,
    query::Filter,
    storage::SharedStorage,
};

use crate::collection::{Collection, CollectionBuilder, UpdateOptions, UpdateResult};

/// Name of the reserved collection holding every collection's metadata.
pub const META_COLLECTION: &str = "_meta";

/// Key/value metadata of one collection.
///
/// # Example
///
/// ```ignore
/// let todos = Collection::builder("todos").storage(storage).open().await?;
/// todos.meta()?.set("schema_version", 3);
/// assert_eq!(todos.meta()?.get_as::<i32>("schema_version")?, Some(3));
/// ```
#[derive(Debug, Clone)]
pub struct Meta {
    owner: String,
    collection: Collection,
}

impl Meta {
    pub(crate) fn new(owner: &str, storage: Option<SharedStorage>) -> DocumentStoreResult<Self> {
        Ok(Self {
            owner: owner.to_string(),
            collection: CollectionBuilder::build_meta(storage)?,
        })
    }

    pub(crate) fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Name of the collection this record belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn get(&self, key: &str) -> Option<Bson> {
        self.collection
            .find_one(Filter::eq(ID_FIELD, self.owner.as_str()))
            .and_then(|record| record.get(key).cloned())
    }

    /// Reads `key` and deserializes it.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> DocumentStoreResult<Option<T>> {
        self.get(key)
            .map(|value| deserialize_from_bson(value).map_err(DocumentStoreError::from))
            .transpose()
    }

    /// Sets `key`, creating the record on first use.
    pub fn set(&self, key: &str, value: impl Into<Bson>) -> UpdateResult {
        self.collection.update(
            Filter::eq(ID_FIELD, self.owner.as_str()),
            Modifier::new().set(key, value),
            UpdateOptions::upsert(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_upserted_per_owner() {
        let todos = Collection::new("todos").unwrap();
        let meta = todos.meta().unwrap();

        assert_eq!(meta.get("version"), None);
        assert_eq!(meta.set("version", 1).upserted_id.as_deref(), Some("todos"));
        assert_eq!(meta.set("version", 2).modified_count, 1);

        assert_eq!(meta.get("version"), Some(Bson::Int32(2)));
        assert_eq!(meta.get_as::<i64>("version").unwrap(), Some(2));
    }

    #[test]
    fn the_meta_collection_has_no_meta() {
        let meta = Meta::new("todos", None).unwrap();
        assert!(meta.collection().meta().is_err());
        assert_eq!(meta.collection().name(), META_COLLECTION);
    }
}
