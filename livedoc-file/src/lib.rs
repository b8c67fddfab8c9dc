//! JSON file persistence for livedoc collections.
//!
//! [`FileStorage`] implements
//! [`StorageAdapter`](livedoc_core::storage::StorageAdapter) on top of a
//! directory: each key is stored as a pretty-printed JSON array in
//! `<dir>/<key>.json`. Collection names are restricted to lowercase letters,
//! digits and underscores, so keys are always safe file names.
//!
//! # Example
//!
//! ```ignore
//! use livedoc::{Collection, file::FileStorage};
//!
//! let todos = Collection::builder("todos")
//!     .storage(FileStorage::new("./data"))
//!     .open()
//!     .await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as livedoc_file;

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::fs;
use tracing::trace;

use livedoc_core::{error::DocumentStoreResult, storage::StorageAdapter};

/// Stores every key as a JSON file inside one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates an adapter rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>> {
        let path = self.path_for(key);

        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        trace!(path = %path.display(), bytes = text.len(), "read collection file");
        Ok(Some(serde_json::from_str::<Bson>(&text)?))
    }

    async fn set(&self, key: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let text = serde_json::to_string_pretty(&documents)?;

        // Readers never see a half-written file.
        let staging = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&staging, text).await?;
        fs::rename(&staging, &path).await?;

        trace!(path = %path.display(), len = documents.len(), "wrote collection file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use livedoc_engine::Collection;

    #[tokio::test]
    async fn missing_files_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.get("todos").await.unwrap(), None);
    }

    #[tokio::test]
    async fn documents_are_written_as_json_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("data"));

        storage
            .set("todos", vec![doc! { "id": "a", "title": "one", "tags": ["x"] }])
            .await
            .unwrap();

        let text = std::fs::read_to_string(storage.path_for("todos")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json, serde_json::json!([{ "id": "a", "title": "one", "tags": ["x"] }]));

        let Some(Bson::Array(items)) = storage.get("todos").await.unwrap() else {
            panic!("expected an array");
        };
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        std::fs::write(storage.path_for("todos"), "{ not json").unwrap();

        assert!(storage.get("todos").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn collections_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let todos = Collection::builder("todos").storage(storage.clone()).open().await.unwrap();
        todos.insert(doc! { "id": "a", "done": false, "n": 2 }).unwrap();
        todos.meta().unwrap().set("schema", 1);

        let path = storage.path_for("todos");
        for _ in 0..200 {
            if path.exists() && storage.path_for("_meta").exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        drop(todos);

        let reopened = Collection::builder("todos").storage(storage).open().await.unwrap();
        assert_eq!(reopened.count(doc! { "done": false, "n": 2 }), 1);
        assert_eq!(reopened.meta().unwrap().get_as::<i64>("schema").unwrap(), Some(1));
    }
}
