use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use livedoc_core::{
    error::{DocumentStoreError, DocumentStoreResult},
    storage::StorageAdapter,
};
use livedoc_engine::{Collection, MemoryStorage, UpdateOptions};

/// Lets spawned writer tasks catch up on the current-thread runtime.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Default)]
struct BrokenStorage {
    writes: AtomicUsize,
}

#[async_trait]
impl StorageAdapter for BrokenStorage {
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>> {
        Err(DocumentStoreError::Storage(format!("cannot read {key}")))
    }

    async fn set(&self, key: &str, _documents: Vec<Document>) -> DocumentStoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(DocumentStoreError::Storage(format!("cannot write {key}")))
    }
}

/// Holds every read until the gate is opened.
struct GatedStorage {
    gate: mea::latch::Latch,
    inner: MemoryStorage,
}

impl std::fmt::Debug for GatedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedStorage").field("inner", &self.inner).finish()
    }
}

#[async_trait]
impl StorageAdapter for GatedStorage {
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>> {
        self.gate.wait().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        self.inner.set(key, documents).await
    }
}

#[tokio::test]
async fn collections_load_their_stored_documents() {
    let storage = MemoryStorage::new();
    storage
        .set("todos", vec![doc! { "id": "a", "title": "one" }, doc! { "id": "b", "title": "two" }])
        .await
        .unwrap();

    let todos = Collection::builder("todos").storage(storage.clone()).build().unwrap();
    assert!(todos.meta().is_err());

    todos.ready().await;
    assert!(todos.is_ready());
    assert_eq!(todos.count(doc! {}), 2);
    assert_eq!(todos.find_one(doc! { "id": "b" }).unwrap().get_str("title").unwrap(), "two");
}

#[tokio::test]
async fn every_change_is_mirrored_to_storage() {
    let storage = MemoryStorage::new();
    let todos = Collection::builder("todos").storage(storage.clone()).open().await.unwrap();

    todos.insert(doc! { "id": "a", "done": false }).unwrap();
    todos.update(doc! { "id": "a" }, doc! { "$set": { "done": true } }, UpdateOptions::default());
    settle().await;

    assert_eq!(storage.documents("todos").await, Some(vec![doc! { "id": "a", "done": true }]));

    let reopened = Collection::builder("todos").storage(storage.clone()).open().await.unwrap();
    assert_eq!(reopened.count(doc! { "done": true }), 1);
}

#[tokio::test]
async fn nothing_is_written_until_something_changes() {
    let storage = MemoryStorage::new();
    let _todos = Collection::builder("todos").storage(storage.clone()).open().await.unwrap();
    settle().await;

    assert_eq!(storage.documents("todos").await, None);
}

#[tokio::test]
async fn broken_storage_yields_an_empty_ready_collection() {
    let storage = Arc::new(BrokenStorage::default());
    let todos = Collection::builder("todos")
        .shared_storage(storage.clone())
        .open()
        .await
        .unwrap();

    assert_eq!(todos.count(doc! {}), 0);

    todos.insert(doc! { "id": "a" }).unwrap();
    settle().await;

    assert_eq!(todos.count(doc! {}), 1);
    assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn on_ready_callbacks_fire_after_loading() {
    let storage = MemoryStorage::new();
    let todos = Collection::builder("todos").storage(storage).build().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    todos.on_ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    todos.ready().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let counter = Arc::clone(&fired);
    todos.on_ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn meta_values_persist_through_the_shared_adapter() {
    let storage = MemoryStorage::new();

    let todos = Collection::builder("todos").storage(storage.clone()).open().await.unwrap();
    todos.meta().unwrap().set("schema", 3);
    settle().await;

    assert_eq!(storage.documents("_meta").await, Some(vec![doc! { "id": "todos", "schema": 3 }]));
    assert_eq!(storage.keys().await, vec!["_meta"]);

    let reopened = Collection::builder("todos").storage(storage.clone()).open().await.unwrap();
    assert_eq!(reopened.meta().unwrap().get_as::<i32>("schema").unwrap(), Some(3));
}

#[tokio::test]
async fn meta_is_not_ready_while_loading() {
    let storage = Arc::new(GatedStorage { gate: mea::latch::Latch::new(1), inner: MemoryStorage::new() });
    let todos = Collection::builder("todos").storage(Arc::clone(&storage)).build().unwrap();

    settle().await;
    assert!(!todos.is_ready());
    assert!(matches!(todos.meta(), Err(DocumentStoreError::NotReady(_))));

    storage.gate.count_down();
    todos.ready().await;
    assert!(todos.meta().is_ok());
}
