//! Named, reactive document collections.
//!
//! A [`Collection`] owns one [`DocumentTable`] and is the only way to write to
//! it. Every write clones the current mapping, applies its change and installs
//! the result, after which live cursors recompute and observers are notified.
//!
//! Collections optionally persist themselves through a
//! [`StorageAdapter`](livedoc_core::storage::StorageAdapter) and expire
//! documents through TTL indexes. Both need a Tokio runtime; a plain in-memory
//! collection does not.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use livedoc::prelude::*;
//!
//! let todos = Collection::builder("todos")
//!     .storage(MemoryStorage::new())
//!     .ttl_index(TtlIndex::new("created_at", 3600))
//!     .open()
//!     .await?;
//!
//! let id = todos.insert(doc! { "title": "write docs", "done": false })?;
//! todos.update(doc! { "id": id.as_str() }, doc! { "$set": { "done": true } }, UpdateOptions::default());
//!
//! todos.transaction(|| async {
//!     todos.remove(doc! { "done": true });
//!     Ok::<_, DocumentStoreError>(())
//! }).await?;
//! ```

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bson::{Bson, Document};
use mea::{latch::Latch, mutex::Mutex as AsyncMutex};
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use livedoc_core::{
    config::{CollectionConfig, TtlIndex},
    document::{ID_FIELD, document_id, new_id},
    error::{DocumentStoreError, DocumentStoreResult},
    modifier::Modifier,
    query::{FindOptions, Query},
    storage::{SharedStorage, StorageAdapter},
};

use crate::{
    cursor::{Cursor, TableSource},
    evaluator::matches,
    meta::{META_COLLECTION, Meta},
    persistence, ttl,
    table::{DocMap, DocumentTable},
    updater::{ApplyContext, apply_modifier},
};

/// Options for [`Collection::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Insert a document built from the query's equality fields when nothing matches.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// Outcome of [`Collection::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: usize,
    pub modified_count: usize,
    pub upserted_count: usize,
    pub upserted_id: Option<String>,
}

/// Returns true when `name` matches `^[a-z][a-z0-9_]*$`.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

/// One-shot readiness signal with callbacks.
struct Readiness {
    ready: AtomicBool,
    latch: Latch,
    callbacks: Mutex<Vec<ReadyCallback>>,
}

impl Readiness {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            latch: Latch::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn mark_ready(&self) {
        let callbacks = {
            let mut callbacks = self.callbacks.lock();
            self.ready.store(true, Ordering::Release);
            std::mem::take(&mut *callbacks)
        };

        self.latch.count_down();
        for callback in callbacks {
            callback();
        }
    }

    fn on_ready(&self, callback: ReadyCallback) {
        {
            let mut callbacks = self.callbacks.lock();
            if !self.is_ready() {
                callbacks.push(callback);
                return;
            }
        }

        callback();
    }

    async fn wait(&self) {
        self.latch.wait().await;
    }
}

struct CollectionInner {
    name: String,
    table: Arc<DocumentTable>,
    config: CollectionConfig,
    readiness: Arc<Readiness>,
    transactions: AsyncMutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    meta: Option<Meta>,
}

impl Drop for CollectionInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Builder for [`Collection`].
#[derive(Debug)]
pub struct CollectionBuilder {
    name: String,
    config: CollectionConfig,
    storage: Option<SharedStorage>,
}

impl CollectionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CollectionConfig::default(),
            storage: None,
        }
    }

    /// Persists the collection through `storage` under the collection's name.
    pub fn storage(self, storage: impl StorageAdapter + 'static) -> Self {
        self.shared_storage(Arc::new(storage))
    }

    pub fn shared_storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn ttl_index(mut self, index: TtlIndex) -> Self {
        self.config.ttl_indexes.push(index);
        self
    }

    pub fn ttl_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_ttl_interval(interval);
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates the collection. Loading from storage continues in the
    /// background; use [`Collection::ready`] or [`open`](Self::open) to wait.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name, or when storage or TTL indexes are configured
    /// outside a Tokio runtime.
    pub fn build(self) -> DocumentStoreResult<Collection> {
        if !is_valid_name(&self.name) {
            return Err(DocumentStoreError::InvalidCollectionName(self.name));
        }

        let meta = Meta::new(&self.name, self.storage.clone())?;
        self.create(Some(meta))
    }

    /// Creates the collection and waits until it is ready.
    pub async fn open(self) -> DocumentStoreResult<Collection> {
        let collection = self.build()?;
        collection.ready().await;
        Ok(collection)
    }

    /// Creates the reserved meta collection, which has no meta of its own.
    pub(crate) fn build_meta(storage: Option<SharedStorage>) -> DocumentStoreResult<Collection> {
        let builder = Self {
            name: META_COLLECTION.to_string(),
            config: CollectionConfig::default(),
            storage,
        };
        builder.create(None)
    }

    fn create(self, meta: Option<Meta>) -> DocumentStoreResult<Collection> {
        let CollectionBuilder { name, config, storage } = self;

        let handle = if storage.is_some() || !config.ttl_indexes.is_empty() {
            Some(Handle::try_current().map_err(|err| {
                DocumentStoreError::Initialization(format!(
                    "collection '{name}' needs a Tokio runtime for storage or TTL: {err}"
                ))
            })?)
        } else {
            None
        };

        let table = Arc::new(DocumentTable::new(name.clone()));
        let readiness = Arc::new(Readiness::new());
        let meta_readiness = meta.as_ref().map(|meta| meta.collection().readiness());

        let sweeper = match &handle {
            Some(handle) if !config.ttl_indexes.is_empty() => Some(ttl::spawn(
                handle,
                Arc::downgrade(&table),
                config.ttl_indexes.clone(),
                config.ttl_interval(),
            )),
            _ => None,
        };

        match (storage, handle) {
            (Some(storage), Some(handle)) => {
                let table = Arc::clone(&table);
                let readiness = Arc::clone(&readiness);
                let key = name.clone();

                handle.spawn(async move {
                    if let Some(docs) = persistence::load(storage.as_ref(), &key).await {
                        table.install(docs);
                    }
                    persistence::mirror(&table, storage, key);

                    if let Some(meta) = meta_readiness {
                        meta.wait().await;
                    }
                    readiness.mark_ready();
                });
            }
            _ => readiness.mark_ready(),
        }

        debug!(collection = %name, ttl_indexes = config.ttl_indexes.len(), "created collection");

        Ok(Collection {
            inner: Arc::new(CollectionInner {
                name,
                table,
                config,
                readiness,
                transactions: AsyncMutex::new(()),
                sweeper: Mutex::new(sweeper),
                meta,
            }),
        })
    }
}

/// A named, reactive collection of documents.
///
/// Cloning is cheap and yields a handle to the same collection. All writes are
/// synchronous; persistence happens in the background.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// Creates an in-memory collection without storage or TTL.
    pub fn new(name: impl Into<String>) -> DocumentStoreResult<Self> {
        CollectionBuilder::new(name).build()
    }

    pub fn builder(name: impl Into<String>) -> CollectionBuilder {
        CollectionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    fn readiness(&self) -> Arc<Readiness> {
        Arc::clone(&self.inner.readiness)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    /// Resolves once the stored documents are loaded and the meta store is ready.
    pub async fn ready(&self) {
        self.inner.readiness.wait().await;
    }

    /// Runs `callback` once the collection is ready, immediately if it already is.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.readiness.on_ready(Box::new(callback));
    }

    /// The per-collection metadata store.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::NotReady`] before the collection is ready,
    /// and always for the reserved meta collection itself.
    pub fn meta(&self) -> DocumentStoreResult<&Meta> {
        match &self.inner.meta {
            Some(meta) if self.is_ready() => Ok(meta),
            Some(_) => Err(DocumentStoreError::NotReady(format!(
                "collection '{}' is still loading",
                self.inner.name
            ))),
            None => Err(DocumentStoreError::NotReady(format!(
                "collection '{}' has no meta store",
                self.inner.name
            ))),
        }
    }

    /// Inserts a document and returns its id.
    ///
    /// A missing, null or empty id is replaced by a generated one. Inserting an
    /// existing id replaces that document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] for a non-string id.
    pub fn insert(&self, mut doc: Document) -> DocumentStoreResult<String> {
        let id = assign_id(&mut doc)?;
        let key = id.clone();

        self.inner.table.modify(move |docs| {
            docs.insert(key, Arc::new(doc));
            ((), true)
        });

        Ok(id)
    }

    /// Inserts several documents as one batch. Nothing is inserted if any
    /// document is invalid.
    pub fn insert_many(&self, docs: impl IntoIterator<Item = Document>) -> DocumentStoreResult<Vec<String>> {
        self.batch(|| docs.into_iter().map(|doc| self.insert(doc)).collect())
    }

    /// Applies `modifier` to every matching document.
    ///
    /// With `upsert` set and nothing matched, a document is created from the
    /// query's equality fields, the modifier is applied in inserting mode (so
    /// `$setOnInsert` takes effect) and an id is generated if needed.
    pub fn update(
        &self,
        query: impl Into<Query>,
        modifier: impl Into<Modifier>,
        options: UpdateOptions,
    ) -> UpdateResult {
        let query = query.into();
        let modifier = modifier.into();

        self.inner.table.modify(|docs| {
            let mut result = UpdateResult::default();

            for (key, doc) in matching(docs, &query) {
                result.matched_count += 1;

                let next = apply_modifier(&doc, &modifier, ApplyContext::default());
                if Arc::ptr_eq(&doc, &next) {
                    continue;
                }
                result.modified_count += 1;

                match document_id(&next) {
                    Some(id) if id != key => {
                        docs.shift_remove(&key);
                        docs.insert(id.to_string(), next);
                    }
                    _ => {
                        docs.insert(key, next);
                    }
                }
            }

            if result.matched_count == 0 && options.upsert {
                let base = Arc::new(query.upsert_base());
                let mut doc = Arc::unwrap_or_clone(apply_modifier(
                    &base,
                    &modifier,
                    ApplyContext { inserting: true },
                ));

                let id = match document_id(&doc) {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => {
                        let id = new_id();
                        doc.insert(ID_FIELD, id.clone());
                        id
                    }
                };

                debug!(collection = %self.inner.name, id = %id, "upserted document");
                docs.insert(id.clone(), Arc::new(doc));
                result.upserted_count = 1;
                result.upserted_id = Some(id);
            }

            let changed = result.modified_count > 0 || result.upserted_count > 0;
            (result, changed)
        })
    }

    /// Removes every matching document and returns how many were removed.
    ///
    /// An empty query clears the collection.
    pub fn remove(&self, query: impl Into<Query>) -> usize {
        let query = query.into();

        self.inner.table.modify(|docs| {
            let before = docs.len();

            if query.is_empty() {
                docs.clear();
            } else {
                for (key, _) in matching(docs, &query) {
                    docs.shift_remove(&key);
                }
            }

            let removed = before - docs.len();
            (removed, removed > 0)
        })
    }

    /// A live cursor over the matching documents.
    pub fn find(&self, query: impl Into<Query>) -> Cursor {
        self.find_with(query, FindOptions::default())
    }

    pub fn find_with(&self, query: impl Into<Query>, options: FindOptions) -> Cursor {
        let source = TableSource::new(Arc::clone(&self.inner.table), query.into());
        Cursor::new(Arc::new(source), options)
    }

    pub fn find_one(&self, query: impl Into<Query>) -> Option<Arc<Document>> {
        self.find_one_with(query, FindOptions::default())
    }

    pub fn find_one_with(&self, query: impl Into<Query>, options: FindOptions) -> Option<Arc<Document>> {
        self.find_with(query, options.limit(1)).first()
    }

    pub fn count(&self, query: impl Into<Query>) -> usize {
        self.find(query).count()
    }

    /// Runs `f` with all writes staged, installing them in one step when `f`
    /// returns `Ok`. On `Err` (or a panic) the staged writes are discarded.
    ///
    /// Batches nest; only the outermost one installs.
    pub fn batch<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let scope = self.inner.table.begin_batch();
        let value = f()?;
        scope.commit();
        Ok(value)
    }

    /// Async form of [`batch`](Self::batch). Dropping the future before it
    /// completes discards the staged writes.
    pub async fn batch_async<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let scope = self.inner.table.begin_batch();
        let value = f().await?;
        scope.commit();
        Ok(value)
    }

    /// Runs `f` as a batch, one transaction at a time in submission order.
    ///
    /// On `Err` the table is restored to the snapshot taken when the
    /// transaction started and the error is returned.
    pub async fn transaction<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _turn = self.inner.transactions.lock().await;
        let snapshot = self.inner.table.snapshot();

        match self.batch_async(f).await {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(collection = %self.inner.name, "transaction failed, rolling back");
                self.inner.table.restore(&snapshot.docs);
                Err(err)
            }
        }
    }

    /// Delivers queued change notifications now instead of on the next
    /// runtime tick.
    pub fn flush(&self) {
        self.inner.table.tasks().drain();
    }

    /// Runs one TTL sweep now and returns the number of expired documents.
    pub fn purge_expired(&self) -> usize {
        ttl::sweep(&self.inner.table, &self.inner.config.ttl_indexes, ttl::now_ms())
    }

    /// Stops the TTL sweeper. Documents stay readable and writable.
    pub fn dispose(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
            debug!(collection = %self.inner.name, "stopped ttl sweeper");
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("version", &self.inner.table.version())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Makes sure `doc` carries a usable string id and returns it.
fn assign_id(doc: &mut Document) -> DocumentStoreResult<String> {
    match doc.get(ID_FIELD) {
        Some(Bson::String(id)) if !id.is_empty() => Ok(id.clone()),
        None | Some(Bson::Null) | Some(Bson::Undefined) | Some(Bson::String(_)) => {
            let id = new_id();
            doc.insert(ID_FIELD, id.clone());
            Ok(id)
        }
        Some(other) => Err(DocumentStoreError::InvalidDocument(format!(
            "id must be a string, found {:?}",
            other.element_type()
        ))),
    }
}

/// Matching entries of `docs`, using the id shortcut when the query pins one.
fn matching(docs: &DocMap, query: &Query) -> Vec<(String, Arc<Document>)> {
    match query.id_lookup() {
        Some(id) => docs
            .get_key_value(id)
            .filter(|(_, doc)| matches(doc, query))
            .map(|(key, doc)| (key.clone(), Arc::clone(doc)))
            .into_iter()
            .collect(),
        None => docs
            .iter()
            .filter(|(_, doc)| matches(doc, query))
            .map(|(key, doc)| (key.clone(), Arc::clone(doc)))
            .collect(),
    }
}
