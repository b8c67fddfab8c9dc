//! Live, diffable query results.
//!
//! A [`Cursor`] is a lazily bound view over a result source: a table query, or
//! a parent cursor plus a group transform. Nothing is computed until the first
//! terminal read or observer registration. From then on the cursor recomputes
//! whenever its source changes, running
//!
//! ```text
//! fetch -> sort -> skip/limit -> project
//! ```
//!
//! and diffing the new result against the previous one by document identity.
//! The diff is emitted as [`Change`] events (all added, then all removed, then
//! all changed) to observers registered with [`Cursor::observe`].
//!
//! # Delivery
//!
//! Events are delivered through the collection's deferred task queue, never
//! from inside the write that caused them. Inside a Tokio runtime the queue
//! runs on the next tick, so a burst of writes is delivered in one round;
//! [`Collection::flush`](crate::Collection::flush) delivers immediately. Each
//! cursor has at most one delivery in flight; events raised while one is in
//! flight overwrite a single pending slot which is delivered once afterwards.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use livedoc::prelude::*;
//!
//! let people = Collection::new("people")?;
//! let adults = people.find(doc! { "age": { "$gte": 18 } }).sort([Sort::asc("name")]);
//!
//! let observer = adults.watch(|docs| println!("{} adults", docs.len()), WatchOptions::default());
//! people.insert(doc! { "name": "ada", "age": 36 })?;
//! observer.stop();
//! ```

use std::{
    cmp::Ordering,
    fmt,
    sync::{Arc, Weak},
};

use bson::{Bson, Document, de::deserialize_from_bson};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use livedoc_core::{
    aggregate::{Accumulator, GroupSpec},
    document::{ID_FIELD, is_missing, new_id, read_path},
    error::{DocumentStoreError, DocumentStoreResult},
    query::{FindOptions, Query, Sort, SortDirection},
};

use crate::{
    evaluator::{compare_values, matches, values_equal},
    reactive::{Dependents, Subscriber, TaskQueue},
    table::DocumentTable,
};

/// Kind of change between two consecutive results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// One document entering, leaving or changing within a cursor's result.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub document: Arc<Document>,
}

/// Options for [`Cursor::watch`].
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Deliver the current result right after registration.
    pub immediate: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { immediate: true }
    }
}

type ChangeHandler = Arc<dyn Fn(&Change) + Send + Sync>;

/// Where a cursor's unprocessed documents come from.
pub(crate) trait ResultSource: Send + Sync {
    fn fetch(&self) -> Vec<Arc<Document>>;
    fn subscribe(&self, subscriber: Weak<dyn Subscriber>);
    fn tasks(&self) -> &Arc<TaskQueue>;
}

/// Documents of a table matching a query.
pub(crate) struct TableSource {
    table: Arc<DocumentTable>,
    query: Arc<Query>,
}

impl TableSource {
    pub fn new(table: Arc<DocumentTable>, query: Query) -> Self {
        Self { table, query: Arc::new(query) }
    }
}

impl ResultSource for TableSource {
    fn fetch(&self) -> Vec<Arc<Document>> {
        let docs = self.table.snapshot().docs;

        match self.query.id_lookup() {
            Some(id) => docs
                .get(id)
                .filter(|doc| matches(doc, &self.query))
                .cloned()
                .into_iter()
                .collect(),
            None => docs
                .values()
                .filter(|doc| matches(doc, &self.query))
                .cloned()
                .collect(),
        }
    }

    fn subscribe(&self, subscriber: Weak<dyn Subscriber>) {
        self.table.subscribe(subscriber);
    }

    fn tasks(&self) -> &Arc<TaskQueue> {
        self.table.tasks()
    }
}

/// Buckets of a parent cursor's result.
struct GroupSource {
    parent: Arc<CursorInner>,
    spec: GroupSpec,
    previous: Mutex<IndexMap<String, Arc<Document>>>,
}

impl ResultSource for GroupSource {
    fn fetch(&self) -> Vec<Arc<Document>> {
        let docs = self.parent.results();
        let mut buckets: Vec<(Bson, Vec<&Arc<Document>>)> = Vec::new();

        for doc in docs.iter() {
            let key = read_path(doc, &self.spec.key)
                .filter(|value| !is_missing(Some(*value)))
                .cloned()
                .unwrap_or(Bson::Null);

            match buckets.iter_mut().find(|(existing, _)| values_equal(Some(existing), Some(&key))) {
                Some((_, members)) => members.push(doc),
                None => buckets.push((key, vec![doc])),
            }
        }

        let mut previous = self.previous.lock();
        let outputs = buckets
            .into_iter()
            .map(|(key, members)| {
                let mut out = Document::new();
                out.insert(ID_FIELD, key);

                for (field, accumulator) in &self.spec.accumulators {
                    let value = match accumulator {
                        Accumulator::Sum => Bson::Int64(members.len() as i64),
                        Accumulator::PushRoot => Bson::Array(
                            members.iter().map(|doc| Bson::Document((***doc).clone())).collect(),
                        ),
                        Accumulator::Push(path) => Bson::Array(
                            members
                                .iter()
                                .map(|doc| read_path(doc, path).cloned().unwrap_or(Bson::Null))
                                .collect(),
                        ),
                    };
                    out.insert(field.as_str(), value);
                }

                // Unchanged buckets keep their previous identity.
                match previous.get(&identity_key(&out)) {
                    Some(existing) if **existing == out => Arc::clone(existing),
                    _ => Arc::new(out),
                }
            })
            .collect::<Vec<_>>();

        *previous = outputs.iter().map(|doc| (identity_key(doc), Arc::clone(doc))).collect();
        outputs
    }

    fn subscribe(&self, subscriber: Weak<dyn Subscriber>) {
        self.parent.ensure_bound();
        self.parent.dependents.subscribe(subscriber);
    }

    fn tasks(&self) -> &Arc<TaskQueue> {
        self.parent.source.tasks()
    }
}

/// Key used to match documents between two results.
pub(crate) fn identity_key(doc: &Document) -> String {
    match doc.get(ID_FIELD) {
        Some(Bson::String(id)) => id.clone(),
        Some(other) => format!("\u{0}{other}"),
        None => String::new(),
    }
}

#[derive(Default)]
struct CursorState {
    bound: bool,
    results: Arc<Vec<Arc<Document>>>,
    keyed: IndexMap<String, Arc<Document>>,
    /// Source document and its projection, by identity.
    projections: IndexMap<String, (Arc<Document>, Arc<Document>)>,
}

#[derive(Default)]
struct Emission {
    in_flight: bool,
    pending: Option<Change>,
}

pub(crate) struct CursorInner {
    source: Arc<dyn ResultSource>,
    options: FindOptions,
    state: Mutex<CursorState>,
    handlers: Mutex<Vec<(String, ChangeHandler)>>,
    emission: Mutex<Emission>,
    dependents: Dependents,
    this: Weak<CursorInner>,
}

impl CursorInner {
    fn new(source: Arc<dyn ResultSource>, options: FindOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| CursorInner {
            source,
            options,
            state: Mutex::new(CursorState::default()),
            handlers: Mutex::new(Vec::new()),
            emission: Mutex::new(Emission::default()),
            dependents: Dependents::new(),
            this: this.clone(),
        })
    }

    fn ensure_bound(&self) {
        {
            let mut state = self.state.lock();
            if state.bound {
                return;
            }
            state.bound = true;
        }

        let this: Weak<dyn Subscriber> = self.this.clone();
        self.source.subscribe(this);
        self.recompute();
    }

    fn results(&self) -> Arc<Vec<Arc<Document>>> {
        self.ensure_bound();
        Arc::clone(&self.state.lock().results)
    }

    fn shape(&self, mut docs: Vec<Arc<Document>>) -> Vec<Arc<Document>> {
        if let Some(keys) = &self.options.sort {
            docs.sort_by(|a, b| compare_by(a, b, keys));
        }

        let FindOptions { skip, limit, .. } = self.options;
        if skip.is_some() || limit.is_some() {
            docs = docs
                .into_iter()
                .skip(skip.unwrap_or(0))
                .take(limit.unwrap_or(usize::MAX))
                .collect();
        }

        docs
    }

    fn recompute(&self) {
        let docs = self.shape(self.source.fetch());
        let mut changes = Vec::new();

        {
            let mut state = self.state.lock();

            let docs = match &self.options.projection {
                Some(fields) => {
                    let projected = docs
                        .iter()
                        .map(|doc| {
                            let key = identity_key(doc);
                            let out = match state.projections.get(&key) {
                                Some((source, out)) if Arc::ptr_eq(source, doc) => Arc::clone(out),
                                _ => Arc::new(project(doc, fields)),
                            };
                            (key, (Arc::clone(doc), out))
                        })
                        .collect::<IndexMap<_, _>>();

                    let out = projected.values().map(|(_, out)| Arc::clone(out)).collect();
                    state.projections = projected;
                    out
                }
                None => docs,
            };

            let next = docs
                .into_iter()
                .map(|doc| (identity_key(&doc), doc))
                .collect::<IndexMap<_, _>>();

            for (key, doc) in &next {
                if !state.keyed.contains_key(key) {
                    changes.push(Change { kind: ChangeKind::Added, document: Arc::clone(doc) });
                }
            }
            for (key, doc) in &state.keyed {
                if !next.contains_key(key) {
                    changes.push(Change { kind: ChangeKind::Removed, document: Arc::clone(doc) });
                }
            }
            for (key, doc) in &next {
                if let Some(prev) = state.keyed.get(key) {
                    if !Arc::ptr_eq(prev, doc) {
                        changes.push(Change { kind: ChangeKind::Changed, document: Arc::clone(doc) });
                    }
                }
            }

            state.results = Arc::new(next.values().cloned().collect());
            state.keyed = next;
        }

        if changes.is_empty() {
            return;
        }

        for change in changes {
            self.emit(change);
        }

        self.dependents.notify();
    }

    fn emit(&self, change: Change) {
        if self.handlers.lock().is_empty() {
            return;
        }

        {
            let mut emission = self.emission.lock();
            if emission.in_flight {
                emission.pending = Some(change);
                return;
            }
            emission.in_flight = true;
        }

        let Some(this) = self.this.upgrade() else {
            return;
        };

        self.source.tasks().defer(move || this.deliver(change));
    }

    fn deliver(&self, change: Change) {
        self.emission.lock().in_flight = false;

        let handlers = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect::<Vec<_>>();

        for handler in handlers {
            handler(&change);
        }

        let pending = self.emission.lock().pending.take();
        if let Some(pending) = pending {
            self.emit(pending);
        }
    }

    fn add_handler(&self, handler: ChangeHandler) -> String {
        let id = new_id();
        self.handlers.lock().push((id.clone(), handler));
        id
    }

    fn remove_handler(&self, id: &str) {
        self.handlers.lock().retain(|(existing, _)| existing != id);
    }
}

impl Subscriber for CursorInner {
    fn invalidate(&self) {
        self.recompute();
    }
}

fn compare_by(a: &Document, b: &Document, keys: &[Sort]) -> Ordering {
    for key in keys {
        let ordering = compare_values(read_path(a, &key.field), read_path(b, &key.field))
            .unwrap_or(Ordering::Equal);

        let ordering = match key.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

/// Keeps `id` plus the listed fields. Dotted fields are stored under their full path.
fn project(doc: &Document, fields: &[String]) -> Document {
    let mut out = Document::new();

    if let Some(id) = doc.get(ID_FIELD) {
        out.insert(ID_FIELD, id.clone());
    }

    for field in fields.iter().filter(|field| field.as_str() != ID_FIELD) {
        if let Some(value) = read_path(doc, field).filter(|value| !is_missing(Some(*value))) {
            out.insert(field.as_str(), value.clone());
        }
    }

    out
}

/// A handle returned by [`Cursor::observe`] and [`Cursor::watch`].
///
/// The observer keeps its cursor alive. [`stop`](Observer::stop) removes the
/// callback; the cursor itself stays subscribed to its source as long as any
/// handle to it exists.
pub struct Observer {
    id: String,
    cursor: Arc<CursorInner>,
}

impl Observer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stop(&self) {
        self.cursor.remove_handler(&self.id);
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer").field("id", &self.id).finish()
    }
}

/// A live view over a query result.
///
/// Chainable methods return new cursors sharing the same source; terminal
/// methods bind the cursor and read its memoized result.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<CursorInner>,
}

impl Cursor {
    pub(crate) fn new(source: Arc<dyn ResultSource>, options: FindOptions) -> Self {
        Self { inner: CursorInner::new(source, options) }
    }

    fn with_options(&self, update: impl FnOnce(&mut FindOptions)) -> Cursor {
        let mut options = self.inner.options.clone();
        update(&mut options);
        Cursor::new(Arc::clone(&self.inner.source), options)
    }

    pub fn options(&self) -> &FindOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn sort(&self, keys: impl IntoIterator<Item = Sort>) -> Cursor {
        let keys = keys.into_iter().collect::<Vec<_>>();
        self.with_options(|options| options.sort = Some(keys))
    }

    #[must_use]
    pub fn skip(&self, skip: usize) -> Cursor {
        self.with_options(|options| options.skip = Some(skip))
    }

    #[must_use]
    pub fn limit(&self, limit: usize) -> Cursor {
        self.with_options(|options| options.limit = Some(limit))
    }

    /// Restricts documents to `id` plus the given fields.
    #[must_use]
    pub fn project(&self, fields: impl IntoIterator<Item = impl Into<String>>) -> Cursor {
        let fields = fields.into_iter().map(Into::into).collect::<Vec<_>>();
        self.with_options(|options| options.projection = Some(fields))
    }

    /// One-based page of `per_page` documents.
    #[must_use]
    pub fn paginate(&self, page: usize, per_page: usize) -> Cursor {
        self.skip(page.saturating_sub(1).saturating_mul(per_page))
            .limit(per_page)
    }

    /// Groups this cursor's result into buckets, one output document per distinct key.
    #[must_use]
    pub fn group(&self, spec: impl Into<GroupSpec>) -> Cursor {
        let source = GroupSource {
            parent: Arc::clone(&self.inner),
            spec: spec.into(),
            previous: Mutex::new(IndexMap::new()),
        };

        Cursor::new(Arc::new(source), FindOptions::default())
    }

    pub fn to_array(&self) -> Vec<Arc<Document>> {
        self.inner.results().as_ref().clone()
    }

    pub fn map<U>(&self, f: impl FnMut(&Arc<Document>) -> U) -> Vec<U> {
        self.inner.results().iter().map(f).collect()
    }

    pub fn for_each(&self, f: impl FnMut(&Arc<Document>)) {
        self.inner.results().iter().for_each(f);
    }

    pub fn count(&self) -> usize {
        self.inner.results().len()
    }

    pub fn first(&self) -> Option<Arc<Document>> {
        self.inner.results().first().cloned()
    }

    pub fn last(&self) -> Option<Arc<Document>> {
        self.inner.results().last().cloned()
    }

    pub fn exists(&self) -> bool {
        self.count() > 0
    }

    /// Distinct values at `key`, in first-occurrence order. Missing values are skipped.
    pub fn distinct(&self, key: &str) -> Vec<Bson> {
        let mut values: Vec<Bson> = Vec::new();

        for doc in self.inner.results().iter() {
            let Some(value) = read_path(doc, key).filter(|value| !is_missing(Some(*value))) else {
                continue;
            };

            if !values.iter().any(|existing| values_equal(Some(existing), Some(value))) {
                values.push(value.clone());
            }
        }

        values
    }

    /// Deserializes the current result into typed records.
    pub fn deserialize<T: DeserializeOwned>(&self) -> DocumentStoreResult<Vec<T>> {
        self.inner
            .results()
            .iter()
            .map(|doc| deserialize_from_bson(Bson::Document((**doc).clone())).map_err(DocumentStoreError::from))
            .collect()
    }

    /// Registers a change callback.
    ///
    /// If this registration binds the cursor, the callback receives the
    /// initial result as `Added` events (subject to coalescing).
    pub fn observe(&self, handler: impl Fn(&Change) + Send + Sync + 'static) -> Observer {
        let id = self.inner.add_handler(Arc::new(handler));
        self.inner.ensure_bound();
        self.inner.source.tasks().drain();

        Observer { id, cursor: Arc::clone(&self.inner) }
    }

    /// Calls `callback` with the full result whenever it differs from the last
    /// delivered one (by length or by any element's identity).
    ///
    /// The first check always delivers, so with `immediate` set the callback
    /// fires once right away.
    pub fn watch(
        &self,
        callback: impl Fn(&[Arc<Document>]) + Send + Sync + 'static,
        options: WatchOptions,
    ) -> Observer {
        let watcher = Arc::new(Watcher {
            cursor: Arc::downgrade(&self.inner),
            callback: Box::new(callback),
            state: Mutex::new(WatchState::default()),
        });

        // Bound before the callback is registered; the initial result is
        // covered by the immediate run instead of `Added` events.
        self.inner.ensure_bound();

        let on_change = Arc::clone(&watcher);
        let observer = self.observe(move |_| on_change.schedule());

        if options.immediate {
            watcher.schedule_now();
        }
        self.inner.source.tasks().drain();

        observer
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("options", &self.inner.options)
            .field("observers", &self.inner.handlers.lock().len())
            .finish()
    }
}

#[derive(Default)]
struct WatchState {
    last: Option<Vec<Arc<Document>>>,
    scheduled: bool,
}

struct Watcher {
    cursor: Weak<CursorInner>,
    callback: Box<dyn Fn(&[Arc<Document>]) + Send + Sync>,
    state: Mutex<WatchState>,
}

impl Watcher {
    fn schedule(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.scheduled {
                return;
            }
            state.scheduled = true;
        }

        self.schedule_now();
    }

    fn schedule_now(self: &Arc<Self>) {
        let Some(cursor) = self.cursor.upgrade() else {
            return;
        };

        let this = Arc::clone(self);
        cursor.source.tasks().defer(move || this.run());
    }

    fn run(&self) {
        let Some(cursor) = self.cursor.upgrade() else {
            return;
        };

        let next = cursor.results();
        {
            let mut state = self.state.lock();
            state.scheduled = false;

            let unchanged = state.last.as_ref().is_some_and(|last| {
                last.len() == next.len()
                    && last.iter().zip(next.iter()).all(|(a, b)| Arc::ptr_eq(a, b))
            });
            if unchanged {
                return;
            }

            state.last = Some(next.as_ref().clone());
        }

        (self.callback)(&next);
    }
}
