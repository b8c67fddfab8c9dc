//! The versioned document table behind a collection.
//!
//! The live mapping is an `Arc<DocMap>` that is never edited in place: every
//! write clones the map, applies its changes and installs the result as a new
//! version. Readers holding an older `Arc` keep a consistent snapshot, and
//! anything comparing snapshots can do so by pointer.
//!
//! While a batch is open, writes are redirected into a private staging copy
//! which is installed in one step when the outermost batch commits.

use std::sync::{Arc, OnceLock};

use bson::Document;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::reactive::{Dependents, Subscriber, TaskQueue};

/// Documents keyed by id, in insertion order.
pub type DocMap = IndexMap<String, Arc<Document>>;

/// A consistent view of the live table.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub docs: Arc<DocMap>,
}

#[derive(Debug)]
struct Staging {
    docs: DocMap,
    dirty: bool,
}

/// Reactive, versioned id to document mapping for one collection.
#[derive(Debug)]
pub struct DocumentTable {
    name: String,
    live: RwLock<Snapshot>,
    staging: Mutex<Option<Staging>>,
    dependents: Dependents,
    tasks: Arc<TaskQueue>,
    persist: OnceLock<UnboundedSender<Arc<DocMap>>>,
}

impl DocumentTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live: RwLock::new(Snapshot { version: 0, docs: Arc::new(DocMap::new()) }),
            staging: Mutex::new(None),
            dependents: Dependents::new(),
            tasks: Arc::new(TaskQueue::new()),
            persist: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the live snapshot. Staged batch writes are not visible here.
    pub fn snapshot(&self) -> Snapshot {
        self.live.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.live.read().version
    }

    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }

    pub fn subscribe(&self, subscriber: std::sync::Weak<dyn Subscriber>) {
        self.dependents.subscribe(subscriber);
    }

    /// Forwards every future installed version to the persistence writer.
    pub(crate) fn attach_persister(&self, sender: UnboundedSender<Arc<DocMap>>) {
        if self.persist.set(sender).is_err() {
            debug!(collection = %self.name, "persister already attached");
        }
    }

    /// Runs a write against the staging copy if a batch is open, otherwise
    /// against a fresh copy of the live map that is installed only if `write`
    /// reports a change.
    pub fn modify<R>(&self, write: impl FnOnce(&mut DocMap) -> (R, bool)) -> R {
        let mut staging = self.staging.lock();

        if let Some(staging) = staging.as_mut() {
            let (result, changed) = write(&mut staging.docs);
            staging.dirty |= changed;
            return result;
        }

        let mut live = self.live.write();
        let mut docs = DocMap::clone(&live.docs);
        let (result, changed) = write(&mut docs);

        let installed = changed.then(|| {
            let docs = Arc::new(docs);
            live.version += 1;
            live.docs = Arc::clone(&docs);
            docs
        });

        drop(live);
        drop(staging);

        if let Some(docs) = installed {
            self.after_install(docs);
        }

        result
    }

    /// Reads the staging copy if a batch is open, otherwise the live map.
    pub fn read<R>(&self, read: impl FnOnce(&DocMap) -> R) -> R {
        let staging = self.staging.lock();

        match staging.as_ref() {
            Some(staging) => read(&staging.docs),
            None => {
                let docs = Arc::clone(&self.live.read().docs);
                drop(staging);
                read(&docs)
            }
        }
    }

    /// Installs `docs` as the live map unless it already is.
    pub fn restore(&self, docs: &Arc<DocMap>) {
        {
            let mut live = self.live.write();
            if Arc::ptr_eq(&live.docs, docs) {
                return;
            }

            live.version += 1;
            live.docs = Arc::clone(docs);
        }

        self.after_install(Arc::clone(docs));
    }

    /// Installs a new live map unconditionally.
    pub(crate) fn install(&self, docs: DocMap) {
        let docs = Arc::new(docs);
        {
            let mut live = self.live.write();
            live.version += 1;
            live.docs = Arc::clone(&docs);
        }

        self.after_install(docs);
    }

    fn after_install(&self, docs: Arc<DocMap>) {
        trace!(collection = %self.name, len = docs.len(), "installed table version");

        self.dependents.notify();

        if let Some(sender) = self.persist.get() {
            if sender.send(docs).is_err() {
                debug!(collection = %self.name, "persistence writer is gone");
            }
        }

        self.tasks.flush();
    }

    /// Opens a batch scope. Writes are staged until the outermost scope commits.
    pub fn begin_batch(self: &Arc<Self>) -> BatchScope {
        let mut staging = self.staging.lock();

        let restore_point = match staging.as_ref() {
            Some(open) => Some((open.docs.clone(), open.dirty)),
            None => {
                *staging = Some(Staging {
                    docs: DocMap::clone(&self.live.read().docs),
                    dirty: false,
                });
                None
            }
        };

        BatchScope {
            table: Arc::clone(self),
            restore_point,
            finished: false,
        }
    }

    pub fn in_batch(&self) -> bool {
        self.staging.lock().is_some()
    }
}

/// An open batch. Dropping it without [`commit`](BatchScope::commit) discards
/// its writes, which covers errors, panics and cancelled futures alike.
#[derive(Debug)]
pub struct BatchScope {
    table: Arc<DocumentTable>,
    /// Staging state to return to if a nested scope is abandoned.
    restore_point: Option<(DocMap, bool)>,
    finished: bool,
}

impl BatchScope {
    pub fn commit(mut self) {
        self.finished = true;

        // Nested scopes simply leave their writes in the outer staging copy.
        if self.restore_point.is_some() {
            return;
        }

        let staged = self.table.staging.lock().take();

        match staged {
            Some(Staging { docs, dirty: true }) => {
                debug!(collection = %self.table.name, len = docs.len(), "committing batch");
                self.table.install(docs);
            }
            _ => trace!(collection = %self.table.name, "batch committed without changes"),
        }
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut staging = self.table.staging.lock();

        match self.restore_point.take() {
            Some((docs, dirty)) => {
                if let Some(open) = staging.as_mut() {
                    open.docs = docs;
                    open.dirty = dirty;
                }
            }
            None => {
                staging.take();
                debug!(collection = %self.table.name, "discarded batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn put(table: &DocumentTable, id: &str) {
        table.modify(|docs| {
            docs.insert(id.to_string(), Arc::new(doc! { "id": id }));
            ((), true)
        });
    }

    #[test]
    fn writes_install_new_versions() {
        let table = DocumentTable::new("t");
        let before = table.snapshot();

        put(&table, "a");
        let after = table.snapshot();

        assert_eq!(after.version, before.version + 1);
        assert!(!Arc::ptr_eq(&before.docs, &after.docs));
        assert!(before.docs.is_empty());
    }

    #[test]
    fn unchanged_writes_keep_the_version() {
        let table = DocumentTable::new("t");
        let before = table.snapshot();

        table.modify(|_| ((), false));
        assert!(Arc::ptr_eq(&before.docs, &table.snapshot().docs));
    }

    #[test]
    fn batches_install_once_on_commit() {
        let table = Arc::new(DocumentTable::new("t"));
        let scope = table.begin_batch();

        put(&table, "a");
        put(&table, "b");
        assert!(table.snapshot().docs.is_empty());
        assert_eq!(table.read(|docs| docs.len()), 2);

        scope.commit();
        let snapshot = table.snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.docs.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn dropped_batches_discard_their_writes() {
        let table = Arc::new(DocumentTable::new("t"));
        put(&table, "a");

        {
            let _scope = table.begin_batch();
            put(&table, "b");
        }

        assert!(!table.in_batch());
        assert_eq!(table.snapshot().docs.len(), 1);
    }

    #[test]
    fn abandoned_nested_batches_restore_the_outer_staging() {
        let table = Arc::new(DocumentTable::new("t"));
        let outer = table.begin_batch();
        put(&table, "a");

        {
            let _inner = table.begin_batch();
            put(&table, "b");
        }

        let inner = table.begin_batch();
        put(&table, "c");
        inner.commit();

        outer.commit();
        assert_eq!(table.snapshot().docs.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn restore_skips_identical_snapshots() {
        let table = DocumentTable::new("t");
        put(&table, "a");
        let snapshot = table.snapshot();

        table.restore(&snapshot.docs);
        assert_eq!(table.version(), snapshot.version);

        put(&table, "b");
        table.restore(&snapshot.docs);
        assert_eq!(table.version(), snapshot.version + 2);
        assert_eq!(table.snapshot().docs.len(), 1);
    }
}
