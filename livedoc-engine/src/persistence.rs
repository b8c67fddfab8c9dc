//! Loading a table from, and mirroring it to, a storage adapter.

use std::sync::Arc;

use bson::{Bson, Document};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use livedoc_core::{
    document::document_id,
    storage::{SharedStorage, StorageAdapter},
};

use crate::table::{DocMap, DocumentTable};

/// Reads the stored document list for `key`.
///
/// Only an array is accepted, and within it only documents with a non-empty
/// string id. Anything else is skipped with a warning; a failing adapter is
/// treated like an empty one.
pub(crate) async fn load(storage: &dyn StorageAdapter, key: &str) -> Option<DocMap> {
    let items = match storage.get(key).await {
        Ok(Some(Bson::Array(items))) => items,
        Ok(Some(other)) => {
            warn!(key, kind = ?other.element_type(), "ignoring stored value that is not a list");
            return None;
        }
        Ok(None) => return None,
        Err(err) => {
            warn!(key, error = %err, "failed to load collection");
            return None;
        }
    };

    let mut docs = DocMap::with_capacity(items.len());
    for item in items {
        let Bson::Document(doc) = item else {
            warn!(key, "skipping stored value that is not a document");
            continue;
        };

        match document_id(&doc) {
            Some(id) if !id.is_empty() => {
                docs.insert(id.to_string(), Arc::new(doc));
            }
            _ => warn!(key, "skipping stored document without a string id"),
        }
    }

    debug!(key, len = docs.len(), "loaded collection");
    Some(docs)
}

/// Sends every version the table installs from now on to `storage`, in order.
///
/// Must be called from within a Tokio runtime. The writer stops once the table
/// is dropped.
pub(crate) fn mirror(table: &DocumentTable, storage: SharedStorage, key: String) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<DocMap>>();
    table.attach_persister(sender);

    tokio::spawn(async move {
        while let Some(docs) = receiver.recv().await {
            let documents = docs.values().map(|doc| Document::clone(doc)).collect::<Vec<_>>();

            if let Err(err) = storage.set(&key, documents).await {
                warn!(key = %key, error = %err, "failed to persist collection");
            }
        }

        trace!(key = %key, "persistence writer stopped");
    });
}
