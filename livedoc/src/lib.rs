//! Main livedoc crate: an embedded, reactive JSON document store.
//!
//! livedoc keeps named collections of JSON-like documents in memory, queries
//! them with a MongoDB-style filter language and keeps query results live:
//! cursors recompute and report `added` / `removed` / `changed` documents on
//! every write. Collections can persist themselves through any
//! [`StorageAdapter`](storage::StorageAdapter) and expire documents through
//! TTL indexes.
//!
//! This crate re-exports the data model from `livedoc-core`, the reactive
//! engine from `livedoc-engine` and, with the `file` feature, the JSON file
//! adapter from `livedoc-file`.
//!
//! # Features
//!
//! - **MongoDB-style queries** - `$eq`, `$gt`, `$in`, `$regex`, `$and`/`$or`/`$not`, dotted paths
//! - **Update operators** - `$set`, `$inc`, `$push`, `$addToSet`, `$pull`, `$setOnInsert` and more
//! - **Live cursors** - `observe` for per-document changes, `watch` for whole results
//! - **Batches and transactions** - All-or-nothing writes, observed in one step
//! - **Pluggable persistence** - In-memory, JSON files, or your own adapter
//!
//! # Quick Start
//!
//! ```ignore
//! use livedoc::{bson::doc, prelude::*};
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let todos = Collection::builder("todos")
//!         .storage(MemoryStorage::new())
//!         .open()
//!         .await?;
//!
//!     let open = todos.find(doc! { "done": false }).sort([Sort::asc("title")]);
//!     let observer = open.watch(
//!         |docs| println!("{} open todos", docs.len()),
//!         WatchOptions::default(),
//!     );
//!
//!     let id = todos.insert(doc! { "title": "write docs", "done": false })?;
//!     todos.update(
//!         doc! { "id": id.as_str() },
//!         doc! { "$set": { "done": true } },
//!         UpdateOptions::default(),
//!     );
//!
//!     observer.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Typed records
//!
//! Documents are plain BSON documents. Any serde type converts to and from
//! them through the [`Record`](document::Record) extension trait, and cursors
//! can deserialize their result directly:
//!
//! ```ignore
//! use livedoc::{bson::doc, prelude::*};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Country {
//!     id: String,
//!     population: i64,
//! }
//!
//! let countries = Collection::new("countries")?;
//! countries.insert(Country { id: "nl".into(), population: 17 }.to_document()?)?;
//!
//! let large: Vec<Country> = countries
//!     .find(Filter::gt("population", 15))
//!     .deserialize()?;
//! ```
//!
//! # Storage
//!
//! - [`MemoryStorage`](memory::MemoryStorage) - Shared in-process storage for tests
//! - [`FileStorage`](file::FileStorage) - One JSON file per collection (requires `file` feature)

pub mod prelude;

pub use livedoc_core::{aggregate, config, document, error, modifier, query, storage};
pub use livedoc_engine::{
    Change, ChangeKind, Collection, CollectionBuilder, Cursor, Meta, Observer, UpdateOptions,
    UpdateResult, WatchOptions,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage adapter.
pub mod memory {
    pub use livedoc_engine::storage::MemoryStorage;
}

/// JSON file storage adapter.
///
/// This module is only available when the `file` feature is enabled.
#[cfg(feature = "file")]
pub mod file {
    pub use livedoc_file::FileStorage;
}
