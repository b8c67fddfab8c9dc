//! The reactive engine behind livedoc collections.
//!
//! This crate turns the plain data types of `livedoc-core` into live
//! collections: a versioned, copy-on-write document table, a matcher and a
//! modifier engine working on it, cursors that recompute and diff themselves
//! on every write, TTL expiry and persistence through any
//! [`StorageAdapter`](livedoc_core::storage::StorageAdapter).
//!
//! # Features
//!
//! - **Live queries** - Cursors emit `added` / `removed` / `changed` events and support `watch`
//! - **Atomic batches** - Writes inside a batch or transaction become visible in one step
//! - **Persistence** - Collections load once and then mirror every change to their adapter
//! - **TTL indexes** - Documents expire a fixed time after a stored timestamp
//!
//! # Quick Start
//!
//! ```ignore
//! use bson::doc;
//! use livedoc_engine::{Collection, ChangeKind};
//!
//! let todos = Collection::new("todos")?;
//! let open = todos.find(doc! { "done": false });
//!
//! let observer = open.observe(|change| {
//!     if change.kind == ChangeKind::Added {
//!         println!("new todo: {}", change.document);
//!     }
//! });
//!
//! todos.insert(doc! { "title": "write docs", "done": false })?;
//! observer.stop();
//! ```

#[allow(unused_extern_crates)]
extern crate self as livedoc_engine;

pub mod collection;
pub mod cursor;
pub mod evaluator;
pub mod meta;
pub mod reactive;
pub mod storage;
pub mod table;
pub mod updater;

mod persistence;
mod ttl;

pub use collection::{Collection, CollectionBuilder, UpdateOptions, UpdateResult};
pub use cursor::{Change, ChangeKind, Cursor, Observer, WatchOptions};
pub use evaluator::matches;
pub use meta::Meta;
pub use storage::MemoryStorage;
pub use updater::{ApplyContext, apply_modifier};
