//! Convenient re-exports of commonly used types from livedoc.
//!
//! ```ignore
//! use livedoc::prelude::*;
//! ```
//!
//! This provides access to:
//! - Collections, cursors and observers
//! - Query, modifier and group builders
//! - Configuration and storage adapters
//! - Error types

pub use livedoc_core::{
    aggregate::{Accumulator, GroupSpec},
    config::{CollectionConfig, TtlIndex},
    document::{Record, new_id},
    error::{DocumentStoreError, DocumentStoreResult},
    modifier::{Modifier, UpdateOp},
    query::{Condition, Expr, FieldOp, Filter, FindOptions, Query, QueryVisitor, Sort, SortDirection},
    storage::{SharedStorage, StorageAdapter},
};
pub use livedoc_engine::{
    Change, ChangeKind, Collection, CollectionBuilder, Cursor, Meta, Observer, UpdateOptions,
    UpdateResult, WatchOptions, storage::MemoryStorage,
};

#[cfg(feature = "file")]
pub use livedoc_file::FileStorage;
