//! Persistence adapter abstraction.
//!
//! A collection persists itself through a [`StorageAdapter`]: it calls
//! [`get`](StorageAdapter::get) once while initializing, and
//! [`set`](StorageAdapter::set) with the complete document list after every
//! change. Adapters only need to store whatever array they are handed.
//!
//! # Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use bson::{Bson, Document};
//! use livedoc::{storage::StorageAdapter, error::DocumentStoreResult};
//!
//! #[derive(Debug)]
//! struct NullStorage;
//!
//! #[async_trait]
//! impl StorageAdapter for NullStorage {
//!     async fn get(&self, _key: &str) -> DocumentStoreResult<Option<Bson>> {
//!         Ok(None)
//!     }
//!
//!     async fn set(&self, _key: &str, _documents: Vec<Document>) -> DocumentStoreResult<()> {
//!         Ok(())
//!     }
//! }
//! ```

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::DocumentStoreResult;

/// Asynchronous key/value persistence for whole collections.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single adapter is commonly shared
/// by several collections and their meta ledger, each under its own key.
#[async_trait]
pub trait StorageAdapter: Send + Sync + Debug {
    /// Loads the value stored under `key`.
    ///
    /// Collections only use the result when it is an array of documents.
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>>;

    /// Replaces the value stored under `key` with `documents`.
    async fn set(&self, key: &str, documents: Vec<Document>) -> DocumentStoreResult<()>;
}

#[async_trait]
impl<A> StorageAdapter for &A
where
    A: StorageAdapter,
{
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        (**self).set(key, documents).await
    }
}

#[async_trait]
impl<A> StorageAdapter for Arc<A>
where
    A: StorageAdapter + ?Sized,
{
    async fn get(&self, key: &str) -> DocumentStoreResult<Option<Bson>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, documents: Vec<Document>) -> DocumentStoreResult<()> {
        (**self).set(key, documents).await
    }
}

/// A shareable, type-erased adapter.
pub type SharedStorage = Arc<dyn StorageAdapter>;
