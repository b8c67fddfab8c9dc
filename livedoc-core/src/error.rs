//! Error types and result types for document store operations.
//!
//! Use [`DocumentStoreResult<T>`] as the return type for fallible operations.
//! Writes that simply match nothing are not errors; they report zero counts.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a collection.
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during collection initialization (e.g. no async runtime for a timer or adapter).
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// The collection name does not match `^[a-z][a-z0-9_]*$`.
    #[error("Invalid collection name: {0}")]
    InvalidCollectionName(String),
    /// The collection has not finished loading yet, or the requested facility
    /// does not exist for it.
    #[error("Collection not ready: {0}")]
    NotReady(String),
    /// The document has an invalid structure (for instance a non-string id).
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// An error reported by a persistence adapter.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// A specialized `Result` type for document store operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DocumentStoreError {
    fn from(err: std::io::Error) -> Self {
        DocumentStoreError::Storage(err.to_string())
    }
}
