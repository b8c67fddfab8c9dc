//! Group specifications for derived cursors.
//!
//! ```ignore
//! use bson::doc;
//! use livedoc::aggregate::GroupSpec;
//!
//! let spec = GroupSpec::from(doc! {
//!     "key": "country",
//!     "count": { "$sum": 1 },
//!     "items": { "$push": "$$ROOT" },
//! });
//! ```

use bson::{Bson, Document};
use tracing::debug;

/// Marker used by `$push` to collect whole documents.
pub const ROOT: &str = "$$ROOT";

/// Accumulators computed per bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accumulator {
    /// Number of documents in the bucket.
    Sum,
    /// The bucket's documents.
    PushRoot,
    /// The value at a path of every document in the bucket.
    Push(String),
}

/// Buckets documents by the value at `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub key: String,
    pub accumulators: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    pub fn new(key: impl Into<String>) -> Self {
        GroupSpec { key: key.into(), accumulators: Vec::new() }
    }

    #[must_use]
    pub fn sum(mut self, field: impl Into<String>) -> Self {
        self.accumulators.push((field.into(), Accumulator::Sum));
        self
    }

    #[must_use]
    pub fn push_root(mut self, field: impl Into<String>) -> Self {
        self.accumulators.push((field.into(), Accumulator::PushRoot));
        self
    }

    #[must_use]
    pub fn push(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.accumulators.push((field.into(), Accumulator::Push(path.into())));
        self
    }

    /// Parses a group document. The `key` entry names the grouping path and
    /// every other entry is an accumulator; unsupported accumulators are skipped.
    pub fn from_document(doc: &Document) -> Self {
        let key = match doc.get("key") {
            Some(Bson::String(key)) => key.clone(),
            _ => String::new(),
        };
        let mut spec = GroupSpec::new(key);

        for (field, expr) in doc.iter().filter(|(field, _)| field.as_str() != "key") {
            let accumulator = match expr {
                Bson::Document(expr) if expr.contains_key("$sum") => Some(Accumulator::Sum),
                Bson::Document(expr) => match expr.get("$push") {
                    Some(Bson::String(path)) if path == ROOT => Some(Accumulator::PushRoot),
                    Some(Bson::String(path)) => Some(Accumulator::Push(path.clone())),
                    _ => None,
                },
                _ => None,
            };

            match accumulator {
                Some(accumulator) => spec.accumulators.push((field.clone(), accumulator)),
                None => debug!(field = %field, "skipping unsupported group accumulator"),
            }
        }

        spec
    }
}

impl From<Document> for GroupSpec {
    fn from(doc: Document) -> Self {
        GroupSpec::from_document(&doc)
    }
}
