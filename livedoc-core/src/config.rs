//! Collection configuration.

use std::time::Duration;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::document::read_path;

/// Default period between TTL sweeps, in milliseconds.
pub const DEFAULT_TTL_INTERVAL_MS: u64 = 60_000;

/// Expires documents a fixed time after the timestamp stored at `field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlIndex {
    /// Dotted path of a millisecond timestamp.
    pub field: String,
    /// Lifetime added to the timestamp.
    #[serde(alias = "expireAfterSeconds")]
    pub expire_after_seconds: u64,
}

impl TtlIndex {
    pub fn new(field: impl Into<String>, expire_after_seconds: u64) -> Self {
        Self { field: field.into(), expire_after_seconds }
    }

    /// Returns true when the document's timestamp plus the lifetime is at or
    /// before `now_ms`.
    ///
    /// Only numeric values (and BSON datetimes) are timestamps; documents
    /// without one never expire.
    pub fn is_expired(&self, doc: &Document, now_ms: i64) -> bool {
        let ts = match read_path(doc, &self.field) {
            Some(Bson::Int32(ts)) => f64::from(*ts),
            Some(Bson::Int64(ts)) => *ts as f64,
            Some(Bson::Double(ts)) => *ts,
            Some(Bson::DateTime(ts)) => ts.timestamp_millis() as f64,
            _ => return false,
        };

        now_ms as f64 >= ts + (self.expire_after_seconds as f64) * 1000.0
    }
}

/// Configuration for a collection.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use livedoc::config::{CollectionConfig, TtlIndex};
///
/// let config = CollectionConfig::new()
///     .with_ttl_index(TtlIndex::new("created_at", 3600))
///     .with_ttl_interval(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Expiry rules checked by the sweeper.
    pub ttl_indexes: Vec<TtlIndex>,
    /// Period between sweeps, in milliseconds.
    pub ttl_interval_ms: u64,
}

impl CollectionConfig {
    pub fn new() -> Self {
        Self {
            ttl_indexes: Vec::new(),
            ttl_interval_ms: DEFAULT_TTL_INTERVAL_MS,
        }
    }

    /// Adds a TTL index.
    #[must_use]
    pub fn with_ttl_index(mut self, index: TtlIndex) -> Self {
        self.ttl_indexes.push(index);
        self
    }

    /// Sets the sweep period.
    #[must_use]
    pub fn with_ttl_interval(mut self, interval: Duration) -> Self {
        self.ttl_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn ttl_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_interval_ms)
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
