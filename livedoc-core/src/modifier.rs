//! Declarative update modifiers.
//!
//! A [`Modifier`] groups `(path, value)` pairs by [`UpdateOp`]. Groups are
//! applied in the declaration order of [`UpdateOp`], regardless of the order
//! in which they were added or parsed.
//!
//! ```ignore
//! use bson::doc;
//! use livedoc::modifier::Modifier;
//!
//! let parsed = Modifier::from(doc! { "$set": { "name": "nl" }, "$inc": { "visits": 1 } });
//! let built = Modifier::new().set("name", "nl").inc("visits", 1);
//! ```

use std::collections::BTreeMap;

use bson::{Bson, Document};
use tracing::debug;

/// Update operators, declared in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateOp {
    /// Sets a field only when inserting through an upsert, and only if missing.
    SetOnInsert,
    /// Sets a field when its value differs.
    Set,
    /// Adds to a numeric field (missing counts as zero).
    Inc,
    /// Lowers a numeric field.
    Min,
    /// Raises a numeric field.
    Max,
    /// Multiplies a numeric field (missing counts as zero).
    Mul,
    /// Removes a field.
    Unset,
    /// Appends to an array, creating it if needed.
    Push,
    /// Appends to an array unless an equal element exists.
    AddToSet,
    /// Removes every equal element from an array.
    Pull,
}

impl UpdateOp {
    /// Looks up an operator by its `$name`.
    pub fn from_key(key: &str) -> Option<UpdateOp> {
        Some(match key {
            "$setOnInsert" => UpdateOp::SetOnInsert,
            "$set" => UpdateOp::Set,
            "$inc" => UpdateOp::Inc,
            "$min" => UpdateOp::Min,
            "$max" => UpdateOp::Max,
            "$mul" => UpdateOp::Mul,
            "$unset" => UpdateOp::Unset,
            "$push" => UpdateOp::Push,
            "$addToSet" => UpdateOp::AddToSet,
            "$pull" => UpdateOp::Pull,
            _ => return None,
        })
    }

    pub fn key(&self) -> &'static str {
        match self {
            UpdateOp::SetOnInsert => "$setOnInsert",
            UpdateOp::Set => "$set",
            UpdateOp::Inc => "$inc",
            UpdateOp::Min => "$min",
            UpdateOp::Max => "$max",
            UpdateOp::Mul => "$mul",
            UpdateOp::Unset => "$unset",
            UpdateOp::Push => "$push",
            UpdateOp::AddToSet => "$addToSet",
            UpdateOp::Pull => "$pull",
        }
    }
}

/// A typed update specification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modifier {
    groups: BTreeMap<UpdateOp, Vec<(String, Bson)>>,
}

impl Modifier {
    pub fn new() -> Self {
        Modifier::default()
    }

    /// Parses a MongoDB-style update document.
    ///
    /// Unknown operator groups, and groups whose value is not a document, are
    /// ignored.
    pub fn from_document(doc: &Document) -> Self {
        let mut modifier = Modifier::new();

        for (key, value) in doc {
            let Some(op) = UpdateOp::from_key(key) else {
                debug!(operator = %key, "ignoring unknown update operator");
                continue;
            };

            let Bson::Document(fields) = value else {
                debug!(operator = %key, "ignoring update operator without a field document");
                continue;
            };

            for (path, operand) in fields {
                modifier = modifier.with(op, path.clone(), operand.clone());
            }
        }

        modifier
    }

    /// Adds a `(path, value)` pair under an operator.
    #[must_use]
    pub fn with(mut self, op: UpdateOp, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.groups
            .entry(op)
            .or_default()
            .push((path.into(), value.into()));
        self
    }

    #[must_use]
    pub fn set_on_insert(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::SetOnInsert, path, value)
    }

    #[must_use]
    pub fn set(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Set, path, value)
    }

    #[must_use]
    pub fn inc(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Inc, path, value)
    }

    #[must_use]
    pub fn min(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Min, path, value)
    }

    #[must_use]
    pub fn max(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Max, path, value)
    }

    #[must_use]
    pub fn mul(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Mul, path, value)
    }

    #[must_use]
    pub fn unset(self, path: impl Into<String>) -> Self {
        self.with(UpdateOp::Unset, path, true)
    }

    #[must_use]
    pub fn push(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Push, path, value)
    }

    #[must_use]
    pub fn add_to_set(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::AddToSet, path, value)
    }

    #[must_use]
    pub fn pull(self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with(UpdateOp::Pull, path, value)
    }

    /// Iterates operator groups in application order.
    pub fn groups(&self) -> impl Iterator<Item = (UpdateOp, &[(String, Bson)])> {
        self.groups.iter().map(|(op, fields)| (*op, fields.as_slice()))
    }

    /// Returns the pairs registered under one operator.
    pub fn group(&self, op: UpdateOp) -> &[(String, Bson)] {
        self.groups.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl From<Document> for Modifier {
    fn from(doc: Document) -> Self {
        Modifier::from_document(&doc)
    }
}

impl From<&Document> for Modifier {
    fn from(doc: &Document) -> Self {
        Modifier::from_document(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn groups_iterate_in_application_order() {
        let modifier = Modifier::from(doc! {
            "$pull": { "tags": "a" },
            "$set": { "name": "x" },
            "$setOnInsert": { "created": 1 },
            "$inc": { "n": 1 },
        });

        let order = modifier.groups().map(|(op, _)| op).collect::<Vec<_>>();
        assert_eq!(order, vec![UpdateOp::SetOnInsert, UpdateOp::Set, UpdateOp::Inc, UpdateOp::Pull]);
    }

    #[test]
    fn unknown_and_malformed_groups_are_ignored() {
        let modifier = Modifier::from(doc! { "$rename": { "a": "b" }, "$set": 5 });
        assert!(modifier.is_empty());
    }

    #[test]
    fn builder_matches_parsed_document() {
        let built = Modifier::new().set("a.b", 1).push("tags", "x");
        let parsed = Modifier::from(doc! { "$push": { "tags": "x" }, "$set": { "a.b": 1 } });
        assert_eq!(built, parsed);
        assert_eq!(built.group(UpdateOp::Set), &[("a.b".to_string(), Bson::Int32(1))]);
    }

    #[test]
    fn operator_keys_round_trip() {
        for op in [UpdateOp::SetOnInsert, UpdateOp::AddToSet, UpdateOp::Pull] {
            assert_eq!(UpdateOp::from_key(op.key()), Some(op));
        }
        assert_eq!(UpdateOp::from_key("$rename"), None);
    }
}
