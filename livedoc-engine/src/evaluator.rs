//! Query evaluation against in-memory documents.
//!
//! This module provides the predicate matcher used by the write path and by
//! cursors, along with the value comparisons shared by sorting, grouping and
//! the modifier engine.

use std::cmp::Ordering;

use bson::{Bson, Document, datetime::DateTime};

use livedoc_core::{
    document::{is_missing, read_path},
    query::{Condition, Expr, FieldOp, Query, QueryVisitor},
};

/// Comparable view of a BSON value.
///
/// Numbers are normalized to f64 so that Int32, Int64 and Double compare
/// numerically. Values of other types only equal themselves.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    Array(&'a [Bson]),
    Map(&'a Document),
    Other(&'a Bson),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(f64::from(*value)),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(items) => Comparable::Array(items),
            Bson::Document(doc) => Comparable::Map(doc),
            other => Comparable::Other(other),
        }
    }
}

impl<'a> PartialEq for Comparable<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| bson_equal(a, b))
            }
            (Comparable::Map(a), Comparable::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| b.get(key).is_some_and(|other| bson_equal(value, other)))
            }
            (Comparable::Other(a), Comparable::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> PartialOrd for Comparable<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Deep equality with numeric normalization.
pub(crate) fn bson_equal(a: &Bson, b: &Bson) -> bool {
    Comparable::from(a) == Comparable::from(b)
}

/// Equality of possibly-missing values. Missing equals only missing or undefined.
pub(crate) fn values_equal(a: Option<&Bson>, b: Option<&Bson>) -> bool {
    match (is_missing(a), is_missing(b)) {
        (true, true) => true,
        (false, false) => match (a, b) {
            (Some(a), Some(b)) => bson_equal(a, b),
            _ => false,
        },
        _ => false,
    }
}

/// Ordering of possibly-missing values, defined only for same-kind scalars.
pub(crate) fn compare_values(a: Option<&Bson>, b: Option<&Bson>) -> Option<Ordering> {
    match (a, b) {
        (Some(a), Some(b)) => Comparable::from(a).partial_cmp(&Comparable::from(b)),
        _ => None,
    }
}

/// Returns true if the document satisfies every clause of the query.
pub fn matches(doc: &Document, query: &Query) -> bool {
    DocumentEvaluator::new(doc).visit_query(query)
}

pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    fn check(&self, value: Option<&Bson>, op: &FieldOp) -> bool {
        match op {
            FieldOp::Eq(expected) => values_equal(value, Some(expected)),
            FieldOp::Ne(expected) => !values_equal(value, Some(expected)),
            FieldOp::Gt(expected) | FieldOp::Gte(expected) | FieldOp::Lt(expected) | FieldOp::Lte(expected) => {
                match compare_values(value, Some(expected)) {
                    Some(ordering) => match op {
                        FieldOp::Gt(_) => ordering == Ordering::Greater,
                        FieldOp::Gte(_) => ordering != Ordering::Less,
                        FieldOp::Lt(_) => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    },
                    None => false,
                }
            }
            FieldOp::In(expected) => match expected {
                Bson::Array(candidates) => candidates.iter().any(|item| values_equal(value, Some(item))),
                _ => false,
            },
            FieldOp::Nin(expected) => match expected {
                Bson::Array(candidates) => !candidates.iter().any(|item| values_equal(value, Some(item))),
                _ => false,
            },
            FieldOp::Exists(should_exist) => !is_missing(value) == *should_exist,
            FieldOp::Regex(pattern) => match value {
                Some(Bson::String(text)) => pattern.is_match(text),
                _ => false,
            },
            FieldOp::Size(expected) => match value {
                Some(Bson::Array(items)) => {
                    Comparable::Number(items.len() as f64) == Comparable::from(expected)
                }
                _ => false,
            },
            FieldOp::Unrecognized(_) => false,
        }
    }
}

impl<'a> QueryVisitor for DocumentEvaluator<'a> {
    type Output = bool;

    fn visit_and(&mut self, exprs: &[Expr]) -> bool {
        exprs.iter().all(|expr| self.visit_expr(expr))
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> bool {
        exprs.iter().any(|expr| self.visit_expr(expr))
    }

    fn visit_not(&mut self, expr: &Expr) -> bool {
        !self.visit_expr(expr)
    }

    fn visit_field(&mut self, path: &str, condition: &Condition) -> bool {
        let value = read_path(self.document, path);

        match condition {
            Condition::Always => true,
            Condition::Literal(expected) => values_equal(value, Some(expected)),
            Condition::Operators(ops) => ops.iter().all(|op| self.check(value, op)),
        }
    }

    fn visit_invalid(&mut self, _reason: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use livedoc_core::query::Filter;
    use proptest::prelude::*;

    fn check(doc: Document, query: Document) -> bool {
        matches(&doc, &Query::from(query))
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(check(doc! { "id": "1" }, doc! {}));
    }

    #[test]
    fn literals_compare_strictly() {
        let doc = doc! { "id": "1", "age": 30, "name": "a", "nothing": null };
        assert!(check(doc.clone(), doc! { "age": 30_i64 }));
        assert!(check(doc.clone(), doc! { "age": 30.0 }));
        assert!(!check(doc.clone(), doc! { "age": "30" }));
        assert!(check(doc.clone(), doc! { "nothing": null }));
        assert!(!check(doc, doc! { "missing": null }));
    }

    #[test]
    fn undefined_condition_matches_unconditionally() {
        assert!(check(doc! { "id": "1" }, doc! { "missing": Bson::Undefined }));
        assert!(!check(doc! { "id": "1", "a": 1 }, doc! { "a": { "$exists": false } }));
    }

    #[test]
    fn comparison_operators_need_same_kind_values() {
        let doc = doc! { "age": 30, "name": "bob" };
        assert!(check(doc.clone(), doc! { "age": { "$gt": 20, "$lte": 30 } }));
        assert!(!check(doc.clone(), doc! { "age": { "$gt": "20" } }));
        assert!(check(doc.clone(), doc! { "name": { "$gte": "bob", "$lt": "carl" } }));
        assert!(!check(doc, doc! { "missing": { "$lt": 5 } }));
    }

    #[test]
    fn membership_requires_arrays() {
        let doc = doc! { "tag": "a" };
        assert!(check(doc.clone(), doc! { "tag": { "$in": ["a", "b"] } }));
        assert!(!check(doc.clone(), doc! { "tag": { "$nin": ["a", "b"] } }));
        assert!(!check(doc.clone(), doc! { "tag": { "$in": "a" } }));
        assert!(!check(doc, doc! { "tag": { "$nin": "z" } }));
    }

    #[test]
    fn exists_uses_truthiness() {
        let doc = doc! { "a": 0, "u": Bson::Undefined };
        assert!(check(doc.clone(), doc! { "a": { "$exists": 1 } }));
        assert!(check(doc.clone(), doc! { "u": { "$exists": false } }));
        assert!(check(doc, doc! { "b": { "$exists": 0 } }));
    }

    #[test]
    fn regex_and_size() {
        let doc = doc! { "name": "alice", "tags": ["x", "y"], "n": 5 };
        assert!(check(doc.clone(), doc! { "name": { "$regex": "^al" } }));
        assert!(!check(doc.clone(), doc! { "n": { "$regex": "5" } }));
        assert!(!check(doc.clone(), doc! { "name": { "$regex": "(" } }));
        assert!(check(doc.clone(), doc! { "tags": { "$size": 2 } }));
        assert!(!check(doc, doc! { "name": { "$size": 5 } }));
    }

    #[test]
    fn connectives() {
        let doc = doc! { "a": 1, "b": 2 };
        assert!(check(doc.clone(), doc! { "$or": [ { "a": 2 }, { "b": 2 } ] }));
        assert!(!check(doc.clone(), doc! { "$and": [ { "a": 1 }, { "b": 3 } ] }));
        assert!(check(doc.clone(), doc! { "$not": { "a": 2 } }));
        assert!(!check(doc.clone(), doc! { "$or": { "a": 1 } }));
        assert!(!check(doc, doc! { "$and": "nope" }));
    }

    #[test]
    fn unknown_operators_fail_closed() {
        assert!(!check(doc! { "a": 1 }, doc! { "a": { "$near": 1 } }));
        assert!(check(doc! { "a": 1 }, doc! { "a": {} }));
        assert!(!check(doc! { "a": [1] }, doc! { "a": [1] }));
    }

    #[test]
    fn nested_paths_and_deep_equality() {
        let doc = doc! { "address": { "city": "ams", "geo": [1, 2] } };
        assert!(check(doc.clone(), doc! { "address.city": "ams" }));
        assert!(check(doc.clone(), doc! { "address.geo.1": 2 }));
        assert!(check(doc, doc! { "address": { "$eq": { "geo": [1, 2], "city": "ams" } } }));
    }

    #[test]
    fn built_filters_match_like_parsed_queries() {
        let doc = doc! { "age": 40, "tags": ["a"] };
        let query = Query::from(Filter::gt("age", 30).and(Filter::size("tags", 1)));
        assert!(matches(&doc, &query));
        assert!(!matches(&doc, &Query::from(Filter::exists("age").not())));
    }

    proptest! {
        #[test]
        fn clause_order_does_not_change_the_result(a in -5i32..5, b in -5i32..5, qa in -5i32..5, qb in -5i32..5) {
            let doc = doc! { "a": a, "b": b };
            let forward = check(doc.clone(), doc! { "a": { "$gte": qa }, "b": { "$lt": qb } });
            let backward = check(doc, doc! { "b": { "$lt": qb }, "a": { "$gte": qa } });
            prop_assert_eq!(forward, backward);
        }
    }
}
