//! Query construction and parsing for collection lookups.
//!
//! A [`Query`] is an implicit AND of [`Expr`] clauses. Queries are either built
//! with the [`Filter`] helpers or parsed from a MongoDB-style document:
//!
//! ```ignore
//! use bson::doc;
//! use livedoc::query::{Query, Filter};
//!
//! let parsed = Query::from(doc! { "age": { "$gt": 30 }, "country": "NL" });
//! let built = Query::from(Filter::gt("age", 30).and(Filter::eq("country", "NL")));
//! ```
//!
//! # Parsing rules
//!
//! Parsing never fails. Each top-level key becomes one clause:
//!
//! - `$and` / `$or` take an array of sub-queries; anything else becomes
//!   [`Expr::Invalid`], which never matches.
//! - `$not` takes a single sub-query document.
//! - every other key is a dotted field path. An `Undefined` condition matches
//!   unconditionally, a document condition is a list of operators, and any
//!   other value is compared for strict equality.
//!
//! Operators that are not recognized are kept as [`FieldOp::Unrecognized`] and
//! always evaluate to `false`.
//!
//! # Find options
//!
//! [`FindOptions`] carries the sort, skip, limit and projection applied by a
//! cursor on top of the query result.

use bson::{Bson, Document};
use regex::Regex;

use crate::document::{ID_FIELD, write_path};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

/// Sort key for query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// The dotted field path to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Sort { field: field.into(), direction: SortDirection::Asc }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Sort { field: field.into(), direction: SortDirection::Desc }
    }

    /// Parses a sort document such as `{ "age": -1, "name": 1 }`.
    ///
    /// Negative numbers sort descending, everything else ascending.
    pub fn from_document(doc: &Document) -> Vec<Sort> {
        doc.iter()
            .map(|(field, dir)| {
                let descending = match dir {
                    Bson::Int32(n) => *n < 0,
                    Bson::Int64(n) => *n < 0,
                    Bson::Double(n) => *n < 0.0,
                    _ => false,
                };

                if descending { Sort::desc(field) } else { Sort::asc(field) }
            })
            .collect()
    }
}

/// A compiled `$regex` pattern.
///
/// Patterns that fail to compile are kept so that the query still reports its
/// source, but they never match.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub source: String,
    pub compiled: Option<Regex>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let compiled = Regex::new(&source).ok();

        Pattern { source, compiled }
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.compiled
            .as_ref()
            .is_some_and(|regex| regex.is_match(value))
    }
}

/// Field comparison operators.
#[derive(Debug, Clone)]
pub enum FieldOp {
    /// Strictly equal to.
    Eq(Bson),
    /// Not strictly equal to.
    Ne(Bson),
    /// Greater than (same-kind values only).
    Gt(Bson),
    /// Greater than or equal to.
    Gte(Bson),
    /// Less than.
    Lt(Bson),
    /// Less than or equal to.
    Lte(Bson),
    /// Value is one of the elements of the expected array.
    In(Bson),
    /// Value is none of the elements of the expected array.
    Nin(Bson),
    /// Field presence must equal the flag.
    Exists(bool),
    /// String value matches the pattern.
    Regex(Pattern),
    /// Array value has exactly the expected length.
    Size(Bson),
    /// Operator key that is not understood. Always false.
    Unrecognized(String),
}

impl FieldOp {
    /// Parses a single `$op: value` pair.
    pub fn parse(op: &str, expected: &Bson) -> FieldOp {
        let expected_value = expected.clone();

        match op {
            "$eq" => FieldOp::Eq(expected_value),
            "$ne" => FieldOp::Ne(expected_value),
            "$gt" => FieldOp::Gt(expected_value),
            "$gte" => FieldOp::Gte(expected_value),
            "$lt" => FieldOp::Lt(expected_value),
            "$lte" => FieldOp::Lte(expected_value),
            "$in" => FieldOp::In(expected_value),
            "$nin" => FieldOp::Nin(expected_value),
            "$exists" => FieldOp::Exists(is_truthy(expected)),
            "$regex" => match expected {
                Bson::String(source) => FieldOp::Regex(Pattern::new(source.as_str())),
                Bson::RegularExpression(regex) => FieldOp::Regex(Pattern::new(regex.pattern.as_str())),
                _ => FieldOp::Unrecognized(op.to_string()),
            },
            "$size" => FieldOp::Size(expected_value),
            other => FieldOp::Unrecognized(other.to_string()),
        }
    }
}

/// Truthiness of a value when used as a flag.
///
/// `false`, `null`, undefined, zero, NaN and the empty string are falsy.
pub fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(flag) => *flag,
        Bson::Null | Bson::Undefined => false,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0 && !n.is_nan(),
        Bson::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// The condition applied to the value at a field path.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Matches every document, including ones without the field.
    Always,
    /// Strict equality with a scalar.
    Literal(Bson),
    /// Every operator must hold. An empty list always holds.
    Operators(Vec<FieldOp>),
}

impl Condition {
    pub fn parse(value: &Bson) -> Condition {
        match value {
            Bson::Undefined => Condition::Always,
            Bson::Document(ops) => Condition::Operators(
                ops.iter()
                    .map(|(op, expected)| FieldOp::parse(op, expected))
                    .collect(),
            ),
            // Array conditions are read as operator objects keyed by index.
            Bson::Array(items) => Condition::Operators(
                (0..items.len())
                    .map(|index| FieldOp::Unrecognized(index.to_string()))
                    .collect(),
            ),
            literal => Condition::Literal(literal.clone()),
        }
    }
}

/// A filter expression for querying documents.
///
/// # Example
///
/// ```ignore
/// use livedoc::query::Filter;
///
/// let expr = Filter::or([
///     Filter::eq("status", "active"),
///     Filter::gt("age", 18).not(),
/// ]);
/// ```
#[derive(Debug, Clone)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Condition on the value at a dotted field path.
    Field {
        /// The dotted field path.
        path: String,
        /// The condition to apply.
        condition: Condition,
    },
    /// A malformed clause. Never matches.
    Invalid(String),
}

impl Expr {
    /// Creates a field condition expression.
    pub fn field(path: impl Into<String>, condition: Condition) -> Self {
        Expr::Field { path: path.into(), condition }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    ///
    /// If this expression is already an OR, the other expression is appended
    /// to the list. Otherwise, a new OR expression is created.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    fn parse_entry(key: &str, value: &Bson) -> Expr {
        match key {
            "$and" | "$or" => {
                let Bson::Array(items) = value else {
                    return Expr::Invalid(format!("{key} expects an array"));
                };

                let exprs = items
                    .iter()
                    .map(|item| match item {
                        Bson::Document(doc) => Expr::And(Query::from_document(doc).clauses),
                        _ => Expr::Invalid(format!("{key} expects sub-query documents")),
                    })
                    .collect();

                if key == "$and" { Expr::And(exprs) } else { Expr::Or(exprs) }
            }
            "$not" => match value {
                Bson::Document(doc) => Expr::And(Query::from_document(doc).clauses).not(),
                _ => Expr::Invalid("$not expects a sub-query document".to_string()),
            },
            path => Expr::field(path, Condition::parse(value)),
        }
    }
}

/// A parsed or built query: every clause must match.
///
/// The empty query matches every document.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub clauses: Vec<Expr>,
}

impl Query {
    /// Creates a query that matches every document.
    pub fn new() -> Self {
        Query::default()
    }

    /// Parses a MongoDB-style query document.
    pub fn from_document(doc: &Document) -> Self {
        Query {
            clauses: doc
                .iter()
                .map(|(key, value)| Expr::parse_entry(key, value))
                .collect(),
        }
    }

    /// Adds a clause to this query.
    pub fn and(mut self, expr: Expr) -> Self {
        self.clauses.push(expr);
        self
    }

    /// Returns true when the query has no clauses.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Returns the id named by a top-level string equality on `id`, if any.
    ///
    /// Such queries can be answered by a single key lookup.
    pub fn id_lookup(&self) -> Option<&str> {
        self.clauses.iter().find_map(|clause| match clause {
            Expr::Field { path, condition } if path == ID_FIELD => match equality_value(condition) {
                Some(Bson::String(id)) => Some(id.as_str()),
                _ => None,
            },
            _ => None,
        })
    }

    /// Builds the seed document for an upsert from the query's top-level
    /// equality conditions.
    pub fn upsert_base(&self) -> Document {
        let mut base = Document::new();

        for clause in &self.clauses {
            if let Expr::Field { path, condition } = clause {
                if let Some(value) = equality_value(condition) {
                    write_path(&mut base, path, value.clone());
                }
            }
        }

        base
    }
}

fn equality_value(condition: &Condition) -> Option<&Bson> {
    match condition {
        Condition::Literal(value) => Some(value),
        Condition::Operators(ops) => match ops.as_slice() {
            [FieldOp::Eq(value)] => Some(value),
            _ => None,
        },
        Condition::Always => None,
    }
}

impl From<Document> for Query {
    fn from(doc: Document) -> Self {
        Query::from_document(&doc)
    }
}

impl From<&Document> for Query {
    fn from(doc: &Document) -> Self {
        Query::from_document(doc)
    }
}

impl From<Expr> for Query {
    fn from(expr: Expr) -> Self {
        Query { clauses: vec![expr] }
    }
}

/// Helper struct for constructing filter expressions.
///
/// All methods accept field paths and values as `Into<String>` and `Into<Bson>`.
///
/// # Example
///
/// ```ignore
/// use livedoc::query::Filter;
///
/// let expr = Filter::eq("name", "Alice")
///     .and(Filter::gt("age", 18));
/// ```
pub struct Filter;

impl Filter {
    /// Matches documents whose field strictly equals the value.
    pub fn eq(path: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Filter::op(path, FieldOp::Eq(value.into()))
    }

    /// Matches documents whose field is not strictly equal to the value.
    pub fn ne(path: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Filter::op(path, FieldOp::Ne(value.into()))
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Filter::op(path, FieldOp::Gt(value.into()))
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Filter::op(path, FieldOp::Gte(value.into()))
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Filter::op(path, FieldOp::Lt(value.into()))
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Filter::op(path, FieldOp::Lte(value.into()))
    }

    /// Matches documents whose field equals one of the values.
    pub fn any_of(path: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Filter::op(path, FieldOp::In(Bson::Array(values.into_iter().map(Into::into).collect())))
    }

    /// Matches documents whose field equals none of the values.
    pub fn none_of(path: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Filter::op(path, FieldOp::Nin(Bson::Array(values.into_iter().map(Into::into).collect())))
    }

    /// Matches documents where the field is present.
    pub fn exists(path: impl Into<String>) -> Expr {
        Filter::op(path, FieldOp::Exists(true))
    }

    /// Matches documents where the field is absent.
    pub fn not_exists(path: impl Into<String>) -> Expr {
        Filter::op(path, FieldOp::Exists(false))
    }

    /// Matches string fields against a regular expression.
    pub fn regex(path: impl Into<String>, pattern: impl Into<String>) -> Expr {
        Filter::op(path, FieldOp::Regex(Pattern::new(pattern)))
    }

    /// Matches array fields with exactly `len` elements.
    pub fn size(path: impl Into<String>, len: i64) -> Expr {
        Filter::op(path, FieldOp::Size(Bson::Int64(len)))
    }

    /// Combines multiple expressions such that all must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Combines multiple expressions such that any can match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    fn op(path: impl Into<String>, op: FieldOp) -> Expr {
        Expr::field(path, Condition::Operators(vec![op]))
    }
}

/// Options applied by a cursor on top of a query result.
///
/// # Example
///
/// ```ignore
/// use livedoc::query::{FindOptions, Sort};
///
/// let options = FindOptions::new()
///     .sort([Sort::desc("age")])
///     .skip(10)
///     .limit(10)
///     .projection(["name", "age"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Vec<Sort>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn new() -> Self {
        FindOptions::default()
    }

    #[must_use]
    pub fn sort(mut self, keys: impl IntoIterator<Item = Sort>) -> Self {
        self.sort = Some(keys.into_iter().collect());
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn projection(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Visitor over query expressions, implemented by evaluators.
///
/// Unparseable input is already captured as [`Expr::Invalid`] when a query is
/// built, so visiting itself cannot fail.
pub trait QueryVisitor {
    type Output;

    fn visit_and(&mut self, exprs: &[Expr]) -> Self::Output;
    fn visit_or(&mut self, exprs: &[Expr]) -> Self::Output;
    fn visit_not(&mut self, expr: &Expr) -> Self::Output;
    fn visit_field(&mut self, path: &str, condition: &Condition) -> Self::Output;
    fn visit_invalid(&mut self, reason: &str) -> Self::Output;

    fn visit_expr(&mut self, expr: &Expr) -> Self::Output {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Field { path, condition } => self.visit_field(path, condition),
            Expr::Invalid(reason) => self.visit_invalid(reason),
        }
    }

    fn visit_query(&mut self, query: &Query) -> Self::Output {
        self.visit_and(&query.clauses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[derive(Default)]
    struct FieldPaths(Vec<String>);

    impl QueryVisitor for FieldPaths {
        type Output = ();

        fn visit_and(&mut self, exprs: &[Expr]) {
            exprs.iter().for_each(|expr| self.visit_expr(expr));
        }

        fn visit_or(&mut self, exprs: &[Expr]) {
            self.visit_and(exprs);
        }

        fn visit_not(&mut self, expr: &Expr) {
            self.visit_expr(expr);
        }

        fn visit_field(&mut self, path: &str, _condition: &Condition) {
            self.0.push(path.to_string());
        }

        fn visit_invalid(&mut self, _reason: &str) {}
    }

    #[test]
    fn visitors_walk_every_clause() {
        let query = Query::from(doc! {
            "$or": [ { "a": 1 }, { "$not": { "b": 2 } } ],
            "c.d": "x",
            "$and": 5,
        });

        let mut paths = FieldPaths::default();
        paths.visit_query(&query);
        paths.0.sort();
        assert_eq!(paths.0, vec!["a", "b", "c.d"]);
    }

    #[test]
    fn parses_connectives_and_fields() {
        let query = Query::from(doc! {
            "$or": [ { "a": 1 }, { "b": { "$gt": 2 } } ],
            "c.d": "x",
        });

        assert_eq!(query.clauses.len(), 2);
        assert!(matches!(&query.clauses[0], Expr::Or(items) if items.len() == 2));
        assert!(matches!(
            &query.clauses[1],
            Expr::Field { path, condition: Condition::Literal(Bson::String(s)) } if path == "c.d" && s == "x"
        ));
    }

    #[test]
    fn malformed_connectives_become_invalid() {
        let query = Query::from(doc! { "$and": 5, "$not": "x" });
        assert!(query.clauses.iter().all(|c| matches!(c, Expr::Invalid(_))));
    }

    #[test]
    fn unknown_operators_are_kept_as_unrecognized() {
        let query = Query::from(doc! { "a": { "$near": 1, "$eq": 2 } });
        let Expr::Field { condition: Condition::Operators(ops), .. } = &query.clauses[0] else {
            panic!("expected operators");
        };
        assert!(matches!(&ops[0], FieldOp::Unrecognized(op) if op == "$near"));
        assert!(matches!(&ops[1], FieldOp::Eq(Bson::Int32(2))));
    }

    #[test]
    fn undefined_condition_is_always() {
        let query = Query::from(doc! { "a": Bson::Undefined });
        assert!(matches!(&query.clauses[0], Expr::Field { condition: Condition::Always, .. }));
    }

    #[test]
    fn id_lookup_requires_string_equality() {
        assert_eq!(Query::from(doc! { "id": "x", "a": 1 }).id_lookup(), Some("x"));
        assert_eq!(Query::from(Filter::eq("id", "y")).id_lookup(), Some("y"));
        assert_eq!(Query::from(doc! { "id": 3 }).id_lookup(), None);
        assert_eq!(Query::from(doc! { "id": { "$ne": "x" } }).id_lookup(), None);
    }

    #[test]
    fn upsert_base_keeps_equality_fields_only() {
        let query = Query::from(doc! {
            "name": "nl",
            "meta.region": "eu",
            "population": { "$gt": 3 },
            "$or": [ { "x": 1 } ],
        });

        assert_eq!(query.upsert_base(), doc! { "name": "nl", "meta": { "region": "eu" } });
    }

    #[test]
    fn sort_documents_parse_directions() {
        let keys = Sort::from_document(&doc! { "age": -1, "name": 1 });
        assert_eq!(keys, vec![Sort::desc("age"), Sort::asc("name")]);
    }

    #[test]
    fn invalid_regex_never_matches() {
        let pattern = Pattern::new("(");
        assert!(pattern.compiled.is_none());
        assert!(!pattern.is_match("("));
    }
}
