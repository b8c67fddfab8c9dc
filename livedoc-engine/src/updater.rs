//! Modifier application.
//!
//! [`apply_modifier`] is pure: it never touches the input document. When no
//! operator changes anything the input `Arc` itself is returned, so callers can
//! detect "not modified" with `Arc::ptr_eq`. Otherwise the document is copied
//! once, on the first write, and every later operator edits that copy along
//! its own path only.

use std::sync::Arc;

use bson::{Bson, Document};

use livedoc_core::{
    document::{can_write_path, is_missing, read_path, read_path_mut, remove_path, write_path},
    modifier::{Modifier, UpdateOp},
};

use crate::evaluator::{bson_equal, values_equal};

/// Flags for a single application.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyContext {
    /// True when the document is being created by an upsert.
    pub inserting: bool,
}

/// Copy-on-first-write wrapper around the input document.
struct Draft<'a> {
    original: &'a Arc<Document>,
    copy: Option<Document>,
}

impl<'a> Draft<'a> {
    fn new(original: &'a Arc<Document>) -> Self {
        Self { original, copy: None }
    }

    fn current(&self) -> &Document {
        self.copy.as_ref().unwrap_or(self.original.as_ref())
    }

    fn get(&self, path: &str) -> Option<&Bson> {
        read_path(self.current(), path)
    }

    fn working(&mut self) -> &mut Document {
        self.copy.get_or_insert_with(|| self.original.as_ref().clone())
    }

    /// Writes only if the path is writable, so a refused write never forces a copy.
    fn write(&mut self, path: &str, value: Bson) {
        if can_write_path(self.current(), path) {
            write_path(self.working(), path, value);
        }
    }

    /// Removes a document field. Array elements are never removed, so asking
    /// for one leaves the draft uncopied.
    fn remove(&mut self, path: &str) {
        let parent_is_document = match path.rsplit_once('.') {
            Some((parent, _)) => matches!(self.get(parent), Some(Bson::Document(_))),
            None => true,
        };

        if parent_is_document && !is_missing(self.get(path)) {
            remove_path(self.working(), path);
        }
    }

    fn finish(self) -> Arc<Document> {
        match self.copy {
            Some(copy) => Arc::new(copy),
            None => Arc::clone(self.original),
        }
    }
}

/// Applies a modifier, returning the input `Arc` when nothing changed.
pub fn apply_modifier(doc: &Arc<Document>, modifier: &Modifier, ctx: ApplyContext) -> Arc<Document> {
    let mut draft = Draft::new(doc);

    for (op, fields) in modifier.groups() {
        for (path, operand) in fields {
            apply_one(&mut draft, op, path, operand, ctx);
        }
    }

    draft.finish()
}

fn apply_one(draft: &mut Draft<'_>, op: UpdateOp, path: &str, operand: &Bson, ctx: ApplyContext) {
    match op {
        UpdateOp::SetOnInsert => {
            if ctx.inserting && is_missing(draft.get(path)) {
                draft.write(path, operand.clone());
            }
        }
        UpdateOp::Set => {
            if !values_equal(draft.get(path), Some(operand)) {
                draft.write(path, operand.clone());
            }
        }
        UpdateOp::Inc | UpdateOp::Mul => {
            let current = draft.get(path).filter(|value| is_number(value)).cloned().unwrap_or(Bson::Int32(0));
            let Some(next) = arithmetic(op, &current, operand) else {
                return;
            };

            if !values_equal(draft.get(path), Some(&next)) {
                draft.write(path, next);
            }
        }
        UpdateOp::Min | UpdateOp::Max => {
            let Some(current) = draft.get(path).filter(|value| is_number(value)) else {
                return;
            };
            let (Some(current), Some(candidate)) = (as_f64(current), as_f64(operand)) else {
                return;
            };

            let replace = if op == UpdateOp::Min { candidate < current } else { candidate > current };
            if replace {
                draft.write(path, operand.clone());
            }
        }
        UpdateOp::Unset => draft.remove(path),
        UpdateOp::Push => {
            let next = match draft.get(path) {
                Some(Bson::Array(items)) => {
                    let mut items = items.clone();
                    items.push(operand.clone());
                    items
                }
                _ => vec![operand.clone()],
            };
            draft.write(path, Bson::Array(next));
        }
        UpdateOp::AddToSet => match draft.get(path) {
            Some(Bson::Array(items)) => {
                if !items.iter().any(|item| bson_equal(item, operand)) {
                    let mut items = items.clone();
                    items.push(operand.clone());
                    draft.write(path, Bson::Array(items));
                }
            }
            _ => draft.write(path, Bson::Array(vec![operand.clone()])),
        },
        UpdateOp::Pull => {
            if let Some(Bson::Array(items)) = draft.get(path) {
                if items.iter().any(|item| bson_equal(item, operand)) {
                    let kept = items
                        .iter()
                        .filter(|item| !bson_equal(item, operand))
                        .cloned()
                        .collect::<Vec<_>>();
                    if let Some(slot) = read_path_mut(draft.working(), path) {
                        *slot = Bson::Array(kept);
                    }
                }
            }
        }
    }
}

fn is_number(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

/// Integer arithmetic stays integral while it fits, falling back to doubles.
fn arithmetic(op: UpdateOp, current: &Bson, operand: &Bson) -> Option<Bson> {
    if !is_number(operand) {
        return None;
    }

    if let (Some(a), Some(b)) = (as_i64(current), as_i64(operand)) {
        let result = if op == UpdateOp::Inc { a.checked_add(b) } else { a.checked_mul(b) };

        if let Some(result) = result {
            let both_small = matches!((current, operand), (Bson::Int32(_), Bson::Int32(_)));
            return Some(match i32::try_from(result) {
                Ok(small) if both_small => Bson::Int32(small),
                _ => Bson::Int64(result),
            });
        }
    }

    let (a, b) = (as_f64(current)?, as_f64(operand)?);
    Some(Bson::Double(if op == UpdateOp::Inc { a + b } else { a * b }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use proptest::prelude::*;

    fn apply(doc: Document, modifier: Document) -> Arc<Document> {
        apply_modifier(&Arc::new(doc), &Modifier::from(modifier), ApplyContext::default())
    }

    #[test]
    fn no_change_returns_the_same_arc() {
        let doc = Arc::new(doc! { "id": "1", "a": 1, "tags": ["x"] });
        let modifier = Modifier::new()
            .set("a", 1)
            .inc("a", 0)
            .min("a", 5)
            .unset("missing")
            .add_to_set("tags", "x")
            .pull("tags", "z")
            .set_on_insert("b", 2);

        assert!(Arc::ptr_eq(&doc, &apply_modifier(&doc, &modifier, ApplyContext::default())));
    }

    #[test]
    fn set_writes_nested_paths_without_touching_input() {
        let doc = Arc::new(doc! { "id": "1", "a": { "b": 1 } });
        let next = apply_modifier(&doc, &Modifier::new().set("a.c", 2), ApplyContext::default());
        assert_eq!(*next, doc! { "id": "1", "a": { "b": 1, "c": 2 } });
        assert_eq!(*doc, doc! { "id": "1", "a": { "b": 1 } });
    }

    #[test]
    fn scalar_intermediates_refuse_the_write() {
        let doc = Arc::new(doc! { "a": 1 });
        let next = apply_modifier(&doc, &Modifier::new().set("a.b", 2), ApplyContext::default());
        assert!(Arc::ptr_eq(&doc, &next));
    }

    #[test]
    fn out_of_range_array_indexes_are_ignored() {
        let doc = Arc::new(doc! { "id": "1", "tags": ["a"] });
        let modifier = Modifier::new()
            .set("tags.18446744073709551615", 1)
            .set("tags.10000000000", 1)
            .inc("tags.4", 1);

        assert!(Arc::ptr_eq(&doc, &apply_modifier(&doc, &modifier, ApplyContext::default())));
    }

    #[test]
    fn unset_leaves_array_elements_alone() {
        let doc = Arc::new(doc! { "id": "1", "tags": ["a", "b"] });
        let next = apply_modifier(&doc, &Modifier::new().unset("tags.0"), ApplyContext::default());
        assert!(Arc::ptr_eq(&doc, &next));

        let next = apply_modifier(&doc, &Modifier::new().unset("tags.0").unset("id"), ApplyContext::default());
        assert_eq!(*next, doc! { "tags": ["a", "b"] });
    }

    #[test]
    fn inc_and_mul_default_to_zero() {
        let next = apply(doc! { "a": 2, "s": "x" }, doc! { "$inc": { "a": 3, "b": 1, "s": 2 }, "$mul": { "c": 4 } });
        assert_eq!(*next, doc! { "a": 5, "s": 2, "b": 1, "c": 0 });
    }

    #[test]
    fn inc_ignores_non_numeric_operands() {
        let doc = Arc::new(doc! { "a": 2 });
        let next = apply_modifier(&doc, &Modifier::new().inc("a", "1"), ApplyContext::default());
        assert!(Arc::ptr_eq(&doc, &next));
    }

    #[test]
    fn integer_overflow_falls_back() {
        let next = apply(doc! { "a": i32::MAX, "b": i64::MAX }, doc! { "$inc": { "a": 1, "b": 1 } });
        assert_eq!(next.get("a"), Some(&Bson::Int64(i64::from(i32::MAX) + 1)));
        assert_eq!(next.get("b"), Some(&Bson::Double(i64::MAX as f64 + 1.0)));
    }

    #[test]
    fn min_and_max_need_numbers_on_both_sides() {
        let next = apply(
            doc! { "lo": 5, "hi": 5, "s": "x" },
            doc! { "$min": { "lo": 3, "s": 1, "missing": 1 }, "$max": { "hi": 9.5 } },
        );
        assert_eq!(*next, doc! { "lo": 3, "hi": 9.5, "s": "x" });
    }

    #[test]
    fn array_operators() {
        let next = apply(
            doc! { "tags": ["a", "b", "a"], "set": [1], "scalar": 3 },
            doc! {
                "$push": { "scalar": "x", "fresh": 1 },
                "$addToSet": { "set": 1, "other": 2 },
                "$pull": { "tags": "a" },
            },
        );
        assert_eq!(
            *next,
            doc! { "tags": ["b"], "set": [1], "scalar": ["x"], "fresh": [1], "other": [2] }
        );
    }

    #[test]
    fn operators_apply_in_fixed_order() {
        // $unset runs after $set, so the field ends up removed.
        let next = apply(doc! { "a": 1 }, doc! { "$unset": { "a": true }, "$set": { "a": 2 } });
        assert_eq!(*next, doc! {});

        // $push runs after $inc and replaces the fresh counter with an array.
        let next = apply(doc! {}, doc! { "$push": { "n": 7 }, "$inc": { "n": 1 } });
        assert_eq!(*next, doc! { "n": [7] });
    }

    #[test]
    fn set_on_insert_only_when_inserting() {
        let doc = Arc::new(doc! { "a": 1 });
        let modifier = Modifier::new().set_on_insert("a", 2).set_on_insert("b", 3);

        assert!(Arc::ptr_eq(&doc, &apply_modifier(&doc, &modifier, ApplyContext::default())));

        let inserted = apply_modifier(&doc, &modifier, ApplyContext { inserting: true });
        assert_eq!(*inserted, doc! { "a": 1, "b": 3 });
    }

    proptest! {
        #[test]
        fn application_never_mutates_the_input(start in -100i32..100, delta in -100i32..100) {
            let doc = Arc::new(doc! { "id": "x", "n": start });
            let before = (*doc).clone();
            let next = apply_modifier(&doc, &Modifier::new().inc("n", delta), ApplyContext::default());

            prop_assert_eq!(&*doc, &before);
            prop_assert_eq!(Arc::ptr_eq(&doc, &next), delta == 0);
            prop_assert_eq!(next.get("n"), Some(&Bson::Int32(start + delta)));
        }
    }
}
