//! Documents, dotted field paths and id generation.
//!
//! Documents are plain [`bson::Document`] values. Every stored document carries
//! a string identifier under [`ID_FIELD`]. Fields are addressed with dotted
//! paths (`"address.city"`, `"tags.0"`), where numeric segments index arrays.
//!
//! Typed values can be moved in and out of documents through the [`Record`]
//! extension trait, which is implemented for every serde type.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bson::{Bson, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, from_value, to_value};
use uuid::Uuid;

use crate::error::{DocumentStoreError, DocumentStoreResult};

pub use bson::Document;

/// Name of the mandatory identifier field.
pub const ID_FIELD: &str = "id";

/// Generates a short, URL-safe identifier.
///
/// The id is the unpadded URL-safe base64 encoding of a random UUIDv4, which
/// is always 22 characters long.
pub fn new_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// Returns the string id of a document, if it has one.
pub fn document_id(doc: &Document) -> Option<&str> {
    match doc.get(ID_FIELD) {
        Some(Bson::String(id)) => Some(id.as_str()),
        _ => None,
    }
}

/// Returns true when a value should be treated as absent.
///
/// `Undefined` behaves exactly like a missing field wherever a document is read.
pub fn is_missing(value: Option<&Bson>) -> bool {
    matches!(value, None | Some(Bson::Undefined))
}

/// Reads the value at a dotted path.
///
/// Documents are traversed by key and arrays by numeric index. Any segment that
/// cannot be resolved yields `None`.
///
/// # Example
///
/// ```ignore
/// use bson::{doc, Bson};
/// use livedoc_core::document::read_path;
///
/// let doc = doc! { "a": { "b": [10, 20] } };
/// assert_eq!(read_path(&doc, "a.b.1"), Some(&Bson::Int32(20)));
/// assert_eq!(read_path(&doc, "a.c"), None);
/// ```
pub fn read_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;

    for segment in segments {
        current = child(current, segment)?;
    }

    Some(current)
}

fn child<'a>(value: &'a Bson, segment: &str) -> Option<&'a Bson> {
    match value {
        Bson::Document(doc) => doc.get(segment),
        Bson::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Returns a mutable reference to the value at a dotted path.
pub fn read_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get_mut(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(doc) => doc.get_mut(segment)?,
            Bson::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Writes a value at a dotted path, creating intermediate documents as needed.
///
/// Missing, null or undefined intermediates are replaced by empty documents.
/// A scalar intermediate (or a non-numeric segment into an array) leaves the
/// document untouched and returns `false`.
pub fn write_path(doc: &mut Document, path: &str, value: Bson) -> bool {
    let segments = path.split('.').collect::<Vec<_>>();
    let mut root = Bson::Document(std::mem::take(doc));
    let written = write_segments(&mut root, &segments, value);

    if let Bson::Document(inner) = root {
        *doc = inner;
    }

    written
}

fn write_segments(node: &mut Bson, segments: &[&str], value: Bson) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return false;
    };

    match node {
        Bson::Document(doc) => {
            if rest.is_empty() {
                doc.insert(*head, value);
                return true;
            }

            if is_missing(doc.get(*head)) || matches!(doc.get(*head), Some(Bson::Null)) {
                doc.insert(*head, Document::new());
            }

            match doc.get_mut(*head) {
                Some(next) => write_segments(next, rest, value),
                None => false,
            }
        }
        Bson::Array(items) => {
            let Some(index) = array_slot(items, head) else {
                return false;
            };

            if index == items.len() {
                items.push(Bson::Null);
            }

            if rest.is_empty() {
                items[index] = value;
                return true;
            }

            if matches!(items[index], Bson::Null | Bson::Undefined) {
                items[index] = Bson::Document(Document::new());
            }

            write_segments(&mut items[index], rest, value)
        }
        _ => false,
    }
}

/// Returns true when [`write_path`] would succeed for `path`.
pub fn can_write_path(doc: &Document, path: &str) -> bool {
    let segments = path.split('.').collect::<Vec<_>>();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut container: Option<&Bson> = None;
    for segment in parents {
        let next = match container {
            None => doc.get(*segment),
            Some(Bson::Document(inner)) => inner.get(*segment),
            Some(Bson::Array(items)) => match array_slot(items, segment) {
                Some(index) => items.get(index),
                None => return false,
            },
            Some(_) => return false,
        };

        match next {
            None | Some(Bson::Null) | Some(Bson::Undefined) => return true,
            Some(value) => container = Some(value),
        }
    }

    match container {
        None | Some(Bson::Document(_)) => true,
        Some(Bson::Array(items)) => array_slot(items, last).is_some(),
        Some(_) => false,
    }
}

/// Index addressed by `segment`, if it names an existing element or the slot
/// right after the last one.
fn array_slot(items: &[Bson], segment: &str) -> Option<usize> {
    segment.parse::<usize>().ok().filter(|index| *index <= items.len())
}

/// Removes the field at a dotted path. Returns `true` if a field was removed.
///
/// Only document fields can be removed; array elements are left alone.
pub fn remove_path(doc: &mut Document, path: &str) -> bool {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };

    let target = match parent {
        None => doc,
        Some(parent) => match read_path_mut(doc, parent) {
            Some(Bson::Document(inner)) => inner,
            _ => return false,
        },
    };

    target.remove(last).is_some()
}

/// Extension trait converting serde types to and from documents.
///
/// Implemented for every type that is `Serialize + DeserializeOwned`.
///
/// # Example
///
/// ```ignore
/// use livedoc::prelude::*;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Country { id: String, population: i64 }
///
/// let doc = Country { id: "nl".into(), population: 17 }.to_document()?;
/// let back = Country::from_document(doc)?;
/// ```
pub trait Record: Sized {
    /// Converts this value into a document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the value does not serialize to a map.
    fn to_document(&self) -> DocumentStoreResult<Document>;

    /// Creates a value from a document.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails or the structure is invalid.
    fn from_document(doc: Document) -> DocumentStoreResult<Self>;

    /// Converts this value to a JSON value.
    fn to_json(&self) -> DocumentStoreResult<Value>;

    /// Creates a value from a JSON value.
    fn from_json(value: Value) -> DocumentStoreResult<Self>;
}

impl<T: Serialize + DeserializeOwned> Record for T {
    fn to_document(&self) -> DocumentStoreResult<Document> {
        match serialize_to_bson(self)? {
            Bson::Document(doc) => Ok(doc),
            other => Err(DocumentStoreError::InvalidDocument(format!(
                "expected a map, found {:?}",
                other.element_type()
            ))),
        }
    }

    fn from_document(doc: Document) -> DocumentStoreResult<Self> {
        Ok(deserialize_from_bson(Bson::Document(doc))?)
    }

    fn to_json(&self) -> DocumentStoreResult<Value> {
        Ok(to_value(self)?)
    }

    fn from_json(value: Value) -> DocumentStoreResult<Self> {
        Ok(from_value(value)?)
    }
}
