//! JSON document helpers shared by the store, the engine, and the filter
//! language. User-controlled subtrees (`args`, `metadata`, `summary`) are kept
//! as opaque documents with a recursive merge operator instead of typed
//! records.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A JSON object, the unit the record store works in.
pub type Document = Map<String, Value>;

/// Serialize a record into its stored document form.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value).map_err(|e| Error::StoreFatal(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(Error::StoreFatal(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// Deserialize a stored document back into a record.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| Error::StoreFatal(e.to_string()))
}

/// Deep merge `patch` into `target`: mappings recurse, scalars overwrite,
/// lists are replaced wholesale.
pub fn deep_merge(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Deep merge where a `null` value deletes the key instead of storing it.
/// Used for queue metadata updates.
pub fn merge_with_null_delete(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (_, Value::Null) => {
                target.remove(key);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_with_null_delete(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Look up a dotted path (`a.b.c`) inside a document.
pub fn path_get<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
