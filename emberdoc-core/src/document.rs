//! Core document type and value helpers.
//!
//! A [`Document`] is a JSON object with a mandatory string `id`. Field values
//! are plain [`serde_json::Value`]s, so every operator in the crate can match
//! exhaustively on `{Null, Bool, Number, String, Array, Object}`.
//!
//! Field paths use `.` to reach into nested objects (`"address.city"`); a
//! numeric segment indexes into an array when reading (`"tags.0"`).

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, from_value, to_value};
use std::{borrow::Cow, cmp::Ordering};

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// Name of the mandatory identifier field.
pub const ID_FIELD: &str = "id";

/// A schema-less document stored in a collection.
///
/// Callers always hold their own copy; the collection never hands out
/// references into its storage.
///
/// # Example
///
/// ```ignore
/// use emberdoc::document::Document;
/// use serde_json::json;
///
/// let doc = Document::from_value(json!({ "id": "u1", "name": "Alice", "address": { "city": "Oslo" } }))?;
/// assert_eq!(doc.id(), Some("u1"));
/// assert_eq!(doc.get("address.city"), Some(&json!("Oslo")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Creates an empty document without an id.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Creates a document from a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] if the value is not an object
    /// or carries an `id` that is not a string.
    pub fn from_value(value: Value) -> DocumentStoreResult<Self> {
        match value {
            Value::Object(map) => {
                let document = Self(map);
                document.validate_id()?;
                Ok(document)
            }
            other => Err(DocumentStoreError::InvalidDocument(format!(
                "expected an object, found {}",
                type_name(&other)
            ))),
        }
    }

    /// Serializes any serde type into a document.
    pub fn from_serialize<T: Serialize>(value: &T) -> DocumentStoreResult<Self> {
        Self::from_value(to_value(value)?)
    }

    /// Deserializes this document into a concrete type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> DocumentStoreResult<T> {
        Ok(from_value(Value::Object(self.0.clone()))?)
    }

    /// Returns the document id, if one has been assigned.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    pub(crate) fn validate_id(&self) -> DocumentStoreResult<()> {
        match self.0.get(ID_FIELD) {
            None | Some(Value::String(_)) => Ok(()),
            Some(other) => Err(DocumentStoreError::InvalidDocument(format!(
                "id must be a string, found {}",
                type_name(other)
            ))),
        }
    }

    /// Resolves a dotted field path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.0, path)
    }

    /// Returns true if the path resolves to a value (including `null`).
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Inserts a top-level field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes a top-level field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Document> for Value {
    fn from(document: Document) -> Self {
        document.into_value()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = DocumentStoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Document::from_value(value)
    }
}

/// Resolves a dotted path inside an object.
pub(crate) fn get_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = map.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Object(inner) => inner.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Writes a value at a dotted path, creating intermediate objects as needed.
pub(crate) fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) -> DocumentStoreResult<()> {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));

            match child {
                Value::Object(inner) => set_path(inner, rest, value),
                other => Err(DocumentStoreError::Type(format!(
                    "cannot set '{}' inside '{}' which is {}",
                    rest,
                    head,
                    type_name(other)
                ))),
            }
        }
    }
}

/// Removes the value at a dotted path, if present.
pub(crate) fn remove_path(map: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => map.remove(path),
        Some((head, rest)) => match map.get_mut(head)? {
            Value::Object(inner) => remove_path(inner, rest),
            _ => None,
        },
    }
}

/// Mutable access to the value at a dotted path.
pub(crate) fn get_path_mut<'a>(map: &'a mut Map<String, Value>, path: &str) -> Option<&'a mut Value> {
    match path.split_once('.') {
        None => map.get_mut(path),
        Some((head, rest)) => match map.get_mut(head)? {
            Value::Object(inner) => get_path_mut(inner, rest),
            _ => None,
        },
    }
}

/// Deep equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => false,
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    Numeric::of(a).total_cmp(&Numeric::of(b)) == Ordering::Equal
}

/// Orders two scalars of the same kind; mixed kinds and composites are unordered.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        (Value::Number(a), Value::Number(b)) => Some(Numeric::of(a).total_cmp(&Numeric::of(b))),
        (Value::String(a), Value::String(b)) => a.partial_cmp(b),
        _ => None,
    }
}

/// A JSON number widened so that every integer keeps full precision.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Numeric {
    Int(i128),
    Float(f64),
}

impl Numeric {
    pub(crate) fn of(number: &serde_json::Number) -> Self {
        if let Some(i) = number.as_i64() {
            Numeric::Int(i.into())
        } else if let Some(u) = number.as_u64() {
            Numeric::Int(u.into())
        } else {
            Numeric::Float(number.as_f64().unwrap_or_default())
        }
    }

    /// Orders by mathematical value, so `1 == 1.0` and `2^53 + 1 > 2^53`.
    pub(crate) fn total_cmp(&self, other: &Self) -> Ordering {
        match (*self, *other) {
            (Numeric::Int(a), Numeric::Int(b)) => a.cmp(&b),
            (Numeric::Float(a), Numeric::Float(b)) => a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b)),
            (Numeric::Int(a), Numeric::Float(b)) => cmp_int_float(a, b),
            (Numeric::Float(a), Numeric::Int(b)) => cmp_int_float(b, a).reverse(),
        }
    }

    /// The integer this number equals, if any and if it fits in an `i128`.
    pub(crate) fn as_integer(&self) -> Option<i128> {
        match *self {
            Numeric::Int(i) => Some(i),
            Numeric::Float(f) if f.fract() == 0.0 && f.abs() < TWO_POW_127 => Some(f as i128),
            Numeric::Float(_) => None,
        }
    }
}

const TWO_POW_127: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;

fn cmp_int_float(i: i128, f: f64) -> Ordering {
    if f >= TWO_POW_127 {
        return Ordering::Less;
    }
    if f < -TWO_POW_127 {
        return Ordering::Greater;
    }
    // |f| < 2^127 here, so its integral part is exact as an i128
    let whole = f.trunc();
    match i.cmp(&(whole as i128)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

/// Renders a value as text: strings verbatim, everything else as compact JSON.
pub fn stringify(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
