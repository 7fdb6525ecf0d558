//! Indexed field values
//!
//! [`FieldValue`] is the scalar stored in term dictionaries, sort columns and
//! stored-value columns. It carries a total order (`null < bool < number <
//! string`) so it can key ordered maps and drive the primary-sort comparator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A scalar value extracted from a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    /// JSON null
    Null,
    /// JSON boolean
    Bool(bool),
    /// JSON number, always widened to f64
    Number(f64),
    /// JSON string
    String(String),
}

impl FieldValue {
    fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Number(_) => 2,
            FieldValue::String(_) => 3,
        }
    }

    /// Convert a scalar JSON value; objects and arrays yield `None`
    pub fn from_json(value: &Value) -> Option<FieldValue> {
        match value {
            Value::Null => Some(FieldValue::Null),
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            Value::String(s) => Some(FieldValue::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Convert back to JSON. Integral numbers become JSON integers.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            FieldValue::String(s) => Value::String(s.clone()),
        }
    }

    /// Borrow the string payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// True for two values of the same JSON type
    pub fn same_type(&self, other: &FieldValue) -> bool {
        self.type_rank() == other.type_rank()
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Number(a), FieldValue::Number(b)) => a.total_cmp(b),
            (FieldValue::String(a), FieldValue::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

// ============================================================================
// Attribute paths
// ============================================================================

/// Split a dotted attribute path (`"a.b.c"`) into its components
pub fn parse_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join path components back into dotted form
pub fn join_path(path: &[String]) -> String {
    path.join(".")
}

/// Resolve an attribute path inside a document
pub fn get_path<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = doc;
    for part in path {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Scalar value at `path`, if the attribute exists and is not an object/array
pub fn scalar_at(doc: &Value, path: &[String]) -> Option<FieldValue> {
    get_path(doc, path).and_then(FieldValue::from_json)
}

/// Flatten a document into `(path, scalar)` pairs.
///
/// Array elements are emitted under the path of the array itself.
pub fn flatten(doc: &Value) -> Vec<(Vec<String>, FieldValue)> {
    let mut out = Vec::new();
    let mut prefix = Vec::new();
    flatten_into(doc, &mut prefix, &mut out);
    out
}

fn flatten_into(value: &Value, prefix: &mut Vec<String>, out: &mut Vec<(Vec<String>, FieldValue)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                prefix.push(k.clone());
                flatten_into(v, prefix, out);
                prefix.pop();
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(item, prefix, out);
            }
        }
        scalar => {
            if !prefix.is_empty() {
                if let Some(v) = FieldValue::from_json(scalar) {
                    out.push((prefix.clone(), v));
                }
            }
        }
    }
}
