//! Generic value model.
//!
//! [`GenericValue`] is what moves between wire messages and rule
//! configuration. It (de)serializes through `serde_json::Value`, so rules can
//! be written in YAML or JSON.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mapping of field names to values.
pub type Payload = BTreeMap<String, GenericValue>;

/// Tagged union over every shape a protobuf field can take.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum GenericValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<GenericValue>),
    Map(Payload),
}

impl GenericValue {
    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            GenericValue::Null => "null",
            GenericValue::Bool(_) => "bool",
            GenericValue::Int(_) => "integer",
            GenericValue::Uint(_) => "unsigned integer",
            GenericValue::Float(_) => "float",
            GenericValue::String(_) => "string",
            GenericValue::Bytes(_) => "bytes",
            GenericValue::List(_) => "list",
            GenericValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, GenericValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GenericValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Payload> {
        match self {
            GenericValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Payload> {
        match self {
            GenericValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Integral value as `i128`, covering both signed and unsigned variants
    /// and floats without a fractional part.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            GenericValue::Int(i) => Some(i128::from(*i)),
            GenericValue::Uint(u) => Some(i128::from(*u)),
            GenericValue::Float(f) if f.is_finite() && f.fract() == 0.0 => {
                // Saturating cast; out-of-range floats are rejected by callers.
                Some(*f as i128)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GenericValue::Int(i) => Some(*i as f64),
            GenericValue::Uint(u) => Some(*u as f64),
            GenericValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Equality that treats numbers by value, so `Int(1)`, `Uint(1)` and
/// `Float(1.0)` compare equal. Rules written in YAML rarely know the
/// declared width of the field they target.
impl PartialEq for GenericValue {
    fn eq(&self, other: &Self) -> bool {
        use GenericValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Float(a), Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }
}

impl From<serde_json::Value> for GenericValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => GenericValue::Null,
            serde_json::Value::Bool(b) => GenericValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    GenericValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    GenericValue::Uint(u)
                } else {
                    GenericValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => GenericValue::String(s),
            serde_json::Value::Array(items) => {
                GenericValue::List(items.into_iter().map(GenericValue::from).collect())
            }
            serde_json::Value::Object(obj) => GenericValue::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, GenericValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<GenericValue> for serde_json::Value {
    fn from(value: GenericValue) -> Self {
        match value {
            GenericValue::Null => serde_json::Value::Null,
            GenericValue::Bool(b) => serde_json::Value::Bool(b),
            GenericValue::Int(i) => serde_json::Value::from(i),
            GenericValue::Uint(u) => serde_json::Value::from(u),
            GenericValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
            GenericValue::String(s) => serde_json::Value::String(s),
            GenericValue::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            GenericValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            GenericValue::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for GenericValue {
    fn from(b: bool) -> Self {
        GenericValue::Bool(b)
    }
}

impl From<i64> for GenericValue {
    fn from(i: i64) -> Self {
        GenericValue::Int(i)
    }
}

impl From<u64> for GenericValue {
    fn from(u: u64) -> Self {
        GenericValue::Uint(u)
    }
}

impl From<f64> for GenericValue {
    fn from(f: f64) -> Self {
        GenericValue::Float(f)
    }
}

impl From<&str> for GenericValue {
    fn from(s: &str) -> Self {
        GenericValue::String(s.to_string())
    }
}

impl From<String> for GenericValue {
    fn from(s: String) -> Self {
        GenericValue::String(s)
    }
}

impl From<Vec<u8>> for GenericValue {
    fn from(b: Vec<u8>) -> Self {
        GenericValue::Bytes(b)
    }
}

impl From<Payload> for GenericValue {
    fn from(m: Payload) -> Self {
        GenericValue::Map(m)
    }
}
