use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A replicated value, tagged at the serialization boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    String(String),
    Number(f64),
    Boolean(bool),
    /// Objects and arrays
    Json(Value),
}

impl KvValue {
    pub fn type_tag(&self) -> &'static str {
        match self {
            KvValue::String(_) => "string",
            KvValue::Number(_) => "number",
            KvValue::Boolean(_) => "boolean",
            KvValue::Json(_) => "object",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KvValue::String(s) => Value::String(s.clone()),
            // Whole numbers travel as integers, the way other peers write them.
            KvValue::Number(n) if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER => {
                Value::from(*n as i64)
            }
            KvValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            KvValue::Boolean(b) => Value::Bool(*b),
            KvValue::Json(v) => v.clone(),
        }
    }

    /// Infer the variant from a plain JSON value. `null` has no variant.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(KvValue::String(s)),
            Value::Number(n) => n.as_f64().map(KvValue::Number),
            Value::Bool(b) => Some(KvValue::Boolean(b)),
            other => Some(KvValue::Json(other)),
        }
    }

    /// Rebuild a value from its stored type tag. Unknown tags fall back to inference.
    pub fn from_tagged(tag: &str, value: Value) -> Option<Self> {
        match (tag, value) {
            (_, Value::Null) => None,
            ("string", Value::String(s)) => Some(KvValue::String(s)),
            ("number", Value::Number(n)) => n.as_f64().map(KvValue::Number),
            ("boolean", Value::Bool(b)) => Some(KvValue::Boolean(b)),
            ("object", v @ (Value::Object(_) | Value::Array(_))) => Some(KvValue::Json(v)),
            (_, other) => Self::from_json(other),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KvValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            KvValue::Json(Value::Array(items)) => Some(items),
            _ => None,
        }
    }
}

impl std::fmt::Display for KvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for KvValue {
    fn from(value: &str) -> Self {
        KvValue::String(value.to_string())
    }
}

impl From<String> for KvValue {
    fn from(value: String) -> Self {
        KvValue::String(value)
    }
}

impl From<f64> for KvValue {
    fn from(value: f64) -> Self {
        KvValue::Number(value)
    }
}

impl From<i64> for KvValue {
    fn from(value: i64) -> Self {
        KvValue::Number(value as f64)
    }
}

impl From<bool> for KvValue {
    fn from(value: bool) -> Self {
        KvValue::Boolean(value)
    }
}

impl From<Value> for KvValue {
    /// `null` becomes `Json(null)`; use [`KvValue::from_json`] to treat it as absent.
    fn from(value: Value) -> Self {
        KvValue::from_json(value.clone()).unwrap_or(KvValue::Json(value))
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    value: Value,
    #[serde(rename = "type")]
    kind: String,
    timestamp: i64,
}

/// A value plus the wall-clock time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub value: KvValue,
    pub timestamp: i64,
}

impl KvEntry {
    pub fn new(value: KvValue, timestamp: i64) -> Self {
        Self { value, timestamp }
    }

    /// `{ "value": …, "type": …, "timestamp": … }`
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(Envelope {
            value: self.value.to_json(),
            kind: self.value.type_tag().to_string(),
            timestamp: self.timestamp,
        })
        .unwrap_or(Value::Null)
    }

    /// `None` for tombstones and anything that is not an envelope.
    pub fn from_wire(raw: &Value) -> Option<Self> {
        let envelope: Envelope = serde_json::from_value(raw.clone()).ok()?;
        let value = KvValue::from_tagged(&envelope.kind, envelope.value)?;
        Some(Self {
            value,
            timestamp: envelope.timestamp,
        })
    }
}
