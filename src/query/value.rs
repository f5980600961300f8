//! Canonical runtime value representation shared by entities, filters, and
//! the step interpreter, together with the single total order used for
//! comparison, sorting, and keyset pagination.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Typed value tagged with explicit type information so serialized queries
/// and plans remain unambiguous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal. Distinct from an absent attribute.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested record keyed by attribute name.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, if it is a number.
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Int(v)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(v) => Value::String(v),
            serde_json::Value::Array(vs) => {
                Value::Array(vs.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

/// Rank used to order values of different types. The sentinel rank (absent
/// or null) sorts before every defined value.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Int(_)) | Some(Value::Float(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order over possibly-absent values.
///
/// Absent (`None`) and `Null` are the same MIN sentinel: mutually equal and
/// less than every defined value. Integers and floats compare numerically
/// with each other; otherwise values order by type rank first, then within
/// the type.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    if ra == 0 {
        return Ordering::Equal;
    }
    // Same rank and both defined from here on.
    match (a.unwrap(), b.unwrap()) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        // Exact for int/int; the float route loses distinctions past 2^53.
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (x, y) if x.as_f64().is_some() => {
            let (x, y) = (x.as_f64().unwrap(), y.as_f64().unwrap());
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                match compare_values(Some(x), Some(y)) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for ((kx, vx), (ky, vy)) in xs.iter().zip(ys.iter()) {
                match kx.cmp(ky) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match compare_values(Some(vx), Some(vy)) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => unreachable!("values of equal rank must share a type"),
    }
}

/// Equality under the comparison order, i.e. `Int(1)` equals `Float(1.0)`.
///
/// This is deliberately *not* used for the `=` filter operator, which never
/// matches across absent and defined values; callers pass two defined
/// values here.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(Some(a), Some(b)) == Ordering::Equal
}
