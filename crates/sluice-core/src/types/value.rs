use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use super::DataType;

/// A single decoded field value.
///
/// Values only exist at the edges of a pipeline: when a record is read out
/// of a tuple buffer, evaluated by an expression, or handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer of any width.
    Int(i64),
    /// Unsigned integer of any width.
    UInt(u64),
    /// Float of any width.
    Float(f64),
    /// Text decoded from a `Char` field.
    Text(String),
    /// Array elements.
    Array(Vec<Value>),
}

impl Value {
    /// Interprets the value as a signed integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Interprets the value as a float (integers are converted).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Interprets the value as a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The narrowest [`DataType`] describing a literal of this value.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Boolean,
            Self::Int(_) => DataType::int64(),
            Self::UInt(_) => DataType::uint64(),
            Self::Float(_) => DataType::float64(),
            Self::Text(s) => DataType::char(u32::try_from(s.len()).unwrap_or(u32::MAX)),
            Self::Array(items) => {
                let component = items
                    .iter()
                    .map(Value::data_type)
                    .reduce(|a, b| a.join(&b))
                    .unwrap_or(DataType::Undefined);
                DataType::array(u32::try_from(items.len()).unwrap_or(u32::MAX), component)
            }
        }
    }

    /// Returns `true` for float values.
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    /// Compares two numbers across representations (`Int(3)` equals `UInt(3)`).
    ///
    /// Returns `None` for non-numeric values and NaN.
    #[must_use]
    pub fn numeric_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(x), Self::Int(y)) => Some(x.cmp(y)),
            (Self::UInt(x), Self::UInt(y)) => Some(x.cmp(y)),
            (Self::Int(x), Self::UInt(y)) => Some(i128::from(*x).cmp(&i128::from(*y))),
            (Self::UInt(x), Self::Int(y)) => Some(i128::from(*x).cmp(&i128::from(*y))),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Total order used to sort emitted rows: numbers compare by value,
    /// everything else by kind and then contents.
    #[must_use]
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        if let Some(ord) = self.numeric_cmp(other) {
            return ord;
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Array(a), Self::Array(b)) => a
                .iter()
                .zip(b)
                .map(|(x, y)| x.total_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) | Self::UInt(_) | Self::Float(_) => 1,
            Self::Text(_) => 2,
            Self::Array(_) => 3,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}
