use std::cmp::Ordering;

use super::AggregationFunction;
use crate::types::{DataType, Value};

/// Partial aggregation state of one aggregate column.
///
/// Accumulators of the same kind merge associatively, which is what lets
/// slices be combined into windows in any grouping.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Record count.
    Count(u64),
    /// Integer sum (wrapping on overflow).
    SumInt(i64),
    /// Float sum.
    SumFloat(f64),
    /// Smallest value seen.
    Min(Option<Value>),
    /// Largest value seen.
    Max(Option<Value>),
    /// Running sum and count for the mean.
    Avg {
        /// Sum of values.
        sum: f64,
        /// Number of values.
        count: u64,
    },
}

impl Accumulator {
    /// Empty accumulator for `function` over values of `input`.
    #[must_use]
    pub fn new(function: AggregationFunction, input: Option<&DataType>) -> Self {
        match function {
            AggregationFunction::Count => Self::Count(0),
            AggregationFunction::Sum => match input {
                Some(DataType::Float { .. }) => Self::SumFloat(0.0),
                _ => Self::SumInt(0),
            },
            AggregationFunction::Min => Self::Min(None),
            AggregationFunction::Max => Self::Max(None),
            AggregationFunction::Avg => Self::Avg { sum: 0.0, count: 0 },
        }
    }

    /// Adds one value. `Count` ignores the value; non-numeric values are skipped.
    #[allow(clippy::cast_possible_wrap)]
    pub fn add(&mut self, value: Option<&Value>) {
        match self {
            Self::Count(n) => *n += 1,
            Self::SumInt(sum) => {
                let v = match value {
                    Some(Value::Int(v)) => *v,
                    Some(Value::UInt(v)) => *v as i64,
                    _ => return,
                };
                *sum = sum.wrapping_add(v);
            }
            Self::SumFloat(sum) => {
                if let Some(v) = value.and_then(Value::as_f64) {
                    *sum += v;
                }
            }
            Self::Min(current) => {
                if let Some(v) = value {
                    replace_if(current, v, Ordering::Less);
                }
            }
            Self::Max(current) => {
                if let Some(v) = value {
                    replace_if(current, v, Ordering::Greater);
                }
            }
            Self::Avg { sum, count } => {
                if let Some(v) = value.and_then(Value::as_f64) {
                    *sum += v;
                    *count += 1;
                }
            }
        }
    }

    /// Merges another accumulator of the same kind into this one.
    pub fn merge(&mut self, other: &Accumulator) {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => *a += b,
            (Self::SumInt(a), Self::SumInt(b)) => *a = a.wrapping_add(*b),
            (Self::SumFloat(a), Self::SumFloat(b)) => *a += b,
            (Self::Min(a), Self::Min(Some(b))) => replace_if(a, b, Ordering::Less),
            (Self::Max(a), Self::Max(Some(b))) => replace_if(a, b, Ordering::Greater),
            (Self::Avg { sum, count }, Self::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            _ => {}
        }
    }

    /// Final value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn result(&self) -> Value {
        match self {
            Self::Count(n) => Value::UInt(*n),
            Self::SumInt(v) => Value::Int(*v),
            Self::SumFloat(v) => Value::Float(*v),
            Self::Min(v) | Self::Max(v) => v.clone().unwrap_or(Value::Int(0)),
            Self::Avg { sum, count } => {
                Value::Float(if *count == 0 { 0.0 } else { sum / *count as f64 })
            }
        }
    }

    /// Returns `true` if no value was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Count(n) => *n == 0,
            Self::Min(v) | Self::Max(v) => v.is_none(),
            Self::Avg { count, .. } => *count == 0,
            Self::SumInt(_) | Self::SumFloat(_) => false,
        }
    }
}

fn replace_if(current: &mut Option<Value>, candidate: &Value, wanted: Ordering) {
    let better = match current {
        None => true,
        Some(existing) => candidate.numeric_cmp(existing) == Some(wanted),
    };
    if better {
        *current = Some(candidate.clone());
    }
}
