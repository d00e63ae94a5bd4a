//! Windowed aggregation and join.
//!
//! Records are inserted into per-worker slice stores owned by the worker
//! that executes the insert. When the trigger policy fires, a hand-off round
//! begins: each worker passes its closed slices to the handler's merge
//! coordinator, and the last one turns them into window results. Progress
//! comes from watermarks carried in buffer headers.
//!
//! ## Slice lifecycle
//!
//! ```text
//! OPEN ──(end ≤ watermark − lateness)──► CLOSED ──(trigger)──► MERGED ──► EMITTED
//! ```
//!
//! A record whose timestamp is below `watermark − allowed_lateness` is late:
//! it is dropped and counted, and never reopens a slice.

mod accumulator;
mod handler;
mod join;
mod session;
mod slice;
mod watermark;

#[cfg(test)]
mod tests;

use crate::types::{DataType, Field, Schema, TypeError};

pub use accumulator::Accumulator;
pub use handler::{HandOff, TriggerOutput, WindowMetrics, WindowOperatorHandler, WindowStore};
pub use join::{JoinOperatorHandler, JoinStore};
pub use slice::{Slice, SliceKey, SliceState, ThreadLocalSliceStore};
pub use watermark::{MultiOriginWatermarkProcessor, WatermarkStrategy};

/// Errors in window and join definitions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WindowError {
    /// Size, slide or gap is not positive, or lateness is negative.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// A referenced field does not exist.
    #[error("field '{0}' not found")]
    FieldNotFound(String),

    /// The event-time field is not an integer.
    #[error("time field '{field}' must be an integer, found {found}")]
    NonIntegerTimeField {
        /// Field name.
        field: String,
        /// Its type.
        found: String,
    },

    /// An aggregation cannot be applied to a field type.
    #[error("{function:?} cannot aggregate field '{field}' of type {found}")]
    UnsupportedAggregation {
        /// Function.
        function: AggregationFunction,
        /// Field name.
        field: String,
        /// Its type.
        found: String,
    },

    /// The trigger action does not fit the window kind.
    #[error("trigger action {action:?} is not supported here: {reason}")]
    InvalidTriggerAction {
        /// Rejected action.
        action: TriggerAction,
        /// Why.
        reason: &'static str,
    },

    /// Join keys have no common type.
    #[error("join keys are incompatible: {0}")]
    IncompatibleKeys(TypeError),
}

/// Shape of the windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Fixed, non-overlapping windows of `size` milliseconds.
    Tumbling {
        /// Window length in milliseconds.
        size: i64,
    },
    /// Overlapping windows of `size`, starting every `slide` milliseconds.
    Sliding {
        /// Window length in milliseconds.
        size: i64,
        /// Distance between window starts in milliseconds.
        slide: i64,
    },
    /// Per-key activity periods separated by at least `gap` milliseconds.
    Session {
        /// Inactivity gap in milliseconds.
        gap: i64,
    },
}

impl WindowType {
    /// Tumbling window of `size_ms`.
    #[must_use]
    pub fn tumbling(size_ms: i64) -> Self {
        Self::Tumbling { size: size_ms }
    }

    /// Sliding window of `size_ms` every `slide_ms`.
    #[must_use]
    pub fn sliding(size_ms: i64, slide_ms: i64) -> Self {
        Self::Sliding {
            size: size_ms,
            slide: slide_ms,
        }
    }

    /// Session window with an inactivity gap of `gap_ms`.
    #[must_use]
    pub fn session(gap_ms: i64) -> Self {
        Self::Session { gap: gap_ms }
    }

    /// Length of one slice: the window size for tumbling windows and
    /// `gcd(size, slide)` for sliding windows. `None` for sessions.
    #[must_use]
    pub fn slice_size(&self) -> Option<i64> {
        match *self {
            Self::Tumbling { size } => Some(size),
            Self::Sliding { size, slide } => Some(gcd(size, slide)),
            Self::Session { .. } => None,
        }
    }

    /// Start of the slice containing `ts`. Negative timestamps floor correctly.
    #[must_use]
    pub fn slice_start(&self, ts: i64) -> Option<i64> {
        self.slice_size().map(|size| floor_to(ts, size))
    }

    /// Windows `[start, end)` that contain the slice starting at `slice_start`.
    ///
    /// Bounds saturate at the ends of the `i64` range, so the last window
    /// before `i64::MAX` ends at `i64::MAX`.
    #[must_use]
    pub fn windows_of_slice(&self, slice_start: i64) -> Vec<(i64, i64)> {
        match *self {
            Self::Tumbling { size } => vec![(slice_start, slice_start.saturating_add(size))],
            Self::Sliding { size, slide } => {
                let lower = slice_start.saturating_sub(size);
                let mut out = Vec::new();
                let mut start = floor_to(slice_start, slide);
                while start > lower {
                    out.push((start, start.saturating_add(size)));
                    let Some(next) = start.checked_sub(slide) else {
                        break;
                    };
                    start = next;
                }
                out.reverse();
                out
            }
            Self::Session { .. } => Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), WindowError> {
        let ok = match *self {
            Self::Tumbling { size } => size > 0,
            Self::Sliding { size, slide } => size > 0 && slide > 0 && slide <= size,
            Self::Session { gap } => gap > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(WindowError::InvalidWindow(format!("{self:?}")))
        }
    }
}

/// Largest multiple of `step` not above `ts`, saturating at `i64::MIN`.
pub(crate) fn floor_to(ts: i64, step: i64) -> i64 {
    ts.div_euclid(step).saturating_mul(step)
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs()
}

/// Where a record's timestamp comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeCharacteristic {
    /// An integer field holding epoch milliseconds.
    EventTime {
        /// Timestamp field.
        field: String,
    },
    /// Wall-clock time at insertion.
    IngestionTime,
}

impl TimeCharacteristic {
    /// Event time read from `field`.
    pub fn event_time(field: impl Into<String>) -> Self {
        Self::EventTime {
            field: field.into(),
        }
    }

    fn validate(&self, input: &Schema) -> Result<(), WindowError> {
        if let Self::EventTime { field } = self {
            let ty = input
                .field(field)
                .map_err(|_| WindowError::FieldNotFound(field.clone()))?
                .data_type();
            if !ty.is_integer() {
                return Err(WindowError::NonIntegerTimeField {
                    field: field.clone(),
                    found: ty.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationFunction {
    /// Sum of values.
    Sum,
    /// Number of records.
    Count,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Arithmetic mean.
    Avg,
}

/// One aggregate column of a window result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAggregation {
    /// Function.
    pub function: AggregationFunction,
    /// Input field; `None` only for `Count`.
    pub field: Option<String>,
    /// Output field name.
    pub alias: String,
}

impl WindowAggregation {
    fn on(function: AggregationFunction, field: &str, prefix: &str) -> Self {
        Self {
            function,
            field: Some(field.to_string()),
            alias: format!("{prefix}_{field}"),
        }
    }

    /// `sum(field)` as `sum_<field>`.
    #[must_use]
    pub fn sum(field: &str) -> Self {
        Self::on(AggregationFunction::Sum, field, "sum")
    }

    /// `min(field)` as `min_<field>`.
    #[must_use]
    pub fn min(field: &str) -> Self {
        Self::on(AggregationFunction::Min, field, "min")
    }

    /// `max(field)` as `max_<field>`.
    #[must_use]
    pub fn max(field: &str) -> Self {
        Self::on(AggregationFunction::Max, field, "max")
    }

    /// `avg(field)` as `avg_<field>`.
    #[must_use]
    pub fn avg(field: &str) -> Self {
        Self::on(AggregationFunction::Avg, field, "avg")
    }

    /// `count(*)` as `count`.
    #[must_use]
    pub fn count() -> Self {
        Self {
            function: AggregationFunction::Count,
            field: None,
            alias: "count".to_string(),
        }
    }

    /// Renames the output field.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Output type for an input of type `input`.
    fn output_type(&self, input: Option<&DataType>) -> DataType {
        match (self.function, input) {
            (AggregationFunction::Count, _) => DataType::uint64(),
            (AggregationFunction::Avg, Some(ty)) if ty.is_numeric() => DataType::float64(),
            (AggregationFunction::Sum, Some(DataType::Integer { .. })) => DataType::int64(),
            (AggregationFunction::Sum, Some(DataType::Float { .. })) => DataType::float64(),
            (AggregationFunction::Min | AggregationFunction::Max, Some(ty)) if ty.is_numeric() => {
                ty.clone()
            }
            _ => DataType::Undefined,
        }
    }
}

/// When a handler checks for closed windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerPolicy {
    /// Whenever the handler's combined watermark advances.
    #[default]
    OnWatermarkChange,
    /// After every input buffer.
    OnBuffer,
    /// After every input record.
    OnRecord,
    /// Periodically, from a timer thread.
    OnTime {
        /// Period in milliseconds.
        trigger_time_ms: u64,
    },
}

/// What a firing trigger computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerAction {
    /// Re-aggregate every complete window from its slices.
    #[default]
    WindowAggregation,
    /// Emit each newly closed slice once as a partial result.
    SliceAggregation,
    /// Materialize both join sides per window and match them pairwise.
    LazyNestLoopJoin,
}

/// Immutable description of a windowed aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDefinition {
    /// Window shape.
    pub window_type: WindowType,
    /// Timestamp source.
    pub time: TimeCharacteristic,
    /// Grouping keys; empty for a global window.
    pub keys: Vec<String>,
    /// Aggregate columns.
    pub aggregations: Vec<WindowAggregation>,
    /// Grace period after the watermark in milliseconds.
    pub allowed_lateness_ms: i64,
    /// Trigger policy.
    pub trigger_policy: TriggerPolicy,
    /// Trigger action.
    pub trigger_action: TriggerAction,
}

impl WindowDefinition {
    /// Creates a definition with no keys, no aggregations and no lateness.
    #[must_use]
    pub fn new(window_type: WindowType, time: TimeCharacteristic) -> Self {
        Self {
            window_type,
            time,
            keys: Vec::new(),
            aggregations: Vec::new(),
            allowed_lateness_ms: 0,
            trigger_policy: TriggerPolicy::default(),
            trigger_action: TriggerAction::default(),
        }
    }

    /// Sets the grouping keys.
    #[must_use]
    pub fn key_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an aggregate column.
    #[must_use]
    pub fn aggregate(mut self, aggregation: WindowAggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    /// Sets the allowed lateness.
    #[must_use]
    pub fn allowed_lateness(mut self, lateness_ms: i64) -> Self {
        self.allowed_lateness_ms = lateness_ms;
        self
    }

    /// Sets the trigger policy.
    #[must_use]
    pub fn trigger_policy(mut self, policy: TriggerPolicy) -> Self {
        self.trigger_policy = policy;
        self
    }

    /// Sets the trigger action.
    #[must_use]
    pub fn trigger_action(mut self, action: TriggerAction) -> Self {
        self.trigger_action = action;
        self
    }

    /// Result schema: `start`, `end`, the keys, then one field per aggregate.
    ///
    /// Unknown fields and unsupported aggregates yield `Undefined` types;
    /// [`validate`](Self::validate) reports them precisely.
    #[must_use]
    pub fn output_schema(&self, input: &Schema) -> Schema {
        let mut fields = vec![
            Field::new("start", DataType::int64()),
            Field::new("end", DataType::int64()),
        ];
        for key in &self.keys {
            let ty = input
                .field(key)
                .map_or(DataType::Undefined, |f| f.data_type().clone());
            fields.push(Field::new(key.clone(), ty));
        }
        for agg in &self.aggregations {
            let input_type = agg
                .field
                .as_deref()
                .and_then(|f| input.field(f).ok())
                .map(Field::data_type);
            let ty = match (&agg.field, input_type) {
                (Some(_), None) => DataType::Undefined,
                _ => agg.output_type(input_type),
            };
            fields.push(Field::new(agg.alias.clone(), ty));
        }
        // Duplicate aliases are caught by validate().
        Schema::new(fields.clone()).unwrap_or_else(|_| {
            let mut seen = Vec::new();
            let fields = fields
                .into_iter()
                .filter(|f| {
                    let fresh = !seen.contains(&f.name().to_string());
                    seen.push(f.name().to_string());
                    fresh
                })
                .collect();
            Schema::new(fields).unwrap_or_default()
        })
    }

    /// Checks the definition against its input schema.
    ///
    /// # Errors
    ///
    /// Returns a [`WindowError`] describing the first problem found.
    pub fn validate(&self, input: &Schema) -> Result<(), WindowError> {
        self.window_type.validate()?;
        if self.allowed_lateness_ms < 0 {
            return Err(WindowError::InvalidWindow(format!(
                "negative allowed lateness {}",
                self.allowed_lateness_ms
            )));
        }
        if let TriggerPolicy::OnTime { trigger_time_ms: 0 } = self.trigger_policy {
            return Err(WindowError::InvalidWindow("trigger period of 0ms".into()));
        }
        self.time.validate(input)?;
        match (self.trigger_action, self.window_type) {
            (TriggerAction::LazyNestLoopJoin, _) => {
                return Err(WindowError::InvalidTriggerAction {
                    action: self.trigger_action,
                    reason: "only joins materialize both sides",
                })
            }
            (TriggerAction::SliceAggregation, WindowType::Session { .. }) => {
                return Err(WindowError::InvalidTriggerAction {
                    action: self.trigger_action,
                    reason: "session windows have no slices",
                })
            }
            _ => {}
        }
        for key in &self.keys {
            input
                .field(key)
                .map_err(|_| WindowError::FieldNotFound(key.clone()))?;
        }
        for agg in &self.aggregations {
            let input_type = match &agg.field {
                Some(f) => Some(
                    input
                        .field(f)
                        .map_err(|_| WindowError::FieldNotFound(f.clone()))?
                        .data_type(),
                ),
                None if agg.function == AggregationFunction::Count => None,
                None => {
                    return Err(WindowError::FieldNotFound(format!("{:?}(*)", agg.function)));
                }
            };
            if agg.output_type(input_type).is_undefined() {
                return Err(WindowError::UnsupportedAggregation {
                    function: agg.function,
                    field: agg.field.clone().unwrap_or_default(),
                    found: input_type.map_or_else(String::new, ToString::to_string),
                });
            }
        }
        let schema = self.output_schema(input);
        if schema.len() != 2 + self.keys.len() + self.aggregations.len() {
            return Err(WindowError::InvalidWindow(
                "duplicate output field names".into(),
            ));
        }
        Ok(())
    }
}

/// Join input side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// First input.
    Left,
    /// Second input.
    Right,
}

/// Immutable description of a windowed equi-join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDefinition {
    /// Key field on the left input.
    pub left_key: String,
    /// Key field on the right input.
    pub right_key: String,
    /// Window shape; sessions are not supported for joins.
    pub window_type: WindowType,
    /// Timestamp source of the left input.
    pub left_time: TimeCharacteristic,
    /// Timestamp source of the right input.
    pub right_time: TimeCharacteristic,
    /// Grace period after the watermark in milliseconds.
    pub allowed_lateness_ms: i64,
    /// Trigger policy.
    pub trigger_policy: TriggerPolicy,
}

impl JoinDefinition {
    /// Creates a join on `left_key == right_key`.
    pub fn new(
        left_key: impl Into<String>,
        right_key: impl Into<String>,
        window_type: WindowType,
        left_time: TimeCharacteristic,
        right_time: TimeCharacteristic,
    ) -> Self {
        Self {
            left_key: left_key.into(),
            right_key: right_key.into(),
            window_type,
            left_time,
            right_time,
            allowed_lateness_ms: 0,
            trigger_policy: TriggerPolicy::default(),
        }
    }

    /// Sets the allowed lateness.
    #[must_use]
    pub fn allowed_lateness(mut self, lateness_ms: i64) -> Self {
        self.allowed_lateness_ms = lateness_ms;
        self
    }

    /// Sets the trigger policy.
    #[must_use]
    pub fn trigger_policy(mut self, policy: TriggerPolicy) -> Self {
        self.trigger_policy = policy;
        self
    }

    /// Always [`TriggerAction::LazyNestLoopJoin`].
    #[must_use]
    pub fn trigger_action(&self) -> TriggerAction {
        TriggerAction::LazyNestLoopJoin
    }

    /// Key field of `side`.
    #[must_use]
    pub fn key(&self, side: JoinSide) -> &str {
        match side {
            JoinSide::Left => &self.left_key,
            JoinSide::Right => &self.right_key,
        }
    }

    /// Timestamp source of `side`.
    #[must_use]
    pub fn time(&self, side: JoinSide) -> &TimeCharacteristic {
        match side {
            JoinSide::Left => &self.left_time,
            JoinSide::Right => &self.right_time,
        }
    }

    /// Result schema: `start`, `end`, all left fields, all right fields.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::DuplicateField`] if a name occurs on both sides.
    pub fn output_schema(&self, left: &Schema, right: &Schema) -> Result<Schema, TypeError> {
        let bounds = Schema::new(vec![
            Field::new("start", DataType::int64()),
            Field::new("end", DataType::int64()),
        ])?;
        bounds.concat(left)?.concat(right)
    }

    /// Checks the definition against both input schemas.
    ///
    /// # Errors
    ///
    /// Returns a [`WindowError`] describing the first problem found.
    pub fn validate(&self, left: &Schema, right: &Schema) -> Result<(), WindowError> {
        self.window_type.validate()?;
        if matches!(self.window_type, WindowType::Session { .. }) {
            return Err(WindowError::InvalidWindow(
                "session windows are not supported for joins".into(),
            ));
        }
        if self.allowed_lateness_ms < 0 {
            return Err(WindowError::InvalidWindow(format!(
                "negative allowed lateness {}",
                self.allowed_lateness_ms
            )));
        }
        self.left_time.validate(left)?;
        self.right_time.validate(right)?;
        let lk = left
            .field(&self.left_key)
            .map_err(|_| WindowError::FieldNotFound(self.left_key.clone()))?;
        let rk = right
            .field(&self.right_key)
            .map_err(|_| WindowError::FieldNotFound(self.right_key.clone()))?;
        lk.data_type()
            .try_join(rk.data_type())
            .map_err(WindowError::IncompatibleKeys)?;
        Ok(())
    }
}
