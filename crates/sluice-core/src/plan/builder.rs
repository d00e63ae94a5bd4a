//! Fluent construction of logical plans.
//!
//! Schemas are inferred as operators are appended. Inference is lenient:
//! an expression that does not type-check yields an `Undefined` field, and
//! lowering reports it against the offending operator. Only structural
//! problems (missing input, incompatible union/join inputs) fail the build.

use std::sync::Arc;

use super::error::PlanError;
use super::graph::QueryPlan;
use super::operator::{LogicalOperator, OperatorKind, SourceDescriptor};
use super::{IdGenerator, OperatorId};
use crate::expr::Expr;
use crate::sink::SinkDescriptor;
use crate::types::{DataType, Field, Schema, SchemaRef};
use crate::window::{JoinDefinition, WatermarkStrategy, WindowDefinition};

/// Fluent builder for logical [`QueryPlan`]s.
///
/// # Example
///
/// ```rust,ignore
/// let plan = QueryBuilder::from_source(&ids, "cars", schema)
///     .filter(col("speed").gt(lit(50)))
///     .key_by(["id"])
///     .window(WindowDefinition::new(WindowType::tumbling(1000), time)
///         .aggregate(WindowAggregation::sum("speed")))
///     .sink(SinkDescriptor::collect(results.clone()))
///     .build()?;
/// ```
pub struct QueryBuilder {
    ids: Arc<IdGenerator>,
    plan: QueryPlan,
    head: Option<OperatorId>,
    pending_keys: Vec<String>,
    terminated: bool,
    error: Option<PlanError>,
}

impl QueryBuilder {
    /// Starts a plan at a source.
    #[must_use]
    pub fn from_source(ids: &Arc<IdGenerator>, name: impl Into<String>, schema: SchemaRef) -> Self {
        let mut builder = Self {
            ids: Arc::clone(ids),
            plan: QueryPlan::new(),
            head: None,
            pending_keys: Vec::new(),
            terminated: false,
            error: None,
        };
        let id = builder.ids.next_operator_id();
        let descriptor = SourceDescriptor {
            name: name.into(),
            schema: Arc::clone(&schema),
        };
        match builder.plan.add_operator(
            id,
            OperatorKind::Logical(LogicalOperator::Source(descriptor)),
            Vec::new(),
            schema,
        ) {
            Ok(id) => builder.head = Some(id),
            Err(e) => builder.error = Some(e),
        }
        builder
    }

    /// Output schema of the current head operator.
    #[must_use]
    pub fn output_schema(&self) -> Option<SchemaRef> {
        let head = self.head?;
        self.plan.node(head).map(|n| Arc::clone(n.output_schema()))
    }

    /// Id of the current head operator.
    #[must_use]
    pub fn head(&self) -> Option<OperatorId> {
        self.head
    }

    fn input(&self, step: &'static str) -> Result<(OperatorId, SchemaRef), PlanError> {
        if self.terminated {
            return Err(PlanError::AfterSink(step));
        }
        let head = self.head.ok_or(PlanError::MissingInput(step))?;
        let schema = self
            .plan
            .node(head)
            .map(|n| Arc::clone(n.output_schema()))
            .ok_or(PlanError::OperatorNotFound(head))?;
        Ok((head, schema))
    }

    fn append(
        mut self,
        step: &'static str,
        op: LogicalOperator,
        output: impl FnOnce(OperatorId, &SchemaRef) -> Result<Schema, PlanError>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self.add_unary(step, op, output) {
            Ok(id) => self.head = Some(id),
            Err(e) => self.error = Some(e),
        }
        self
    }

    fn add_unary(
        &mut self,
        step: &'static str,
        op: LogicalOperator,
        output: impl FnOnce(OperatorId, &SchemaRef) -> Result<Schema, PlanError>,
    ) -> Result<OperatorId, PlanError> {
        let (head, input) = self.input(step)?;
        let id = self.ids.next_operator_id();
        let output = Arc::new(output(id, &input)?);
        self.plan
            .add_operator(id, OperatorKind::Logical(op), vec![input], output)?;
        self.plan.connect(head, id)?;
        Ok(id)
    }

    /// Keeps records for which `predicate` holds.
    #[must_use]
    pub fn filter(self, predicate: Expr) -> Self {
        self.append("filter", LogicalOperator::Filter { predicate }, |_, input| {
            Ok((**input).clone())
        })
    }

    /// Assigns `field` (appending it if new) from `expr`.
    #[must_use]
    pub fn map(self, field: impl Into<String>, expr: Expr) -> Self {
        let field = field.into();
        let op = LogicalOperator::Map {
            field: field.clone(),
            expr: expr.clone(),
        };
        self.append("map", op, move |_, input| {
            let ty = expr.infer_type(input).unwrap_or(DataType::Undefined);
            Ok(input.with_field(&field, ty))
        })
    }

    /// Keeps only `fields`, in the given order.
    #[must_use]
    pub fn project<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let op = LogicalOperator::Project {
            fields: fields.clone(),
        };
        self.append("project", op, move |id, input| {
            let projected = fields
                .iter()
                .map(|name| match input.field(name) {
                    Ok(field) => field.clone(),
                    Err(_) => Field::new(name.clone(), DataType::Undefined),
                })
                .collect();
            Schema::new(projected).map_err(|e| PlanError::SchemaMismatch {
                operator: id,
                reason: e.to_string(),
            })
        })
    }

    /// Declares grouping keys for the next window.
    #[must_use]
    pub fn key_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.pending_keys.clone_from(&keys);
        self.append("key_by", LogicalOperator::KeyBy { keys }, |_, input| {
            Ok((**input).clone())
        })
    }

    /// Derives watermarks from the stream.
    #[must_use]
    pub fn assign_watermarks(self, strategy: WatermarkStrategy) -> Self {
        self.append(
            "assign_watermarks",
            LogicalOperator::WatermarkAssigner(strategy),
            |_, input| Ok((**input).clone()),
        )
    }

    /// Windowed aggregation. Keys declared by a preceding
    /// [`key_by`](Self::key_by) apply when the definition has none.
    #[must_use]
    pub fn window(mut self, mut definition: WindowDefinition) -> Self {
        if definition.keys.is_empty() {
            definition.keys = std::mem::take(&mut self.pending_keys);
        } else {
            self.pending_keys.clear();
        }
        let definition = Arc::new(definition);
        let schema_def = Arc::clone(&definition);
        self.append("window", LogicalOperator::Window(definition), move |_, input| {
            Ok(schema_def.output_schema(input))
        })
    }

    /// Windowed equi-join with `right`; `self` is the left input.
    #[must_use]
    pub fn join(mut self, right: QueryBuilder, definition: JoinDefinition) -> Self {
        if self.error.is_some() {
            return self;
        }
        let result = self.add_join(right, definition);
        self.finish_binary(result)
    }

    fn add_join(
        &mut self,
        right: QueryBuilder,
        definition: JoinDefinition,
    ) -> Result<OperatorId, PlanError> {
        let (left, right) = self.merge_inputs("join", right)?;
        let (l_schema, r_schema) = (self.schema_of(left)?, self.schema_of(right)?);
        let id = self.ids.next_operator_id();
        let output = definition
            .output_schema(&l_schema, &r_schema)
            .map_err(|e| PlanError::SchemaMismatch {
                operator: id,
                reason: e.to_string(),
            })?;
        let op = LogicalOperator::Join(Arc::new(definition));
        self.plan.add_operator(
            id,
            OperatorKind::Logical(op),
            vec![l_schema, r_schema],
            Arc::new(output),
        )?;
        self.plan.connect(left, id)?;
        self.plan.connect(right, id)?;
        Ok(id)
    }

    /// Merges `other` into this stream. Field names must match pairwise;
    /// field types are widened.
    #[must_use]
    pub fn union(mut self, other: QueryBuilder) -> Self {
        if self.error.is_some() {
            return self;
        }
        let result = self.add_union(other);
        self.finish_binary(result)
    }

    fn add_union(&mut self, other: QueryBuilder) -> Result<OperatorId, PlanError> {
        let (left, right) = self.merge_inputs("union", other)?;
        let (l_schema, r_schema) = (self.schema_of(left)?, self.schema_of(right)?);
        let id = self.ids.next_operator_id();
        let output = l_schema
            .union_merge(&r_schema)
            .map_err(|e| PlanError::SchemaMismatch {
                operator: id,
                reason: e.to_string(),
            })?;
        self.plan.add_operator(
            id,
            OperatorKind::Logical(LogicalOperator::Union),
            vec![l_schema, r_schema],
            Arc::new(output),
        )?;
        self.plan.connect(left, id)?;
        self.plan.connect(right, id)?;
        Ok(id)
    }

    /// Appends an opaque extension operator that keeps the schema.
    #[must_use]
    pub fn custom(self, name: impl Into<String>) -> Self {
        let op = LogicalOperator::Custom { name: name.into() };
        self.append("custom", op, |_, input| Ok((**input).clone()))
    }

    /// Terminates the plan with a sink.
    #[must_use]
    pub fn sink(self, descriptor: SinkDescriptor) -> Self {
        let mut builder = self.append("sink", LogicalOperator::Sink(descriptor), |_, input| {
            Ok((**input).clone())
        });
        builder.terminated = true;
        builder
    }

    /// Validates and returns the plan.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a builder step, or any
    /// [`QueryPlan::validate`] error.
    pub fn build(self) -> Result<QueryPlan, PlanError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.plan.validate()?;
        Ok(self.plan)
    }

    fn schema_of(&self, id: OperatorId) -> Result<SchemaRef, PlanError> {
        self.plan
            .node(id)
            .map(|n| Arc::clone(n.output_schema()))
            .ok_or(PlanError::OperatorNotFound(id))
    }

    /// Moves `other`'s nodes into this plan; returns both heads.
    fn merge_inputs(
        &mut self,
        step: &'static str,
        other: QueryBuilder,
    ) -> Result<(OperatorId, OperatorId), PlanError> {
        let (left, _) = self.input(step)?;
        if let Some(e) = other.error {
            return Err(e);
        }
        if other.terminated {
            return Err(PlanError::AfterSink(step));
        }
        let right = other.head.ok_or(PlanError::MissingInput(step))?;
        let mut moved: Vec<_> = other.plan.nodes().cloned().collect();
        moved.sort_by_key(|n| n.id);
        for node in &moved {
            self.plan.add_operator(
                node.id,
                node.kind.clone(),
                node.input_schemas.to_vec(),
                Arc::clone(&node.output_schema),
            )?;
        }
        for node in &moved {
            for succ in &node.successors {
                self.plan.connect(node.id, *succ)?;
            }
        }
        self.pending_keys.clear();
        Ok((left, right))
    }

    fn finish_binary(mut self, result: Result<OperatorId, PlanError>) -> Self {
        match result {
            Ok(id) => self.head = Some(id),
            Err(e) => self.error = Some(e),
        }
        self
    }
}
