//! Backend input: the stateless operator chain of one pipeline, with every
//! field reference resolved to a position.

use std::fmt;
use std::sync::Arc;

use super::{CompileError, Pipeline, PipelineId};
use crate::expr::BoundExpr;
use crate::plan::{OperatorId, PhysicalOperator, PlanError, QueryPlan};
use crate::types::{Schema, SchemaRef};
use crate::window::WatermarkStrategy;

/// How a watermark step derives its candidate watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkSource {
    /// Largest value of the integer field at `index`, minus `delay_ms`.
    EventTime {
        /// Timestamp position in the record.
        index: usize,
        /// Tolerated out-of-orderness.
        delay_ms: i64,
    },
    /// Processing wall-clock time.
    Ingestion,
}

/// One record-at-a-time step.
#[derive(Debug, Clone, PartialEq)]
pub enum IrStep {
    /// Drops the record unless `predicate` is true.
    Filter {
        /// Source operator.
        operator: OperatorId,
        /// Bound predicate.
        predicate: BoundExpr,
    },
    /// Writes `expr` to position `index`, appending if `index` equals the
    /// current record width.
    Map {
        /// Source operator.
        operator: OperatorId,
        /// Target position.
        index: usize,
        /// Bound value expression.
        expr: BoundExpr,
    },
    /// Reorders and narrows the record.
    Project {
        /// Source operator.
        operator: OperatorId,
        /// Positions to keep, in output order.
        indices: Vec<usize>,
    },
    /// Observes timestamps for the buffer's watermark.
    AssignWatermark {
        /// Source operator.
        operator: OperatorId,
        /// Watermark source.
        source: WatermarkSource,
    },
}

impl IrStep {
    /// Operator the step was built from.
    #[must_use]
    pub fn operator(&self) -> OperatorId {
        match self {
            Self::Filter { operator, .. }
            | Self::Map { operator, .. }
            | Self::Project { operator, .. }
            | Self::AssignWatermark { operator, .. } => *operator,
        }
    }
}

/// Stateless steps of one pipeline, between the head's output and the
/// pipeline's output.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineIr {
    /// Pipeline the steps belong to.
    pub pipeline: PipelineId,
    /// Schema of records entering the first step.
    pub input_schema: SchemaRef,
    /// Steps in execution order.
    pub steps: Vec<IrStep>,
    /// Schema of records leaving the last step.
    pub output_schema: SchemaRef,
}

impl PipelineIr {
    /// Builds the IR for `pipeline`.
    ///
    /// Returns `Ok(None)` for pipelines headed by an operator that consumes
    /// its input (pre-aggregation, join build, sink): those run no chain.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] if an expression no longer binds against
    /// the schema flowing into it.
    pub fn build(plan: &QueryPlan, pipeline: &Pipeline) -> Result<Option<Self>, CompileError> {
        let mut operators = pipeline.operators().iter();
        let Some(head_id) = operators.next() else {
            return Ok(None);
        };
        let head = plan.node(*head_id).ok_or(PlanError::OperatorNotFound(*head_id))?;
        let head_op = head.kind().as_physical().ok_or(CompileError::NotLowered(*head_id))?;
        if head_op.is_terminal() {
            return Ok(None);
        }

        let mut steps = Vec::new();
        let (input_schema, mut schema) = if head_op.is_stateless() {
            let input = head
                .input_schemas()
                .first()
                .cloned()
                .ok_or(PlanError::DisconnectedOperator {
                    id: *head_id,
                    name: head.name(),
                    reason: "no upstream operator",
                })?;
            let schema = lower_step(*head_id, head_op, &input, &mut steps)?;
            (input, schema)
        } else {
            (Arc::clone(head.output_schema()), Arc::clone(head.output_schema()))
        };

        for id in operators {
            let node = plan.node(*id).ok_or(PlanError::OperatorNotFound(*id))?;
            let op = node.kind().as_physical().ok_or(CompileError::NotLowered(*id))?;
            if !op.is_stateless() {
                return Err(CompileError::Backend {
                    backend: "ir",
                    pipeline: pipeline.id(),
                    reason: format!("{} cannot run inside a fused chain", op.name()),
                });
            }
            schema = lower_step(*id, op, &schema, &mut steps)?;
        }

        Ok(Some(Self {
            pipeline: pipeline.id(),
            input_schema,
            steps,
            output_schema: schema,
        }))
    }

    /// Returns `true` if records pass through unchanged.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for PipelineIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pipeline, self.input_schema)?;
        for step in &self.steps {
            match step {
                IrStep::Filter { .. } => write!(f, " |> filter")?,
                IrStep::Map { index, .. } => write!(f, " |> map[{index}]")?,
                IrStep::Project { indices, .. } => write!(f, " |> project{indices:?}")?,
                IrStep::AssignWatermark { .. } => write!(f, " |> watermark")?,
            }
        }
        Ok(())
    }
}

/// Appends the step for `op` and returns the schema it produces.
fn lower_step(
    id: OperatorId,
    op: &PhysicalOperator,
    input: &SchemaRef,
    steps: &mut Vec<IrStep>,
) -> Result<SchemaRef, CompileError> {
    let expression = |source| CompileError::Expression { operator: id, source };
    let unknown = |field: &str| CompileError::UnknownField {
        operator: id,
        field: field.to_string(),
    };
    match op {
        PhysicalOperator::Filter { predicate } => {
            let (predicate, _) = predicate.bind(input).map_err(expression)?;
            steps.push(IrStep::Filter {
                operator: id,
                predicate,
            });
            Ok(Arc::clone(input))
        }
        PhysicalOperator::Map { field, expr } => {
            let (expr, ty) = expr.bind(input).map_err(expression)?;
            let index = input.index_of(field).unwrap_or(input.len());
            steps.push(IrStep::Map {
                operator: id,
                index,
                expr,
            });
            Ok(Arc::new(input.with_field(field, ty)))
        }
        PhysicalOperator::Project { fields } => {
            let indices = fields
                .iter()
                .map(|f| input.index_of(f).ok_or_else(|| unknown(f.as_str())))
                .collect::<Result<Vec<_>, _>>()?;
            let schema: Schema = input.project(fields).map_err(expression)?;
            steps.push(IrStep::Project {
                operator: id,
                indices,
            });
            Ok(Arc::new(schema))
        }
        PhysicalOperator::KeyBy { .. } => Ok(Arc::clone(input)),
        PhysicalOperator::WatermarkAssignment(strategy) => {
            let source = match strategy {
                WatermarkStrategy::EventTime { field, delay_ms } => WatermarkSource::EventTime {
                    index: input.index_of(field).ok_or_else(|| unknown(field.as_str()))?,
                    delay_ms: *delay_ms,
                },
                WatermarkStrategy::IngestionTime => WatermarkSource::Ingestion,
            };
            steps.push(IrStep::AssignWatermark { operator: id, source });
            Ok(Arc::clone(input))
        }
        other => Err(CompileError::Unlowerable {
            operator: id,
            name: other.name().to_string(),
        }),
    }
}
