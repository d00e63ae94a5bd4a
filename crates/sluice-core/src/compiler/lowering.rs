//! Lowering of logical operators to physical ones.
//!
//! Most logical operators map one-to-one onto a physical operator under the
//! same id. Windows and joins expand into a build half and an emit half that
//! share one handler, identified by the logical operator's id:
//!
//! ```text
//! pred ─► Window#7                 pred ─► SlicePreAggregation#12 ─► WindowSink#7
//!
//! left ──► Join#9                  left ──► JoinBuild{Left}#13 ──┐
//! right ─┘                 ==>     right ─► JoinBuild{Right}#14 ─┴► JoinSink#9
//! ```

use std::sync::Arc;

use tracing::debug;

use super::CompileError;
use crate::plan::{
    IdGenerator, LogicalOperator, OperatorId, OperatorKind, OperatorNode, PhysicalOperator,
    PlanError, QueryPlan,
};
use crate::types::{DataType, Schema, SchemaRef};
use crate::window::{JoinSide, WatermarkStrategy};

/// Rewrites logical nodes of a plan into physical ones.
#[derive(Debug, Clone)]
pub struct PhysicalOperatorProvider {
    ids: Arc<IdGenerator>,
}

impl PhysicalOperatorProvider {
    /// Creates a provider drawing ids for inserted nodes from `ids`.
    #[must_use]
    pub fn new(ids: &Arc<IdGenerator>) -> Self {
        Self {
            ids: Arc::clone(ids),
        }
    }

    /// Lowers every logical node of `plan`, in topological order.
    ///
    /// # Errors
    ///
    /// Returns the first [`CompileError`] raised by [`lower`](Self::lower),
    /// or [`CompileError::Structural`] if the plan is malformed.
    pub fn lower_plan(&self, plan: &mut QueryPlan) -> Result<(), CompileError> {
        plan.validate()?;
        let order = plan.topological_order()?;
        let logical = order.len();
        for id in order {
            self.lower(plan, id)?;
        }
        debug!(
            logical,
            physical = plan.node_count(),
            "lowered plan"
        );
        Ok(())
    }

    /// Replaces the logical node `id` with its physical counterpart,
    /// keeping every edge and the node's schemas. Physical nodes are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] naming `id` if the operator has no
    /// physical strategy or its schemas and expressions do not type-check.
    pub fn lower(&self, plan: &mut QueryPlan, id: OperatorId) -> Result<(), CompileError> {
        let node = plan
            .node(id)
            .ok_or(PlanError::OperatorNotFound(id))?
            .clone();
        let OperatorKind::Logical(op) = node.kind() else {
            return Ok(());
        };
        for schema in node.input_schemas() {
            check_defined(id, schema)?;
        }

        match op {
            LogicalOperator::Source(descriptor) => replace(
                plan,
                &node,
                PhysicalOperator::Scan {
                    source: descriptor.name.clone(),
                },
            )?,
            LogicalOperator::Filter { predicate } => {
                let (_, ty) = predicate
                    .bind(single_input(&node)?.1)
                    .map_err(|source| CompileError::Expression { operator: id, source })?;
                if !ty.is_boolean() {
                    return Err(CompileError::NonBooleanPredicate {
                        operator: id,
                        found: ty.to_string(),
                    });
                }
                let predicate = predicate.clone();
                replace(plan, &node, PhysicalOperator::Filter { predicate })?;
            }
            LogicalOperator::Map { field, expr } => {
                expr.bind(single_input(&node)?.1)
                    .map_err(|source| CompileError::Expression { operator: id, source })?;
                let op = PhysicalOperator::Map {
                    field: field.clone(),
                    expr: expr.clone(),
                };
                replace(plan, &node, op)?;
            }
            LogicalOperator::Project { fields } => {
                require_fields(id, single_input(&node)?.1, fields)?;
                let op = PhysicalOperator::Project {
                    fields: fields.clone(),
                };
                replace(plan, &node, op)?;
            }
            LogicalOperator::KeyBy { keys } => {
                require_fields(id, single_input(&node)?.1, keys)?;
                let op = PhysicalOperator::KeyBy { keys: keys.clone() };
                replace(plan, &node, op)?;
            }
            LogicalOperator::WatermarkAssigner(strategy) => {
                if let WatermarkStrategy::EventTime { field, .. } = strategy {
                    check_time_field(id, single_input(&node)?.1, field)?;
                }
                let op = PhysicalOperator::WatermarkAssignment(strategy.clone());
                replace(plan, &node, op)?;
            }
            LogicalOperator::Window(definition) => {
                let (pred, input) = single_input(&node)?;
                definition
                    .validate(input)
                    .map_err(|source| CompileError::InvalidWindow { operator: id, source })?;
                let output = Arc::clone(node.output_schema());
                let pre = self.ids.next_operator_id();
                let build = PhysicalOperator::SlicePreAggregation {
                    handler: id,
                    definition: Arc::clone(definition),
                };
                plan.insert_between(
                    pred,
                    id,
                    pre,
                    OperatorKind::Physical(build),
                    Arc::clone(&output),
                )?;
                let sink = PhysicalOperator::WindowSink {
                    handler: id,
                    definition: Arc::clone(definition),
                };
                plan.replace_operator(
                    id,
                    OperatorKind::Physical(sink),
                    vec![Arc::clone(&output)],
                    output,
                )?;
                debug!(window = %id, pre_aggregation = %pre, "split window operator");
            }
            LogicalOperator::Join(definition) => {
                let (preds, inputs) = (node.predecessors(), node.input_schemas());
                if preds.len() != 2 || inputs.len() != 2 {
                    return Err(PlanError::DisconnectedOperator {
                        id,
                        name: node.name(),
                        reason: "join needs exactly two inputs",
                    }
                    .into());
                }
                definition
                    .validate(&inputs[0], &inputs[1])
                    .map_err(|source| CompileError::InvalidWindow { operator: id, source })?;
                let output = Arc::clone(node.output_schema());
                for (pred, side) in [(preds[0], JoinSide::Left), (preds[1], JoinSide::Right)] {
                    let build = PhysicalOperator::JoinBuild {
                        handler: id,
                        side,
                        definition: Arc::clone(definition),
                    };
                    plan.insert_between(
                        pred,
                        id,
                        self.ids.next_operator_id(),
                        OperatorKind::Physical(build),
                        Arc::clone(&output),
                    )?;
                }
                let sink = PhysicalOperator::JoinSink {
                    handler: id,
                    definition: Arc::clone(definition),
                };
                plan.replace_operator(
                    id,
                    OperatorKind::Physical(sink),
                    vec![Arc::clone(&output), Arc::clone(&output)],
                    output,
                )?;
                debug!(join = %id, "split join operator");
            }
            LogicalOperator::Union => replace(plan, &node, PhysicalOperator::Multiplex)?,
            LogicalOperator::Sink(descriptor) => {
                replace(plan, &node, PhysicalOperator::Sink(descriptor.clone()))?;
            }
            LogicalOperator::Custom { name } => {
                return Err(CompileError::Unlowerable {
                    operator: id,
                    name: name.clone(),
                })
            }
        }

        let output = node.output_schema();
        check_defined(id, output)?;
        output.physical_types().map_err(|e| CompileError::Layout {
            operator: id,
            source: e.into(),
        })?;
        Ok(())
    }
}

fn replace(
    plan: &mut QueryPlan,
    node: &OperatorNode,
    op: PhysicalOperator,
) -> Result<(), PlanError> {
    plan.replace_operator(
        node.id(),
        OperatorKind::Physical(op),
        node.input_schemas().to_vec(),
        Arc::clone(node.output_schema()),
    )
}

fn single_input(node: &OperatorNode) -> Result<(OperatorId, &SchemaRef), CompileError> {
    match (node.predecessors(), node.input_schemas()) {
        ([pred], [schema]) => Ok((*pred, schema)),
        _ => Err(PlanError::DisconnectedOperator {
            id: node.id(),
            name: node.name(),
            reason: "expected exactly one input",
        }
        .into()),
    }
}

fn check_defined(operator: OperatorId, schema: &Schema) -> Result<(), CompileError> {
    match schema.first_undefined() {
        Some(field) => Err(CompileError::UndefinedType {
            operator,
            field: field.name().to_string(),
        }),
        None => Ok(()),
    }
}

fn require_fields(
    operator: OperatorId,
    schema: &Schema,
    fields: &[String],
) -> Result<(), CompileError> {
    match fields.iter().find(|f| schema.index_of(f).is_none()) {
        Some(field) => Err(CompileError::UnknownField {
            operator,
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

fn check_time_field(
    operator: OperatorId,
    schema: &Schema,
    field: &str,
) -> Result<(), CompileError> {
    let unknown = || CompileError::UnknownField {
        operator,
        field: field.to_string(),
    };
    let ty: &DataType = schema.field(field).map_err(|_| unknown())?.data_type();
    if ty.is_integer() {
        Ok(())
    } else {
        Err(CompileError::NonIntegerTime {
            operator,
            field: field.to_string(),
        })
    }
}
