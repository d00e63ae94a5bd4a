//! Error types for plan construction and validation.

use super::OperatorId;

/// Errors raised while building or validating an operator plan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// The plan contains a cycle through the given operator.
    #[error("cycle detected involving operator {0}")]
    CycleDetected(OperatorId),

    /// An operator lacks a required predecessor or successor.
    #[error("disconnected operator {id} ({name}): {reason}")]
    DisconnectedOperator {
        /// Operator id.
        id: OperatorId,
        /// Operator kind name.
        name: &'static str,
        /// What is missing.
        reason: &'static str,
    },

    /// An edge or lookup referenced an unknown operator.
    #[error("operator not found: {0}")]
    OperatorNotFound(OperatorId),

    /// An operator id was registered twice.
    #[error("duplicate operator id: {0}")]
    DuplicateOperator(OperatorId),

    /// The inputs of a binary operator cannot be merged.
    #[error("schema mismatch at operator {operator}: {reason}")]
    SchemaMismatch {
        /// Binary operator.
        operator: OperatorId,
        /// Description of the incompatibility.
        reason: String,
    },

    /// The plan has no operators.
    #[error("empty plan: no operators")]
    EmptyPlan,

    /// A builder step was applied with no upstream operator.
    #[error("builder step '{0}' has no upstream operator")]
    MissingInput(&'static str),

    /// A builder step was applied after the plan was terminated by a sink.
    #[error("builder step '{0}' applied after sink")]
    AfterSink(&'static str),
}
