//! Error types for lowering, pipelining and backend compilation.

use crate::memory::BufferError;
use crate::plan::{OperatorId, PlanError};
use crate::types::TypeError;
use crate::window::WindowError;

use super::PipelineId;

/// Errors raised while compiling a query plan.
///
/// Every variant that concerns a single operator carries its id, see
/// [`CompileError::operator`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The provider has no physical strategy for a logical operator.
    #[error("operator {operator} ({name}) cannot be lowered")]
    Unlowerable {
        /// Offending operator.
        operator: OperatorId,
        /// Its kind name.
        name: String,
    },

    /// Schema inference left a field without a type.
    #[error("operator {operator}: field '{field}' has an undefined type")]
    UndefinedType {
        /// Operator whose schema holds the field.
        operator: OperatorId,
        /// Field name.
        field: String,
    },

    /// An expression failed to bind against its input schema.
    #[error("operator {operator}: {source}")]
    Expression {
        /// Operator owning the expression.
        operator: OperatorId,
        /// Binding error.
        source: TypeError,
    },

    /// A filter predicate does not produce a boolean.
    #[error("operator {operator}: filter predicate has type {found}, expected Boolean")]
    NonBooleanPredicate {
        /// Filter operator.
        operator: OperatorId,
        /// Inferred type.
        found: String,
    },

    /// A key, projection or time field does not exist.
    #[error("operator {operator}: unknown field '{field}'")]
    UnknownField {
        /// Operator referencing the field.
        operator: OperatorId,
        /// Field name.
        field: String,
    },

    /// An event-time field is not an integer.
    #[error("operator {operator}: time field '{field}' is not an integer")]
    NonIntegerTime {
        /// Watermark or window operator.
        operator: OperatorId,
        /// Field name.
        field: String,
    },

    /// A window or join definition does not fit its inputs.
    #[error("operator {operator}: {source}")]
    InvalidWindow {
        /// Window or join operator.
        operator: OperatorId,
        /// Definition error.
        source: WindowError,
    },

    /// The operator graph is malformed (cycle, dangling edge, ...).
    #[error("structural error: {0}")]
    Structural(#[from] PlanError),

    /// A logical operator reached a phase that expects physical ones.
    #[error("operator {0} has not been lowered")]
    NotLowered(OperatorId),

    /// A schema has no memory layout for the configured buffer size.
    #[error("operator {operator}: {source}")]
    Layout {
        /// Operator whose schema was laid out.
        operator: OperatorId,
        /// Layout error.
        source: BufferError,
    },

    /// A backend rejected a pipeline.
    #[error("backend '{backend}' failed on pipeline {pipeline}: {reason}")]
    Backend {
        /// Backend name.
        backend: &'static str,
        /// Rejected pipeline.
        pipeline: PipelineId,
        /// Why.
        reason: String,
    },
}

impl CompileError {
    /// Operator the error is attributed to, if any.
    #[must_use]
    pub fn operator(&self) -> Option<OperatorId> {
        match self {
            Self::Unlowerable { operator, .. }
            | Self::UndefinedType { operator, .. }
            | Self::Expression { operator, .. }
            | Self::NonBooleanPredicate { operator, .. }
            | Self::UnknownField { operator, .. }
            | Self::NonIntegerTime { operator, .. }
            | Self::InvalidWindow { operator, .. }
            | Self::Layout { operator, .. } => Some(*operator),
            Self::NotLowered(operator) => Some(*operator),
            Self::Structural(err) => match err {
                PlanError::CycleDetected(id)
                | PlanError::OperatorNotFound(id)
                | PlanError::DuplicateOperator(id) => Some(*id),
                PlanError::DisconnectedOperator { id, .. } => Some(*id),
                PlanError::SchemaMismatch { operator, .. } => Some(*operator),
                _ => None,
            },
            Self::Backend { .. } => None,
        }
    }
}
