//! Operator plans.
//!
//! A [`QueryPlan`] is an arena of [`OperatorNode`]s keyed by [`OperatorId`].
//! Edges are id lists stored on the nodes, so the plan is the sole owner of
//! every node and no reference cycles exist. Logical plans are produced by
//! [`QueryBuilder`]; the compiler lowers them in place to physical plans.

mod builder;
mod error;
mod graph;
mod operator;


use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use builder::QueryBuilder;
pub use error::PlanError;
pub use graph::QueryPlan;
pub use operator::{
    LogicalOperator, OperatorKind, OperatorNode, PhysicalOperator, SourceDescriptor,
};

/// Unique, never reused identifier of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(pub u64);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorId({})", self.0)
    }
}

/// Unique identifier of a deployed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

/// Hands out monotonic operator and query ids.
///
/// One generator is shared by everything that creates operators for the
/// same engine (plan construction and lowering), so ids stay unique across
/// plans without process-wide state.
#[derive(Debug)]
pub struct IdGenerator {
    next_operator: AtomicU64,
    next_query: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator whose first ids are 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_operator: AtomicU64::new(1),
            next_query: AtomicU64::new(1),
        }
    }

    /// Returns a fresh operator id.
    pub fn next_operator_id(&self) -> OperatorId {
        OperatorId(self.next_operator.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a fresh query id.
    pub fn next_query_id(&self) -> QueryId {
        QueryId(self.next_query.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
