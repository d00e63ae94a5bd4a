//! Splitting a physical plan into pipelines.
//!
//! A pipeline is a maximal chain of operators executed back to back on one
//! buffer by one task. The phase walks the plan in topological order and
//! opens a new pipeline at an operator when
//!
//! 1. it has no predecessor,
//! 2. it is blocking, or the [`BreakerPolicy`] refuses to fuse it,
//! 3. it has more than one predecessor,
//! 4. its predecessor fans out to several successors, or
//! 5. its predecessor consumes the stream (pre-aggregation, join build, sink).
//!
//! Otherwise it is appended to its predecessor's pipeline.

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use super::CompileError;
use crate::plan::{OperatorId, PhysicalOperator, PlanError, QueryPlan};

/// Dense pipeline index within one [`PipelineQueryPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub usize);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Decides whether a non-blocking operator may join its predecessor's
/// pipeline.
pub trait BreakerPolicy: Send + Sync + fmt::Debug {
    /// Returns `true` if `op` may be fused into the preceding pipeline.
    fn is_fusible(&self, op: &PhysicalOperator) -> bool;

    /// Policy name for logs.
    fn name(&self) -> &'static str;
}

/// One operator per pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysBreakPolicy;

impl BreakerPolicy for AlwaysBreakPolicy {
    fn is_fusible(&self, _op: &PhysicalOperator) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "always_break"
    }
}

/// Fuses every operator that is not blocking.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseIfPossiblePolicy;

impl BreakerPolicy for FuseIfPossiblePolicy {
    fn is_fusible(&self, op: &PhysicalOperator) -> bool {
        !op.is_blocking()
    }

    fn name(&self) -> &'static str {
        "fuse_if_possible"
    }
}

/// An ordered chain of fused operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    id: PipelineId,
    operators: Vec<OperatorId>,
    upstream: SmallVec<[PipelineId; 2]>,
    downstream: SmallVec<[PipelineId; 2]>,
}

impl Pipeline {
    /// Pipeline id.
    #[must_use]
    pub fn id(&self) -> PipelineId {
        self.id
    }

    /// Operators in execution order; the first one is the head.
    #[must_use]
    pub fn operators(&self) -> &[OperatorId] {
        &self.operators
    }

    /// First operator.
    #[must_use]
    pub fn head(&self) -> OperatorId {
        self.operators[0]
    }

    /// Last operator.
    #[must_use]
    pub fn tail(&self) -> OperatorId {
        self.operators[self.operators.len() - 1]
    }

    /// Pipelines feeding this one, in the head's predecessor order.
    #[must_use]
    pub fn upstream(&self) -> &[PipelineId] {
        &self.upstream
    }

    /// Pipelines fed by this one.
    #[must_use]
    pub fn downstream(&self) -> &[PipelineId] {
        &self.downstream
    }
}

/// A lowered plan partitioned into a DAG of pipelines.
#[derive(Debug, Clone)]
pub struct PipelineQueryPlan {
    plan: QueryPlan,
    pipelines: Vec<Pipeline>,
    membership: FxHashMap<OperatorId, PipelineId>,
}

impl PipelineQueryPlan {
    /// The underlying physical plan.
    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// All pipelines, indexed by id.
    #[must_use]
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    /// Looks up a pipeline.
    #[must_use]
    pub fn pipeline(&self, id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.get(id.0)
    }

    /// Pipeline containing `operator`.
    #[must_use]
    pub fn pipeline_of(&self, operator: OperatorId) -> Option<PipelineId> {
        self.membership.get(&operator).copied()
    }

    /// Pipelines without upstream pipelines.
    #[must_use]
    pub fn source_pipelines(&self) -> Vec<PipelineId> {
        self.pipelines
            .iter()
            .filter(|p| p.upstream.is_empty())
            .map(|p| p.id)
            .collect()
    }

    /// Pipelines without downstream pipelines.
    #[must_use]
    pub fn sink_pipelines(&self) -> Vec<PipelineId> {
        self.pipelines
            .iter()
            .filter(|p| p.downstream.is_empty())
            .map(|p| p.id)
            .collect()
    }
}

/// Partitions physical plans using a [`BreakerPolicy`].
#[derive(Debug, Clone)]
pub struct PipeliningPhase {
    policy: Arc<dyn BreakerPolicy>,
}

impl PipeliningPhase {
    /// Creates the phase.
    #[must_use]
    pub fn new(policy: Arc<dyn BreakerPolicy>) -> Self {
        Self { policy }
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn BreakerPolicy> {
        &self.policy
    }

    /// Partitions `plan` into pipelines.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::Structural`] for cyclic or disconnected
    /// plans and [`CompileError::NotLowered`] if a logical node remains.
    pub fn apply(&self, plan: QueryPlan) -> Result<PipelineQueryPlan, CompileError> {
        plan.validate()?;
        let order = plan.topological_order()?;

        let mut pipelines: Vec<Pipeline> = Vec::new();
        let mut membership: FxHashMap<OperatorId, PipelineId> = FxHashMap::default();

        for id in order {
            let node = plan.node(id).ok_or(PlanError::OperatorNotFound(id))?;
            let op = node.kind().as_physical().ok_or(CompileError::NotLowered(id))?;

            let fused_into = match node.predecessors() {
                [pred] if !op.is_blocking() && self.policy.is_fusible(op) => {
                    let pred_node = plan
                        .node(*pred)
                        .ok_or(PlanError::OperatorNotFound(*pred))?;
                    let pred_op = pred_node
                        .kind()
                        .as_physical()
                        .ok_or(CompileError::NotLowered(*pred))?;
                    if pred_node.successors().len() == 1 && !pred_op.is_terminal() {
                        membership.get(pred).copied()
                    } else {
                        None
                    }
                }
                _ => None,
            };

            match fused_into {
                Some(pipeline) => {
                    pipelines[pipeline.0].operators.push(id);
                    membership.insert(id, pipeline);
                }
                None => {
                    let pipeline = PipelineId(pipelines.len());
                    let mut upstream = SmallVec::new();
                    for pred in node.predecessors() {
                        let from = *membership.get(pred).ok_or(CompileError::NotLowered(*pred))?;
                        upstream.push(from);
                        pipelines[from.0].downstream.push(pipeline);
                    }
                    pipelines.push(Pipeline {
                        id: pipeline,
                        operators: vec![id],
                        upstream,
                        downstream: SmallVec::new(),
                    });
                    membership.insert(id, pipeline);
                }
            }
        }

        debug!(
            policy = self.policy.name(),
            operators = plan.node_count(),
            pipelines = pipelines.len(),
            "pipelined plan"
        );
        Ok(PipelineQueryPlan {
            plan,
            pipelines,
            membership,
        })
    }
}
