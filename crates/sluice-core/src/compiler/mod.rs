//! Query compilation: lowering, pipelining and backend code generation.
//!
//! ```text
//! logical QueryPlan ─► PhysicalOperatorProvider ─► physical QueryPlan
//!                  ─► PipeliningPhase ─► PipelineQueryPlan
//!                  ─► CompilerBackend (per pipeline) ─► CompiledQuery
//! ```
//!
//! # Components
//!
//! - [`lowering`]: [`PhysicalOperatorProvider`] rewrites logical operators
//! - [`pipelining`]: [`PipeliningPhase`] with [`AlwaysBreakPolicy`] and
//!   [`FuseIfPossiblePolicy`]
//! - [`ir`]: [`PipelineIr`], the backend input
//! - [`backend`]: [`CompilerBackend`] with [`InterpreterBackend`] and
//!   [`ClosureBackend`]

pub mod backend;
pub mod ir;
pub mod lowering;
pub mod pipelining;

mod error;


use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::info;

pub use backend::{
    ClosureBackend, CompilerBackend, Executable, InterpreterBackend, StageFn, WatermarkProbe,
    EXECUTE,
};
pub use error::CompileError;
pub use ir::{IrStep, PipelineIr, WatermarkSource};
pub use lowering::PhysicalOperatorProvider;
pub use pipelining::{
    AlwaysBreakPolicy, BreakerPolicy, FuseIfPossiblePolicy, Pipeline, PipelineId,
    PipelineQueryPlan, PipeliningPhase,
};

use crate::config::{BackendKind, CompilerConfig, PipeliningKind};
use crate::plan::{IdGenerator, QueryPlan};

/// Compiled pipeline: its IR and the backend's executable, if it runs a
/// record chain.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    /// Backend input.
    pub ir: PipelineIr,
    /// Backend output.
    pub executable: Executable,
}

/// Result of [`QueryCompiler::compile`], ready to deploy.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    plan: PipelineQueryPlan,
    compiled: FxHashMap<PipelineId, CompiledPipeline>,
    backend: &'static str,
    policy: &'static str,
}

impl CompiledQuery {
    /// The pipelined physical plan.
    #[must_use]
    pub fn pipelines(&self) -> &PipelineQueryPlan {
        &self.plan
    }

    /// Compiled chain of `pipeline`; `None` for consuming pipelines.
    #[must_use]
    pub fn compiled(&self, pipeline: PipelineId) -> Option<&CompiledPipeline> {
        self.compiled.get(&pipeline)
    }

    /// Backend that compiled the chains.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Breaker policy used for pipelining.
    #[must_use]
    pub fn policy(&self) -> &'static str {
        self.policy
    }
}

/// Runs lowering, pipelining and per-pipeline backend compilation.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    provider: PhysicalOperatorProvider,
    pipelining: PipeliningPhase,
    backend: Arc<dyn CompilerBackend>,
}

impl QueryCompiler {
    /// Creates a compiler with an explicit policy and backend.
    #[must_use]
    pub fn new(
        ids: &Arc<IdGenerator>,
        policy: Arc<dyn BreakerPolicy>,
        backend: Arc<dyn CompilerBackend>,
    ) -> Self {
        Self {
            provider: PhysicalOperatorProvider::new(ids),
            pipelining: PipeliningPhase::new(policy),
            backend,
        }
    }

    /// Creates a compiler from configuration.
    #[must_use]
    pub fn from_config(ids: &Arc<IdGenerator>, config: &CompilerConfig) -> Self {
        let policy: Arc<dyn BreakerPolicy> = match config.pipelining {
            PipeliningKind::FuseIfPossible => Arc::new(FuseIfPossiblePolicy),
            PipeliningKind::AlwaysBreak => Arc::new(AlwaysBreakPolicy),
        };
        let backend: Arc<dyn CompilerBackend> = match config.backend {
            BackendKind::Interpreter => Arc::new(InterpreterBackend),
            BackendKind::Closure => Arc::new(ClosureBackend),
        };
        Self::new(ids, policy, backend)
    }

    /// Compiles a logical (or already lowered) plan.
    ///
    /// # Errors
    ///
    /// Returns the first [`CompileError`] of any phase.
    pub fn compile(&self, mut plan: QueryPlan) -> Result<CompiledQuery, CompileError> {
        self.provider.lower_plan(&mut plan)?;
        let plan = self.pipelining.apply(plan)?;

        let mut compiled = FxHashMap::default();
        for pipeline in plan.pipelines() {
            if let Some(ir) = PipelineIr::build(plan.plan(), pipeline)? {
                let executable = self.backend.compile(&ir)?;
                tracing::debug!(backend = self.backend.name(), ir = %ir, "compiled pipeline");
                compiled.insert(pipeline.id(), CompiledPipeline { ir, executable });
            }
        }

        info!(
            operators = plan.plan().node_count(),
            pipelines = plan.pipelines().len(),
            policy = self.pipelining.policy().name(),
            backend = self.backend.name(),
            "compiled query"
        );
        Ok(CompiledQuery {
            compiled,
            backend: self.backend.name(),
            policy: self.pipelining.policy().name(),
            plan,
        })
    }
}
