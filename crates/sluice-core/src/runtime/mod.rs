//! Query execution.
//!
//! A [`CompiledQuery`](crate::compiler::CompiledQuery) becomes an
//! [`ExecutableQueryPlan`]: one [`ExecutablePipelineStage`] per pipeline,
//! wired to its downstream pipelines. Submitted buffers become [`Task`]s
//! executed by a [`TaskDispatcher`]; downstream pipelines run depth-first
//! inside the same task.
//!
//! ```text
//! submit ─► Task(scan pipeline) ─► stage.execute ─► emit_buffer ─► next.execute ─► …
//!                                                   (same worker, same task)
//! ```
//!
//! Every task emits at least one buffer per successor, carrying the input's
//! origin and sequence number, so window handlers downstream can always
//! close the sequence and advance their watermark.
//!
//! Window and join stages keep their state per worker. Once the watermark
//! allows a trigger, the stage schedules a hand-off task on every worker;
//! the last one to hand its state over emits the results.
//!
//! A task holds at most one buffer per pipeline on its path. The engine
//! keeps that many buffers per worker out of reach of sources, so stages
//! blocking on the pool always make progress.
//!
//! # Components
//!
//! - [`NodeEngine`]: buffer pool, dispatcher and deployed queries
//! - [`ExecutableQueryPlan`]: lifecycle ([`QueryStatus`]) and data ingress
//! - [`WorkerPool`] / [`InlineDispatcher`]: task execution
//! - [`PipelineExecutionContext`]: what a stage may do while running

mod context;
mod engine;
mod error;
mod query;
mod stage;
mod task;

#[cfg(test)]
mod tests;

pub use context::{PipelineExecutionContext, WorkerContext};
pub use engine::NodeEngine;
pub use error::{ExecutionError, QueryStatus};
pub use query::{ExecutableQueryPlan, QueryResources, QueryStatistics};
pub use stage::{
    BuildHandler, BuildStage, CompiledStage, ExecutablePipelineStage, JoinSideHandler, SinkStage,
};
pub use task::{InlineDispatcher, Task, TaskDispatcher, WorkerPool};
