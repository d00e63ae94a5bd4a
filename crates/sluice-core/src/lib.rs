//! # Sluice Core
//!
//! A streaming query engine: logical operator plans are lowered to physical
//! operators, cut into pipelines, compiled per pipeline by a pluggable
//! backend and executed over pooled tuple buffers by a worker pool.
//!
//! This crate provides:
//! - **Types**: schemas, field types and the physical record codec
//! - **Memory**: tuple buffers, the buffer pool and row/columnar layouts
//! - **Plans**: the operator graph and a fluent query builder
//! - **Compiler**: lowering, pipelining policies and compiler backends
//! - **Runtime**: the node engine, tasks and pipeline stages
//! - **Windows**: slicing window aggregation, watermarks and windowed joins
//! - **Sinks**: CSV, JSON, text and in-memory result sinks with Arrow export
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice_core::config::EngineConfig;
//! use sluice_core::expr::{col, lit};
//! use sluice_core::plan::QueryBuilder;
//! use sluice_core::runtime::NodeEngine;
//! use sluice_core::sink::{FormatKind, SinkDescriptor};
//! use sluice_core::types::{DataType, Field, Schema, Value};
//!
//! # fn main() -> sluice_core::Result<()> {
//! let engine = NodeEngine::new(EngineConfig::default())?;
//! let schema = Arc::new(Schema::new(vec![
//!     Field::new("id", DataType::uint32()),
//!     Field::new("speed", DataType::int32()),
//! ])?);
//! let plan = QueryBuilder::from_source(engine.ids(), "cars", schema)
//!     .filter(col("speed").gt(lit(50)))
//!     .sink(SinkDescriptor::print(FormatKind::Csv))
//!     .build()?;
//! let id = engine.deploy(&engine.compile(plan)?)?;
//! engine.start(id)?;
//! engine
//!     .query(id)?
//!     .submit_records("cars", &[vec![Value::UInt(1), Value::Int(80)]])?;
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod compiler;
pub mod config;
pub mod expr;
pub mod memory;
pub mod plan;
pub mod runtime;
pub mod sink;
pub mod types;
pub mod window;

// Re-export key types
pub use compiler::{CompiledQuery, QueryCompiler};
pub use config::EngineConfig;
pub use memory::{BufferManager, TupleBuffer};
pub use plan::{QueryBuilder, QueryPlan};
pub use runtime::{ExecutableQueryPlan, NodeEngine, QueryStatus};

/// Result type for sluice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sluice-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Schema and type errors
    #[error("Type error: {0}")]
    Type(#[from] types::TypeError),

    /// Buffer pool and layout errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] memory::BufferError),

    /// Plan construction errors
    #[error("Plan error: {0}")]
    Plan(#[from] plan::PlanError),

    /// Compilation errors
    #[error("Compile error: {0}")]
    Compile(#[from] compiler::CompileError),

    /// Deployment and execution errors
    #[error("Execution error: {0}")]
    Execution(#[from] runtime::ExecutionError),

    /// Window and join definition errors
    #[error("Window error: {0}")]
    Window(#[from] window::WindowError),

    /// Expression evaluation errors
    #[error("Evaluation error: {0}")]
    Eval(#[from] expr::EvalError),

    /// Sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] sink::SinkError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}
