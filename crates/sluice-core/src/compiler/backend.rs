//! Compiler backends.
//!
//! A backend turns a [`PipelineIr`] into an [`Executable`] whose entry
//! points run the chain on one decoded record. Everything above this module
//! only sees the [`CompilerBackend`] trait, so backends are interchangeable
//! and must agree on results record for record.

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;

use super::{CompileError, IrStep, PipelineIr, WatermarkSource};
use crate::expr::{apply_binary, apply_unary, BoundExpr, EvalError};
use crate::memory::now_millis;
use crate::types::Value;

/// Name of the per-record entry point every executable exports.
pub const EXECUTE: &str = "execute";

/// Collects the watermark candidate of the records run through a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatermarkProbe {
    candidate: Option<i64>,
}

impl WatermarkProbe {
    /// Creates an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the candidate to at least `watermark`.
    pub fn observe(&mut self, watermark: i64) {
        self.candidate = Some(self.candidate.map_or(watermark, |c| c.max(watermark)));
    }

    /// Highest watermark observed, if any record reached a watermark step.
    #[must_use]
    pub fn candidate(&self) -> Option<i64> {
        self.candidate
    }
}

/// Compiled chain entry point.
///
/// Transforms the record in place and returns `Ok(false)` if a filter
/// dropped it.
pub type StageFn =
    Arc<dyn Fn(&mut Vec<Value>, &mut WatermarkProbe) -> Result<bool, EvalError> + Send + Sync>;

/// Output of a backend: named entry points.
#[derive(Clone)]
pub struct Executable {
    backend: &'static str,
    functions: FxHashMap<String, StageFn>,
}

impl Executable {
    /// Creates an executable exporting `function` as [`EXECUTE`].
    #[must_use]
    pub fn new(backend: &'static str, function: StageFn) -> Self {
        let mut functions = FxHashMap::default();
        functions.insert(EXECUTE.to_string(), function);
        Self { backend, functions }
    }

    /// Looks up an entry point by name.
    #[must_use]
    pub fn invocable(&self, name: &str) -> Option<StageFn> {
        self.functions.get(name).cloned()
    }

    /// Backend that produced the executable.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort_unstable();
        f.debug_struct("Executable")
            .field("backend", &self.backend)
            .field("functions", &names)
            .finish()
    }
}

/// Strategy that compiles pipeline IR into executables.
pub trait CompilerBackend: Send + Sync + fmt::Debug {
    /// Backend name for logs and errors.
    fn name(&self) -> &'static str;

    /// Compiles one pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::Backend`] if the IR cannot be compiled.
    fn compile(&self, ir: &PipelineIr) -> Result<Executable, CompileError>;
}

// ── Shared step semantics ───────────────────────────────────────────

fn filter_result(value: &Value) -> Result<bool, EvalError> {
    value.as_bool().ok_or_else(|| EvalError::TypeMismatch {
        op: "filter".into(),
        left: value.to_string(),
        right: "Boolean".into(),
    })
}

fn assign(record: &mut Vec<Value>, index: usize, value: Value) -> Result<(), EvalError> {
    match record.len().cmp(&index) {
        std::cmp::Ordering::Greater => record[index] = value,
        std::cmp::Ordering::Equal => record.push(value),
        std::cmp::Ordering::Less => return Err(EvalError::MissingColumn(index)),
    }
    Ok(())
}

fn project(record: &mut Vec<Value>, indices: &[usize]) -> Result<(), EvalError> {
    let projected = indices
        .iter()
        .map(|i| record.get(*i).cloned().ok_or(EvalError::MissingColumn(*i)))
        .collect::<Result<Vec<_>, _>>()?;
    *record = projected;
    Ok(())
}

fn observe(
    record: &[Value],
    source: WatermarkSource,
    probe: &mut WatermarkProbe,
) -> Result<(), EvalError> {
    match source {
        WatermarkSource::EventTime { index, delay_ms } => {
            let value = record.get(index).ok_or(EvalError::MissingColumn(index))?;
            let ts = value.as_i64().ok_or_else(|| EvalError::TypeMismatch {
                op: "watermark".into(),
                left: value.to_string(),
                right: "Integer".into(),
            })?;
            probe.observe(ts.saturating_sub(delay_ms));
        }
        WatermarkSource::Ingestion => probe.observe(now_millis()),
    }
    Ok(())
}

// ── Interpreter ─────────────────────────────────────────────────────

/// Walks the IR for every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterBackend;

impl InterpreterBackend {
    fn run(
        steps: &[IrStep],
        record: &mut Vec<Value>,
        probe: &mut WatermarkProbe,
    ) -> Result<bool, EvalError> {
        for step in steps {
            match step {
                IrStep::Filter { predicate, .. } => {
                    if !filter_result(&predicate.evaluate(record)?)? {
                        return Ok(false);
                    }
                }
                IrStep::Map { index, expr, .. } => {
                    let value = expr.evaluate(record)?;
                    assign(record, *index, value)?;
                }
                IrStep::Project { indices, .. } => project(record, indices)?,
                IrStep::AssignWatermark { source, .. } => observe(record, *source, probe)?,
            }
        }
        Ok(true)
    }
}

impl CompilerBackend for InterpreterBackend {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn compile(&self, ir: &PipelineIr) -> Result<Executable, CompileError> {
        let steps: Arc<[IrStep]> = ir.steps.clone().into();
        let function: StageFn =
            Arc::new(move |record: &mut Vec<Value>, probe: &mut WatermarkProbe| {
                Self::run(&steps, record, probe)
            });
        Ok(Executable::new(self.name(), function))
    }
}

// ── Closure compiler ────────────────────────────────────────────────

type ExprFn = Box<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;
type StepFn =
    Box<dyn Fn(&mut Vec<Value>, &mut WatermarkProbe) -> Result<bool, EvalError> + Send + Sync>;

/// Compiles every expression into nested closures once, so per-record
/// execution does no tree matching.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosureBackend;

impl ClosureBackend {
    fn compile_expr(expr: &BoundExpr) -> ExprFn {
        match expr {
            BoundExpr::Column(index) => {
                let index = *index;
                Box::new(move |record: &[Value]| {
                    record.get(index).cloned().ok_or(EvalError::MissingColumn(index))
                })
            }
            BoundExpr::Literal(value) => {
                let value = value.clone();
                Box::new(move |_: &[Value]| Ok(value.clone()))
            }
            BoundExpr::Binary { op, left, right } => {
                let (op, left, right) = (*op, Self::compile_expr(left), Self::compile_expr(right));
                Box::new(move |record: &[Value]| {
                    apply_binary(op, &left(record)?, &right(record)?)
                })
            }
            BoundExpr::Unary { op, expr } => {
                let (op, inner) = (*op, Self::compile_expr(expr));
                Box::new(move |record: &[Value]| apply_unary(op, &inner(record)?))
            }
        }
    }

    fn compile_step(step: &IrStep) -> StepFn {
        match step {
            IrStep::Filter { predicate, .. } => {
                let predicate = Self::compile_expr(predicate);
                Box::new(move |record: &mut Vec<Value>, _: &mut WatermarkProbe| {
                    filter_result(&predicate(record)?)
                })
            }
            IrStep::Map { index, expr, .. } => {
                let (index, expr) = (*index, Self::compile_expr(expr));
                Box::new(move |record: &mut Vec<Value>, _: &mut WatermarkProbe| {
                    let value = expr(record)?;
                    assign(record, index, value)?;
                    Ok(true)
                })
            }
            IrStep::Project { indices, .. } => {
                let indices = indices.clone();
                Box::new(move |record: &mut Vec<Value>, _: &mut WatermarkProbe| {
                    project(record, &indices).map(|()| true)
                })
            }
            IrStep::AssignWatermark { source, .. } => {
                let source = *source;
                Box::new(move |record: &mut Vec<Value>, probe: &mut WatermarkProbe| {
                    observe(record, source, probe).map(|()| true)
                })
            }
        }
    }
}

impl CompilerBackend for ClosureBackend {
    fn name(&self) -> &'static str {
        "closure"
    }

    fn compile(&self, ir: &PipelineIr) -> Result<Executable, CompileError> {
        let steps: Vec<StepFn> = ir.steps.iter().map(Self::compile_step).collect();
        let function: StageFn =
            Arc::new(move |record: &mut Vec<Value>, probe: &mut WatermarkProbe| {
                for step in &steps {
                    if !step(record, probe)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            });
        Ok(Executable::new(self.name(), function))
    }
}
