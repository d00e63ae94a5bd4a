//! Executable pipeline stages.
//!
//! Every pipeline of a deployed query runs exactly one stage:
//!
//! | Pipeline head                   | Stage              |
//! |---------------------------------|--------------------|
//! | Scan, stateless op, Multiplex,  | [`CompiledStage`]  |
//! | WindowSink, JoinSink            |                    |
//! | SlicePreAggregation             | [`BuildStage`] over a window handler |
//! | JoinBuild                       | [`BuildStage`] over one join side |
//! | Sink                            | [`SinkStage`]      |

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::context::PipelineExecutionContext;
use super::ExecutionError;
use crate::compiler::{PipelineId, StageFn, WatermarkProbe};
use crate::memory::{now_millis, BufferError, MemoryLayout, TupleBuffer};
use crate::plan::OperatorId;
use crate::sink::SinkFormat;
use crate::types::{SchemaRef, Value};
use crate::window::{
    HandOff, JoinOperatorHandler, JoinSide, JoinStore, TriggerOutput, TriggerPolicy,
    WindowOperatorHandler, WindowStore,
};

/// Per-pipeline execution logic.
///
/// Stages are shared by all workers; `execute` may run concurrently for
/// different buffers. State that must not be shared lives in the stores of
/// the executing [`WorkerContext`](super::WorkerContext).
pub trait ExecutablePipelineStage: Send + Sync {
    /// Short stage name for logs.
    fn name(&self) -> &'static str;

    /// Called once when the query is deployed.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if the stage cannot start; deployment
    /// fails with it.
    fn setup(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Processes one input buffer arriving on `port`.
    ///
    /// Every call emits at least one buffer downstream (a progress-only
    /// control buffer if nothing else), even when it fails part way, so
    /// downstream watermarks never stall on a bad buffer.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExecutionError`] raised by a record.
    fn execute(
        &self,
        input: &TupleBuffer,
        port: usize,
        ctx: &PipelineExecutionContext<'_>,
    ) -> Result<(), ExecutionError>;

    /// Hands this worker's share of the stage state over, as scheduled by
    /// [`PipelineExecutionContext::hand_off_all`].
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if emitting results fails.
    fn hand_off(&self, _ctx: &PipelineExecutionContext<'_>) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Periodic hook for time-based triggers.
    ///
    /// Runs on the timer thread, which owns no stores: the hook may only
    /// schedule hand-offs.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if the trigger cannot be scheduled.
    fn trigger(&self, _ctx: &PipelineExecutionContext<'_>) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// How often [`trigger`](Self::trigger) should run; `None` disables it.
    fn trigger_period(&self) -> Option<Duration> {
        None
    }

    /// Called once when the query stops or finishes.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if buffered output cannot be flushed.
    fn stop(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

// ── Chunked output ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct OpenSequence {
    emitted: u32,
    inputs_done: u32,
    last_input: Option<u32>,
}

/// Numbers output chunks when one input sequence arrives in several chunks.
///
/// Outputs of all input chunks share one numbering, and only the output
/// written after the last input chunk completed carries `last_chunk`.
#[derive(Debug, Default)]
struct ChunkSequencer {
    open: Mutex<FxHashMap<(u64, u64), OpenSequence>>,
}

impl ChunkSequencer {
    fn next_chunk(&self, key: (u64, u64)) -> u32 {
        let mut open = self.open.lock();
        let entry = open.entry(key).or_default();
        let chunk = entry.emitted;
        entry.emitted += 1;
        chunk
    }

    /// Marks one input chunk done. Returns the number for the task's final
    /// output and whether it completes the sequence.
    fn finish_input(&self, key: (u64, u64), input_chunk: u32, input_last: bool) -> (u32, bool) {
        let mut open = self.open.lock();
        let entry = open.entry(key).or_default();
        entry.inputs_done += 1;
        if input_last {
            entry.last_input = Some(input_chunk);
        }
        let chunk = entry.emitted;
        entry.emitted += 1;
        let complete = entry.last_input.is_some_and(|last| entry.inputs_done > last);
        if complete {
            open.remove(&key);
        }
        (chunk, complete)
    }
}

enum Numbering<'s> {
    Local(u32),
    Shared {
        sequencer: &'s ChunkSequencer,
        input_chunk: u32,
        input_last: bool,
    },
}

/// Writes records into output buffers, emitting each as soon as it is full.
struct ChunkWriter<'c, 'a> {
    ctx: &'c PipelineExecutionContext<'a>,
    layout: &'c MemoryLayout,
    origin: u64,
    sequence: u64,
    watermark: i64,
    created: i64,
    current: Option<TupleBuffer>,
    numbering: Numbering<'c>,
}

impl<'c, 'a> ChunkWriter<'c, 'a> {
    /// Writer for a fresh sequence produced by this stage.
    fn fresh(
        ctx: &'c PipelineExecutionContext<'a>,
        layout: &'c MemoryLayout,
        origin: OperatorId,
        output: &TriggerOutput,
    ) -> Self {
        Self {
            ctx,
            layout,
            origin: origin.0,
            sequence: output.sequence,
            watermark: output.watermark,
            created: now_millis(),
            current: None,
            numbering: Numbering::Local(0),
        }
    }

    /// Writer continuing the sequence of `input`.
    fn continuing(
        ctx: &'c PipelineExecutionContext<'a>,
        layout: &'c MemoryLayout,
        sequencer: &'c ChunkSequencer,
        input: &TupleBuffer,
    ) -> Self {
        let header = input.header();
        let numbering = if header.chunk_number == 0 && header.last_chunk {
            Numbering::Local(0)
        } else {
            Numbering::Shared {
                sequencer,
                input_chunk: header.chunk_number,
                input_last: header.last_chunk,
            }
        };
        Self {
            ctx,
            layout,
            origin: header.origin_id,
            sequence: header.sequence_number,
            watermark: header.watermark,
            created: header.creation_timestamp,
            current: None,
            numbering,
        }
    }

    fn push(&mut self, record: &[Value]) -> Result<(), ExecutionError> {
        let mut buffer = match self.current.take() {
            Some(buffer) => buffer,
            None => self.ctx.allocate_tuple_buffer()?,
        };
        let pushed = self.layout.push_record(&mut buffer, record);
        let full = self.layout.is_full(&buffer);
        self.current = Some(buffer);
        pushed?;
        if full {
            let chunk = match &mut self.numbering {
                Numbering::Local(next) => {
                    *next += 1;
                    *next - 1
                }
                Numbering::Shared { sequencer, .. } => {
                    sequencer.next_chunk((self.origin, self.sequence))
                }
            };
            self.emit(chunk, false);
        }
        Ok(())
    }

    fn raise_watermark(&mut self, watermark: i64) {
        self.watermark = self.watermark.max(watermark);
    }

    fn emit(&mut self, chunk: u32, last: bool) {
        let mut buffer = self.current.take().unwrap_or_else(TupleBuffer::control);
        let header = buffer.header_mut();
        header.origin_id = self.origin;
        header.sequence_number = self.sequence;
        header.chunk_number = chunk;
        header.last_chunk = last;
        header.watermark = self.watermark;
        header.creation_timestamp = self.created;
        self.ctx.emit_buffer(buffer);
    }

    /// Emits the final chunk. Must run even after a failed push.
    fn finish(mut self) {
        match self.numbering {
            Numbering::Local(next) => self.emit(next, true),
            Numbering::Shared {
                sequencer,
                input_chunk,
                input_last,
            } => {
                let key = (self.origin, self.sequence);
                let (chunk, complete) = sequencer.finish_input(key, input_chunk, input_last);
                self.emit(chunk, complete);
            }
        }
    }
}

// ── Compiled chains ────────────────────────────────────────────────────

/// Runs the backend-compiled record chain of a pipeline.
///
/// Each input port has its own layout: the inputs of a multiplex may differ
/// in width, and records are widened to the output schema on write.
pub struct CompiledStage {
    pipeline: PipelineId,
    inputs: Vec<MemoryLayout>,
    output: MemoryLayout,
    function: StageFn,
    sequencer: ChunkSequencer,
}

impl CompiledStage {
    /// Creates a stage reading port `i` records with `inputs[i]`.
    #[must_use]
    pub fn new(
        pipeline: PipelineId,
        inputs: Vec<MemoryLayout>,
        output: MemoryLayout,
        function: StageFn,
    ) -> Self {
        Self {
            pipeline,
            inputs,
            output,
            function,
            sequencer: ChunkSequencer::default(),
        }
    }

    fn process(
        &self,
        layout: &MemoryLayout,
        input: &TupleBuffer,
        writer: &mut ChunkWriter<'_, '_>,
    ) -> Result<(), ExecutionError> {
        let mut probe = WatermarkProbe::new();
        let mut record = Vec::with_capacity(layout.schema().len());
        for index in 0..input.number_of_tuples() {
            layout.read_record_into(input, index, &mut record)?;
            let keep = (self.function)(&mut record, &mut probe).map_err(|source| {
                ExecutionError::Eval {
                    pipeline: self.pipeline,
                    source,
                }
            })?;
            if keep {
                writer.push(&record)?;
            }
        }
        if let Some(candidate) = probe.candidate() {
            writer.raise_watermark(candidate);
        }
        Ok(())
    }
}

impl ExecutablePipelineStage for CompiledStage {
    fn name(&self) -> &'static str {
        "compiled"
    }

    fn execute(
        &self,
        input: &TupleBuffer,
        port: usize,
        ctx: &PipelineExecutionContext<'_>,
    ) -> Result<(), ExecutionError> {
        let mut writer = ChunkWriter::continuing(ctx, &self.output, &self.sequencer, input);
        let result = match self.inputs.get(port) {
            Some(layout) => self.process(layout, input, &mut writer),
            None => Err(ExecutionError::Malformed {
                pipeline: self.pipeline,
                reason: format!("port {port} out of range ({} ports)", self.inputs.len()),
            }),
        };
        writer.finish();
        result
    }
}

impl std::fmt::Debug for CompiledStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledStage")
            .field("pipeline", &self.pipeline)
            .field("ports", &self.inputs.len())
            .field("output", &self.output.schema().to_string())
            .finish_non_exhaustive()
    }
}

// ── Window and join builds ─────────────────────────────────────────────

/// Shared operator state fed by a [`BuildStage`].
pub trait BuildHandler: Send + Sync {
    /// What each worker inserts into.
    type Store: Default + Send + 'static;

    /// Handler id; the origin of the emitted results.
    fn id(&self) -> OperatorId;

    /// Trigger policy of the definition.
    fn trigger_policy(&self) -> TriggerPolicy;

    /// Inserts a buffer into the executing worker's store.
    ///
    /// # Errors
    ///
    /// Returns the first record that failed to decode.
    fn insert(
        &self,
        store: &mut Self::Store,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
    ) -> Result<(), BufferError>;

    /// Applies the trigger policy after an insert. Returns `true` if a
    /// hand-off round began.
    fn round_due(&self) -> bool;

    /// Begins a round if the close threshold advanced.
    fn begin_round(&self) -> bool;

    /// Hands the closed part of `store` to the coordinator.
    fn hand_off(&self, store: &mut Self::Store) -> HandOff;
}

impl<T: BuildHandler + ?Sized> BuildHandler for Arc<T> {
    type Store = T::Store;

    fn id(&self) -> OperatorId {
        (**self).id()
    }

    fn trigger_policy(&self) -> TriggerPolicy {
        (**self).trigger_policy()
    }

    fn insert(
        &self,
        store: &mut Self::Store,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
    ) -> Result<(), BufferError> {
        (**self).insert(store, layout, buffer)
    }

    fn round_due(&self) -> bool {
        (**self).round_due()
    }

    fn begin_round(&self) -> bool {
        (**self).begin_round()
    }

    fn hand_off(&self, store: &mut Self::Store) -> HandOff {
        (**self).hand_off(store)
    }
}

impl BuildHandler for WindowOperatorHandler {
    type Store = WindowStore;

    fn id(&self) -> OperatorId {
        WindowOperatorHandler::id(self)
    }

    fn trigger_policy(&self) -> TriggerPolicy {
        self.definition().trigger_policy
    }

    fn insert(
        &self,
        store: &mut WindowStore,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
    ) -> Result<(), BufferError> {
        self.insert_buffer(store, layout, buffer)
    }

    fn round_due(&self) -> bool {
        WindowOperatorHandler::round_due(self)
    }

    fn begin_round(&self) -> bool {
        WindowOperatorHandler::begin_round(self)
    }

    fn hand_off(&self, store: &mut WindowStore) -> HandOff {
        WindowOperatorHandler::hand_off(self, store)
    }
}

/// One input side of a join handler.
///
/// Both sides share the worker's [`JoinStore`].
#[derive(Debug, Clone)]
pub struct JoinSideHandler {
    handler: Arc<JoinOperatorHandler>,
    side: JoinSide,
}

impl JoinSideHandler {
    /// Feeds `side` of `handler`.
    #[must_use]
    pub fn new(handler: Arc<JoinOperatorHandler>, side: JoinSide) -> Self {
        Self { handler, side }
    }
}

impl BuildHandler for JoinSideHandler {
    type Store = JoinStore;

    fn id(&self) -> OperatorId {
        self.handler.id()
    }

    fn trigger_policy(&self) -> TriggerPolicy {
        self.handler.definition().trigger_policy
    }

    fn insert(
        &self,
        store: &mut JoinStore,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
    ) -> Result<(), BufferError> {
        self.handler.insert_buffer(store, self.side, layout, buffer)
    }

    fn round_due(&self) -> bool {
        self.handler.round_due()
    }

    fn begin_round(&self) -> bool {
        self.handler.begin_round()
    }

    fn hand_off(&self, store: &mut JoinStore) -> HandOff {
        self.handler.hand_off(store)
    }
}

/// Feeds a window or join handler and emits what its rounds produce.
///
/// Inserts go to the store of the executing worker. When a round begins,
/// every worker receives a hand-off task; the one completing the round
/// emits the results downstream before the next round's hand-offs are
/// scheduled.
pub struct BuildStage<H> {
    handler: H,
    input: MemoryLayout,
    output: MemoryLayout,
}

impl<H: BuildHandler> BuildStage<H> {
    /// Creates a stage inserting `input` records into `handler`.
    #[must_use]
    pub fn new(handler: H, input: MemoryLayout, output: MemoryLayout) -> Self {
        Self {
            handler,
            input,
            output,
        }
    }

    fn emit(
        &self,
        ctx: &PipelineExecutionContext<'_>,
        output: &TriggerOutput,
    ) -> Result<(), ExecutionError> {
        let mut writer = ChunkWriter::fresh(ctx, &self.output, self.handler.id(), output);
        let result = output.records.iter().try_for_each(|record| writer.push(record));
        writer.finish();
        result
    }
}

impl<H: BuildHandler> ExecutablePipelineStage for BuildStage<H> {
    fn name(&self) -> &'static str {
        "build"
    }

    fn execute(
        &self,
        input: &TupleBuffer,
        _port: usize,
        ctx: &PipelineExecutionContext<'_>,
    ) -> Result<(), ExecutionError> {
        let inserted = ctx
            .worker()
            .with_store(ctx.query_id(), self.handler.id(), |store: &mut H::Store| {
                self.handler.insert(store, &self.input, input)
            });
        if self.handler.round_due() {
            ctx.hand_off_all();
        }
        Ok(inserted?)
    }

    fn hand_off(&self, ctx: &PipelineExecutionContext<'_>) -> Result<(), ExecutionError> {
        let handed = ctx
            .worker()
            .with_store(ctx.query_id(), self.handler.id(), |store: &mut H::Store| {
                self.handler.hand_off(store)
            });
        let result = match &handed.output {
            Some(output) => self.emit(ctx, output),
            None => Ok(()),
        };
        if handed.next_round {
            ctx.hand_off_all();
        }
        result
    }

    fn trigger(&self, ctx: &PipelineExecutionContext<'_>) -> Result<(), ExecutionError> {
        if self.handler.begin_round() {
            ctx.hand_off_all();
        }
        Ok(())
    }

    fn trigger_period(&self) -> Option<Duration> {
        match self.handler.trigger_policy() {
            TriggerPolicy::OnTime { trigger_time_ms } => {
                Some(Duration::from_millis(trigger_time_ms.max(1)))
            }
            _ => None,
        }
    }
}

impl<H> std::fmt::Debug for BuildStage<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildStage")
            .field("input", &self.input.schema().to_string())
            .field("output", &self.output.schema().to_string())
            .finish_non_exhaustive()
    }
}

// ── Sinks ──────────────────────────────────────────────────────────────

/// Writes every data buffer to an opened sink format.
pub struct SinkStage {
    pipeline: PipelineId,
    layout: MemoryLayout,
    schema: SchemaRef,
    format: Mutex<Box<dyn SinkFormat>>,
}

impl SinkStage {
    /// Creates a stage writing `layout` records to `format`.
    #[must_use]
    pub fn new(pipeline: PipelineId, layout: MemoryLayout, format: Box<dyn SinkFormat>) -> Self {
        Self {
            pipeline,
            schema: Arc::clone(layout.schema()),
            layout,
            format: Mutex::new(format),
        }
    }

    fn sink_error(&self, source: crate::sink::SinkError) -> ExecutionError {
        ExecutionError::Sink {
            pipeline: self.pipeline,
            source,
        }
    }
}

impl ExecutablePipelineStage for SinkStage {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn setup(&self) -> Result<(), ExecutionError> {
        self.format
            .lock()
            .write_schema(&self.schema)
            .map_err(|e| self.sink_error(e))?;
        Ok(())
    }

    fn execute(
        &self,
        input: &TupleBuffer,
        _port: usize,
        _ctx: &PipelineExecutionContext<'_>,
    ) -> Result<(), ExecutionError> {
        if input.is_empty() {
            return Ok(());
        }
        self.format
            .lock()
            .write_data(input, &self.layout)
            .map_err(|e| self.sink_error(e))?;
        Ok(())
    }

    fn stop(&self) -> Result<(), ExecutionError> {
        self.format.lock().flush().map_err(|e| self.sink_error(e))
    }
}

impl std::fmt::Debug for SinkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkStage")
            .field("pipeline", &self.pipeline)
            .field("format", &self.format.lock().name())
            .finish_non_exhaustive()
    }
}
