//! Deployed queries: stage construction, lifecycle and data ingress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use super::context::{PipelineExecutionContext, WorkerContext};
use super::stage::{BuildStage, CompiledStage, ExecutablePipelineStage, JoinSideHandler, SinkStage};
use super::task::{self, Task, TaskDispatcher};
use super::{ExecutionError, QueryStatus};
use crate::compiler::{CompileError, CompiledQuery, PipelineId, EXECUTE};
use crate::memory::{BufferManager, LayoutKind, MemoryLayout, SharedBuffer, TupleBuffer};
use crate::plan::{OperatorId, OperatorNode, PhysicalOperator, PlanError, QueryId, QueryPlan};
use crate::types::{SchemaRef, Value};
use crate::window::{JoinOperatorHandler, JoinSide, WindowOperatorHandler};

/// A pipeline bound to its stage and the pipelines it feeds.
pub(crate) struct ExecutablePipeline {
    id: PipelineId,
    stage: Box<dyn ExecutablePipelineStage>,
    /// `(pipeline, port)` pairs receiving every emitted buffer.
    successors: SmallVec<[(PipelineId, usize); 2]>,
}

impl ExecutablePipeline {
    pub(crate) fn id(&self) -> PipelineId {
        self.id
    }

    pub(crate) fn successors(&self) -> &[(PipelineId, usize)] {
        &self.successors
    }
}

struct SourceEntry {
    pipeline: PipelineId,
    origin: u64,
    layout: MemoryLayout,
    next_sequence: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    submitted: AtomicU64,
}

/// Task counters of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryStatistics {
    /// Tasks that completed without error.
    pub tasks_processed: u64,
    /// Tasks whose stage returned an error or panicked.
    pub tasks_failed: u64,
    /// Tasks dropped because the query was no longer running.
    pub tasks_discarded: u64,
    /// Buffers accepted from sources.
    pub buffers_submitted: u64,
}

struct TriggerTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// Resources a query borrows from its engine.
#[derive(Debug, Clone)]
pub struct QueryResources {
    /// Pool every stage allocates from.
    pub buffers: BufferManager,
    /// Executes the query's tasks.
    pub dispatcher: Arc<dyn TaskDispatcher>,
    /// Record layout of every buffer.
    pub layout: LayoutKind,
}

pub(crate) struct QueryInner {
    id: QueryId,
    status: Mutex<QueryStatus>,
    pipelines: Vec<ExecutablePipeline>,
    sources: FxHashMap<String, SourceEntry>,
    buffers: BufferManager,
    dispatcher: Arc<dyn TaskDispatcher>,
    pending: Mutex<usize>,
    idle: Condvar,
    counters: Counters,
    timer: Mutex<Option<TriggerTimer>>,
    windows: FxHashMap<OperatorId, Arc<WindowOperatorHandler>>,
    joins: FxHashMap<OperatorId, Arc<JoinOperatorHandler>>,
}

impl QueryInner {
    pub(crate) fn id(&self) -> QueryId {
        self.id
    }

    pub(crate) fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    fn status(&self) -> QueryStatus {
        *self.status.lock()
    }

    /// Schedules `buffer` for `pipeline`.
    pub(crate) fn dispatch(self: &Arc<Self>, pipeline: PipelineId, buffer: SharedBuffer, port: usize) {
        *self.pending.lock() += 1;
        self.dispatcher
            .dispatch(Task::buffer(Arc::clone(self), pipeline, buffer, port));
    }

    /// Schedules a hand-off of `pipeline` on every worker.
    pub(crate) fn dispatch_hand_offs(self: &Arc<Self>, pipeline: PipelineId) {
        let workers = self.dispatcher.worker_count();
        *self.pending.lock() += workers;
        for worker in 0..workers {
            self.dispatcher
                .dispatch_to(worker, Task::hand_off(Arc::clone(self), pipeline));
        }
    }

    /// Has every worker drop the stores of this query.
    fn dispatch_releases(self: &Arc<Self>) {
        let workers = self.dispatcher.worker_count();
        *self.pending.lock() += workers;
        for worker in 0..workers {
            self.dispatcher.dispatch_to(worker, Task::release(Arc::clone(self)));
        }
    }

    fn executable(&self, pipeline: PipelineId) -> Option<&ExecutablePipeline> {
        if self.status() != QueryStatus::Running {
            trace!(query = %self.id, %pipeline, "query not running, task discarded");
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let executable = self.pipelines.get(pipeline.0);
        if executable.is_none() {
            warn!(query = %self.id, %pipeline, "task for unknown pipeline");
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        executable
    }

    /// Runs `pipeline` on `buffer`, then its successors depth-first.
    pub(crate) fn run_stage(
        self: &Arc<Self>,
        pipeline: PipelineId,
        buffer: &TupleBuffer,
        port: usize,
        worker: &WorkerContext,
    ) {
        let Some(executable) = self.executable(pipeline) else {
            return;
        };
        let ctx = PipelineExecutionContext::new(self, executable, worker);
        let result = executable.stage.execute(buffer, port, &ctx);
        self.record(pipeline, result);
    }

    /// Hands the state `worker` holds for `pipeline` over.
    pub(crate) fn run_hand_off(self: &Arc<Self>, pipeline: PipelineId, worker: &WorkerContext) {
        let Some(executable) = self.executable(pipeline) else {
            return;
        };
        let ctx = PipelineExecutionContext::new(self, executable, worker);
        let result = executable.stage.hand_off(&ctx);
        self.record(pipeline, result);
    }

    fn record(&self, pipeline: PipelineId, result: Result<(), ExecutionError>) {
        match result {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(e, ExecutionError::Sink { .. }) {
                    error!(query = %self.id, %pipeline, error = %e, "sink failed");
                } else {
                    warn!(query = %self.id, %pipeline, error = %e, "task failed");
                }
            }
        }
    }

    pub(crate) fn task_panicked(&self, worker: &WorkerContext, message: &str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(query = %self.id, worker = worker.worker_id(), panic = message, "task panicked");
    }

    pub(crate) fn task_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn task_discarded(&self) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        self.task_done();
    }

    fn fire_triggers(self: &Arc<Self>) {
        if self.status() != QueryStatus::Running {
            return;
        }
        let worker = WorkerContext::new(0);
        for pipeline in &self.pipelines {
            if pipeline.stage.trigger_period().is_none() {
                continue;
            }
            // Triggers only schedule hand-offs; they touch no worker state.
            let ctx = PipelineExecutionContext::new(self, pipeline, &worker);
            if let Err(e) = pipeline.stage.trigger(&ctx) {
                warn!(query = %self.id, pipeline = %pipeline.id, error = %e, "timed trigger failed");
            }
        }
    }

    fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut pending, deadline).timed_out() {
                        return *pending == 0;
                    }
                }
                None => self.idle.wait(&mut pending),
            }
        }
        true
    }

    fn stop_timer(&self) {
        let Some(timer) = self.timer.lock().take() else {
            return;
        };
        let (stopped, wake) = &*timer.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if timer.handle.thread().id() != thread::current().id() {
            let _ = timer.handle.join();
        }
    }

    /// Releases worker stores and, unless called from a task, waits until
    /// every task of the query has completed.
    fn quiesce(self: &Arc<Self>) {
        self.dispatch_releases();
        if task::in_task() {
            return;
        }
        self.wait_idle(None);
    }

    /// Buffers one task may hold at once: one per pipeline on the longest
    /// path, except the last, which allocates none.
    pub(crate) fn buffer_demand(&self) -> usize {
        fn depth(pipelines: &[ExecutablePipeline], index: usize, memo: &mut [usize]) -> usize {
            if memo[index] == 0 {
                let deepest = pipelines[index]
                    .successors
                    .iter()
                    .filter(|(next, _)| next.0 < pipelines.len())
                    .map(|(next, _)| depth(pipelines, next.0, memo))
                    .max()
                    .unwrap_or(0);
                memo[index] = deepest + 1;
            }
            memo[index]
        }
        let mut memo = vec![0; self.pipelines.len()];
        let longest = (0..self.pipelines.len())
            .map(|index| depth(&self.pipelines, index, &mut memo))
            .max()
            .unwrap_or(0);
        longest.saturating_sub(1).max(1)
    }

    fn stop_stages(&self) -> Result<(), ExecutionError> {
        let mut first = None;
        for pipeline in &self.pipelines {
            if let Err(e) = pipeline.stage.stop() {
                warn!(query = %self.id, pipeline = %pipeline.id, error = %e, "stage failed to stop");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

// ── Construction ───────────────────────────────────────────────────────

fn node(plan: &QueryPlan, id: OperatorId) -> Result<&OperatorNode, ExecutionError> {
    plan.node(id)
        .ok_or_else(|| CompileError::from(PlanError::OperatorNotFound(id)).into())
}

fn physical(node: &OperatorNode) -> Result<&PhysicalOperator, ExecutionError> {
    node.kind()
        .as_physical()
        .ok_or_else(|| CompileError::NotLowered(node.id()).into())
}

fn first_input(node: &OperatorNode) -> Result<&SchemaRef, ExecutionError> {
    node.input_schemas().first().ok_or_else(|| {
        CompileError::from(PlanError::DisconnectedOperator {
            id: node.id(),
            name: node.name(),
            reason: "no upstream operator",
        })
        .into()
    })
}

/// Collects the origin ids whose buffers reach `id`.
///
/// Scans originate source buffers; window and join sinks re-originate
/// their results under the handler id.
fn collect_origins(plan: &QueryPlan, id: OperatorId, out: &mut Vec<u64>) -> Result<(), ExecutionError> {
    let node = node(plan, id)?;
    let origin = match physical(node)? {
        PhysicalOperator::Scan { .. } => Some(id.0),
        PhysicalOperator::WindowSink { handler, .. } | PhysicalOperator::JoinSink { handler, .. } => {
            Some(handler.0)
        }
        _ => None,
    };
    match origin {
        Some(origin) => {
            if !out.contains(&origin) {
                out.push(origin);
            }
        }
        None => {
            for pred in node.predecessors() {
                collect_origins(plan, *pred, out)?;
            }
        }
    }
    Ok(())
}

fn origins_before(plan: &QueryPlan, node: &OperatorNode) -> Result<Vec<u64>, ExecutionError> {
    let mut origins = Vec::new();
    for pred in node.predecessors() {
        collect_origins(plan, *pred, &mut origins)?;
    }
    Ok(origins)
}

type Handlers = (
    FxHashMap<OperatorId, Arc<WindowOperatorHandler>>,
    FxHashMap<OperatorId, Arc<JoinOperatorHandler>>,
);

fn build_handlers(plan: &QueryPlan, workers: usize) -> Result<Handlers, ExecutionError> {
    let mut windows = FxHashMap::default();
    let mut joins = FxHashMap::default();
    for node in plan.nodes() {
        match physical(node)? {
            PhysicalOperator::SlicePreAggregation { handler, definition } => {
                let origins = origins_before(plan, node)?;
                let window = WindowOperatorHandler::new(
                    *handler,
                    Arc::clone(definition),
                    first_input(node)?,
                    &origins,
                    workers,
                )
                .map_err(|source| ExecutionError::Window {
                    handler: *handler,
                    source,
                })?;
                debug!(handler = %handler, ?origins, "created window handler");
                windows.insert(*handler, Arc::new(window));
            }
            PhysicalOperator::JoinSink { handler, definition } => {
                let mut schemas: [Option<SchemaRef>; 2] = [None, None];
                let mut origins = Vec::new();
                for pred in node.predecessors() {
                    let build = self::node(plan, *pred)?;
                    let PhysicalOperator::JoinBuild { side, .. } = physical(build)? else {
                        continue;
                    };
                    let slot = match side {
                        JoinSide::Left => 0,
                        JoinSide::Right => 1,
                    };
                    schemas[slot] = Some(Arc::clone(first_input(build)?));
                    for input in build.predecessors() {
                        collect_origins(plan, *input, &mut origins)?;
                    }
                }
                let [Some(left), Some(right)] = schemas else {
                    return Err(CompileError::from(PlanError::DisconnectedOperator {
                        id: node.id(),
                        name: node.name(),
                        reason: "join needs a build operator per side",
                    })
                    .into());
                };
                let join = JoinOperatorHandler::new(
                    *handler,
                    Arc::clone(definition),
                    &left,
                    &right,
                    &origins,
                    workers,
                )
                .map_err(|source| ExecutionError::Window {
                    handler: *handler,
                    source,
                })?;
                debug!(handler = %handler, ?origins, "created join handler");
                joins.insert(*handler, Arc::new(join));
            }
            _ => {}
        }
    }
    Ok((windows, joins))
}

// ── Public handle ──────────────────────────────────────────────────────

/// A compiled query bound to engine resources.
///
/// Cloning yields another handle to the same query.
#[derive(Clone)]
pub struct ExecutableQueryPlan {
    inner: Arc<QueryInner>,
}

impl ExecutableQueryPlan {
    /// Builds the stages of every pipeline in `compiled`.
    ///
    /// Window and join handlers expect a hand-off from every dispatcher
    /// worker per trigger round; sinks are opened but see no schema until
    /// [`deploy`](Self::deploy).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Compile`] for an inconsistent plan,
    /// [`ExecutionError::Window`] for a handler that rejects its inputs,
    /// [`ExecutionError::Sink`] if a sink cannot be opened and
    /// [`ExecutionError::Malformed`] for two sources with the same name.
    pub fn new(
        query_id: QueryId,
        compiled: &CompiledQuery,
        resources: QueryResources,
    ) -> Result<Self, ExecutionError> {
        let pipelines = compiled.pipelines();
        let plan = pipelines.plan();
        let buffer_size = resources.buffers.buffer_size();
        let layout = |schema: &SchemaRef| -> Result<MemoryLayout, ExecutionError> {
            Ok(MemoryLayout::new(resources.layout, Arc::clone(schema), buffer_size)?)
        };

        let (windows, joins) = build_handlers(plan, resources.dispatcher.worker_count())?;

        let mut executables = Vec::with_capacity(pipelines.pipelines().len());
        let mut sources = FxHashMap::default();
        for (index, pipeline) in pipelines.pipelines().iter().enumerate() {
            let id = pipeline.id();
            if id.0 != index {
                return Err(ExecutionError::Malformed {
                    pipeline: id,
                    reason: format!("pipeline listed at position {index}"),
                });
            }
            let head = node(plan, pipeline.head())?;
            let stage: Box<dyn ExecutablePipelineStage> = match physical(head)? {
                PhysicalOperator::SlicePreAggregation { handler, .. } => {
                    let window = windows
                        .get(handler)
                        .cloned()
                        .ok_or_else(|| missing_handler(id, *handler))?;
                    Box::new(BuildStage::new(
                        window,
                        layout(first_input(head)?)?,
                        layout(head.output_schema())?,
                    ))
                }
                PhysicalOperator::JoinBuild { handler, side, .. } => {
                    let join = joins
                        .get(handler)
                        .cloned()
                        .ok_or_else(|| missing_handler(id, *handler))?;
                    Box::new(BuildStage::new(
                        JoinSideHandler::new(join, *side),
                        layout(first_input(head)?)?,
                        layout(head.output_schema())?,
                    ))
                }
                PhysicalOperator::Sink(descriptor) => {
                    let format = descriptor
                        .open()
                        .map_err(|source| ExecutionError::Sink { pipeline: id, source })?;
                    Box::new(SinkStage::new(id, layout(first_input(head)?)?, format))
                }
                head_op => {
                    if let PhysicalOperator::Scan { source } = head_op {
                        let entry = SourceEntry {
                            pipeline: id,
                            origin: head.id().0,
                            layout: layout(head.output_schema())?,
                            next_sequence: AtomicU64::new(1),
                        };
                        if sources.insert(source.clone(), entry).is_some() {
                            return Err(ExecutionError::Malformed {
                                pipeline: id,
                                reason: format!("duplicate source '{source}'"),
                            });
                        }
                    }
                    let chain = compiled.compiled(id).ok_or_else(|| ExecutionError::Malformed {
                        pipeline: id,
                        reason: "pipeline has no compiled chain".into(),
                    })?;
                    let function =
                        chain
                            .executable
                            .invocable(EXECUTE)
                            .ok_or_else(|| ExecutionError::Malformed {
                                pipeline: id,
                                reason: format!("executable exports no '{EXECUTE}' function"),
                            })?;
                    // A scan reads submitted buffers in its own output schema.
                    let inputs = if head.input_schemas().is_empty() {
                        vec![layout(&chain.ir.input_schema)?]
                    } else {
                        head.input_schemas()
                            .iter()
                            .map(&layout)
                            .collect::<Result<Vec<_>, _>>()?
                    };
                    Box::new(CompiledStage::new(
                        id,
                        inputs,
                        layout(&chain.ir.output_schema)?,
                        function,
                    ))
                }
            };

            let tail = pipeline.tail();
            let mut successors = SmallVec::new();
            let mut seen: SmallVec<[PipelineId; 2]> = SmallVec::new();
            for downstream in pipeline.downstream() {
                if seen.contains(downstream) {
                    continue;
                }
                seen.push(*downstream);
                let target = pipelines
                    .pipeline(*downstream)
                    .ok_or_else(|| ExecutionError::Malformed {
                        pipeline: id,
                        reason: format!("unknown downstream pipeline {downstream}"),
                    })?;
                let target_head = node(plan, target.head())?;
                for (port, pred) in target_head.predecessors().iter().enumerate() {
                    if *pred == tail {
                        successors.push((*downstream, port));
                    }
                }
            }

            trace!(pipeline = %id, stage = stage.name(), ?successors, "built pipeline stage");
            executables.push(ExecutablePipeline {
                id,
                stage,
                successors,
            });
        }

        info!(
            query = %query_id,
            pipelines = executables.len(),
            sources = sources.len(),
            windows = windows.len(),
            joins = joins.len(),
            backend = compiled.backend(),
            "built executable query plan"
        );
        Ok(Self {
            inner: Arc::new(QueryInner {
                id: query_id,
                status: Mutex::new(QueryStatus::Created),
                pipelines: executables,
                sources,
                buffers: resources.buffers,
                dispatcher: resources.dispatcher,
                pending: Mutex::new(0),
                idle: Condvar::new(),
                counters: Counters::default(),
                timer: Mutex::new(None),
                windows,
                joins,
            }),
        })
    }

    // ---- Lifecycle ----

    /// Announces the output schema to every sink.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidState`] unless the query is
    /// `Created`. A failing stage moves the query to `ErrorState` and its
    /// error is returned.
    pub fn deploy(&self) -> Result<(), ExecutionError> {
        self.expect_status(QueryStatus::Created, "Created")?;
        for pipeline in &self.inner.pipelines {
            if let Err(e) = pipeline.stage.setup() {
                self.fail(&e.to_string());
                return Err(e);
            }
        }
        self.set_status(QueryStatus::Deployed);
        debug!(query = %self.inner.id, "query deployed");
        Ok(())
    }

    /// Starts accepting data and, if any stage triggers on time, starts
    /// the trigger timer.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidState`] unless the query is
    /// `Deployed`, or [`ExecutionError::Spawn`] if the timer thread cannot
    /// be started.
    pub fn start(&self) -> Result<(), ExecutionError> {
        {
            let mut status = self.inner.status.lock();
            if *status != QueryStatus::Deployed {
                return Err(ExecutionError::InvalidState {
                    expected: "Deployed",
                    actual: *status,
                });
            }
            *status = QueryStatus::Running;
        }
        let period = self
            .inner
            .pipelines
            .iter()
            .filter_map(|p| p.stage.trigger_period())
            .min();
        if let Some(period) = period {
            let timer = self.spawn_timer(period)?;
            *self.inner.timer.lock() = Some(timer);
        }
        info!(query = %self.inner.id, "query started");
        Ok(())
    }

    fn spawn_timer(&self, period: Duration) -> Result<TriggerTimer, ExecutionError> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let query: Weak<QueryInner> = Arc::downgrade(&self.inner);
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("sluice-trigger-{}", self.inner.id.0))
            .spawn(move || {
                let (stopped, wake) = &*signal;
                loop {
                    {
                        let mut stopped = stopped.lock();
                        if !*stopped {
                            wake.wait_for(&mut stopped, period);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    let Some(query) = query.upgrade() else {
                        break;
                    };
                    query.fire_triggers();
                }
            })
            .map_err(|e| {
                self.set_status(QueryStatus::ErrorState);
                ExecutionError::Spawn(e)
            })?;
        debug!(query = %self.inner.id, ?period, "trigger timer started");
        Ok(TriggerTimer { stop, handle })
    }

    /// Stops the query; tasks still queued are discarded.
    ///
    /// Returns once every task of the query completed and its buffers went
    /// back to the pool. Called from inside a task, it returns without
    /// waiting. Stopping a query that already reached a terminal state is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first error a sink raised while flushing.
    pub fn stop(&self) -> Result<(), ExecutionError> {
        {
            let mut status = self.inner.status.lock();
            if status.is_terminal() {
                return Ok(());
            }
            *status = QueryStatus::Stopped;
        }
        self.inner.stop_timer();
        self.inner.quiesce();
        info!(query = %self.inner.id, "query stopped");
        self.inner.stop_stages()
    }

    /// Waits until every in-flight task completed, then finishes the query
    /// and flushes its sinks.
    ///
    /// Must not be called from a task.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidState`] unless the query is
    /// `Running`, or the first error a sink raised while flushing.
    pub fn finish(&self) -> Result<(), ExecutionError> {
        self.expect_status(QueryStatus::Running, "Running")?;
        self.inner.wait_idle(None);
        {
            let mut status = self.inner.status.lock();
            if *status != QueryStatus::Running {
                return Err(ExecutionError::InvalidState {
                    expected: "Running",
                    actual: *status,
                });
            }
            *status = QueryStatus::Finished;
        }
        self.inner.stop_timer();
        self.inner.quiesce();
        info!(query = %self.inner.id, statistics = ?self.statistics(), "query finished");
        self.inner.stop_stages()
    }

    /// Moves the query to `ErrorState`. No-op for terminal queries.
    pub fn fail(&self, reason: &str) {
        {
            let mut status = self.inner.status.lock();
            if status.is_terminal() {
                return;
            }
            *status = QueryStatus::ErrorState;
        }
        error!(query = %self.inner.id, reason, "query failed");
        self.inner.stop_timer();
        self.inner.quiesce();
        // Already failing; flush errors were logged by `stop_stages`.
        let _ = self.inner.stop_stages();
    }

    fn set_status(&self, status: QueryStatus) {
        *self.inner.status.lock() = status;
    }

    fn expect_status(&self, expected: QueryStatus, name: &'static str) -> Result<(), ExecutionError> {
        let actual = self.inner.status();
        if actual == expected {
            Ok(())
        } else {
            Err(ExecutionError::InvalidState {
                expected: name,
                actual,
            })
        }
    }

    // ---- Data ----

    /// Submits a filled buffer to `source`.
    ///
    /// The buffer is stamped with the source's origin and next sequence
    /// number; its watermark is left as set by the caller. Returns the
    /// sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::InvalidState`] unless the query is
    /// running, [`ExecutionError::UnknownSource`] for an unknown name and
    /// [`ExecutionError::Malformed`] if the records were written with a
    /// different layout.
    pub fn submit(&self, source: &str, mut buffer: TupleBuffer) -> Result<u64, ExecutionError> {
        self.expect_status(QueryStatus::Running, "Running")?;
        let entry = self.source(source)?;
        let tuple_size = buffer.header().tuple_size_bytes;
        if !buffer.is_empty() && tuple_size != entry.layout.tuple_size() {
            return Err(ExecutionError::Malformed {
                pipeline: entry.pipeline,
                reason: format!(
                    "source '{source}' expects {} byte records, buffer has {tuple_size}",
                    entry.layout.tuple_size()
                ),
            });
        }
        let sequence = entry.next_sequence.fetch_add(1, Ordering::Relaxed);
        let header = buffer.header_mut();
        header.origin_id = entry.origin;
        header.sequence_number = sequence;
        header.chunk_number = 0;
        header.last_chunk = true;
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(query = %self.inner.id, source, sequence, tuples = buffer.number_of_tuples(), "buffer submitted");
        self.inner.dispatch(entry.pipeline, buffer.into_shared(), 0);
        Ok(sequence)
    }

    /// Writes `records` into pooled buffers and submits them to `source`.
    ///
    /// Blocks while the pool is exhausted. Returns the number of buffers
    /// submitted.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit); additionally returns
    /// [`ExecutionError::Buffer`] if a record does not match the source
    /// schema. Buffers filled before the bad record were submitted.
    pub fn submit_records(&self, source: &str, records: &[Vec<Value>]) -> Result<usize, ExecutionError> {
        self.expect_status(QueryStatus::Running, "Running")?;
        let layout = &self.source(source)?.layout;
        let mut submitted = 0;
        for chunk in records.chunks(layout.capacity().max(1)) {
            let mut buffer = self.inner.buffers.get_buffer_blocking()?;
            for record in chunk {
                layout.push_record(&mut buffer, record)?;
            }
            self.submit(source, buffer)?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Advances the watermark of `source` without data.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub fn inject_watermark(&self, source: &str, watermark: i64) -> Result<u64, ExecutionError> {
        let mut buffer = TupleBuffer::control();
        buffer.set_watermark(watermark);
        self.submit(source, buffer)
    }

    /// Blocks until no task is pending or `timeout` elapsed. Returns `true`
    /// if the query is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.wait_idle(Some(Instant::now() + timeout))
    }

    fn source(&self, name: &str) -> Result<&SourceEntry, ExecutionError> {
        self.inner
            .sources
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownSource(name.to_string()))
    }

    // ---- Accessors ----

    /// Query id.
    #[must_use]
    pub fn id(&self) -> QueryId {
        self.inner.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.inner.status()
    }

    /// Source names, sorted.
    #[must_use]
    pub fn sources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Layout buffers submitted to `source` must be written with.
    #[must_use]
    pub fn source_layout(&self, source: &str) -> Option<&MemoryLayout> {
        self.inner.sources.get(source).map(|s| &s.layout)
    }

    /// Number of pipelines.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.inner.pipelines.len()
    }

    /// Window handler with logical id `id`.
    #[must_use]
    pub fn window_handler(&self, id: OperatorId) -> Option<Arc<WindowOperatorHandler>> {
        self.inner.windows.get(&id).cloned()
    }

    /// Join handler with logical id `id`.
    #[must_use]
    pub fn join_handler(&self, id: OperatorId) -> Option<Arc<JoinOperatorHandler>> {
        self.inner.joins.get(&id).cloned()
    }

    /// Buffers one task of this query may hold at once.
    pub(crate) fn buffer_demand(&self) -> usize {
        self.inner.buffer_demand()
    }

    /// Runs `f` with a context for the pipeline at `index`, as `worker`.
    #[cfg(test)]
    pub(crate) fn with_context<R>(
        &self,
        index: usize,
        worker: &WorkerContext,
        f: impl FnOnce(&PipelineExecutionContext<'_>) -> R,
    ) -> Option<R> {
        let pipeline = self.inner.pipelines.get(index)?;
        Some(f(&PipelineExecutionContext::new(&self.inner, pipeline, worker)))
    }

    /// Snapshot of the task counters.
    #[must_use]
    pub fn statistics(&self) -> QueryStatistics {
        let counters = &self.inner.counters;
        QueryStatistics {
            tasks_processed: counters.processed.load(Ordering::Relaxed),
            tasks_failed: counters.failed.load(Ordering::Relaxed),
            tasks_discarded: counters.discarded.load(Ordering::Relaxed),
            buffers_submitted: counters.submitted.load(Ordering::Relaxed),
        }
    }
}

fn missing_handler(pipeline: PipelineId, handler: OperatorId) -> ExecutionError {
    ExecutionError::Malformed {
        pipeline,
        reason: format!("no handler {handler}"),
    }
}

impl std::fmt::Debug for ExecutableQueryPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableQueryPlan")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .field("pipelines", &self.inner.pipelines.len())
            .field("sources", &self.sources())
            .finish_non_exhaustive()
    }
}
