use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

use fxhash::FxHashMap;

use super::query::{ExecutablePipeline, QueryInner};
use super::ExecutionError;
use crate::compiler::PipelineId;
use crate::memory::TupleBuffer;
use crate::plan::{OperatorId, QueryId};

type LocalKey = (QueryId, OperatorId);

/// State of the thread executing tasks.
///
/// Besides its id, a worker owns the operator stores it inserts into. Only
/// the owning thread ever touches them, so the context is not `Sync`.
#[derive(Debug)]
pub struct WorkerContext {
    worker_id: usize,
    locals: RefCell<FxHashMap<LocalKey, Box<dyn Any + Send>>>,
}

impl WorkerContext {
    /// Context of worker `worker_id`, owning no stores yet.
    #[must_use]
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            locals: RefCell::new(FxHashMap::default()),
        }
    }

    /// Index of the worker.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Operator stores held for any query.
    #[must_use]
    pub fn local_stores(&self) -> usize {
        self.locals.borrow().len()
    }

    /// Runs `f` on this worker's store for operator `id` of `query`,
    /// creating it on first use.
    ///
    /// The store is taken out of the worker while `f` runs, so `f` may
    /// execute other stages of the same worker.
    pub(crate) fn with_store<T, R>(&self, query: QueryId, id: OperatorId, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + Send + 'static,
    {
        let key = (query, id);
        let taken = self.locals.borrow_mut().remove(&key);
        let mut store: Box<T> = taken
            .and_then(|store| store.downcast::<T>().ok())
            .unwrap_or_default();
        let result = f(&mut store);
        self.locals.borrow_mut().insert(key, store);
        result
    }

    /// Drops every store of `query`.
    pub(crate) fn release(&self, query: QueryId) {
        self.locals.borrow_mut().retain(|(owner, _), _| *owner != query);
    }
}

/// What a stage may do while executing: allocate output buffers, run the
/// downstream pipelines and schedule hand-offs.
pub struct PipelineExecutionContext<'a> {
    query: &'a Arc<QueryInner>,
    pipeline: &'a ExecutablePipeline,
    worker: &'a WorkerContext,
}

impl<'a> PipelineExecutionContext<'a> {
    pub(crate) fn new(
        query: &'a Arc<QueryInner>,
        pipeline: &'a ExecutablePipeline,
        worker: &'a WorkerContext,
    ) -> Self {
        Self {
            query,
            pipeline,
            worker,
        }
    }

    /// Pipeline being executed.
    #[must_use]
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline.id()
    }

    /// Query the pipeline belongs to.
    #[must_use]
    pub fn query_id(&self) -> QueryId {
        self.query.id()
    }

    /// Worker executing the pipeline.
    #[must_use]
    pub fn worker(&self) -> &WorkerContext {
        self.worker
    }

    /// Size of the buffers handed out by [`allocate_tuple_buffer`](Self::allocate_tuple_buffer).
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.query.buffers().buffer_size()
    }

    /// Checks out an output buffer, blocking while the pool is exhausted.
    ///
    /// Stages may use the pool's reserve, which the engine sizes for the
    /// longest pipeline chain on every worker, so the wait always ends.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::PoolDestroyed`](crate::memory::BufferError::PoolDestroyed)
    /// after engine shutdown.
    pub fn allocate_tuple_buffer(&self) -> Result<TupleBuffer, ExecutionError> {
        Ok(self.query.buffers().get_reserved_buffer_blocking()?)
    }

    /// Runs every downstream pipeline on `buffer` before returning.
    ///
    /// Fan-out successors share the buffer; it returns to the pool once the
    /// last of them is done. A buffer emitted by a pipeline without
    /// successors is dropped.
    pub fn emit_buffer(&self, buffer: TupleBuffer) {
        let successors = self.pipeline.successors();
        if successors.is_empty() {
            return;
        }
        let shared = buffer.into_shared();
        for (pipeline, port) in successors {
            self.query.run_stage(*pipeline, &shared, *port, self.worker);
        }
    }

    /// Schedules a hand-off of this pipeline's stage on every worker.
    pub fn hand_off_all(&self) {
        self.query.dispatch_hand_offs(self.pipeline.id());
    }
}

impl std::fmt::Debug for PipelineExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutionContext")
            .field("query", &self.query.id())
            .field("pipeline", &self.pipeline.id())
            .field("worker", &self.worker.worker_id())
            .finish()
    }
}
