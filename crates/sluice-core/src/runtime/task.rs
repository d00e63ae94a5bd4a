//! Tasks and the dispatchers that run them.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::context::WorkerContext;
use super::query::QueryInner;
use super::ExecutionError;
use crate::compiler::PipelineId;
use crate::memory::SharedBuffer;

thread_local! {
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` on a thread that is currently running a task.
pub(crate) fn in_task() -> bool {
    IN_TASK.with(Cell::get)
}

enum Work {
    /// Run the pipeline on one input buffer.
    Buffer {
        pipeline: PipelineId,
        buffer: SharedBuffer,
        port: usize,
    },
    /// Hand the worker's share of the pipeline's state over.
    HandOff { pipeline: PipelineId },
    /// Drop the worker's stores of the query.
    Release,
}

/// A unit of work for one query.
///
/// Input buffers start a task on the source pipeline; downstream pipelines
/// run inside the same task. Hand-offs and store releases are targeted at
/// one worker.
pub struct Task {
    query: Arc<QueryInner>,
    work: Work,
}

impl Task {
    pub(crate) fn buffer(
        query: Arc<QueryInner>,
        pipeline: PipelineId,
        buffer: SharedBuffer,
        port: usize,
    ) -> Self {
        Self {
            query,
            work: Work::Buffer {
                pipeline,
                buffer,
                port,
            },
        }
    }

    pub(crate) fn hand_off(query: Arc<QueryInner>, pipeline: PipelineId) -> Self {
        Self {
            query,
            work: Work::HandOff { pipeline },
        }
    }

    pub(crate) fn release(query: Arc<QueryInner>) -> Self {
        Self {
            query,
            work: Work::Release,
        }
    }

    /// Pipeline the task executes; `None` for store releases.
    #[must_use]
    pub fn pipeline(&self) -> Option<PipelineId> {
        match self.work {
            Work::Buffer { pipeline, .. } | Work::HandOff { pipeline } => Some(pipeline),
            Work::Release => None,
        }
    }

    /// Executes the task on `worker`.
    ///
    /// Failures and panics are logged and counted by the query; the buffer
    /// is released before the query learns the task is done.
    pub fn run(self, worker: &WorkerContext) {
        let Self { query, work } = self;
        let outer = IN_TASK.with(|flag| flag.replace(true));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match work {
            Work::Buffer {
                pipeline,
                buffer,
                port,
            } => query.run_stage(pipeline, &buffer, port, worker),
            Work::HandOff { pipeline } => query.run_hand_off(pipeline, worker),
            Work::Release => worker.release(query.id()),
        }));
        IN_TASK.with(|flag| flag.set(outer));
        if let Err(payload) = outcome {
            query.task_panicked(worker, panic_message(payload.as_ref()));
        }
        query.task_done();
    }

    /// Drops the task unexecuted.
    fn discard(self) {
        let Self { query, work } = self;
        drop(work);
        query.task_discarded();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Task");
        debug.field("query", &self.query.id());
        match &self.work {
            Work::Buffer {
                pipeline,
                buffer,
                port,
            } => debug
                .field("pipeline", pipeline)
                .field("port", port)
                .field("tuples", &buffer.number_of_tuples()),
            Work::HandOff { pipeline } => debug.field("hand_off", pipeline),
            Work::Release => debug.field("release", &true),
        };
        debug.finish()
    }
}

/// Executes tasks, possibly on other threads.
pub trait TaskDispatcher: Send + Sync + fmt::Debug {
    /// Schedules `task` on any worker. Tasks may run in any order.
    fn dispatch(&self, task: Task);

    /// Schedules `task` on worker `worker` only.
    ///
    /// Operator stores belong to the worker thread that created them, so
    /// hand-offs must run there.
    fn dispatch_to(&self, worker: usize, task: Task);

    /// Number of distinct worker ids tasks may run with.
    fn worker_count(&self) -> usize;

    /// Stops accepting tasks and releases threads.
    fn shutdown(&self) {}
}

// ── Worker pool ────────────────────────────────────────────────────────

struct Queue {
    tasks: VecDeque<Task>,
    /// Tasks for one worker only, taken before shared ones.
    local: Vec<VecDeque<Task>>,
    shutdown: bool,
}

impl Queue {
    fn len(&self) -> usize {
        self.tasks.len() + self.local.iter().map(VecDeque::len).sum::<usize>()
    }
}

struct PoolShared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Fixed set of worker threads draining a shared task queue and one local
/// queue each.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    /// Starts `workers` threads named `sluice-worker-{i}`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Spawn`] if a thread cannot be started;
    /// threads started before it are shut down.
    pub fn new(workers: usize) -> Result<Self, ExecutionError> {
        let workers = workers.max(1);
        let pool = Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(Queue {
                    tasks: VecDeque::new(),
                    local: (0..workers).map(|_| VecDeque::new()).collect(),
                    shutdown: false,
                }),
                available: Condvar::new(),
            }),
            threads: Mutex::new(Vec::with_capacity(workers)),
            workers,
        };
        for worker_id in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("sluice-worker-{worker_id}"))
                .spawn(move || Self::worker_loop(&shared, &WorkerContext::new(worker_id)))
                .map_err(ExecutionError::Spawn)?;
            pool.threads.lock().push(handle);
        }
        debug!(workers, "worker pool started");
        Ok(pool)
    }

    fn worker_loop(shared: &PoolShared, worker: &WorkerContext) {
        let id = worker.worker_id();
        loop {
            let task = {
                let mut queue = shared.queue.lock();
                loop {
                    let next = match queue.local[id].pop_front() {
                        Some(task) => Some(task),
                        None => queue.tasks.pop_front(),
                    };
                    if let Some(task) = next {
                        break task;
                    }
                    if queue.shutdown {
                        trace!(worker = id, stores = worker.local_stores(), "worker exiting");
                        return;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            task.run(worker);
        }
    }

    /// Tasks waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl TaskDispatcher for WorkerPool {
    fn dispatch(&self, task: Task) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            drop(queue);
            task.discard();
            return;
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.available.notify_one();
    }

    fn dispatch_to(&self, worker: usize, task: Task) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            drop(queue);
            task.discard();
            return;
        }
        queue.local[worker % self.workers].push_back(task);
        drop(queue);
        // Only the target may take it.
        self.shared.available.notify_all();
    }

    fn worker_count(&self) -> usize {
        self.workers
    }

    /// Lets the workers drain their queues, then joins them.
    fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            // A worker shutting down its own pool cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("queued", &self.queued())
            .finish()
    }
}

// ── Inline ─────────────────────────────────────────────────────────────

/// Runs tasks on the dispatching thread, in FIFO order, as worker 0.
///
/// Tasks dispatched while a task runs are queued and executed after it, so
/// hand-offs never nest inside the task that scheduled them. Execution is
/// deterministic as long as a single thread submits data.
#[derive(Debug)]
pub struct InlineDispatcher {
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    worker: Mutex<WorkerContext>,
}

impl Default for InlineDispatcher {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            worker: Mutex::new(WorkerContext::new(0)),
        }
    }
}

impl InlineDispatcher {
    /// Creates an idle dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another thread is draining and will pick the task up.
                return;
            }
            {
                let worker = self.worker.lock();
                loop {
                    let Some(task) = self.queue.lock().pop_front() else {
                        break;
                    };
                    task.run(&worker);
                }
            }
            self.draining.store(false, Ordering::Release);
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }
}

impl TaskDispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        self.queue.lock().push_back(task);
        self.drain();
    }

    fn dispatch_to(&self, _worker: usize, task: Task) {
        self.dispatch(task);
    }

    fn worker_count(&self) -> usize {
        1
    }
}
