//! The node engine: owns the buffer pool, the workers and every deployed
//! query.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::query::{ExecutableQueryPlan, QueryResources};
use super::task::{TaskDispatcher, WorkerPool};
use super::ExecutionError;
use crate::compiler::{CompiledQuery, QueryCompiler};
use crate::config::EngineConfig;
use crate::memory::BufferManager;
use crate::plan::{IdGenerator, QueryId, QueryPlan};
use crate::{Error, Result};

/// Single-node runtime.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sluice_core::config::EngineConfig;
/// use sluice_core::plan::QueryBuilder;
/// use sluice_core::runtime::NodeEngine;
/// use sluice_core::sink::{ResultCollector, SinkDescriptor};
/// use sluice_core::types::{DataType, Field, Schema};
///
/// # fn main() -> sluice_core::Result<()> {
/// let engine = NodeEngine::new(EngineConfig::default())?;
/// let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::int64())])?);
/// let results = ResultCollector::new();
/// let plan = QueryBuilder::from_source(engine.ids(), "numbers", schema)
///     .sink(SinkDescriptor::collect(results.clone()))
///     .build()?;
/// let id = engine.deploy(&engine.compile(plan)?)?;
/// engine.start(id)?;
/// # engine.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct NodeEngine {
    config: EngineConfig,
    ids: Arc<IdGenerator>,
    buffers: BufferManager,
    dispatcher: Arc<dyn TaskDispatcher>,
    compiler: QueryCompiler,
    queries: RwLock<FxHashMap<QueryId, ExecutableQueryPlan>>,
}

impl NodeEngine {
    /// Starts an engine with a [`WorkerPool`] of
    /// [`number_of_workers`](EngineConfig::number_of_workers) threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration,
    /// [`Error::Buffer`] if the pool cannot be allocated and
    /// [`Error::Execution`] if a worker cannot be spawned.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.number_of_workers)?;
        Self::with_dispatcher(config, Arc::new(pool))
    }

    /// Starts an engine that runs its tasks on `dispatcher`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or
    /// [`Error::Buffer`] if the pool cannot be allocated.
    pub fn with_dispatcher(config: EngineConfig, dispatcher: Arc<dyn TaskDispatcher>) -> Result<Self> {
        config.validate()?;
        let buffers = BufferManager::new(config.buffer_count, config.buffer_size_bytes)?;
        let ids = Arc::new(IdGenerator::new());
        let compiler = QueryCompiler::from_config(&ids, &config.compiler);
        info!(
            buffers = config.buffer_count,
            buffer_size = config.buffer_size_bytes,
            workers = dispatcher.worker_count(),
            layout = ?config.layout,
            "node engine started"
        );
        Ok(Self {
            config,
            ids,
            buffers,
            dispatcher,
            compiler,
            queries: RwLock::new(FxHashMap::default()),
        })
    }

    /// Id generator plans for this engine must be built with.
    #[must_use]
    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared buffer pool.
    #[must_use]
    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffers
    }

    /// Compiles `plan` with the configured policy and backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] if any compilation phase fails.
    pub fn compile(&self, plan: QueryPlan) -> Result<CompiledQuery> {
        Ok(self.compiler.compile(plan)?)
    }

    /// Builds and deploys `compiled`, returning its new id. The query
    /// accepts data once [`start`](Self::start)ed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] if stages cannot be built, a sink
    /// fails to start or the pool is too small to keep
    /// [`ExecutionError::InsufficientBuffers`] in reserve for the deployed
    /// queries.
    pub fn deploy(&self, compiled: &CompiledQuery) -> Result<QueryId> {
        let id = self.ids.next_query_id();
        let query = ExecutableQueryPlan::new(
            id,
            compiled,
            QueryResources {
                buffers: self.buffers.clone(),
                dispatcher: Arc::clone(&self.dispatcher),
                layout: self.config.layout,
            },
        )?;
        let mut queries = self.queries.write();
        let demand = queries
            .values()
            .map(ExecutableQueryPlan::buffer_demand)
            .fold(query.buffer_demand(), usize::max);
        let reserve = demand.saturating_mul(self.dispatcher.worker_count());
        if reserve >= self.buffers.total() {
            return Err(Error::Execution(ExecutionError::InsufficientBuffers {
                required: reserve,
                available: self.buffers.total(),
            }));
        }
        query.deploy()?;
        queries.insert(id, query);
        self.buffers.set_reserve(reserve);
        drop(queries);
        info!(
            query = %id,
            policy = compiled.policy(),
            backend = compiled.backend(),
            reserve,
            "query deployed"
        );
        Ok(id)
    }

    /// Keeps back what the deployed queries need per worker.
    fn update_reserve(&self) {
        let demand = self
            .queries
            .read()
            .values()
            .map(ExecutableQueryPlan::buffer_demand)
            .max()
            .unwrap_or(0);
        self.buffers
            .set_reserve(demand.saturating_mul(self.dispatcher.worker_count()));
    }

    /// Starts a deployed query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] for an unknown query or one that is not
    /// `Deployed`.
    pub fn start(&self, id: QueryId) -> Result<()> {
        Ok(self.query(id)?.start()?)
    }

    /// Handle to a deployed query.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::QueryNotFound`] for an unknown id.
    pub fn query(&self, id: QueryId) -> Result<ExecutableQueryPlan> {
        self.queries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Execution(ExecutionError::QueryNotFound(id)))
    }

    /// Ids of every deployed query, sorted.
    #[must_use]
    pub fn query_ids(&self) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self.queries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stops and forgets a query. Returns `false` if it was not deployed.
    ///
    /// Returns once the query's tasks completed and its buffers went back
    /// to the pool. Flush errors are logged, not returned.
    pub fn undeploy(&self, id: QueryId) -> bool {
        let Some(query) = self.queries.write().remove(&id) else {
            return false;
        };
        if let Err(e) = query.stop() {
            warn!(query = %id, error = %e, "query did not stop cleanly");
        }
        self.update_reserve();
        info!(query = %id, "query undeployed");
        true
    }

    /// Stops every query, joins the workers and releases the pool.
    pub fn shutdown(&self) {
        let queries: Vec<_> = self.queries.write().drain().collect();
        for (id, query) in queries {
            if let Err(e) = query.stop() {
                warn!(query = %id, error = %e, "query did not stop cleanly");
            }
        }
        self.update_reserve();
        self.dispatcher.shutdown();
        self.buffers.destroy();
        info!("node engine shut down");
    }
}

impl std::fmt::Debug for NodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEngine")
            .field("config", &self.config)
            .field("buffers", &self.buffers)
            .field("dispatcher", &self.dispatcher)
            .field("queries", &self.query_ids())
            .finish_non_exhaustive()
    }
}
