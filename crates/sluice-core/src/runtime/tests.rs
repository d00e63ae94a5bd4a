use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::compiler::{AlwaysBreakPolicy, FuseIfPossiblePolicy, InterpreterBackend, QueryCompiler};
use crate::config::EngineConfig;
use crate::expr::{col, lit};
use crate::memory::{BufferError, BufferManager, LayoutKind, MemoryLayout, TupleBuffer};
use crate::plan::{IdGenerator, QueryBuilder, QueryPlan};
use crate::sink::{ResultCollector, SinkDescriptor};
use crate::types::{DataType, Field, Schema, SchemaRef, Value};
use crate::window::{
    JoinDefinition, TimeCharacteristic, TriggerPolicy, WatermarkStrategy, WindowAggregation,
    WindowDefinition, WindowType,
};
use crate::Error;

fn cars() -> SchemaRef {
    Arc::new(
        Schema::new(vec![
            Field::new("ts", DataType::int64()),
            Field::new("id", DataType::uint32()),
            Field::new("speed", DataType::int32()),
            Field::new("ratio", DataType::float64()),
        ])
        .unwrap(),
    )
}

fn car(ts: i64, id: u64, speed: i64) -> Vec<Value> {
    vec![Value::Int(ts), Value::UInt(id), Value::Int(speed), Value::Float(0.5)]
}

fn inline_engine(config: EngineConfig) -> NodeEngine {
    NodeEngine::with_dispatcher(config, Arc::new(InlineDispatcher::new())).unwrap()
}

fn run(engine: &NodeEngine, plan: QueryPlan) -> ExecutableQueryPlan {
    let id = engine.deploy(&engine.compile(plan).unwrap()).unwrap();
    engine.start(id).unwrap();
    engine.query(id).unwrap()
}

fn tumbling_count(size_ms: i64) -> WindowDefinition {
    WindowDefinition::new(WindowType::tumbling(size_ms), TimeCharacteristic::event_time("ts"))
        .aggregate(WindowAggregation::count())
}

fn sorted(mut rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows
}

fn wait_for(collector: &ResultCollector, rows: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while collector.len() < rows && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ── Stateless pipelines ──────────────────────────────────────────────

#[test]
fn test_filter_and_map_end_to_end() {
    let engine = inline_engine(EngineConfig::default());
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(50)))
        .map("double", col("speed") * lit(2))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    let submitted = query
        .submit_records("cars", &[car(1, 1, 40), car(2, 2, 60), car(3, 3, 90)])
        .unwrap();
    assert_eq!(submitted, 1);

    let mut expected = car(2, 2, 60);
    expected.push(Value::Int(120));
    let mut fast = car(3, 3, 90);
    fast.push(Value::Int(180));
    assert_eq!(results.rows(), vec![expected, fast]);
    assert_eq!(results.schema().unwrap().len(), 5);

    let stats = query.statistics();
    assert_eq!(stats.buffers_submitted, 1);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.tasks_processed, 2);
    engine.shutdown();
}

#[test]
fn test_columnar_layout_gives_same_rows() {
    let config = EngineConfig {
        layout: LayoutKind::Columnar,
        ..EngineConfig::default()
    };
    let engine = inline_engine(config);
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("id").gt(lit(1)))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);
    query
        .submit_records("cars", &[car(1, 1, 40), car(2, 2, 60)])
        .unwrap();
    assert_eq!(results.rows(), vec![car(2, 2, 60)]);
    assert_eq!(query.source_layout("cars").unwrap().kind(), LayoutKind::Columnar);
}

#[test]
fn test_pipeline_count_follows_policy() {
    let ids = Arc::new(IdGenerator::new());
    let plan = || {
        QueryBuilder::from_source(&ids, "cars", cars())
            .filter(col("speed").gt(lit(50)))
            .sink(SinkDescriptor::collect(ResultCollector::new()))
            .build()
            .unwrap()
    };
    let resources = || QueryResources {
        buffers: BufferManager::new(8, 4096).unwrap(),
        dispatcher: Arc::new(InlineDispatcher::new()),
        layout: LayoutKind::Row,
    };
    let backend = Arc::new(InterpreterBackend);

    let fused = QueryCompiler::new(&ids, Arc::new(FuseIfPossiblePolicy), backend.clone())
        .compile(plan())
        .unwrap();
    let query = ExecutableQueryPlan::new(ids.next_query_id(), &fused, resources()).unwrap();
    assert_eq!(query.pipeline_count(), 2);

    let broken = QueryCompiler::new(&ids, Arc::new(AlwaysBreakPolicy), backend)
        .compile(plan())
        .unwrap();
    let query = ExecutableQueryPlan::new(ids.next_query_id(), &broken, resources()).unwrap();
    assert_eq!(query.pipeline_count(), 3);
    assert_eq!(query.sources(), vec!["cars"]);
}

// ── Lifecycle ────────────────────────────────────────────────────────

fn standalone(results: &ResultCollector) -> ExecutableQueryPlan {
    standalone_with_pool(results, BufferManager::new(8, 4096).unwrap())
}

fn standalone_with_pool(results: &ResultCollector, buffers: BufferManager) -> ExecutableQueryPlan {
    let ids = Arc::new(IdGenerator::new());
    let plan = QueryBuilder::from_source(&ids, "cars", cars())
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let compiled = QueryCompiler::new(&ids, Arc::new(FuseIfPossiblePolicy), Arc::new(InterpreterBackend))
        .compile(plan)
        .unwrap();
    let resources = QueryResources {
        buffers,
        dispatcher: Arc::new(InlineDispatcher::new()),
        layout: LayoutKind::Row,
    };
    ExecutableQueryPlan::new(ids.next_query_id(), &compiled, resources).unwrap()
}

#[test]
fn test_lifecycle_transitions() {
    let results = ResultCollector::new();
    let query = standalone(&results);
    assert_eq!(query.status(), QueryStatus::Created);

    assert!(matches!(
        query.start(),
        Err(ExecutionError::InvalidState { expected: "Deployed", actual: QueryStatus::Created })
    ));
    assert!(matches!(
        query.submit_records("cars", &[car(1, 1, 1)]),
        Err(ExecutionError::InvalidState { .. })
    ));

    query.deploy().unwrap();
    assert_eq!(query.status(), QueryStatus::Deployed);
    // The sink learns its schema on deploy.
    assert_eq!(results.schema().unwrap().len(), 4);
    assert!(matches!(query.deploy(), Err(ExecutionError::InvalidState { .. })));

    query.start().unwrap();
    assert_eq!(query.status(), QueryStatus::Running);
    query.submit_records("cars", &[car(1, 1, 1)]).unwrap();
    assert_eq!(results.len(), 1);

    query.stop().unwrap();
    assert_eq!(query.status(), QueryStatus::Stopped);
    assert!(query.status().is_terminal());
    query.stop().unwrap();
    assert!(matches!(
        query.submit_records("cars", &[car(2, 1, 1)]),
        Err(ExecutionError::InvalidState { expected: "Running", actual: QueryStatus::Stopped })
    ));
    assert_eq!(results.len(), 1);
}

#[test]
fn test_finish_drains_and_fail_is_terminal() {
    let results = ResultCollector::new();
    let query = standalone(&results);
    assert!(matches!(query.finish(), Err(ExecutionError::InvalidState { .. })));
    query.deploy().unwrap();
    query.start().unwrap();
    query.submit_records("cars", &[car(1, 1, 1), car(2, 2, 2)]).unwrap();
    query.finish().unwrap();
    assert_eq!(query.status(), QueryStatus::Finished);
    assert_eq!(results.len(), 2);

    let failing = standalone(&ResultCollector::new());
    failing.deploy().unwrap();
    failing.fail("lost upstream");
    assert_eq!(failing.status(), QueryStatus::ErrorState);
    assert!(matches!(failing.start(), Err(ExecutionError::InvalidState { .. })));
}

#[test]
fn test_unknown_source_and_query() {
    let engine = inline_engine(EngineConfig::default());
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .sink(SinkDescriptor::collect(ResultCollector::new()))
        .build()
        .unwrap();
    let query = run(&engine, plan);
    assert!(matches!(
        query.submit_records("trucks", &[car(1, 1, 1)]),
        Err(ExecutionError::UnknownSource(name)) if name == "trucks"
    ));
    assert!(matches!(
        engine.query(crate::plan::QueryId(999)),
        Err(Error::Execution(ExecutionError::QueryNotFound(_)))
    ));
    assert_eq!(engine.query_ids(), vec![query.id()]);
    assert!(engine.undeploy(query.id()));
    assert!(!engine.undeploy(query.id()));
    assert_eq!(query.status(), QueryStatus::Stopped);
}

#[test]
fn test_buffer_with_foreign_layout_is_rejected() {
    let engine = inline_engine(EngineConfig::default());
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .sink(SinkDescriptor::collect(ResultCollector::new()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    let narrow = Arc::new(Schema::new(vec![Field::new("v", DataType::int64())]).unwrap());
    let layout = MemoryLayout::row(narrow, 4096).unwrap();
    let mut buffer = TupleBuffer::unpooled(4096);
    layout.push_record(&mut buffer, &[Value::Int(1)]).unwrap();
    assert!(matches!(
        query.submit("cars", buffer),
        Err(ExecutionError::Malformed { .. })
    ));
    assert_eq!(query.statistics().buffers_submitted, 0);
}

#[test]
fn test_duplicate_source_names_rejected() {
    let engine = inline_engine(EngineConfig::default());
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .union(QueryBuilder::from_source(engine.ids(), "cars", cars()))
        .sink(SinkDescriptor::collect(ResultCollector::new()))
        .build()
        .unwrap();
    let compiled = engine.compile(plan).unwrap();
    assert!(matches!(
        engine.deploy(&compiled),
        Err(Error::Execution(ExecutionError::Malformed { .. }))
    ));
    assert!(engine.query_ids().is_empty());
}

// ── Buffers ──────────────────────────────────────────────────────────

fn allocate(query: &ExecutableQueryPlan, worker: usize) -> Result<TupleBuffer, ExecutionError> {
    let worker = WorkerContext::new(worker);
    query
        .with_context(0, &worker, |ctx| ctx.allocate_tuple_buffer())
        .unwrap()
}

#[test]
fn test_third_task_allocation_blocks_until_release() {
    let pool = BufferManager::new(2, 64).unwrap();
    let query = standalone_with_pool(&ResultCollector::new(), pool.clone());
    let first = allocate(&query, 0).unwrap();
    let second = allocate(&query, 1).unwrap();
    assert_eq!(pool.available(), 0);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let query = query.clone();
        thread::spawn(move || {
            tx.send(allocate(&query, 2).map(|b| b.buffer_size())).unwrap();
        })
    };
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    drop(first);
    let third = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(third, Ok(64)));
    waiter.join().unwrap();

    drop(second);
    assert_eq!(pool.available(), 2);
    pool.destroy();
    assert!(matches!(
        allocate(&query, 0),
        Err(ExecutionError::Buffer(BufferError::PoolDestroyed))
    ));
}

#[test]
fn test_stage_waits_for_pooled_output_buffer() {
    let config = EngineConfig {
        buffer_count: 3,
        number_of_workers: 1,
        ..EngineConfig::default()
    };
    let engine = NodeEngine::new(config).unwrap();
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(0)))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);
    assert_eq!(engine.buffer_manager().reserve(), 1);

    let pool = engine.buffer_manager();
    let mut held: Vec<_> = (0..3)
        .map(|_| pool.get_reserved_buffer_blocking().unwrap())
        .collect();
    let layout = query.source_layout("cars").unwrap();
    let mut input = TupleBuffer::unpooled(layout.buffer_size());
    layout.push_record(&mut input, &car(1, 1, 60)).unwrap();
    query.submit("cars", input).unwrap();

    assert!(!query.wait_idle(Duration::from_millis(100)));
    assert!(results.is_empty());

    drop(held.pop());
    assert!(query.wait_idle(Duration::from_secs(5)));
    assert_eq!(results.rows(), vec![car(1, 1, 60)]);
    assert_eq!(pool.available(), 1);
    drop(held);
    engine.shutdown();
}

#[test]
fn test_deploy_rejects_pool_smaller_than_reserve() {
    let config = EngineConfig {
        buffer_count: 2,
        number_of_workers: 2,
        ..EngineConfig::default()
    };
    let engine = NodeEngine::new(config).unwrap();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(50)))
        .sink(SinkDescriptor::collect(ResultCollector::new()))
        .build()
        .unwrap();
    let compiled = engine.compile(plan).unwrap();
    assert!(matches!(
        engine.deploy(&compiled),
        Err(Error::Execution(ExecutionError::InsufficientBuffers { required: 2, available: 2 }))
    ));
    assert!(engine.query_ids().is_empty());
    assert_eq!(engine.buffer_manager().reserve(), 0);
    engine.shutdown();
}

#[test]
fn test_undeploy_returns_every_buffer() {
    let config = EngineConfig {
        buffer_count: 256,
        number_of_workers: 1,
        ..EngineConfig::default()
    };
    let engine = NodeEngine::new(config).unwrap();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(10)))
        .key_by(["id"])
        .window(tumbling_count(100))
        .sink(SinkDescriptor::collect(ResultCollector::new()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    let records: Vec<_> = (0..2000).map(|i| car(i, (i % 7) as u64, i % 50)).collect();
    query.submit_records("cars", &records).unwrap();
    assert!(engine.undeploy(query.id()));

    assert_eq!(query.status(), QueryStatus::Stopped);
    assert_eq!(engine.buffer_manager().available(), 256);
    assert_eq!(engine.buffer_manager().reserve(), 0);
    engine.shutdown();
}

#[test]
fn test_small_buffers_split_output_into_chunks() {
    // 64 bytes hold two car records and one window result.
    let config = EngineConfig {
        buffer_size_bytes: 64,
        ..EngineConfig::default()
    };
    let engine = inline_engine(config);
    let results = ResultCollector::new();
    let windowed = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .assign_watermarks(WatermarkStrategy::event_time("ts", 0))
        .key_by(["id"])
        .window(tumbling_count(1000).aggregate(WindowAggregation::sum("speed")));
    let window = windowed.head().unwrap();
    let plan = windowed
        .filter(col("sum_speed").gt(lit(0)))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    let records: Vec<_> = (0..6).map(|i| car(i * 100, (i % 3) as u64, 10)).collect();
    assert_eq!(query.submit_records("cars", &records).unwrap(), 3);
    query.inject_watermark("cars", 1000).unwrap();

    assert_eq!(
        results.rows(),
        (0..3)
            .map(|key| vec![
                Value::Int(0),
                Value::Int(1000),
                Value::UInt(key),
                Value::UInt(2),
                Value::Int(20),
            ])
            .collect::<Vec<_>>()
    );
    assert!(results.buffers() >= 3);
    assert_eq!(query.window_handler(window).unwrap().watermark(), 1000);
}

// ── Windows and joins ────────────────────────────────────────────────

#[test]
fn test_keyed_tumbling_window() {
    let engine = inline_engine(EngineConfig::default());
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .assign_watermarks(WatermarkStrategy::event_time("ts", 0))
        .key_by(["id"])
        .window(
            WindowDefinition::new(WindowType::tumbling(1000), TimeCharacteristic::event_time("ts"))
                .aggregate(WindowAggregation::sum("speed"))
                .aggregate(WindowAggregation::count()),
        )
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    query
        .submit_records(
            "cars",
            &[car(100, 1, 10), car(200, 2, 20), car(900, 1, 30), car(1100, 1, 40)],
        )
        .unwrap();
    let first = |key: u64, sum: i64, count: u64| {
        vec![Value::Int(0), Value::Int(1000), Value::UInt(key), Value::Int(sum), Value::UInt(count)]
    };
    assert_eq!(results.rows(), vec![first(1, 40, 2), first(2, 20, 1)]);

    query.inject_watermark("cars", 2000).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        results.rows()[2],
        vec![Value::Int(1000), Value::Int(2000), Value::UInt(1), Value::Int(40), Value::UInt(1)]
    );
}

#[test]
fn test_filtered_out_buffers_still_advance_window() {
    let engine = inline_engine(EngineConfig::default());
    let windowed = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(1000)))
        .window(tumbling_count(1000));
    let window = windowed.head().unwrap();
    let results = ResultCollector::new();
    let plan = windowed
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    query.submit_records("cars", &[car(10, 1, 1)]).unwrap();
    query.inject_watermark("cars", 1500).unwrap();
    let handler = query.window_handler(window).unwrap();
    assert_eq!(handler.watermark(), 1500);
    assert_eq!(handler.metrics().records_inserted(), 0);
    assert!(results.is_empty());
}

#[test]
fn test_time_trigger_fires_from_timer() {
    let engine = inline_engine(EngineConfig::default());
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .window(tumbling_count(1000).trigger_policy(TriggerPolicy::OnTime { trigger_time_ms: 10 }))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    query.submit_records("cars", &[car(10, 1, 1), car(20, 1, 1)]).unwrap();
    query.inject_watermark("cars", 1000).unwrap();
    wait_for(&results, 1);
    assert_eq!(
        results.rows(),
        vec![vec![Value::Int(0), Value::Int(1000), Value::UInt(2)]]
    );
    engine.shutdown();
}

#[test]
fn test_union_of_different_widths() {
    let engine = inline_engine(EngineConfig::default());
    let narrow = Arc::new(
        Schema::new(vec![
            Field::new("ts", DataType::int64()),
            Field::new("id", DataType::uint8()),
            Field::new("speed", DataType::int8()),
            Field::new("ratio", DataType::float32()),
        ])
        .unwrap(),
    );
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .union(QueryBuilder::from_source(engine.ids(), "trucks", narrow))
        .filter(col("speed").gt(lit(5)))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);
    assert_eq!(query.sources(), vec!["cars", "trucks"]);

    query.submit_records("cars", &[car(1, 300, 60), car(2, 1, 2)]).unwrap();
    let truck = |ts: i64, id: u64, speed: i64| {
        vec![Value::Int(ts), Value::UInt(id), Value::Int(speed), Value::Float(1.5)]
    };
    query
        .submit_records("trucks", &[truck(3, 7, -3), truck(4, 8, 9)])
        .unwrap();
    assert_eq!(sorted(results.rows()), vec![car(1, 300, 60), truck(4, 8, 9)]);
}

#[test]
fn test_windowed_join() {
    let engine = inline_engine(EngineConfig::default());
    let owners = Arc::new(
        Schema::new(vec![
            Field::new("ots", DataType::int64()),
            Field::new("oid", DataType::uint32()),
            Field::new("age", DataType::int32()),
        ])
        .unwrap(),
    );
    let definition = JoinDefinition::new(
        "id",
        "oid",
        WindowType::tumbling(1000),
        TimeCharacteristic::event_time("ts"),
        TimeCharacteristic::event_time("ots"),
    );
    let results = ResultCollector::new();
    let joined = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .join(QueryBuilder::from_source(engine.ids(), "owners", owners), definition);
    let join = joined.head().unwrap();
    let plan = joined
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    query
        .submit_records("cars", &[car(100, 1, 60), car(200, 2, 70), car(1500, 1, 80)])
        .unwrap();
    let owner = |ts: i64, id: u64, age: i64| vec![Value::Int(ts), Value::UInt(id), Value::Int(age)];
    query
        .submit_records("owners", &[owner(300, 1, 30), owner(400, 3, 40)])
        .unwrap();
    query.inject_watermark("cars", 1000).unwrap();
    // One side alone cannot close a window.
    assert!(results.is_empty());
    query.inject_watermark("owners", 1000).unwrap();

    let mut expected = vec![Value::Int(0), Value::Int(1000)];
    expected.extend(car(100, 1, 60));
    expected.extend(owner(300, 1, 30));
    assert_eq!(results.rows(), vec![expected]);
    assert_eq!(query.join_handler(join).unwrap().watermark(), 1000);
}

#[test]
fn test_window_at_end_of_time_range() {
    let engine = inline_engine(EngineConfig::default());
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .key_by(["id"])
        .window(tumbling_count(10))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    query.submit_records("cars", &[car(i64::MAX - 5, 4, 1)]).unwrap();
    query.inject_watermark("cars", i64::MAX).unwrap();

    assert_eq!(
        results.rows(),
        vec![vec![Value::Int(i64::MAX - 7), Value::Int(i64::MAX), Value::UInt(4), Value::UInt(1)]]
    );
    let stats = query.statistics();
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(query.status(), QueryStatus::Running);
    engine.shutdown();
}

// ── Failures ─────────────────────────────────────────────────────────

#[test]
fn test_evaluation_failure_keeps_progress() {
    let engine = inline_engine(EngineConfig::default());
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .map("inverse", lit(100) / col("speed"))
        .window(tumbling_count(1000))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    query
        .submit_records("cars", &[car(100, 1, 50), car(200, 2, 0), car(300, 3, 20)])
        .unwrap();
    let stats = query.statistics();
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(query.status(), QueryStatus::Running);

    query.inject_watermark("cars", 1000).unwrap();
    assert_eq!(
        results.rows(),
        vec![vec![Value::Int(0), Value::Int(1000), Value::UInt(1)]]
    );
}

// ── Worker pool ──────────────────────────────────────────────────────

#[test]
fn test_worker_pool_runs_windowed_query() {
    let config = EngineConfig {
        number_of_workers: 4,
        buffer_size_bytes: 256,
        ..EngineConfig::default()
    };
    let engine = NodeEngine::new(config).unwrap();
    let results = ResultCollector::new();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(50)))
        .key_by(["id"])
        .window(tumbling_count(1000).aggregate(WindowAggregation::sum("speed")))
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let query = run(&engine, plan);

    let records: Vec<_> = (0..200)
        .map(|i| car(i * 10, (i % 4) as u64, if i % 5 == 0 { 10 } else { 60 }))
        .collect();
    assert!(query.submit_records("cars", &records).unwrap() > 1);
    query.inject_watermark("cars", 2000).unwrap();
    assert!(query.wait_idle(Duration::from_secs(10)));

    let rows = sorted(results.rows());
    assert_eq!(rows.len(), 8);
    let total: u64 = rows
        .iter()
        .map(|r| match r[3] {
            Value::UInt(n) => n,
            ref other => panic!("unexpected count {other:?}"),
        })
        .sum();
    assert_eq!(total, 160);
    assert_eq!(rows[0][..3], [Value::Int(0), Value::Int(1000), Value::UInt(0)]);
    assert_eq!(query.statistics().tasks_failed, 0);
    engine.shutdown();
    assert!(engine.buffer_manager().is_destroyed());
}

#[test]
fn test_worker_pool_emits_windows_in_order_per_key() {
    for _ in 0..3 {
        let config = EngineConfig {
            number_of_workers: 4,
            ..EngineConfig::default()
        };
        let engine = NodeEngine::new(config).unwrap();
        let results = ResultCollector::new();
        let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
            .key_by(["id"])
            .window(tumbling_count(10))
            .sink(SinkDescriptor::collect(results.clone()))
            .build()
            .unwrap();
        let query = run(&engine, plan);
        let layout = query.source_layout("cars").unwrap().clone();

        for i in 0..400 {
            let mut buffer = engine.buffer_manager().get_buffer_blocking().unwrap();
            for key in 0..4 {
                layout.push_record(&mut buffer, &car(i, key, 1)).unwrap();
            }
            buffer.set_watermark(i);
            query.submit("cars", buffer).unwrap();
        }
        query.inject_watermark("cars", 400).unwrap();
        assert!(query.wait_idle(Duration::from_secs(10)));

        let rows = results.rows();
        assert_eq!(rows.len(), 160);
        for key in 0..4 {
            let ends: Vec<&Value> = rows
                .iter()
                .filter(|row| row[2] == Value::UInt(key))
                .map(|row| &row[1])
                .collect();
            assert_eq!(ends.len(), 40);
            assert!(
                ends.windows(2).all(|pair| pair[0].total_cmp(pair[1]).is_le()),
                "key {key} emitted out of order: {ends:?}"
            );
        }
        assert!(rows.iter().all(|row| row[3] == Value::UInt(10)));
        assert_eq!(query.statistics().tasks_failed, 0);
        engine.shutdown();
    }
}

#[test]
fn test_worker_pool_discards_after_shutdown() {
    let pool = WorkerPool::new(2).unwrap();
    assert_eq!(pool.worker_count(), 2);
    pool.shutdown();
    pool.shutdown();
    assert_eq!(pool.queued(), 0);
}
