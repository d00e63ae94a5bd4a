//! Invariants that must hold for any input, checked over input sweeps and
//! concurrent execution.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sluice_core::compiler::{FuseIfPossiblePolicy, InterpreterBackend, QueryCompiler};
use sluice_core::config::EngineConfig;
use sluice_core::expr::{col, lit};
use sluice_core::memory::{BufferError, LayoutKind, MemoryLayout, TupleBuffer};
use sluice_core::plan::{IdGenerator, QueryBuilder};
use sluice_core::runtime::NodeEngine;
use sluice_core::sink::{ResultCollector, SinkDescriptor};
use sluice_core::types::{DataType, Field, Schema, SchemaRef, Value};
use sluice_core::window::{
    TimeCharacteristic, TriggerPolicy, WindowAggregation, WindowDefinition, WindowType,
};

fn all_types() -> Vec<DataType> {
    vec![
        DataType::Boolean,
        DataType::int8(),
        DataType::int16(),
        DataType::int32(),
        DataType::int64(),
        DataType::uint8(),
        DataType::uint16(),
        DataType::uint32(),
        DataType::uint64(),
        DataType::float32(),
        DataType::float64(),
        DataType::char(4),
        DataType::char(8),
        DataType::array(3, DataType::int16()),
        DataType::array(3, DataType::float32()),
    ]
}

fn events() -> SchemaRef {
    Arc::new(
        Schema::new(vec![
            Field::new("ts", DataType::int64()),
            Field::new("key", DataType::uint32()),
            Field::new("value", DataType::int64()),
        ])
        .unwrap(),
    )
}

#[test]
fn join_is_commutative_and_idempotent() {
    let types = all_types();
    for a in &types {
        assert_eq!(&a.join(a), a, "{a} joined with itself");
        for b in &types {
            assert_eq!(a.join(b), b.join(a), "{a} / {b}");
        }
    }
}

#[test]
fn buffer_never_exceeds_capacity() {
    let schema = events();
    for size in [20, 32, 100, 256, 1000] {
        for kind in [LayoutKind::Row, LayoutKind::Columnar] {
            let layout = MemoryLayout::new(kind, Arc::clone(&schema), size).unwrap();
            let mut buffer = TupleBuffer::unpooled(size);
            let mut written = 0;
            for i in 0..(layout.capacity() + 3) {
                let record = [Value::Int(i as i64), Value::UInt(1), Value::Int(-(i as i64))];
                match layout.push_record(&mut buffer, &record) {
                    Ok(_) => written += 1,
                    Err(BufferError::CapacityExceeded { .. }) => {}
                    Err(e) => panic!("unexpected {e}"),
                }
                assert!(buffer.number_of_tuples() <= layout.capacity());
            }
            assert_eq!(written, layout.capacity());
            for i in 0..written {
                assert_eq!(
                    layout.read_record(&buffer, i).unwrap()[0],
                    Value::Int(i as i64),
                    "{kind:?} buffer of {size} bytes"
                );
            }
        }
    }
}

#[test]
fn fusing_never_merges_blocking_operators() {
    let ids = Arc::new(IdGenerator::new());
    let window = |size| {
        WindowDefinition::new(WindowType::tumbling(size), TimeCharacteristic::event_time("ts"))
            .aggregate(WindowAggregation::count())
    };
    let plan = QueryBuilder::from_source(&ids, "events", events())
        .filter(col("value").gt(lit(0)))
        .window(window(100).aggregate(WindowAggregation::max("ts")))
        .map("ts", col("max_ts"))
        .window(window(1000))
        .sink(SinkDescriptor::collect(ResultCollector::new()))
        .build()
        .unwrap();
    let compiled = QueryCompiler::new(&ids, Arc::new(FuseIfPossiblePolicy), Arc::new(InterpreterBackend))
        .compile(plan)
        .unwrap();
    let plan = compiled.pipelines().plan();
    for pipeline in compiled.pipelines().pipelines() {
        let blocking = pipeline
            .operators()
            .iter()
            .filter_map(|id| plan.node(*id).and_then(|n| n.kind().as_physical()))
            .filter(|op| op.is_blocking() && !op.is_terminal())
            .count();
        assert!(blocking <= 1, "{:?} fuses {blocking} blocking operators", pipeline.operators());
    }
}

#[test]
fn windows_are_emitted_once_and_late_records_never_counted() {
    let config = EngineConfig {
        number_of_workers: 4,
        buffer_size_bytes: 256,
        ..EngineConfig::default()
    };
    let engine = NodeEngine::new(config).unwrap();
    let results = ResultCollector::new();
    let windowed = QueryBuilder::from_source(engine.ids(), "events", events())
        .key_by(["key"])
        .window(
            WindowDefinition::new(WindowType::tumbling(100), TimeCharacteristic::event_time("ts"))
                .aggregate(WindowAggregation::count())
                .aggregate(WindowAggregation::sum("value"))
                .trigger_policy(TriggerPolicy::OnRecord),
        );
    let window = windowed.head().unwrap();
    let plan = windowed
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let id = engine.deploy(&engine.compile(plan).unwrap()).unwrap();
    engine.start(id).unwrap();
    let query = engine.query(id).unwrap();
    let handler = query.window_handler(window).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let handler = Arc::clone(&handler);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut observed = Vec::new();
            while !done.load(Ordering::Acquire) {
                observed.push(handler.watermark());
                thread::yield_now();
            }
            observed
        })
    };

    // Rounds of 50 records; each round ends with a watermark at its last
    // timestamp, then sends one record that is already late.
    let mut expected_late = 0;
    for round in 0..20i64 {
        let records: Vec<_> = (0..50i64)
            .map(|i| {
                let ts = round * 500 + i * 10;
                vec![Value::Int(ts), Value::UInt((i % 3) as u64), Value::Int(1)]
            })
            .collect();
        query.submit_records("events", &records).unwrap();
        query.inject_watermark("events", round * 500 + 490).unwrap();
        assert!(query.wait_idle(Duration::from_secs(10)));
        if round > 0 {
            let late = vec![Value::Int(round * 500 - 200), Value::UInt(0), Value::Int(1_000_000)];
            query.submit_records("events", &[late]).unwrap();
            expected_late += 1;
        }
    }
    query.inject_watermark("events", 100_000).unwrap();
    assert!(query.wait_idle(Duration::from_secs(10)));
    done.store(true, Ordering::Release);

    let observed = observer.join().unwrap();
    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "watermark went backwards");

    let rows = results.rows();
    let mut seen = HashSet::new();
    for row in &rows {
        let window_key = (row[0].clone(), row[1].clone(), row[2].clone());
        assert!(seen.insert(format!("{window_key:?}")), "{window_key:?} emitted twice");
        assert!(matches!(row[4], Value::Int(v) if v < 1_000_000), "late record counted");
    }
    let total: u64 = rows
        .iter()
        .map(|r| match r[3] {
            Value::UInt(n) => n,
            ref other => panic!("unexpected count {other:?}"),
        })
        .sum();
    assert_eq!(total, 20 * 50);
    assert_eq!(handler.metrics().late_records_dropped(), expected_late);
    engine.shutdown();
}
