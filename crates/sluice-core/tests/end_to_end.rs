//! Whole queries under every compiler configuration, with file and Arrow
//! output.

use std::sync::Arc;
use std::time::Duration;

use sluice_core::config::{BackendKind, CompilerConfig, EngineConfig, PipeliningKind};
use sluice_core::expr::{col, lit};
use sluice_core::memory::LayoutKind;
use sluice_core::plan::QueryBuilder;
use sluice_core::runtime::{InlineDispatcher, NodeEngine, QueryStatus};
use sluice_core::sink::{FormatKind, ResultCollector, SinkDescriptor};
use sluice_core::types::{DataType, Field, Schema, SchemaRef, Value};
use sluice_core::window::{
    TimeCharacteristic, WatermarkStrategy, WindowAggregation, WindowDefinition, WindowType,
};

fn cars() -> SchemaRef {
    Arc::new(
        Schema::new(vec![
            Field::new("ts", DataType::int64()),
            Field::new("id", DataType::uint32()),
            Field::new("speed", DataType::int32()),
        ])
        .unwrap(),
    )
}

fn traffic() -> Vec<Vec<Value>> {
    (0..40i64)
        .map(|i| {
            let speed = if i % 3 == 0 { 30 } else { 50 + i };
            vec![Value::Int(i * 50), Value::UInt((i % 2) as u64), Value::Int(speed)]
        })
        .collect()
}

fn builder(engine: &NodeEngine, sink: SinkDescriptor) -> QueryBuilder {
    QueryBuilder::from_source(engine.ids(), "cars", cars())
        .assign_watermarks(WatermarkStrategy::event_time("ts", 100))
        .filter(col("speed").gt(lit(40)))
        .map("fast", col("speed") * lit(2))
        .key_by(["id"])
        .window(
            WindowDefinition::new(WindowType::sliding(1000, 500), TimeCharacteristic::event_time("ts"))
                .aggregate(WindowAggregation::count())
                .aggregate(WindowAggregation::max("fast"))
                .aggregate(WindowAggregation::avg("speed")),
        )
        .sink(sink)
}

fn run_config(compiler: CompilerConfig, layout: LayoutKind) -> Vec<Vec<Value>> {
    let config = EngineConfig {
        buffer_size_bytes: 128,
        layout,
        compiler,
        ..EngineConfig::default()
    };
    let engine = NodeEngine::with_dispatcher(config, Arc::new(InlineDispatcher::new())).unwrap();
    let results = ResultCollector::new();
    let plan = builder(&engine, SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();
    let compiled = engine.compile(plan).unwrap();
    let id = engine.deploy(&compiled).unwrap();
    engine.start(id).unwrap();
    let query = engine.query(id).unwrap();
    query.submit_records("cars", &traffic()).unwrap();
    query.inject_watermark("cars", 5000).unwrap();
    query.finish().unwrap();
    assert_eq!(query.status(), QueryStatus::Finished);
    assert_eq!(query.statistics().tasks_failed, 0);
    engine.shutdown();
    results.rows()
}

#[test]
fn test_every_configuration_agrees() {
    let mut outputs = Vec::new();
    for pipelining in [PipeliningKind::FuseIfPossible, PipeliningKind::AlwaysBreak] {
        for backend in [BackendKind::Interpreter, BackendKind::Closure] {
            for layout in [LayoutKind::Row, LayoutKind::Columnar] {
                let rows = run_config(CompilerConfig { pipelining, backend }, layout);
                outputs.push(((pipelining, backend, layout), rows));
            }
        }
    }
    let (_, reference) = &outputs[0];
    assert!(!reference.is_empty());
    for (config, rows) in &outputs[1..] {
        assert_eq!(rows, reference, "{config:?} diverged");
    }

    // Window [0, 1000) of key 0: ts 0..=900 step 100, speed 30 at i % 3 == 0.
    let first = reference
        .iter()
        .find(|r| r[0] == Value::Int(0) && r[1] == Value::Int(1000) && r[2] == Value::UInt(0))
        .expect("window [0, 1000) for key 0");
    assert_eq!(first[3], Value::UInt(6));
    assert_eq!(first[4], Value::Int(2 * (50 + 16)));
    // (52 + 54 + 58 + 60 + 64 + 66) / 6
    assert_eq!(first[5], Value::Float(59.0));
}

#[test]
fn test_csv_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fast_cars.csv");
    let engine =
        NodeEngine::with_dispatcher(EngineConfig::default(), Arc::new(InlineDispatcher::new()))
            .unwrap();
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .filter(col("speed").gt(lit(60)))
        .project(["id", "speed"])
        .sink(SinkDescriptor::file(&path, FormatKind::Csv))
        .build()
        .unwrap();
    let id = engine.deploy(&engine.compile(plan).unwrap()).unwrap();
    engine.start(id).unwrap();
    engine
        .query(id)
        .unwrap()
        .submit_records(
            "cars",
            &[
                vec![Value::Int(1), Value::UInt(7), Value::Int(80)],
                vec![Value::Int(2), Value::UInt(8), Value::Int(20)],
                vec![Value::Int(3), Value::UInt(9), Value::Int(65)],
            ],
        )
        .unwrap();
    assert!(engine.undeploy(id));

    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written, "id,speed\n7,80\n9,65\n");
}

#[test]
fn test_json_file_sink_and_arrow_export() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("windows.jsonl");
    let engine =
        NodeEngine::with_dispatcher(EngineConfig::default(), Arc::new(InlineDispatcher::new()))
            .unwrap();
    let results = ResultCollector::new();
    let window = || {
        WindowDefinition::new(WindowType::tumbling(1000), TimeCharacteristic::event_time("ts"))
            .aggregate(WindowAggregation::sum("speed"))
    };
    let to_file = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .key_by(["id"])
        .window(window())
        .sink(SinkDescriptor::file(&path, FormatKind::Json))
        .build()
        .unwrap();
    let to_memory = QueryBuilder::from_source(engine.ids(), "cars", cars())
        .key_by(["id"])
        .window(window())
        .sink(SinkDescriptor::collect(results.clone()))
        .build()
        .unwrap();

    let mut queries = Vec::new();
    for plan in [to_file, to_memory] {
        let id = engine.deploy(&engine.compile(plan).unwrap()).unwrap();
        engine.start(id).unwrap();
        queries.push(id);
    }
    let records = [
        vec![Value::Int(10), Value::UInt(1), Value::Int(5)],
        vec![Value::Int(20), Value::UInt(2), Value::Int(6)],
        vec![Value::Int(30), Value::UInt(1), Value::Int(7)],
    ];
    for id in &queries {
        let query = engine.query(*id).unwrap();
        query.submit_records("cars", &records).unwrap();
        query.inject_watermark("cars", 1000).unwrap();
        assert!(query.wait_idle(Duration::from_secs(5)));
    }
    engine.shutdown();

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], 1);
    assert_eq!(lines[0]["sum_speed"], 12);
    assert_eq!(lines[1]["end"], 1000);

    let batch = results.to_record_batch().unwrap().expect("schema known");
    assert_eq!(batch.num_rows(), 2);
    assert_eq!(batch.num_columns(), 4);
    assert_eq!(batch.schema().field(3).name(), "sum_speed");
}
