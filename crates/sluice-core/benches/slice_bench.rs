//! Slice insertion and trigger benchmarks
//!
//! Run with: cargo bench --bench slice_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sluice_core::memory::{MemoryLayout, TupleBuffer};
use sluice_core::plan::OperatorId;
use sluice_core::types::{DataType, Field, Schema, SchemaRef, Value};
use sluice_core::window::{
    TimeCharacteristic, WindowAggregation, WindowDefinition, WindowOperatorHandler, WindowStore,
    WindowType,
};

const ORIGIN: u64 = 1;
const BUFFER_SIZE: usize = 64 * 1024;

fn schema() -> SchemaRef {
    Arc::new(
        Schema::new(vec![
            Field::new("ts", DataType::int64()),
            Field::new("key", DataType::uint32()),
            Field::new("value", DataType::int64()),
        ])
        .unwrap(),
    )
}

/// A full buffer of records spread over `keys` keys, starting at `start`.
fn filled_buffer(layout: &MemoryLayout, start: i64, keys: u64, sequence: u64) -> TupleBuffer {
    let mut buffer = TupleBuffer::unpooled(BUFFER_SIZE);
    let mut i = 0u64;
    while !layout.is_full(&buffer) {
        let ts = start + i64::try_from(i).unwrap();
        let record = [Value::Int(ts), Value::UInt(i % keys), Value::Int(1)];
        layout.push_record(&mut buffer, &record).unwrap();
        i += 1;
    }
    let header = buffer.header_mut();
    header.origin_id = ORIGIN;
    header.sequence_number = sequence;
    header.watermark = start;
    buffer
}

fn handler(window_type: WindowType, input: &SchemaRef) -> WindowOperatorHandler {
    let definition = WindowDefinition::new(window_type, TimeCharacteristic::event_time("ts"))
        .key_by(["key"])
        .aggregate(WindowAggregation::count())
        .aggregate(WindowAggregation::sum("value"));
    WindowOperatorHandler::new(OperatorId(1), Arc::new(definition), input, &[ORIGIN], 1).unwrap()
}

/// Benchmark inserting one buffer into the slice store
fn bench_slice_insert(c: &mut Criterion) {
    let input = schema();
    let layout = MemoryLayout::row(Arc::clone(&input), BUFFER_SIZE).unwrap();
    let mut group = c.benchmark_group("slice_insert");

    for keys in [1u64, 64, 4096] {
        let buffer = filled_buffer(&layout, 0, keys, 1);
        group.throughput(Throughput::Elements(buffer.number_of_tuples() as u64));
        group.bench_with_input(BenchmarkId::new("tumbling", keys), &buffer, |b, buffer| {
            let handler = handler(WindowType::tumbling(1000), &input);
            let mut store = WindowStore::default();
            b.iter(|| {
                handler
                    .insert_buffer(&mut store, &layout, black_box(buffer))
                    .unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark closing and emitting windows
fn bench_trigger(c: &mut Criterion) {
    let input = schema();
    let layout = MemoryLayout::row(Arc::clone(&input), BUFFER_SIZE).unwrap();
    let mut group = c.benchmark_group("window_trigger");

    for (name, window_type) in [
        ("tumbling", WindowType::tumbling(100)),
        ("sliding", WindowType::sliding(400, 100)),
    ] {
        let data = filled_buffer(&layout, 0, 64, 1);
        let mut close = TupleBuffer::control();
        let header = close.header_mut();
        header.origin_id = ORIGIN;
        header.sequence_number = 2;
        header.watermark = i64::MAX / 2;

        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let handler = handler(window_type, &input);
                    let mut stores = [WindowStore::default()];
                    handler.insert_buffer(&mut stores[0], &layout, &data).unwrap();
                    (handler, stores)
                },
                |(handler, mut stores)| {
                    handler.insert_buffer(&mut stores[0], &layout, &close).unwrap();
                    let rows: usize = handler
                        .trigger(&mut stores)
                        .iter()
                        .map(|output| output.records.len())
                        .sum();
                    black_box(rows)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_slice_insert, bench_trigger);
criterion_main!(benches);
