use std::sync::Arc;

use super::*;
use crate::memory::{MemoryLayout, TupleBuffer};
use crate::plan::OperatorId;
use crate::types::{DataType, Field, Schema, SchemaRef, Value};

fn schema(prefix: &str) -> SchemaRef {
    Arc::new(
        Schema::new(vec![
            Field::new(format!("{prefix}ts"), DataType::int64()),
            Field::new(format!("{prefix}id"), DataType::uint32()),
            Field::new(format!("{prefix}value"), DataType::int64()),
        ])
        .unwrap(),
    )
}

fn layout(schema: &SchemaRef) -> MemoryLayout {
    MemoryLayout::row(Arc::clone(schema), 4096).unwrap()
}

fn buffer(
    layout: &MemoryLayout,
    origin: u64,
    sequence: u64,
    watermark: i64,
    rows: &[(i64, u32, i64)],
) -> TupleBuffer {
    let mut buffer = TupleBuffer::unpooled(layout.buffer_size());
    for (ts, id, value) in rows {
        layout
            .push_record(
                &mut buffer,
                &[Value::Int(*ts), Value::UInt(u64::from(*id)), Value::Int(*value)],
            )
            .unwrap();
    }
    let header = buffer.header_mut();
    header.origin_id = origin;
    header.sequence_number = sequence;
    header.watermark = watermark;
    header.last_chunk = true;
    buffer
}

/// Inserts `buffers` into the first store and runs every round that
/// becomes due.
fn feed(
    handler: &WindowOperatorHandler,
    stores: &mut [WindowStore],
    layout: &MemoryLayout,
    buffers: &[TupleBuffer],
) -> Vec<Vec<Value>> {
    let mut out = Vec::new();
    for b in buffers {
        handler.insert_buffer(&mut stores[0], layout, b).unwrap();
        if handler.round_due() {
            out.extend(handler.trigger(stores).into_iter().flat_map(|o| o.records));
        }
    }
    out
}

fn count_window(window_type: WindowType) -> WindowDefinition {
    WindowDefinition::new(window_type, TimeCharacteristic::event_time("ts"))
        .aggregate(WindowAggregation::count())
}

fn handler(definition: WindowDefinition, input: &SchemaRef) -> WindowOperatorHandler {
    WindowOperatorHandler::new(OperatorId(10), Arc::new(definition), input, &[1], 1).unwrap()
}

#[test]
fn test_tumbling_window_emits_after_watermark() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(
        count_window(WindowType::tumbling(1000)).aggregate(WindowAggregation::sum("value")),
        &input,
    );
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 0, &[(100, 1, 1), (900, 1, 2), (1100, 1, 3), (1900, 1, 4)]),
            buffer(&layout, 1, 2, 2000, &[]),
        ],
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(0), Value::Int(1000), Value::UInt(2), Value::Int(3)],
            vec![Value::Int(1000), Value::Int(2000), Value::UInt(2), Value::Int(7)],
        ]
    );
    assert_eq!(handler.metrics().records_inserted(), 4);
    assert!(stores[0].is_empty());
}

#[test]
fn test_record_behind_close_threshold_is_dropped() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(
        count_window(WindowType::tumbling(1000)).allowed_lateness(500),
        &input,
    );
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 1400, &[(100, 1, 0), (900, 1, 0)]),
            // threshold 900: still accepted
            buffer(&layout, 1, 2, 1400, &[(920, 1, 0)]),
            buffer(&layout, 1, 3, 1600, &[]),
            // threshold 1100: late
            buffer(&layout, 1, 4, 1600, &[(950, 1, 0)]),
            buffer(&layout, 1, 5, 2500, &[]),
        ],
    );
    assert_eq!(
        rows,
        vec![vec![Value::Int(0), Value::Int(1000), Value::UInt(3)]]
    );
    assert_eq!(handler.metrics().late_records_dropped(), 1);
}

#[test]
fn test_window_waits_for_sequence_gap() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(count_window(WindowType::tumbling(100)), &input);
    let mut stores = vec![WindowStore::default()];
    let early = feed(&handler, &mut stores, &layout, &[buffer(&layout, 1, 2, 500, &[(350, 1, 0)])]);
    assert!(early.is_empty());
    assert_eq!(handler.watermark(), i64::MIN);
    let rows = feed(&handler, &mut stores, &layout, &[buffer(&layout, 1, 1, 100, &[(50, 1, 0)])]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][..2], [Value::Int(0), Value::Int(100)]);
    assert_eq!(rows[1][..2], [Value::Int(300), Value::Int(400)]);
}

#[test]
fn test_sliding_windows_share_slices() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(count_window(WindowType::sliding(1000, 500)), &input);
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 0, &[(100, 1, 0), (600, 1, 0), (1200, 1, 0)]),
            buffer(&layout, 1, 2, 2000, &[]),
        ],
    );
    let windows: Vec<(Value, Value, Value)> = rows
        .into_iter()
        .map(|r| (r[0].clone(), r[1].clone(), r[2].clone()))
        .collect();
    assert_eq!(
        windows,
        vec![
            (Value::Int(-500), Value::Int(500), Value::UInt(1)),
            (Value::Int(0), Value::Int(1000), Value::UInt(2)),
            (Value::Int(500), Value::Int(1500), Value::UInt(2)),
            (Value::Int(1000), Value::Int(2000), Value::UInt(1)),
        ]
    );
}

#[test]
fn test_keyed_rows_sorted_by_end_then_key() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(
        count_window(WindowType::tumbling(1000)).key_by(["id"]),
        &input,
    );
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 0, &[(10, 7, 0), (20, 3, 0), (30, 7, 0), (1500, 3, 0)]),
            buffer(&layout, 1, 2, 3000, &[]),
        ],
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(0), Value::Int(1000), Value::UInt(3), Value::UInt(1)],
            vec![Value::Int(0), Value::Int(1000), Value::UInt(7), Value::UInt(2)],
            vec![Value::Int(1000), Value::Int(2000), Value::UInt(3), Value::UInt(1)],
        ]
    );
}

#[test]
fn test_session_windows_per_key() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(count_window(WindowType::session(100)).key_by(["id"]), &input);
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 0, &[(0, 1, 0), (50, 1, 0), (10, 2, 0), (500, 1, 0)]),
            buffer(&layout, 1, 2, 1000, &[]),
        ],
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(10), Value::Int(110), Value::UInt(2), Value::UInt(1)],
            vec![Value::Int(0), Value::Int(150), Value::UInt(1), Value::UInt(2)],
            vec![Value::Int(500), Value::Int(600), Value::UInt(1), Value::UInt(1)],
        ]
    );
}

#[test]
fn test_slice_aggregation_emits_each_slice_once() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(
        count_window(WindowType::sliding(1000, 500)).trigger_action(TriggerAction::SliceAggregation),
        &input,
    );
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 0, &[(100, 1, 0), (600, 1, 0), (700, 1, 0)]),
            buffer(&layout, 1, 2, 1000, &[]),
            buffer(&layout, 1, 3, 1200, &[]),
        ],
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(0), Value::Int(500), Value::UInt(1)],
            vec![Value::Int(500), Value::Int(1000), Value::UInt(2)],
        ]
    );
}

#[test]
fn test_on_time_policy_waits_for_explicit_trigger() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(
        count_window(WindowType::tumbling(100))
            .trigger_policy(TriggerPolicy::OnTime { trigger_time_ms: 10 }),
        &input,
    );
    let mut stores = vec![WindowStore::default()];
    let rows = feed(&handler, &mut stores, &layout, &[buffer(&layout, 1, 1, 200, &[(5, 1, 0)])]);
    assert!(rows.is_empty());
    let outputs = handler.trigger(&mut stores);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].sequence, 1);
    assert_eq!(outputs[0].watermark, 200);
    assert_eq!(outputs[0].records, vec![vec![Value::Int(0), Value::Int(100), Value::UInt(1)]]);
    assert!(handler.trigger(&mut stores).is_empty());
}

#[test]
fn test_round_completes_with_last_hand_off() {
    let input = schema("");
    let layout = layout(&input);
    let handler = WindowOperatorHandler::new(
        OperatorId(3),
        Arc::new(count_window(WindowType::tumbling(100))),
        &input,
        &[1],
        2,
    )
    .unwrap();
    let mut stores = [WindowStore::default(), WindowStore::default()];
    let [first, second] = &mut stores;
    handler
        .insert_buffer(first, &layout, &buffer(&layout, 1, 1, 0, &[(10, 1, 0), (20, 1, 0)]))
        .unwrap();
    handler
        .insert_buffer(second, &layout, &buffer(&layout, 1, 2, 150, &[(30, 1, 0)]))
        .unwrap();
    assert!(handler.round_due());
    assert!(!handler.round_due());

    let early = handler.hand_off(first);
    assert!(early.output.is_none());
    assert!(handler.round_active());
    let last = handler.hand_off(second);
    let output = last.output.unwrap();
    assert!(!last.next_round);
    assert_eq!(output.sequence, 1);
    assert_eq!(output.records, vec![vec![Value::Int(0), Value::Int(100), Value::UInt(3)]]);
    assert!(!handler.round_active());
    assert!(stores.iter().all(WindowStore::is_empty));
}

#[test]
fn test_worker_stores_emit_each_window_once_in_order() {
    let input = schema("");
    let layout = layout(&input);
    let handler = WindowOperatorHandler::new(
        OperatorId(3),
        Arc::new(count_window(WindowType::tumbling(100))),
        &input,
        &[1],
        4,
    )
    .unwrap();
    let mut stores: Vec<WindowStore> = (0..4).map(|_| WindowStore::default()).collect();
    let mut outputs = Vec::new();
    for i in 0..100usize {
        let base = i as i64 * 10;
        let rows: Vec<_> = (0..10).map(|k| (base + k, 1, 0)).collect();
        let b = buffer(&layout, 1, i as u64 + 1, base, &rows);
        handler.insert_buffer(&mut stores[i % 4], &layout, &b).unwrap();
        if handler.round_due() {
            outputs.extend(handler.trigger(&mut stores));
        }
    }
    handler
        .insert_buffer(&mut stores[0], &layout, &buffer(&layout, 1, 101, 10_000, &[]))
        .unwrap();
    if handler.round_due() {
        outputs.extend(handler.trigger(&mut stores));
    }

    let sequences: Vec<u64> = outputs.iter().map(|o| o.sequence).collect();
    assert_eq!(sequences, (1..=outputs.len() as u64).collect::<Vec<_>>());
    let rows: Vec<Vec<Value>> = outputs.into_iter().flat_map(|o| o.records).collect();
    assert_eq!(rows.len(), 10);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row[0], Value::Int(i as i64 * 100));
        assert_eq!(row[2], Value::UInt(100));
    }
    assert_eq!(handler.metrics().late_records_dropped(), 0);
}

#[test]
fn test_windows_at_ends_of_time_range() {
    assert_eq!(
        WindowType::tumbling(10).windows_of_slice(i64::MAX - 7),
        vec![(i64::MAX - 7, i64::MAX)]
    );
    assert_eq!(
        WindowType::sliding(10, 5).windows_of_slice(i64::MAX - 7),
        vec![(i64::MAX - 12, i64::MAX - 2), (i64::MAX - 7, i64::MAX)]
    );
    assert_eq!(
        WindowType::tumbling(10).windows_of_slice(i64::MIN),
        vec![(i64::MIN, i64::MIN + 10)]
    );
    assert!(WindowType::sliding(10, 5).windows_of_slice(i64::MIN).is_empty());
}

#[test]
fn test_record_near_max_timestamp_closes_at_max_watermark() {
    let input = schema("");
    let layout = layout(&input);
    let handler = handler(count_window(WindowType::sliding(10, 5)), &input);
    let mut stores = vec![WindowStore::default()];
    let rows = feed(
        &handler,
        &mut stores,
        &layout,
        &[
            buffer(&layout, 1, 1, 0, &[(i64::MAX - 5, 1, 0)]),
            buffer(&layout, 1, 2, i64::MAX, &[]),
        ],
    );
    assert_eq!(
        rows,
        vec![
            vec![Value::Int(i64::MAX - 12), Value::Int(i64::MAX - 2), Value::UInt(1)],
            vec![Value::Int(i64::MAX - 7), Value::Int(i64::MAX), Value::UInt(1)],
        ]
    );
    assert!(stores[0].is_empty());
}

#[test]
fn test_invalid_definition_rejected() {
    let input = schema("");
    let bad_time = WindowDefinition::new(
        WindowType::tumbling(10),
        TimeCharacteristic::event_time("missing"),
    );
    assert!(matches!(
        WindowOperatorHandler::new(OperatorId(1), Arc::new(bad_time), &input, &[1], 1),
        Err(WindowError::FieldNotFound(_))
    ));
    let zero = count_window(WindowType::tumbling(0));
    assert!(matches!(
        WindowOperatorHandler::new(OperatorId(1), Arc::new(zero), &input, &[1], 1),
        Err(WindowError::InvalidWindow(_))
    ));
}

#[test]
fn test_join_matches_keys_within_window() {
    let (left, right) = (schema("l_"), schema("r_"));
    let (left_layout, right_layout) = (layout(&left), layout(&right));
    let definition = JoinDefinition::new(
        "l_id",
        "r_id",
        WindowType::tumbling(1000),
        TimeCharacteristic::event_time("l_ts"),
        TimeCharacteristic::event_time("r_ts"),
    );
    let handler =
        JoinOperatorHandler::new(OperatorId(20), Arc::new(definition), &left, &right, &[1, 2], 2)
            .unwrap();
    let mut stores = [JoinStore::default(), JoinStore::default()];
    let mut rows = Vec::new();
    let inputs = [
        (JoinSide::Left, &left_layout, buffer(&left_layout, 1, 1, 0, &[(100, 1, 10), (200, 2, 20)])),
        (JoinSide::Right, &right_layout, buffer(&right_layout, 2, 1, 0, &[(300, 1, 30), (1500, 1, 40)])),
        (JoinSide::Left, &left_layout, buffer(&left_layout, 1, 2, 2000, &[])),
        (JoinSide::Right, &right_layout, buffer(&right_layout, 2, 2, 2000, &[])),
    ];
    for (worker, (side, layout, b)) in inputs.iter().enumerate() {
        handler
            .insert_buffer(&mut stores[worker % 2], *side, layout, b)
            .unwrap();
        if handler.round_due() {
            rows.extend(handler.trigger(&mut stores).into_iter().flat_map(|o| o.records));
        }
    }
    assert_eq!(
        rows,
        vec![vec![
            Value::Int(0),
            Value::Int(1000),
            Value::Int(100),
            Value::UInt(1),
            Value::Int(10),
            Value::Int(300),
            Value::UInt(1),
            Value::Int(30),
        ]]
    );
    assert_eq!(handler.metrics().records_inserted(), 4);
    assert!(stores.iter().all(JoinStore::is_empty));
}

#[test]
fn test_join_output_schema_rejects_duplicate_names() {
    let definition = JoinDefinition::new(
        "ts",
        "ts",
        WindowType::tumbling(10),
        TimeCharacteristic::event_time("ts"),
        TimeCharacteristic::event_time("ts"),
    );
    assert!(definition.output_schema(&schema(""), &schema("")).is_err());
    assert!(definition.output_schema(&schema("l_"), &schema("r_")).is_ok());
}
