use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::session::SessionStore;
use super::{
    floor_to, Accumulator, MultiOriginWatermarkProcessor, Slice, SliceKey, SliceState,
    ThreadLocalSliceStore, TimeCharacteristic, TriggerAction, TriggerPolicy, WindowDefinition,
    WindowError, WindowType,
};
use crate::memory::{now_millis, BufferError, MemoryLayout, TupleBuffer};
use crate::plan::OperatorId;
use crate::types::{PhysicalType, Schema, TypeError, Value};

/// Counters kept by a window or join handler.
#[derive(Debug, Default)]
pub struct WindowMetrics {
    records_inserted: AtomicU64,
    late_records_dropped: AtomicU64,
    windows_emitted: AtomicU64,
    triggers: AtomicU64,
}

impl WindowMetrics {
    /// Records accepted into a slice store.
    #[must_use]
    pub fn records_inserted(&self) -> u64 {
        self.records_inserted.load(Ordering::Relaxed)
    }

    /// Records dropped because they arrived behind the close threshold.
    #[must_use]
    pub fn late_records_dropped(&self) -> u64 {
        self.late_records_dropped.load(Ordering::Relaxed)
    }

    /// Result rows emitted.
    #[must_use]
    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted.load(Ordering::Relaxed)
    }

    /// Triggers that advanced the close threshold.
    #[must_use]
    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::Relaxed)
    }

    pub(crate) fn add_inserted(&self, n: u64) {
        self.records_inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_late(&self, n: u64) {
        self.late_records_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_emitted(&self, n: u64) {
        self.windows_emitted.fetch_add(n, Ordering::Relaxed);
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result rows of one trigger, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutput {
    /// Sequence number of this emission under the handler's origin, from 1.
    pub sequence: u64,
    /// Close threshold the trigger advanced to.
    pub watermark: i64,
    /// Rows matching the handler's output schema.
    pub records: Vec<Vec<Value>>,
}

/// Resolved record timestamp source.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimeSource {
    Field(usize),
    Ingestion,
}

impl TimeSource {
    pub(crate) fn resolve(time: &TimeCharacteristic, schema: &Schema) -> Result<Self, WindowError> {
        match time {
            TimeCharacteristic::EventTime { field } => schema
                .index_of(field)
                .map(Self::Field)
                .ok_or_else(|| WindowError::FieldNotFound(field.clone())),
            TimeCharacteristic::IngestionTime => Ok(Self::Ingestion),
        }
    }

    pub(crate) fn timestamp(
        self,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
        record: usize,
        now: i64,
    ) -> Result<i64, BufferError> {
        match self {
            Self::Ingestion => Ok(now),
            Self::Field(index) => {
                let value = layout.read_field(buffer, record, index)?;
                value.as_i64().ok_or_else(|| {
                    BufferError::Codec(TypeError::ValueOutOfRange {
                        value: value.to_string(),
                        target: "int64 timestamp".into(),
                    })
                })
            }
        }
    }
}

/// Encodes key fields as raw bytes and decodes them again for output.
#[derive(Debug, Clone)]
pub(crate) struct KeyCodec {
    indices: Vec<usize>,
    types: Vec<PhysicalType>,
}

impl KeyCodec {
    pub(crate) fn new(keys: &[String], schema: &Schema) -> Result<Self, WindowError> {
        let mut indices = Vec::with_capacity(keys.len());
        let mut types = Vec::with_capacity(keys.len());
        for key in keys {
            let index = schema
                .index_of(key)
                .ok_or_else(|| WindowError::FieldNotFound(key.clone()))?;
            let physical = PhysicalType::from_data_type(schema.fields()[index].data_type())
                .map_err(|e| WindowError::InvalidWindow(format!("key '{key}': {e}")))?;
            indices.push(index);
            types.push(physical);
        }
        Ok(Self { indices, types })
    }

    pub(crate) fn encode_into(
        &self,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
        record: usize,
        out: &mut SliceKey,
    ) -> Result<(), BufferError> {
        out.clear();
        for &index in &self.indices {
            out.extend_from_slice(layout.field_bytes(buffer, record, index)?);
        }
        Ok(())
    }

    pub(crate) fn decode(&self, key: &[u8]) -> Result<Vec<Value>, TypeError> {
        let mut values = Vec::with_capacity(self.types.len());
        let mut offset = 0;
        for ty in &self.types {
            let end = offset + ty.size();
            let bytes = key.get(offset..end).ok_or_else(|| TypeError::ValueOutOfRange {
                value: format!("{} key bytes", key.len()),
                target: format!("{ty:?}"),
            })?;
            values.push(ty.read(bytes)?);
            offset = end;
        }
        Ok(values)
    }
}

/// `watermark - lateness`, saturating at `i64::MIN`.
pub(crate) fn close_threshold(watermark: i64, lateness: i64) -> i64 {
    watermark.saturating_sub(lateness)
}

/// Orders rows column by column with [`Value::total_cmp`].
pub(crate) fn compare_rows(a: &[Value], b: &[Value]) -> std::cmp::Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

/// One closed round: windows ending in `(from, to]` are due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Round {
    pub(crate) from: i64,
    pub(crate) to: i64,
    pub(crate) sequence: u64,
}

/// Hand-off rounds of one handler.
///
/// A round collects the closed state of every worker store up to one close
/// threshold. Rounds never overlap and every worker takes part in each, so
/// outputs are numbered and emitted in threshold order.
#[derive(Debug)]
pub(crate) struct RoundClock {
    workers: usize,
    last_threshold: i64,
    next_sequence: u64,
    /// Threshold of the running round and the hand-offs it still waits for.
    active: Option<(i64, usize)>,
}

impl RoundClock {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            last_threshold: i64::MIN,
            next_sequence: 1,
            active: None,
        }
    }

    /// Begins a round up to `threshold` unless one is running or nothing
    /// closed since the last one.
    pub(crate) fn begin(&mut self, threshold: i64) -> bool {
        if self.active.is_some() || threshold <= self.last_threshold {
            return false;
        }
        self.active = Some((threshold, self.workers));
        true
    }

    pub(crate) fn active(&self) -> Option<i64> {
        self.active.map(|(threshold, _)| threshold)
    }

    /// Counts one hand-off; returns the round once the last worker handed off.
    pub(crate) fn handed_off(&mut self) -> Option<Round> {
        let (threshold, remaining) = self.active.as_mut()?;
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return None;
        }
        let round = Round {
            from: self.last_threshold,
            to: *threshold,
            sequence: self.next_sequence,
        };
        self.active = None;
        self.last_threshold = round.to;
        self.next_sequence += 1;
        Some(round)
    }
}

/// What one worker's hand-off produced.
#[derive(Debug, Default)]
pub struct HandOff {
    /// Results of the round, present when this hand-off completed it.
    pub output: Option<TriggerOutput>,
    /// The next round began right away; every store must hand off again.
    pub next_round: bool,
}

#[derive(Debug, Clone, Copy)]
enum Slicing {
    Fixed { size: i64 },
    Sessions { gap: i64 },
}

/// Slices and sessions of one worker.
///
/// Owned by the worker that inserts into it. The coordinator only sees the
/// closed part, which the owner hands over in
/// [`hand_off`](WindowOperatorHandler::hand_off).
#[derive(Debug, Default)]
pub struct WindowStore {
    slices: ThreadLocalSliceStore,
    sessions: SessionStore,
}

impl WindowStore {
    /// Slices and sessions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len() + self.sessions.len()
    }

    /// Returns `true` if the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Coordinator {
    clock: RoundClock,
    slices: BTreeMap<i64, Slice>,
    sessions: SessionStore,
}

/// Shared state of one windowed aggregation.
///
/// The `SlicePreAggregation` stage inserts records into the
/// [`WindowStore`] of the executing worker. When the trigger policy fires a
/// hand-off round begins: every worker hands its closed slices to the merge
/// coordinator, and the last one to do so receives the result rows for the
/// `WindowSink` pipeline.
pub struct WindowOperatorHandler {
    id: OperatorId,
    definition: Arc<WindowDefinition>,
    slicing: Slicing,
    time: TimeSource,
    keys: KeyCodec,
    agg_inputs: Vec<Option<usize>>,
    template: Vec<Accumulator>,
    processor: MultiOriginWatermarkProcessor,
    coordinator: Mutex<Coordinator>,
    /// Threshold of the latest round begun.
    begun: AtomicI64,
    metrics: WindowMetrics,
}

impl std::fmt::Debug for WindowOperatorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowOperatorHandler")
            .field("id", &self.id)
            .field("window_type", &self.definition.window_type)
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

impl WindowOperatorHandler {
    /// Creates the handler for window `id` reading records of `input`.
    ///
    /// `origins` are the upstream origin ids whose watermarks gate the
    /// window; `workers` is the number of stores that hand off in every
    /// round.
    ///
    /// # Errors
    ///
    /// Returns a [`WindowError`] if the definition does not fit `input`.
    pub fn new(
        id: OperatorId,
        definition: Arc<WindowDefinition>,
        input: &Schema,
        origins: &[u64],
        workers: usize,
    ) -> Result<Self, WindowError> {
        definition.validate(input)?;
        let slicing = match definition.window_type {
            WindowType::Session { gap } => Slicing::Sessions { gap },
            other => Slicing::Fixed {
                size: other.slice_size().unwrap_or(1),
            },
        };
        let mut agg_inputs = Vec::with_capacity(definition.aggregations.len());
        let mut template = Vec::with_capacity(definition.aggregations.len());
        for agg in &definition.aggregations {
            let index = agg.field.as_deref().and_then(|f| input.index_of(f));
            let ty = index.map(|i| input.fields()[i].data_type());
            agg_inputs.push(index);
            template.push(Accumulator::new(agg.function, ty));
        }
        Ok(Self {
            id,
            slicing,
            time: TimeSource::resolve(&definition.time, input)?,
            keys: KeyCodec::new(&definition.keys, input)?,
            agg_inputs,
            template,
            processor: MultiOriginWatermarkProcessor::new(origins),
            coordinator: Mutex::new(Coordinator {
                clock: RoundClock::new(workers),
                slices: BTreeMap::new(),
                sessions: SessionStore::default(),
            }),
            begun: AtomicI64::new(i64::MIN),
            metrics: WindowMetrics::default(),
            definition,
        })
    }

    /// Logical window id; also the origin id of the emitted results.
    #[must_use]
    pub fn id(&self) -> OperatorId {
        self.id
    }

    /// The window definition.
    #[must_use]
    pub fn definition(&self) -> &Arc<WindowDefinition> {
        &self.definition
    }

    /// Counters.
    #[must_use]
    pub fn metrics(&self) -> &WindowMetrics {
        &self.metrics
    }

    /// Combined watermark over all upstream origins.
    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.processor.current_watermark()
    }

    fn threshold(&self) -> i64 {
        close_threshold(
            self.processor.current_watermark(),
            self.definition.allowed_lateness_ms,
        )
    }

    /// Inserts every record of `buffer` into `store` and records the
    /// buffer's progress.
    ///
    /// Progress is recorded even when a record fails to decode, so a
    /// malformed buffer never stalls the watermark. Call
    /// [`round_due`](Self::round_due) afterwards to apply the trigger policy.
    ///
    /// # Errors
    ///
    /// Returns the first [`BufferError`] raised while reading a record.
    /// Records before it stay inserted.
    pub fn insert_buffer(
        &self,
        store: &mut WindowStore,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
    ) -> Result<(), BufferError> {
        let result = self.insert_records(store, layout, buffer, 0..buffer.number_of_tuples(), now_millis());
        let header = buffer.header();
        let advanced = self.processor.update(
            header.origin_id,
            header.sequence_number,
            header.chunk_number,
            header.last_chunk,
            header.watermark,
        );
        if advanced {
            tracing::trace!(handler = %self.id, watermark = self.watermark(), "watermark advanced");
        }
        result
    }

    /// Applies the trigger policy after an insert. Returns `true` if a
    /// hand-off round began; the caller must then hand off every store.
    ///
    /// The close threshold only moves with buffer progress, so the
    /// per-record, per-buffer and watermark-change policies all begin a
    /// round as soon as it advanced. `OnTime` leaves rounds to the timer.
    pub fn round_due(&self) -> bool {
        match self.definition.trigger_policy {
            TriggerPolicy::OnTime { .. } => false,
            TriggerPolicy::OnWatermarkChange | TriggerPolicy::OnBuffer | TriggerPolicy::OnRecord => {
                self.begin_round()
            }
        }
    }

    /// Begins a hand-off round if the close threshold advanced past the
    /// last round and no round is running.
    pub fn begin_round(&self) -> bool {
        if self.threshold() <= self.begun.load(Ordering::Acquire) {
            return false;
        }
        self.begin_locked(&mut self.coordinator.lock())
    }

    fn begin_locked(&self, coordinator: &mut Coordinator) -> bool {
        let threshold = self.threshold();
        let begun = coordinator.clock.begin(threshold);
        if begun {
            self.begun.fetch_max(threshold, Ordering::AcqRel);
        }
        begun
    }

    /// Returns `true` while a round waits for hand-offs.
    #[must_use]
    pub fn round_active(&self) -> bool {
        self.coordinator.lock().clock.active().is_some()
    }

    fn insert_records(
        &self,
        store: &mut WindowStore,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
        mut records: Range<usize>,
        now: i64,
    ) -> Result<(), BufferError> {
        // Rounds hand off everything below the threshold of their start, and
        // the threshold never moves back.
        let threshold = self.threshold();
        let mut key = SliceKey::new();
        let mut values: Vec<Option<Value>> = Vec::with_capacity(self.agg_inputs.len());
        let (mut inserted, mut late) = (0u64, 0u64);
        let result = records.try_for_each(|record| {
            let ts = self.time.timestamp(layout, buffer, record, now)?;
            if ts < threshold {
                tracing::trace!(handler = %self.id, ts, threshold, "late record dropped");
                late += 1;
                return Ok(());
            }
            self.keys.encode_into(layout, buffer, record, &mut key)?;
            values.clear();
            for input in &self.agg_inputs {
                values.push(match input {
                    Some(index) => Some(layout.read_field(buffer, record, *index)?),
                    None => None,
                });
            }
            let row = match self.slicing {
                Slicing::Fixed { size } => {
                    let start = floor_to(ts, size);
                    store
                        .slices
                        .slice_mut(start, start.saturating_add(size))
                        .row_mut(&key, &self.template)
                }
                Slicing::Sessions { gap } => {
                    store.sessions.row_mut(&key, ts, gap, &self.template)
                }
            };
            for (acc, value) in row.iter_mut().zip(&values) {
                acc.add(value.as_ref());
            }
            inserted += 1;
            Ok(())
        });
        self.metrics.add_inserted(inserted);
        if late > 0 {
            self.metrics.add_late(late);
            tracing::warn!(handler = %self.id, late, threshold, "dropped late records");
        }
        result
    }

    /// Hands the closed part of `store` to the coordinator for the running
    /// round.
    ///
    /// Must be called once per store and round, by the store's owner. The
    /// call that completes the round merges the results and returns them.
    pub fn hand_off(&self, store: &mut WindowStore) -> HandOff {
        let Some(threshold) = self.coordinator.lock().clock.active() else {
            return HandOff::default();
        };
        let (closed, sessions) = match self.slicing {
            Slicing::Fixed { .. } => (store.slices.extract_closed(threshold), SessionStore::default()),
            Slicing::Sessions { .. } => (Vec::new(), store.sessions.take()),
        };

        let mut coordinator = self.coordinator.lock();
        for mut slice in closed {
            slice.advance(SliceState::Merged);
            match coordinator.slices.entry(slice.start()) {
                Entry::Vacant(entry) => {
                    entry.insert(slice);
                }
                Entry::Occupied(mut entry) => entry.get_mut().merge(slice),
            }
        }
        coordinator.sessions.absorb(sessions);
        let Some(round) = coordinator.clock.handed_off() else {
            return HandOff::default();
        };

        let records = match self.slicing {
            Slicing::Fixed { .. } => match self.definition.trigger_action {
                TriggerAction::SliceAggregation => self.emit_slices(&mut coordinator),
                _ => self.emit_windows(&mut coordinator, round),
            },
            Slicing::Sessions { .. } => self.emit_sessions(&mut coordinator, round.to),
        };
        self.metrics.add_emitted(records.len() as u64);
        tracing::debug!(
            handler = %self.id,
            threshold = round.to,
            sequence = round.sequence,
            rows = records.len(),
            "window trigger fired"
        );
        // Progress that arrived during the round begins the next one; timed
        // policies wait for their timer.
        let timed = matches!(self.definition.trigger_policy, TriggerPolicy::OnTime { .. });
        let next_round = !timed && self.begin_locked(&mut coordinator);
        HandOff {
            output: Some(TriggerOutput {
                sequence: round.sequence,
                watermark: round.to,
                records,
            }),
            next_round,
        }
    }

    /// Begins a round if the close threshold advanced and hands off every
    /// store in `stores` until no round is left. Returns the outputs in
    /// order.
    ///
    /// For callers that own every worker store on one thread; `stores`
    /// holds exactly one store per worker.
    pub fn trigger(&self, stores: &mut [WindowStore]) -> Vec<TriggerOutput> {
        let mut outputs = Vec::new();
        self.begin_round();
        while self.round_active() {
            let before = outputs.len();
            for store in stores.iter_mut() {
                outputs.extend(self.hand_off(store).output);
            }
            if outputs.len() == before {
                break;
            }
        }
        outputs
    }

    fn emit_windows(&self, coordinator: &mut Coordinator, round: Round) -> Vec<Vec<Value>> {
        let window_type = self.definition.window_type;
        let (last, threshold) = (round.from, round.to);
        let due: BTreeSet<(i64, i64)> = coordinator
            .slices
            .keys()
            .flat_map(|start| window_type.windows_of_slice(*start))
            .filter(|(_, end)| *end > last && *end <= threshold)
            .map(|(start, end)| (end, start))
            .collect();

        let mut out = Vec::new();
        for (end, start) in due {
            let mut merged: FxHashMap<&SliceKey, Vec<Accumulator>> = FxHashMap::default();
            for slice in coordinator.slices.range(start..end).map(|(_, s)| s) {
                for (key, row) in slice.rows() {
                    match merged.get_mut(key) {
                        Some(acc) => acc.iter_mut().zip(row).for_each(|(a, b)| a.merge(b)),
                        None => {
                            merged.insert(key, row.clone());
                        }
                    }
                }
            }
            let mut rows: Vec<_> = merged
                .into_iter()
                .filter_map(|(key, row)| self.result_row(start, end, key, &row))
                .collect();
            rows.sort_by(|a, b| compare_rows(a, b));
            out.extend(rows);
        }

        coordinator.slices.retain(|start, slice| {
            let done = window_type
                .windows_of_slice(*start)
                .last()
                .map_or(true, |(_, end)| *end <= threshold);
            if done {
                slice.advance(SliceState::Emitted);
            }
            !done
        });
        out
    }

    fn emit_slices(&self, coordinator: &mut Coordinator) -> Vec<Vec<Value>> {
        let mut out = Vec::new();
        for (_, mut slice) in std::mem::take(&mut coordinator.slices) {
            let mut rows: Vec<_> = slice
                .rows()
                .iter()
                .filter_map(|(key, row)| self.result_row(slice.start(), slice.end(), key, row))
                .collect();
            rows.sort_by(|a, b| compare_rows(a, b));
            out.extend(rows);
            slice.advance(SliceState::Emitted);
        }
        out
    }

    fn emit_sessions(&self, coordinator: &mut Coordinator, threshold: i64) -> Vec<Vec<Value>> {
        let mut rows: Vec<_> = coordinator
            .sessions
            .extract_closed(threshold)
            .into_iter()
            .filter_map(|(key, session)| {
                self.result_row(session.start, session.end, &key, &session.row)
            })
            .collect();
        rows.sort_by(|a, b| a[1].total_cmp(&b[1]).then_with(|| compare_rows(a, b)));
        rows
    }

    fn result_row(&self, start: i64, end: i64, key: &[u8], row: &[Accumulator]) -> Option<Vec<Value>> {
        let keys = match self.keys.decode(key) {
            Ok(keys) => keys,
            Err(error) => {
                tracing::warn!(handler = %self.id, %error, "skipping window row with undecodable key");
                return None;
            }
        };
        let mut out = Vec::with_capacity(2 + keys.len() + row.len());
        out.push(Value::Int(start));
        out.push(Value::Int(end));
        out.extend(keys);
        out.extend(row.iter().map(Accumulator::result));
        Some(out)
    }
}
