use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::handler::{close_threshold, compare_rows, HandOff, Round, RoundClock, TimeSource};
use super::{
    floor_to, JoinDefinition, JoinSide, MultiOriginWatermarkProcessor, TriggerOutput, TriggerPolicy,
    WindowError, WindowMetrics,
};
use crate::memory::{now_millis, BufferError, MemoryLayout, TupleBuffer};
use crate::plan::OperatorId;
use crate::types::{Schema, Value};

#[derive(Debug, Clone)]
struct JoinRecord {
    key: Value,
    values: Vec<Value>,
}

/// Records of one side, bucketed by slice start.
type Buckets = BTreeMap<i64, Vec<JoinRecord>>;

/// Records of one worker, per side.
///
/// Owned by the worker that inserts into it; closed buckets move to the
/// coordinator in [`hand_off`](JoinOperatorHandler::hand_off).
#[derive(Debug, Default)]
pub struct JoinStore {
    sides: [Buckets; 2],
}

impl JoinStore {
    /// Records held across both sides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sides
            .iter()
            .flat_map(|buckets| buckets.values())
            .map(Vec::len)
            .sum()
    }

    /// Returns `true` if the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct JoinCoordinator {
    clock: RoundClock,
    sides: [Buckets; 2],
}

#[derive(Debug, Clone, Copy)]
struct SideSpec {
    time: TimeSource,
    key: usize,
}

fn side_index(side: JoinSide) -> usize {
    match side {
        JoinSide::Left => 0,
        JoinSide::Right => 1,
    }
}

/// Shared state of one windowed equi-join.
///
/// Both `JoinBuild` stages buffer their records in the [`JoinStore`] of the
/// executing worker, bucketed by slice. A hand-off round moves the closed
/// buckets of every worker to the coordinator, which materializes complete
/// windows from both sides and matches them pairwise on key equality.
pub struct JoinOperatorHandler {
    id: OperatorId,
    definition: Arc<JoinDefinition>,
    slice_size: i64,
    sides: [SideSpec; 2],
    processor: MultiOriginWatermarkProcessor,
    coordinator: Mutex<JoinCoordinator>,
    begun: AtomicI64,
    metrics: WindowMetrics,
}

impl std::fmt::Debug for JoinOperatorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinOperatorHandler")
            .field("id", &self.id)
            .field("window_type", &self.definition.window_type)
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

impl JoinOperatorHandler {
    /// Creates the handler for join `id` over the given input schemas.
    ///
    /// # Errors
    ///
    /// Returns a [`WindowError`] if the definition does not fit the inputs.
    pub fn new(
        id: OperatorId,
        definition: Arc<JoinDefinition>,
        left: &Schema,
        right: &Schema,
        origins: &[u64],
        workers: usize,
    ) -> Result<Self, WindowError> {
        definition.validate(left, right)?;
        let spec = |side: JoinSide, schema: &Schema| -> Result<SideSpec, WindowError> {
            let key = definition.key(side);
            Ok(SideSpec {
                time: TimeSource::resolve(definition.time(side), schema)?,
                key: schema
                    .index_of(key)
                    .ok_or_else(|| WindowError::FieldNotFound(key.to_string()))?,
            })
        };
        let sides = [spec(JoinSide::Left, left)?, spec(JoinSide::Right, right)?];
        Ok(Self {
            id,
            slice_size: definition.window_type.slice_size().unwrap_or(1),
            sides,
            processor: MultiOriginWatermarkProcessor::new(origins),
            coordinator: Mutex::new(JoinCoordinator {
                clock: RoundClock::new(workers),
                sides: [Buckets::new(), Buckets::new()],
            }),
            begun: AtomicI64::new(i64::MIN),
            metrics: WindowMetrics::default(),
            definition,
        })
    }

    /// Logical join id; also the origin id of the emitted matches.
    #[must_use]
    pub fn id(&self) -> OperatorId {
        self.id
    }

    /// The join definition.
    #[must_use]
    pub fn definition(&self) -> &Arc<JoinDefinition> {
        &self.definition
    }

    /// Counters.
    #[must_use]
    pub fn metrics(&self) -> &WindowMetrics {
        &self.metrics
    }

    /// Combined watermark over the origins of both inputs.
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

    /// Buffers the records of `buffer` for `side` in `store` and records
    /// progress. Call [`round_due`](Self::round_due) afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first [`BufferError`] raised while reading a record.
    pub fn insert_buffer(
        &self,
        store: &mut JoinStore,
        side: JoinSide,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
    ) -> Result<(), BufferError> {
        let count = buffer.number_of_tuples();
        let result = self.insert_records(store, side, layout, buffer, 0..count, now_millis());
        let header = buffer.header();
        self.processor.update(
            header.origin_id,
            header.sequence_number,
            header.chunk_number,
            header.last_chunk,
            header.watermark,
        );
        result
    }

    /// Applies the trigger policy after an insert. Returns `true` if a
    /// hand-off round began.
    pub fn round_due(&self) -> bool {
        match self.definition.trigger_policy {
            TriggerPolicy::OnTime { .. } => false,
            _ => self.begin_round(),
        }
    }

    /// Begins a hand-off round if the close threshold advanced and no round
    /// is running.
    pub fn begin_round(&self) -> bool {
        if self.threshold() <= self.begun.load(Ordering::Acquire) {
            return false;
        }
        self.begin_locked(&mut self.coordinator.lock())
    }

    fn begin_locked(&self, coordinator: &mut JoinCoordinator) -> bool {
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
        store: &mut JoinStore,
        side: JoinSide,
        layout: &MemoryLayout,
        buffer: &TupleBuffer,
        mut records: Range<usize>,
        now: i64,
    ) -> Result<(), BufferError> {
        let spec = self.sides[side_index(side)];
        let threshold = self.threshold();
        let (mut inserted, mut late) = (0u64, 0u64);
        let result = records.try_for_each(|record| {
            let ts = spec.time.timestamp(layout, buffer, record, now)?;
            if ts < threshold {
                tracing::trace!(handler = %self.id, ?side, ts, threshold, "late record dropped");
                late += 1;
                return Ok(());
            }
            let values = layout.read_record(buffer, record)?;
            let key = values[spec.key].clone();
            let start = floor_to(ts, self.slice_size);
            store.sides[side_index(side)]
                .entry(start)
                .or_default()
                .push(JoinRecord { key, values });
            inserted += 1;
            Ok(())
        });
        self.metrics.add_inserted(inserted);
        if late > 0 {
            self.metrics.add_late(late);
            tracing::warn!(handler = %self.id, ?side, late, threshold, "dropped late records");
        }
        result
    }

    /// Hands the closed buckets of `store` to the coordinator for the
    /// running round. The call that completes the round returns the matches.
    ///
    /// Must be called once per store and round, by the store's owner.
    pub fn hand_off(&self, store: &mut JoinStore) -> HandOff {
        let Some(threshold) = self.coordinator.lock().clock.active() else {
            return HandOff::default();
        };
        // Buckets starting at or after this bound are still open.
        let open_from = threshold.saturating_sub(self.slice_size).saturating_add(1);
        let mut closed: [Buckets; 2] = Default::default();
        for (out, buckets) in closed.iter_mut().zip(&mut store.sides) {
            let open = buckets.split_off(&open_from);
            *out = std::mem::replace(buckets, open);
        }

        let mut coordinator = self.coordinator.lock();
        for (index, buckets) in closed.into_iter().enumerate() {
            for (start, records) in buckets {
                coordinator.sides[index]
                    .entry(start)
                    .or_default()
                    .extend(records);
            }
        }
        let Some(round) = coordinator.clock.handed_off() else {
            return HandOff::default();
        };
        let records = self.match_windows(&mut coordinator, round);
        self.metrics.add_emitted(records.len() as u64);
        tracing::debug!(
            handler = %self.id,
            threshold = round.to,
            sequence = round.sequence,
            matches = records.len(),
            "join trigger fired"
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

    /// Begins a round if due and hands off every store in `stores`, one per
    /// worker, until no round is left. Returns the outputs in order.
    pub fn trigger(&self, stores: &mut [JoinStore]) -> Vec<TriggerOutput> {
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

    fn match_windows(&self, coordinator: &mut JoinCoordinator, round: Round) -> Vec<Vec<Value>> {
        let (last, threshold) = (round.from, round.to);
        let window_type = self.definition.window_type;
        let due: BTreeSet<(i64, i64)> = coordinator
            .sides
            .iter()
            .flat_map(|buckets| buckets.keys())
            .flat_map(|start| window_type.windows_of_slice(*start))
            .filter(|(_, end)| *end > last && *end <= threshold)
            .map(|(start, end)| (end, start))
            .collect();

        let mut records = Vec::new();
        for (end, start) in due {
            let [left, right] = &coordinator.sides;
            let mut rows = Vec::new();
            for l in left.range(start..end).flat_map(|(_, r)| r) {
                for r in right.range(start..end).flat_map(|(_, r)| r) {
                    if l.key.total_cmp(&r.key).is_eq() {
                        let mut row = Vec::with_capacity(2 + l.values.len() + r.values.len());
                        row.push(Value::Int(start));
                        row.push(Value::Int(end));
                        row.extend(l.values.iter().cloned());
                        row.extend(r.values.iter().cloned());
                        rows.push(row);
                    }
                }
            }
            rows.sort_by(|a, b| compare_rows(a, b));
            records.extend(rows);
        }

        for buckets in &mut coordinator.sides {
            buckets.retain(|start, _| {
                window_type
                    .windows_of_slice(*start)
                    .last()
                    .is_some_and(|(_, end)| *end > threshold)
            });
        }
        records
    }
}
