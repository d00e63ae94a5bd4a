use std::collections::BTreeMap;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::Accumulator;

/// Raw bytes of a record's key fields, concatenated. Empty for global windows.
pub type SliceKey = SmallVec<[u8; 16]>;

/// Lifecycle of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SliceState {
    /// Accepting records in a worker-local store.
    Open,
    /// Past the close threshold and handed to the merge coordinator.
    Closed,
    /// Combined into the coordinator's global slice map.
    Merged,
    /// Every window covering the slice has been emitted.
    Emitted,
}

/// Partial aggregates for the interval `[start, end)`, one row per key.
#[derive(Debug, Clone)]
pub struct Slice {
    start: i64,
    end: i64,
    state: SliceState,
    records: u64,
    keyed: FxHashMap<SliceKey, Vec<Accumulator>>,
}

impl Slice {
    /// Creates an empty, open slice.
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            state: SliceState::Open,
            records: 0,
            keyed: FxHashMap::default(),
        }
    }

    /// Inclusive start.
    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Exclusive end.
    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SliceState {
        self.state
    }

    /// Records inserted (including merged slices).
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Moves the slice forward in its lifecycle. Backward moves are ignored.
    pub fn advance(&mut self, to: SliceState) {
        if to > self.state {
            tracing::trace!(start = self.start, end = self.end, from = ?self.state, ?to, "slice transition");
            self.state = to;
        }
    }

    /// Accumulator row for `key`, created from `template` on first use.
    pub fn row_mut(&mut self, key: &[u8], template: &[Accumulator]) -> &mut [Accumulator] {
        self.records += 1;
        if !self.keyed.contains_key(key) {
            self.keyed.insert(SliceKey::from_slice(key), template.to_vec());
        }
        self.keyed.get_mut(key).map_or(&mut [], Vec::as_mut_slice)
    }

    /// Per-key rows.
    #[must_use]
    pub fn rows(&self) -> &FxHashMap<SliceKey, Vec<Accumulator>> {
        &self.keyed
    }

    /// Merges another slice over the same interval into this one.
    pub fn merge(&mut self, other: Slice) {
        self.records += other.records;
        for (key, row) in other.keyed {
            match self.keyed.get_mut(&key) {
                Some(mine) => {
                    for (acc, theirs) in mine.iter_mut().zip(&row) {
                        acc.merge(theirs);
                    }
                }
                None => {
                    self.keyed.insert(key, row);
                }
            }
        }
    }
}

/// Slices owned by one worker thread, ordered by start.
///
/// Slices in one store are disjoint. They are created lazily by the first
/// record falling into their interval and leave the store when the merge
/// coordinator extracts them as closed.
#[derive(Debug, Default)]
pub struct ThreadLocalSliceStore {
    slices: BTreeMap<i64, Slice>,
}

impl ThreadLocalSliceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The slice `[start, end)`, created if absent.
    pub fn slice_mut(&mut self, start: i64, end: i64) -> &mut Slice {
        self.slices
            .entry(start)
            .or_insert_with(|| Slice::new(start, end))
    }

    /// Removes and returns every slice with `end <= threshold`, marked closed.
    pub fn extract_closed(&mut self, threshold: i64) -> Vec<Slice> {
        let mut closed = Vec::new();
        while let Some(entry) = self.slices.first_entry() {
            if entry.get().end > threshold {
                break;
            }
            let mut slice = entry.remove();
            slice.advance(SliceState::Closed);
            closed.push(slice);
        }
        closed
    }

    /// Number of slices held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Returns `true` if no slice is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Slices in start order.
    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.slices.values()
    }

    /// Drops all slices.
    pub fn clear(&mut self) {
        self.slices.clear();
    }
}
