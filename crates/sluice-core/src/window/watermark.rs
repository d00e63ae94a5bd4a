//! # Watermarks
//!
//! Buffers carry a watermark and an `(origin, sequence, chunk)` position in
//! their header. [`MultiOriginWatermarkProcessor`] combines them into one
//! watermark per consumer:
//!
//! - per origin, the watermark only advances across a *contiguous* prefix of
//!   fully processed sequence numbers, so it never overtakes data that is
//!   still in flight on another worker;
//! - across origins, the combined watermark is the minimum.
//!
//! Published values are monotonic atomics updated with `fetch_max`; readers
//! may observe a value below the true watermark but never above it.
//!
//! ```rust
//! use sluice_core::window::MultiOriginWatermarkProcessor;
//!
//! let processor = MultiOriginWatermarkProcessor::new(&[1, 2]);
//! processor.update(1, 1, 0, true, 5000);
//! assert_eq!(processor.current_watermark(), i64::MIN);
//! processor.update(2, 1, 0, true, 3000);
//! assert_eq!(processor.current_watermark(), 3000);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use fxhash::FxHashMap;
use parking_lot::Mutex;

/// How the watermark assignment operator derives watermarks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkStrategy {
    /// Largest event timestamp seen minus a fixed delay.
    EventTime {
        /// Integer timestamp field (epoch milliseconds).
        field: String,
        /// Tolerated out-of-orderness in milliseconds.
        delay_ms: i64,
    },
    /// Wall-clock time when the buffer is processed.
    IngestionTime,
}

impl WatermarkStrategy {
    /// Event-time watermarks from `field`, lagging by `delay_ms`.
    pub fn event_time(field: impl Into<String>, delay_ms: i64) -> Self {
        Self::EventTime {
            field: field.into(),
            delay_ms,
        }
    }
}

/// Completion state of one sequence number.
#[derive(Debug)]
struct SequenceEntry {
    chunks_seen: u32,
    last_chunk: Option<u32>,
    watermark: i64,
}

impl SequenceEntry {
    fn is_complete(&self) -> bool {
        self.last_chunk.is_some_and(|last| self.chunks_seen > last)
    }
}

/// Orders watermark updates of one origin by sequence number.
#[derive(Debug)]
struct SequenceTracker {
    next: u64,
    pending: BTreeMap<u64, SequenceEntry>,
}

impl SequenceTracker {
    fn new() -> Self {
        Self {
            next: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Records one chunk; returns the watermark of the newly completed prefix.
    fn record(&mut self, sequence: u64, chunk: u32, last: bool, watermark: i64) -> Option<i64> {
        if sequence < self.next {
            return None;
        }
        let entry = self.pending.entry(sequence).or_insert(SequenceEntry {
            chunks_seen: 0,
            last_chunk: None,
            watermark: i64::MIN,
        });
        entry.chunks_seen += 1;
        entry.watermark = entry.watermark.max(watermark);
        if last {
            entry.last_chunk = Some(chunk);
        }

        let mut advanced = None;
        while let Some(entry) = self.pending.get(&self.next) {
            if !entry.is_complete() {
                break;
            }
            advanced = Some(advanced.map_or(entry.watermark, |w: i64| w.max(entry.watermark)));
            self.pending.remove(&self.next);
            self.next += 1;
        }
        advanced
    }
}

struct OriginProgress {
    watermark: AtomicI64,
    tracker: Mutex<SequenceTracker>,
}

/// Combines watermarks from several origins into one.
pub struct MultiOriginWatermarkProcessor {
    origins: FxHashMap<u64, OriginProgress>,
}

impl std::fmt::Debug for MultiOriginWatermarkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut origins: Vec<_> = self
            .origins
            .iter()
            .map(|(id, p)| (*id, p.watermark.load(Ordering::Acquire)))
            .collect();
        origins.sort_unstable();
        f.debug_struct("MultiOriginWatermarkProcessor")
            .field("origins", &origins)
            .finish()
    }
}

impl MultiOriginWatermarkProcessor {
    /// Tracks the given origins; each starts at `i64::MIN`.
    #[must_use]
    pub fn new(origins: &[u64]) -> Self {
        let origins = origins
            .iter()
            .map(|id| {
                (
                    *id,
                    OriginProgress {
                        watermark: AtomicI64::new(i64::MIN),
                        tracker: Mutex::new(SequenceTracker::new()),
                    },
                )
            })
            .collect();
        Self { origins }
    }

    /// Records that chunk `chunk` of `sequence` from `origin` was processed.
    ///
    /// A `sequence` of 0 marks an unsequenced update, applied immediately.
    /// Returns `true` if the combined watermark advanced. Unknown origins
    /// are ignored.
    pub fn update(&self, origin: u64, sequence: u64, chunk: u32, last: bool, watermark: i64) -> bool {
        let Some(progress) = self.origins.get(&origin) else {
            tracing::debug!(origin, "watermark update from unknown origin ignored");
            return false;
        };
        let candidate = if sequence == 0 {
            Some(watermark)
        } else {
            progress.tracker.lock().record(sequence, chunk, last, watermark)
        };
        let Some(candidate) = candidate else {
            return false;
        };
        let before = self.current_watermark();
        let previous = progress.watermark.fetch_max(candidate, Ordering::AcqRel);
        candidate > previous && self.current_watermark() > before
    }

    /// Minimum over all origins; `i64::MIN` until every origin reported.
    #[must_use]
    pub fn current_watermark(&self) -> i64 {
        self.origins
            .values()
            .map(|p| p.watermark.load(Ordering::Acquire))
            .min()
            .unwrap_or(i64::MIN)
    }

    /// Published watermark of one origin.
    #[must_use]
    pub fn origin_watermark(&self, origin: u64) -> Option<i64> {
        self.origins
            .get(&origin)
            .map(|p| p.watermark.load(Ordering::Acquire))
    }

    /// Tracked origin ids, sorted.
    #[must_use]
    pub fn origins(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.origins.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_sequences_wait_for_gap() {
        let processor = MultiOriginWatermarkProcessor::new(&[7]);
        assert!(!processor.update(7, 2, 0, true, 2000));
        assert_eq!(processor.current_watermark(), i64::MIN);
        assert!(processor.update(7, 1, 0, true, 1000));
        assert_eq!(processor.current_watermark(), 2000);
    }

    #[test]
    fn test_chunks_complete_a_sequence() {
        let processor = MultiOriginWatermarkProcessor::new(&[1]);
        assert!(!processor.update(1, 1, 1, false, 500));
        assert!(!processor.update(1, 1, 2, true, 500));
        assert!(processor.update(1, 1, 0, false, 500));
        assert_eq!(processor.current_watermark(), 500);
    }

    #[test]
    fn test_never_decreases() {
        let processor = MultiOriginWatermarkProcessor::new(&[1]);
        processor.update(1, 1, 0, true, 900);
        processor.update(1, 2, 0, true, 100);
        assert_eq!(processor.current_watermark(), 900);
        processor.update(1, 0, 0, true, 50);
        assert_eq!(processor.origin_watermark(1), Some(900));
    }

    #[test]
    fn test_minimum_across_origins() {
        let processor = MultiOriginWatermarkProcessor::new(&[1, 2]);
        processor.update(1, 1, 0, true, 100);
        processor.update(2, 1, 0, true, 40);
        assert_eq!(processor.current_watermark(), 40);
        assert!(processor.update(2, 2, 0, true, 400));
        assert_eq!(processor.current_watermark(), 100);
    }

    #[test]
    fn test_unknown_origin_ignored() {
        let processor = MultiOriginWatermarkProcessor::new(&[1]);
        assert!(!processor.update(9, 1, 0, true, 100));
        assert_eq!(processor.origins(), vec![1]);
    }
}
