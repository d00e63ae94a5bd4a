use fxhash::FxHashMap;

use super::{Accumulator, SliceKey};

/// One activity session of one key: `[start, end)`, where `end` is the last
/// record's timestamp plus the gap.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) start: i64,
    pub(crate) end: i64,
    pub(crate) row: Vec<Accumulator>,
}

impl Session {
    fn overlaps(&self, other: &Session) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn absorb(&mut self, other: Session) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
        for (acc, theirs) in self.row.iter_mut().zip(&other.row) {
            acc.merge(theirs);
        }
    }
}

/// Sessions per key, each list sorted by start and pairwise disjoint.
#[derive(Debug, Default)]
pub(crate) struct SessionStore {
    keyed: FxHashMap<SliceKey, Vec<Session>>,
}

impl SessionStore {
    /// Row of the session covering `ts`, creating or extending sessions so the
    /// record's `[ts, ts + gap)` activity interval is covered.
    pub(crate) fn row_mut(
        &mut self,
        key: &[u8],
        ts: i64,
        gap: i64,
        template: &[Accumulator],
    ) -> &mut [Accumulator] {
        let sessions = self.keyed.entry(SliceKey::from_slice(key)).or_default();
        let fresh = Session {
            start: ts,
            end: ts.saturating_add(gap),
            row: template.to_vec(),
        };
        let at = insert_merging(sessions, fresh);
        &mut sessions[at].row
    }

    /// Merges every session of `other` into this store.
    pub(crate) fn absorb(&mut self, other: SessionStore) {
        for (key, sessions) in other.keyed {
            let mine = self.keyed.entry(key).or_default();
            for session in sessions {
                insert_merging(mine, session);
            }
        }
    }

    /// Moves all sessions out, leaving the store empty.
    pub(crate) fn take(&mut self) -> SessionStore {
        std::mem::take(self)
    }

    /// Removes and returns every session with `end <= threshold`.
    pub(crate) fn extract_closed(&mut self, threshold: i64) -> Vec<(SliceKey, Session)> {
        let mut closed = Vec::new();
        self.keyed.retain(|key, sessions| {
            let keep = sessions.split_off(sessions.partition_point(|s| s.end <= threshold));
            closed.extend(sessions.drain(..).map(|s| (key.clone(), s)));
            *sessions = keep;
            !sessions.is_empty()
        });
        closed
    }

    pub(crate) fn len(&self) -> usize {
        self.keyed.values().map(Vec::len).sum()
    }
}

/// Inserts `session`, merging it with every overlapping neighbour. Returns the
/// index of the resulting session.
fn insert_merging(sessions: &mut Vec<Session>, mut session: Session) -> usize {
    let at = sessions.partition_point(|s| s.end <= session.start);
    while at < sessions.len() && sessions[at].overlaps(&session) {
        let existing = sessions.remove(at);
        session.absorb(existing);
    }
    sessions.insert(at, session);
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use crate::window::AggregationFunction;

    fn template() -> Vec<Accumulator> {
        vec![Accumulator::new(AggregationFunction::Count, None)]
    }

    fn add(store: &mut SessionStore, ts: i64) {
        store.row_mut(b"k", ts, 100, &template())[0].add(None);
    }

    #[test]
    fn test_records_within_gap_share_a_session() {
        let mut store = SessionStore::default();
        add(&mut store, 0);
        add(&mut store, 50);
        add(&mut store, 500);
        assert_eq!(store.len(), 2);
        let closed = store.extract_closed(i64::MAX);
        assert_eq!((closed[0].1.start, closed[0].1.end), (0, 150));
        assert_eq!(closed[0].1.row[0].result(), Value::UInt(2));
        assert_eq!((closed[1].1.start, closed[1].1.end), (500, 600));
    }

    #[test]
    fn test_bridging_record_merges_sessions() {
        let mut store = SessionStore::default();
        add(&mut store, 0);
        add(&mut store, 180);
        assert_eq!(store.len(), 2);
        add(&mut store, 90);
        assert_eq!(store.len(), 1);
        let closed = store.extract_closed(i64::MAX);
        assert_eq!((closed[0].1.start, closed[0].1.end), (0, 280));
        assert_eq!(closed[0].1.row[0].result(), Value::UInt(3));
    }

    #[test]
    fn test_absorb_and_extract_closed() {
        let mut global = SessionStore::default();
        let mut local = SessionStore::default();
        add(&mut global, 0);
        add(&mut local, 60);
        add(&mut local, 1000);
        global.absorb(local.take());
        assert_eq!(local.len(), 0);
        let closed = global.extract_closed(500);
        assert_eq!(closed.len(), 1);
        assert_eq!((closed[0].1.start, closed[0].1.end), (0, 160));
        assert_eq!(global.len(), 1);
    }
}
