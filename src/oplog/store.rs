//! # Log Store
//!
//! Access to the durable operation log, ordered by timestamp. Recovery
//! needs four shapes: the top-of-log entry (backward scan of one), a
//! bounded forward range scan, a newest-first scan of `(record id,
//! timestamp)` pairs for truncation, and a capped truncate-after that
//! discards a record and everything newer.
//!
//! Scans take the shared side of the store's lock; truncation takes the
//! exclusive side for its whole critical section.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};

use super::{OplogEntry, Timestamp};

/// Store-assigned identity of one log record; capped truncation addresses
/// records by id, not timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordId(pub u64);

pub trait OplogStore: Send + Sync {
    /// The entry with the largest timestamp, if any.
    fn latest(&self) -> Option<OplogEntry>;

    /// Entries with `ts` in `[start, end]`, ascending; `[start, ∞)` when
    /// `end` is absent.
    fn scan(&self, start: Timestamp, end: Option<Timestamp>) -> Vec<OplogEntry>;

    /// `(record id, timestamp)` pairs, newest first.
    fn scan_backward(&self) -> Vec<(RecordId, Timestamp)>;

    /// Discards `id` and every newer record.
    fn truncate_after(&self, id: RecordId) -> Result<()>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;
}

/// In-memory log store: the reference implementation for ephemeral
/// engines and the recovery test rigs.
#[derive(Debug, Default)]
pub struct MemOplog {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u64, OplogEntry>,
    next_id: u64,
}

impl MemOplog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry. Timestamps must be strictly increasing; the log
    /// has no holes by construction.
    pub fn append(&self, entry: OplogEntry) -> Result<RecordId> {
        let mut inner = self.inner.write();
        if let Some(last) = inner.entries.values().next_back() {
            if entry.ts <= last.ts {
                return Err(StoreError::BadValue(format!(
                    "out-of-order append: {} after {}",
                    entry.ts, last.ts
                )));
            }
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, entry);
        Ok(RecordId(id))
    }

    /// Appends a run of `(ts, term)` entries with empty payloads. Fixture
    /// convenience.
    pub fn append_all(&self, points: &[(u64, u64)]) -> Result<()> {
        for &(ts, term) in points {
            self.append(OplogEntry::new(Timestamp(ts), term, Vec::new()))?;
        }
        Ok(())
    }

    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| e.ts)
            .collect()
    }
}

impl OplogStore for MemOplog {
    fn latest(&self) -> Option<OplogEntry> {
        self.inner
            .read()
            .entries
            .values()
            .next_back()
            .cloned()
    }

    fn scan(&self, start: Timestamp, end: Option<Timestamp>) -> Vec<OplogEntry> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.ts >= start && end.map_or(true, |end| e.ts <= end))
            .cloned()
            .collect()
    }

    fn scan_backward(&self) -> Vec<(RecordId, Timestamp)> {
        self.inner
            .read()
            .entries
            .iter()
            .rev()
            .map(|(&id, e)| (RecordId(id), e.ts))
            .collect()
    }

    fn truncate_after(&self, id: RecordId) -> Result<()> {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|&record, _| record < id.0);
        debug!(
            removed = before - inner.entries.len(),
            from = id.0,
            "log truncated"
        );
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.read().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(points: &[(u64, u64)]) -> MemOplog {
        let store = MemOplog::new();
        store.append_all(points).unwrap();
        store
    }

    #[test]
    fn append_assigns_increasing_record_ids() {
        let store = MemOplog::new();
        let a = store
            .append(OplogEntry::new(Timestamp(1), 1, Vec::new()))
            .unwrap();
        let b = store
            .append(OplogEntry::new(Timestamp(2), 1, Vec::new()))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn append_rejects_out_of_order_timestamps() {
        let store = store_with(&[(5, 1)]);
        let err = store
            .append(OplogEntry::new(Timestamp(5), 1, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, StoreError::BadValue(_)));
    }

    #[test]
    fn latest_is_top_of_log() {
        let store = store_with(&[(1, 1), (2, 1), (9, 2)]);
        assert_eq!(store.latest().unwrap().ts, Timestamp(9));
        assert!(MemOplog::new().latest().is_none());
    }

    #[test]
    fn scan_is_inclusive_both_ends() {
        let store = store_with(&[(1, 1), (2, 1), (3, 1), (4, 1)]);
        let hits = store.scan(Timestamp(2), Some(Timestamp(3)));
        let ts: Vec<u64> = hits.iter().map(|e| e.ts.0).collect();
        assert_eq!(ts, [2, 3]);
    }

    #[test]
    fn scan_without_end_is_unbounded() {
        let store = store_with(&[(1, 1), (2, 1), (3, 1)]);
        assert_eq!(store.scan(Timestamp(2), None).len(), 2);
    }

    #[test]
    fn scan_backward_is_newest_first() {
        let store = store_with(&[(1, 1), (2, 1), (3, 1)]);
        let ts: Vec<u64> = store.scan_backward().iter().map(|(_, t)| t.0).collect();
        assert_eq!(ts, [3, 2, 1]);
    }

    #[test]
    fn truncate_after_is_inclusive() {
        let store = store_with(&[(1, 1), (2, 1), (3, 1), (4, 1)]);
        let backward = store.scan_backward();
        // Record holding ts=3.
        let (id, _) = backward[1];
        store.truncate_after(id).unwrap();
        let ts: Vec<u64> = store.timestamps().iter().map(|t| t.0).collect();
        assert_eq!(ts, [1, 2]);
    }
}
