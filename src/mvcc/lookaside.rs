//! # Lookaside Table
//!
//! When a page is evicted while some of its updates are not yet globally
//! visible, those updates are spilled here instead of being lost. On the
//! next fault of the page they are re-attached as update chains
//! (`tree::materialize`), and they are deleted only when the page is
//! rewritten with the values folded in or when the page is freed
//! (`remove_block`).
//!
//! ## Composite key
//!
//! Fields in wire order: `(tree_id, addr, txn_id, counter, user_key)`.
//! The sort order is NOT the field order. Entries are ordered by
//!
//! ```text
//! tree_id, (addr.len, addr bytes), user_key, txn_id, counter
//! ```
//!
//! so that a block prefix `(tree_id, addr)` is one contiguous range and,
//! within it, all spills for one user key are contiguous in ascending
//! `(txn_id, counter)`. The address is a variable-length cookie; it is
//! compared by length first and then bytewise, never by the host
//! language's default slice ordering alone.
//!
//! ## Cursor semantics
//!
//! The cursor caches the entry it is positioned on, so a concurrent
//! `remove` of the same record by another actor is benign: reads keep
//! serving the cached entry, `remove` is idempotent, and `next` advances
//! past the cached position whether or not the record still exists.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use super::TxnId;
use crate::error::{Result, StoreError};

/// Reserved value-size sentinel marking a spilled tombstone.
pub const TOMBSTONE_SIZE: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookasideKey {
    pub tree_id: u32,
    pub addr: Vec<u8>,
    pub txn_id: TxnId,
    pub counter: u32,
    pub user_key: Vec<u8>,
}

impl LookasideKey {
    pub fn new(tree_id: u32, addr: &[u8], txn_id: TxnId, counter: u32, user_key: &[u8]) -> Self {
        Self {
            tree_id,
            addr: addr.to_vec(),
            txn_id,
            counter,
            user_key: user_key.to_vec(),
        }
    }

    /// Smallest possible key of a block prefix; `search_near` on this
    /// lands at or just around the prefix's first entry.
    pub fn block_probe(tree_id: u32, addr: &[u8]) -> Self {
        Self::new(tree_id, addr, 0, 0, &[])
    }

    /// Whether this entry belongs to the block `(tree_id, addr)`: same
    /// tree, same address size, bytewise-equal address.
    pub fn matches_block(&self, tree_id: u32, addr: &[u8]) -> bool {
        self.tree_id == tree_id && self.addr.len() == addr.len() && self.addr == addr
    }
}

impl Ord for LookasideKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tree_id
            .cmp(&other.tree_id)
            .then_with(|| self.addr.len().cmp(&other.addr.len()))
            .then_with(|| self.addr.cmp(&other.addr))
            .then_with(|| self.user_key.cmp(&other.user_key))
            .then_with(|| self.txn_id.cmp(&other.txn_id))
            .then_with(|| self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for LookasideKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Spilled value: the updating transaction and the bytes, or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookasideValue {
    pub txn_id: TxnId,
    data: Option<Vec<u8>>,
}

impl LookasideValue {
    pub fn value(txn_id: TxnId, data: &[u8]) -> Self {
        Self {
            txn_id,
            data: Some(data.to_vec()),
        }
    }

    pub fn tombstone(txn_id: TxnId) -> Self {
        Self { txn_id, data: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Wire form: `txn_id (8 LE) | size (4 LE) | bytes`, with the size
    /// sentinel marking tombstones.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.data.as_ref().map_or(0, Vec::len));
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        match &self.data {
            Some(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            None => out.extend_from_slice(&TOMBSTONE_SIZE.to_le_bytes()),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(StoreError::format("lookaside value too short"));
        }
        let txn_id = u64::from_le_bytes(bytes[..8].try_into().unwrap()); // INVARIANT: length checked above
        let size = u32::from_le_bytes(bytes[8..12].try_into().unwrap()); // INVARIANT: length checked above
        if size == TOMBSTONE_SIZE {
            if bytes.len() != 12 {
                return Err(StoreError::format("tombstone with payload bytes"));
            }
            return Ok(Self::tombstone(txn_id));
        }
        if bytes.len() != 12 + size as usize {
            return Err(StoreError::format(format!(
                "lookaside value size mismatch: declared {}, have {}",
                size,
                bytes.len() - 12
            )));
        }
        Ok(Self::value(txn_id, &bytes[12..]))
    }
}

/// The spill table. Ordered by the composite key; concurrent writers are
/// tolerated (short read/write lock per operation).
#[derive(Debug, Default)]
pub struct LookasideStore {
    entries: RwLock<BTreeMap<LookasideKey, Vec<u8>>>,
    counter: AtomicU32,
    written: AtomicBool,
}

impl LookasideStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the table has ever been written. Pages flagged as spilled
    /// long ago may fault in after the table was drained and dropped; the
    /// materializer checks this before scanning.
    pub fn is_active(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn insert(&self, key: LookasideKey, value: &LookasideValue) {
        self.entries.write().insert(key, value.encode());
        self.written.store(true, Ordering::Release);
    }

    /// Spills one update, stamping the store's monotonic counter to keep
    /// equal-txn entries for a key in insertion order.
    pub fn spill(
        &self,
        tree_id: u32,
        addr: &[u8],
        user_key: &[u8],
        txn_id: TxnId,
        value: &LookasideValue,
    ) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        self.insert(
            LookasideKey::new(tree_id, addr, txn_id, counter, user_key),
            value,
        );
        counter
    }

    pub fn cursor(&self) -> LookasideCursor<'_> {
        LookasideCursor {
            store: self,
            current: None,
        }
    }

    /// Removes every record of a block prefix. Called when a page is
    /// rewritten with its spilled values folded back in, or freed.
    pub fn remove_block(&self, tree_id: u32, addr: &[u8]) -> Result<usize> {
        let mut cursor = self.cursor();
        let mut removed = 0;
        match cursor.seek_block_prefix(tree_id, addr) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(0),
            Err(err) => return Err(err),
        }
        loop {
            match cursor.get_key() {
                Ok(key) if key.matches_block(tree_id, addr) => {}
                Ok(_) => break,
                Err(err) if err.is_not_found() => break,
                Err(err) => return Err(err),
            }
            cursor.remove()?;
            removed += 1;
            match cursor.next() {
                Ok(()) => {}
                Err(err) if err.is_not_found() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }
}

/// Result of positioning at the nearest entry to a search key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchNear {
    /// Positioned exactly at the search key.
    Exact,
    /// Positioned at the nearest entry below the search key.
    Before,
    /// Positioned at the nearest entry above the search key.
    After,
}

/// Ordered cursor over the lookaside table. Holds no lock between steps;
/// each step re-seeks from the cached position.
pub struct LookasideCursor<'a> {
    store: &'a LookasideStore,
    current: Option<(LookasideKey, Vec<u8>)>,
}

impl LookasideCursor<'_> {
    /// Positions at the nearest entry to `key`. `NotFound` when the table
    /// is empty.
    pub fn search_near(&mut self, key: &LookasideKey) -> Result<SearchNear> {
        let entries = self.store.entries.read();
        if let Some((found, value)) = entries.range(key.clone()..).next() {
            let exact = found == key;
            self.current = Some((found.clone(), value.clone()));
            return Ok(if exact {
                SearchNear::Exact
            } else {
                SearchNear::After
            });
        }
        if let Some((found, value)) = entries.range(..key.clone()).next_back() {
            self.current = Some((found.clone(), value.clone()));
            return Ok(SearchNear::Before);
        }
        Err(StoreError::NotFound)
    }

    /// Advances past the current position. `NotFound` at the end of the
    /// table is normal and recovered by the caller.
    pub fn next(&mut self) -> Result<()> {
        let position = self
            .current
            .as_ref()
            .map(|(key, _)| key.clone())
            .ok_or(StoreError::NotFound)?;
        let entries = self.store.entries.read();
        let found = entries
            .range((Excluded(position), Unbounded))
            .next()
            .map(|(key, value)| (key.clone(), value.clone()));
        drop(entries);
        match found {
            Some(next) => {
                self.current = Some(next);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    pub fn get_key(&self) -> Result<&LookasideKey> {
        self.current
            .as_ref()
            .map(|(key, _)| key)
            .ok_or(StoreError::NotFound)
    }

    pub fn get_value(&self) -> Result<LookasideValue> {
        let (_, bytes) = self.current.as_ref().ok_or(StoreError::NotFound)?;
        LookasideValue::decode(bytes)
    }

    /// Removes the record at the current position. Idempotent: succeeds
    /// even if another actor removed it first, and the cursor remains
    /// positioned so `next` advances past the removed key.
    pub fn remove(&mut self) -> Result<()> {
        let (key, _) = self.current.as_ref().ok_or(StoreError::NotFound)?;
        self.store.entries.write().remove(key);
        Ok(())
    }

    /// Positions at the first entry of the block prefix `(tree_id, addr)`.
    /// This is the only supported scan shape: seek the prefix's smallest
    /// key; if positioned strictly before it, step once forward.
    pub fn seek_block_prefix(&mut self, tree_id: u32, addr: &[u8]) -> Result<()> {
        let probe = LookasideKey::block_probe(tree_id, addr);
        match self.search_near(&probe)? {
            SearchNear::Before => self.next(),
            SearchNear::Exact | SearchNear::After => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tree: u32, addr: &[u8], txn: TxnId, counter: u32, user: &[u8]) -> LookasideKey {
        LookasideKey::new(tree, addr, txn, counter, user)
    }

    #[test]
    fn key_order_groups_user_keys_within_block() {
        let mut keys = vec![
            key(1, b"aa", 14, 2, b"k1"),
            key(1, b"aa", 13, 5, b"k2"),
            key(1, b"aa", 10, 0, b"k1"),
            key(1, b"aa", 12, 1, b"k1"),
        ];
        keys.sort();

        assert_eq!(keys[0].user_key, b"k1");
        assert_eq!(keys[0].txn_id, 10);
        assert_eq!(keys[1].txn_id, 12);
        assert_eq!(keys[2].txn_id, 14);
        assert_eq!(keys[3].user_key, b"k2");
    }

    #[test]
    fn key_order_compares_addr_size_before_bytes() {
        let short = key(1, b"zz", 0, 0, b"");
        let long = key(1, b"aaa", 0, 0, b"");
        assert!(short < long);
    }

    #[test]
    fn equal_txn_entries_order_by_counter() {
        let first = key(1, b"aa", 10, 0, b"k");
        let second = key(1, b"aa", 10, 1, b"k");
        assert!(first < second);
    }

    #[test]
    fn value_roundtrip() {
        let value = LookasideValue::value(42, b"payload");
        let decoded = LookasideValue::decode(&value.encode()).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(decoded.data(), Some(b"payload".as_ref()));
    }

    #[test]
    fn tombstone_roundtrip_uses_sentinel() {
        let value = LookasideValue::tombstone(9);
        let encoded = value.encode();
        assert_eq!(&encoded[8..12], &TOMBSTONE_SIZE.to_le_bytes());
        let decoded = LookasideValue::decode(&encoded).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.txn_id, 9);
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let mut encoded = LookasideValue::value(1, b"abc").encode();
        encoded.pop();
        assert!(LookasideValue::decode(&encoded).is_err());
    }

    #[test]
    fn store_tracks_written_state() {
        let store = LookasideStore::new();
        assert!(!store.is_active());
        store.spill(1, b"aa", b"k", 5, &LookasideValue::value(5, b"v"));
        assert!(store.is_active());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn spill_counter_is_monotonic() {
        let store = LookasideStore::new();
        let c0 = store.spill(1, b"aa", b"k", 5, &LookasideValue::value(5, b"v0"));
        let c1 = store.spill(1, b"aa", b"k", 5, &LookasideValue::value(5, b"v1"));
        assert!(c1 > c0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn search_near_reports_position() {
        let store = LookasideStore::new();
        store.insert(key(1, b"aa", 10, 0, b"b"), &LookasideValue::value(10, b"v"));

        let mut cursor = store.cursor();
        assert_eq!(
            cursor.search_near(&key(1, b"aa", 10, 0, b"b")).unwrap(),
            SearchNear::Exact
        );
        assert_eq!(
            cursor.search_near(&key(1, b"aa", 0, 0, b"a")).unwrap(),
            SearchNear::After
        );
        assert_eq!(
            cursor.search_near(&key(1, b"aa", 0, 0, b"c")).unwrap(),
            SearchNear::Before
        );
    }

    #[test]
    fn search_near_empty_store_is_not_found() {
        let store = LookasideStore::new();
        let mut cursor = store.cursor();
        let err = cursor.search_near(&key(1, b"aa", 0, 0, b"")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn next_walks_in_key_order_to_not_found() {
        let store = LookasideStore::new();
        store.insert(key(1, b"aa", 10, 0, b"a"), &LookasideValue::value(10, b"1"));
        store.insert(key(1, b"aa", 12, 1, b"a"), &LookasideValue::value(12, b"2"));
        store.insert(key(1, b"aa", 11, 2, b"b"), &LookasideValue::value(11, b"3"));

        let mut cursor = store.cursor();
        cursor.seek_block_prefix(1, b"aa").unwrap();
        assert_eq!(cursor.get_key().unwrap().txn_id, 10);
        cursor.next().unwrap();
        assert_eq!(cursor.get_key().unwrap().txn_id, 12);
        cursor.next().unwrap();
        assert_eq!(cursor.get_key().unwrap().user_key, b"b");
        assert!(cursor.next().unwrap_err().is_not_found());
    }

    #[test]
    fn remove_is_idempotent_and_next_advances_past_removed() {
        let store = LookasideStore::new();
        store.insert(key(1, b"aa", 10, 0, b"a"), &LookasideValue::value(10, b"1"));
        store.insert(key(1, b"aa", 11, 1, b"b"), &LookasideValue::value(11, b"2"));

        let mut cursor = store.cursor();
        cursor.seek_block_prefix(1, b"aa").unwrap();
        cursor.remove().unwrap();
        // A second remove of the same record must not fail.
        cursor.remove().unwrap();
        // The cursor still serves the cached entry.
        assert_eq!(cursor.get_value().unwrap().data(), Some(b"1".as_ref()));

        cursor.next().unwrap();
        assert_eq!(cursor.get_key().unwrap().user_key, b"b");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_removal_during_scan_is_benign() {
        let store = LookasideStore::new();
        store.insert(key(1, b"aa", 10, 0, b"a"), &LookasideValue::value(10, b"1"));
        store.insert(key(1, b"aa", 11, 1, b"b"), &LookasideValue::value(11, b"2"));

        let mut cursor = store.cursor();
        cursor.seek_block_prefix(1, b"aa").unwrap();

        // Another actor removes the record under the cursor.
        store.entries.write().remove(&key(1, b"aa", 10, 0, b"a"));

        assert_eq!(cursor.get_value().unwrap().data(), Some(b"1".as_ref()));
        cursor.next().unwrap();
        assert_eq!(cursor.get_key().unwrap().user_key, b"b");
    }

    #[test]
    fn seek_block_prefix_skips_earlier_blocks() {
        let store = LookasideStore::new();
        store.insert(key(1, b"aa", 10, 0, b"x"), &LookasideValue::value(10, b"1"));
        store.insert(key(2, b"bb", 11, 1, b"y"), &LookasideValue::value(11, b"2"));

        let mut cursor = store.cursor();
        cursor.seek_block_prefix(2, b"bb").unwrap();
        assert_eq!(cursor.get_key().unwrap().tree_id, 2);
    }

    #[test]
    fn remove_block_only_touches_matching_prefix() {
        let store = LookasideStore::new();
        store.insert(key(1, b"aa", 10, 0, b"x"), &LookasideValue::value(10, b"1"));
        store.insert(key(1, b"aa", 11, 1, b"y"), &LookasideValue::value(11, b"2"));
        store.insert(key(1, b"ab", 12, 2, b"z"), &LookasideValue::value(12, b"3"));
        store.insert(key(2, b"aa", 13, 3, b"w"), &LookasideValue::value(13, b"4"));

        assert_eq!(store.remove_block(1, b"aa").unwrap(), 2);
        assert_eq!(store.len(), 2);

        let mut cursor = store.cursor();
        cursor.seek_block_prefix(1, b"ab").unwrap();
        assert!(cursor.get_key().unwrap().matches_block(1, b"ab"));
    }

    #[test]
    fn remove_block_on_empty_store_removes_nothing() {
        let store = LookasideStore::new();
        assert_eq!(store.remove_block(1, b"aa").unwrap(), 0);
    }
}
