//! # Update Chains
//!
//! A page entry's uncheckpointed history is a singly linked chain of
//! update records. The chain head is owned by the page slot; each record
//! owns its successor. Linking is move-only: a record is either the
//! unlinked value being built or a member of exactly one chain, never
//! shared, so every error path frees exactly what it holds.
//!
//! Chains can be long after a burst of updates to one key; `Drop` walks
//! the links iteratively so deep chains cannot overflow the stack.

use super::TxnId;

/// Payload of one update: a value or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateData {
    Value(Vec<u8>),
    Tombstone,
}

#[derive(Debug)]
pub struct UpdateRecord {
    pub txn_id: TxnId,
    pub data: UpdateData,
    pub next: Option<Box<UpdateRecord>>,
}

impl UpdateRecord {
    /// Allocates a value record, returning it with its memory footprint
    /// (structure plus payload).
    pub fn value(txn_id: TxnId, data: &[u8]) -> (Box<Self>, usize) {
        let record = Box::new(Self {
            txn_id,
            data: UpdateData::Value(data.to_vec()),
            next: None,
        });
        let incr = record.footprint();
        (record, incr)
    }

    /// Allocates a tombstone record, returning it with its footprint.
    pub fn tombstone(txn_id: TxnId) -> (Box<Self>, usize) {
        let record = Box::new(Self {
            txn_id,
            data: UpdateData::Tombstone,
            next: None,
        });
        let incr = record.footprint();
        (record, incr)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.data, UpdateData::Tombstone)
    }

    pub fn data(&self) -> Option<&[u8]> {
        match &self.data {
            UpdateData::Value(bytes) => Some(bytes),
            UpdateData::Tombstone => None,
        }
    }

    /// Bytes this record accounts for in the page's in-memory counter.
    pub fn footprint(&self) -> usize {
        size_of::<Self>()
            + match &self.data {
                UpdateData::Value(bytes) => bytes.len(),
                UpdateData::Tombstone => 0,
            }
    }

    pub fn next(&self) -> Option<&UpdateRecord> {
        self.next.as_deref()
    }

    /// Appends `tail` after the last record of this chain.
    pub fn append_tail(&mut self, tail: Box<UpdateRecord>) {
        let mut cursor = self;
        while cursor.next.is_some() {
            cursor = cursor.next.as_mut().unwrap();
        }
        cursor.next = Some(tail);
    }

    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut cursor = self;
        while let Some(next) = cursor.next.as_deref() {
            len += 1;
            cursor = next;
        }
        len
    }

    /// Links records into a chain in iteration order: the first record
    /// becomes the head, each later record the previous one's successor.
    pub fn chain(records: impl DoubleEndedIterator<Item = Box<UpdateRecord>>) -> Option<Box<Self>> {
        records.rev().fold(None, |next, mut record| {
            record.next = next;
            Some(record)
        })
    }
}

impl Drop for UpdateRecord {
    fn drop(&mut self) {
        // Unlink iteratively; a recursive drop of a long chain would
        // overflow the stack.
        let mut next = self.next.take();
        while let Some(mut record) = next {
            next = record.next.take();
        }
    }
}
