//! # Operation Log
//!
//! Types and access paths for the durable operation log that recovery
//! replays. Entries are totally ordered by timestamp; an `OpTime` adds the
//! election term so appliedThrough comparisons survive term changes.

mod reader;
mod store;

pub use reader::{OplogBuffer, ReplaySource};
pub use store::{MemOplog, OplogStore, RecordId};

/// Physical component of the log order. `NULL` (zero) means "unset"
/// wherever a marker may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const NULL: Timestamp = Timestamp(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ts({})", self.0)
    }
}

/// A point in the log: timestamp plus election term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpTime {
    pub ts: Timestamp,
    pub term: u64,
}

impl OpTime {
    pub fn new(ts: Timestamp, term: u64) -> Self {
        Self { ts, term }
    }
}

impl std::fmt::Display for OpTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "optime({}, t{})", self.ts.0, self.term)
    }
}

/// One durable log entry. The payload is opaque to recovery; the applier
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub term: u64,
    pub payload: Vec<u8>,
}

impl OplogEntry {
    pub fn new(ts: Timestamp, term: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ts,
            term,
            payload: payload.into(),
        }
    }

    pub fn op_time(&self) -> OpTime {
        OpTime::new(self.ts, self.term)
    }

    /// Bytes this entry counts for against a batch's byte limit.
    pub fn size(&self) -> usize {
        size_of::<Self>() + self.payload.len()
    }
}
