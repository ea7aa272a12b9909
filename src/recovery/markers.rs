//! # Consistency Markers
//!
//! The durable marker set recovery anchors on:
//!
//! - `applied_through`: last optime known to be applied to the data files
//! - `min_valid`: optime the data files must reach to be consistent
//! - `truncate_after_point`: timestamp past which the log may contain
//!   uncommitted holes and must be truncated on recovery
//! - `initial_sync`: an initial sync owns the data files; recovery stands
//!   down
//!
//! The store behind the trait must make `set_applied_through` durable
//! before returning when invoked from the unstable-checkpoint recovery
//! path; `MemMarkers` is the in-memory reference implementation used by
//! ephemeral engines and the test rigs.

use parking_lot::Mutex;

use crate::oplog::{OpTime, Timestamp};

pub trait ConsistencyMarkers: Send + Sync {
    fn initial_sync_flag(&self) -> bool;
    fn set_initial_sync_flag(&self, set: bool);

    fn applied_through(&self) -> Option<OpTime>;
    fn set_applied_through(&self, op_time: Option<OpTime>);

    fn min_valid(&self) -> OpTime;
    fn set_min_valid(&self, op_time: OpTime);

    fn truncate_after_point(&self) -> Option<Timestamp>;
    fn set_truncate_after_point(&self, ts: Option<Timestamp>);
}

#[derive(Debug, Default)]
struct Inner {
    initial_sync: bool,
    applied_through: Option<OpTime>,
    min_valid: Option<OpTime>,
    truncate_after_point: Option<Timestamp>,
}

/// In-memory marker store.
#[derive(Debug, Default)]
pub struct MemMarkers {
    inner: Mutex<Inner>,
}

impl MemMarkers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsistencyMarkers for MemMarkers {
    fn initial_sync_flag(&self) -> bool {
        self.inner.lock().initial_sync
    }

    fn set_initial_sync_flag(&self, set: bool) {
        self.inner.lock().initial_sync = set;
    }

    fn applied_through(&self) -> Option<OpTime> {
        self.inner.lock().applied_through
    }

    fn set_applied_through(&self, op_time: Option<OpTime>) {
        self.inner.lock().applied_through = op_time;
    }

    fn min_valid(&self) -> OpTime {
        self.inner
            .lock()
            .min_valid
            .unwrap_or(OpTime::new(Timestamp::NULL, 0))
    }

    fn set_min_valid(&self, op_time: OpTime) {
        self.inner.lock().min_valid = Some(op_time);
    }

    fn truncate_after_point(&self) -> Option<Timestamp> {
        self.inner.lock().truncate_after_point
    }

    fn set_truncate_after_point(&self, ts: Option<Timestamp>) {
        self.inner.lock().truncate_after_point = ts;
    }
}
