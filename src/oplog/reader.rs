//! # Replay Source
//!
//! A bounded cursor over the durable log, used only as a replay input.
//! The contract at startup: the first entry of the declared range must
//! carry exactly the declared start timestamp (it is the entry the
//! checkpoint already applied, and it is consumed and discarded here). A
//! missing first entry means the durable log has a hole where the
//! checkpoint said there could not be one. That is a fatal site, not an
//! error.
//!
//! The source supports only `peek`, `pop`, and `is_empty`. It implements
//! the general log-buffer interface so the batching applier can drive it,
//! but every producer-side operation fails loudly: this is strictly a
//! replay source.

use std::collections::VecDeque;

use tracing::debug;

use crate::fatal::{fatal, FatalSite};

use super::{OplogEntry, OplogStore, Timestamp};

/// The log-buffer surface the batching applier drives. Buffers that only
/// replay leave the producer-side operations unimplemented; invoking one
/// is a programming error and panics.
pub trait OplogBuffer {
    fn is_empty(&self) -> bool;

    fn peek(&self) -> Option<&OplogEntry>;

    fn try_pop(&mut self) -> Option<OplogEntry>;

    fn push(&mut self, _entries: Vec<OplogEntry>) {
        unreachable!("replay source is not a producer-side buffer");
    }

    fn wait_for_space(&mut self, _bytes: usize) {
        unreachable!("replay source is not a producer-side buffer");
    }

    fn clear(&mut self) {
        unreachable!("replay source cannot be cleared");
    }

    fn max_size(&self) -> usize {
        unreachable!("replay source has no size budget");
    }

    fn last_pushed(&self) -> Option<&OplogEntry> {
        unreachable!("replay source is not a producer-side buffer");
    }
}

pub struct ReplaySource {
    entries: VecDeque<OplogEntry>,
}

impl ReplaySource {
    /// Opens the range `[start, end]` (or `[start, ∞)`), verifies the
    /// first entry is exactly `start`, and discards it as already applied.
    /// Fatal when the range is empty or the first entry mismatches.
    pub fn open(store: &dyn OplogStore, start: Timestamp, end: Option<Timestamp>) -> Self {
        let mut entries: VecDeque<OplogEntry> = store.scan(start, end).into();

        let Some(first) = entries.pop_front() else {
            fatal(
                FatalSite::ReplayRangeEmpty,
                &format!(
                    "no log entries at or after {start}{}; the checkpoint says this is impossible",
                    end.map(|e| format!(" and at or before {e}")).unwrap_or_default()
                ),
            );
        };
        if first.ts != start {
            fatal(
                FatalSite::MissingStartEntry,
                &format!(
                    "log entry at {start} is missing; first entry found is {}",
                    first.ts
                ),
            );
        }

        debug!(%start, remaining = entries.len(), "replay source opened");
        Self { entries }
    }
}

impl OplogBuffer for ReplaySource {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn peek(&self) -> Option<&OplogEntry> {
        self.entries.front()
    }

    fn try_pop(&mut self) -> Option<OplogEntry> {
        self.entries.pop_front()
    }
}
