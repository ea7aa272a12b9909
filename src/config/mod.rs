//! # Configuration
//!
//! Replay batch constants and the recovery switch set. A replay batch
//! closes on whichever limit is hit first; a single oversized entry still
//! ships alone.
//!
//! `RecoveryConfig` carries the switches that arrive from the command line
//! or environment: standalone recovery, recover-to-timestamp, the
//! unstable-checkpoint-on-shutdown toggle, and read-only mode after
//! recovery. The orchestrator's `run` entry point dispatches on these.

use crate::oplog::Timestamp;

/// Byte limit for one replay batch.
pub const DEFAULT_BATCH_BYTES: usize = 16 * 1024 * 1024;

/// Entry limit for one replay batch.
pub const DEFAULT_BATCH_OPS: usize = 5000;

/// Recovery-time switches. Plain struct with builder-style setters.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Recover as a standalone node; requires a stable checkpoint or the
    /// unstable-checkpoint-on-shutdown mode.
    pub standalone: bool,
    /// Bound recovery at this timestamp instead of the top of the log.
    pub recover_to: Option<Timestamp>,
    /// The node was shut down with an unstable checkpoint taken on purpose;
    /// standalone recovery verifies no replay is needed instead of failing.
    pub take_unstable_checkpoint_on_shutdown: bool,
    /// Put the engine into read-only mode once standalone recovery is done.
    pub read_only: bool,
    pub batch_bytes: usize,
    pub batch_ops: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            standalone: false,
            recover_to: None,
            take_unstable_checkpoint_on_shutdown: false,
            read_only: false,
            batch_bytes: DEFAULT_BATCH_BYTES,
            batch_ops: DEFAULT_BATCH_OPS,
        }
    }
}

impl RecoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standalone(mut self, on: bool) -> Self {
        self.standalone = on;
        self
    }

    pub fn recover_to(mut self, ts: Timestamp) -> Self {
        self.recover_to = Some(ts);
        self
    }

    pub fn take_unstable_checkpoint_on_shutdown(mut self, on: bool) -> Self {
        self.take_unstable_checkpoint_on_shutdown = on;
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    pub fn batch_limits(mut self, bytes: usize, ops: usize) -> Self {
        self.batch_bytes = bytes;
        self.batch_ops = ops;
        self
    }
}
