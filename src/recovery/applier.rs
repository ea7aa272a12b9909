//! # Batching Applier Surface
//!
//! Recovery drives an external applier in batches bounded by bytes and
//! entry count. The applier owns how a batch is executed (it may fan out
//! over an internal worker pool) but guarantees every effect of batch
//! N is visible before batch N+1 begins. Observer callbacks bracket each
//! batch; the stats observer turns them into recovery progress logging.

use tracing::{debug, info};

use crate::config::RecoveryConfig;
use crate::oplog::{OplogBuffer, OplogEntry, OpTime};

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub bytes: usize,
    pub ops: usize,
}

impl BatchLimits {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            bytes: config.batch_bytes,
            ops: config.batch_ops,
        }
    }
}

/// Applies one batch of log entries, returning the optime of the last
/// entry applied.
pub trait OplogApplier {
    fn apply_batch(&mut self, batch: Vec<OplogEntry>) -> eyre::Result<OpTime>;
}

pub trait ApplierObserver {
    fn on_batch_begin(&mut self, batch: &[OplogEntry]);
    fn on_batch_end(&mut self, outcome: &eyre::Result<OpTime>);
}

/// Pulls the next batch from the replay source. A non-empty source always
/// yields at least one entry, even when that entry alone exceeds the byte
/// limit.
pub fn next_applier_batch(source: &mut dyn OplogBuffer, limits: &BatchLimits) -> Vec<OplogEntry> {
    let mut batch = Vec::new();
    let mut bytes = 0usize;

    loop {
        let Some(size) = source.peek().map(OplogEntry::size) else {
            break;
        };
        if !batch.is_empty() && (bytes + size > limits.bytes || batch.len() >= limits.ops) {
            break;
        }
        let Some(entry) = source.try_pop() else {
            break;
        };
        bytes += size;
        batch.push(entry);
    }
    batch
}

/// Tracks and logs operations applied during recovery.
#[derive(Debug, Default)]
pub struct RecoveryApplierStats {
    batches: usize,
    ops: usize,
}

impl RecoveryApplierStats {
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn ops(&self) -> usize {
        self.ops
    }

    pub fn complete(&self, applied_through: Option<OpTime>) {
        match applied_through {
            Some(op_time) => info!(
                ops = self.ops,
                batches = self.batches,
                %op_time,
                "applied recovery operations"
            ),
            None => info!("no recovery operations applied"),
        }
    }
}

impl ApplierObserver for RecoveryApplierStats {
    fn on_batch_begin(&mut self, batch: &[OplogEntry]) {
        self.batches += 1;
        debug!(
            batch = self.batches,
            len = batch.len(),
            from = batch.first().map(|e| e.ts.0).unwrap_or(0),
            to = batch.last().map(|e| e.ts.0).unwrap_or(0),
            applied_so_far = self.ops,
            "applying recovery batch"
        );
        self.ops += batch.len();
    }

    fn on_batch_end(&mut self, outcome: &eyre::Result<OpTime>) {
        if let Err(err) = outcome {
            debug!("recovery batch failed: {err:#}");
        }
    }
}
