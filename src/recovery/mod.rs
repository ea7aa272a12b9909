//! # Recovery
//!
//! Replays the committed prefix of the operation log after a crash or a
//! rollback, driving the engine to a consistent state before it accepts
//! work. The orchestrator combines the consistency markers, the log
//! truncator, the replay source, and a batching applier; everything it
//! coordinates sits behind narrow traits so the engine's real collaborators
//! and the test rigs plug in the same way.
//!
//! Recovery is single-threaded and uncancellable: any inconsistency it
//! meets is a fatal site, not an error.

pub mod applier;
pub mod markers;
mod orchestrator;

use std::sync::atomic::{AtomicUsize, Ordering};

pub use applier::{
    next_applier_batch, ApplierObserver, BatchLimits, OplogApplier, RecoveryApplierStats,
};
pub use markers::{ConsistencyMarkers, MemMarkers};
pub use orchestrator::ReplicationRecovery;

use crate::oplog::Timestamp;

/// Mode handed to collaborators that replay or reconstruct state on behalf
/// of recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Recovering,
}

/// Engine-side control hooks recovery needs from the storage layer.
pub trait StorageControl: Send + Sync {
    /// Whether the engine takes stable checkpoints and can report a
    /// recovery timestamp.
    fn supports_recovery_timestamp(&self) -> bool;

    /// The stable checkpoint's timestamp, if one exists. `None` means the
    /// last checkpoint was unstable.
    fn recovery_timestamp(&self) -> Option<Timestamp>;

    /// Moves the oldest-readable timestamp back so replay writes are not
    /// rejected as pre-oldest.
    fn set_oldest_timestamp(&self, ts: Timestamp);

    fn set_initial_data_timestamp(&self, ts: Timestamp);

    fn set_read_only(&self, read_only: bool);

    /// Journaled-writes durability barrier.
    fn wait_until_durable(&self);

    /// Unjournaled-writes durability barrier: forces marker writes into a
    /// checkpoint so they survive a second crash.
    fn wait_until_unjournaled_writes_durable(&self);
}

/// Reconstructs in-flight prepared transactions after replay. Engines
/// without prepared transactions supply a no-op.
pub trait PreparedTxns: Send + Sync {
    fn reconstruct(&self, mode: ReplayMode) -> eyre::Result<()>;
}

static IN_RECOVERY: AtomicUsize = AtomicUsize::new(0);

/// Whether replication recovery is currently running in this process.
pub fn in_replication_recovery() -> bool {
    IN_RECOVERY.load(Ordering::Acquire) > 0
}

/// Scoped process-wide in-recovery flag; cleared on every exit path.
pub(crate) struct InRecoveryGuard(());

impl InRecoveryGuard {
    pub(crate) fn new() -> Self {
        IN_RECOVERY.fetch_add(1, Ordering::AcqRel);
        InRecoveryGuard(())
    }
}

impl Drop for InRecoveryGuard {
    fn drop(&mut self) {
        let previous = IN_RECOVERY.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            previous > 0,
            "in-recovery flag unexpectedly unset while a recovery guard is live"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_sets_flag_while_held() {
        let guard = InRecoveryGuard::new();
        assert!(in_replication_recovery());
        drop(guard);
    }

    #[test]
    fn nested_guards_compose() {
        let outer = InRecoveryGuard::new();
        {
            let _inner = InRecoveryGuard::new();
            assert!(in_replication_recovery());
        }
        assert!(in_replication_recovery());
        drop(outer);
    }
}
