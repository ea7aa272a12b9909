//! # Recovery Orchestrator
//!
//! Drives startup (and post-rollback) recovery: trim the ragged tail of
//! the log, then replay the committed prefix from a known consistent point
//! up to the top of the log.
//!
//! Two anchoring modes:
//!
//! - **Stable checkpoint**: the engine reports a recovery timestamp; the
//!   data files are exactly the state at that timestamp and replay runs
//!   `[stable, top]`.
//! - **Unstable checkpoint**: no recovery timestamp. If `appliedThrough`
//!   is unset the node stopped consistent at the top of the log and there
//!   is nothing to do; otherwise the node died mid-application and replay
//!   runs `[appliedThrough, top]`, after which the markers are advanced
//!   and forced durable so a second crash cannot lose them.
//!
//! Recovery is strictly single-threaded here; the applier may parallelize
//! internally but provides a barrier between batches. Every inconsistency
//! is a fatal site; an error escaping any phase converts to one.

use eyre::{ensure, Result, WrapErr};
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::error::StoreError;
use crate::fatal::{fatal, FatalSite};
use crate::oplog::{OplogBuffer, OplogStore, OpTime, RecordId, ReplaySource, Timestamp};

use super::applier::{next_applier_batch, ApplierObserver, BatchLimits, OplogApplier};
use super::markers::ConsistencyMarkers;
use super::{InRecoveryGuard, PreparedTxns, RecoveryApplierStats, ReplayMode, StorageControl};

pub struct ReplicationRecovery<'a> {
    storage: &'a dyn StorageControl,
    markers: &'a dyn ConsistencyMarkers,
    log: &'a dyn OplogStore,
    prepared: Option<&'a dyn PreparedTxns>,
    config: RecoveryConfig,
}

impl<'a> ReplicationRecovery<'a> {
    pub fn new(
        storage: &'a dyn StorageControl,
        markers: &'a dyn ConsistencyMarkers,
        log: &'a dyn OplogStore,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            storage,
            markers,
            log,
            prepared: None,
            config,
        }
    }

    pub fn with_prepared_txns(mut self, prepared: &'a dyn PreparedTxns) -> Self {
        self.prepared = Some(prepared);
        self
    }

    /// Dispatches on the configured switches: a recover-to timestamp wins,
    /// then standalone mode, then ordinary startup recovery.
    pub fn run(&self, applier: &mut dyn OplogApplier) -> Result<()> {
        if let Some(end) = self.config.recover_to {
            self.recover_up_to(applier, end)?;
        } else if self.config.standalone {
            self.recover_standalone(applier);
        } else {
            self.recover_from_log(applier, None);
        }
        if self.config.read_only {
            self.storage.set_read_only(true);
        }
        Ok(())
    }

    /// Primary recovery path. `stable_ts` is supplied by rollback recovery;
    /// at startup it is `None` and the engine is asked for its recovery
    /// timestamp. Inconsistencies terminate at a fatal site; this function
    /// does not return errors.
    pub fn recover_from_log(&self, applier: &mut dyn OplogApplier, stable_ts: Option<Timestamp>) {
        if self.markers.initial_sync_flag() {
            // An initial sync owns the data files and will redo everything.
            info!("no recovery needed, initial sync flag set");
            return;
        }

        let _guard = InRecoveryGuard::new();
        if let Err(err) = self.recover_from_log_inner(applier, stable_ts) {
            fatal(
                FatalSite::ReplayFailed,
                &format!("error during replication recovery: {err:#}"),
            );
        }
    }

    fn recover_from_log_inner(
        &self,
        applier: &mut dyn OplogApplier,
        mut stable_ts: Option<Timestamp>,
    ) -> Result<()> {
        if stable_ts.is_none() && self.storage.supports_recovery_timestamp() {
            stable_ts = self.storage.recovery_timestamp();
        }
        if stable_ts.is_some_and(Timestamp::is_null) {
            fatal(
                FatalSite::StableTimestampNull,
                "stable checkpoint at the null timestamp",
            );
        }

        let applied_through = self.markers.applied_through();
        if let (Some(stable), Some(applied)) = (stable_ts, applied_through) {
            if stable != applied.ts {
                fatal(
                    FatalSite::StableMismatch,
                    &format!(
                        "stable timestamp {stable} does not equal appliedThrough {applied}"
                    ),
                );
            }
        }

        self.truncate_if_needed(stable_ts)?;

        let Some(top) = self.log.latest() else {
            info!("no log entries to apply for recovery, log is empty");
            return Ok(());
        };
        let top = top.op_time();

        match stable_ts {
            Some(stable) => {
                info!(
                    %stable,
                    %top,
                    applied_through = ?applied_through,
                    "recovering from stable timestamp"
                );
                self.apply_to_end_of_log(applier, stable, top.ts)?;
            }
            None => self.recover_from_unstable_checkpoint(applier, applied_through, top)?,
        }

        self.reconstruct_prepared_txns();
        Ok(())
    }

    fn recover_from_unstable_checkpoint(
        &self,
        applier: &mut dyn OplogApplier,
        applied_through: Option<OpTime>,
        top: OpTime,
    ) -> Result<()> {
        info!(%top, applied_through = ?applied_through, "recovering from an unstable checkpoint");

        let Some(applied) = applied_through else {
            // Clean shutdown or a crash as primary: consistent at the top.
            info!("no log entries to apply for recovery, appliedThrough is unset");
            return Ok(());
        };

        // Truncation may have pulled the oldest timestamp forward; replay
        // writes below it would be rejected as pre-oldest. Move it back to
        // the start point first.
        self.storage.set_oldest_timestamp(applied.ts);

        self.apply_to_end_of_log(applier, applied.ts, top.ts)?;

        self.storage.set_initial_data_timestamp(top.ts);
        // If the node was a primary, appliedThrough may never have been
        // written; pin it to the top so a crash before the first stable
        // checkpoint knows where to replay from.
        self.markers.set_applied_through(Some(top));
        self.storage.wait_until_unjournaled_writes_durable();
        Ok(())
    }

    /// Standalone recovery: requires a stable checkpoint, or the
    /// take-unstable-checkpoint-on-shutdown mode in which case it verifies
    /// no replay is needed. Ends in read-only mode.
    pub fn recover_standalone(&self, applier: &mut dyn OplogApplier) {
        let recovery_ts = self.recovery_timestamp_precursor();

        if recovery_ts.is_some() {
            // Pass no stable timestamp so recover_from_log asks storage,
            // exactly as on replica-set recovery.
            self.recover_from_log(applier, None);
        } else if self.config.take_unstable_checkpoint_on_shutdown {
            info!(
                "recovering from an unstable checkpoint taken on shutdown, \
                 confirming that no log recovery is needed"
            );
            self.assert_no_recovery_needed_on_unstable_checkpoint();
            info!("not doing any log recovery, the unstable checkpoint is up to date");
            self.reconstruct_prepared_txns();
        } else {
            fatal(
                FatalSite::StandaloneNeedsStable,
                "cannot recover as standalone without a stable checkpoint",
            );
        }

        warn!("entering read-only mode after standalone recovery");
        self.storage.set_read_only(true);
    }

    /// Bounded recovery: like the stable path but stopping at `end_ts`.
    /// Returns `BadValue` when the start point is beyond `end_ts` and
    /// `InitialSyncActive` when an initial sync owns the data files.
    pub fn recover_up_to(&self, applier: &mut dyn OplogApplier, end_ts: Timestamp) -> Result<()> {
        if self.markers.initial_sync_flag() {
            return Err(StoreError::InitialSyncActive.into());
        }
        ensure!(!end_ts.is_null(), "recover-to timestamp must not be null");

        let recovery_ts = self.recovery_timestamp_precursor();
        if recovery_ts.is_none() {
            fatal(
                FatalSite::RecoverToNeedsStable,
                "cannot recover to a timestamp without a stable checkpoint",
            );
        }

        self.truncate_if_needed(recovery_ts)?;

        let Some(applied) = self.markers.applied_through() else {
            info!("no stored log entries to apply for bounded recovery");
            return Ok(());
        };
        let start = applied.ts;

        if start == end_ts {
            info!(%start, "no log entries to apply, start point is at the end point");
            return Ok(());
        }
        if start > end_ts {
            return Err(StoreError::BadValue(format!(
                "no log entries to apply: start point {start} is beyond the end point {end_ts}"
            ))
            .into());
        }

        match self.apply_range(applier, start, Some(end_ts)) {
            Ok(None) => info!(%start, %end_ts, "no stored log entries to apply between the bounds"),
            Ok(Some(applied_up_to)) => {
                if applied_up_to > end_ts {
                    fatal(
                        FatalSite::ReplayIncomplete,
                        &format!("applied past the end point: {applied_up_to} > {end_ts}"),
                    );
                }
            }
            Err(err) => fatal(
                FatalSite::ReplayFailed,
                &format!("error during bounded recovery: {err:#}"),
            ),
        }

        self.reconstruct_prepared_txns();
        Ok(())
    }

    /// Verifies that a node shut down with a deliberate unstable checkpoint
    /// needs no replay at all. Each violated expectation is its own fatal
    /// site.
    fn assert_no_recovery_needed_on_unstable_checkpoint(&self) {
        if self.markers.initial_sync_flag() {
            fatal(
                FatalSite::UnexpectedInitialSync,
                "unexpected recovery needed, initial sync flag set",
            );
        }
        if let Some(point) = self.markers.truncate_after_point() {
            fatal(
                FatalSite::UnexpectedTruncatePoint,
                &format!("unexpected recovery needed, log requires truncation after {point}"),
            );
        }
        let Some(top) = self.log.latest() else {
            fatal(
                FatalSite::LogMissingAtVerify,
                "recovery not possible, no log found",
            );
        };
        let top = top.op_time();
        if let Some(applied) = self.markers.applied_through() {
            if applied != top {
                fatal(
                    FatalSite::AppliedThroughBehindTop,
                    &format!(
                        "unexpected recovery needed, appliedThrough {applied} is not at the \
                         top of the log {top}"
                    ),
                );
            }
        }
        let min_valid = self.markers.min_valid();
        if min_valid > top {
            fatal(
                FatalSite::MinValidBeyondTop,
                &format!("unexpected recovery needed, minValid {min_valid} is beyond the top {top}"),
            );
        }
    }

    /// Fatal unless the engine can report a recovery timestamp; a
    /// present-but-null one is a bug in the engine.
    fn recovery_timestamp_precursor(&self) -> Option<Timestamp> {
        if !self.storage.supports_recovery_timestamp() {
            fatal(
                FatalSite::StableTimestampUnsupported,
                "cannot recover from the log with an engine that does not support \
                 recover-to-stable-timestamp",
            );
        }
        let recovery_ts = self.storage.recovery_timestamp();
        if recovery_ts.is_some_and(Timestamp::is_null) {
            fatal(
                FatalSite::StableTimestampNull,
                "cannot recover from a stable checkpoint at the null timestamp",
            );
        }
        recovery_ts
    }

    /// Replays `[start, top]`; the first entry is already applied and is
    /// discarded by the replay source. After this, appliedThrough equals
    /// the top of the log.
    fn apply_to_end_of_log(
        &self,
        applier: &mut dyn OplogApplier,
        start: Timestamp,
        top: Timestamp,
    ) -> Result<()> {
        if start == top {
            info!("no log entries to apply, start point is at the top of the log");
            return Ok(());
        }
        if start > top {
            fatal(
                FatalSite::StartBeyondTop,
                &format!("applied entry at {start} not found, top of log is {top}"),
            );
        }

        let applied_up_to = self
            .apply_range(applier, start, Some(top))
            .wrap_err("applying log entries to the end of the log")?;

        match applied_up_to {
            None => fatal(
                FatalSite::ReplayIncomplete,
                &format!("no entries applied between {start} and {top}"),
            ),
            Some(applied) if applied != top => fatal(
                FatalSite::ReplayIncomplete,
                &format!("did not apply to the top of the log: {applied} != {top}"),
            ),
            Some(_) => Ok(()),
        }
    }

    /// The replay loop: batches from the source, applied in order, the
    /// last applied optime recorded as appliedThrough.
    fn apply_range(
        &self,
        applier: &mut dyn OplogApplier,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> Result<Option<Timestamp>> {
        info!(%start, end = ?end, "replaying stored operations");

        let mut source = ReplaySource::open(self.log, start, end);
        let mut stats = RecoveryApplierStats::default();
        let limits = BatchLimits::from_config(&self.config);

        let mut applied_through: Option<OpTime> = None;
        loop {
            let batch = next_applier_batch(&mut source, &limits);
            if batch.is_empty() {
                break;
            }
            stats.on_batch_begin(&batch);
            let outcome = applier.apply_batch(batch);
            stats.on_batch_end(&outcome);
            let op_time = outcome.wrap_err("applying a recovery batch")?;
            debug_assert!(
                applied_through.map_or(true, |prev| op_time >= prev),
                "batch optimes must not move backward"
            );
            applied_through = Some(op_time);
        }
        stats.complete(applied_through);

        ensure!(
            source.is_empty(),
            "replay source not empty after applying operations, last applied {:?}",
            applied_through
        );

        if let Some(op_time) = applied_through {
            debug_assert!(
                self.markers.applied_through().map_or(true, |prev| op_time >= prev),
                "appliedThrough must not move backward"
            );
            self.markers.set_applied_through(Some(op_time));
        }
        Ok(applied_through.map(|op| op.ts))
    }

    /// Trims the ragged tail when a truncate point is pending, then clears
    /// the point and makes the clear durable.
    fn truncate_if_needed(&self, stable_ts: Option<Timestamp>) -> Result<()> {
        let Some(point) = self.markers.truncate_after_point() else {
            // No holes in the log that would necessitate truncation.
            return Ok(());
        };

        let truncate = match stable_ts {
            Some(stable) if !stable.is_null() && stable < point => {
                info!(
                    %point,
                    %stable,
                    "stable timestamp is earlier than the truncate point, truncating there instead"
                );
                stable
            }
            _ => point,
        };

        info!(%truncate, "removing unapplied log entries after the truncate point");
        self.truncate_log_to(truncate)?;

        self.markers.set_truncate_after_point(None);
        self.storage.wait_until_durable();
        Ok(())
    }

    /// Scans newest-first for the latest entry at or before `truncate` and
    /// discards everything newer (inclusive capped truncate of the oldest
    /// entry strictly greater). Exclusive access to the log for the whole
    /// scan; recovery is the only actor at this point.
    fn truncate_log_to(&self, truncate: Timestamp) -> Result<()> {
        let mut previous: Option<(RecordId, Timestamp)> = None;
        let mut examined = 0usize;
        let mut top: Option<Timestamp> = None;

        for (id, ts) in self.log.scan_backward() {
            examined += 1;
            if examined == 1 {
                top = Some(ts);
            }

            if ts <= truncate {
                match previous {
                    // First entry examined: the whole log is already at or
                    // before the truncate point.
                    None => info!(
                        %truncate,
                        top = ?top,
                        "there are no log entries after the truncate point"
                    ),
                    Some((prev_id, prev_ts)) => {
                        info!(
                            from = %prev_ts,
                            to = ?top,
                            %truncate,
                            "truncating log"
                        );
                        self.log
                            .truncate_after(prev_id)
                            .wrap_err("capped truncate of the log tail")?;
                    }
                }
                return Ok(());
            }

            previous = Some((id, ts));
        }

        fatal(
            FatalSite::TruncateNoBound,
            &format!(
                "reached the end of the log looking for an entry at or before {truncate} \
                 after examining {examined} entries"
            ),
        );
    }

    fn reconstruct_prepared_txns(&self) {
        let Some(prepared) = self.prepared else {
            return;
        };
        if let Err(err) = prepared.reconstruct(ReplayMode::Recovering) {
            fatal(
                FatalSite::ReplayFailed,
                &format!("failed to reconstruct prepared transactions: {err:#}"),
            );
        }
    }
}
