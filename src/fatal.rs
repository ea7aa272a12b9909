//! # Fatal Sites
//!
//! Recovery inconsistencies are not recoverable errors: the durable state
//! must remain exactly what was committed, so fatal paths terminate the
//! process immediately instead of unwinding. Each fatal site carries a
//! distinct, stable exit code so operators and tests can identify the site
//! from the process status alone.
//!
//! A process-wide hook can be installed to intercept termination; the test
//! suites install a panicking hook so fatal paths can be exercised without
//! killing the harness. Production never installs a hook.

use parking_lot::Mutex;
use tracing::error;

/// One entry per fatal site. The discriminant is the process exit code;
/// codes are stable and must never be reused for a different site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FatalSite {
    /// Replay range query returned nothing for a declared `[start, end]`.
    ReplayRangeEmpty = 70,
    /// First log entry in the replay range does not match the start point.
    MissingStartEntry = 71,
    /// Storage reported a stable checkpoint at the null timestamp.
    StableTimestampNull = 72,
    /// Log recovery requested on an engine without stable-checkpoint support.
    StableTimestampUnsupported = 73,
    /// Truncation scanned the whole log without finding an entry at or
    /// before the truncate point.
    TruncateNoBound = 74,
    /// Replay start point is beyond the top of the log.
    StartBeyondTop = 75,
    /// Standalone recovery without a stable checkpoint or the
    /// unstable-checkpoint-on-shutdown mode.
    StandaloneNeedsStable = 76,
    /// Recover-to-timestamp without a stable checkpoint.
    RecoverToNeedsStable = 77,
    /// Unstable-checkpoint verification found the initial sync flag set.
    UnexpectedInitialSync = 78,
    /// Unstable-checkpoint verification found a pending truncate point.
    UnexpectedTruncatePoint = 79,
    /// Unstable-checkpoint verification found no log at all.
    LogMissingAtVerify = 80,
    /// Unstable-checkpoint verification found appliedThrough behind the top
    /// of the log.
    AppliedThroughBehindTop = 81,
    /// Unstable-checkpoint verification found minValid beyond the top of
    /// the log.
    MinValidBeyondTop = 82,
    /// Stable timestamp does not equal the appliedThrough timestamp.
    StableMismatch = 83,
    /// An error escaped the replay loop or another recovery phase.
    ReplayFailed = 84,
    /// Replay finished without reaching the declared end point.
    ReplayIncomplete = 85,
}

impl FatalSite {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

type FatalHook = Box<dyn Fn(FatalSite) + Send + Sync>;

static FATAL_HOOK: Mutex<Option<FatalHook>> = Mutex::new(None);

/// Installs a process-wide hook invoked before termination. Intended for
/// tests; the hook may panic to abort the fatal path. Replaces any
/// previously installed hook.
pub fn install_fatal_hook(hook: impl Fn(FatalSite) + Send + Sync + 'static) {
    *FATAL_HOOK.lock() = Some(Box::new(hook));
}

/// Logs the site and terminates without unwinding. Destructors do not run;
/// the on-disk state stays exactly what was durably committed.
pub fn fatal(site: FatalSite, msg: &str) -> ! {
    error!(site = ?site, code = site.exit_code(), "fatal: {msg}");
    if let Some(hook) = FATAL_HOOK.lock().as_ref() {
        hook(site);
    }
    std::process::exit(site.exit_code())
}
