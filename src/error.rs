//! # Error Taxonomy
//!
//! Typed errors for the storage and MVCC layers, where callers need to
//! discriminate error kinds: `NotFound` at the end of a lookaside scan is
//! normal and recovered by the caller, `StateRaceLost` means another actor
//! is already materializing a page and the loser simply proceeds.
//!
//! The recovery orchestrator layers `eyre` context on top of these; a
//! `StoreError` converts into an `eyre::Report` through `std::error::Error`.
//! Fatal recovery inconsistencies never surface as values; they terminate
//! through the sites in [`crate::fatal`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Cursor positioned past the last matching entry, or key absent.
    #[error("not found")]
    NotFound,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk bytes that cannot be parsed into the expected structure.
    #[error("format error: {0}")]
    Format(String),

    #[error("visibility error: {0}")]
    Visibility(String),

    /// Another actor won the materialization race. Benign.
    #[error("lost page-state race")]
    StateRaceLost,

    /// An invariant the caller cannot recover from; the recovery layer
    /// converts these into fatal sites.
    #[error("invariant violated: {0}")]
    FatalInvariant(String),

    #[error("bad value: {0}")]
    BadValue(String),

    /// Recovery requested while an initial sync owns the data files.
    #[error("initial sync is active")]
    InitialSyncActive,
}

impl StoreError {
    pub fn format(msg: impl Into<String>) -> Self {
        StoreError::Format(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        StoreError::FatalInvariant(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
