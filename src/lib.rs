//! # keeldb-core: Crash Recovery & Page Materialization
//!
//! The recovery core of keeldb, a log-structured MVCC key-value engine
//! underlying a document store. Two tightly coupled subsystems live here:
//!
//! 1. **Page read & lookaside instantiation**: faulting an on-disk page
//!    into memory and re-attaching the update records that were spilled to
//!    a side table because they were not yet globally visible at eviction
//!    time.
//! 2. **Replication-log recovery**: replaying the committed prefix of the
//!    durable operation log from a known consistent point up to its tail.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │        Recovery Orchestrator (recovery)     │
//! │  markers · truncator · replay · applier     │
//! ├────────────────────────────────────────────┤
//! │          Operation Log (oplog)              │
//! │  store · bounded replay source              │
//! ├────────────────────────────────────────────┤
//! │   Page Fault Path (tree)                    │
//! │  ref state machine · materializer           │
//! ├──────────────────────┬─────────────────────┤
//! │  MVCC (mvcc)         │  Storage (storage)  │
//! │  visibility · chains │  blocks · pages     │
//! │  lookaside table     │  mapped/owned bytes │
//! └──────────────────────┴─────────────────────┘
//! ```
//!
//! Everything peripheral (the query layer, index maintenance, the block
//! allocator, network replication, checkpoint scheduling) stays behind
//! the narrow traits in these modules (`BlockReader`, `OplogStore`,
//! `ConsistencyMarkers`, `StorageControl`, `Visibility`, `OplogApplier`).
//!
//! ## Concurrency model
//!
//! Page materialization is coordinated lock-free through one atomic state
//! word per page reference; the CAS winner does all I/O and publishes with
//! a release store. Recovery is single-threaded at the orchestrator and
//! uncancellable: inconsistencies terminate at stable fatal sites
//! ([`fatal::FatalSite`]) rather than unwinding.
//!
//! ## Module overview
//!
//! - [`storage`]: block reader, mapped/owned disk bytes, page images
//! - [`mvcc`]: visibility oracle, update chains, the lookaside table
//! - [`tree`]: page-reference state machine and the materializer
//! - [`oplog`]: log types, the log store, the bounded replay source
//! - [`recovery`]: consistency markers, batching applier surface, the
//!   recovery orchestrator
//! - [`encoding`]: order-preserving record-number encoding
//! - [`config`]: constants and recovery switches
//! - [`fatal`]: fatal sites with stable exit codes

pub mod config;
pub mod encoding;
pub mod error;
pub mod fatal;
pub mod mvcc;
pub mod oplog;
pub mod recovery;
pub mod storage;
pub mod tree;

pub use config::RecoveryConfig;
pub use error::{Result, StoreError};
pub use oplog::{OplogEntry, OpTime, Timestamp};
pub use recovery::ReplicationRecovery;
