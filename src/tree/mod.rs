//! # Tree Layer
//!
//! Page references and the fault path that turns a disk address into an
//! in-memory page image. Coordination is lock-free: a single atomic state
//! word per reference selects one materializing actor and publishes the
//! finished image to everyone else.

mod materialize;
mod page_ref;

pub use materialize::{read_page, FaultContext};
pub use page_ref::{PageRef, RefState};
