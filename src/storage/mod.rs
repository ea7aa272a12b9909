//! # Storage Layer
//!
//! Block-level access to disk page images. The block reader produces a
//! page's raw bytes either as an owned allocation or as a borrowed slice
//! of a memory-mapped file; the page materializer parses those bytes
//! without copying the payload and the resulting page image steals the
//! buffer on success.
//!
//! ## Mapped vs owned bytes
//!
//! Mapped reads return `DiskBytes::Mapped`, a range of an `Arc`-shared
//! mapping. The mapping stays valid for as long as any page image holds a
//! clone of the `Arc`; files read through a mapped reader are never
//! remapped or truncated while readers exist. Owned reads copy the block
//! into a `Vec` and have no lifetime coupling to the file.
//!
//! ## Block addresses
//!
//! A block address is an opaque cookie `(offset, size, checksum)` packed
//! with the order-preserving recno encoding. The lookaside table keys
//! entries by the packed form, comparing size first and then bytes, so two
//! addresses match only if they refer to the same block generation.
//!
//! ## Module organization
//!
//! - `block`: `BlockAddr`, `DiskBytes`, the `BlockReader` trait and the
//!   file-backed implementation
//! - `page`: disk page format and the in-memory `PageImage`

mod block;
mod page;

pub use block::{append_block, BlockAddr, BlockReader, DiskBytes, FileBlockReader};
pub use page::{
    DiskPageHeader, EntryKey, PageEntry, PageImage, PageType, DISK_PAGE_HEADER_SIZE,
    PAGE_FLAG_SPILLED, PAGE_MAGIC,
};
