//! # Encoding
//!
//! Byte-level encodings shared by the storage layer and the lookaside
//! table. `recno` holds the order-preserving variable-length integers used
//! for record numbers; they double as lookaside user keys for column-store
//! pages, so their byte order must match their numeric order.

pub mod recno;

pub use recno::{decode_recno, encode_recno, recno_len};
