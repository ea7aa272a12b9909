//! # Order-Preserving Record Numbers
//!
//! Variable-length encoding for `u64` record numbers with one property the
//! usual length-marker varints lack: the encoded bytes compare
//! lexicographically in the same order as the values. Column-store pages
//! use encoded record numbers as lookaside user keys, and the lookaside
//! composite key is ordered by raw byte comparison, so the encoding must
//! sort correctly on its own.
//!
//! ## Format
//!
//! | Value range            | Bytes | Layout                                |
//! |------------------------|-------|---------------------------------------|
//! | 0 - 0xF7               | 1     | `[value]`                             |
//! | 0xF8 - u64::MAX        | 1+n   | `[0xF8 + (n-1), n big-endian bytes]`  |
//!
//! `n` is the minimal big-endian width (1..=8), so every value has exactly
//! one encoding. Order holds because single-byte encodings (<= 0xF7) sort
//! below every prefixed encoding, longer prefixes sort above shorter ones,
//! and equal-width payloads compare as big-endian magnitudes.
//!
//! ## Boundary values
//!
//! - 0xF7: largest single-byte value
//! - 0xF8: smallest prefixed value (`[0xF8, 0xF8]`)
//! - 0xFF: largest 1-wide payload (`[0xF8, 0xFF]`)
//! - 0x100: smallest 2-wide payload (`[0xF9, 0x01, 0x00]`)
//! - u64::MAX: 8-wide payload (`[0xFF, ..8 bytes..]`)

use crate::error::{Result, StoreError};

const SINGLE_MAX: u64 = 0xF7;
const PREFIX_BASE: u8 = 0xF8;

/// Encoded length of `value` in bytes.
pub fn recno_len(value: u64) -> usize {
    if value <= SINGLE_MAX {
        1
    } else {
        1 + be_width(value)
    }
}

/// Appends the encoding of `value` to `buf`, returning the bytes written.
pub fn encode_recno(value: u64, buf: &mut Vec<u8>) -> usize {
    if value <= SINGLE_MAX {
        buf.push(value as u8);
        return 1;
    }
    let width = be_width(value);
    buf.push(PREFIX_BASE + (width as u8 - 1));
    buf.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    1 + width
}

/// Decodes one record number from the front of `buf`, returning the value
/// and the bytes consumed.
pub fn decode_recno(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf
        .first()
        .ok_or_else(|| StoreError::format("empty buffer for recno decode"))?;

    if u64::from(first) <= SINGLE_MAX {
        return Ok((u64::from(first), 1));
    }

    let width = usize::from(first - PREFIX_BASE) + 1;
    if buf.len() < 1 + width {
        return Err(StoreError::format(format!(
            "truncated recno: need {} payload bytes, have {}",
            width,
            buf.len() - 1
        )));
    }

    let mut be = [0u8; 8];
    be[8 - width..].copy_from_slice(&buf[1..1 + width]);
    let value = u64::from_be_bytes(be);

    // Reject non-minimal encodings so each value has a unique byte form.
    if recno_len(value) != 1 + width {
        return Err(StoreError::format(format!(
            "non-minimal recno encoding for value {value}"
        )));
    }
    Ok((value, 1 + width))
}

fn be_width(value: u64) -> usize {
    debug_assert!(value > SINGLE_MAX);
    (8 - value.leading_zeros() as usize / 8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recno_len_boundaries() {
        assert_eq!(recno_len(0), 1);
        assert_eq!(recno_len(0xF7), 1);
        assert_eq!(recno_len(0xF8), 2);
        assert_eq!(recno_len(0xFF), 2);
        assert_eq!(recno_len(0x100), 3);
        assert_eq!(recno_len(0xFFFF), 3);
        assert_eq!(recno_len(0x1_0000), 4);
        assert_eq!(recno_len(0xFFFF_FFFF), 5);
        assert_eq!(recno_len(0x1_0000_0000), 6);
        assert_eq!(recno_len(u64::MAX), 9);
    }

    #[test]
    fn encode_single_byte() {
        let mut buf = Vec::new();
        assert_eq!(encode_recno(0, &mut buf), 1);
        assert_eq!(buf, [0]);

        buf.clear();
        assert_eq!(encode_recno(0xF7, &mut buf), 1);
        assert_eq!(buf, [0xF7]);
    }

    #[test]
    fn encode_prefixed() {
        let mut buf = Vec::new();
        assert_eq!(encode_recno(0xF8, &mut buf), 2);
        assert_eq!(buf, [0xF8, 0xF8]);

        buf.clear();
        assert_eq!(encode_recno(0x100, &mut buf), 3);
        assert_eq!(buf, [0xF9, 0x01, 0x00]);

        buf.clear();
        assert_eq!(encode_recno(u64::MAX, &mut buf), 9);
        assert_eq!(buf[0], 0xFF);
        assert_eq!(&buf[1..], &u64::MAX.to_be_bytes());
    }

    #[test]
    fn roundtrip_boundary_values() {
        let values = [
            0u64,
            1,
            0xF7,
            0xF8,
            0xFF,
            0x100,
            0xFFFF,
            0x1_0000,
            0xFF_FFFF,
            0x100_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            u64::MAX,
        ];
        for &value in &values {
            let mut buf = Vec::new();
            let written = encode_recno(value, &mut buf);
            assert_eq!(written, recno_len(value), "len mismatch for {value}");
            let (decoded, read) = decode_recno(&buf).unwrap();
            assert_eq!(decoded, value, "value mismatch for {value}");
            assert_eq!(read, written, "consumed mismatch for {value}");
        }
    }

    #[test]
    fn byte_order_matches_numeric_order() {
        let values = [
            0u64, 1, 0x80, 0xF7, 0xF8, 0xFF, 0x100, 0x1234, 0xFFFF, 0x1_0000, 0xFF_FFFF,
            0xFFFF_FFFF, 0x1_0000_0000, u64::MAX,
        ];
        let mut encoded: Vec<Vec<u8>> = Vec::new();
        for &value in &values {
            let mut buf = Vec::new();
            encode_recno(value, &mut buf);
            encoded.push(buf);
        }
        for window in encoded.windows(2) {
            assert!(window[0] < window[1], "encodings out of order");
        }
    }

    #[test]
    fn decode_empty_buffer_fails() {
        assert!(decode_recno(&[]).is_err());
    }

    #[test]
    fn decode_truncated_payload_fails() {
        assert!(decode_recno(&[0xF9, 0x01]).is_err());
    }

    #[test]
    fn decode_non_minimal_encoding_fails() {
        // 0x42 padded out to a 2-wide payload.
        assert!(decode_recno(&[0xF9, 0x00, 0x42]).is_err());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let (value, read) = decode_recno(&[0x07, 0xAA, 0xBB]).unwrap();
        assert_eq!(value, 7);
        assert_eq!(read, 1);
    }
}
