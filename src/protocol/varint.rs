//! Variable-length unsigned integer encoding.
//!
//! The plaintext framing mode and the protobuf field codec both use the
//! same LEB128-style encoding: 7 data bits per byte, least-significant
//! group first, with the high bit set on every byte except the last.

use bytes::{BufMut, BytesMut};

use crate::error::FrameError;

/// Maximum encoded width of a 64-bit varint.
pub const MAX_VARINT_BYTES: usize = 10;

/// Appends `value` to `buf` in varint form.
pub fn encode(value: u64, buf: &mut BytesMut) {
    let mut value = value;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Returns the encoded width of `value` in bytes.
#[must_use]
pub const fn encoded_len(value: u64) -> usize {
    // 7 bits per byte, at least one byte for zero
    let bits = 64 - value.leading_zeros() as usize;
    if bits == 0 { 1 } else { bits.div_ceil(7) }
}

/// Decodes a varint from the front of `buf`.
///
/// Returns `Ok(Some((value, width)))` on success, `Ok(None)` if the buffer
/// ends before a terminating byte (truncated input is not an error at this
/// layer), or `FrameError::VarintOverflow` if the encoding runs past the
/// maximum width.
///
/// # Errors
///
/// Returns `FrameError::VarintOverflow` for overlong encodings.
pub fn decode(buf: &[u8]) -> Result<Option<(u64, usize)>, FrameError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(FrameError::VarintOverflow {
                max_bytes: MAX_VARINT_BYTES,
            });
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        return Err(FrameError::VarintOverflow {
            max_bytes: MAX_VARINT_BYTES,
        });
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u64) -> (u64, usize) {
        let mut buf = BytesMut::new();
        encode(value, &mut buf);
        assert_eq!(buf.len(), encoded_len(value));
        decode(&buf).unwrap().unwrap()
    }

    #[test]
    fn test_roundtrip_boundaries() {
        for value in [
            0u64,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x001F_FFFF,
            0x0020_0000,
            u64::from(u32::MAX),
            u64::MAX,
        ] {
            let (decoded, width) = roundtrip(value);
            assert_eq!(decoded, value);
            assert_eq!(width, encoded_len(value));
        }
    }

    #[test]
    fn test_roundtrip_sampled_u32_range() {
        // 7-bits-per-byte rule across the whole 32-bit range
        let mut value: u64 = 0;
        while value < u64::from(u32::MAX) {
            let (decoded, width) = roundtrip(value);
            assert_eq!(decoded, value);
            assert_eq!(width, (64 - value.leading_zeros() as usize).max(1).div_ceil(7));
            value = value * 3 + 1;
        }
    }

    #[test]
    fn test_encoded_len_rule() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(0x7F), 1);
        assert_eq!(encoded_len(0x80), 2);
        assert_eq!(encoded_len(0x3FFF), 2);
        assert_eq!(encoded_len(0x4000), 3);
        assert_eq!(encoded_len(u64::from(u32::MAX)), 5);
    }

    #[test]
    fn test_truncated_is_incomplete() {
        // High bit set on every byte means "more follows"
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0xFF, 0xFF]).unwrap(), None);
    }

    #[test]
    fn test_overlong_is_error() {
        let overlong = [0xFF_u8; MAX_VARINT_BYTES + 1];
        assert!(matches!(
            decode(&overlong),
            Err(FrameError::VarintOverflow { .. })
        ));
        // Exactly MAX bytes of continuation with no terminator is also overflow
        let unterminated = [0xFF_u8; MAX_VARINT_BYTES];
        assert!(matches!(
            decode(&unterminated),
            Err(FrameError::VarintOverflow { .. })
        ));
    }
}
