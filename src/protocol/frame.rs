//! Plaintext frame encoding and decoding.
//!
//! The unencrypted wire format per message:
//! ```text
//! ┌──────────┬───────────────┬───────────────┬─────────────────┐
//! │  0x00    │ varint length │ varint typeid │    payload      │
//! │  1 byte  │   1-5 bytes   │   1-5 bytes   │  length bytes   │
//! └──────────┴───────────────┴───────────────┴─────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::protocol::message::ProtoMessage;
use crate::protocol::varint;

/// Indicator byte opening every plaintext frame.
pub const PLAINTEXT_INDICATOR: u8 = 0x00;

/// Indicator byte opening every encrypted frame.
pub const NOISE_INDICATOR: u8 = 0x01;

/// Maximum accepted payload size.
pub const MAX_FRAME_SIZE: usize = 65535;

/// Encodes a message into a plaintext frame.
#[must_use]
pub fn encode(message: &ProtoMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        1 + varint::encoded_len(message.payload.len() as u64)
            + varint::encoded_len(u64::from(message.type_id))
            + message.payload.len(),
    );
    buf.put_u8(PLAINTEXT_INDICATOR);
    varint::encode(message.payload.len() as u64, &mut buf);
    varint::encode(u64::from(message.type_id), &mut buf);
    buf.put_slice(&message.payload);
    buf.freeze()
}

/// Streaming decoder for plaintext frames.
///
/// Bytes arrive in arbitrary chunks; `feed` appends them to an accumulation
/// buffer and `next_message` extracts at most one complete frame per call,
/// removing exactly that many bytes from the front.
#[derive(Debug, Default)]
pub struct PlaintextCodec {
    buffer: BytesMut,
}

impl PlaintextCodec {
    /// Creates a new codec with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a received chunk to the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete message.
    ///
    /// Returns `Ok(Some(message))` when a full frame is buffered,
    /// `Ok(None)` when more data is needed. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` on a bad indicator byte, an overlong varint,
    /// or a declared length above the protocol maximum. The caller is
    /// expected to terminate the connection; no resynchronization is
    /// attempted.
    pub fn next_message(&mut self) -> Result<Option<ProtoMessage>, FrameError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let indicator = self.buffer[0];
        if indicator != PLAINTEXT_INDICATOR {
            if indicator == NOISE_INDICATOR {
                return Err(FrameError::EncryptionExpected);
            }
            return Err(FrameError::BadIndicator {
                expected: PLAINTEXT_INDICATOR,
                got: indicator,
            });
        }

        let mut offset = 1;
        let Some((length, width)) = varint::decode(&self.buffer[offset..])? else {
            return Ok(None);
        };
        offset += width;
        let Some((type_id, width)) = varint::decode(&self.buffer[offset..])? else {
            return Ok(None);
        };
        offset += width;

        let length = length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() - offset < length {
            return Ok(None);
        }

        self.buffer.advance(offset);
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some(ProtoMessage {
            type_id: type_id as u32,
            payload,
        }))
    }

    /// Number of bytes sitting in the accumulation buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards all buffered bytes. No partial frame survives a reconnect.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageType;

    fn message(type_id: u32, payload: &'static [u8]) -> ProtoMessage {
        ProtoMessage {
            type_id,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode(&ProtoMessage::new(
            MessageType::PingRequest,
            Bytes::from_static(b"hi"),
        ));
        assert_eq!(frame.as_ref(), &[0x00, 0x02, 0x07, b'h', b'i']);
    }

    #[test]
    fn test_decode_complete_frame() {
        let mut codec = PlaintextCodec::new();
        codec.feed(&[0x00, 0x02, 0x07, b'h', b'i']);
        let msg = codec.next_message().unwrap().unwrap();
        assert_eq!(msg.type_id, 7);
        assert_eq!(msg.payload.as_ref(), b"hi");
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_decode_multibyte_varints() {
        // 300-byte payload forces a two-byte length varint; type id 300 too
        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let msg = ProtoMessage {
            type_id: 300,
            payload: Bytes::from(payload.clone()),
        };
        let frame = encode(&msg);
        assert_eq!(&frame[..5], &[0x00, 0xAC, 0x02, 0xAC, 0x02]);

        let mut codec = PlaintextCodec::new();
        codec.feed(&frame);
        let decoded = codec.next_message().unwrap().unwrap();
        assert_eq!(decoded.type_id, 300);
        assert_eq!(decoded.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_truncated_varint_is_incomplete() {
        let mut codec = PlaintextCodec::new();
        codec.feed(&[0x00, 0xAC]);
        assert_eq!(codec.next_message().unwrap(), None);
        codec.feed(&[0x02, 0xAC]);
        assert_eq!(codec.next_message().unwrap(), None);
    }

    #[test]
    fn test_encryption_indicator_is_error() {
        let mut codec = PlaintextCodec::new();
        codec.feed(&[0x01, 0x00, 0x05]);
        assert!(matches!(
            codec.next_message(),
            Err(FrameError::EncryptionExpected)
        ));
    }

    #[test]
    fn test_bad_indicator_is_error() {
        let mut codec = PlaintextCodec::new();
        codec.feed(&[0x42]);
        assert!(matches!(
            codec.next_message(),
            Err(FrameError::BadIndicator { got: 0x42, .. })
        ));
    }

    #[test]
    fn test_every_chunk_split_reconstructs_stream() {
        let messages = [
            message(1, b"\x0a\x05hello"),
            message(93, &[0xFF; 70]),
            message(7, b""),
        ];
        let mut stream = BytesMut::new();
        for msg in &messages {
            stream.extend_from_slice(&encode(msg));
        }

        for split in 0..=stream.len() {
            let mut codec = PlaintextCodec::new();
            let mut decoded = Vec::new();
            for chunk in [&stream[..split], &stream[split..]] {
                codec.feed(chunk);
                while let Some(msg) = codec.next_message().unwrap() {
                    decoded.push(msg);
                }
            }
            assert_eq!(decoded.as_slice(), messages.as_slice(), "split at {split}");
        }
    }

    #[test]
    fn test_clear_discards_partial_frame() {
        let mut codec = PlaintextCodec::new();
        codec.feed(&[0x00, 0x05, 0x07, b'p']);
        assert_eq!(codec.next_message().unwrap(), None);
        codec.clear();
        assert_eq!(codec.buffered(), 0);
        codec.feed(&[0x00, 0x00, 0x08]);
        let msg = codec.next_message().unwrap().unwrap();
        assert_eq!(msg.type_id, 8);
    }
}
