//! Minimal protobuf wire codec.
//!
//! The native API payloads are protobuf messages. The full schema registry
//! is supplied externally; this module implements just enough of the wire
//! format (varint, 32-bit, 64-bit and length-delimited fields) for the
//! session-control messages the connection handles itself.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::varint;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Incremental encoder for protobuf messages.
///
/// Fields with default values are skipped by the callers, matching proto3
/// serialization.
#[derive(Debug, Default)]
pub struct ProtoWriter {
    buf: BytesMut,
}

impl ProtoWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, field: u32, wire_type: u8) {
        varint::encode(u64::from(field) << 3 | u64::from(wire_type), &mut self.buf);
    }

    /// Writes a varint field (uint32/uint64/enum).
    pub fn varint(&mut self, field: u32, value: u64) {
        self.tag(field, WIRE_VARINT);
        varint::encode(value, &mut self.buf);
    }

    /// Writes a bool field.
    pub fn bool(&mut self, field: u32, value: bool) {
        self.varint(field, u64::from(value));
    }

    /// Writes a fixed32 field.
    pub fn fixed32(&mut self, field: u32, value: u32) {
        self.tag(field, WIRE_FIXED32);
        self.buf.put_u32_le(value);
    }

    /// Writes a float field.
    pub fn float(&mut self, field: u32, value: f32) {
        self.fixed32(field, value.to_bits());
    }

    /// Writes a fixed64 field.
    pub fn fixed64(&mut self, field: u32, value: u64) {
        self.tag(field, WIRE_FIXED64);
        self.buf.put_u64_le(value);
    }

    /// Writes a length-delimited bytes field.
    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        self.tag(field, WIRE_LEN);
        varint::encode(value.len() as u64, &mut self.buf);
        self.buf.put_slice(value);
    }

    /// Writes a string field.
    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    /// Consumes the writer and returns the encoded message.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A decoded protobuf field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProtoValue<'a> {
    /// Varint-encoded scalar.
    Varint(u64),
    /// 32-bit little-endian scalar.
    Fixed32(u32),
    /// 64-bit little-endian scalar.
    Fixed64(u64),
    /// Length-delimited bytes (string, bytes, embedded message).
    Bytes(&'a [u8]),
}

impl ProtoValue<'_> {
    /// Interprets the value as an unsigned varint scalar.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        match self {
            Self::Varint(v) | Self::Fixed64(v) => *v,
            Self::Fixed32(v) => *v as u64,
            Self::Bytes(_) => 0,
        }
    }

    /// Interprets the value as a bool.
    #[must_use]
    pub const fn as_bool(&self) -> bool {
        self.as_u64() != 0
    }

    /// Interprets the value as a zigzag-encoded signed scalar (sint32).
    #[must_use]
    pub const fn as_sint32(&self) -> i32 {
        let v = self.as_u64() as u32;
        ((v >> 1) as i32) ^ -((v & 1) as i32)
    }

    /// Interprets the value as UTF-8 text.
    #[must_use]
    pub fn as_str_lossy(&self) -> String {
        match self {
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        }
    }

    /// Interprets the value as raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            _ => &[],
        }
    }
}

/// Iterator over the `(field number, value)` pairs of an encoded message.
#[derive(Debug)]
pub struct ProtoFields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoFields<'a> {
    /// Wraps an encoded message body.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64> {
        match varint::decode(&self.data[self.pos..]) {
            Ok(Some((value, width))) => {
                self.pos += width;
                Ok(value)
            }
            Ok(None) => Err(truncated()),
            Err(e) => Err(Error::Frame(e)),
        }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(truncated());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

fn truncated() -> Error {
    Error::Protocol {
        message: "truncated protobuf message".into(),
    }
}

impl<'a> Iterator for ProtoFields<'a> {
    type Item = Result<(u32, ProtoValue<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let result = (|| {
            let key = self.read_varint()?;
            let field = (key >> 3) as u32;
            let value = match (key & 0x07) as u8 {
                WIRE_VARINT => ProtoValue::Varint(self.read_varint()?),
                WIRE_FIXED64 => {
                    let b = self.read_slice(8)?;
                    ProtoValue::Fixed64(u64::from_le_bytes(b.try_into().map_err(|_| truncated())?))
                }
                WIRE_LEN => {
                    let len = self.read_varint()? as usize;
                    ProtoValue::Bytes(self.read_slice(len)?)
                }
                WIRE_FIXED32 => {
                    let b = self.read_slice(4)?;
                    ProtoValue::Fixed32(u32::from_le_bytes(b.try_into().map_err(|_| truncated())?))
                }
                wire => {
                    return Err(Error::Protocol {
                        message: format!("unsupported protobuf wire type {wire}"),
                    });
                }
            };
            Ok((field, value))
        })();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_roundtrip() {
        let mut w = ProtoWriter::new();
        w.varint(1, 42);
        w.string(2, "esphome");
        w.fixed32(3, 0xDEAD_BEEF);
        w.fixed64(4, 0x1122_3344_5566_7788);
        w.float(5, 1.5);
        let encoded = w.finish();

        let fields: Vec<_> = ProtoFields::new(&encoded)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(fields[0], (1, ProtoValue::Varint(42)));
        assert_eq!(fields[1], (2, ProtoValue::Bytes(b"esphome")));
        assert_eq!(fields[2], (3, ProtoValue::Fixed32(0xDEAD_BEEF)));
        assert_eq!(fields[3], (4, ProtoValue::Fixed64(0x1122_3344_5566_7788)));
        assert_eq!(fields[4], (5, ProtoValue::Fixed32(1.5_f32.to_bits())));
    }

    #[test]
    fn test_sint32_zigzag() {
        assert_eq!(ProtoValue::Varint(0).as_sint32(), 0);
        assert_eq!(ProtoValue::Varint(1).as_sint32(), -1);
        assert_eq!(ProtoValue::Varint(2).as_sint32(), 1);
        assert_eq!(ProtoValue::Varint(131).as_sint32(), -66);
    }

    #[test]
    fn test_truncated_message() {
        // Length-delimited field declaring more bytes than present
        let mut w = ProtoWriter::new();
        w.bytes(1, &[1, 2, 3, 4]);
        let encoded = w.finish();
        let cut = &encoded[..encoded.len() - 2];
        let result: Result<Vec<_>> = ProtoFields::new(cut).collect();
        assert!(result.is_err());
    }
}
