//! Wire Codec
//!
//! The Android TV Remote protocol uses two length-framing conventions and a
//! small subset of protobuf field encoding. Both framings are needed and must
//! not be mixed up:
//!
//! - **Control channel** (port 6466): continuation-length framing. Each length
//!   byte equal to `0xFF` means another length byte follows; the first byte
//!   that is not `0xFF` terminates the prefix. The collected bytes, in the
//!   order received, are read as a big-endian integer.
//! - **Pairing channel** (port 6467): single-byte framing. The first byte is
//!   the length of the message body that follows it.
//!
//! ## Field Encoding
//!
//! A field key is `(field_number << 3) | wire_type`, written as a varint.
//! Varints carry 7 value bits per byte, least significant group first, with
//! the high bit set on every byte except the last.
//!
//! Only values up to `2^28 - 1` are ever produced by this protocol; the
//! encoder refuses anything larger instead of truncating it.
//!
//! ```
//! use atvremote_protocol::codec::{encode_varint, decode_varint};
//!
//! let bytes = encode_varint(300).unwrap();
//! assert_eq!(bytes, vec![0xac, 0x02]);
//! assert_eq!(decode_varint(&bytes).unwrap(), Some((300, 2)));
//! ```

use crate::{ProtocolError, Result};

/// Largest value the varint encoder accepts
pub const MAX_VARINT: u32 = (1 << 28) - 1;

/// Longest varint a u64 can need
const MAX_VARINT_BYTES: usize = 10;

/// Continuation length prefixes longer than this cannot fit a u32
const MAX_CONTINUATION_BYTES: usize = 4;

/// Continuation byte of the control channel length prefix
const CONTINUATION: u8 = 0xFF;

/// Protobuf wire types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    VarInt = 0,
    SixtyFourBit = 1,
    LengthDelimited = 2,
    StartGroup = 3,
    EndGroup = 4,
    ThirtyTwoBit = 5,
}

impl TryFrom<u8> for WireType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(WireType::VarInt),
            1 => Ok(WireType::SixtyFourBit),
            2 => Ok(WireType::LengthDelimited),
            3 => Ok(WireType::StartGroup),
            4 => Ok(WireType::EndGroup),
            5 => Ok(WireType::ThirtyTwoBit),
            other => Err(ProtocolError::InvalidMessage(format!(
                "Unknown wire type {}",
                other
            ))),
        }
    }
}

/// Encode a varint
///
/// Fails with [`ProtocolError::EncodingLimit`] for values above [`MAX_VARINT`].
pub fn encode_varint(value: u32) -> Result<Vec<u8>> {
    if value > MAX_VARINT {
        return Err(ProtocolError::EncodingLimit(value as u64));
    }

    let mut out = Vec::with_capacity(4);
    let mut remaining = value;
    loop {
        let group = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining == 0 {
            out.push(group);
            return Ok(out);
        }
        out.push(group | 0x80);
    }
}

/// Decode a varint from the start of `data`
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// terminating byte has not arrived yet.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(ProtocolError::InvalidMessage(
                "Varint longer than 10 bytes".to_string(),
            ));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Encode a field key
pub fn encode_key(field_number: u32, wire_type: WireType) -> Result<Vec<u8>> {
    let key = field_number
        .checked_mul(8)
        .ok_or(ProtocolError::EncodingLimit(field_number as u64 * 8))?;
    encode_varint(key | wire_type as u32)
}

/// Split a decoded key into field number and wire type
pub fn decode_key(key: u64) -> Result<(u32, WireType)> {
    let wire_type = WireType::try_from((key & 0x07) as u8)?;
    let field_number = u32::try_from(key >> 3)
        .map_err(|_| ProtocolError::InvalidMessage(format!("Field key {} out of range", key)))?;
    Ok((field_number, wire_type))
}

/// Decode a continuation-length prefix
///
/// Returns `(length, prefix_len)` once the terminating byte is present and
/// `None` while only continuation bytes have been seen.
pub fn decode_continuation_length(data: &[u8]) -> Result<Option<(usize, usize)>> {
    let Some(end) = data.iter().position(|&b| b != CONTINUATION) else {
        if data.len() > MAX_CONTINUATION_BYTES {
            return Err(ProtocolError::FrameTooLarge(usize::MAX));
        }
        return Ok(None);
    };

    let prefix = &data[..=end];
    if prefix.len() > MAX_CONTINUATION_BYTES {
        return Err(ProtocolError::FrameTooLarge(usize::MAX));
    }

    let length = prefix
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Ok(Some((length, prefix.len())))
}

/// Encode a continuation-length prefix
///
/// A length of 255 or more would need a multi-byte big-endian value whose
/// first byte may itself be `0xFF`, which the decoder reads as a
/// continuation. Such lengths are rejected.
pub fn encode_continuation_length(length: usize) -> Result<Vec<u8>> {
    if length >= CONTINUATION as usize {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(vec![length as u8])
}

/// Frame a control channel message
pub fn frame_control(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = encode_continuation_length(body.len())?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Frame a pairing channel message
pub fn frame_pairing(body: &[u8]) -> Result<Vec<u8>> {
    let length = u8::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge(body.len()))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(length);
    out.extend_from_slice(body);
    Ok(out)
}

/// Builder for protobuf-style message bodies
///
/// ```
/// use atvremote_protocol::codec::FieldWriter;
///
/// let mut inner = FieldWriter::new();
/// inner.varint_field(1, 19).unwrap().varint_field(2, 1).unwrap();
///
/// let mut outer = FieldWriter::new();
/// outer.message_field(10, inner).unwrap();
/// assert_eq!(outer.into_bytes(), vec![0x52, 0x04, 0x08, 0x13, 0x10, 0x01]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes (fixed headers)
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn varint_field(&mut self, field_number: u32, value: u32) -> Result<&mut Self> {
        self.buf
            .extend(encode_key(field_number, WireType::VarInt)?);
        self.buf.extend(encode_varint(value)?);
        Ok(self)
    }

    pub fn bytes_field(&mut self, field_number: u32, bytes: &[u8]) -> Result<&mut Self> {
        let length = u32::try_from(bytes.len())
            .map_err(|_| ProtocolError::EncodingLimit(bytes.len() as u64))?;
        self.buf
            .extend(encode_key(field_number, WireType::LengthDelimited)?);
        self.buf.extend(encode_varint(length)?);
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    pub fn message_field(&mut self, field_number: u32, message: FieldWriter) -> Result<&mut Self> {
        self.bytes_field(field_number, &message.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A decoded field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// Walks the fields of a complete message body
///
/// Fields are skipped by wire type, so unknown fields never derail parsing.
/// Group wire types are not used by this protocol and are rejected.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read the next field, or `None` at the end of the message
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let key = self.read_varint()?;
        let (field_number, wire_type) = decode_key(key)?;

        let value = match wire_type {
            WireType::VarInt => FieldValue::Varint(self.read_varint()?),
            WireType::SixtyFourBit => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                FieldValue::Fixed64(u64::from_le_bytes(raw))
            }
            WireType::LengthDelimited => {
                let length = self.read_varint()?;
                let length = usize::try_from(length)
                    .map_err(|_| ProtocolError::InvalidMessage("Field length overflow".into()))?;
                FieldValue::Bytes(self.take(length)?)
            }
            WireType::ThirtyTwoBit => {
                let bytes = self.take(4)?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                FieldValue::Fixed32(u32::from_le_bytes(raw))
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "Group wire type in field {}",
                    field_number
                )));
            }
        };

        Ok(Some((field_number, value)))
    }

    fn read_varint(&mut self) -> Result<u64> {
        match decode_varint(&self.data[self.pos..])? {
            Some((value, used)) => {
                self.pos += used;
                Ok(value)
            }
            None => Err(ProtocolError::InvalidMessage(
                "Truncated varint in message".to_string(),
            )),
        }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                ProtocolError::InvalidMessage(format!(
                    "Field needs {} bytes, {} left",
                    count,
                    self.data.len() - self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}
