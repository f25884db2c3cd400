//! Self-describing binary value encoding.
//!
//! Every encoded value starts with a one-byte type marker. Variable length
//! payloads (strings and byte arrays) carry a signed 32-bit little-endian
//! length prefix, so record and field boundaries never depend on padding:
//!
//! ```text
//! +--------+----------------------------+
//! | Marker | Payload                    |
//! | 1 byte | fixed width or i32 + bytes |
//! +--------+----------------------------+
//! ```
//!
//! Decoding is bounds-checked everywhere. A negative length, or a length that
//! runs past the end of the buffer, is reported as [`StorageError::Codec`]
//! instead of panicking or reading garbage.

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Largest string/blob payload the length prefix can describe.
pub const MAX_VALUE_LEN: usize = i32::MAX as usize;

/// Type markers used in the binary encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeMarker {
    Null = 0,
    Int32 = 1,
    Int64 = 2,
    Double = 3,
    Boolean = 4,
    DateTime = 5,
    String = 6,
    Bytes = 7,
    Decimal = 8,
}

impl TypeMarker {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        Ok(match value {
            0 => TypeMarker::Null,
            1 => TypeMarker::Int32,
            2 => TypeMarker::Int64,
            3 => TypeMarker::Double,
            4 => TypeMarker::Boolean,
            5 => TypeMarker::DateTime,
            6 => TypeMarker::String,
            7 => TypeMarker::Bytes,
            8 => TypeMarker::Decimal,
            other => {
                return Err(StorageError::Codec(format!(
                    "unknown type marker {other}"
                )))
            }
        })
    }
}

/// A single encodable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    /// Microseconds since the unix epoch.
    DateTime(i64),
    String(String),
    Bytes(Vec<u8>),
    Decimal { mantissa: i128, scale: u8 },
}

impl Value {
    pub fn marker(&self) -> TypeMarker {
        match self {
            Value::Null => TypeMarker::Null,
            Value::Int32(_) => TypeMarker::Int32,
            Value::Int64(_) => TypeMarker::Int64,
            Value::Double(_) => TypeMarker::Double,
            Value::Boolean(_) => TypeMarker::Boolean,
            Value::DateTime(_) => TypeMarker::DateTime,
            Value::String(_) => TypeMarker::String,
            Value::Bytes(_) => TypeMarker::Bytes,
            Value::Decimal { .. } => TypeMarker::Decimal,
        }
    }
}

/// Append-only encoder over a `Vec<u8>`.
#[derive(Debug, Default)]
pub struct ValueWriter {
    buf: Vec<u8>,
}

impl ValueWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    // Writes into a Vec cannot fail, so the io::Result from byteorder is dropped.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        let _ = self.buf.write_u16::<LittleEndian>(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        let _ = self.buf.write_u32::<LittleEndian>(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        let _ = self.buf.write_u64::<LittleEndian>(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        let _ = self.buf.write_i32::<LittleEndian>(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        let _ = self.buf.write_i64::<LittleEndian>(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Fixed 16-byte identifier.
    pub fn write_id(&mut self, id: &[u8; 16]) {
        self.buf.extend_from_slice(id);
    }

    /// Length-prefixed raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> StorageResult<()> {
        if data.len() > MAX_VALUE_LEN {
            return Err(StorageError::ValueTooLarge {
                size: data.len(),
                max: MAX_VALUE_LEN,
            });
        }
        self.write_i32(data.len() as i32);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> StorageResult<()> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_value(&mut self, value: &Value) -> StorageResult<()> {
        self.write_u8(value.marker() as u8);
        match value {
            Value::Null => {}
            Value::Int32(v) => self.write_i32(*v),
            Value::Int64(v) | Value::DateTime(v) => self.write_i64(*v),
            Value::Double(v) => self.write_u64(v.to_bits()),
            Value::Boolean(v) => self.write_bool(*v),
            Value::String(s) => self.write_str(s)?,
            Value::Bytes(b) => self.write_bytes(b)?,
            Value::Decimal { mantissa, scale } => {
                self.buf.extend_from_slice(&mantissa.to_le_bytes());
                self.write_u8(*scale);
            }
        }
        Ok(())
    }
}

/// Bounds-checked decoder over a borrowed buffer.
#[derive(Debug)]
pub struct ValueReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ValueReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize, what: &str) -> StorageResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(StorageError::Codec(format!(
                "{what} truncated at offset {}: need {len} bytes, have {}",
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn read_u16(&mut self) -> StorageResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2, "u16")?))
    }

    pub fn read_u32(&mut self) -> StorageResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4, "u32")?))
    }

    pub fn read_u64(&mut self) -> StorageResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8, "u64")?))
    }

    pub fn read_i32(&mut self) -> StorageResult<i32> {
        Ok(LittleEndian::read_i32(self.take(4, "i32")?))
    }

    pub fn read_i64(&mut self) -> StorageResult<i64> {
        Ok(LittleEndian::read_i64(self.take(8, "i64")?))
    }

    pub fn read_bool(&mut self) -> StorageResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StorageError::Codec(format!("invalid boolean byte {other}"))),
        }
    }

    /// Fixed 16-byte identifier.
    pub fn read_id(&mut self) -> StorageResult<[u8; 16]> {
        let mut id = [0u8; 16];
        id.copy_from_slice(self.take(16, "id")?);
        Ok(id)
    }

    pub fn read_bytes(&mut self) -> StorageResult<&'a [u8]> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(StorageError::Codec(format!(
                "negative length {len} at offset {}",
                self.offset - 4
            )));
        }
        self.take(len as usize, "bytes")
    }

    pub fn read_string(&mut self) -> StorageResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::Codec(format!("invalid UTF-8 string: {e}")))
    }

    pub fn read_value(&mut self) -> StorageResult<Value> {
        let marker = TypeMarker::from_u8(self.read_u8()?)?;
        Ok(match marker {
            TypeMarker::Null => Value::Null,
            TypeMarker::Int32 => Value::Int32(self.read_i32()?),
            TypeMarker::Int64 => Value::Int64(self.read_i64()?),
            TypeMarker::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            TypeMarker::Boolean => Value::Boolean(self.read_bool()?),
            TypeMarker::DateTime => Value::DateTime(self.read_i64()?),
            TypeMarker::String => Value::String(self.read_string()?),
            TypeMarker::Bytes => Value::Bytes(self.read_bytes()?.to_vec()),
            TypeMarker::Decimal => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(self.take(16, "decimal")?);
                let scale = self.read_u8()?;
                Value::Decimal {
                    mantissa: i128::from_le_bytes(raw),
                    scale,
                }
            }
        })
    }
}
