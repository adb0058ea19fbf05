//! Tagged scalar values.
//!
//! `Value` is the closed variant used for record field payloads, bound query
//! parameters and predicate-index keys. It carries a total ordering and a
//! hash that stay consistent across integer widths, plus a compact byte
//! codec used by container serialization and update payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Column data types understood by the record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Bool = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    UInt8 = 6,
    UInt16 = 7,
    UInt32 = 8,
    UInt64 = 9,
    Float32 = 10,
    Float64 = 11,
    Str = 12,
    Blob = 13,
}

impl DataType {
    /// Fixed byte width of this type inside an array-store record.
    ///
    /// Variable-length types occupy 4 bytes: the id of a var-store record.
    pub fn fixed_width(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::Str | DataType::Blob => 4,
        }
    }

    /// Whether the type belongs to the integer family.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    /// Whether a predicate on this type can back a table index.
    pub fn is_indexable(self) -> bool {
        self.is_integer() || self == DataType::Str
    }

    /// Whether values of this type live in the var store.
    pub fn is_var(self) -> bool {
        matches!(self, DataType::Str | DataType::Blob)
    }
}

/// A tagged scalar value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Blob(Bytes),
}

/// Comparison rank of a value class. Values of different classes order by
/// rank; Null sorts first.
fn class_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::I8(_)
        | Value::I16(_)
        | Value::I32(_)
        | Value::I64(_)
        | Value::U8(_)
        | Value::U16(_)
        | Value::U32(_)
        | Value::U64(_) => 2,
        Value::F32(_) | Value::F64(_) => 3,
        Value::Str(_) => 4,
        Value::Blob(_) => 5,
    }
}

impl Value {
    /// Whether this is the SQL null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Widened integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i128> {
        match *self {
            Value::I8(v) => Some(v as i128),
            Value::I16(v) => Some(v as i128),
            Value::I32(v) => Some(v as i128),
            Value::I64(v) => Some(v as i128),
            Value::U8(v) => Some(v as i128),
            Value::U16(v) => Some(v as i128),
            Value::U32(v) => Some(v as i128),
            Value::U64(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Integer value narrowed to i64, if this is an integer that fits.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_int().and_then(|v| i64::try_from(v).ok())
    }

    /// Float value, widening f32.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    /// String slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Blob bytes, if this is a blob.
    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Encode into a buffer: tag byte followed by the payload.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(0),
            Value::Bool(v) => {
                buf.put_u8(1);
                buf.put_u8(*v as u8);
            }
            Value::I8(v) => {
                buf.put_u8(2);
                buf.put_i8(*v);
            }
            Value::I16(v) => {
                buf.put_u8(3);
                buf.put_i16(*v);
            }
            Value::I32(v) => {
                buf.put_u8(4);
                buf.put_i32(*v);
            }
            Value::I64(v) => {
                buf.put_u8(5);
                buf.put_i64(*v);
            }
            Value::U8(v) => {
                buf.put_u8(6);
                buf.put_u8(*v);
            }
            Value::U16(v) => {
                buf.put_u8(7);
                buf.put_u16(*v);
            }
            Value::U32(v) => {
                buf.put_u8(8);
                buf.put_u32(*v);
            }
            Value::U64(v) => {
                buf.put_u8(9);
                buf.put_u64(*v);
            }
            Value::F32(v) => {
                buf.put_u8(10);
                buf.put_f32(*v);
            }
            Value::F64(v) => {
                buf.put_u8(11);
                buf.put_f64(*v);
            }
            Value::Str(s) => {
                buf.put_u8(12);
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buf.put_u8(13);
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }

    /// Decode a value, advancing the slice.
    pub fn decode(data: &mut &[u8]) -> Result<Value> {
        if data.is_empty() {
            return Err(Error::corruption("truncated value"));
        }
        let tag = data.get_u8();
        let need = |data: &&[u8], n: usize| -> Result<()> {
            if data.len() < n {
                Err(Error::corruption("truncated value payload"))
            } else {
                Ok(())
            }
        };
        let value = match tag {
            0 => Value::Null,
            1 => {
                need(data, 1)?;
                Value::Bool(data.get_u8() != 0)
            }
            2 => {
                need(data, 1)?;
                Value::I8(data.get_i8())
            }
            3 => {
                need(data, 2)?;
                Value::I16(data.get_i16())
            }
            4 => {
                need(data, 4)?;
                Value::I32(data.get_i32())
            }
            5 => {
                need(data, 8)?;
                Value::I64(data.get_i64())
            }
            6 => {
                need(data, 1)?;
                Value::U8(data.get_u8())
            }
            7 => {
                need(data, 2)?;
                Value::U16(data.get_u16())
            }
            8 => {
                need(data, 4)?;
                Value::U32(data.get_u32())
            }
            9 => {
                need(data, 8)?;
                Value::U64(data.get_u64())
            }
            10 => {
                need(data, 4)?;
                Value::F32(data.get_f32())
            }
            11 => {
                need(data, 8)?;
                Value::F64(data.get_f64())
            }
            12 => {
                need(data, 4)?;
                let len = data.get_u32() as usize;
                need(data, len)?;
                let s = std::str::from_utf8(&data[..len])
                    .map_err(|_| Error::corruption("value string is not utf-8"))?
                    .to_string();
                data.advance(len);
                Value::Str(s)
            }
            13 => {
                need(data, 4)?;
                let len = data.get_u32() as usize;
                need(data, len)?;
                let b = Bytes::copy_from_slice(&data[..len]);
                data.advance(len);
                Value::Blob(b)
            }
            _ => return Err(Error::corruption(format!("unknown value tag {}", tag))),
        };
        Ok(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ra, rb) = (class_rank(self), class_rank(other));
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => {
                if let (Some(a), Some(b)) = (self.as_int(), other.as_int()) {
                    a.cmp(&b)
                } else if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
                    a.total_cmp(&b)
                } else {
                    Ordering::Equal
                }
            }
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        class_rank(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Str(s) => s.hash(state),
            Value::Blob(b) => b.hash(state),
            Value::F32(v) => (*v as f64).to_bits().hash(state),
            Value::F64(v) => v.to_bits().hash(state),
            _ => {
                // Integers of different widths hash alike so that
                // I32(1) and I64(1) land in the same bucket.
                self.as_int().hash(state);
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_cross_width_integer_equality() {
        assert_eq!(Value::I32(42), Value::I64(42));
        assert_eq!(Value::U8(7), Value::I64(7));
        assert_ne!(Value::I32(42), Value::I64(43));
        assert_eq!(hash_of(&Value::I32(42)), hash_of(&Value::U64(42)));
    }

    #[test]
    fn test_ordering() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::I64(-1) < Value::I64(0));
        assert!(Value::I64(i64::MAX) < Value::F64(0.0)); // class rank, not magnitude
        assert!(Value::Str("abc".into()) < Value::Str("abd".into()));
        assert!(Value::F32(1.5) < Value::F64(2.0));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::I8(-5),
            Value::I16(-300),
            Value::I32(123_456),
            Value::I64(-9_876_543_210),
            Value::U8(200),
            Value::U16(60_000),
            Value::U32(4_000_000_000),
            Value::U64(u64::MAX),
            Value::F32(1.25),
            Value::F64(-2.5),
            Value::Str("alpha".into()),
            Value::Blob(Bytes::from_static(b"\x00\x01\x02")),
        ];

        let mut buf = BytesMut::new();
        for v in &values {
            v.encode_to(&mut buf);
        }

        let mut slice: &[u8] = &buf;
        for v in &values {
            let decoded = Value::decode(&mut slice).unwrap();
            assert_eq!(*v, decoded);
        }
        assert!(slice.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = BytesMut::new();
        Value::Str("hello".into()).encode_to(&mut buf);
        let mut slice = &buf[..buf.len() - 2];
        assert!(Value::decode(&mut slice).is_err());
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(DataType::Bool.fixed_width(), 1);
        assert_eq!(DataType::Int64.fixed_width(), 8);
        assert_eq!(DataType::Str.fixed_width(), 4);
        assert!(DataType::Int32.is_indexable());
        assert!(DataType::Str.is_indexable());
        assert!(!DataType::Float64.is_indexable());
        assert!(DataType::Blob.is_var());
    }
}
