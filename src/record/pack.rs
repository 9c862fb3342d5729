//! Order-preserving packing of single field values.
//!
//! Every packed value starts with a type tag, so values of different types
//! order by tag and values of one type order by their body bytes. Comparing
//! two packed fields with plain unsigned byte comparison therefore gives the
//! same answer as comparing the typed values.
//!
//! ```text
//! bool    01 00|01
//! int     02 <8 bytes big endian, sign bit flipped>
//! float   03 <8 bytes big endian, negative: all bits flipped, else sign bit set>
//! date    04 <8 bytes like int, milliseconds since the epoch>
//! string  05 <utf-8 bytes>
//! bytes   06 <raw bytes>
//! ```
//!
//! Fields are delimited by the record offset table, so no terminators or
//! escaping are needed. The empty string packs to zero bytes, the same as a
//! missing field, and sorts below every other value. `0xFF` is above every
//! packed value.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Result;

const TYPE_BOOLEAN: u8 = 0x01;
const TYPE_INTEGER: u8 = 0x02;
const TYPE_FLOAT: u8 = 0x03;
const TYPE_DATE: u8 = 0x04;
const TYPE_STRING: u8 = 0x05;
const TYPE_BYTES: u8 = 0x06;

/// Packed form of the largest possible field
pub const MAX_FIELD: &[u8] = &[0xFF];
/// Packed form of the smallest possible field
pub const MIN_FIELD: &[u8] = &[];

const SIGN: u64 = 1u64 << 63;

#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Milliseconds since the Unix epoch
    Date(i64),
    String(String),
    Bytes(Vec<u8>),
}

/// Error type for packing operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    UnknownType(u8),
    TruncatedData,
    InvalidUtf8,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid packed format: {}", msg),
            EncodingError::UnknownType(tag) => write!(f, "Unknown packed type 0x{:02x}", tag),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::InvalidUtf8 => write!(f, "Invalid UTF-8 sequence"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::InvalidData(err.to_string())
    }
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::String(s) if s.is_empty() => 0,
            Value::Bool(_) => TYPE_BOOLEAN,
            Value::Int(_) => TYPE_INTEGER,
            Value::Float(_) => TYPE_FLOAT,
            Value::Date(_) => TYPE_DATE,
            Value::String(_) => TYPE_STRING,
            Value::Bytes(_) => TYPE_BYTES,
        }
    }

    /// Number of bytes `pack` will produce
    pub fn pack_size(&self) -> usize {
        if self.rank() == 0 {
            return 0;
        }
        1 + match self {
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::Date(_) => 8,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pack_size());
        self.pack_into(&mut buf);
        buf
    }

    pub fn pack_into(&self, buf: &mut Vec<u8>) {
        if self.rank() == 0 {
            return;
        }
        buf.push(self.rank());
        match self {
            Value::Bool(b) => buf.push(u8::from(*b)),
            Value::Int(i) | Value::Date(i) => buf.extend_from_slice(&encode_i64(*i)),
            Value::Float(f) => buf.extend_from_slice(&encode_f64(*f)),
            Value::String(s) => buf.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => buf.extend_from_slice(b),
        }
    }

    /// Unpacks one field. The empty field unpacks as the empty string.
    pub fn unpack(bytes: &[u8]) -> Result<Value> {
        let Some((&tag, body)) = bytes.split_first() else {
            return Ok(Value::String(String::new()));
        };
        let value = match tag {
            TYPE_BOOLEAN => match body {
                [0] => Value::Bool(false),
                [1] => Value::Bool(true),
                _ => {
                    return Err(EncodingError::InvalidFormat("invalid boolean".to_string()).into())
                }
            },
            TYPE_INTEGER => Value::Int(decode_i64(body)?),
            TYPE_DATE => Value::Date(decode_i64(body)?),
            TYPE_FLOAT => Value::Float(decode_f64(body)?),
            TYPE_STRING => Value::String(
                String::from_utf8(body.to_vec()).map_err(|_| EncodingError::InvalidUtf8)?,
            ),
            TYPE_BYTES => Value::Bytes(body.to_vec()),
            other => return Err(EncodingError::UnknownType(other).into()),
        };
        Ok(value)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn encode_i64(i: i64) -> [u8; 8] {
    ((i as u64) ^ SIGN).to_be_bytes()
}

fn decode_i64(body: &[u8]) -> Result<i64> {
    let buf: [u8; 8] = body
        .try_into()
        .map_err(|_| EncodingError::InvalidFormat("integer must be 8 bytes".to_string()))?;
    Ok((u64::from_be_bytes(buf) ^ SIGN) as i64)
}

fn encode_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let ordered = if bits & SIGN != 0 { !bits } else { bits | SIGN };
    ordered.to_be_bytes()
}

fn decode_f64(body: &[u8]) -> Result<f64> {
    let buf: [u8; 8] = body
        .try_into()
        .map_err(|_| EncodingError::InvalidFormat("float must be 8 bytes".to_string()))?;
    let ordered = u64::from_be_bytes(buf);
    let bits = if ordered & SIGN != 0 {
        ordered & !SIGN
    } else {
        !ordered
    };
    Ok(f64::from_bits(bits))
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Date(ms) => write!(f, "#{}", ms),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            any::<i64>().prop_map(Value::Date),
            ".{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..12).prop_map(Value::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(v in any_value()) {
            let packed = v.pack();
            prop_assert_eq!(packed.len(), v.pack_size());
            let back = Value::unpack(&packed).unwrap();
            prop_assert_eq!(back, v);
        }

        #[test]
        fn prop_byte_order_matches_typed_order(a in any_value(), b in any_value()) {
            prop_assert_eq!(a.pack().cmp(&b.pack()), a.cmp(&b));
        }

        #[test]
        fn prop_sentinels_bound_everything(v in any_value()) {
            let packed = v.pack();
            prop_assert!(MIN_FIELD <= packed.as_slice());
            prop_assert!(packed.as_slice() < MAX_FIELD);
        }
    }

    #[test]
    fn test_integer_ordering() {
        let values = [i64::MIN, -1000, -1, 0, 1, 42, i64::MAX];
        for pair in values.windows(2) {
            assert!(Value::Int(pair[0]).pack() < Value::Int(pair[1]).pack());
        }
    }

    #[test]
    fn test_float_ordering() {
        let values = [f64::NEG_INFINITY, -1.5, -0.0, 0.0, 1e-10, 2.5, f64::INFINITY];
        for pair in values.windows(2) {
            assert!(
                Value::Float(pair[0]).pack() < Value::Float(pair[1]).pack(),
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_string_prefix_ordering() {
        assert!(Value::from("ab").pack() < Value::from("abc").pack());
        assert!(Value::from("").pack() < Value::from("a").pack());
        assert!(Value::from("a\0").pack() > Value::from("a").pack());
    }

    #[test]
    fn test_cross_type_ordering() {
        assert!(Value::Bool(true).pack() < Value::Int(i64::MIN).pack());
        assert!(Value::Int(i64::MAX).pack() < Value::Float(f64::NEG_INFINITY).pack());
        assert!(Value::from("").pack() < Value::Bool(false).pack());
        assert!(Value::Date(i64::MAX).pack() < Value::from("a").pack());
        assert!(Value::from("zzz").pack() < Value::Bytes(vec![]).pack());
    }

    #[test]
    fn test_empty_field_unpacks_as_empty_string() -> Result<()> {
        assert_eq!(Value::unpack(&[])?, Value::from(""));
        assert!(Value::from("").pack().is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_data() {
        assert!(Value::unpack(&[TYPE_INTEGER, 1, 2]).is_err());
        assert!(Value::unpack(&[TYPE_BOOLEAN, 7]).is_err());
        assert!(Value::unpack(&[TYPE_STRING, 0xFF, 0xFE]).is_err());
        assert!(Value::unpack(&[0x42]).is_err());
    }
}
