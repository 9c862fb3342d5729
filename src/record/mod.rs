//! Immutable packed records.
//!
//! A record is an offset table followed by the packed field bytes, so any
//! field is reachable in constant time:
//!
//! ```text
//! +-------+-------+------------------------+--------+--------+-----+
//! | width | count | offsets (count+1)      | field0 | field1 | ... |
//! +-------+-------+------------------------+--------+--------+-----+
//!   1 byte  width   width bytes each, LE     packed values
//! ```
//!
//! `width` is the smallest of 1, 2 or 4 bytes that can address the whole
//! record. Offset `i` is where field `i` starts and offset `count` is where
//! the last one ends.
//!
//! Records order field by field, each field compared as unsigned bytes, with
//! a record that is a prefix of another sorting first. Since packed fields
//! sort like their values, records sort like tuples of values.

pub mod pack;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use itertools::Itertools as _;

pub use pack::{Value, MAX_FIELD, MIN_FIELD};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Record {
    buf: Arc<[u8]>,
}

impl Record {
    /// The record with no fields, below every other record
    pub fn min() -> Record {
        RecordBuilder::new().build()
    }

    /// A record above every record made of packed values
    pub fn max() -> Record {
        RecordBuilder::new().add_max().build()
    }

    pub fn from_values<I, V>(values: I) -> Record
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut builder = RecordBuilder::new();
        for v in values {
            builder.add(v);
        }
        builder.build()
    }

    /// Validates and wraps packed bytes read from storage. Bytes after the
    /// last field are kept as slack.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Record> {
        let rec = Record {
            buf: Arc::from(bytes),
        };
        rec.validate()?;
        Ok(rec)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Error::InvalidData(format!("bad record: {}", msg));
        let width = *self.buf.first().ok_or_else(|| invalid("empty buffer"))? as usize;
        if !matches!(width, 1 | 2 | 4) {
            return Err(invalid("bad offset width"));
        }
        if self.buf.len() < 1 + width {
            return Err(invalid("truncated header"));
        }
        let count = self.read_width(1);
        let header = 1 + width + (count + 1) * width;
        if self.buf.len() < header {
            return Err(invalid("truncated offset table"));
        }
        let mut prev = header;
        for i in 0..=count {
            let off = self.offset(i);
            if off < prev || off > self.buf.len() {
                return Err(invalid("offsets out of range"));
            }
            prev = off;
        }
        if self.offset(0) != header {
            return Err(invalid("first offset does not follow header"));
        }
        Ok(())
    }

    fn width(&self) -> usize {
        self.buf[0] as usize
    }

    fn read_width(&self, at: usize) -> usize {
        match self.width() {
            1 => self.buf[at] as usize,
            2 => u16::from_le_bytes([self.buf[at], self.buf[at + 1]]) as usize,
            _ => u32::from_le_bytes([
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ]) as usize,
        }
    }

    fn offset(&self, i: usize) -> usize {
        let w = self.width();
        self.read_width(1 + w + i * w)
    }

    /// Number of fields
    pub fn size(&self) -> usize {
        self.read_width(1)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Packed bytes of field `i`; empty past the last field.
    pub fn get_raw(&self, i: usize) -> &[u8] {
        if i >= self.size() {
            return MIN_FIELD;
        }
        &self.buf[self.offset(i)..self.offset(i + 1)]
    }

    pub fn get(&self, i: usize) -> Result<Value> {
        Value::unpack(self.get_raw(i))
    }

    pub fn get_int(&self, i: usize) -> Result<i64> {
        match self.get(i)? {
            Value::Int(n) => Ok(n),
            other => Err(Error::InvalidData(format!(
                "field {} is not an integer: {}",
                i, other
            ))),
        }
    }

    pub fn get_string(&self, i: usize) -> Result<String> {
        match self.get(i)? {
            Value::String(s) => Ok(s),
            other => Err(Error::InvalidData(format!(
                "field {} is not a string: {}",
                i, other
            ))),
        }
    }

    pub fn get_bool(&self, i: usize) -> Result<bool> {
        match self.get(i)? {
            Value::Bool(b) => Ok(b),
            // empty fields read as false
            Value::String(s) if s.is_empty() => Ok(false),
            other => Err(Error::InvalidData(format!(
                "field {} is not a boolean: {}",
                i, other
            ))),
        }
    }

    /// Minimal packed length
    pub fn pack_size(&self) -> usize {
        self.offset(self.size())
    }

    /// Length of the underlying buffer, at least `pack_size`
    pub fn buf_size(&self) -> usize {
        self.buf.len()
    }

    /// Packed bytes without slack
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.pack_size()]
    }

    pub fn fields(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.size()).map(move |i| self.get_raw(i))
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.size()).map(|i| self.get(i)).collect()
    }

    /// True if the first fields of `self` equal all the fields of `prefix`.
    pub fn has_prefix(&self, prefix: &Record) -> bool {
        prefix.size() <= self.size()
            && (0..prefix.size()).all(|i| self.get_raw(i) == prefix.get_raw(i))
    }

    /// True if every field is empty
    pub fn all_empty(&self) -> bool {
        self.fields().all(|f| f.is_empty())
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.size().min(other.size());
        for i in 0..n {
            match self.get_raw(i).cmp(other.get_raw(i)) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.size().cmp(&other.size())
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.size().hash(state);
        for f in self.fields() {
            f.hash(state);
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self
            .fields()
            .map(|raw| match raw {
                [0xFF] => "<max>".to_string(),
                _ => Value::unpack(raw)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "<invalid>".to_string()),
            })
            .join(", ");
        write!(f, "[{}]", fields)
    }
}

impl<V: Into<Value>> FromIterator<V> for Record {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Record::from_values(iter)
    }
}

/// Accumulates fields and produces an immutable [`Record`].
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    data: Vec<u8>,
    ends: Vec<usize>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder holding the first `n` fields of `rec`
    pub fn prefix(rec: &Record, n: usize) -> Self {
        let mut builder = Self::new();
        for i in 0..n.min(rec.size()) {
            builder.add_raw(rec.get_raw(i));
        }
        builder
    }

    /// Builder holding the fields of `rec` from `start` on
    pub fn suffix(rec: &Record, start: usize) -> Self {
        let mut builder = Self::new();
        for i in start..rec.size() {
            builder.add_raw(rec.get_raw(i));
        }
        builder
    }

    pub fn add(&mut self, value: impl Into<Value>) -> &mut Self {
        value.into().pack_into(&mut self.data);
        self.ends.push(self.data.len());
        self
    }

    pub fn add_value(&mut self, value: &Value) -> &mut Self {
        value.pack_into(&mut self.data);
        self.ends.push(self.data.len());
        self
    }

    /// Adds an already packed field
    pub fn add_raw(&mut self, raw: &[u8]) -> &mut Self {
        self.data.extend_from_slice(raw);
        self.ends.push(self.data.len());
        self
    }

    pub fn add_min(&mut self) -> &mut Self {
        self.add_raw(MIN_FIELD)
    }

    pub fn add_max(&mut self) -> &mut Self {
        self.add_raw(MAX_FIELD)
    }

    /// Copies field `i` of `rec`
    pub fn add_field(&mut self, rec: &Record, i: usize) -> &mut Self {
        self.add_raw(rec.get_raw(i))
    }

    pub fn add_all(&mut self, rec: &Record) -> &mut Self {
        for f in rec.fields() {
            self.add_raw(f);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    /// Drops trailing empty fields
    pub fn trim(&mut self) -> &mut Self {
        while !self.ends.is_empty() {
            let n = self.ends.len();
            let start = if n > 1 { self.ends[n - 2] } else { 0 };
            if self.ends[n - 1] != start {
                break;
            }
            self.ends.pop();
        }
        self
    }

    pub fn build(&self) -> Record {
        self.build_with_capacity(0)
    }

    /// Builds into a buffer of at least `capacity` bytes.
    pub fn build_with_capacity(&self, capacity: usize) -> Record {
        let count = self.ends.len();
        let width = [1usize, 2, 4]
            .into_iter()
            .find(|&w| {
                let total = 1 + w + (count + 1) * w + self.data.len();
                w == 4 || total < (1usize << (8 * w))
            })
            .unwrap_or(4);
        let header = 1 + width + (count + 1) * width;
        let size = header + self.data.len();
        let mut buf = Vec::with_capacity(size.max(capacity));
        buf.push(width as u8);
        let put = |buf: &mut Vec<u8>, n: usize| match width {
            1 => buf.push(n as u8),
            2 => buf.extend_from_slice(&(n as u16).to_le_bytes()),
            _ => buf.extend_from_slice(&(n as u32).to_le_bytes()),
        };
        put(&mut buf, count);
        put(&mut buf, header);
        for &end in &self.ends {
            put(&mut buf, header + end);
        }
        buf.extend_from_slice(&self.data);
        if capacity > size {
            buf.resize(capacity, 0);
        }
        Record {
            buf: Arc::from(buf),
        }
    }
}
