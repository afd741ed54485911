//! Types module: domains, dynamically-typed values and the objects they can point at.
//!
//! `Value` is the tagged cell every layer passes around: the compiler stores constants in it, the
//! VM computes with it and the storage layer reads and writes it. `Domain` is the fine-grained
//! type tag, including record references into a specific table.

use crate::functions::ProcHandle;
use crate::schema::Column;
use crate::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type TableId = u32;
pub type RecordId = u32;

/// Table ids start here; lower codes are reserved for builtin domains.
pub const FIRST_TABLE_ID: TableId = 256;
pub const USEC_PER_SEC: i64 = 1_000_000;

/// Packs seconds and microseconds into a `Time` payload.
pub fn time_pack(sec: i64, usec: i64) -> i64 {
    sec.wrapping_mul(USEC_PER_SEC).wrapping_add(usec)
}

pub fn time_unpack(time: i64) -> (i64, i64) {
    (time / USEC_PER_SEC, time % USEC_PER_SEC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Domain {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    /// Microseconds since the epoch
    Time,
    ShortText,
    Text,
    LongText,
    /// Reference to a record of the given table
    Record(TableId),
}

impl Domain {
    /// Stable numeric code used by the serialized image.
    pub fn code(self) -> u32 {
        match self {
            Domain::Void => 0,
            Domain::Bool => 2,
            Domain::Int8 => 3,
            Domain::UInt8 => 4,
            Domain::Int16 => 5,
            Domain::UInt16 => 6,
            Domain::Int32 => 7,
            Domain::UInt32 => 8,
            Domain::Int64 => 9,
            Domain::UInt64 => 10,
            Domain::Float => 11,
            Domain::Time => 12,
            Domain::ShortText => 13,
            Domain::Text => 14,
            Domain::LongText => 15,
            Domain::Record(table) => table,
        }
    }

    pub fn from_code(code: u32) -> Option<Domain> {
        let domain = match code {
            0 => Domain::Void,
            2 => Domain::Bool,
            3 => Domain::Int8,
            4 => Domain::UInt8,
            5 => Domain::Int16,
            6 => Domain::UInt16,
            7 => Domain::Int32,
            8 => Domain::UInt32,
            9 => Domain::Int64,
            10 => Domain::UInt64,
            11 => Domain::Float,
            12 => Domain::Time,
            13 => Domain::ShortText,
            14 => Domain::Text,
            15 => Domain::LongText,
            table if table >= FIRST_TABLE_ID => Domain::Record(table),
            _ => return None,
        };
        Some(domain)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Domain::Int8
                | Domain::UInt8
                | Domain::Int16
                | Domain::UInt16
                | Domain::Int32
                | Domain::UInt32
                | Domain::Int64
                | Domain::UInt64
        )
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self == Domain::Float
    }

    pub fn is_text(self) -> bool {
        matches!(self, Domain::ShortText | Domain::Text | Domain::LongText)
    }

    /// Scalar domains can be the target of a compile-time constant cast.
    pub fn is_scalar(self) -> bool {
        self.is_numeric() || self.is_text() || matches!(self, Domain::Bool | Domain::Time)
    }

    pub fn table(self) -> Option<TableId> {
        match self {
            Domain::Record(table) => Some(table),
            _ => None,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Record(table) => write!(f, "Record({})", table),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Coarse shape of a value, tracked by the data-flow tracker and the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Void,
    Bulk,
    Vector,
    Object,
    Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedColumn {
    pub column: Arc<Column>,
    pub weight: i32,
}

impl WeightedColumn {
    pub fn new(column: Arc<Column>, weight: i32) -> Self {
        Self { column, weight }
    }
}

/// Externally owned objects an expression can reference.
#[derive(Debug, Clone)]
pub enum Object {
    Column(Arc<Column>),
    Procedure(ProcHandle),
    Table(TableId),
    /// Several columns searched together by MATCH, each with a score weight
    MatchColumns(Arc<[WeightedColumn]>),
}

impl Object {
    pub fn name(&self) -> String {
        match self {
            Object::Column(column) => column.name.clone(),
            Object::Procedure(proc) => proc.name().to_string(),
            Object::Table(table) => format!("table:{}", table),
            Object::MatchColumns(columns) => columns
                .iter()
                .map(|c| format!("{}*{}", c.column.name, c.weight))
                .collect::<Vec<_>>()
                .join("||"),
        }
    }

    pub fn as_column(&self) -> Option<&Arc<Column>> {
        match self {
            Object::Column(column) => Some(column),
            _ => None,
        }
    }

    pub fn as_procedure(&self) -> Option<&ProcHandle> {
        match self {
            Object::Procedure(proc) => Some(proc),
            _ => None,
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Column(a), Object::Column(b)) => Arc::ptr_eq(a, b) || a == b,
            (Object::Procedure(a), Object::Procedure(b)) => a.id() == b.id() && a.name() == b.name(),
            (Object::Table(a), Object::Table(b)) => a == b,
            (Object::MatchColumns(a), Object::MatchColumns(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Value {
    #[default]
    Void,
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f64),
    Time(i64),
    ShortText(Vec<u8>),
    Text(Vec<u8>),
    LongText(Vec<u8>),
    Record { table: TableId, id: RecordId },
    Vector { domain: Domain, items: Vec<Value> },
    #[serde(skip)]
    Object(Object),
    /// Resolved (column, record) pair; the only form mutation operators accept
    #[serde(skip)]
    Ref { column: Arc<Column>, record: RecordId },
}

pub(crate) fn corrupt_image() -> QuarryError {
    QuarryError::InvalidFormat("expression image is corrupt".to_string())
}

/// Lenient integer prefix parse: optional sign, then digits up to the first non-digit.
pub fn atoi(bytes: &[u8]) -> i64 {
    let mut iter = bytes.iter().peekable();
    let negative = match iter.peek() {
        Some(b'-') => {
            iter.next();
            true
        }
        Some(b'+') => {
            iter.next();
            false
        }
        _ => false,
    };
    let mut value: i64 = 0;
    for &b in iter {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add((b - b'0') as i64);
    }
    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}

pub(crate) fn parse_int(bytes: &[u8]) -> Option<i128> {
    std::str::from_utf8(bytes).ok()?.trim().parse::<i128>().ok()
}

pub(crate) fn parse_float(bytes: &[u8]) -> Option<f64> {
    std::str::from_utf8(bytes).ok()?.trim().parse::<f64>().ok()
}

fn fits(domain: Domain, v: i128) -> bool {
    let (min, max): (i128, i128) = match domain {
        Domain::Int8 => (i8::MIN as i128, i8::MAX as i128),
        Domain::UInt8 => (0, u8::MAX as i128),
        Domain::Int16 => (i16::MIN as i128, i16::MAX as i128),
        Domain::UInt16 => (0, u16::MAX as i128),
        Domain::Int32 => (i32::MIN as i128, i32::MAX as i128),
        Domain::UInt32 => (0, u32::MAX as i128),
        Domain::Int64 => (i64::MIN as i128, i64::MAX as i128),
        Domain::UInt64 => (0, u64::MAX as i128),
        _ => return true,
    };
    v >= min && v <= max
}

fn text_of(domain: Domain, bytes: Vec<u8>) -> Value {
    match domain {
        Domain::ShortText => Value::ShortText(bytes),
        Domain::LongText => Value::LongText(bytes),
        _ => Value::Text(bytes),
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| corrupt_image())
}

impl Value {
    pub fn text(s: impl AsRef<[u8]>) -> Self {
        Value::Text(s.as_ref().to_vec())
    }

    pub fn short_text(s: impl AsRef<[u8]>) -> Self {
        Value::ShortText(s.as_ref().to_vec())
    }

    pub fn long_text(s: impl AsRef<[u8]>) -> Self {
        Value::LongText(s.as_ref().to_vec())
    }

    pub fn record(table: TableId, id: RecordId) -> Self {
        Value::Record { table, id }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Value::Void | Value::Object(_) | Value::Ref { .. } => Domain::Void,
            Value::Bool(_) => Domain::Bool,
            Value::Int8(_) => Domain::Int8,
            Value::UInt8(_) => Domain::UInt8,
            Value::Int16(_) => Domain::Int16,
            Value::UInt16(_) => Domain::UInt16,
            Value::Int32(_) => Domain::Int32,
            Value::UInt32(_) => Domain::UInt32,
            Value::Int64(_) => Domain::Int64,
            Value::UInt64(_) => Domain::UInt64,
            Value::Float(_) => Domain::Float,
            Value::Time(_) => Domain::Time,
            Value::ShortText(_) => Domain::ShortText,
            Value::Text(_) => Domain::Text,
            Value::LongText(_) => Domain::LongText,
            Value::Record { table, .. } => Domain::Record(*table),
            Value::Vector { domain, .. } => *domain,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Void => ValueKind::Void,
            Value::Vector { .. } => ValueKind::Vector,
            Value::Object(_) | Value::Ref { .. } => ValueKind::Object,
            Value::Record { .. } => ValueKind::Record,
            _ => ValueKind::Bulk,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Value::ShortText(_) | Value::Text(_) | Value::LongText(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Integer payload of bool, integer and time values (time stays in microseconds).
    pub(crate) fn int_value(&self) -> Option<i128> {
        match self {
            Value::Bool(b) => Some(*b as i128),
            Value::Int8(v) => Some(*v as i128),
            Value::UInt8(v) => Some(*v as i128),
            Value::Int16(v) => Some(*v as i128),
            Value::UInt16(v) => Some(*v as i128),
            Value::Int32(v) => Some(*v as i128),
            Value::UInt32(v) => Some(*v as i128),
            Value::Int64(v) => Some(*v as i128),
            Value::UInt64(v) => Some(*v as i128),
            Value::Time(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Float(f) => Some(*f as i64),
            other => other.int_value().map(|v| v as i64),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.int_value().map(|v| v as f64),
        }
    }

    /// Builds a value of an integer-like domain, wrapping to its width.
    pub(crate) fn from_int(domain: Domain, v: i128) -> Option<Value> {
        let value = match domain {
            Domain::Bool => Value::Bool(v != 0),
            Domain::Int8 => Value::Int8(v as i8),
            Domain::UInt8 => Value::UInt8(v as u8),
            Domain::Int16 => Value::Int16(v as i16),
            Domain::UInt16 => Value::UInt16(v as u16),
            Domain::Int32 => Value::Int32(v as i32),
            Domain::UInt32 => Value::UInt32(v as u32),
            Domain::Int64 => Value::Int64(v as i64),
            Domain::UInt64 => Value::UInt64(v as u64),
            Domain::Time => Value::Time(v as i64),
            Domain::Float => Value::Float(v as f64),
            _ => return None,
        };
        Some(value)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Void => false,
            Value::Float(f) => *f != 0.0,
            Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => !b.is_empty(),
            Value::Record { id, .. } => *id != 0,
            Value::Vector { items, .. } => !items.is_empty(),
            Value::Object(_) | Value::Ref { .. } => true,
            other => other.int_value().map(|v| v != 0).unwrap_or(false),
        }
    }

    /// Score contributed by a predicate result: integer payloads count as-is, anything else 0 or 1.
    pub fn as_score(&self) -> i64 {
        match self.int_value() {
            Some(v) => v as i64,
            None => self.is_truthy() as i64,
        }
    }

    pub fn default_for(domain: Domain) -> Value {
        match domain {
            Domain::Void => Value::Void,
            Domain::Float => Value::Float(0.0),
            Domain::ShortText | Domain::Text | Domain::LongText => text_of(domain, Vec::new()),
            Domain::Record(table) => Value::Record { table, id: 0 },
            other => Value::from_int(other, 0).unwrap_or(Value::Void),
        }
    }

    /// Converts to another domain using the fixed conversion table.
    pub fn cast(&self, to: Domain) -> Result<Value> {
        let unsupported =
            || QuarryError::NotImplemented(format!("can't cast {} to {}", self.domain(), to));
        if self.domain() == to && !matches!(self, Value::Object(_) | Value::Ref { .. }) {
            return Ok(self.clone());
        }
        match self {
            Value::Void => Ok(Value::default_for(to)),
            Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => cast_text(b, to),
            Value::Record { id, .. } => match to {
                Domain::Record(table) => Ok(Value::Record { table, id: *id }),
                d if d.is_text() => Ok(text_of(d, id.to_string().into_bytes())),
                d => Value::from_int(d, *id as i128).ok_or_else(unsupported),
            },
            Value::Float(f) => match to {
                Domain::Time => Ok(Value::Time((*f * USEC_PER_SEC as f64) as i64)),
                Domain::Record(table) => Ok(Value::Record { table, id: *f as u32 }),
                d if d.is_text() => Ok(text_of(d, f.to_string().into_bytes())),
                d => Value::from_int(d, *f as i128).ok_or_else(unsupported),
            },
            Value::Time(t) => match to {
                Domain::Float => Ok(Value::Float(*t as f64 / USEC_PER_SEC as f64)),
                d if d.is_text() => Ok(text_of(d, t.to_string().into_bytes())),
                d if d.is_integer() || d == Domain::Bool => {
                    Value::from_int(d, time_unpack(*t).0 as i128).ok_or_else(unsupported)
                }
                _ => Err(unsupported()),
            },
            Value::Vector { .. } | Value::Object(_) | Value::Ref { .. } => Err(unsupported()),
            scalar => {
                let v = scalar.int_value().ok_or_else(unsupported)?;
                match to {
                    Domain::Time => Ok(Value::Time(time_pack(v as i64, 0))),
                    Domain::Record(table) => Ok(Value::Record { table, id: v as u32 }),
                    d if d.is_text() => Ok(text_of(d, v.to_string().into_bytes())),
                    d => Value::from_int(d, v).ok_or_else(unsupported),
                }
            }
        }
    }

    /// Fixed little-endian payload of a scalar value, `None` for vectors and objects.
    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            Value::Void => Vec::new(),
            Value::Bool(b) => vec![*b as u8],
            Value::Int8(v) => v.to_le_bytes().to_vec(),
            Value::UInt8(v) => v.to_le_bytes().to_vec(),
            Value::Int16(v) => v.to_le_bytes().to_vec(),
            Value::UInt16(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::UInt32(v) => v.to_le_bytes().to_vec(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::UInt64(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::Time(v) => v.to_le_bytes().to_vec(),
            Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => b.clone(),
            Value::Record { id, .. } => id.to_le_bytes().to_vec(),
            Value::Vector { .. } | Value::Object(_) | Value::Ref { .. } => return None,
        };
        Some(bytes)
    }

    pub fn from_payload(domain: Domain, bytes: &[u8]) -> Result<Value> {
        let value = match domain {
            Domain::Void => Value::Void,
            Domain::Bool => Value::Bool(fixed::<1>(bytes)?[0] != 0),
            Domain::Int8 => Value::Int8(i8::from_le_bytes(fixed(bytes)?)),
            Domain::UInt8 => Value::UInt8(u8::from_le_bytes(fixed(bytes)?)),
            Domain::Int16 => Value::Int16(i16::from_le_bytes(fixed(bytes)?)),
            Domain::UInt16 => Value::UInt16(u16::from_le_bytes(fixed(bytes)?)),
            Domain::Int32 => Value::Int32(i32::from_le_bytes(fixed(bytes)?)),
            Domain::UInt32 => Value::UInt32(u32::from_le_bytes(fixed(bytes)?)),
            Domain::Int64 => Value::Int64(i64::from_le_bytes(fixed(bytes)?)),
            Domain::UInt64 => Value::UInt64(u64::from_le_bytes(fixed(bytes)?)),
            Domain::Float => Value::Float(f64::from_le_bytes(fixed(bytes)?)),
            Domain::Time => Value::Time(i64::from_le_bytes(fixed(bytes)?)),
            Domain::ShortText | Domain::Text | Domain::LongText => text_of(domain, bytes.to_vec()),
            Domain::Record(table) => Value::Record { table, id: u32::from_le_bytes(fixed(bytes)?) },
        };
        Ok(value)
    }

    /// Order-preserving encoding used as an index key. Integers of any width share one encoding.
    pub fn key_bytes(&self) -> Vec<u8> {
        match self {
            Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => b.clone(),
            Value::Float(f) => {
                let bits = f.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                ordered.to_be_bytes().to_vec()
            }
            Value::Record { id, .. } => id.to_be_bytes().to_vec(),
            other => match other.int_value() {
                Some(v) => ((v as u128) ^ (1u128 << 127)).to_be_bytes().to_vec(),
                None => Vec::new(),
            },
        }
    }
}

fn cast_text(bytes: &[u8], to: Domain) -> Result<Value> {
    let invalid = || {
        QuarryError::InvalidArgument(format!(
            "not a numerical format: <{}>",
            String::from_utf8_lossy(bytes)
        ))
    };
    match to {
        d if d.is_text() => Ok(text_of(d, bytes.to_vec())),
        Domain::Void => Ok(Value::Void),
        Domain::Bool => match bytes {
            b"true" => Ok(Value::Bool(true)),
            b"false" | b"" => Ok(Value::Bool(false)),
            other => parse_int(other).map(|v| Value::Bool(v != 0)).ok_or_else(invalid),
        },
        Domain::Float => parse_float(bytes).map(Value::Float).ok_or_else(invalid),
        Domain::Time => {
            if let Some(v) = parse_int(bytes) {
                Ok(Value::Time(time_pack(v as i64, 0)))
            } else {
                parse_float(bytes)
                    .map(|f| Value::Time((f * USEC_PER_SEC as f64) as i64))
                    .ok_or_else(invalid)
            }
        }
        d if d.is_integer() => {
            let v = parse_int(bytes).ok_or_else(invalid)?;
            if !fits(d, v) {
                return Err(QuarryError::InvalidArgument(format!(
                    "<{}> is out of range for {}",
                    String::from_utf8_lossy(bytes),
                    d
                )));
            }
            Value::from_int(d, v).ok_or_else(invalid)
        }
        d => Err(QuarryError::NotImplemented(format!("can't cast text to {}", d))),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "time({})", v),
            Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => {
                write!(f, "\"{}\"", String::from_utf8_lossy(b))
            }
            Value::Record { table, id } => write!(f, "#{}:{}", table, id),
            Value::Vector { items, .. } => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(obj) => write!(f, "{}", obj.name()),
            Value::Ref { column, record } => write!(f, "&{}#{}", column.name, record),
            other => match other.int_value() {
                Some(v) => write!(f, "{}", v),
                None => Ok(()),
            },
        }
    }
}
