//! Arithmetic, comparison and equality over dynamically-typed values.
//!
//! Binary arithmetic is keyed on the left operand's width: small integers widen to 32 bits, and
//! the result keeps the left width except when a float is involved. Integer math runs in `i128`
//! and wraps to the result width.

use crate::ir::Operator;
use crate::types::{atoi, Domain, Value, USEC_PER_SEC};
use crate::{QuarryError, Result};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    I32,
    U32,
    I64,
    U64,
    Time,
    Float,
    Text,
}

impl Width {
    fn of(value: &Value) -> Option<Width> {
        let width = match value {
            Value::Bool(_) | Value::Int8(_) | Value::Int16(_) | Value::Int32(_) => Width::I32,
            Value::UInt8(_) | Value::UInt16(_) | Value::UInt32(_) => Width::U32,
            Value::Int64(_) => Width::I64,
            Value::UInt64(_) => Width::U64,
            Value::Time(_) => Width::Time,
            Value::Float(_) => Width::Float,
            Value::ShortText(_) | Value::Text(_) | Value::LongText(_) => Width::Text,
            _ => return None,
        };
        Some(width)
    }

    fn domain(self) -> Domain {
        match self {
            Width::I32 => Domain::Int32,
            Width::U32 => Domain::UInt32,
            Width::I64 => Domain::Int64,
            Width::U64 => Domain::UInt64,
            Width::Time => Domain::Time,
            Width::Float => Domain::Float,
            Width::Text => Domain::Text,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Width::I32 | Width::U32 => 32,
            _ => 64,
        }
    }

    fn signed(self) -> bool {
        matches!(self, Width::I32 | Width::I64 | Width::Time)
    }
}

fn invalid_type(op: Operator, value: &Value) -> QuarryError {
    QuarryError::InvalidArgument(format!("invalid type for {}: {}", op, value.domain()))
}

fn not_numerical(text: &[u8]) -> QuarryError {
    QuarryError::ArithmeticError(format!(
        "not a numerical format: <{}>",
        String::from_utf8_lossy(text)
    ))
}

fn zero_division() -> QuarryError {
    QuarryError::ArithmeticError("dividend should not be 0".to_string())
}

/// Strict numeric view of a text operand in the given domain.
fn numeric_text(value: &Value, domain: Domain) -> Result<Value> {
    match value.as_bytes() {
        Some(text) => value.cast(domain).map_err(|_| not_numerical(text)),
        None => Ok(value.clone()),
    }
}

pub fn binary(op: Operator, x: &Value, y: &Value) -> Result<Value> {
    let width = Width::of(x).ok_or_else(|| invalid_type(op, x))?;
    if width == Width::Text {
        return text_binary(op, x, y);
    }
    let y = numeric_text(y, width.domain())?;
    if Width::of(&y).is_none() {
        return Err(invalid_type(op, &y));
    }
    if width == Width::Float || matches!(y, Value::Float(_)) {
        let (Some(a), Some(b)) = (x.as_f64(), y.as_f64()) else {
            return Err(invalid_type(op, &y));
        };
        return float_binary(op, a, b).map(Value::Float);
    }
    let (Some(a), Some(b)) = (x.int_value(), y.int_value()) else {
        return Err(invalid_type(op, &y));
    };
    let r = integer_binary(op, width, a, b)?;
    Value::from_int(width.domain(), r).ok_or_else(|| invalid_type(op, x))
}

fn integer_binary(op: Operator, width: Width, a: i128, b: i128) -> Result<i128> {
    let bits = width.bits();
    let shift = (b as u32) & (bits - 1);
    let mask: u128 = if bits == 32 { u32::MAX as u128 } else { u64::MAX as u128 };
    let r = match op {
        Operator::Plus => a.wrapping_add(b),
        Operator::Minus => a.wrapping_sub(b),
        Operator::Star => a.wrapping_mul(b),
        Operator::Slash => {
            if b == 0 {
                return Err(zero_division());
            }
            a.wrapping_div(b)
        }
        Operator::Mod => {
            if b == 0 {
                return Err(zero_division());
            }
            a.wrapping_rem(b)
        }
        Operator::BitwiseOr => a | b,
        Operator::BitwiseXor => a ^ b,
        Operator::BitwiseAnd => a & b,
        Operator::ShiftL => a.wrapping_shl(shift),
        Operator::ShiftR => {
            if width.signed() {
                let narrowed = if bits == 32 { a as i32 as i128 } else { a as i64 as i128 };
                narrowed >> shift
            } else {
                (((a as u128) & mask) >> shift) as i128
            }
        }
        Operator::ShiftRR => (((a as u128) & mask) >> shift) as i128,
        other => {
            return Err(QuarryError::InvalidArgument(format!("not an arithmetic operator: {}", other)));
        }
    };
    Ok(r)
}

fn float_binary(op: Operator, a: f64, b: f64) -> Result<f64> {
    let (ai, bi) = (a as i64, b as i64);
    let shift = (bi as u32) & 63;
    let r = match op {
        Operator::Plus => a + b,
        Operator::Minus => a - b,
        Operator::Star => a * b,
        Operator::Slash => {
            if b == 0.0 {
                return Err(zero_division());
            }
            a / b
        }
        Operator::Mod => {
            if b == 0.0 {
                return Err(zero_division());
            }
            a % b
        }
        Operator::BitwiseOr => (ai | bi) as f64,
        Operator::BitwiseXor => (ai ^ bi) as f64,
        Operator::BitwiseAnd => (ai & bi) as f64,
        Operator::ShiftL => ai.wrapping_shl(shift) as f64,
        Operator::ShiftR => (ai >> shift) as f64,
        Operator::ShiftRR => ((ai as u64) >> shift) as f64,
        other => {
            return Err(QuarryError::InvalidArgument(format!("not an arithmetic operator: {}", other)));
        }
    };
    Ok(r)
}

fn text_binary(op: Operator, x: &Value, y: &Value) -> Result<Value> {
    match op {
        Operator::Plus
        | Operator::BitwiseOr
        | Operator::BitwiseXor
        | Operator::BitwiseAnd
        | Operator::ShiftL
        | Operator::ShiftR
        | Operator::ShiftRR => {
            let a = numeric_text(x, Domain::Int64)?;
            let b = match y {
                Value::Float(f) => Value::Int64(*f as i64),
                other => numeric_text(other, Domain::Int64)?,
            };
            binary(op, &a, &b)
        }
        _ => Err(QuarryError::NotImplemented(format!(
            "\"string\" {} \"string\" isn't supported",
            op.symbol()
        ))),
    }
}

/// Unary MINUS and BITWISE_NOT.
pub fn unary(op: Operator, x: &Value) -> Result<Value> {
    let width = Width::of(x).ok_or_else(|| invalid_type(op, x))?;
    match (op, width) {
        (_, Width::Text) => Err(QuarryError::NotImplemented(format!(
            "{}\"string\" isn't supported",
            op.symbol()
        ))),
        (Operator::Minus, Width::Float) => Ok(Value::Float(-x.as_f64().unwrap_or(0.0))),
        (Operator::BitwiseNot, Width::Float) => Ok(Value::Float(!(x.as_f64().unwrap_or(0.0) as i64) as f64)),
        (Operator::Minus, _) | (Operator::BitwiseNot, _) => {
            let a = x.int_value().ok_or_else(|| invalid_type(op, x))?;
            let r = if op == Operator::Minus { a.wrapping_neg() } else { !a };
            Value::from_int(width.domain(), r).ok_or_else(|| invalid_type(op, x))
        }
        _ => Err(QuarryError::InvalidArgument(format!("not a unary operator: {}", op))),
    }
}

fn is_plain_int(value: &Value) -> bool {
    !matches!(value, Value::Time(_)) && value.int_value().is_some()
}

/// Time-comparable view of a non-time value: 32-bit integers and floats count seconds, 64-bit
/// integers are taken as microseconds.
fn as_time(value: &Value) -> Option<i128> {
    match value {
        Value::Time(t) => Some(*t as i128),
        Value::Int64(v) => Some(*v as i128),
        Value::UInt64(v) => Some(*v as i128),
        Value::Float(f) => Some((*f * USEC_PER_SEC as f64) as i128),
        Value::ShortText(b) | Value::Text(b) | Value::LongText(b) => {
            Some(atoi(b) as i128 * USEC_PER_SEC as i128)
        }
        other => other.int_value().map(|v| v * USEC_PER_SEC as i128),
    }
}

fn ordering(x: &Value, y: &Value) -> Option<Ordering> {
    match (x, y) {
        (Value::Void, _) | (_, Value::Void) => None,
        (Value::Time(_), _) | (_, Value::Time(_)) => as_time(x)?.partial_cmp(&as_time(y)?),
        (Value::Record { table: ta, id: a }, Value::Record { table: tb, id: b }) => {
            if ta == tb {
                Some(a.cmp(b))
            } else {
                None
            }
        }
        _ if x.is_text() && y.is_text() => x.as_bytes()?.partial_cmp(y.as_bytes()?),
        _ if x.is_text() => ordering(&Value::Int64(atoi(x.as_bytes()?)), y),
        _ if y.is_text() => {
            let cast = y.cast(x.domain()).ok()?;
            ordering(x, &cast)
        }
        _ if is_plain_int(x) && is_plain_int(y) => Some(x.int_value()?.cmp(&y.int_value()?)),
        _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

/// LESS, GREATER, LESS_EQUAL and GREATER_EQUAL. Incomparable operands are never ordered.
pub fn compare(op: Operator, x: &Value, y: &Value) -> bool {
    let Some(ord) = ordering(x, y) else {
        return false;
    };
    match op {
        Operator::Less => ord == Ordering::Less,
        Operator::Greater => ord == Ordering::Greater,
        Operator::LessEqual => ord != Ordering::Greater,
        Operator::GreaterEqual => ord != Ordering::Less,
        _ => false,
    }
}

pub fn equal(x: &Value, y: &Value) -> bool {
    match (x, y) {
        (Value::Void, _) | (_, Value::Void) => false,
        (Value::Time(_), _) | (_, Value::Time(_)) => match (as_time(x), as_time(y)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Record { table: ta, id: a }, Value::Record { table: tb, id: b }) => ta == tb && a == b,
        (Value::Float(_), _) | (_, Value::Float(_)) if !x.is_text() && !y.is_text() => {
            match (x.as_f64(), y.as_f64()) {
                (Some(a), Some(b)) => a <= b && a >= b,
                _ => false,
            }
        }
        _ if x.is_text() && y.is_text() => x.as_bytes() == y.as_bytes(),
        _ if x.is_text() => x.as_bytes().map(|b| equal(&Value::Int64(atoi(b)), y)).unwrap_or(false),
        _ if y.is_text() => y.as_bytes().map(|b| equal(x, &Value::Int64(atoi(b)))).unwrap_or(false),
        _ if x.int_value().is_some() && y.int_value().is_some() => x.int_value() == y.int_value(),
        _ => x == y,
    }
}

fn text_view(value: &Value) -> Option<Vec<u8>> {
    match value.as_bytes() {
        Some(bytes) => Some(bytes.to_vec()),
        None => value.cast(Domain::Text).ok().and_then(|v| v.as_bytes().map(<[u8]>::to_vec)),
    }
}

/// Case-folded substring test used by MATCH.
pub fn match_text(x: &Value, query: &Value) -> bool {
    let (Some(text), Some(query)) = (x.as_bytes(), text_view(query)) else {
        return false;
    };
    let text = String::from_utf8_lossy(text).to_lowercase();
    let query = String::from_utf8_lossy(&query).to_lowercase();
    text.contains(&query)
}

pub fn prefix(x: &Value, y: &Value) -> bool {
    match (x.as_bytes(), text_view(y)) {
        (Some(x), Some(y)) => x.starts_with(&y),
        _ => false,
    }
}

pub fn suffix(x: &Value, y: &Value) -> bool {
    match (x.as_bytes(), text_view(y)) {
        (Some(x), Some(y)) => x.ends_with(&y),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_follows_left_width() {
        assert_eq!(binary(Operator::Plus, &Value::Int8(100), &Value::Int8(100)).unwrap(), Value::Int32(200));
        assert_eq!(binary(Operator::Plus, &Value::UInt16(1), &Value::Int32(2)).unwrap(), Value::UInt32(3));
        assert_eq!(
            binary(Operator::Plus, &Value::Int32(i32::MAX), &Value::Int32(1)).unwrap(),
            Value::Int32(i32::MIN)
        );
        assert_eq!(binary(Operator::Star, &Value::Int64(3), &Value::UInt32(4)).unwrap(), Value::Int64(12));
        assert_eq!(binary(Operator::Minus, &Value::Time(5_000_000), &Value::Int32(1)).unwrap(), Value::Time(4_999_999));
    }

    #[test]
    fn test_float_operand_gives_float() {
        assert_eq!(binary(Operator::Plus, &Value::Int32(1), &Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(binary(Operator::Slash, &Value::Float(1.0), &Value::Int32(4)).unwrap(), Value::Float(0.25));
        assert_eq!(binary(Operator::ShiftL, &Value::Float(1.9), &Value::Int32(2)).unwrap(), Value::Float(4.0));
    }

    #[test]
    fn test_division_by_zero() {
        for y in [Value::Int32(0), Value::UInt64(0), Value::Float(0.0)] {
            let err = binary(Operator::Slash, &Value::Int32(1), &y).unwrap_err();
            assert_eq!(err, QuarryError::ArithmeticError("dividend should not be 0".to_string()));
            assert!(binary(Operator::Mod, &Value::Int64(1), &y).is_err());
        }
    }

    #[test]
    fn test_text_operands() {
        assert_eq!(binary(Operator::Plus, &Value::Int32(1), &Value::text("41")).unwrap(), Value::Int32(42));
        let err = binary(Operator::Plus, &Value::Int32(1), &Value::text("x")).unwrap_err();
        assert_eq!(err, QuarryError::ArithmeticError("not a numerical format: <x>".to_string()));
        assert_eq!(binary(Operator::Plus, &Value::text("40"), &Value::text("2")).unwrap(), Value::Int64(42));
        let err = binary(Operator::Star, &Value::text("4"), &Value::text("2")).unwrap_err();
        assert_eq!(err, QuarryError::NotImplemented("\"string\" * \"string\" isn't supported".to_string()));
    }

    #[test]
    fn test_shifts() {
        assert_eq!(binary(Operator::ShiftR, &Value::Int32(-8), &Value::Int32(1)).unwrap(), Value::Int32(-4));
        assert_eq!(
            binary(Operator::ShiftRR, &Value::Int32(-8), &Value::Int32(28)).unwrap(),
            Value::Int32(15)
        );
        assert_eq!(binary(Operator::ShiftL, &Value::Int32(1), &Value::Int32(33)).unwrap(), Value::Int32(2));
    }

    #[test]
    fn test_unary() {
        assert_eq!(unary(Operator::Minus, &Value::Int8(5)).unwrap(), Value::Int32(-5));
        assert_eq!(unary(Operator::BitwiseNot, &Value::Int32(0)).unwrap(), Value::Int32(-1));
        assert_eq!(unary(Operator::Minus, &Value::Float(2.0)).unwrap(), Value::Float(-2.0));
        assert!(unary(Operator::Minus, &Value::text("1")).is_err());
    }

    #[test]
    fn test_cross_domain_equality() {
        assert!(equal(&Value::Int32(1), &Value::Int64(1)));
        assert!(equal(&Value::UInt32(u32::MAX), &Value::Int64(u32::MAX as i64)));
        assert!(!equal(&Value::Int32(-1), &Value::UInt32(u32::MAX)));
        assert!(equal(&Value::Int32(3), &Value::Float(3.0)));
        assert!(equal(&Value::text("12"), &Value::Int32(12)));
        assert!(equal(&Value::Time(2_000_000), &Value::Int32(2)));
        assert!(equal(&Value::Time(2_000_000), &Value::Int64(2_000_000)));
        assert!(equal(&Value::short_text("a"), &Value::long_text("a")));
        assert!(!equal(&Value::Void, &Value::Void));
        assert!(!equal(&Value::record(256, 1), &Value::record(257, 1)));
    }

    #[test]
    fn test_ordering() {
        assert!(compare(Operator::Less, &Value::Int32(-1), &Value::UInt32(0)));
        assert!(compare(Operator::GreaterEqual, &Value::Float(2.5), &Value::Int32(2)));
        assert!(compare(Operator::Less, &Value::text("ab"), &Value::text("abc")));
        assert!(compare(Operator::Greater, &Value::text("10"), &Value::Int32(9)));
        assert!(compare(Operator::Less, &Value::Int32(9), &Value::text("10")));
        assert!(!compare(Operator::Less, &Value::Int32(9), &Value::text("ten")));
        assert!(compare(Operator::Less, &Value::Int32(1), &Value::Time(2_000_000)));
        assert!(!compare(Operator::Less, &Value::Void, &Value::Int32(1)));
    }

    #[test]
    fn test_text_matching() {
        assert!(match_text(&Value::text("Hello World"), &Value::text("world")));
        assert!(!match_text(&Value::Int32(1), &Value::text("1")));
        assert!(prefix(&Value::text("quarrying"), &Value::text("quar")));
        assert!(suffix(&Value::text("quarrying"), &Value::text("ing")));
        assert!(!prefix(&Value::text("gr"), &Value::text("groo")));
    }
}
