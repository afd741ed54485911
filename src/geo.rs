//! Geo primitives over Int32 coordinates expressed in milliseconds of arc.
//!
//! Every operator takes its arguments in pop order (top of stack first).

use crate::ir::Operator;
use crate::types::Value;
use crate::{QuarryError, Result};
use std::f64::consts::PI;

/// Coordinate units per degree.
pub const GEO_RESOLUTION: f64 = 3_600_000.0;
/// Earth radius in meters used by the flat and spherical approximations.
pub const GEO_RADIUS: f64 = 6_357_303.0;

/// Meridian and prime-vertical constants plus the squared eccentricity of a reference ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub c1: f64,
    pub c2: f64,
    pub c3: f64,
}

pub const BESSEL: Ellipsoid = Ellipsoid { c1: 6_334_834.0, c2: 6_377_397.0, c3: 0.006674 };
pub const GRS80: Ellipsoid = Ellipsoid { c1: 6_335_439.0, c2: 6_378_137.0, c3: 0.006694 };

pub fn int2rad(v: i32) -> f64 {
    (PI * v as f64) / (GEO_RESOLUTION * 180.0)
}

/// Flat-earth distance between two points, in meters.
pub fn distance_rectangle(lng1: f64, lat1: f64, lng2: f64, lat2: f64) -> f64 {
    let x = (lng2 - lng1) * ((lat1 + lat2) * 0.5).cos();
    let y = lat2 - lat1;
    (x * x + y * y).sqrt() * GEO_RADIUS
}

/// Great-circle distance, in meters.
pub fn distance_sphere(lng1: f64, lat1: f64, lng2: f64, lat2: f64) -> f64 {
    let x = ((lng2 - lng1).abs() * 0.5).sin();
    let y = ((lat2 - lat1).abs() * 0.5).sin();
    (y * y + lat1.cos() * lat2.cos() * x * x).sqrt().asin() * 2.0 * GEO_RADIUS
}

/// Hubeny distance on a reference ellipsoid, in meters.
pub fn distance_ellipsoid(lng1: f64, lat1: f64, lng2: f64, lat2: f64, e: Ellipsoid) -> f64 {
    let p = (lat1 + lat2) * 0.5;
    let q = 1.0 - e.c3 * p.sin() * p.sin();
    let m = e.c1 / (q * q * q).sqrt();
    let n = e.c2 / q.sqrt();
    let x = n * p.cos() * (lng1 - lng2).abs();
    let y = m * (lat1 - lat2).abs();
    (x * x + y * y).sqrt()
}

fn coordinate(op: Operator, value: &Value) -> Result<i32> {
    match value {
        Value::Float(f) => Ok(*f as i32),
        other => other
            .int_value()
            .map(|v| v as i32)
            .ok_or_else(|| QuarryError::InvalidArgument(format!("{}: invalid coordinate: {}", op, other))),
    }
}

fn radians(op: Operator, args: &[Value]) -> Result<Vec<f64>> {
    args.iter().map(|v| coordinate(op, v).map(int2rad)).collect()
}

/// Number of stack operands an operator consumes.
pub fn arity(op: Operator) -> Option<usize> {
    match op {
        Operator::GeoDistance1 | Operator::GeoDistance2 | Operator::GeoDistance3 | Operator::GeoDistance4 => Some(4),
        Operator::GeoWithinp5 => Some(5),
        Operator::GeoWithinp6 => Some(6),
        Operator::GeoWithinp8 => Some(8),
        _ => None,
    }
}

/// Evaluates a geo operator over its operands in pop order.
pub fn evaluate(op: Operator, args: &[Value]) -> Result<Value> {
    let expected = arity(op).ok_or_else(|| QuarryError::InvalidArgument(format!("{} is not a geo operator", op)))?;
    if args.len() != expected {
        return Err(QuarryError::InvalidArgument(format!(
            "{} takes {} operands, got {}",
            op,
            expected,
            args.len()
        )));
    }
    let value = match op {
        Operator::GeoDistance1 | Operator::GeoDistance2 | Operator::GeoDistance3 | Operator::GeoDistance4 => {
            let r = radians(op, args)?;
            let (lng1, lat1, lng2, lat2) = (r[0], r[1], r[2], r[3]);
            let d = match op {
                Operator::GeoDistance1 => distance_rectangle(lng1, lat1, lng2, lat2),
                Operator::GeoDistance2 => distance_sphere(lng1, lat1, lng2, lat2),
                Operator::GeoDistance3 => distance_ellipsoid(lng1, lat1, lng2, lat2, BESSEL),
                _ => distance_ellipsoid(lng1, lat1, lng2, lat2, GRS80),
            };
            Value::Float(d)
        }
        Operator::GeoWithinp5 => {
            let r = radians(op, &args[..4])?;
            let d = distance_rectangle(r[0], r[1], r[2], r[3]);
            let within = match &args[4] {
                Value::Int32(limit) => d <= *limit as f64,
                Value::Float(limit) => d <= *limit,
                _ => false,
            };
            Value::Int32(within as i32)
        }
        Operator::GeoWithinp6 => {
            let r = radians(op, args)?;
            let (lng0, lat0, lng1, lat1, lng2, lat2) = (r[0], r[1], r[2], r[3], r[4], r[5]);
            let x = (lng1 - lng0) * ((lat0 + lat1) * 0.5).cos();
            let y = lat1 - lat0;
            let d = x * x + y * y;
            let x = (lng2 - lng1) * ((lat1 + lat2) * 0.5).cos();
            let y = lat2 - lat1;
            Value::Int32((d <= x * x + y * y) as i32)
        }
        _ => {
            let c = args.iter().map(|v| coordinate(op, v).map(i64::from)).collect::<Result<Vec<_>>>()?;
            let (ln0, la0, ln2, la2, ln3, la3) = (c[0], c[1], c[4], c[5], c[6], c[7]);
            Value::Int32((ln2 <= ln0 && ln0 <= ln3 && la2 <= la0 && la0 <= la3) as i32)
        }
    };
    Ok(value)
}
