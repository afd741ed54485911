//! Serialize module: packs an expression into a compact binary image and back.
//!
//! Integers are LEB128 varints. An image holds the variables (name and value) followed by the
//! instructions (operator code, nargs, operand). Objects are stored by id and resolved again
//! through the storage and the function registry on unpack.

use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::expression::Expression;
use crate::functions::FunctionRegistry;
use crate::ir::{Operand, Operator};
use crate::storage::Storage;
use crate::types::{corrupt_image, Domain, Object, Value, WeightedColumn};
use crate::{QuarryError, Result};
use std::sync::Arc;

const OPERAND_NONE: u64 = 0;
const OPERAND_VAR: u64 = 1;
const OPERAND_OTHER: u64 = 2;

const TAG_VOID: u64 = 0;
const TAG_BULK: u64 = 1;
const TAG_VECTOR: u64 = 2;
const TAG_COLUMN: u64 = 3;
const TAG_PROCEDURE: u64 = 4;
const TAG_TABLE: u64 = 5;
const TAG_MATCH_COLUMNS: u64 = 6;

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn zigzag(v: i32) -> u64 {
    ((v << 1) ^ (v >> 31)) as u32 as u64
}

fn unzigzag(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

fn pack_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Void => put_varint(buf, TAG_VOID),
        Value::Vector { domain, items } => {
            put_varint(buf, TAG_VECTOR);
            put_varint(buf, domain.code() as u64);
            put_varint(buf, items.len() as u64);
            for item in items {
                let payload = item
                    .payload_bytes()
                    .ok_or_else(|| QuarryError::NotImplemented(format!("can't pack vector element {}", item)))?;
                put_bytes(buf, &payload);
            }
        }
        Value::Object(Object::Column(column)) => {
            put_varint(buf, TAG_COLUMN);
            put_varint(buf, column.id as u64);
        }
        Value::Object(Object::Procedure(proc)) => {
            put_varint(buf, TAG_PROCEDURE);
            put_varint(buf, proc.id() as u64);
        }
        Value::Object(Object::Table(table)) => {
            put_varint(buf, TAG_TABLE);
            put_varint(buf, *table as u64);
        }
        Value::Object(Object::MatchColumns(columns)) => {
            put_varint(buf, TAG_MATCH_COLUMNS);
            put_varint(buf, columns.len() as u64);
            for weighted in columns.iter() {
                put_varint(buf, weighted.column.id as u64);
                put_varint(buf, zigzag(weighted.weight));
            }
        }
        Value::Ref { .. } => {
            return Err(QuarryError::NotImplemented("can't pack a column reference".to_string()));
        }
        scalar => {
            let payload = scalar
                .payload_bytes()
                .ok_or_else(|| QuarryError::NotImplemented(format!("can't pack {}", scalar)))?;
            put_varint(buf, TAG_BULK);
            put_varint(buf, scalar.domain().code() as u64);
            put_bytes(buf, &payload);
        }
    }
    Ok(())
}

/// Packs `expr` into a binary image.
pub fn pack(expr: &Expression) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let vars = expr.variables();
    put_varint(&mut buf, vars.len() as u64);
    for var in vars {
        put_bytes(&mut buf, var.name.as_bytes());
        pack_value(&mut buf, &var.value)?;
    }
    let code = expr.code();
    put_varint(&mut buf, code.len() as u64);
    for instr in code {
        put_varint(&mut buf, instr.op.code() as u64);
        put_varint(&mut buf, instr.nargs as u64);
        match &instr.value {
            None => put_varint(&mut buf, OPERAND_NONE),
            Some(Operand::Var(id)) => {
                put_varint(&mut buf, OPERAND_VAR);
                put_varint(&mut buf, *id as u64);
            }
            Some(operand) => {
                put_varint(&mut buf, OPERAND_OTHER);
                pack_value(&mut buf, &expr.operand_value(operand))?;
            }
        }
    }
    Ok(buf)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn varint(&mut self) -> Result<u64> {
        let mut v: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = *self.bytes.get(self.pos).ok_or_else(corrupt_image)?;
            self.pos += 1;
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
        }
        Err(corrupt_image())
    }

    fn u32(&mut self) -> Result<u32> {
        u32::try_from(self.varint()?).map_err(|_| corrupt_image())
    }

    fn usize(&mut self) -> Result<usize> {
        usize::try_from(self.varint()?).map_err(|_| corrupt_image())
    }

    fn chunk(&mut self) -> Result<&'a [u8]> {
        let len = self.usize()?;
        let end = self.pos.checked_add(len).ok_or_else(corrupt_image)?;
        let bytes = self.bytes.get(self.pos..end).ok_or_else(corrupt_image)?;
        self.pos = end;
        Ok(bytes)
    }

    fn domain(&mut self) -> Result<Domain> {
        Domain::from_code(self.u32()?).ok_or_else(corrupt_image)
    }

    fn finished(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

struct Unpacker<'a> {
    reader: Reader<'a>,
    storage: &'a dyn Storage,
    registry: &'a FunctionRegistry,
}

impl<'a> Unpacker<'a> {
    fn column(&mut self) -> Result<Arc<crate::schema::Column>> {
        let id = self.reader.u32()?;
        self.storage
            .column_by_id(id)
            .ok_or_else(|| QuarryError::FieldNotFound(format!("column #{}", id)))
    }

    fn value(&mut self) -> Result<Value> {
        let value = match self.reader.varint()? {
            TAG_VOID => Value::Void,
            TAG_BULK => {
                let domain = self.reader.domain()?;
                let payload = self.reader.chunk()?;
                Value::from_payload(domain, payload).map_err(|_| corrupt_image())?
            }
            TAG_VECTOR => {
                let domain = self.reader.domain()?;
                let count = self.reader.usize()?;
                let mut items = Vec::with_capacity(count.min(self.reader.bytes.len()));
                for _ in 0..count {
                    let payload = self.reader.chunk()?;
                    items.push(Value::from_payload(domain, payload).map_err(|_| corrupt_image())?);
                }
                Value::Vector { domain, items }
            }
            TAG_COLUMN => Value::Object(Object::Column(self.column()?)),
            TAG_PROCEDURE => {
                let id = self.reader.usize()?;
                let proc = self
                    .registry
                    .get_by_id(id)
                    .ok_or_else(|| QuarryError::InvalidArgument(format!("unknown procedure #{}", id)))?;
                Value::Object(Object::Procedure(proc.clone()))
            }
            TAG_TABLE => Value::Object(Object::Table(self.reader.u32()?)),
            TAG_MATCH_COLUMNS => {
                let count = self.reader.usize()?;
                let mut columns = Vec::with_capacity(count.min(self.reader.bytes.len()));
                for _ in 0..count {
                    let column = self.column()?;
                    let weight = unzigzag(self.reader.u32()?);
                    columns.push(WeightedColumn::new(column, weight));
                }
                Value::Object(Object::MatchColumns(columns.into()))
            }
            _ => return Err(corrupt_image()),
        };
        Ok(value)
    }
}

/// Rebuilds an expression from an image made by [`pack`].
///
/// Columns are resolved through `storage` and procedures through `registry`. Truncated images
/// and images with trailing bytes are rejected.
pub fn unpack(bytes: &[u8], storage: &dyn Storage, registry: &FunctionRegistry, config: &EngineConfig) -> Result<Expression> {
    let mut u = Unpacker { reader: Reader { bytes, pos: 0 }, storage, registry };
    let mut expr = Expression::with_config(config);

    let nvars = u.reader.usize()?;
    for _ in 0..nvars {
        let name = u.reader.chunk()?;
        let name = std::str::from_utf8(name).map_err(|_| corrupt_image())?;
        let id = expr.add_var(if name.is_empty() { None } else { Some(name) })?;
        let value = u.value()?;
        expr.set_var(id, value)?;
    }

    let ncodes = u.reader.usize()?;
    let mut decoded = Vec::with_capacity(ncodes.min(bytes.len()));
    for _ in 0..ncodes {
        let op = u8::try_from(u.reader.varint()?)
            .ok()
            .and_then(Operator::from_code)
            .ok_or_else(corrupt_image)?;
        let nargs = u.reader.usize()?;
        let operand = match u.reader.varint()? {
            OPERAND_NONE => None,
            OPERAND_VAR => {
                let id = u.reader.usize()?;
                if id >= expr.nvars() {
                    return Err(corrupt_image());
                }
                Some(Operand::Var(id))
            }
            OPERAND_OTHER => match u.value()? {
                Value::Object(obj) => {
                    if let Object::Column(column) = &obj {
                        expr.heap.keep_column(column);
                    }
                    Some(Operand::Object(obj))
                }
                value => Some(Operand::Const(expr.heap.consts.push(value)?)),
            },
            _ => return Err(corrupt_image()),
        };
        decoded.push((op, nargs, operand));
    }
    if !u.reader.finished() {
        return Err(corrupt_image());
    }

    // Replaying through the compiler rebuilds the data-flow links, instruction flags and the
    // cacheable/taintable bits that the image doesn't carry.
    let mut compiler = Compiler::new(&mut expr, storage);
    for (op, nargs, operand) in decoded {
        compiler.append_operand(operand, op, nargs)?;
    }
    Ok(expr)
}
