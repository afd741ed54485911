//! Stack machine that runs compiled bytecode against a `VmContext` and a `Storage`.
//!
//! `execute` runs a whole expression; the planner uses `run_span` to evaluate a single predicate's
//! slice of the bytecode per candidate record.

use crate::arith;
use crate::context::{Slot, VmContext};
use crate::expression::{ExprHeap, Expression};
use crate::functions::ProcContext;
use crate::geo;
use crate::ir::{Instruction, Operand, Operator};
use crate::schema::Column;
use crate::storage::{SetMode, Storage};
use crate::types::{Object, Value};
use crate::{QuarryError, Result};
use std::sync::Arc;
use tracing::{trace, warn};

/// Runs `expr` with `nargs` caller-pushed arguments. The arguments are replaced by the result
/// (or `Void` when the code leaves nothing), which is also returned.
pub fn execute(ctx: &mut VmContext, expr: &mut Expression, storage: &dyn Storage, nargs: usize) -> Result<Option<Value>> {
    trace!(codes = expr.code.len(), nargs = nargs, "execute");
    let result = run_span(ctx, &expr.code, &mut expr.heap, storage, nargs)?;
    ctx.push_slot(Slot::Value(result.clone().unwrap_or(Value::Void)))?;
    Ok(result)
}

/// Runs `code` inside a fresh frame and returns the top value it leaves. The stack is truncated
/// below the arguments and the pool rewound whether or not the run succeeds.
pub(crate) fn run_span(
    ctx: &mut VmContext,
    code: &[Instruction],
    heap: &mut ExprHeap,
    storage: &dyn Storage,
    nargs: usize,
) -> Result<Option<Value>> {
    let frame = ctx.save(nargs, heap.pool.mark())?;
    let outcome = Machine { ctx: &mut *ctx, heap: &mut *heap, storage }.run(code);
    let result = outcome.map(|()| ctx.top_slot().map(|slot| slot.value(heap).clone()));
    ctx.restore(frame);
    heap.pool.rewind(frame.pool_mark);
    result
}

struct Machine<'a> {
    ctx: &'a mut VmContext,
    heap: &'a mut ExprHeap,
    storage: &'a dyn Storage,
}

fn operand_slot(operand: &Operand) -> Slot {
    match operand {
        Operand::Const(id) => Slot::Const(*id),
        Operand::Var(id) => Slot::Var(*id),
        Operand::Object(obj) => Slot::Value(Value::Object(obj.clone())),
    }
}

fn flag(b: bool) -> Value {
    Value::Int32(b as i32)
}

impl Machine<'_> {
    fn run(&mut self, code: &[Instruction]) -> Result<()> {
        let mut pc = 0;
        while let Some(instr) = code.get(pc) {
            let mut next = pc + 1;
            match instr.op {
                Operator::Push => {
                    let operand = instr
                        .value
                        .as_ref()
                        .ok_or_else(|| QuarryError::InvalidArgument("obj not assigned for PUSH".to_string()))?;
                    self.ctx.push_slot(operand_slot(operand))?;
                }
                Operator::Pop => {
                    let slot = self.ctx.pop_slot()?;
                    self.take(slot);
                }
                Operator::Nop => {}
                Operator::Jump => next = pc + instr.nargs + 1,
                Operator::CJump => {
                    if !self.pop()?.is_truthy() {
                        next += instr.nargs;
                    }
                }
                Operator::GetValue => {
                    next = pc;
                    while let Some(get) = code.get(next).filter(|i| i.op == Operator::GetValue) {
                        let (column, record) = self.column_operands(get)?;
                        let value = self.storage.get_value(&column, record)?;
                        self.push(value)?;
                        next += 1;
                    }
                }
                Operator::GetRef => {
                    let (column, record) = self.column_operands(instr)?;
                    self.push(Value::Ref { column, record })?;
                }
                Operator::Call => self.call(instr)?,
                Operator::And | Operator::Or | Operator::But | Operator::Adjust => {
                    let (x, y) = self.operands(instr)?;
                    let value = match instr.op {
                        Operator::And => flag(x.is_truthy() && y.is_truthy()),
                        Operator::Or => flag(x.is_truthy() || y.is_truthy()),
                        Operator::But => flag(x.is_truthy() && !y.is_truthy()),
                        _ => x,
                    };
                    self.push(value)?;
                }
                Operator::Equal | Operator::NotEqual => {
                    let (x, y) = self.operands(instr)?;
                    let eq = arith::equal(&x, &y);
                    self.push(flag(if instr.op == Operator::Equal { eq } else { !eq }))?;
                }
                Operator::Less | Operator::Greater | Operator::LessEqual | Operator::GreaterEqual => {
                    let (x, y) = self.operands(instr)?;
                    self.push(flag(arith::compare(instr.op, &x, &y)))?;
                }
                Operator::Match => {
                    let (x, y) = self.operands(instr)?;
                    let hit = match &x {
                        Value::Object(Object::MatchColumns(columns)) => {
                            let record = self.current_record()?;
                            let mut hit = false;
                            for weighted in columns.iter() {
                                let text = self.storage.get_value(&weighted.column, record)?;
                                if arith::match_text(&text, &y) {
                                    hit = true;
                                    break;
                                }
                            }
                            hit
                        }
                        _ => arith::match_text(&x, &y),
                    };
                    self.push(flag(hit))?;
                }
                Operator::Prefix => {
                    let (x, y) = self.operands(instr)?;
                    self.push(flag(arith::prefix(&x, &y)))?;
                }
                Operator::Suffix => {
                    let (x, y) = self.operands(instr)?;
                    self.push(flag(arith::suffix(&x, &y)))?;
                }
                Operator::GeoDistance1
                | Operator::GeoDistance2
                | Operator::GeoDistance3
                | Operator::GeoDistance4
                | Operator::GeoWithinp5
                | Operator::GeoWithinp6
                | Operator::GeoWithinp8 => {
                    let arity = geo::arity(instr.op).unwrap_or(0);
                    let mut args = Vec::with_capacity(arity);
                    if let Some(operand) = &instr.value {
                        args.push(self.heap.operand_value(operand));
                    }
                    while args.len() < arity {
                        args.push(self.pop()?);
                    }
                    let value = geo::evaluate(instr.op, &args)?;
                    self.push(value)?;
                }
                Operator::Minus if instr.nargs == 1 && instr.value.is_none() => {
                    let x = self.pop()?;
                    self.push(arith::unary(Operator::Minus, &x)?)?;
                }
                Operator::BitwiseNot => {
                    let x = self.pop()?;
                    self.push(arith::unary(Operator::BitwiseNot, &x)?)?;
                }
                Operator::Plus
                | Operator::Minus
                | Operator::Star
                | Operator::Slash
                | Operator::Mod
                | Operator::ShiftL
                | Operator::ShiftR
                | Operator::ShiftRR
                | Operator::BitwiseOr
                | Operator::BitwiseXor
                | Operator::BitwiseAnd => {
                    let (x, y) = self.operands(instr)?;
                    self.push(arith::binary(instr.op, &x, &y)?)?;
                }
                Operator::Incr | Operator::Decr | Operator::IncrPost | Operator::DecrPost => self.step(instr.op)?,
                Operator::Assign => self.assign(instr)?,
                op => match op.assign_arithmetic() {
                    Some(arith_op) => self.assign_arithmetic(instr, arith_op)?,
                    None => return Err(QuarryError::NotImplemented(format!("unsupported operator: {}", op))),
                },
            }
            pc = next;
        }
        Ok(())
    }

    /// Consumes a slot, returning its cell to the pool when it was scratch.
    fn take(&mut self, slot: Slot) -> Value {
        match slot {
            Slot::Scratch(index) => {
                let value = self.heap.pool.take(index);
                self.heap.pool.release(index);
                value
            }
            Slot::Value(value) => value,
            other => other.value(self.heap).clone(),
        }
    }

    fn pop(&mut self) -> Result<Value> {
        let slot = self.ctx.pop_slot()?;
        Ok(self.take(slot))
    }

    fn push(&mut self, value: Value) -> Result<()> {
        let index = self.heap.pool.alloc(value)?;
        self.ctx.push_slot(Slot::Scratch(index))
    }

    /// Left and right operand of a binary operator; a bound operand is the right one.
    fn operands(&mut self, instr: &Instruction) -> Result<(Value, Value)> {
        let y = match &instr.value {
            Some(operand) => self.heap.operand_value(operand),
            None => self.pop()?,
        };
        let x = self.pop()?;
        Ok((x, y))
    }

    fn current_record(&self) -> Result<u32> {
        match self.heap.vars.first().map(|v| &v.value) {
            Some(Value::Record { id, .. }) => Ok(*id),
            other => Err(QuarryError::InvalidArgument(format!(
                "invalid record: {}",
                other.cloned().unwrap_or_default()
            ))),
        }
    }

    fn column_operands(&mut self, instr: &Instruction) -> Result<(Arc<Column>, u32)> {
        let column = match &instr.value {
            Some(operand) => self.heap.operand_value(operand),
            None => self.pop()?,
        };
        let record = if instr.nargs == 1 {
            self.heap.vars.first().map(|v| v.value.clone()).unwrap_or_default()
        } else {
            self.pop()?
        };
        let Value::Record { table, id } = record else {
            return Err(QuarryError::InvalidArgument(format!("invalid record: {}", record)));
        };
        let column = match column {
            Value::Object(Object::Column(column)) => column,
            name if name.is_text() => {
                let name = String::from_utf8_lossy(name.as_bytes().unwrap_or_default()).into_owned();
                match self.heap.cached_column(table, &name) {
                    Some(column) => column,
                    None => {
                        let column = self
                            .storage
                            .lookup_column(table, &name)?
                            .ok_or_else(|| QuarryError::FieldNotFound(name.clone()))?;
                        self.heap.keep_column(&column);
                        column
                    }
                }
            }
            other => return Err(QuarryError::InvalidArgument(format!("invalid column: {}", other))),
        };
        Ok((column, id))
    }

    fn call(&mut self, instr: &Instruction) -> Result<()> {
        let nargs = instr.nargs;
        let callee = match &instr.value {
            Some(operand) => self.heap.operand_value(operand),
            None => self
                .ctx
                .slot_from_top(nargs)
                .map(|slot| slot.value(self.heap).clone())
                .ok_or_else(|| QuarryError::InvalidArgument("stack underflow".to_string()))?,
        };
        let Value::Object(Object::Procedure(proc)) = &callee else {
            return Err(QuarryError::InvalidArgument(format!("invalid function: <{}>", callee)));
        };
        let mut args = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            args.push(self.pop()?);
        }
        args.reverse();
        if instr.value.is_none() {
            let popped = self.pop()?;
            if popped != callee {
                warn!(procedure = proc.name(), "stack may be corrupt");
            }
        }
        let frame = self.ctx.save(0, self.heap.pool.mark())?;
        let result = {
            let mut pctx = ProcContext { vm: &mut *self.ctx, storage: self.storage, user_data: None };
            proc.invoke(&mut pctx, &args)
        };
        self.ctx.restore(frame);
        self.push(result?)
    }

    fn reference(&mut self, op: Operator) -> Result<(Arc<Column>, u32)> {
        match self.pop()? {
            Value::Ref { column, record } => {
                if !self.ctx.allow_updates() {
                    return Err(QuarryError::PermissionDenied(format!("{} is not allowed", op)));
                }
                Ok((column, record))
            }
            other => Err(QuarryError::InvalidArgument(format!("{}: not a settable target: {}", op, other))),
        }
    }

    fn step(&mut self, op: Operator) -> Result<()> {
        let (column, record) = self.reference(op)?;
        let one = Value::Int32(1);
        let delta = one.cast(column.range).unwrap_or(one);
        let mode = match op {
            Operator::Incr | Operator::IncrPost => SetMode::Incr,
            _ => SetMode::Decr,
        };
        let value = match op {
            Operator::Incr | Operator::Decr => {
                self.storage.set_value(&column, record, &delta, mode)?;
                self.storage.get_value(&column, record)?
            }
            _ => {
                let value = self.storage.get_value(&column, record)?;
                self.storage.set_value(&column, record, &delta, mode)?;
                value
            }
        };
        self.push(value)
    }

    fn assign(&mut self, instr: &Instruction) -> Result<()> {
        let value = match &instr.value {
            Some(operand) => self.heap.operand_value(operand),
            None => self.pop()?,
        };
        match self.ctx.pop_slot()? {
            Slot::Var(id) => {
                let var = self
                    .heap
                    .vars
                    .get_mut(id)
                    .ok_or_else(|| QuarryError::InvalidArgument(format!("no such variable: {}", id)))?;
                var.value = value.clone();
            }
            slot => match self.take(slot) {
                Value::Ref { column, record } => {
                    if !self.ctx.allow_updates() {
                        return Err(QuarryError::PermissionDenied(format!("{} is not allowed", Operator::Assign)));
                    }
                    self.storage.set_value(&column, record, &value, SetMode::Set)?;
                }
                other => {
                    return Err(QuarryError::InvalidArgument(format!("ASSIGN: not a settable target: {}", other)));
                }
            },
        }
        self.push(value)
    }

    fn assign_arithmetic(&mut self, instr: &Instruction, arith_op: Operator) -> Result<()> {
        let value = match &instr.value {
            Some(operand) => self.heap.operand_value(operand),
            None => self.pop()?,
        };
        let (column, record) = self.reference(instr.op)?;
        if column.range.is_text() {
            return Err(QuarryError::NotImplemented(format!(
                "\"string\" {}= \"string\" isn't supported",
                arith_op.symbol()
            )));
        }
        let current = self.storage.get_value(&column, record)?;
        let rhs = match value.cast(column.range) {
            Ok(rhs) => rhs,
            Err(_) if value.is_text() => {
                return Err(QuarryError::InvalidArgument("invalid value: string".to_string()));
            }
            Err(e) => return Err(e),
        };
        let result = arith::binary(arith_op, &current, &rhs)?.cast(column.range)?;
        self.storage.set_value(&column, record, &result, SetMode::Set)?;
        self.push(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::config::EngineConfig;
    use crate::functions::FunctionRegistry;
    use crate::memstore::MemoryStore;
    use crate::schema::TableSchemaBuilder;
    use crate::types::{Domain, TableId};

    fn store() -> (MemoryStore, TableId) {
        let store = MemoryStore::new();
        let schema = TableSchemaBuilder::new("docs")
            .key(Domain::ShortText)
            .column("size", Domain::Int32)
            .column("title", Domain::Text)
            .build();
        let table = store.create_table(&schema).unwrap();
        let id = store.add_record(table, Value::short_text("a")).unwrap();
        store.set(table, id, "size", Value::Int32(10)).unwrap();
        store.set(table, id, "title", Value::text("Hello World")).unwrap();
        (store, table)
    }

    fn for_record(table: TableId, id: u32) -> Expression {
        let mut expr = Expression::for_table(table).unwrap();
        expr.set_var(0, Value::record(table, id)).unwrap();
        expr
    }

    #[test]
    fn test_arithmetic_and_stack_effect() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(40, Operator::Push, 1).unwrap();
        c.append_constant_int(2, Operator::Push, 1).unwrap();
        c.append_operator(Operator::Plus, 2).unwrap();
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut expr, &store, 0).unwrap(), Some(Value::Int32(42)));
        assert_eq!(ctx.depth(), 1);
        assert_eq!(ctx.pop(), Some(Value::Int32(42)));
        assert_eq!(expr.pool().in_use(), 0);
    }

    #[test]
    fn test_arguments_are_consumed() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        let one = expr.heap.consts.push(Value::Int32(1)).unwrap();
        expr.code.push(Instruction::new(Operator::Plus, 2, Some(Operand::Const(one))));
        let mut ctx = VmContext::default();
        ctx.push(Value::Int32(7)).unwrap();
        ctx.push(Value::Int32(5)).unwrap();
        assert_eq!(execute(&mut ctx, &mut expr, &store, 1).unwrap(), Some(Value::Int32(6)));
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.pop(), Some(Value::Int32(6)));
        assert_eq!(ctx.pop(), Some(Value::Int32(7)));
    }

    #[test]
    fn test_error_restores_stack() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        c.append_constant_int(0, Operator::Slash, 2).unwrap();
        let mut ctx = VmContext::default();
        ctx.push(Value::Void).unwrap();
        let err = execute(&mut ctx, &mut expr, &store, 0).unwrap_err();
        assert_eq!(err, QuarryError::ArithmeticError("dividend should not be 0".to_string()));
        assert_eq!(ctx.depth(), 1);
        assert_eq!(expr.pool().in_use(), 0);
    }

    #[test]
    fn test_empty_code_yields_void() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut expr, &store, 0).unwrap(), None);
        assert_eq!(ctx.pop(), Some(Value::Void));
    }

    #[test]
    fn test_column_comparison() {
        let (store, table) = store();
        let mut expr = for_record(table, 1);
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_constant_int(5, Operator::Push, 1).unwrap();
        c.append_operator(Operator::Greater, 2).unwrap();
        c.append_constant_str("title", Operator::GetValue, 1).unwrap();
        c.append_constant_str("world", Operator::Push, 1).unwrap();
        c.append_operator(Operator::Match, 2).unwrap();
        c.append_operator(Operator::And, 2).unwrap();
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut expr, &store, 0).unwrap(), Some(Value::Int32(1)));
    }

    #[test]
    fn test_compound_assign_and_permissions() {
        let (store, table) = store();
        let mut expr = for_record(table, 1);
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_constant_int(5, Operator::PlusAssign, 2).unwrap();
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut expr, &store, 0).unwrap(), Some(Value::Int32(15)));
        assert_eq!(store.get(table, 1, "size").unwrap(), Value::Int32(15));

        ctx.set_allow_updates(false);
        let err = execute(&mut ctx, &mut expr, &store, 0).unwrap_err();
        assert!(matches!(err, QuarryError::PermissionDenied(_)));
        assert_eq!(store.get(table, 1, "size").unwrap(), Value::Int32(15));
    }

    #[test]
    fn test_text_compound_assign_is_rejected() {
        let (store, table) = store();
        let mut expr = for_record(table, 1);
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("title", Operator::GetValue, 1).unwrap();
        c.append_constant_str("!", Operator::PlusAssign, 2).unwrap();
        let mut ctx = VmContext::default();
        let err = execute(&mut ctx, &mut expr, &store, 0).unwrap_err();
        assert!(matches!(err, QuarryError::NotImplemented(_)));
    }

    #[test]
    fn test_compound_assign_rejects_non_numeric_text() {
        let (store, table) = store();
        let mut expr = for_record(table, 1);
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_constant_str("abc", Operator::PlusAssign, 2).unwrap();
        let mut ctx = VmContext::default();
        let err = execute(&mut ctx, &mut expr, &store, 0).unwrap_err();
        assert_eq!(err, QuarryError::InvalidArgument("invalid value: string".to_string()));
        assert_eq!(store.get(table, 1, "size").unwrap(), Value::Int32(10));
    }

    #[test]
    fn test_increments() {
        let (store, table) = store();
        let mut post = for_record(table, 1);
        let mut c = Compiler::new(&mut post, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_operator(Operator::IncrPost, 1).unwrap();
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut post, &store, 0).unwrap(), Some(Value::Int32(10)));

        let mut pre = for_record(table, 1);
        let mut c = Compiler::new(&mut pre, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_operator(Operator::Decr, 1).unwrap();
        assert_eq!(execute(&mut ctx, &mut pre, &store, 0).unwrap(), Some(Value::Int32(10)));
        assert_eq!(store.get(table, 1, "size").unwrap(), Value::Int32(10));
    }

    #[test]
    fn test_assign_rebinds_variable() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        let var = expr.add_var(Some("n")).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_var(var, Operator::Push, 1).unwrap();
        c.append_constant_int(3, Operator::Assign, 2).unwrap();
        let mut ctx = VmContext::default();
        execute(&mut ctx, &mut expr, &store, 0).unwrap();
        assert_eq!(expr.var_value(var), Some(&Value::Int32(3)));
    }

    #[test]
    fn test_conditional_jump() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(0, Operator::Push, 1).unwrap();
        c.append_operator(Operator::CJump, 2).unwrap();
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        c.append_operator(Operator::Jump, 1).unwrap();
        c.append_constant_int(2, Operator::Push, 1).unwrap();
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut expr, &store, 0).unwrap(), Some(Value::Int32(2)));
    }

    #[test]
    fn test_call_builtin() {
        let store = MemoryStore::new();
        let registry = FunctionRegistry::with_builtins();
        let length = registry.get("length").unwrap().clone();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_object(Object::Procedure(length), Operator::Push, 1).unwrap();
        c.append_constant_str("quarry", Operator::Push, 1).unwrap();
        c.append_operator(Operator::Call, 1).unwrap();
        let mut ctx = VmContext::new(&EngineConfig::default());
        let result = execute(&mut ctx, &mut expr, &store, 0).unwrap();
        assert_eq!(result.and_then(|v| v.as_i64()), Some(6));
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_get_value_needs_a_record() {
        let store = MemoryStore::new();
        let mut expr = Expression::new();
        expr.add_var(None).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        let mut ctx = VmContext::default();
        assert!(matches!(execute(&mut ctx, &mut expr, &store, 0), Err(QuarryError::InvalidArgument(_))));
        assert_eq!(ctx.depth(), 0);
    }
}
