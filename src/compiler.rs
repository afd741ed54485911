//! Compiler module: appends typed operands and operators to an expression's bytecode.
//!
//! Every append keeps the data-flow tracker in step with the runtime stack effect of the emitted
//! code, so later appends can inspect (and rewrite) the instruction that produced each operand.

use crate::dfi::DfiEntry;
use crate::expression::Expression;
use crate::ir::{InstrFlags, Instruction, Operand, Operator, VarId};
use crate::schema::Column;
use crate::storage::Storage;
use crate::types::{Domain, Object, Value, ValueKind};
use crate::{QuarryError, Result};
use std::sync::Arc;
use tracing::warn;

pub struct Compiler<'a> {
    expr: &'a mut Expression,
    storage: &'a dyn Storage,
}

/// One side of a binary operator as seen at compile time.
struct Side {
    operand: Option<Operand>,
    domain: Domain,
    constant: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(expr: &'a mut Expression, storage: &'a dyn Storage) -> Self {
        Self { expr, storage }
    }

    pub fn expression(&self) -> &Expression {
        self.expr
    }

    pub fn append_operator(&mut self, op: Operator, nargs: usize) -> Result<()> {
        self.append_operand(None, op, nargs)
    }

    /// Stores `value` in the constants arena (objects are bound directly) and appends it.
    pub fn append_constant(&mut self, value: Value, op: Operator, nargs: usize) -> Result<Operand> {
        let operand = match value {
            Value::Object(obj) => Operand::Object(obj),
            Value::Ref { .. } => {
                return Err(QuarryError::NotImplemented("unsupported type".to_string()));
            }
            value => Operand::Const(self.expr.heap.consts.push(value)?),
        };
        self.append_operand(Some(operand.clone()), op, nargs)?;
        Ok(operand)
    }

    pub fn append_constant_str(&mut self, s: &str, op: Operator, nargs: usize) -> Result<Operand> {
        self.append_constant(Value::text(s), op, nargs)
    }

    pub fn append_constant_int(&mut self, i: i32, op: Operator, nargs: usize) -> Result<Operand> {
        self.append_constant(Value::Int32(i), op, nargs)
    }

    pub fn append_constant_float(&mut self, f: f64, op: Operator, nargs: usize) -> Result<Operand> {
        self.append_constant(Value::Float(f), op, nargs)
    }

    pub fn append_object(&mut self, obj: Object, op: Operator, nargs: usize) -> Result<()> {
        self.append_operand(Some(Operand::Object(obj)), op, nargs)
    }

    pub fn append_var(&mut self, var: VarId, op: Operator, nargs: usize) -> Result<()> {
        if var >= self.expr.nvars() {
            return Err(QuarryError::InvalidArgument(format!("no such variable: {}", var)));
        }
        self.append_operand(Some(Operand::Var(var)), op, nargs)
    }

    pub fn append_operand(&mut self, operand: Option<Operand>, op: Operator, nargs: usize) -> Result<()> {
        if self.expr.code.len() >= self.expr.code_capacity {
            return Err(QuarryError::CapacityExceeded("stack is full".to_string()));
        }
        match op {
            Operator::Push => {
                let operand = operand.ok_or_else(|| {
                    QuarryError::InvalidArgument("obj not assigned for PUSH".to_string())
                })?;
                let (kind, domain) = self.shape(&operand);
                let code = self.emit(op, Some(operand), nargs);
                self.put(kind, domain, code);
            }
            Operator::Nop => {
                self.emit(op, operand, nargs);
            }
            Operator::Pop => {
                if operand.is_some() {
                    return Err(QuarryError::InvalidArgument("obj assigned for POP".to_string()));
                }
                self.emit(op, None, nargs);
                self.pop(op)?;
            }
            Operator::Call => self.append_call(operand, nargs)?,
            Operator::And | Operator::Or | Operator::But => {
                if nargs != 2 {
                    warn!(nargs = nargs, op = %op, "nargs != 2 in relative op");
                }
                if operand.is_some() {
                    warn!(op = %op, "obj assigned to relative op");
                }
                let code = self.emit(op, operand, nargs);
                for _ in 0..nargs {
                    let entry = self.expr.dfi.pop().ok_or_else(|| {
                        QuarryError::SyntaxError("stack under flow in relative op".to_string())
                    })?;
                    if let Some(producer) = entry.code.and_then(|c| self.expr.code.get_mut(c)) {
                        producer.flags.insert(InstrFlags::RELATIONAL);
                    }
                }
                self.put(ValueKind::Bulk, Domain::Int32, code);
            }
            Operator::Equal => {
                let bound = operand.as_ref().map(|o| self.side_of_operand(o));
                let code = self.emit(op, operand, nargs);
                if nargs > 0 {
                    let x = match bound {
                        Some(side) => side,
                        None => {
                            let entry = self.pop(op)?;
                            self.side_of_entry(&entry)
                        }
                    };
                    let mut y = None;
                    for _ in 1..nargs {
                        let entry = self.pop(op)?;
                        y = Some(self.side_of_entry(&entry));
                    }
                    if let Some(y) = y {
                        self.recast_equal(&x, &y);
                    }
                }
                self.put(ValueKind::Bulk, Domain::Int32, code);
            }
            Operator::NotEqual
            | Operator::Less
            | Operator::Greater
            | Operator::LessEqual
            | Operator::GreaterEqual
            | Operator::Match
            | Operator::Prefix
            | Operator::Suffix
            | Operator::GeoDistance1
            | Operator::GeoDistance2
            | Operator::GeoDistance3
            | Operator::GeoDistance4
            | Operator::GeoWithinp5
            | Operator::GeoWithinp6
            | Operator::GeoWithinp8
            | Operator::GetRef
            | Operator::Adjust => {
                let pops = if operand.is_some() { nargs.saturating_sub(1) } else { nargs };
                let code = self.emit(op, operand, nargs);
                for _ in 0..pops {
                    self.pop(op)?;
                }
                let (kind, domain) = match op {
                    Operator::GeoDistance1
                    | Operator::GeoDistance2
                    | Operator::GeoDistance3
                    | Operator::GeoDistance4 => (ValueKind::Bulk, Domain::Float),
                    Operator::GetRef => (ValueKind::Object, Domain::Void),
                    _ => (ValueKind::Bulk, Domain::Int32),
                };
                self.put(kind, domain, code);
            }
            Operator::Plus if nargs <= 1 => {}
            Operator::Minus if nargs == 1 && operand.is_none() => self.append_unary_minus()?,
            Operator::BitwiseNot => {
                let code = self.emit(op, operand, nargs);
                let entry = self.pop(op)?;
                self.put(entry.kind, entry.domain, code);
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
                let pops = if operand.is_some() { nargs.saturating_sub(1) } else { nargs };
                let code = self.emit(op, operand, nargs);
                for _ in 0..pops {
                    self.pop(op)?;
                }
                self.put(ValueKind::Bulk, Domain::Void, code);
            }
            Operator::Incr | Operator::Decr | Operator::IncrPost | Operator::DecrPost => {
                let target = self.pop(op)?;
                self.make_reference(&target);
                let code = self.emit(op, operand, nargs);
                self.put(target.kind, target.domain, code);
            }
            Operator::GetValue => self.append_get_value(operand, nargs)?,
            Operator::Jump | Operator::CJump => {
                self.expr.dfi.pop();
                self.emit(op, operand, nargs);
            }
            assign => {
                // ASSIGN and the compound assignments
                let (kind, domain) = match &operand {
                    Some(operand) => self.shape(operand),
                    None => {
                        let value = self.pop(assign)?;
                        (value.kind, value.domain)
                    }
                };
                let target = self.pop(assign)?;
                self.make_reference(&target);
                let code = self.emit(assign, operand, nargs);
                self.put(kind, domain, code);
            }
        }
        Ok(())
    }

    fn append_call(&mut self, operand: Option<Operand>, nargs: usize) -> Result<()> {
        let callee = match &operand {
            Some(operand) => Some(operand.clone()),
            None => self
                .expr
                .dfi
                .nth_from_top(nargs)
                .and_then(|entry| entry.code)
                .and_then(|c| self.expr.code.get(c))
                .and_then(|instr| instr.value.clone()),
        };
        match callee {
            None | Some(Operand::Var(_)) => {}
            Some(Operand::Object(Object::Procedure(proc))) if proc.is_function() => {}
            Some(other) => {
                let name = match &other {
                    Operand::Object(obj) => obj.name(),
                    operand => self.expr.operand_value(operand).to_string(),
                };
                return Err(QuarryError::InvalidArgument(format!("invalid function: <{}>", name)));
            }
        }
        let unbound = operand.is_none();
        let code = self.emit(Operator::Call, operand, nargs);
        for _ in 0..nargs + unbound as usize {
            self.pop(Operator::Call)?;
        }
        self.put(ValueKind::Void, Domain::Void, code);
        self.expr.cacheable = false;
        Ok(())
    }

    /// Folds `-constant` in place; anything else emits MINUS.
    fn append_unary_minus(&mut self) -> Result<()> {
        let entry = self.pop(Operator::Minus)?;
        let folded = match self.producer(&entry) {
            Some(Instruction { op: Operator::Push, value: Some(Operand::Const(id)), .. }) => {
                let id = *id;
                let negated = match self.expr.heap.consts.get(id) {
                    Value::Int32(v) => Some(match v.checked_neg() {
                        Some(n) => Value::Int32(n),
                        None => Value::Int64(-(*v as i64)),
                    }),
                    Value::UInt32(v) if *v > 0x8000_0000 => Some(Value::Int64(-(*v as i64))),
                    Value::UInt32(v) => Some(Value::Int32((*v as i32).wrapping_neg())),
                    Value::Int64(v) => Some(Value::Int64(v.wrapping_neg())),
                    Value::Float(f) => Some(Value::Float(-f)),
                    _ => None,
                };
                negated.map(|value| (id, value))
            }
            _ => None,
        };
        match folded {
            Some((id, value)) => {
                let domain = value.domain();
                self.expr.heap.consts.set(id, value);
                self.put(entry.kind, domain, entry.code);
            }
            None => {
                let code = self.emit(Operator::Minus, None, 1);
                self.put(entry.kind, entry.domain, code);
            }
        }
        Ok(())
    }

    fn append_get_value(&mut self, operand: Option<Operand>, nargs: usize) -> Result<()> {
        match operand {
            Some(operand) => {
                let vdomain = if nargs == 1 {
                    self.expr.heap.record_domain()
                } else {
                    self.pop(Operator::GetValue)?.domain
                };
                let (operand, domain) = match self.resolve_column(vdomain, &operand)? {
                    Some(column) => {
                        let range = column.range;
                        (Operand::Object(Object::Column(column)), range)
                    }
                    None => {
                        let domain = self.range_of(&operand);
                        (operand, domain)
                    }
                };
                let code = self.emit(Operator::GetValue, Some(operand), nargs);
                self.put(ValueKind::Bulk, domain, code);
            }
            None => {
                let column = self.pop(Operator::GetValue)?;
                let vdomain = if nargs == 1 {
                    self.expr.heap.record_domain()
                } else {
                    self.pop(Operator::GetValue)?.domain
                };
                let pushed = column
                    .code
                    .filter(|c| self.expr.code.get(*c).map(|i| i.op) == Some(Operator::Push));
                match pushed {
                    Some(producer) => {
                        let value = self.expr.code[producer].value.clone();
                        let mut domain = Domain::Void;
                        let mut resolved = value.clone();
                        if let Some(value) = &value {
                            domain = self.range_of(value);
                            if let Some(column) = self.resolve_column(vdomain, value)? {
                                domain = column.range;
                                resolved = Some(Operand::Object(Object::Column(column)));
                            }
                        }
                        let instr = &mut self.expr.code[producer];
                        instr.op = Operator::GetValue;
                        instr.nargs = nargs;
                        instr.value = resolved;
                        self.put(ValueKind::Bulk, domain, Some(producer));
                    }
                    None => {
                        let code = self.emit(Operator::GetValue, None, nargs);
                        self.put(ValueKind::Bulk, Domain::Void, code);
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves a constant column name against the table of a record domain.
    fn resolve_column(&mut self, vdomain: Domain, operand: &Operand) -> Result<Option<Arc<Column>>> {
        let (Some(table), Operand::Const(id)) = (vdomain.table(), operand) else {
            return Ok(None);
        };
        let Some(name) = self.expr.heap.consts.get(*id).as_bytes() else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(name).into_owned();
        let column = self.storage.lookup_column(table, &name)?;
        if let Some(column) = &column {
            self.expr.heap.keep_column(column);
        }
        Ok(column)
    }

    /// GET_VALUE → GET_REF on the producer, and taint tracking for persistent targets.
    fn make_reference(&mut self, entry: &DfiEntry) {
        let Some(producer) = entry.code.and_then(|c| self.expr.code.get_mut(c)) else {
            return;
        };
        if producer.op == Operator::GetValue {
            producer.op = Operator::GetRef;
        }
        let persistent = matches!(
            &producer.value,
            Some(Operand::Object(Object::Column(column))) if column.is_persistent()
        );
        if persistent {
            self.expr.cacheable = false;
            self.expr.taintable = true;
        }
    }

    /// Re-casts the constant side of an EQUAL to the other side's scalar domain.
    fn recast_equal(&mut self, x: &Side, y: &Side) {
        let (constant, other) = match (x.constant, y.constant) {
            (true, false) => (x, y),
            (false, true) => (y, x),
            _ => return,
        };
        let Some(Operand::Const(id)) = &constant.operand else {
            return;
        };
        let id = *id;
        let to = other.domain;
        if to == constant.domain || !to.is_scalar() {
            return;
        }
        let original = self.expr.heap.consts.get(id).clone();
        if let Ok(cast) = original.cast(to) {
            let lossless = cast.cast(original.domain()).map(|back| back == original).unwrap_or(false);
            if !lossless {
                warn!(from = %original, to = %to, "lossy constant cast in EQUAL");
            }
            self.expr.heap.consts.set(id, cast);
        }
    }

    fn side_of_operand(&self, operand: &Operand) -> Side {
        Side {
            operand: Some(operand.clone()),
            domain: self.shape(operand).1,
            constant: matches!(operand, Operand::Const(_)),
        }
    }

    fn side_of_entry(&self, entry: &DfiEntry) -> Side {
        let producer = self.producer(entry);
        let operand = producer.and_then(|i| i.value.clone());
        let constant = matches!(
            producer,
            Some(Instruction { op: Operator::Push, value: Some(Operand::Const(_)), .. })
        );
        Side { operand, domain: entry.domain, constant }
    }

    fn producer(&self, entry: &DfiEntry) -> Option<&Instruction> {
        entry.code.and_then(|c| self.expr.code.get(c))
    }

    fn shape(&self, operand: &Operand) -> (ValueKind, Domain) {
        match operand {
            Operand::Object(Object::Column(column)) => (ValueKind::Object, column.range),
            Operand::Object(_) => (ValueKind::Object, Domain::Void),
            other => {
                let value = self.expr.heap.operand_value(other);
                (value.kind(), value.domain())
            }
        }
    }

    fn range_of(&self, operand: &Operand) -> Domain {
        match operand {
            Operand::Object(Object::Column(column)) => column.range,
            _ => Domain::Void,
        }
    }

    fn emit(&mut self, op: Operator, value: Option<Operand>, nargs: usize) -> Option<usize> {
        self.expr.code.push(Instruction::new(op, nargs, value));
        Some(self.expr.code.len() - 1)
    }

    fn put(&mut self, kind: ValueKind, domain: Domain, code: Option<usize>) {
        self.expr.dfi.push(kind, domain, code, &mut self.expr.code);
    }

    fn pop(&mut self, op: Operator) -> Result<DfiEntry> {
        self.expr
            .dfi
            .pop()
            .ok_or_else(|| QuarryError::SyntaxError(format!("stack under flow in {}", op)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{FunctionRegistry, ProcContext, Procedure};
    use crate::memstore::MemoryStore;
    use crate::schema::TableSchemaBuilder;
    use crate::types::TableId;

    fn store() -> (MemoryStore, TableId) {
        let store = MemoryStore::new();
        let schema = TableSchemaBuilder::new("docs")
            .key(Domain::ShortText)
            .column("size", Domain::Int32)
            .column("title", Domain::Text)
            .build();
        let table = store.create_table(&schema).unwrap();
        (store, table)
    }

    fn folded(value: Value) -> (Value, usize) {
        let (store, _) = store();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant(value, Operator::Push, 1).unwrap();
        c.append_operator(Operator::Minus, 1).unwrap();
        (expr.constant(0).clone(), expr.len())
    }

    #[test]
    fn test_push_requires_operand_and_pop_rejects_one() {
        let (store, _) = store();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        assert!(matches!(c.append_operator(Operator::Push, 1), Err(QuarryError::InvalidArgument(_))));
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        let err = c.append_operand(Some(Operand::Const(0)), Operator::Pop, 1).unwrap_err();
        assert!(matches!(err, QuarryError::InvalidArgument(_)));
    }

    #[test]
    fn test_code_capacity() {
        let (store, _) = store();
        let mut expr = Expression::with_config(&crate::config::EngineConfig::default().with_code_capacity(1));
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        let err = c.append_constant_int(2, Operator::Push, 1).unwrap_err();
        assert_eq!(err, QuarryError::CapacityExceeded("stack is full".to_string()));
    }

    #[test]
    fn test_unary_minus_folds_constants() {
        assert_eq!(folded(Value::Int32(5)), (Value::Int32(-5), 1));
        assert_eq!(folded(Value::Int32(i32::MIN)), (Value::Int64(2_147_483_648), 1));
        assert_eq!(folded(Value::UInt32(0x8000_0001)), (Value::Int64(-2_147_483_649), 1));
        assert_eq!(folded(Value::UInt32(0x8000_0000)), (Value::Int32(i32::MIN), 1));
        assert_eq!(folded(Value::UInt32(7)), (Value::Int32(-7), 1));
        assert_eq!(folded(Value::Float(1.5)), (Value::Float(-1.5), 1));
        assert_eq!(folded(Value::text("x")), (Value::text("x"), 2));
    }

    #[test]
    fn test_relational_flags_and_underflow() {
        let (store, _) = store();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        c.append_constant_int(0, Operator::Push, 1).unwrap();
        c.append_operator(Operator::And, 2).unwrap();
        assert_eq!(expr.dfi_depth(), 1);
        assert!(expr.code()[0].flags.contains(InstrFlags::RELATIONAL));
        assert!(expr.code()[1].flags.contains(InstrFlags::RELATIONAL));

        let mut c = Compiler::new(&mut expr, &store);
        let err = c.append_operator(Operator::Or, 2).unwrap_err();
        assert_eq!(err, QuarryError::SyntaxError("stack under flow in relative op".to_string()));
    }

    #[test]
    fn test_comparison_underflow_is_syntax_error() {
        let (store, _) = store();
        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        assert!(matches!(c.append_operator(Operator::Less, 2), Err(QuarryError::SyntaxError(_))));
    }

    #[test]
    fn test_get_value_resolves_and_equal_recasts() {
        let (store, table) = store();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_constant_str("10", Operator::Push, 1).unwrap();
        c.append_operator(Operator::Equal, 2).unwrap();
        assert_eq!(expr.len(), 3);
        assert!(matches!(
            &expr.code()[0].value,
            Some(Operand::Object(Object::Column(col))) if col.name == "size"
        ));
        assert_eq!(expr.constant(1), &Value::Int32(10));
        assert_eq!(expr.resolved_columns().len(), 1);
        assert_eq!(expr.dfi_depth(), 1);
    }

    #[test]
    fn test_push_then_get_value_is_rewritten() {
        let (store, table) = store();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("title", Operator::Push, 1).unwrap();
        c.append_operator(Operator::GetValue, 1).unwrap();
        assert_eq!(expr.len(), 1);
        assert_eq!(expr.code()[0].op, Operator::GetValue);
        assert!(matches!(&expr.code()[0].value, Some(Operand::Object(Object::Column(_)))));
    }

    #[test]
    fn test_assign_to_column_taints() {
        let (store, table) = store();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_constant_int(3, Operator::Push, 1).unwrap();
        c.append_operator(Operator::PlusAssign, 2).unwrap();
        assert_eq!(expr.code()[0].op, Operator::GetRef);
        assert!(!expr.is_cacheable());
        assert!(expr.is_taintable());
    }

    #[test]
    fn test_call_checks_callee() {
        struct Command;
        impl Procedure for Command {
            fn is_function(&self) -> bool {
                false
            }
            fn next(&self, _ctx: &mut ProcContext<'_>, _args: &[Value]) -> Option<Result<Value>> {
                None
            }
        }
        let (store, _) = store();
        let mut reg = FunctionRegistry::with_builtins();
        reg.register("command", Command);

        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_int(1, Operator::Push, 1).unwrap();
        let err = c.append_operator(Operator::Call, 0).unwrap_err();
        assert_eq!(err, QuarryError::InvalidArgument("invalid function: <1>".to_string()));

        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        let command = reg.get("command").cloned().unwrap();
        c.append_object(Object::Procedure(command), Operator::Push, 1).unwrap();
        assert!(c.append_operator(Operator::Call, 0).is_err());

        let mut expr = Expression::new();
        let mut c = Compiler::new(&mut expr, &store);
        let upper = reg.get("upper").cloned().unwrap();
        c.append_object(Object::Procedure(upper), Operator::Push, 1).unwrap();
        c.append_constant_str("a", Operator::Push, 1).unwrap();
        c.append_operator(Operator::Call, 1).unwrap();
        assert!(!expr.is_cacheable());
        assert_eq!(expr.dfi_depth(), 1);
    }
}
