//! Expression: the compiled bundle of bytecode, constants, variables and scratch pool.
//!
//! An expression is created empty, built by the `Compiler`, then executed any number of times by
//! the VM or the scan planner. After the build phase only variable bindings change.

use crate::config::EngineConfig;
use crate::dfi::DataFlowTracker;
use crate::ir::{Instruction, Operand, VarId};
use crate::pool::{ConstArena, ConstId, ValuePool};
use crate::schema::Column;
use crate::types::{Domain, Object, TableId, Value};
use crate::{QuarryError, Result};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Value,
}

/// The parts of an expression the VM mutates while the bytecode is borrowed.
#[derive(Debug)]
pub struct ExprHeap {
    pub(crate) consts: ConstArena,
    pub(crate) vars: Vec<Variable>,
    pub(crate) var_capacity: usize,
    pub(crate) pool: ValuePool,
    /// Columns resolved by name, kept alive until the expression is dropped
    pub(crate) objs: Vec<Arc<Column>>,
}

impl ExprHeap {
    pub(crate) fn operand_value(&self, operand: &Operand) -> Value {
        match operand {
            Operand::Const(id) => self.consts.get(*id).clone(),
            Operand::Var(id) => self.vars.get(*id).map(|v| v.value.clone()).unwrap_or_default(),
            Operand::Object(obj) => Value::Object(obj.clone()),
        }
    }

    /// Domain of the current-record variable.
    pub(crate) fn record_domain(&self) -> Domain {
        self.vars.first().map(|v| v.value.domain()).unwrap_or(Domain::Void)
    }

    pub(crate) fn keep_column(&mut self, column: &Arc<Column>) {
        if !self.objs.iter().any(|c| Arc::ptr_eq(c, column)) {
            self.objs.push(Arc::clone(column));
        }
    }

    pub(crate) fn cached_column(&self, table: TableId, name: &str) -> Option<Arc<Column>> {
        self.objs
            .iter()
            .find(|c| c.table == table && c.name == name)
            .cloned()
    }
}

#[derive(Debug)]
pub struct Expression {
    pub(crate) code: Vec<Instruction>,
    pub(crate) code_capacity: usize,
    pub(crate) heap: ExprHeap,
    pub(crate) dfi: DataFlowTracker,
    pub(crate) cacheable: bool,
    pub(crate) taintable: bool,
}

impl Default for Expression {
    fn default() -> Self {
        Self::new()
    }
}

impl Expression {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            code: Vec::new(),
            code_capacity: config.code_capacity,
            heap: ExprHeap {
                consts: ConstArena::with_capacity(config.const_capacity),
                vars: Vec::new(),
                var_capacity: config.var_capacity,
                pool: ValuePool::with_capacity(config.pool_capacity),
                objs: Vec::new(),
            },
            dfi: DataFlowTracker::new(),
            cacheable: true,
            taintable: false,
        }
    }

    /// Creates an expression whose variable 0 is a record placeholder of `table`.
    pub fn for_table(table: TableId) -> Result<Self> {
        Self::for_table_with_config(table, &EngineConfig::default())
    }

    pub fn for_table_with_config(table: TableId, config: &EngineConfig) -> Result<Self> {
        let mut expr = Self::with_config(config);
        let var = expr.add_var(None)?;
        expr.set_var(var, Value::Record { table, id: 0 })?;
        Ok(expr)
    }

    /// Adds a variable; unnamed variables are called `$N` (1-based).
    pub fn add_var(&mut self, name: Option<&str>) -> Result<VarId> {
        if self.heap.vars.len() >= self.heap.var_capacity {
            return Err(QuarryError::CapacityExceeded("too many variables".to_string()));
        }
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("${}", self.heap.vars.len() + 1),
        };
        self.heap.vars.push(Variable { name, value: Value::Void });
        Ok(self.heap.vars.len() - 1)
    }

    pub fn var(&self, name: &str) -> Option<VarId> {
        self.heap.vars.iter().position(|v| v.name == name)
    }

    pub fn var_value(&self, id: VarId) -> Option<&Value> {
        self.heap.vars.get(id).map(|v| &v.value)
    }

    pub fn var_name(&self, id: VarId) -> Option<&str> {
        self.heap.vars.get(id).map(|v| v.name.as_str())
    }

    pub fn set_var(&mut self, id: VarId, value: Value) -> Result<()> {
        let var = self
            .heap
            .vars
            .get_mut(id)
            .ok_or_else(|| QuarryError::InvalidArgument(format!("no such variable: {}", id)))?;
        var.value = value;
        Ok(())
    }

    pub fn nvars(&self) -> usize {
        self.heap.vars.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.heap.vars
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code_capacity(&self) -> usize {
        self.code_capacity
    }

    pub fn constant(&self, id: ConstId) -> &Value {
        self.heap.consts.get(id)
    }

    pub fn constants(&self) -> &ConstArena {
        &self.heap.consts
    }

    pub fn pool(&self) -> &ValuePool {
        &self.heap.pool
    }

    /// Value an instruction operand currently refers to.
    pub fn operand_value(&self, operand: &Operand) -> Value {
        self.heap.operand_value(operand)
    }

    /// False once the expression calls a function or mutates persistent state.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// True once the expression writes to persistent state.
    pub fn is_taintable(&self) -> bool {
        self.taintable
    }

    pub fn resolved_columns(&self) -> &[Arc<Column>] {
        &self.heap.objs
    }

    /// Depth of the compile-time data-flow stack.
    pub fn dfi_depth(&self) -> usize {
        self.dfi.depth()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<expr")?;
        write!(f, " vars:{{")?;
        for (i, var) in self.heap.vars.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", var.name, var.value)?;
        }
        write!(f, "}} codes:{{")?;
        for (i, code) in self.code.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:<{} n_args:{}, flags:{}, modify:{}", i, code.op, code.nargs, code.flags.bits(), code.modify)?;
            match &code.value {
                Some(Operand::Var(id)) => {
                    let name = self.var_name(*id).unwrap_or("?");
                    write!(f, ", value:{}", name)?;
                }
                Some(Operand::Object(Object::Column(column))) => write!(f, ", value:column({})", column.name)?,
                Some(operand) => write!(f, ", value:{}", self.operand_value(operand))?,
                None => {}
            }
            write!(f, ">")?;
        }
        write!(f, "}}>")
    }
}
