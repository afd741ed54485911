//! Context module: the per-session operand stack the VM, planner and procedures share.
//!
//! A `VmContext` is created once per session and threaded by `&mut` through every entry point.
//! Each execution pushes a `Frame`; slots below the innermost frame's base belong to a caller and
//! are never popped by the callee.

use crate::config::EngineConfig;
use crate::expression::ExprHeap;
use crate::ir::VarId;
use crate::pool::ConstId;
use crate::types::Value;
use crate::{QuarryError, Result};

/// Operand-stack entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Const(ConstId),
    Var(VarId),
    /// Cell of the executing expression's value pool
    Scratch(usize),
    Value(Value),
}

impl Slot {
    pub(crate) fn value<'h>(&'h self, heap: &'h ExprHeap) -> &'h Value {
        static VOID: Value = Value::Void;
        match self {
            Slot::Const(id) => heap.consts.get(*id),
            Slot::Var(id) => heap.vars.get(*id).map(|v| &v.value).unwrap_or(&VOID),
            Slot::Scratch(index) => heap.pool.get(*index),
            Slot::Value(value) => value,
        }
    }
}

/// Saved stack base and pool mark around one execution or procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub stack_base: usize,
    pub pool_mark: usize,
}

#[derive(Debug)]
pub struct VmContext {
    stack: Vec<Slot>,
    capacity: usize,
    frames: Vec<Frame>,
    allow_updates: bool,
}

impl Default for VmContext {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl VmContext {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            stack: Vec::with_capacity(config.stack_capacity.min(64)),
            capacity: config.stack_capacity,
            frames: Vec::new(),
            allow_updates: config.allow_updates,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allow_updates(&self) -> bool {
        self.allow_updates
    }

    pub fn set_allow_updates(&mut self, allow: bool) {
        self.allow_updates = allow;
    }

    /// Base of the innermost frame; nothing below it may be popped.
    pub fn base(&self) -> usize {
        self.frames.last().map(|f| f.stack_base).unwrap_or(0)
    }

    /// Pushes an owned value, e.g. an argument for a following `execute`.
    pub fn push(&mut self, value: Value) -> Result<()> {
        self.push_slot(Slot::Value(value))
    }

    /// Pops an owned value above the current frame. Returns `None` when the top belongs to a
    /// caller or refers into an expression.
    pub fn pop(&mut self) -> Option<Value> {
        if self.stack.len() <= self.base() {
            return None;
        }
        if !matches!(self.stack.last(), Some(Slot::Value(_))) {
            return None;
        }
        match self.stack.pop() {
            Some(Slot::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Owned value on top of the stack, if any.
    pub fn peek(&self) -> Option<&Value> {
        match self.stack.last() {
            Some(Slot::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn push_slot(&mut self, slot: Slot) -> Result<()> {
        if self.stack.len() >= self.capacity {
            return Err(QuarryError::CapacityExceeded("stack is full".to_string()));
        }
        self.stack.push(slot);
        Ok(())
    }

    pub(crate) fn pop_slot(&mut self) -> Result<Slot> {
        if self.stack.len() <= self.base() {
            return Err(QuarryError::InvalidArgument("stack underflow".to_string()));
        }
        self.stack
            .pop()
            .ok_or_else(|| QuarryError::InvalidArgument("stack underflow".to_string()))
    }

    pub(crate) fn top_slot(&self) -> Option<&Slot> {
        if self.stack.len() <= self.base() {
            return None;
        }
        self.stack.last()
    }

    /// Slot `n` positions below the top (0 is the top), within the current frame.
    pub(crate) fn slot_from_top(&self, n: usize) -> Option<&Slot> {
        let index = self.stack.len().checked_sub(n + 1)?;
        if index < self.base() {
            return None;
        }
        self.stack.get(index)
    }

    /// Opens a frame whose base sits `nargs` slots below the current top.
    pub(crate) fn save(&mut self, nargs: usize, pool_mark: usize) -> Result<Frame> {
        let depth = self.stack.len();
        if nargs > depth - self.base() {
            return Err(QuarryError::InvalidArgument("stack underflow".to_string()));
        }
        let frame = Frame { stack_base: depth - nargs, pool_mark };
        self.frames.push(frame);
        Ok(frame)
    }

    /// Drops everything above the frame's base and closes the frame.
    pub(crate) fn restore(&mut self, frame: Frame) {
        self.stack.truncate(frame.stack_base);
        if let Some(pos) = self.frames.iter().rposition(|f| *f == frame) {
            self.frames.truncate(pos);
        }
    }
}
