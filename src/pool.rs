//! Fixed-capacity arenas owned by an expression: the scratch value pool and the constants arena.
//!
//! Neither arena grows past its capacity; allocation past the end is a `CapacityExceeded` error.

use crate::types::Value;
use crate::{QuarryError, Result};

pub type ConstId = usize;

static VOID: Value = Value::Void;

/// Bump-allocated scratch cells used as VM working registers.
///
/// Cells are reused after `rewind` without being cleared, so a freshly allocated cell is always
/// overwritten by `alloc` before it is read.
#[derive(Debug)]
pub struct ValuePool {
    cells: Vec<Value>,
    capacity: usize,
    cursor: usize,
    high_water: usize,
}

impl ValuePool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { cells: Vec::new(), capacity, cursor: 0, high_water: 0 }
    }

    pub fn alloc(&mut self, value: Value) -> Result<usize> {
        if self.cursor >= self.capacity {
            return Err(QuarryError::CapacityExceeded(format!(
                "value pool is full ({} cells)",
                self.capacity
            )));
        }
        let index = self.cursor;
        if index < self.cells.len() {
            self.cells[index] = value;
        } else {
            self.cells.push(value);
        }
        self.cursor += 1;
        self.high_water = self.high_water.max(self.cursor);
        Ok(index)
    }

    pub fn get(&self, index: usize) -> &Value {
        self.cells.get(index).unwrap_or(&VOID)
    }

    pub fn take(&mut self, index: usize) -> Value {
        self.cells.get_mut(index).map(std::mem::take).unwrap_or_default()
    }

    /// Returns the topmost cell to the pool; releasing any other cell is a no-op.
    pub fn release(&mut self, index: usize) {
        if index + 1 == self.cursor {
            self.cursor -= 1;
        }
    }

    pub fn mark(&self) -> usize {
        self.cursor
    }

    pub fn rewind(&mut self, mark: usize) {
        self.cursor = self.cursor.min(mark);
    }

    pub fn in_use(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest number of cells ever live at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

#[derive(Debug, Clone)]
pub struct ConstArena {
    values: Vec<Value>,
    capacity: usize,
}

impl ConstArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { values: Vec::new(), capacity }
    }

    pub fn push(&mut self, value: Value) -> Result<ConstId> {
        if self.values.len() >= self.capacity {
            return Err(QuarryError::CapacityExceeded("too many constants".to_string()));
        }
        self.values.push(value);
        Ok(self.values.len() - 1)
    }

    pub fn get(&self, id: ConstId) -> &Value {
        self.values.get(id).unwrap_or(&VOID)
    }

    /// Replaces a constant in place; only the compiler folds or re-casts constants.
    pub(crate) fn set(&mut self, id: ConstId, value: Value) {
        if let Some(slot) = self.values.get_mut(id) {
            *slot = value;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}
