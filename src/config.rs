//! Engine configuration: arena capacities, update permission and planner switches.

use serde::{Deserialize, Serialize};

/// Default capacity of every fixed-size arena and of the operand stack.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of instructions per expression.
    pub code_capacity: usize,
    /// Scratch cells in each expression's value pool.
    pub pool_capacity: usize,
    pub const_capacity: usize,
    pub var_capacity: usize,
    /// Operand stack depth of a `VmContext`.
    pub stack_capacity: usize,
    /// When false, every operator that writes to storage fails with `PermissionDenied`.
    pub allow_updates: bool,
    /// Enables the scan planner in `table_select`.
    pub planning: bool,
    /// Lets planned leaves probe indexes instead of evaluating per record.
    pub use_indexes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            code_capacity: DEFAULT_CAPACITY,
            pool_capacity: DEFAULT_CAPACITY,
            const_capacity: DEFAULT_CAPACITY,
            var_capacity: DEFAULT_CAPACITY,
            stack_capacity: DEFAULT_CAPACITY,
            allow_updates: true,
            planning: true,
            use_indexes: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_code_capacity(mut self, capacity: usize) -> Self {
        self.code_capacity = capacity;
        self
    }
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
    pub fn with_const_capacity(mut self, capacity: usize) -> Self {
        self.const_capacity = capacity;
        self
    }
    pub fn with_var_capacity(mut self, capacity: usize) -> Self {
        self.var_capacity = capacity;
        self
    }
    pub fn with_stack_capacity(mut self, capacity: usize) -> Self {
        self.stack_capacity = capacity;
        self
    }
    pub fn with_allow_updates(mut self, allow: bool) -> Self {
        self.allow_updates = allow;
        self
    }
    pub fn with_planning(mut self, planning: bool) -> Self {
        self.planning = planning;
        self
    }
    pub fn with_use_indexes(mut self, use_indexes: bool) -> Self {
        self.use_indexes = use_indexes;
        self
    }
}
