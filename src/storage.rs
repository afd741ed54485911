//! Storage contract the engine calls into, and the result sets both the planner and the
//! brute-force path populate.

use crate::ir::{LogicalOp, Operator};
use crate::schema::{Column, ColumnId, Index};
use crate::types::{RecordId, TableId, Value};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// How `set_value` combines the new value with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Set,
    Incr,
    Decr,
}

/// Something an index probe can be issued against.
#[derive(Debug, Clone)]
pub enum IndexTarget {
    /// `_id` / `_key` accessor resolved through the table itself
    Accessor(Arc<Column>),
    /// Inverted index section over stored columns
    Inverted(Arc<Index>),
}

impl IndexTarget {
    pub fn same_index(&self, other: &IndexTarget) -> bool {
        match (self, other) {
            (IndexTarget::Accessor(a), IndexTarget::Accessor(b)) => a.id == b.id,
            (IndexTarget::Inverted(a), IndexTarget::Inverted(b)) => a.id == b.id,
            _ => false,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            IndexTarget::Accessor(column) => &column.name,
            IndexTarget::Inverted(index) => &index.name,
        }
    }
}

/// A single index lookup: the relational operator, the key, and per-section weights.
/// Empty `sections` means every section with weight 1.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub op: Operator,
    pub key: &'a Value,
    pub sections: &'a [(u32, i32)],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreEntry {
    pub score: i64,
    marked: bool,
}

/// Hash-keyed set of record ids with accumulated scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    table: TableId,
    records: HashMap<RecordId, ScoreEntry>,
}

impl ResultSet {
    pub fn new(table: TableId) -> Self {
        Self { table, records: HashMap::new() }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn score(&self, id: RecordId) -> Option<i64> {
        self.records.get(&id).map(|e| e.score)
    }

    /// Record ids in ascending order.
    pub fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<_> = self.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// (id, score) pairs in ascending id order.
    pub fn scores(&self) -> Vec<(RecordId, i64)> {
        let mut scores: Vec<_> = self.records.iter().map(|(id, e)| (*id, e.score)).collect();
        scores.sort_unstable();
        scores
    }

    /// Applies one match under `op`. AND only marks the record; call `resolve_and` once the
    /// leaf is finished to drop unmarked records.
    pub fn add(&mut self, id: RecordId, score: i64, op: LogicalOp) {
        match op {
            LogicalOp::Or => {
                self.records.entry(id).or_default().score += score;
            }
            LogicalOp::And => {
                if let Some(entry) = self.records.get_mut(&id) {
                    entry.score += score;
                    entry.marked = true;
                }
            }
            LogicalOp::But => {
                self.records.remove(&id);
            }
            LogicalOp::Adjust => {
                if let Some(entry) = self.records.get_mut(&id) {
                    entry.score += score;
                }
            }
        }
    }

    pub fn remove(&mut self, id: RecordId) -> bool {
        self.records.remove(&id).is_some()
    }

    pub fn resolve_and(&mut self, op: LogicalOp) {
        if op == LogicalOp::And {
            self.records.retain(|_, e| e.marked);
            for entry in self.records.values_mut() {
                entry.marked = false;
            }
        }
    }

    /// Folds `other` into `self` under `op`.
    pub fn merge(&mut self, other: &ResultSet, op: LogicalOp) {
        match op {
            LogicalOp::Or => {
                for (id, entry) in &other.records {
                    self.records.entry(*id).or_default().score += entry.score;
                }
            }
            LogicalOp::And => {
                self.records.retain(|id, _| other.records.contains_key(id));
                for (id, entry) in self.records.iter_mut() {
                    if let Some(o) = other.records.get(id) {
                        entry.score += o.score;
                    }
                }
            }
            LogicalOp::But => {
                for id in other.records.keys() {
                    self.records.remove(id);
                }
            }
            LogicalOp::Adjust => {
                for (id, entry) in &other.records {
                    if let Some(mine) = self.records.get_mut(id) {
                        mine.score += entry.score;
                    }
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, i64)> + '_ {
        self.records.iter().map(|(id, e)| (*id, e.score))
    }
}

/// Synchronous storage collaborator. Errors propagate through the engine unchanged.
pub trait Storage {
    fn lookup_column(&self, table: TableId, name: &str) -> Result<Option<Arc<Column>>>;
    fn column_by_id(&self, id: ColumnId) -> Option<Arc<Column>>;
    fn get_value(&self, column: &Column, record: RecordId) -> Result<Value>;
    fn set_value(&self, column: &Column, record: RecordId, value: &Value, mode: SetMode) -> Result<()>;
    /// Index usable for `op` on `column`, with the section number the column occupies.
    fn column_index(&self, column: &Column, op: Operator) -> Option<(IndexTarget, u32)>;
    fn index_probe(&self, target: &IndexTarget, probe: &Probe<'_>, into: &mut ResultSet, op: LogicalOp) -> Result<()>;
    fn create_result_set(&self, table: TableId) -> ResultSet {
        ResultSet::new(table)
    }
    /// Searches the table's own key (EQUAL or PREFIX).
    fn table_search(&self, table: TableId, key: &Value, op: Operator, into: &mut ResultSet, combine: LogicalOp) -> Result<()>;
    fn table_get(&self, table: TableId, key: &Value) -> Result<Option<RecordId>>;
    fn record_exists(&self, table: TableId, id: RecordId) -> bool;
    /// Live record ids in ascending order.
    fn table_iterate(&self, table: TableId) -> Result<Vec<RecordId>>;
}
