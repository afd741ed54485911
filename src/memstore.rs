//! In-memory table store implementing the `Storage` contract.
//!
//! Tables are created from a `TableSchema`. Every table exposes the `_id` and `_key` accessor
//! columns besides its stored columns. Inverted indexes keep one posting map per section and are
//! maintained on every write, including the default value a new record starts with.

use crate::arith;
use crate::ir::{LogicalOp, Operator};
use crate::schema::{Column, ColumnId, ColumnKind, Index, IndexId, TableSchema, ID_ACCESSOR, KEY_ACCESSOR};
use crate::storage::{IndexTarget, Probe, ResultSet, SetMode, Storage};
use crate::types::{Domain, RecordId, TableId, Value, FIRST_TABLE_ID};
use crate::{QuarryError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Postings = BTreeMap<Vec<u8>, BTreeSet<RecordId>>;

#[derive(Debug)]
struct TableData {
    name: String,
    key: Option<Domain>,
    columns: Vec<Arc<Column>>,
    indexes: Vec<Arc<Index>>,
    keys: BTreeMap<Vec<u8>, RecordId>,
    /// Live records and their keys
    records: BTreeMap<RecordId, Value>,
    next_id: RecordId,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: Vec<TableData>,
    columns: Vec<Arc<Column>>,
    values: HashMap<(ColumnId, RecordId), Value>,
    /// One posting map per index section
    postings: HashMap<IndexId, Vec<Postings>>,
    next_index: IndexId,
}

impl StoreInner {
    fn table(&self, table: TableId) -> Result<&TableData> {
        table
            .checked_sub(FIRST_TABLE_ID)
            .and_then(|i| self.tables.get(i as usize))
            .ok_or_else(|| QuarryError::StorageError(format!("no such table: {}", table)))
    }

    fn table_mut(&mut self, table: TableId) -> Result<&mut TableData> {
        table
            .checked_sub(FIRST_TABLE_ID)
            .and_then(|i| self.tables.get_mut(i as usize))
            .ok_or_else(|| QuarryError::StorageError(format!("no such table: {}", table)))
    }

    fn stored_value(&self, column: &Column, record: RecordId) -> Value {
        self.values
            .get(&(column.id, record))
            .cloned()
            .unwrap_or_else(|| Value::default_for(column.range))
    }

    /// Moves `record` from the postings of `old` to those of `new` in every covering index.
    fn reindex(&mut self, column: &Column, record: RecordId, old: Option<&Value>, new: &Value) -> Result<()> {
        let indexes: Vec<(IndexId, usize)> = self
            .table(column.table)?
            .indexes
            .iter()
            .filter_map(|index| index.section_of(column.id).map(|s| (index.id, s as usize - 1)))
            .collect();
        for (index, section) in indexes {
            let Some(postings) = self.postings.get_mut(&index).and_then(|p| p.get_mut(section)) else {
                continue;
            };
            if let Some(old) = old {
                for key in index_keys(old) {
                    if let Some(ids) = postings.get_mut(&key) {
                        ids.remove(&record);
                        if ids.is_empty() {
                            postings.remove(&key);
                        }
                    }
                }
            }
            for key in index_keys(new) {
                postings.entry(key).or_default().insert(record);
            }
        }
        Ok(())
    }
}

fn index_keys(value: &Value) -> Vec<Vec<u8>> {
    match value {
        Value::Vector { items, .. } => items.iter().map(Value::key_bytes).collect(),
        other => vec![other.key_bytes()],
    }
}

fn poisoned() -> QuarryError {
    QuarryError::StorageError("store lock poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreInner>> {
        self.inner.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>> {
        self.inner.write().map_err(|_| poisoned())
    }

    pub fn create_table(&self, schema: &TableSchema) -> Result<TableId> {
        let mut inner = self.write()?;
        if inner.tables.iter().any(|t| t.name == schema.name()) {
            return Err(QuarryError::InvalidArgument(format!("table already exists: {}", schema.name())));
        }
        let table = FIRST_TABLE_ID + inner.tables.len() as TableId;
        let mut columns = Vec::new();
        let accessors = [
            (ID_ACCESSOR, Domain::UInt32, ColumnKind::Id),
            (KEY_ACCESSOR, schema.key().unwrap_or(Domain::Void), ColumnKind::Key),
        ];
        let defs = schema.columns().iter().map(|c| (c.name.as_str(), c.range, ColumnKind::Stored));
        for (name, range, kind) in accessors.into_iter().chain(defs) {
            let column = Arc::new(Column {
                id: inner.columns.len() as ColumnId,
                table,
                name: name.to_string(),
                range,
                kind,
            });
            inner.columns.push(Arc::clone(&column));
            columns.push(column);
        }
        let mut indexes = Vec::new();
        for def in schema.indexes() {
            let sections = def
                .sections
                .iter()
                .map(|name| {
                    columns
                        .iter()
                        .find(|c| &c.name == name && !c.is_accessor())
                        .map(|c| c.id)
                        .ok_or_else(|| QuarryError::FieldNotFound(name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let id = inner.next_index;
            inner.next_index += 1;
            inner.postings.insert(id, vec![Postings::new(); sections.len()]);
            indexes.push(Arc::new(Index { id, name: def.name.clone(), table, sections }));
        }
        inner.tables.push(TableData {
            name: schema.name().to_string(),
            key: schema.key(),
            columns,
            indexes,
            keys: BTreeMap::new(),
            records: BTreeMap::new(),
            next_id: 1,
        });
        Ok(table)
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        let inner = self.read().ok()?;
        inner
            .tables
            .iter()
            .position(|t| t.name == name)
            .map(|i| FIRST_TABLE_ID + i as TableId)
    }

    pub fn column(&self, table: TableId, name: &str) -> Option<Arc<Column>> {
        let inner = self.read().ok()?;
        let data = inner.table(table).ok()?;
        data.columns.iter().find(|c| c.name == name).cloned()
    }

    /// Number of live records in a table.
    pub fn len(&self, table: TableId) -> usize {
        self.read()
            .ok()
            .and_then(|inner| inner.table(table).ok().map(|t| t.records.len()))
            .unwrap_or(0)
    }

    /// Adds a record; on a keyed table an existing key returns the existing record.
    pub fn add_record(&self, table: TableId, key: Value) -> Result<RecordId> {
        let mut inner = self.write()?;
        let data = inner.table_mut(table)?;
        let key = match data.key {
            Some(domain) => key.cast(domain)?,
            None => Value::Void,
        };
        if data.key.is_some() {
            if let Some(id) = data.keys.get(&key.key_bytes()) {
                return Ok(*id);
            }
        }
        let id = data.next_id;
        data.next_id += 1;
        if data.key.is_some() {
            data.keys.insert(key.key_bytes(), id);
        }
        data.records.insert(id, key);
        let indexed: Vec<Arc<Column>> = data
            .columns
            .iter()
            .filter(|c| !c.is_accessor() && data.indexes.iter().any(|i| i.section_of(c.id).is_some()))
            .cloned()
            .collect();
        for column in indexed {
            let default = Value::default_for(column.range);
            inner.reindex(&column, id, None, &default)?;
        }
        Ok(id)
    }

    /// Writes a column value by name.
    pub fn set(&self, table: TableId, record: RecordId, column: &str, value: Value) -> Result<()> {
        let column = self
            .column(table, column)
            .ok_or_else(|| QuarryError::FieldNotFound(column.to_string()))?;
        self.set_value(&column, record, &value, SetMode::Set)
    }

    pub fn get(&self, table: TableId, record: RecordId, column: &str) -> Result<Value> {
        let column = self
            .column(table, column)
            .ok_or_else(|| QuarryError::FieldNotFound(column.to_string()))?;
        self.get_value(&column, record)
    }
}

impl Storage for MemoryStore {
    fn lookup_column(&self, table: TableId, name: &str) -> Result<Option<Arc<Column>>> {
        let inner = self.read()?;
        Ok(inner
            .table(table)
            .ok()
            .and_then(|t| t.columns.iter().find(|c| c.name == name).cloned()))
    }

    fn column_by_id(&self, id: ColumnId) -> Option<Arc<Column>> {
        self.read().ok()?.columns.get(id as usize).cloned()
    }

    fn get_value(&self, column: &Column, record: RecordId) -> Result<Value> {
        let inner = self.read()?;
        let data = inner.table(column.table)?;
        let Some(key) = data.records.get(&record) else {
            return Ok(Value::default_for(column.range));
        };
        let value = match column.kind {
            ColumnKind::Id => Value::UInt32(record),
            ColumnKind::Key => key.clone(),
            ColumnKind::Stored => inner.stored_value(column, record),
        };
        Ok(value)
    }

    fn set_value(&self, column: &Column, record: RecordId, value: &Value, mode: SetMode) -> Result<()> {
        if column.is_accessor() {
            return Err(QuarryError::NotImplemented(format!("can't set accessor value: {}", column.name)));
        }
        let mut inner = self.write()?;
        if !inner.table(column.table)?.records.contains_key(&record) {
            return Err(QuarryError::InvalidArgument(format!("no such record: {}", record)));
        }
        let old = inner.stored_value(column, record);
        let new = match mode {
            SetMode::Set => value.cast(column.range)?,
            SetMode::Incr => arith::binary(Operator::Plus, &old, value)?.cast(column.range)?,
            SetMode::Decr => arith::binary(Operator::Minus, &old, value)?.cast(column.range)?,
        };
        inner.reindex(column, record, Some(&old), &new)?;
        inner.values.insert((column.id, record), new);
        Ok(())
    }

    fn column_index(&self, column: &Column, op: Operator) -> Option<(IndexTarget, u32)> {
        match (column.kind, op) {
            (ColumnKind::Id, Operator::Equal) | (ColumnKind::Key, Operator::Equal | Operator::Prefix) => {
                let inner = self.read().ok()?;
                let column = inner.columns.get(column.id as usize)?.clone();
                Some((IndexTarget::Accessor(column), 0))
            }
            (ColumnKind::Stored, Operator::Equal | Operator::Prefix | Operator::Match) => {
                let inner = self.read().ok()?;
                let data = inner.table(column.table).ok()?;
                data.indexes
                    .iter()
                    .find_map(|index| index.section_of(column.id).map(|s| (IndexTarget::Inverted(Arc::clone(index)), s)))
            }
            _ => None,
        }
    }

    fn index_probe(&self, target: &IndexTarget, probe: &Probe<'_>, into: &mut ResultSet, op: LogicalOp) -> Result<()> {
        let index = match target {
            IndexTarget::Accessor(column) => {
                return match column.kind {
                    ColumnKind::Id => {
                        let id = probe.key.cast(Domain::UInt32).ok().and_then(|v| v.as_i64());
                        if let Some(id) = id {
                            if self.record_exists(column.table, id as RecordId) {
                                into.add(id as RecordId, 1, op);
                            }
                        }
                        Ok(())
                    }
                    _ => self.table_search(column.table, probe.key, probe.op, into, op),
                };
            }
            IndexTarget::Inverted(index) => index,
        };
        let inner = self.read()?;
        let Some(postings) = inner.postings.get(&index.id) else {
            return Ok(());
        };
        let sections: Vec<(u32, i32)> = if probe.sections.is_empty() {
            (1..=index.sections.len() as u32).map(|s| (s, 1)).collect()
        } else {
            probe.sections.to_vec()
        };
        let mut scores: BTreeMap<RecordId, i64> = BTreeMap::new();
        for (section, weight) in sections {
            let Some(section_postings) = section.checked_sub(1).and_then(|s| postings.get(s as usize)) else {
                continue;
            };
            let range = index
                .sections
                .get(section as usize - 1)
                .and_then(|c| inner.columns.get(*c as usize))
                .map(|c| c.range)
                .unwrap_or(Domain::Void);
            let mut matched: BTreeSet<RecordId> = BTreeSet::new();
            match probe.op {
                Operator::Equal => {
                    if let Ok(key) = probe.key.cast(range) {
                        if let Some(ids) = section_postings.get(&key.key_bytes()) {
                            matched.extend(ids);
                        }
                    }
                }
                Operator::Prefix => {
                    let Some(prefix) = probe.key.as_bytes() else {
                        continue;
                    };
                    let lower = Bound::Included(prefix.to_vec());
                    for (key, ids) in section_postings.range((lower, Bound::Unbounded)) {
                        if !key.starts_with(prefix) {
                            break;
                        }
                        matched.extend(ids);
                    }
                }
                Operator::Match => {
                    for (key, ids) in section_postings {
                        let text = Value::Text(key.clone());
                        if range.is_text() && arith::match_text(&text, probe.key) {
                            matched.extend(ids);
                        }
                    }
                }
                other => {
                    return Err(QuarryError::NotImplemented(format!("{} is not supported by index {}", other, index.name)));
                }
            }
            for id in matched {
                *scores.entry(id).or_default() += weight as i64;
            }
        }
        for (id, score) in scores {
            into.add(id, score, op);
        }
        Ok(())
    }

    fn table_search(&self, table: TableId, key: &Value, op: Operator, into: &mut ResultSet, combine: LogicalOp) -> Result<()> {
        let inner = self.read()?;
        let data = inner.table(table)?;
        let Some(domain) = data.key else {
            return Ok(());
        };
        match op {
            Operator::Equal => {
                if let Ok(key) = key.cast(domain) {
                    if let Some(id) = data.keys.get(&key.key_bytes()) {
                        into.add(*id, 1, combine);
                    }
                }
            }
            Operator::Prefix => {
                let Some(prefix) = key.as_bytes() else {
                    return Ok(());
                };
                if !domain.is_text() {
                    return Ok(());
                }
                let lower = Bound::Included(prefix.to_vec());
                for (k, id) in data.keys.range((lower, Bound::Unbounded)) {
                    if !k.starts_with(prefix) {
                        break;
                    }
                    into.add(*id, 1, combine);
                }
            }
            other => {
                return Err(QuarryError::NotImplemented(format!("{} is not supported by table search", other)));
            }
        }
        Ok(())
    }

    fn table_get(&self, table: TableId, key: &Value) -> Result<Option<RecordId>> {
        let inner = self.read()?;
        let data = inner.table(table)?;
        let Some(domain) = data.key else {
            return Ok(None);
        };
        let key = key.cast(domain)?;
        Ok(data.keys.get(&key.key_bytes()).copied())
    }

    fn record_exists(&self, table: TableId, id: RecordId) -> bool {
        self.read()
            .ok()
            .map(|inner| inner.table(table).map(|t| t.records.contains_key(&id)).unwrap_or(false))
            .unwrap_or(false)
    }

    fn table_iterate(&self, table: TableId) -> Result<Vec<RecordId>> {
        let inner = self.read()?;
        Ok(inner.table(table)?.records.keys().copied().collect())
    }
}
