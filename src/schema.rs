//! Schema module: table definitions and the column/index handles the engine resolves against.
//!
//! This module provides the TableSchema type and builder, plus `Column` and `Index` handles
//! created by a storage implementation.

use crate::types::{Domain, TableId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ColumnId = u32;
pub type IndexId = u32;

/// Name of the record id accessor every table exposes.
pub const ID_ACCESSOR: &str = "_id";
/// Name of the record key accessor every table exposes.
pub const KEY_ACCESSOR: &str = "_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// `_id` accessor
    Id,
    /// `_key` accessor
    Key,
    /// Column whose values live in storage
    Stored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub table: TableId,
    pub name: String,
    /// Domain of the values the column holds
    pub range: Domain,
    pub kind: ColumnKind,
}

impl Column {
    pub fn is_accessor(&self) -> bool {
        self.kind != ColumnKind::Stored
    }

    /// Writes through stored columns outlive the expression.
    pub fn is_persistent(&self) -> bool {
        self.kind == ColumnKind::Stored
    }
}

/// Inverted index over one or more columns of a table. Sections are numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub id: IndexId,
    pub name: String,
    pub table: TableId,
    pub sections: Vec<ColumnId>,
}

impl Index {
    /// 1-based section number of a column, if the index covers it.
    pub fn section_of(&self, column: ColumnId) -> Option<u32> {
        self.sections
            .iter()
            .position(|c| *c == column)
            .map(|p| p as u32 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub range: Domain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TableSchema {
    name: String,
    key: Option<Domain>,
    columns: Vec<ColumnDef>,
    indexes: Vec<IndexDef>,
    column_ids: HashMap<String, usize>, // name -> position
}

impl TableSchema {
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Key domain of keyed tables, `None` for array-like tables.
    pub fn key(&self) -> Option<Domain> {
        self.key
    }
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.column_ids.get(name).map(|i| &self.columns[*i])
    }
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TableSchemaBuilder {
    name: String,
    key: Option<Domain>,
    columns: Vec<ColumnDef>,
    indexes: Vec<IndexDef>,
}

impl TableSchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
    pub fn key(mut self, domain: Domain) -> Self {
        self.key = Some(domain);
        self
    }
    /// Adds a column; a later definition with the same name replaces the earlier one.
    pub fn column(mut self, name: impl Into<String>, range: Domain) -> Self {
        let name = name.into();
        self.columns.retain(|c| c.name != name);
        self.columns.push(ColumnDef { name, range });
        self
    }
    pub fn index(mut self, name: impl Into<String>, sections: &[&str]) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            sections: sections.iter().map(|s| s.to_string()).collect(),
        });
        self
    }
    pub fn build(self) -> TableSchema {
        let column_ids = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        TableSchema {
            name: self.name,
            key: self.key,
            columns: self.columns,
            indexes: self.indexes,
            column_ids,
        }
    }
}
