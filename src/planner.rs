//! Scan planner: turns a boolean filter into index probes combined through result-set algebra.
//!
//! A filter is planned when it is a flat or parenthesized combination of predicates (a column
//! compared with a constant, or a relational CALL) joined by AND/OR/BUT/ADJUST. Each predicate
//! becomes a `ScanInfo` node. A node is answered by an index probe when one applies, and otherwise
//! by running just that predicate's slice of the bytecode once per candidate record. Filters that
//! don't fit the shape are evaluated whole, once per candidate record.

use crate::arith;
use crate::config::EngineConfig;
use crate::context::VmContext;
use crate::expression::Expression;
use crate::ir::{InstrFlags, Instruction, LogicalOp, Operand, Operator};
use crate::schema::ColumnKind;
use crate::storage::{IndexTarget, Probe, ResultSet, Storage};
use crate::types::{Domain, Object, TableId, Value};
use crate::vm::run_span;
use crate::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, instrument, trace};

/// Arguments captured per predicate.
const MAX_ARGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectOptions {
    pub planning: bool,
    /// When false every planned leaf is evaluated per record.
    pub use_indexes: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self { planning: true, use_indexes: true }
    }
}

impl From<&EngineConfig> for SelectOptions {
    fn from(config: &EngineConfig) -> Self {
        Self { planning: config.planning, use_indexes: config.use_indexes }
    }
}

/// Scan-info flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ScanFlags(u8);

impl ScanFlags {
    /// An argument is an `_id`/`_key` accessor.
    pub const ACCESSOR: ScanFlags = ScanFlags(0x01);
    /// Opens a nested result set.
    pub const PUSH: ScanFlags = ScanFlags(0x02);
    /// Merges the current result set into the stacked one.
    pub const POP: ScanFlags = ScanFlags(0x04);
    /// A constant came before the column.
    pub const PRE_CONST: ScanFlags = ScanFlags(0x08);

    pub fn empty() -> Self {
        ScanFlags(0)
    }
    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: ScanFlags) {
        self.0 |= other.0;
    }
    pub fn remove(&mut self, other: ScanFlags) {
        self.0 &= !other.0;
    }
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub target: IndexTarget,
    /// 1-based section, 0 for accessors
    pub section: u32,
    pub weight: i32,
}

/// One planned predicate or group boundary.
#[derive(Debug, Clone)]
pub struct ScanInfo {
    pub start: usize,
    pub end: usize,
    pub op: Operator,
    pub logical_op: LogicalOp,
    pub flags: ScanFlags,
    /// Entries sharing one physical index are adjacent
    pub indexes: Vec<IndexEntry>,
    pub query: Option<Value>,
    args: Vec<Value>,
    /// The predicate reads a column through another column's value
    chained: bool,
}

impl ScanInfo {
    fn new(start: usize) -> Self {
        Self {
            start,
            end: start,
            op: Operator::Nop,
            logical_op: LogicalOp::Or,
            flags: ScanFlags::PUSH,
            indexes: Vec::new(),
            query: None,
            args: Vec::new(),
            chained: false,
        }
    }

    fn pop_node(op: LogicalOp, start: usize) -> Self {
        let mut node = Self::new(start);
        node.flags = ScanFlags::POP;
        node.logical_op = op;
        node
    }

    fn push_arg(&mut self, value: Value) {
        if self.args.len() < MAX_ARGS {
            self.args.push(value);
        }
    }

    fn put_index(&mut self, target: IndexTarget, section: u32, weight: i32) {
        let entry = IndexEntry { target, section, weight };
        match self.indexes.iter().rposition(|e| e.target.same_index(&entry.target)) {
            Some(last) => self.indexes.insert(last + 1, entry),
            None => self.indexes.push(entry),
        }
    }

    /// Resolves captured arguments to index entries and the query value.
    fn resolve(&mut self, storage: &dyn Storage) {
        let args = std::mem::take(&mut self.args);
        for arg in args {
            match arg {
                Value::Object(Object::Column(column)) => {
                    if column.is_accessor() {
                        self.flags.insert(ScanFlags::ACCESSOR);
                    }
                    if let Some((target, section)) = storage.column_index(&column, self.op) {
                        self.put_index(target, section, 1);
                    }
                }
                Value::Object(Object::MatchColumns(columns)) => {
                    for weighted in columns.iter() {
                        if weighted.column.is_accessor() {
                            self.flags.insert(ScanFlags::ACCESSOR);
                        }
                        if let Some((target, section)) = storage.column_index(&weighted.column, self.op) {
                            self.put_index(target, section, weighted.weight);
                        }
                    }
                }
                other => self.query = Some(other),
            }
        }
        if self.chained {
            self.indexes.clear();
        }
    }

    fn span(&self) -> Range<usize> {
        self.start..self.end + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ScanStat {
    Start,
    Var,
    Col1,
    Col2,
    Const,
}

fn same_family(op: LogicalOp) -> LogicalOp {
    if op == LogicalOp::But {
        LogicalOp::And
    } else {
        op
    }
}

/// Attaches a combinator to the nodes built so far by scanning backwards for the group it
/// closes. Regroups (rotates) nodes when the group can be flattened, and appends a POP node when
/// it can't.
pub(crate) fn put_logical_op(sis: &mut Vec<ScanInfo>, op: LogicalOp, start: usize) -> Result<()> {
    let family = same_family(op);
    let i = sis.len();
    let (mut nparens, mut ndifops, mut r) = (1usize, 0usize, 0usize);
    let mut j = i;
    while j > 0 {
        j -= 1;
        let flags = sis[j].flags;
        if flags.contains(ScanFlags::POP) {
            ndifops += 1;
            nparens += 1;
        } else if flags.contains(ScanFlags::PUSH) {
            nparens -= 1;
            if nparens > 0 {
                continue;
            }
            if r == 0 {
                if ndifops > 0 {
                    if j > 0 {
                        nparens = 1;
                        ndifops = 0;
                        r = j;
                        continue;
                    }
                    sis.push(ScanInfo::pop_node(op, start));
                } else {
                    sis[j].flags.remove(ScanFlags::PUSH);
                    sis[j].logical_op = op;
                }
            } else if ndifops > 0 || op == LogicalOp::But {
                sis.push(ScanInfo::pop_node(op, start));
            } else {
                sis[j].flags.remove(ScanFlags::PUSH);
                sis[j].logical_op = op;
                sis[j..i].rotate_left(r - j);
            }
            return Ok(());
        } else if op == LogicalOp::But || family != same_family(sis[j].logical_op) {
            ndifops += 1;
        }
    }
    Err(QuarryError::InvalidArgument("unmatched nesting level".to_string()))
}

fn is_record_var(instr: &Instruction) -> bool {
    matches!(instr.value, Some(Operand::Var(0)))
}

fn closes_predicate(code: &[Instruction], pc: usize) -> bool {
    code[pc].flags.contains(InstrFlags::RELATIONAL) || pc + 1 == code.len()
}

/// Checks that the bytecode is a combination of plannable predicates.
fn validate(code: &[Instruction]) -> bool {
    let mut stat = ScanStat::Start;
    let (mut predicates, mut combinators) = (0usize, 0usize);
    for (pc, instr) in code.iter().enumerate() {
        match instr.op {
            op if op.is_comparison() => {
                if stat < ScanStat::Col1 {
                    return false;
                }
                stat = ScanStat::Start;
                predicates += 1;
            }
            op if op.is_combinator() => {
                if stat != ScanStat::Start || instr.nargs != 2 {
                    return false;
                }
                combinators += 1;
                if combinators >= predicates {
                    return false;
                }
            }
            Operator::Push => {
                stat = if is_record_var(instr) { ScanStat::Var } else { ScanStat::Const };
            }
            Operator::GetValue => {
                stat = match stat {
                    ScanStat::Start | ScanStat::Var | ScanStat::Const => ScanStat::Col1,
                    _ => ScanStat::Col2,
                };
            }
            Operator::Call => {
                if closes_predicate(code, pc) {
                    stat = ScanStat::Start;
                    predicates += 1;
                } else {
                    stat = ScanStat::Col2;
                }
            }
            _ => return false,
        }
    }
    stat == ScanStat::Start && predicates == combinators + 1
}

/// Builds the scan-info nodes for `expr`. `Ok(None)` means the filter isn't plannable and must be
/// evaluated whole; only a nesting mismatch is an error.
pub fn plan(expr: &Expression, storage: &dyn Storage, op: LogicalOp, incoming_empty: bool) -> Result<Option<Vec<ScanInfo>>> {
    let code = expr.code();
    if expr.nvars() == 0 || code.is_empty() || !validate(code) {
        return Ok(None);
    }
    let mut sis: Vec<ScanInfo> = Vec::new();
    let mut si: Option<ScanInfo> = None;
    let mut stat = ScanStat::Start;
    for (pc, instr) in code.iter().enumerate() {
        match instr.op {
            op if op.is_comparison() => {
                stat = ScanStat::Start;
                let Some(mut node) = si.take() else {
                    return Ok(None);
                };
                node.op = op;
                node.end = pc;
                node.resolve(storage);
                sis.push(node);
            }
            op if op.is_combinator() => {
                if let Some(logical) = LogicalOp::from_operator(op) {
                    put_logical_op(&mut sis, logical, pc)?;
                }
                stat = ScanStat::Start;
            }
            Operator::Push => {
                let node = si.get_or_insert_with(|| ScanInfo::new(pc));
                if is_record_var(instr) {
                    stat = ScanStat::Var;
                } else {
                    if let Some(operand) = &instr.value {
                        node.push_arg(expr.operand_value(operand));
                    }
                    if stat == ScanStat::Start {
                        node.flags.insert(ScanFlags::PRE_CONST);
                    }
                    stat = ScanStat::Const;
                }
            }
            Operator::GetValue => match stat {
                ScanStat::Start | ScanStat::Var | ScanStat::Const => {
                    let node = si.get_or_insert_with(|| ScanInfo::new(pc));
                    stat = ScanStat::Col1;
                    match &instr.value {
                        Some(Operand::Object(obj @ (Object::Column(_) | Object::MatchColumns(_)))) => {
                            node.push_arg(Value::Object(obj.clone()));
                        }
                        _ => node.chained = true,
                    }
                }
                ScanStat::Col1 => {
                    if let Some(node) = si.as_mut() {
                        node.chained = true;
                    }
                    stat = ScanStat::Col2;
                }
                ScanStat::Col2 => {}
            },
            Operator::Call => {
                let node = si.get_or_insert_with(|| ScanInfo::new(pc));
                if closes_predicate(code, pc) {
                    stat = ScanStat::Start;
                    if let Some(mut node) = si.take() {
                        node.op = Operator::Call;
                        node.end = pc;
                        node.resolve(storage);
                        sis.push(node);
                    }
                } else {
                    node.chained = true;
                    stat = ScanStat::Col2;
                }
            }
            _ => {}
        }
    }
    if op == LogicalOp::Or && incoming_empty {
        let Some(first) = sis.first_mut() else {
            return Ok(None);
        };
        if !first.flags.contains(ScanFlags::PUSH) || first.logical_op != op {
            debug!("invalid expr");
            return Ok(None);
        }
        first.flags.remove(ScanFlags::PUSH);
        first.logical_op = op;
    } else {
        put_logical_op(&mut sis, op, code.len())?;
    }
    Ok(Some(sis))
}

/// Selects the records of `table` matching `expr` and combines them into `res` under `op`.
///
/// Variable 0 of `expr` is rebound to each candidate record while the filter is evaluated and
/// restored afterwards.
#[instrument(level = "debug", skip_all, fields(table = table, op = ?op))]
pub fn table_select(
    ctx: &mut VmContext,
    storage: &dyn Storage,
    expr: &mut Expression,
    table: TableId,
    res: Option<ResultSet>,
    op: LogicalOp,
    options: &SelectOptions,
) -> Result<ResultSet> {
    let mut res = match res {
        Some(res) if res.table() != table => {
            return Err(QuarryError::InvalidArgument(format!(
                "result set of table {} can't hold records of table {}",
                res.table(),
                table
            )));
        }
        Some(res) => res,
        None => storage.create_result_set(table),
    };
    let Some(saved) = expr.heap.vars.first().map(|v| v.value.clone()) else {
        return Err(QuarryError::InvalidArgument("at least one variable must be defined".to_string()));
    };
    let outcome = select(ctx, storage, expr, table, &mut res, op, options);
    if let Some(var) = expr.heap.vars.first_mut() {
        var.value = saved;
    }
    outcome.map(|()| res)
}

fn select(
    ctx: &mut VmContext,
    storage: &dyn Storage,
    expr: &mut Expression,
    table: TableId,
    res: &mut ResultSet,
    op: LogicalOp,
    options: &SelectOptions,
) -> Result<()> {
    if options.planning && (op == LogicalOp::Or || !res.is_empty()) {
        match plan(expr, storage, op, res.is_empty())? {
            Some(sis) => {
                debug!(nodes = sis.len(), "running planned select");
                return run_plan(ctx, storage, expr, table, res, &sis, options);
            }
            None => debug!("expression is not plannable, scanning"),
        }
    }
    let span = 0..expr.code.len();
    scan(ctx, storage, expr, table, span, res, op)
}

fn run_plan(
    ctx: &mut VmContext,
    storage: &dyn Storage,
    expr: &mut Expression,
    table: TableId,
    res: &mut ResultSet,
    sis: &[ScanInfo],
    options: &SelectOptions,
) -> Result<()> {
    let mut stack: Vec<ResultSet> = Vec::new();
    for si in sis {
        if si.flags.contains(ScanFlags::POP) {
            let mut outer = stack
                .pop()
                .ok_or_else(|| QuarryError::InvalidArgument("unmatched nesting level".to_string()))?;
            outer.merge(res, si.logical_op);
            *res = outer;
            continue;
        }
        if si.flags.contains(ScanFlags::PUSH) {
            let inner = storage.create_result_set(table);
            stack.push(std::mem::replace(res, inner));
        }
        let probed = options.use_indexes && probe(storage, table, si, res)?;
        trace!(start = si.start, op = ?si.logical_op, probed, "leaf");
        if probed {
            res.resolve_and(si.logical_op);
        } else {
            scan(ctx, storage, expr, table, si.span(), res, si.logical_op)?;
        }
    }
    Ok(())
}

/// Answers a leaf from an index. Returns false when the leaf must be evaluated per record.
fn probe(storage: &dyn Storage, table: TableId, si: &ScanInfo, res: &mut ResultSet) -> Result<bool> {
    let (Some(first), Some(query)) = (si.indexes.first(), si.query.as_ref()) else {
        return Ok(false);
    };
    let op = si.logical_op;
    match (si.op, &first.target) {
        (Operator::Equal, IndexTarget::Accessor(column)) => {
            if !si.flags.contains(ScanFlags::ACCESSOR) {
                return Ok(false);
            }
            let Some(key) = exact_key(query, column.range) else {
                return Ok(false);
            };
            match column.kind {
                ColumnKind::Id => {
                    let id = key.as_i64().unwrap_or(0) as u32;
                    if id != 0 && storage.record_exists(table, id) {
                        res.add(id, 1, op);
                    }
                }
                ColumnKind::Key => {
                    if let Some(id) = storage.table_get(table, &key)? {
                        res.add(id, 1, op);
                    }
                }
                ColumnKind::Stored => return Ok(false),
            }
            Ok(true)
        }
        (Operator::Equal, target @ IndexTarget::Inverted(index)) => {
            let Some(range) = section_range(storage, index, first.section) else {
                return Ok(false);
            };
            let Some(key) = exact_key(query, range) else {
                return Ok(false);
            };
            let sections = [(first.section, 1)];
            storage.index_probe(target, &Probe { op: Operator::Equal, key: &key, sections: &sections }, res, op)?;
            Ok(true)
        }
        (Operator::Prefix, _) if si.flags.contains(ScanFlags::PRE_CONST) => Ok(false),
        (Operator::Prefix, IndexTarget::Accessor(column)) => {
            if column.kind != ColumnKind::Key || !si.flags.contains(ScanFlags::ACCESSOR) {
                return Ok(false);
            }
            let Some(text) = text_query(query) else {
                return Ok(false);
            };
            storage.table_search(table, &text, Operator::Prefix, res, op)?;
            Ok(true)
        }
        (Operator::Prefix, target @ IndexTarget::Inverted(index)) => {
            let text_column = section_range(storage, index, first.section).map(Domain::is_text).unwrap_or(false);
            let Some(text) = text_query(query).filter(|_| text_column) else {
                return Ok(false);
            };
            let sections = [(first.section, 1)];
            storage.index_probe(target, &Probe { op: Operator::Prefix, key: &text, sections: &sections }, res, op)?;
            Ok(true)
        }
        (Operator::Match, _) => {
            if si.flags.contains(ScanFlags::PRE_CONST) {
                return Ok(false);
            }
            let mut groups: Vec<(&IndexTarget, Vec<(u32, i32)>)> = Vec::new();
            for entry in &si.indexes {
                let IndexTarget::Inverted(index) = &entry.target else {
                    return Ok(false);
                };
                if !section_range(storage, index, entry.section).map(Domain::is_text).unwrap_or(false) {
                    return Ok(false);
                }
                match groups.last_mut() {
                    Some((target, sections)) if target.same_index(&entry.target) => {
                        sections.push((entry.section, entry.weight));
                    }
                    _ => groups.push((&entry.target, vec![(entry.section, entry.weight)])),
                }
            }
            for (target, sections) in &groups {
                storage.index_probe(target, &Probe { op: Operator::Match, key: query, sections }, res, op)?;
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn section_range(storage: &dyn Storage, index: &crate::schema::Index, section: u32) -> Option<Domain> {
    let column = *index.sections.get(section.checked_sub(1)? as usize)?;
    storage.column_by_id(column).map(|c| c.range)
}

/// The query cast to `range`, when the cast is exact and the comparison stays in one family
/// (text with text, numbers with numbers).
fn exact_key(query: &Value, range: Domain) -> Option<Value> {
    if query.is_text() != range.is_text() {
        return None;
    }
    let key = query.cast(range).ok()?;
    arith::equal(&key, query).then_some(key)
}

fn text_query(query: &Value) -> Option<Value> {
    if query.is_text() {
        return Some(query.clone());
    }
    query.cast(Domain::Text).ok()
}

/// Evaluates `code[span]` per candidate record and applies `op`: OR scans the whole table, the
/// other combinators only the records already in `res`.
fn scan(
    ctx: &mut VmContext,
    storage: &dyn Storage,
    expr: &mut Expression,
    table: TableId,
    span: Range<usize>,
    res: &mut ResultSet,
    op: LogicalOp,
) -> Result<()> {
    let candidates = match op {
        LogicalOp::Or => storage.table_iterate(table)?,
        _ => res.ids(),
    };
    let code = expr.code.get(span).unwrap_or_default();
    for id in candidates {
        if let Some(var) = expr.heap.vars.first_mut() {
            var.value = Value::record(table, id);
        }
        let score = run_span(ctx, code, &mut expr.heap, storage, 0)?
            .map(|v| v.as_score())
            .unwrap_or(0);
        if score == 0 {
            continue;
        }
        match op {
            LogicalOp::But => {
                res.remove(id);
            }
            _ => res.add(id, score, op),
        }
    }
    res.resolve_and(op);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::memstore::MemoryStore;
    use crate::schema::TableSchemaBuilder;

    fn docs() -> (MemoryStore, TableId) {
        let store = MemoryStore::new();
        let schema = TableSchemaBuilder::new("docs")
            .key(Domain::ShortText)
            .column("title", Domain::Text)
            .column("size", Domain::Int32)
            .index("terms", &["title"])
            .index("sizes", &["size"])
            .build();
        let table = store.create_table(&schema).unwrap();
        for (key, title, size) in [
            ("apple", "Red fruit", 3),
            ("banana", "Yellow fruit", 5),
            ("cherry", "Red stone fruit", 3),
            ("date", "Brown", 8),
        ] {
            let id = store.add_record(table, Value::short_text(key)).unwrap();
            store.set(table, id, "title", Value::text(title)).unwrap();
            store.set(table, id, "size", Value::Int32(size)).unwrap();
        }
        (store, table)
    }

    fn predicate(c: &mut Compiler<'_>, column: &str, value: Value, op: Operator) {
        c.append_constant_str(column, Operator::GetValue, 1).unwrap();
        c.append_constant(value, Operator::Push, 1).unwrap();
        c.append_operator(op, 2).unwrap();
    }

    fn select(store: &MemoryStore, expr: &mut Expression, table: TableId, options: SelectOptions) -> Vec<u32> {
        let mut ctx = VmContext::default();
        table_select(&mut ctx, store, expr, table, None, LogicalOp::Or, &options).unwrap().ids()
    }

    #[test]
    fn test_flags() {
        let mut flags = ScanFlags::PUSH;
        flags.insert(ScanFlags::PRE_CONST);
        assert!(flags.contains(ScanFlags::PUSH));
        flags.remove(ScanFlags::PUSH);
        assert!(!flags.contains(ScanFlags::PUSH));
        assert!(flags.contains(ScanFlags::PRE_CONST));
    }

    #[test]
    fn test_put_logical_op_without_group_fails() {
        let mut sis = vec![ScanInfo::new(0)];
        sis[0].flags = ScanFlags::empty();
        let err = put_logical_op(&mut sis, LogicalOp::And, 3).unwrap_err();
        assert_eq!(err, QuarryError::InvalidArgument("unmatched nesting level".to_string()));
    }

    #[test]
    fn test_nested_group_is_rotated_to_front() {
        let (store, table) = docs();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        predicate(&mut c, "size", Value::Int32(8), Operator::Equal);
        predicate(&mut c, "title", Value::text("red"), Operator::Match);
        predicate(&mut c, "size", Value::Int32(3), Operator::Equal);
        c.append_operator(Operator::And, 2).unwrap();
        c.append_operator(Operator::Or, 2).unwrap();

        let sis = plan(&expr, &store, LogicalOp::Or, true).unwrap().unwrap();
        let starts: Vec<usize> = sis.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![3, 6, 0]);
        let ops: Vec<LogicalOp> = sis.iter().map(|s| s.logical_op).collect();
        assert_eq!(ops, vec![LogicalOp::Or, LogicalOp::And, LogicalOp::Or]);
        assert!(sis.iter().all(|s| !s.flags.contains(ScanFlags::PUSH)));
        assert_eq!(select(&store, &mut expr, table, SelectOptions::default()), vec![1, 3, 4]);
    }

    #[test]
    fn test_index_and_scan_agree() {
        let (store, table) = docs();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        predicate(&mut c, "title", Value::text("fruit"), Operator::Match);
        predicate(&mut c, "size", Value::Int32(5), Operator::Equal);
        c.append_operator(Operator::But, 2).unwrap();

        let planned = select(&store, &mut expr, table, SelectOptions::default());
        let no_index = select(&store, &mut expr, table, SelectOptions { planning: true, use_indexes: false });
        let full = select(&store, &mut expr, table, SelectOptions { planning: false, use_indexes: false });
        assert_eq!(planned, vec![1, 3]);
        assert_eq!(planned, no_index);
        assert_eq!(planned, full);
    }

    #[test]
    fn test_difference_of_group_keeps_its_own_level() {
        let (store, table) = docs();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        predicate(&mut c, "title", Value::text("fruit"), Operator::Match);
        predicate(&mut c, "title", Value::text("red"), Operator::Match);
        predicate(&mut c, "size", Value::Int32(3), Operator::Equal);
        c.append_operator(Operator::And, 2).unwrap();
        c.append_operator(Operator::But, 2).unwrap();

        let sis = plan(&expr, &store, LogicalOp::Or, true).unwrap().unwrap();
        let last = sis.last().unwrap();
        assert!(last.flags.contains(ScanFlags::POP));
        assert_eq!(last.logical_op, LogicalOp::But);
        let full = select(&store, &mut expr, table, SelectOptions { planning: false, use_indexes: false });
        assert_eq!(select(&store, &mut expr, table, SelectOptions::default()), vec![2]);
        assert_eq!(full, vec![2]);
    }

    #[test]
    fn test_key_accessor_probes() {
        let (store, table) = docs();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        predicate(&mut c, "_key", Value::text("b"), Operator::Prefix);
        predicate(&mut c, "_key", Value::text("date"), Operator::Equal);
        c.append_operator(Operator::Or, 2).unwrap();
        let sis = plan(&expr, &store, LogicalOp::Or, true).unwrap().unwrap();
        assert!(sis.iter().all(|s| s.flags.contains(ScanFlags::ACCESSOR)));
        assert_eq!(select(&store, &mut expr, table, SelectOptions::default()), vec![2, 4]);
    }

    #[test]
    fn test_unplannable_expression_scans() {
        let (store, table) = docs();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_constant_str("size", Operator::GetValue, 1).unwrap();
        c.append_constant_int(1, Operator::Plus, 2).unwrap();
        c.append_constant_int(5, Operator::Greater, 2).unwrap();
        assert!(plan(&expr, &store, LogicalOp::Or, true).unwrap().is_none());
        assert_eq!(select(&store, &mut expr, table, SelectOptions::default()), vec![2, 4]);
        assert_eq!(expr.var_value(0), Some(&Value::record(table, 0)));
    }

    #[test]
    fn test_incoming_set_is_refined() {
        let (store, table) = docs();
        let mut expr = Expression::for_table(table).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        predicate(&mut c, "size", Value::Int32(3), Operator::Equal);
        let mut ctx = VmContext::default();
        let mut incoming = ResultSet::new(table);
        incoming.add(1, 1, LogicalOp::Or);
        incoming.add(2, 1, LogicalOp::Or);
        let options = SelectOptions::default();
        let res = table_select(&mut ctx, &store, &mut expr, table, Some(incoming), LogicalOp::And, &options).unwrap();
        assert_eq!(res.scores(), vec![(1, 2)]);

        let wrong = ResultSet::new(table + 1);
        assert!(table_select(&mut ctx, &store, &mut expr, table, Some(wrong), LogicalOp::Or, &options).is_err());
    }
}
