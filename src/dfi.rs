//! Data-flow tracker: a compile-time stack mirroring the runtime stack effect of emitted code.

use crate::ir::Instruction;
use crate::types::{Domain, ValueKind};

/// One reachable value: its producing instruction (if any), kind and domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfiEntry {
    pub code: Option<usize>,
    pub kind: ValueKind,
    pub domain: Domain,
}

#[derive(Debug, Clone, Default)]
pub struct DataFlowTracker {
    entries: Vec<DfiEntry>,
    /// Producer consumed by the last pop, waiting for its consumer's index
    pending: Option<usize>,
}

impl DataFlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one produced value and links the pending producer to `code`.
    pub fn push(&mut self, kind: ValueKind, domain: Domain, code: Option<usize>, codes: &mut [Instruction]) {
        if let Some(producer) = self.pending.take() {
            if let Some(instr) = codes.get_mut(producer) {
                instr.modify = match code {
                    Some(c) if c >= producer => c - producer,
                    _ => 0,
                };
            }
        }
        self.entries.push(DfiEntry { code, kind, domain });
    }

    /// Consumes the most recent entry; `None` on underflow.
    pub fn pop(&mut self) -> Option<DfiEntry> {
        let entry = self.entries.pop()?;
        self.pending = entry.code;
        Some(entry)
    }

    pub fn peek(&self) -> Option<&DfiEntry> {
        self.entries.last()
    }

    /// Entry `n` positions below the top (0 is the top).
    pub fn nth_from_top(&self, n: usize) -> Option<&DfiEntry> {
        self.entries.len().checked_sub(n + 1).and_then(|i| self.entries.get(i))
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operator;

    #[test]
    fn test_push_pop_depth() {
        let mut codes: Vec<Instruction> = vec![];
        let mut dfi = DataFlowTracker::new();
        dfi.push(ValueKind::Bulk, Domain::Int32, None, &mut codes);
        dfi.push(ValueKind::Bulk, Domain::Text, None, &mut codes);
        assert_eq!(dfi.depth(), 2);
        assert_eq!(dfi.nth_from_top(1).map(|e| e.domain), Some(Domain::Int32));
        assert_eq!(dfi.nth_from_top(2), None);
        assert_eq!(dfi.pop().map(|e| e.domain), Some(Domain::Text));
        assert_eq!(dfi.pop().map(|e| e.domain), Some(Domain::Int32));
        assert_eq!(dfi.pop(), None);
    }

    #[test]
    fn test_pop_then_push_patches_modify() {
        let mut codes = vec![
            Instruction::new(Operator::Push, 1, None),
            Instruction::new(Operator::Push, 1, None),
            Instruction::new(Operator::Equal, 2, None),
        ];
        let mut dfi = DataFlowTracker::new();
        dfi.push(ValueKind::Bulk, Domain::Int32, Some(0), &mut codes);
        dfi.push(ValueKind::Bulk, Domain::Int32, Some(1), &mut codes);
        dfi.pop();
        dfi.pop();
        dfi.push(ValueKind::Bulk, Domain::Int32, Some(2), &mut codes);
        assert_eq!(codes[0].modify, 2);
        assert_eq!(codes[1].modify, 0);
    }
}
