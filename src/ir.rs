//! Intermediate Representation (IR) for the expression engine.
//!
//! This module defines the bytecode operators, instructions and their bound operands.

use crate::pool::ConstId;
use crate::types::Object;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an expression variable; variable 0 is the current record.
pub type VarId = usize;

/// Bytecode operators. The discriminant is the stable code stored in serialized images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operator {
    Push,
    Pop,
    Nop,
    Call,
    GetRef,
    GetValue,
    And,
    /// Set difference: left and not right
    But,
    Or,
    Assign,
    StarAssign,
    SlashAssign,
    ModAssign,
    PlusAssign,
    MinusAssign,
    ShiftlAssign,
    ShiftrAssign,
    ShiftrrAssign,
    AndAssign,
    XorAssign,
    OrAssign,
    Jump,
    CJump,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    BitwiseNot,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Match,
    Prefix,
    Suffix,
    ShiftL,
    ShiftR,
    ShiftRR,
    Plus,
    Minus,
    Star,
    Slash,
    Mod,
    Incr,
    Decr,
    IncrPost,
    DecrPost,
    /// Score-only combinator
    Adjust,
    GeoDistance1,
    GeoDistance2,
    GeoDistance3,
    GeoDistance4,
    GeoWithinp5,
    GeoWithinp6,
    GeoWithinp8,
}

const ALL_OPERATORS: [Operator; 56] = [
    Operator::Push,
    Operator::Pop,
    Operator::Nop,
    Operator::Call,
    Operator::GetRef,
    Operator::GetValue,
    Operator::And,
    Operator::But,
    Operator::Or,
    Operator::Assign,
    Operator::StarAssign,
    Operator::SlashAssign,
    Operator::ModAssign,
    Operator::PlusAssign,
    Operator::MinusAssign,
    Operator::ShiftlAssign,
    Operator::ShiftrAssign,
    Operator::ShiftrrAssign,
    Operator::AndAssign,
    Operator::XorAssign,
    Operator::OrAssign,
    Operator::Jump,
    Operator::CJump,
    Operator::BitwiseOr,
    Operator::BitwiseXor,
    Operator::BitwiseAnd,
    Operator::BitwiseNot,
    Operator::Equal,
    Operator::NotEqual,
    Operator::Less,
    Operator::Greater,
    Operator::LessEqual,
    Operator::GreaterEqual,
    Operator::Match,
    Operator::Prefix,
    Operator::Suffix,
    Operator::ShiftL,
    Operator::ShiftR,
    Operator::ShiftRR,
    Operator::Plus,
    Operator::Minus,
    Operator::Star,
    Operator::Slash,
    Operator::Mod,
    Operator::Incr,
    Operator::Decr,
    Operator::IncrPost,
    Operator::DecrPost,
    Operator::Adjust,
    Operator::GeoDistance1,
    Operator::GeoDistance2,
    Operator::GeoDistance3,
    Operator::GeoDistance4,
    Operator::GeoWithinp5,
    Operator::GeoWithinp6,
    Operator::GeoWithinp8,
];

impl Operator {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Operator> {
        ALL_OPERATORS.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Push => "PUSH",
            Operator::Pop => "POP",
            Operator::Nop => "NOP",
            Operator::Call => "CALL",
            Operator::GetRef => "GET_REF",
            Operator::GetValue => "GET_VALUE",
            Operator::And => "AND",
            Operator::But => "BUT",
            Operator::Or => "OR",
            Operator::Assign => "ASSIGN",
            Operator::StarAssign => "STAR_ASSIGN",
            Operator::SlashAssign => "SLASH_ASSIGN",
            Operator::ModAssign => "MOD_ASSIGN",
            Operator::PlusAssign => "PLUS_ASSIGN",
            Operator::MinusAssign => "MINUS_ASSIGN",
            Operator::ShiftlAssign => "SHIFTL_ASSIGN",
            Operator::ShiftrAssign => "SHIFTR_ASSIGN",
            Operator::ShiftrrAssign => "SHIFTRR_ASSIGN",
            Operator::AndAssign => "AND_ASSIGN",
            Operator::XorAssign => "XOR_ASSIGN",
            Operator::OrAssign => "OR_ASSIGN",
            Operator::Jump => "JUMP",
            Operator::CJump => "CJUMP",
            Operator::BitwiseOr => "BITWISE_OR",
            Operator::BitwiseXor => "BITWISE_XOR",
            Operator::BitwiseAnd => "BITWISE_AND",
            Operator::BitwiseNot => "BITWISE_NOT",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::Less => "LESS",
            Operator::Greater => "GREATER",
            Operator::LessEqual => "LESS_EQUAL",
            Operator::GreaterEqual => "GREATER_EQUAL",
            Operator::Match => "MATCH",
            Operator::Prefix => "PREFIX",
            Operator::Suffix => "SUFFIX",
            Operator::ShiftL => "SHIFTL",
            Operator::ShiftR => "SHIFTR",
            Operator::ShiftRR => "SHIFTRR",
            Operator::Plus => "PLUS",
            Operator::Minus => "MINUS",
            Operator::Star => "STAR",
            Operator::Slash => "SLASH",
            Operator::Mod => "MOD",
            Operator::Incr => "INCR",
            Operator::Decr => "DECR",
            Operator::IncrPost => "INCR_POST",
            Operator::DecrPost => "DECR_POST",
            Operator::Adjust => "ADJUST",
            Operator::GeoDistance1 => "GEO_DISTANCE1",
            Operator::GeoDistance2 => "GEO_DISTANCE2",
            Operator::GeoDistance3 => "GEO_DISTANCE3",
            Operator::GeoDistance4 => "GEO_DISTANCE4",
            Operator::GeoWithinp5 => "GEO_WITHINP5",
            Operator::GeoWithinp6 => "GEO_WITHINP6",
            Operator::GeoWithinp8 => "GEO_WITHINP8",
        }
    }

    /// Source-level symbol, used in error messages.
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Plus | Operator::PlusAssign => "+",
            Operator::Minus | Operator::MinusAssign => "-",
            Operator::Star | Operator::StarAssign => "*",
            Operator::Slash | Operator::SlashAssign => "/",
            Operator::Mod | Operator::ModAssign => "%",
            Operator::ShiftL | Operator::ShiftlAssign => "<<",
            Operator::ShiftR | Operator::ShiftrAssign => ">>",
            Operator::ShiftRR | Operator::ShiftrrAssign => ">>>",
            Operator::BitwiseOr | Operator::OrAssign => "|",
            Operator::BitwiseXor | Operator::XorAssign => "^",
            Operator::BitwiseAnd | Operator::AndAssign => "&",
            Operator::BitwiseNot => "~",
            other => other.name(),
        }
    }

    /// Relational operators a scan-info leaf can express.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::NotEqual
                | Operator::Less
                | Operator::Greater
                | Operator::LessEqual
                | Operator::GreaterEqual
                | Operator::Match
                | Operator::Prefix
                | Operator::Suffix
                | Operator::GeoWithinp5
                | Operator::GeoWithinp6
                | Operator::GeoWithinp8
        )
    }

    pub fn is_combinator(self) -> bool {
        matches!(self, Operator::And | Operator::Or | Operator::But | Operator::Adjust)
    }

    /// Compound assignments, mapped to the arithmetic operator they apply.
    pub fn assign_arithmetic(self) -> Option<Operator> {
        let op = match self {
            Operator::StarAssign => Operator::Star,
            Operator::SlashAssign => Operator::Slash,
            Operator::ModAssign => Operator::Mod,
            Operator::PlusAssign => Operator::Plus,
            Operator::MinusAssign => Operator::Minus,
            Operator::ShiftlAssign => Operator::ShiftL,
            Operator::ShiftrAssign => Operator::ShiftR,
            Operator::ShiftrrAssign => Operator::ShiftRR,
            Operator::AndAssign => Operator::BitwiseAnd,
            Operator::XorAssign => Operator::BitwiseXor,
            Operator::OrAssign => Operator::BitwiseOr,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_assign(self) -> bool {
        self == Operator::Assign || self.assign_arithmetic().is_some()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a partial result set is merged into the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOp {
    Or,
    And,
    But,
    Adjust,
}

impl LogicalOp {
    pub fn from_operator(op: Operator) -> Option<LogicalOp> {
        match op {
            Operator::Or => Some(LogicalOp::Or),
            Operator::And => Some(LogicalOp::And),
            Operator::But => Some(LogicalOp::But),
            Operator::Adjust => Some(LogicalOp::Adjust),
            _ => None,
        }
    }

    pub fn operator(self) -> Operator {
        match self {
            LogicalOp::Or => Operator::Or,
            LogicalOp::And => Operator::And,
            LogicalOp::But => Operator::But,
            LogicalOp::Adjust => Operator::Adjust,
        }
    }
}

/// Instruction flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct InstrFlags(u8);

impl InstrFlags {
    /// The instruction produces an operand of AND/OR/BUT.
    pub const RELATIONAL: InstrFlags = InstrFlags(0x01);

    pub fn empty() -> Self {
        InstrFlags(0)
    }
    pub fn contains(self, other: InstrFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn insert(&mut self, other: InstrFlags) {
        self.0 |= other.0;
    }
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// Value bound to an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Const(ConstId),
    Var(VarId),
    Object(Object),
}

/// A single instruction in the expression bytecode.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Operator,
    pub nargs: usize,
    pub value: Option<Operand>,
    pub flags: InstrFlags,
    /// Distance to the instruction that consumed this one's result, 0 if none
    pub modify: usize,
}

impl Instruction {
    pub fn new(op: Operator, nargs: usize, value: Option<Operand>) -> Self {
        Self { op, nargs, value, flags: InstrFlags::empty(), modify: 0 }
    }
}
