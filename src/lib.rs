//! Quarry: an embeddable expression engine for document tables.
//!
//! Expressions are compiled one operand/operator at a time into a linear bytecode, executed by a
//! stack virtual machine once per candidate record, and (for boolean filters) rewritten by a scan
//! planner into index probes combined through set algebra.
//!
//! # Architecture
//! - Domains and dynamically-typed values (`types`)
//! - Fixed-capacity value pool and constants arena (`pool`)
//! - Bytecode and the compile-time data-flow tracker (`ir`, `dfi`)
//! - Expression bundle and its compiler (`expression`, `compiler`)
//! - Virtual machine with promotion tables and geo primitives (`vm`, `arith`, `geo`, `context`)
//! - Storage contract, result sets and an in-memory store (`storage`, `memstore`, `schema`)
//! - Scan planner (`planner`) and binary image serializer (`serialize`)
//! - Script front end (`expr`) and procedures (`functions`)

pub mod arith;
mod compiler;
mod config;
mod context;
mod dfi;
mod expr;
mod expression;
mod functions;
pub mod geo;
mod ir;
mod memstore;
mod planner;
mod pool;
mod schema;
mod serialize;
mod storage;
mod types;
mod vm;

pub use compiler::*;
pub use config::*;
pub use context::*;
pub use dfi::*;
pub use expr::*;
pub use expression::*;
pub use functions::*;
pub use ir::*;
pub use memstore::*;
pub use planner::*;
pub use pool::*;
pub use schema::*;
pub use serialize::*;
pub use storage::*;
pub use types::*;
pub use vm::*;

use thiserror::Error;

/// Unified error type for quarry operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuarryError {
    /// Malformed operator arity, wrong operand kind, stack underflow
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Compile-time stack underflow
    #[error("Syntax error: {0}")]
    SyntaxError(String),

    /// A fixed-capacity arena or the operand stack is full
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Corrupt serialized image
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// An update operator was used where updates are disallowed
    #[error("Operation not permitted: {0}")]
    PermissionDenied(String),

    /// Division by zero or unparsable numeric text
    #[error("Arithmetic error: {0}")]
    ArithmeticError(String),

    /// Operator recognized but unsupported for the given operand types
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Error reported by the storage collaborator
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Script front end error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Unknown column, table or column id
    #[error("Field not found: {0}")]
    FieldNotFound(String),
}

/// Result type for quarry operations.
pub type Result<T> = std::result::Result<T, QuarryError>;
