//! Functions module: the procedure protocol and the registry that hands out procedure ids.
//!
//! A procedure runs in up to three phases (`init`, `next`, `finalize`). A phase that returns
//! `None` is absent; the value of the last present phase becomes the CALL result.

use crate::context::VmContext;
use crate::storage::Storage;
use crate::types::Value;
use crate::{QuarryError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type ProcId = usize;

/// What a procedure phase can see: the caller's operand stack, the storage and a per-call slot
/// shared between the phases.
pub struct ProcContext<'a> {
    pub vm: &'a mut VmContext,
    pub storage: &'a dyn Storage,
    pub user_data: Option<Box<dyn Any>>,
}

pub trait Procedure: Send + Sync {
    /// Only function procedures may be the target of CALL.
    fn is_function(&self) -> bool {
        true
    }
    fn init(&self, _ctx: &mut ProcContext<'_>, _args: &[Value]) -> Option<Result<Value>> {
        None
    }
    fn next(&self, _ctx: &mut ProcContext<'_>, _args: &[Value]) -> Option<Result<Value>> {
        None
    }
    fn finalize(&self, _ctx: &mut ProcContext<'_>, _args: &[Value]) -> Option<Result<Value>> {
        None
    }
}

/// Registered procedure: stable id, name and shared implementation.
#[derive(Clone)]
pub struct ProcHandle {
    id: ProcId,
    name: Arc<str>,
    procedure: Arc<dyn Procedure>,
}

impl ProcHandle {
    pub fn id(&self) -> ProcId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_function(&self) -> bool {
        self.procedure.is_function()
    }

    /// Runs every present phase in order and returns the last present phase's value.
    pub fn invoke(&self, ctx: &mut ProcContext<'_>, args: &[Value]) -> Result<Value> {
        let mut out = Value::Void;
        if let Some(value) = self.procedure.init(ctx, args) {
            out = value?;
        }
        if let Some(value) = self.procedure.next(ctx, args) {
            out = value?;
        }
        if let Some(value) = self.procedure.finalize(ctx, args) {
            out = value?;
        }
        Ok(out)
    }
}

impl fmt::Debug for ProcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_function", &self.is_function())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    procedures: Vec<ProcHandle>,
    by_name: HashMap<String, ProcId>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin functions.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        register_builtins(&mut reg);
        reg
    }

    /// Registers a procedure; a later registration under the same name shadows the earlier one.
    pub fn register<P>(&mut self, name: impl Into<String>, procedure: P) -> ProcId
    where
        P: Procedure + 'static,
    {
        let name = name.into();
        let id = self.procedures.len();
        self.procedures.push(ProcHandle {
            id,
            name: Arc::from(name.as_str()),
            procedure: Arc::new(procedure),
        });
        self.by_name.insert(name, id);
        id
    }

    pub fn get(&self, name: &str) -> Option<&ProcHandle> {
        self.by_name.get(name).and_then(|id| self.procedures.get(*id))
    }

    pub fn get_by_id(&self, id: ProcId) -> Option<&ProcHandle> {
        self.procedures.get(id)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.procedures.iter().map(|p| p.name())).finish()
    }
}

fn text_arg<'v>(name: &str, args: &'v [Value]) -> Result<&'v [u8]> {
    args.first()
        .and_then(Value::as_bytes)
        .ok_or_else(|| QuarryError::InvalidArgument(format!("{}: expected a text argument", name)))
}

fn rebuild_text(original: &Value, bytes: Vec<u8>) -> Value {
    match original {
        Value::ShortText(_) => Value::ShortText(bytes),
        Value::LongText(_) => Value::LongText(bytes),
        _ => Value::Text(bytes),
    }
}

macro_rules! builtin_functions {
    ($( $name:ident: $func_name:expr, $args:ident => $body:block ),* $(,)?) => {
        $(
            pub struct $name;
            impl Procedure for $name {
                fn next(&self, _ctx: &mut ProcContext<'_>, $args: &[Value]) -> Option<Result<Value>> {
                    Some((|| -> Result<Value> { $body })())
                }
            }
        )*
        fn register_core(reg: &mut FunctionRegistry) {
            $(reg.register($func_name, $name);)*
        }
    };
}

builtin_functions! {
    LengthFunction: "length", args => {
        match args.first() {
            Some(Value::Vector { items, .. }) => Ok(Value::UInt32(items.len() as u32)),
            Some(Value::Void) => Ok(Value::UInt32(0)),
            _ => Ok(Value::UInt32(text_arg("length", args)?.len() as u32)),
        }
    },
    UpperFunction: "upper", args => {
        let bytes = text_arg("upper", args)?;
        let upper = String::from_utf8_lossy(bytes).to_uppercase().into_bytes();
        Ok(rebuild_text(&args[0], upper))
    },
    LowerFunction: "lower", args => {
        let bytes = text_arg("lower", args)?;
        let lower = String::from_utf8_lossy(bytes).to_lowercase().into_bytes();
        Ok(rebuild_text(&args[0], lower))
    },
    AbsFunction: "abs", args => {
        match args.first() {
            Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
            Some(Value::Int64(v)) => Ok(Value::Int64(v.wrapping_abs())),
            Some(Value::UInt64(v)) => Ok(Value::UInt64(*v)),
            Some(Value::UInt32(v)) => Ok(Value::UInt32(*v)),
            Some(other) if other.domain().is_integer() => {
                let v = other.as_i64().unwrap_or(0);
                Ok(Value::Int32((v as i32).wrapping_abs()))
            }
            _ => Err(QuarryError::InvalidArgument("abs: expected a number".to_string())),
        }
    },
}

/// `regexp_match(text, pattern)`: 1 when the pattern matches anywhere in the text.
#[cfg(feature = "regex")]
pub struct RegexpMatchFunction;

#[cfg(feature = "regex")]
impl Procedure for RegexpMatchFunction {
    fn next(&self, _ctx: &mut ProcContext<'_>, args: &[Value]) -> Option<Result<Value>> {
        let run = || -> Result<Value> {
            let text = text_arg("regexp_match", args)?;
            let pattern = args
                .get(1)
                .and_then(Value::as_bytes)
                .ok_or_else(|| QuarryError::InvalidArgument("regexp_match: expected a pattern".to_string()))?;
            let re = regex::bytes::Regex::new(&String::from_utf8_lossy(pattern))
                .map_err(|e| QuarryError::InvalidArgument(format!("invalid regex: {}", e)))?;
            Ok(Value::Int32(re.is_match(text) as i32))
        };
        Some(run())
    }
}

pub fn register_builtins(reg: &mut FunctionRegistry) {
    register_core(reg);
    #[cfg(feature = "regex")]
    reg.register("regexp_match", RegexpMatchFunction);
}
