//! Script front end: a recursive-descent parser over a C-like expression syntax.
//!
//! The parser never builds a tree. Each construct is emitted through the `Compiler` as soon as
//! its operands are, so the bytecode comes out in postfix order.

use crate::compiler::Compiler;
use crate::expression::Expression;
use crate::functions::FunctionRegistry;
use crate::ir::Operator;
use crate::storage::Storage;
use crate::types::{Object, Value};
use crate::{QuarryError, Result};

/// Operator tokens, longest first so that a scan picks the longest match.
const TOKENS: &[(&str, Operator)] = &[
    (">>>=", Operator::ShiftrrAssign),
    ("<<=", Operator::ShiftlAssign),
    (">>=", Operator::ShiftrAssign),
    (">>>", Operator::ShiftRR),
    ("==", Operator::Equal),
    ("!=", Operator::NotEqual),
    ("<=", Operator::LessEqual),
    (">=", Operator::GreaterEqual),
    ("&&", Operator::And),
    ("&!", Operator::But),
    ("||", Operator::Or),
    ("+=", Operator::PlusAssign),
    ("-=", Operator::MinusAssign),
    ("*=", Operator::StarAssign),
    ("/=", Operator::SlashAssign),
    ("%=", Operator::ModAssign),
    ("&=", Operator::AndAssign),
    ("|=", Operator::OrAssign),
    ("^=", Operator::XorAssign),
    ("<<", Operator::ShiftL),
    (">>", Operator::ShiftR),
    ("++", Operator::Incr),
    ("--", Operator::Decr),
    ("@^", Operator::Prefix),
    ("@$", Operator::Suffix),
    ("=", Operator::Assign),
    ("<", Operator::Less),
    (">", Operator::Greater),
    ("|", Operator::BitwiseOr),
    ("^", Operator::BitwiseXor),
    ("&", Operator::BitwiseAnd),
    ("+", Operator::Plus),
    ("-", Operator::Minus),
    ("*", Operator::Star),
    ("/", Operator::Slash),
    ("%", Operator::Mod),
    ("@", Operator::Match),
    ("~", Operator::BitwiseNot),
];

/// Binary precedence levels, loosest first. Assignment is handled separately.
const LEVELS: &[&[Operator]] = &[
    &[Operator::Or],
    &[Operator::And, Operator::But],
    &[Operator::BitwiseOr],
    &[Operator::BitwiseXor],
    &[Operator::BitwiseAnd],
    &[Operator::Equal, Operator::NotEqual],
    &[
        Operator::Less,
        Operator::Greater,
        Operator::LessEqual,
        Operator::GreaterEqual,
        Operator::Match,
        Operator::Prefix,
        Operator::Suffix,
    ],
    &[Operator::ShiftL, Operator::ShiftR, Operator::ShiftRR],
    &[Operator::Plus, Operator::Minus],
    &[Operator::Star, Operator::Slash, Operator::Mod],
];

/// What the last parsed operand was, for assignment and increment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Field,
    Var,
    Other,
}

impl Shape {
    fn assignable(self) -> bool {
        self != Shape::Other
    }
}

pub struct ScriptParser<'a> {
    input: &'a str,
    pos: usize,
    compiler: Compiler<'a>,
    registry: &'a FunctionRegistry,
}

impl<'a> ScriptParser<'a> {
    pub fn new(input: &'a str, expr: &'a mut Expression, storage: &'a dyn Storage, registry: &'a FunctionRegistry) -> Self {
        Self { input, pos: 0, compiler: Compiler::new(expr, storage), registry }
    }

    /// Parses `input` and appends its bytecode to `expr`.
    pub fn parse(input: &str, expr: &mut Expression, storage: &dyn Storage, registry: &FunctionRegistry) -> Result<()> {
        let mut parser = ScriptParser::new(input, expr, storage, registry);
        parser.parse_assign()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(parser.error("unexpected input"));
        }
        Ok(())
    }

    fn error(&self, message: &str) -> QuarryError {
        QuarryError::ParseError(format!("{} at position {}", message, self.pos))
    }

    fn parse_assign(&mut self) -> Result<Shape> {
        let shape = self.parse_binary(0)?;
        let Some((len, op)) = self.peek_operator() else {
            return Ok(shape);
        };
        if !op.is_assign() {
            return Ok(shape);
        }
        if !shape.assignable() {
            return Err(self.error("invalid assignment target"));
        }
        self.pos += len;
        self.parse_assign()?;
        self.compiler.append_operator(op, 2)?;
        Ok(Shape::Other)
    }

    fn parse_binary(&mut self, level: usize) -> Result<Shape> {
        let Some(ops) = LEVELS.get(level) else {
            return self.parse_unary();
        };
        let mut shape = self.parse_binary(level + 1)?;
        loop {
            let Some((len, op)) = self.peek_operator().filter(|(_, op)| ops.contains(op)) else {
                return Ok(shape);
            };
            self.pos += len;
            self.parse_binary(level + 1)?;
            self.compiler.append_operator(op, 2)?;
            shape = Shape::Other;
        }
    }

    fn parse_unary(&mut self) -> Result<Shape> {
        let Some((len, op)) = self.peek_operator() else {
            return self.parse_postfix();
        };
        match op {
            Operator::Minus | Operator::Plus | Operator::BitwiseNot => {
                self.pos += len;
                self.parse_unary()?;
                self.compiler.append_operator(op, 1)?;
                Ok(Shape::Other)
            }
            Operator::Incr | Operator::Decr => {
                self.pos += len;
                if !self.parse_unary()?.assignable() {
                    return Err(self.error("invalid increment target"));
                }
                self.compiler.append_operator(op, 1)?;
                Ok(Shape::Other)
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Shape> {
        let mut shape = self.parse_primary()?;
        while let Some((len, op)) = self.peek_operator() {
            let post = match op {
                Operator::Incr => Operator::IncrPost,
                Operator::Decr => Operator::DecrPost,
                _ => break,
            };
            if !shape.assignable() {
                return Err(self.error("invalid increment target"));
            }
            self.pos += len;
            self.compiler.append_operator(post, 1)?;
            shape = Shape::Other;
        }
        Ok(shape)
    }

    fn parse_primary(&mut self) -> Result<Shape> {
        self.skip_whitespace();
        match self.peek() {
            Some('(') => {
                self.consume_char();
                self.parse_assign()?;
                self.skip_whitespace();
                if !self.consume(")") {
                    return Err(self.error("expected ')'"));
                }
                Ok(Shape::Other)
            }
            Some('"') => {
                let s = self.parse_string_literal()?;
                self.compiler.append_constant(Value::text(s), Operator::Push, 1)?;
                Ok(Shape::Other)
            }
            Some('$') => {
                self.consume_char();
                let name = self.parse_identifier()?;
                let expr = self.compiler.expression();
                let var = expr
                    .var(&format!("${}", name))
                    .or_else(|| expr.var(&name))
                    .ok_or_else(|| self.error(&format!("unknown variable ${}", name)))?;
                self.compiler.append_var(var, Operator::Push, 1)?;
                Ok(Shape::Var)
            }
            Some(c) if c.is_ascii_digit() => {
                match self.parse_number()? {
                    Value::Int32(i) => self.compiler.append_constant_int(i, Operator::Push, 1)?,
                    Value::Float(f) => self.compiler.append_constant_float(f, Operator::Push, 1)?,
                    value => self.compiler.append_constant(value, Operator::Push, 1)?,
                };
                Ok(Shape::Other)
            }
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_name(),
            _ => Err(self.error("expected expression")),
        }
    }

    /// Literal keyword, function call, or field chain.
    fn parse_name(&mut self) -> Result<Shape> {
        let name = self.parse_identifier()?;
        match name.as_str() {
            "true" | "false" => {
                self.compiler.append_constant(Value::Bool(name == "true"), Operator::Push, 1)?;
                return Ok(Shape::Other);
            }
            _ => {}
        }
        self.skip_whitespace();
        if self.peek() == Some('(') {
            self.consume_char();
            return self.parse_call(&name);
        }
        self.compiler.append_constant_str(&name, Operator::GetValue, 1)?;
        while self.peek() == Some('.') {
            self.consume_char();
            let field = self.parse_identifier()?;
            self.compiler.append_constant_str(&field, Operator::GetValue, 2)?;
        }
        Ok(Shape::Field)
    }

    fn parse_call(&mut self, name: &str) -> Result<Shape> {
        let proc = self
            .registry
            .get(name)
            .ok_or_else(|| self.error(&format!("unknown function {}", name)))?
            .clone();
        self.compiler.append_object(Object::Procedure(proc), Operator::Push, 1)?;
        let mut nargs = 0;
        self.skip_whitespace();
        if !self.consume(")") {
            loop {
                self.parse_assign()?;
                nargs += 1;
                self.skip_whitespace();
                if self.consume(",") {
                    continue;
                }
                if self.consume(")") {
                    break;
                }
                return Err(self.error("expected ',' or ')' after function argument"));
            }
        }
        self.compiler.append_operator(Operator::Call, nargs)?;
        Ok(Shape::Other)
    }

    fn parse_identifier(&mut self) -> Result<String> {
        let start = self.pos;
        let mut end = self.pos;
        for (i, c) in self.input[self.pos..].char_indices() {
            if c.is_alphanumeric() || c == '_' {
                end = self.pos + i + c.len_utf8();
            } else {
                break;
            }
        }
        if end == start {
            return Err(self.error("expected identifier"));
        }
        self.pos = end;
        Ok(self.input[start..end].to_string())
    }

    /// Integers take the narrowest of Int32, UInt32, Int64 and UInt64 that holds them.
    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        let mut float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {}
                '.' if !float => float = true,
                'e' | 'E' => {
                    float = true;
                    self.consume_char();
                    if matches!(self.peek(), Some('+' | '-')) {
                        self.consume_char();
                    }
                    continue;
                }
                _ => break,
            }
            self.consume_char();
        }
        let text = &self.input[start..self.pos];
        if float {
            return text
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| QuarryError::ParseError(format!("invalid float literal at position {}", start)));
        }
        let n: u64 = text
            .parse()
            .map_err(|_| QuarryError::ParseError(format!("integer literal out of range at position {}", start)))?;
        let value = if let Ok(v) = i32::try_from(n) {
            Value::Int32(v)
        } else if let Ok(v) = u32::try_from(n) {
            Value::UInt32(v)
        } else if let Ok(v) = i64::try_from(n) {
            Value::Int64(v)
        } else {
            Value::UInt64(n)
        };
        Ok(value)
    }

    fn parse_string_literal(&mut self) -> Result<String> {
        self.consume_char();
        let mut s = String::new();
        loop {
            match self.consume_char() {
                Some('"') => return Ok(s),
                Some('\\') => match self.consume_char() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(c) => s.push(c),
                    None => break,
                },
                Some(c) => s.push(c),
                None => break,
            }
        }
        Err(self.error("unterminated string literal"))
    }

    /// Longest operator token after any whitespace, without consuming it.
    fn peek_operator(&mut self) -> Option<(usize, Operator)> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];
        TOKENS
            .iter()
            .find(|(token, _)| rest.starts_with(token))
            .map(|(token, op)| (token.len(), *op))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.consume_char();
            } else {
                break;
            }
        }
    }

    fn consume(&mut self, s: &str) -> bool {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn consume_char(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }
}
