//! Yul abstract syntax tree.
//!
//! Statements and expressions are tagged sum types; visitors are plain
//! functions that match exhaustively. Every node carries the [`Span`] of
//! the source region it was parsed from.
//!
//! `Display` renders a canonical form of the tree. Reparsing that form
//! yields a structurally equal tree, which the round-trip tests rely on.

use crate::lexer::Span;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level Yul object: a `code` block plus nested objects and `data`
/// items. solc emits the deploy code at the top level and the runtime as
/// a nested object, typically named `"<Contract>_deployed"` or
/// `"runtime"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub name: String,
    pub code: Block,
    pub sub_objects: Vec<Object>,
    pub data_items: Vec<DataItem>,
    pub span: Span,
}

impl Object {
    /// The nested object holding the runtime code, when present.
    pub fn runtime_object(&self) -> Option<&Object> {
        self.sub_objects
            .iter()
            .find(|o| o.name == "runtime" || o.name.ends_with("_deployed"))
            .or_else(|| self.sub_objects.first())
    }
}

/// A named `data` segment inside an object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub name: String,
    pub payload: Vec<u8>,
    /// True when written as `hex"…"`, kept for pretty-printing.
    pub is_hex: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub statements: Vec<Statement>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    VarDecl {
        names: Vec<String>,
        init: Option<Expression>,
        span: Span,
    },
    Assign {
        targets: Vec<String>,
        value: Expression,
        span: Span,
    },
    Expr(Expression),
    If {
        condition: Expression,
        body: Block,
        span: Span,
    },
    Switch {
        scrutinee: Expression,
        cases: Vec<SwitchCase>,
        default: Option<Block>,
        span: Span,
    },
    For {
        init: Block,
        condition: Expression,
        post: Block,
        body: Block,
        span: Span,
    },
    Break(Span),
    Continue(Span),
    Leave(Span),
    FunctionDef(FunctionDef),
    Block(Block),
}

impl Statement {
    pub fn span(&self) -> Span {
        match self {
            Statement::VarDecl { span, .. }
            | Statement::Assign { span, .. }
            | Statement::If { span, .. }
            | Statement::Switch { span, .. }
            | Statement::For { span, .. } => *span,
            Statement::Expr(expr) => expr.span(),
            Statement::Break(span) | Statement::Continue(span) | Statement::Leave(span) => *span,
            Statement::FunctionDef(def) => def.span,
            Statement::Block(block) => block.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub value: Literal,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub returns: Vec<String>,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    Ident { name: String, span: Span },
    Call(Call),
}

impl Expression {
    pub fn span(&self) -> Span {
        match self {
            Expression::Literal(lit) => lit.span,
            Expression::Ident { span, .. } => *span,
            Expression::Call(call) => call.span,
        }
    }

    /// The 256-bit value of a numeric literal expression, if it is one.
    pub fn constant_word(&self) -> Option<&BigUint> {
        match self {
            Expression::Literal(Literal {
                value: LiteralValue::Number(word),
                ..
            }) => Some(word),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: String,
    pub callee_span: Span,
    pub args: Vec<Expression>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: LiteralValue,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    /// Decimal or hex number, reduced mod 2^256.
    Number(BigUint),
    /// Double-quoted string; the word value is the bytes left-aligned in
    /// a 32-byte word, per Yul string-literal semantics.
    Str(String),
    Bool(bool),
}

impl Literal {
    /// The literal as a 256-bit word, per Yul's single value type.
    pub fn as_word(&self) -> BigUint {
        match &self.value {
            LiteralValue::Number(word) => word.clone(),
            LiteralValue::Bool(b) => BigUint::from(u8::from(*b)),
            LiteralValue::Str(text) => {
                let mut bytes = text.as_bytes().to_vec();
                bytes.truncate(32);
                bytes.resize(32, 0);
                BigUint::from_bytes_be(&bytes)
            }
        }
    }
}

/// Metadata attached to a parsed source, reported in statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    pub token_count: usize,
    pub function_count: usize,
}

// --- pretty printer -------------------------------------------------------

struct Indent(usize);

impl fmt::Display for Indent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for _ in 0..self.0 {
            f.write_str("    ")?;
        }
        Ok(())
    }
}

impl Object {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "{}object \"{}\" {{", Indent(depth), self.name)?;
        writeln!(f, "{}code", Indent(depth + 1))?;
        self.code.fmt_indented(f, depth + 1)?;
        for sub in &self.sub_objects {
            sub.fmt_indented(f, depth + 1)?;
        }
        for item in &self.data_items {
            if item.is_hex {
                writeln!(
                    f,
                    "{}data \"{}\" hex\"{}\"",
                    Indent(depth + 1),
                    item.name,
                    hex::encode(&item.payload)
                )?;
            } else {
                writeln!(
                    f,
                    "{}data \"{}\" \"{}\"",
                    Indent(depth + 1),
                    item.name,
                    String::from_utf8_lossy(&item.payload)
                )?;
            }
        }
        writeln!(f, "{}}}", Indent(depth))
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl Block {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "{}{{", Indent(depth))?;
        for statement in &self.statements {
            statement.fmt_indented(f, depth + 1)?;
        }
        writeln!(f, "{}}}", Indent(depth))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl Statement {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Statement::VarDecl { names, init, .. } => {
                write!(f, "{}let {}", Indent(depth), names.join(", "))?;
                if let Some(expr) = init {
                    write!(f, " := {expr}")?;
                }
                writeln!(f)
            }
            Statement::Assign { targets, value, .. } => {
                writeln!(f, "{}{} := {value}", Indent(depth), targets.join(", "))
            }
            Statement::Expr(expr) => writeln!(f, "{}{expr}", Indent(depth)),
            Statement::If { condition, body, .. } => {
                writeln!(f, "{}if {condition}", Indent(depth))?;
                body.fmt_indented(f, depth)
            }
            Statement::Switch {
                scrutinee,
                cases,
                default,
                ..
            } => {
                writeln!(f, "{}switch {scrutinee}", Indent(depth))?;
                for case in cases {
                    writeln!(f, "{}case {}", Indent(depth), case.value)?;
                    case.body.fmt_indented(f, depth)?;
                }
                if let Some(block) = default {
                    writeln!(f, "{}default", Indent(depth))?;
                    block.fmt_indented(f, depth)?;
                }
                Ok(())
            }
            Statement::For {
                init,
                condition,
                post,
                body,
                ..
            } => {
                writeln!(f, "{}for", Indent(depth))?;
                init.fmt_indented(f, depth)?;
                writeln!(f, "{}{condition}", Indent(depth))?;
                post.fmt_indented(f, depth)?;
                body.fmt_indented(f, depth)
            }
            Statement::Break(_) => writeln!(f, "{}break", Indent(depth)),
            Statement::Continue(_) => writeln!(f, "{}continue", Indent(depth)),
            Statement::Leave(_) => writeln!(f, "{}leave", Indent(depth)),
            Statement::FunctionDef(def) => {
                write!(f, "{}function {}({})", Indent(depth), def.name, def.params.join(", "))?;
                if !def.returns.is_empty() {
                    write!(f, " -> {}", def.returns.join(", "))?;
                }
                writeln!(f)?;
                def.body.fmt_indented(f, depth)
            }
            Statement::Block(block) => block.fmt_indented(f, depth),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(lit) => write!(f, "{lit}"),
            Expression::Ident { name, .. } => f.write_str(name),
            Expression::Call(call) => {
                write!(f, "{}(", call.callee)?;
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            LiteralValue::Number(word) => write!(f, "{word}"),
            LiteralValue::Str(text) => {
                f.write_str("\"")?;
                for ch in text.chars() {
                    match ch {
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        '\\' => f.write_str("\\\\")?,
                        '"' => f.write_str("\\\"")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            LiteralValue::Bool(true) => f.write_str("true"),
            LiteralValue::Bool(false) => f.write_str("false"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: u64) -> Expression {
        Expression::Literal(Literal {
            value: LiteralValue::Number(BigUint::from(n)),
            span: Span::default(),
        })
    }

    #[test]
    fn string_literal_word_is_left_aligned() {
        let lit = Literal {
            value: LiteralValue::Str("ab".to_string()),
            span: Span::default(),
        };
        let word = lit.as_word();
        // 'a' = 0x61 in the most significant byte.
        assert_eq!(word.to_bytes_be()[0], 0x61);
    }

    #[test]
    fn call_prints_parenthesized() {
        let call = Expression::Call(Call {
            callee: "add".to_string(),
            callee_span: Span::default(),
            args: vec![num(1), num(2)],
            span: Span::default(),
        });
        assert_eq!(call.to_string(), "add(1, 2)");
    }

    #[test]
    fn runtime_object_prefers_canonical_names() {
        let mk = |name: &str| Object {
            name: name.to_string(),
            code: Block::default(),
            sub_objects: Vec::new(),
            data_items: Vec::new(),
            span: Span::default(),
        };
        let mut top = mk("Token");
        top.sub_objects.push(mk("meta"));
        top.sub_objects.push(mk("Token_deployed"));
        assert_eq!(top.runtime_object().unwrap().name, "Token_deployed");
    }
}
