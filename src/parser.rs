//! Recursive-descent parser over the Yul grammar.
//!
//! The entry point parses a top-level object; bare blocks are accepted
//! too and wrapped in a synthetic object, which keeps small fixtures and
//! solc fragments usable. Recovery skips to the next top-level brace so
//! several parse errors can be reported from one run.

use crate::ast::{
    Block, Call, DataItem, Expression, FunctionDef, Literal, LiteralValue, Object, Statement,
    SwitchCase,
};
use crate::lexer::{parse_word, LexError, Lexer, Span, Token, TokenKind};
use num_bigint::BigUint;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("expected {expected} but found {found} at {span}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("unexpected end of input")]
    UnexpectedEof { span: Span },

    #[error("invalid literal '{text}' at {span}")]
    InvalidLiteral { text: String, span: Span },

    #[error("'default' must be the last switch clause at {span}")]
    MisplacedDefault { span: Span },

    #[error("switch needs at least one case or a default at {span}")]
    EmptySwitch { span: Span },

    #[error(transparent)]
    Lex(#[from] LexError),
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. }
            | ParseError::UnexpectedEof { span }
            | ParseError::InvalidLiteral { span, .. }
            | ParseError::MisplacedDefault { span }
            | ParseError::EmptySwitch { span } => *span,
            ParseError::Lex(err) => err.span(),
        }
    }
}

/// Lexes and parses a source text in one step.
///
/// Returns the object when one could be built alongside any recorded
/// errors; callers treat a non-empty error list as a failed parse.
pub fn parse_source(source: &str) -> (Option<Object>, Vec<ParseError>) {
    let tokens = match Lexer::new(source).tokenize() {
        Ok(tokens) => tokens,
        Err(err) => return (None, vec![ParseError::Lex(err)]),
    };
    let mut parser = Parser::new(tokens);
    parser.parse()
}

#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    errors: Vec<ParseError>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            errors: Vec::new(),
        }
    }

    /// Parses the token stream into a single top-level object.
    pub fn parse(&mut self) -> (Option<Object>, Vec<ParseError>) {
        let object = match self.peek_kind() {
            TokenKind::Object => match self.parse_object() {
                Ok(object) => Some(object),
                Err(err) => {
                    self.errors.push(err);
                    None
                }
            },
            TokenKind::LBrace => {
                // Bare block: wrap in an implicit object so the rest of
                // the pipeline sees a uniform shape.
                let start = self.peek_span();
                match self.parse_block() {
                    Ok(code) => Some(Object {
                        name: "main".to_string(),
                        span: start.to(code.span),
                        code,
                        sub_objects: Vec::new(),
                        data_items: Vec::new(),
                    }),
                    Err(err) => {
                        self.errors.push(err);
                        None
                    }
                }
            }
            _ => {
                self.errors.push(self.unexpected("'object' or '{'"));
                None
            }
        };

        if object.is_some() && !self.at_eof() && self.errors.is_empty() {
            self.errors.push(self.unexpected("end of input"));
        }

        (object, std::mem::take(&mut self.errors))
    }

    fn parse_object(&mut self) -> Result<Object, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::Object)?;
        let name = self.expect(TokenKind::Str)?.lexeme;
        self.expect(TokenKind::LBrace)?;

        let mut code = None;
        let mut sub_objects = Vec::new();
        let mut data_items = Vec::new();

        while !self.check(TokenKind::RBrace) && !self.at_eof() {
            match self.peek_kind() {
                TokenKind::Code => {
                    self.advance();
                    match self.parse_block() {
                        Ok(block) => code = Some(block),
                        Err(err) => {
                            self.errors.push(err);
                            self.recover_to_top_brace();
                        }
                    }
                }
                TokenKind::Object => match self.parse_object() {
                    Ok(object) => sub_objects.push(object),
                    Err(err) => {
                        self.errors.push(err);
                        self.recover_to_top_brace();
                    }
                },
                TokenKind::Data => {
                    self.advance();
                    match self.parse_data_item() {
                        Ok(item) => data_items.push(item),
                        Err(err) => {
                            self.errors.push(err);
                            self.recover_to_top_brace();
                        }
                    }
                }
                _ => {
                    let err = self.unexpected("'code', 'object' or 'data'");
                    self.errors.push(err);
                    self.recover_to_top_brace();
                }
            }
        }

        let end = self.peek_span();
        self.expect(TokenKind::RBrace)?;

        Ok(Object {
            name,
            code: code.unwrap_or_default(),
            sub_objects,
            data_items,
            span: start.to(end),
        })
    }

    fn parse_data_item(&mut self) -> Result<DataItem, ParseError> {
        let name_token = self.expect(TokenKind::Str)?;
        let payload_token = self.advance().clone();
        let (payload, is_hex) = match payload_token.kind {
            TokenKind::HexStr => (
                hex::decode(&payload_token.lexeme).map_err(|_| ParseError::InvalidLiteral {
                    text: payload_token.lexeme.clone(),
                    span: payload_token.span,
                })?,
                true,
            ),
            TokenKind::Str => (payload_token.lexeme.clone().into_bytes(), false),
            _ => {
                return Err(ParseError::UnexpectedToken {
                    expected: "string or hex string".to_string(),
                    found: payload_token.kind.to_string(),
                    span: payload_token.span,
                })
            }
        };
        Ok(DataItem {
            name: name_token.lexeme,
            payload,
            is_hex,
            span: name_token.span.to(payload_token.span),
        })
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::LBrace)?;
        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_eof() {
            statements.push(self.parse_statement()?);
        }
        let end = self.peek_span();
        self.expect(TokenKind::RBrace)?;
        Ok(Block {
            statements,
            span: start.to(end),
        })
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek_kind() {
            TokenKind::LBrace => Ok(Statement::Block(self.parse_block()?)),
            TokenKind::Function => Ok(Statement::FunctionDef(self.parse_function()?)),
            TokenKind::Let => self.parse_var_decl(),
            TokenKind::If => self.parse_if(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break => {
                let span = self.advance().span;
                Ok(Statement::Break(span))
            }
            TokenKind::Continue => {
                let span = self.advance().span;
                Ok(Statement::Continue(span))
            }
            TokenKind::Leave => {
                let span = self.advance().span;
                Ok(Statement::Leave(span))
            }
            TokenKind::Ident => self.parse_assign_or_expr(),
            TokenKind::Number | TokenKind::HexNumber | TokenKind::Str | TokenKind::True
            | TokenKind::False => {
                let expr = self.parse_expression()?;
                Ok(Statement::Expr(expr))
            }
            _ => Err(self.unexpected("statement")),
        }
    }

    fn parse_function(&mut self) -> Result<FunctionDef, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::Function)?;
        let name = self.expect(TokenKind::Ident)?.lexeme;

        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            params.push(self.expect(TokenKind::Ident)?.lexeme);
            while self.eat(TokenKind::Comma) {
                params.push(self.expect(TokenKind::Ident)?.lexeme);
            }
        }
        self.expect(TokenKind::RParen)?;

        let mut returns = Vec::new();
        if self.eat(TokenKind::Arrow) {
            returns.push(self.expect(TokenKind::Ident)?.lexeme);
            while self.eat(TokenKind::Comma) {
                returns.push(self.expect(TokenKind::Ident)?.lexeme);
            }
        }

        let body = self.parse_block()?;
        let span = start.to(body.span);
        Ok(FunctionDef {
            name,
            params,
            returns,
            body,
            span,
        })
    }

    fn parse_var_decl(&mut self) -> Result<Statement, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::Let)?;
        let mut names = vec![self.expect(TokenKind::Ident)?.lexeme];
        while self.eat(TokenKind::Comma) {
            names.push(self.expect(TokenKind::Ident)?.lexeme);
        }
        let init = if self.eat(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let end = init.as_ref().map(|e| e.span()).unwrap_or(start);
        Ok(Statement::VarDecl {
            names,
            init,
            span: start.to(end),
        })
    }

    fn parse_assign_or_expr(&mut self) -> Result<Statement, ParseError> {
        let start = self.peek_span();
        // An identifier starts either a call expression, or a (possibly
        // multi-target) assignment. One token of lookahead past the
        // identifier list decides.
        let checkpoint = self.current;
        let mut targets = vec![self.expect(TokenKind::Ident)?.lexeme];
        while self.check(TokenKind::Comma) {
            self.advance();
            if !self.check(TokenKind::Ident) {
                break;
            }
            targets.push(self.advance().lexeme.clone());
        }
        if self.eat(TokenKind::Assign) {
            let value = self.parse_expression()?;
            let span = start.to(value.span());
            return Ok(Statement::Assign {
                targets,
                value,
                span,
            });
        }

        self.current = checkpoint;
        let expr = self.parse_expression()?;
        Ok(Statement::Expr(expr))
    }

    fn parse_if(&mut self) -> Result<Statement, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::If)?;
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        let span = start.to(body.span);
        Ok(Statement::If {
            condition,
            body,
            span,
        })
    }

    fn parse_switch(&mut self) -> Result<Statement, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::Switch)?;
        let scrutinee = self.parse_expression()?;

        let mut cases = Vec::new();
        let mut default = None;
        let mut end = scrutinee.span();

        loop {
            if self.check(TokenKind::Case) {
                if default.is_some() {
                    return Err(ParseError::MisplacedDefault {
                        span: self.peek_span(),
                    });
                }
                let case_start = self.advance().span;
                let value = self.parse_literal()?;
                let body = self.parse_block()?;
                end = body.span;
                cases.push(SwitchCase {
                    value,
                    span: case_start.to(end),
                    body,
                });
            } else if self.check(TokenKind::Default) {
                if default.is_some() {
                    return Err(ParseError::MisplacedDefault {
                        span: self.peek_span(),
                    });
                }
                self.advance();
                let body = self.parse_block()?;
                end = body.span;
                default = Some(body);
            } else {
                break;
            }
        }

        if cases.is_empty() && default.is_none() {
            return Err(ParseError::EmptySwitch {
                span: scrutinee.span(),
            });
        }

        Ok(Statement::Switch {
            scrutinee,
            cases,
            default,
            span: start.to(end),
        })
    }

    fn parse_for(&mut self) -> Result<Statement, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::For)?;
        let init = self.parse_block()?;
        let condition = self.parse_expression()?;
        let post = self.parse_block()?;
        let body = self.parse_block()?;
        let span = start.to(body.span);
        Ok(Statement::For {
            init,
            condition,
            post,
            body,
            span,
        })
    }

    fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        match self.peek_kind() {
            TokenKind::Number | TokenKind::HexNumber | TokenKind::Str | TokenKind::True
            | TokenKind::False => Ok(Expression::Literal(self.parse_literal()?)),
            TokenKind::Ident => {
                let ident = self.advance().clone();
                if self.check(TokenKind::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        args.push(self.parse_expression()?);
                        while self.eat(TokenKind::Comma) {
                            args.push(self.parse_expression()?);
                        }
                    }
                    let close = self.peek_span();
                    self.expect(TokenKind::RParen)?;
                    Ok(Expression::Call(Call {
                        callee: ident.lexeme,
                        callee_span: ident.span,
                        args,
                        span: ident.span.to(close),
                    }))
                } else {
                    Ok(Expression::Ident {
                        name: ident.lexeme,
                        span: ident.span,
                    })
                }
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        let token = self.advance().clone();
        let value = match token.kind {
            TokenKind::Number | TokenKind::HexNumber => {
                let word: BigUint =
                    parse_word(&token.lexeme).ok_or_else(|| ParseError::InvalidLiteral {
                        text: token.lexeme.clone(),
                        span: token.span,
                    })?;
                LiteralValue::Number(word)
            }
            TokenKind::Str => LiteralValue::Str(token.lexeme.clone()),
            TokenKind::True => LiteralValue::Bool(true),
            TokenKind::False => LiteralValue::Bool(false),
            _ => {
                return Err(ParseError::UnexpectedToken {
                    expected: "literal".to_string(),
                    found: token.kind.to_string(),
                    span: token.span,
                })
            }
        };
        Ok(Literal {
            value,
            span: token.span,
        })
    }

    // --- cursor helpers ---------------------------------------------------

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.current)
            .unwrap_or_else(|| self.tokens.last().expect("token stream ends with EOF"))
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind.clone()
    }

    fn peek_span(&self) -> Span {
        self.peek().span
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> &Token {
        let index = self.current;
        if !self.at_eof() {
            self.current += 1;
        }
        &self.tokens[index]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.check(kind.clone()) {
            Ok(self.advance().clone())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: kind.to_string(),
                found: self.peek().kind.to_string(),
                span: self.peek_span(),
            })
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: self.peek().kind.to_string(),
            span: self.peek_span(),
        }
    }

    /// Error recovery: skip forward until a token that can start a new
    /// object member. An unmatched closing brace is consumed, because it
    /// closes whatever block the failing parse had already opened.
    fn recover_to_top_brace(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            match self.peek_kind() {
                TokenKind::LBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RBrace => {
                    self.advance();
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Code | TokenKind::Object | TokenKind::Data if depth == 0 => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_ok(source: &str) -> Object {
        let (object, errors) = parse_source(source);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        object.unwrap()
    }

    #[test]
    fn object_with_code_data_and_subobject() {
        let object = parse_ok(
            r#"
            object "Token" {
                code { let x := 1 }
                object "runtime" {
                    code { sstore(0, 1) }
                }
                data "meta" hex"c0fe"
            }
            "#,
        );
        assert_eq!(object.name, "Token");
        assert_eq!(object.code.statements.len(), 1);
        assert_eq!(object.sub_objects.len(), 1);
        assert_eq!(object.data_items[0].payload, vec![0xc0, 0xfe]);
    }

    #[test]
    fn bare_block_becomes_implicit_object() {
        let object = parse_ok("{ let x := add(1, 2) }");
        assert_eq!(object.name, "main");
        assert_eq!(object.code.statements.len(), 1);
    }

    #[test]
    fn function_with_params_and_returns() {
        let object = parse_ok("{ function f(a, b) -> c, d { c := a d := b } }");
        match &object.code.statements[0] {
            Statement::FunctionDef(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.params, vec!["a", "b"]);
                assert_eq!(def.returns, vec!["c", "d"]);
            }
            other => panic!("expected function def, got {other:?}"),
        }
    }

    #[test]
    fn multi_assignment() {
        let object = parse_ok("{ function f() -> a, b {} let x, y := f() x, y := f() }");
        match &object.code.statements[2] {
            Statement::Assign { targets, .. } => assert_eq!(targets, &["x", "y"]),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn switch_cases_and_default() {
        let object = parse_ok(
            "{ switch calldataload(0) case 0 { leave } case 1 { leave } default { revert(0, 0) } }",
        );
        match &object.code.statements[0] {
            Statement::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 2);
                assert!(default.is_some());
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn default_must_be_last() {
        let (_, errors) =
            parse_source("{ switch 1 default { } case 0 { } }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, ParseError::MisplacedDefault { .. })));
    }

    #[test]
    fn for_loop_shape() {
        let object = parse_ok(
            "{ for { let i := 0 } lt(i, 10) { i := add(i, 1) } { if eq(i, 5) { break } } }",
        );
        match &object.code.statements[0] {
            Statement::For { init, body, .. } => {
                assert_eq!(init.statements.len(), 1);
                assert_eq!(body.statements.len(), 1);
            }
            other => panic!("expected for loop, got {other:?}"),
        }
    }

    #[test]
    fn recovery_reports_and_continues() {
        let (object, errors) = parse_source(
            r#"
            object "Broken" {
                code { let := 1 }
                object "runtime" { code { let ok := 1 } }
            }
            "#,
        );
        assert!(!errors.is_empty());
        // The runtime sub-object still parsed.
        let object = object.expect("object survives recovery");
        assert_eq!(object.sub_objects.len(), 1);
    }

    #[test]
    fn pretty_print_round_trip() {
        let source = r#"
            object "C" {
                code {
                    function f(a) -> r { r := mul(a, a) }
                    let x := f(7)
                    if lt(x, 50) { x := add(x, 1) }
                    switch x case 50 { leave } default { revert(0, 0) }
                    for { let i := 0 } lt(i, x) { i := add(i, 1) } { continue }
                }
                object "runtime" { code { } }
                data "blob" hex"0011"
            }
        "#;
        let first = parse_ok(source);
        let printed = first.to_string();
        let second = parse_ok(&printed);
        // Spans differ between the two parses; the printed canonical
        // form is the span-independent structural fingerprint.
        assert_eq!(second.to_string(), printed);
    }
}
