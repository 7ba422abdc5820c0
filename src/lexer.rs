//! Yul lexer.
//!
//! Single-pass byte cursor over UTF-8 source. Whitespace and both comment
//! forms are skipped; identifiers admit the dot so solc-generated names
//! such as `abi_encode_t_uint256_to_t_uint256` and `datasize`-style paths
//! survive intact. Number literals are kept as 256-bit words.

use num_bigint::BigUint;
use num_traits::Num;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Position and extent of a token or AST node in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn new(line: u32, column: u32, offset: usize, len: usize) -> Self {
        Self {
            line,
            column,
            offset,
            len,
        }
    }

    /// Extends this span to cover `other`.
    pub fn to(self, other: Span) -> Span {
        let end = other.offset + other.len;
        Span {
            len: end.saturating_sub(self.offset),
            ..self
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    Object,
    Code,
    Data,
    Function,
    Let,
    If,
    Switch,
    Case,
    Default,
    For,
    Break,
    Continue,
    Leave,
    True,
    False,

    // Literals and names
    Ident,
    Number,
    HexNumber,
    Str,
    /// `hex"…"` literal, payload already decoded.
    HexStr,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Assign, // :=
    Arrow,  // ->

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TokenKind::Object => "'object'",
            TokenKind::Code => "'code'",
            TokenKind::Data => "'data'",
            TokenKind::Function => "'function'",
            TokenKind::Let => "'let'",
            TokenKind::If => "'if'",
            TokenKind::Switch => "'switch'",
            TokenKind::Case => "'case'",
            TokenKind::Default => "'default'",
            TokenKind::For => "'for'",
            TokenKind::Break => "'break'",
            TokenKind::Continue => "'continue'",
            TokenKind::Leave => "'leave'",
            TokenKind::True => "'true'",
            TokenKind::False => "'false'",
            TokenKind::Ident => "identifier",
            TokenKind::Number => "number",
            TokenKind::HexNumber => "hex number",
            TokenKind::Str => "string",
            TokenKind::HexStr => "hex string",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::Comma => "','",
            TokenKind::Colon => "':'",
            TokenKind::Assign => "':='",
            TokenKind::Arrow => "'->'",
            TokenKind::Eof => "end of input",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: Span,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at {span}")]
    UnexpectedCharacter { ch: char, span: Span },

    #[error("unterminated string literal starting at {span}")]
    UnterminatedString { span: Span },

    #[error("unterminated block comment starting at {span}")]
    UnterminatedComment { span: Span },

    #[error("invalid escape sequence '{escape}' at {span}")]
    InvalidEscape { escape: String, span: Span },

    #[error("malformed number '{text}' at {span}")]
    MalformedNumber { text: String, span: Span },

    #[error("odd-length or invalid hex payload at {span}")]
    InvalidHexPayload { span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::UnterminatedComment { span }
            | LexError::InvalidEscape { span, .. }
            | LexError::MalformedNumber { span, .. }
            | LexError::InvalidHexPayload { span } => *span,
        }
    }
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("object", TokenKind::Object);
    map.insert("code", TokenKind::Code);
    map.insert("data", TokenKind::Data);
    map.insert("function", TokenKind::Function);
    map.insert("let", TokenKind::Let);
    map.insert("if", TokenKind::If);
    map.insert("switch", TokenKind::Switch);
    map.insert("case", TokenKind::Case);
    map.insert("default", TokenKind::Default);
    map.insert("for", TokenKind::For);
    map.insert("break", TokenKind::Break);
    map.insert("continue", TokenKind::Continue);
    map.insert("leave", TokenKind::Leave);
    map.insert("true", TokenKind::True);
    map.insert("false", TokenKind::False);
    map
});

/// Byte-cursor lexer. Restartable over a string, single pass per source.
#[derive(Debug)]
pub struct Lexer<'a> {
    input: &'a [u8],
    position: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            input: source.as_bytes(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenizes the whole input, appending a final EOF token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> u8 {
        *self.input.get(self.position).unwrap_or(&0)
    }

    fn peek_at(&self, ahead: usize) -> u8 {
        *self.input.get(self.position + ahead).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let ch = self.peek();
        if ch != 0 {
            self.position += 1;
            if ch == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        ch
    }

    fn here(&self, len: usize) -> Span {
        Span::new(self.line, self.column, self.position, len)
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'/' if self.peek_at(1) == b'/' => {
                    while self.peek() != b'\n' && self.peek() != 0 {
                        self.bump();
                    }
                }
                b'/' if self.peek_at(1) == b'*' => {
                    let start = self.here(2);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            0 => return Err(LexError::UnterminatedComment { span: start }),
                            b'*' if self.peek_at(1) == b'/' => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia()?;

        let start = self.here(0);
        let ch = self.peek();

        let simple = |kind: TokenKind, lexeme: &str| Token {
            kind,
            lexeme: lexeme.to_string(),
            span: Span { len: lexeme.len(), ..start },
        };

        match ch {
            0 => Ok(simple(TokenKind::Eof, "")),
            b'(' => {
                self.bump();
                Ok(simple(TokenKind::LParen, "("))
            }
            b')' => {
                self.bump();
                Ok(simple(TokenKind::RParen, ")"))
            }
            b'{' => {
                self.bump();
                Ok(simple(TokenKind::LBrace, "{"))
            }
            b'}' => {
                self.bump();
                Ok(simple(TokenKind::RBrace, "}"))
            }
            b',' => {
                self.bump();
                Ok(simple(TokenKind::Comma, ","))
            }
            b':' => {
                self.bump();
                if self.peek() == b'=' {
                    self.bump();
                    Ok(simple(TokenKind::Assign, ":="))
                } else {
                    Ok(simple(TokenKind::Colon, ":"))
                }
            }
            b'-' => {
                self.bump();
                if self.peek() == b'>' {
                    self.bump();
                    Ok(simple(TokenKind::Arrow, "->"))
                } else {
                    Err(LexError::UnexpectedCharacter { ch: '-', span: start })
                }
            }
            b'"' => self.read_string(start),
            b'0'..=b'9' => self.read_number(start),
            c if c.is_ascii_alphabetic() || c == b'_' => self.read_identifier(start),
            other => Err(LexError::UnexpectedCharacter {
                ch: other as char,
                span: start,
            }),
        }
    }

    fn read_string(&mut self, start: Span) -> Result<Token, LexError> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                0 => return Err(LexError::UnterminatedString { span: start }),
                b'"' => break,
                b'\n' => return Err(LexError::UnterminatedString { span: start }),
                b'\\' => {
                    let esc = self.bump();
                    match esc {
                        b'n' => value.push('\n'),
                        b't' => value.push('\t'),
                        b'r' => value.push('\r'),
                        b'\\' => value.push('\\'),
                        b'"' => value.push('"'),
                        b'0' => value.push('\0'),
                        b'x' => {
                            let hi = self.bump();
                            let lo = self.bump();
                            let pair = [hi, lo];
                            let text = std::str::from_utf8(&pair).unwrap_or("??");
                            match u8::from_str_radix(text, 16) {
                                Ok(byte) => value.push(byte as char),
                                Err(_) => {
                                    return Err(LexError::InvalidEscape {
                                        escape: format!("\\x{text}"),
                                        span: start,
                                    })
                                }
                            }
                        }
                        other => {
                            return Err(LexError::InvalidEscape {
                                escape: format!("\\{}", other as char),
                                span: start,
                            })
                        }
                    }
                }
                byte => value.push(byte as char),
            }
        }
        let len = self.position - start.offset;
        Ok(Token {
            kind: TokenKind::Str,
            lexeme: value,
            span: Span { len, ..start },
        })
    }

    fn read_number(&mut self, start: Span) -> Result<Token, LexError> {
        if self.peek() == b'0' && (self.peek_at(1) == b'x' || self.peek_at(1) == b'X') {
            self.bump();
            self.bump();
            let digits_start = self.position;
            while self.peek().is_ascii_hexdigit() {
                self.bump();
            }
            let digits = &self.input[digits_start..self.position];
            if digits.is_empty() || self.peek().is_ascii_alphanumeric() {
                let text = self.raw_slice(start.offset);
                return Err(LexError::MalformedNumber {
                    text,
                    span: Span { len: self.position - start.offset, ..start },
                });
            }
            let lexeme = self.raw_slice(start.offset);
            return Ok(Token {
                kind: TokenKind::HexNumber,
                lexeme,
                span: Span { len: self.position - start.offset, ..start },
            });
        }

        while self.peek().is_ascii_digit() {
            self.bump();
        }
        // `123abc` is one malformed token, not a number then identifier.
        if self.peek().is_ascii_alphabetic() || self.peek() == b'_' {
            while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
                self.bump();
            }
            let text = self.raw_slice(start.offset);
            return Err(LexError::MalformedNumber {
                text,
                span: Span { len: self.position - start.offset, ..start },
            });
        }
        let lexeme = self.raw_slice(start.offset);
        Ok(Token {
            kind: TokenKind::Number,
            lexeme,
            span: Span { len: self.position - start.offset, ..start },
        })
    }

    fn read_identifier(&mut self, start: Span) -> Result<Token, LexError> {
        while matches!(self.peek(), b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.') {
            self.bump();
        }
        let lexeme = self.raw_slice(start.offset);
        // `hex"…"` is an identifier head glued to a string literal.
        if lexeme == "hex" && self.peek() == b'"' {
            return self.read_hex_payload(start);
        }
        let kind = KEYWORDS
            .get(lexeme.as_str())
            .cloned()
            .unwrap_or(TokenKind::Ident);
        Ok(Token {
            kind,
            lexeme,
            span: Span { len: self.position - start.offset, ..start },
        })
    }

    fn read_hex_payload(&mut self, start: Span) -> Result<Token, LexError> {
        self.bump(); // opening quote
        let digits_start = self.position;
        while self.peek().is_ascii_hexdigit() {
            self.bump();
        }
        let digits = self.raw_slice(digits_start);
        if self.peek() != b'"' || digits.len() % 2 != 0 {
            return Err(LexError::InvalidHexPayload { span: start });
        }
        self.bump(); // closing quote
        Ok(Token {
            kind: TokenKind::HexStr,
            lexeme: digits,
            span: Span { len: self.position - start.offset, ..start },
        })
    }

    fn raw_slice(&self, from: usize) -> String {
        String::from_utf8_lossy(&self.input[from..self.position]).into_owned()
    }
}

/// Parses a `Number`/`HexNumber` lexeme into a 256-bit word.
///
/// Values wider than 256 bits are reduced modulo 2^256, matching Yul's
/// single word type.
pub fn parse_word(lexeme: &str) -> Option<BigUint> {
    let value = if let Some(hex) = lexeme.strip_prefix("0x").or_else(|| lexeme.strip_prefix("0X")) {
        BigUint::from_str_radix(hex, 16).ok()?
    } else {
        BigUint::from_str_radix(lexeme, 10).ok()?
    };
    Some(value % crate::ir::word_modulus())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn punctuation_and_operators() {
        assert_eq!(
            kinds("{ ( ) , : := -> }"),
            vec![
                TokenKind::LBrace,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Comma,
                TokenKind::Colon,
                TokenKind::Assign,
                TokenKind::Arrow,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("object code let leave foo abi_encode_t.x"),
            vec![
                TokenKind::Object,
                TokenKind::Code,
                TokenKind::Let,
                TokenKind::Leave,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_keep_full_width() {
        let tokens = Lexer::new("0xffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff 42")
            .tokenize()
            .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::HexNumber);
        // 33 bytes of f's wrap back into the word range.
        let word = parse_word(&tokens[0].lexeme).unwrap();
        assert!(word < *crate::ir::word_modulus());
        assert_eq!(tokens[1].kind, TokenKind::Number);
        assert_eq!(parse_word(&tokens[1].lexeme).unwrap(), BigUint::from(42u8));
    }

    #[test]
    fn string_escapes() {
        let tokens = Lexer::new(r#""a\n\x41""#).tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "a\nA");
    }

    #[test]
    fn hex_string_payload() {
        let tokens = Lexer::new(r#"data "meta" hex"00ff10""#).tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data);
        assert_eq!(tokens[1].kind, TokenKind::Str);
        assert_eq!(tokens[2].kind, TokenKind::HexStr);
        assert_eq!(tokens[2].lexeme, "00ff10");
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("// line\nlet /* block\nspanning */ x"),
            vec![TokenKind::Let, TokenKind::Ident, TokenKind::Eof]
        );
    }

    #[test]
    fn position_tracking() {
        let tokens = Lexer::new("let\n  x := 1").tokenize().unwrap();
        assert_eq!((tokens[0].span.line, tokens[0].span.column), (1, 1));
        assert_eq!((tokens[1].span.line, tokens[1].span.column), (2, 3));
    }

    #[test]
    fn error_cases() {
        assert!(matches!(
            Lexer::new("\"open").tokenize(),
            Err(LexError::UnterminatedString { .. })
        ));
        assert!(matches!(
            Lexer::new("/* open").tokenize(),
            Err(LexError::UnterminatedComment { .. })
        ));
        assert!(matches!(
            Lexer::new("0xZZ").tokenize(),
            Err(LexError::MalformedNumber { .. })
        ));
        assert!(matches!(
            Lexer::new("@").tokenize(),
            Err(LexError::UnexpectedCharacter { ch: '@', .. })
        ));
    }
}
