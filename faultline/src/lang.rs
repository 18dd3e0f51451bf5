// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of faultline.
//
// faultline is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// faultline is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with faultline.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The failure association rule language
//!
//! Rules select failures with a small boolean expression language, a subset of SQL's: two string
//! fields (`test`, the test ID, & `reason`, the primary error message) compared against string
//! literals:
//!
//! ```text
//! expr      := or
//! or        := and ("OR" and)*
//! and       := unary ("AND" unary)*
//! unary     := "NOT" unary | "(" expr ")" | predicate
//! predicate := field ["NOT"] "LIKE" string
//!            | field ("=" | "!=" | "<>") string
//!            | field ["NOT"] "IN" "(" string ("," string)* ")"
//!            | "REGEXP_CONTAINS" "(" field "," string ")"
//! ```
//!
//! Keywords & field names are case-insensitive. Strings may be single- or double-quoted. LIKE
//! patterns are compiled to anchored regular expressions at parse time, so evaluation never
//! fails.
//!
//! Chains of AND or OR parse into a single n-ary node, so only `NOT` & parentheses deepen the
//! tree; their nesting is capped at [MAX_NESTING] levels.

use std::{iter::Peekable, str::CharIndices};

use regex::Regex;
use snafu::{Backtrace, prelude::*};

use crate::clustering::Failure;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid LIKE pattern {pattern:?}: {reason}"))]
    BadLike {
        pattern: String,
        reason: String,
        backtrace: Backtrace,
    },
    #[snafu(display("invalid regular expression {pattern:?}: {source}"))]
    BadRegex {
        pattern: String,
        source: regex::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("syntax error at position {position}: {message}"))]
    Syntax {
        position: usize,
        message: String,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The deepest nesting of `NOT` & parentheses a rule definition may use
pub const MAX_NESTING: usize = 100;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          LIKE patterns                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Escape `text` so that it matches itself, literally, when used in a LIKE pattern
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Translate a LIKE pattern into an equivalent (anchored) regular expression
///
/// `%` matches any run of characters, `_` any single character; `\` escapes `%`, `_` or itself.
/// Any other use of `\` is an error.
pub fn like_to_regex(pattern: &str) -> Result<String> {
    let mut out = String::from("(?s)^");
    let mut buf = [0u8; 4];
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(e @ ('%' | '_' | '\\')) => out.push_str(&regex::escape(e.encode_utf8(&mut buf))),
                Some(e) => {
                    return BadLikeSnafu {
                        pattern,
                        reason: format!("unrecognised escape sequence \\{e}"),
                    }
                    .fail();
                }
                None => {
                    return BadLikeSnafu {
                        pattern,
                        reason: "unfinished escape sequence at end of pattern",
                    }
                    .fail();
                }
            },
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    Ok(out)
}

/// Check that `pattern` is a well-formed LIKE pattern
pub fn validate_like_pattern(pattern: &str) -> Result<()> {
    like_to_regex(pattern).map(|_| ())
}

fn compile_like(pattern: &str) -> Result<Regex> {
    let re = like_to_regex(pattern)?;
    Regex::new(&re).context(BadRegexSnafu { pattern })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Syntax tree                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The failure attributes a rule may examine
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Field {
    Test,
    Reason,
}

impl Field {
    fn value<'a>(&self, failure: &'a Failure) -> &'a str {
        match self {
            Field::Test => &failure.test_id,
            Field::Reason => failure.reason_text(),
        }
    }
}

/// A parsed (& compiled) rule definition
#[derive(Clone, Debug)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Equal { field: Field, value: String },
    In { field: Field, values: Vec<String> },
    Like { field: Field, regex: Regex },
    RegexpContains { field: Field, regex: Regex },
}

impl Expr {
    /// Evaluate this expression against `failure`
    pub fn evaluate(&self, failure: &Failure) -> bool {
        match self {
            Expr::And(exprs) => exprs.iter().all(|expr| expr.evaluate(failure)),
            Expr::Or(exprs) => exprs.iter().any(|expr| expr.evaluate(failure)),
            Expr::Not(expr) => !expr.evaluate(failure),
            Expr::Equal { field, value } => field.value(failure) == value,
            Expr::In { field, values } => {
                let text = field.value(failure);
                values.iter().any(|v| v == text)
            }
            Expr::Like { field, regex } | Expr::RegexpContains { field, regex } => {
                regex.is_match(field.value(failure))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Lexer                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Equal,
    NotEqual,
    End,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Equal => write!(f, "="),
            Token::NotEqual => write!(f, "!="),
            Token::End => write!(f, "end of input"),
        }
    }
}

fn syntax<T>(position: usize, message: impl Into<String>) -> Result<T> {
    SyntaxSnafu {
        position,
        message: message.into(),
    }
    .fail()
}

struct Lexer<'a> {
    text: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Lexer<'a> {
        Lexer {
            text,
            chars: text.char_indices().peekable(),
        }
    }
    fn string(&mut self, start: usize, quote: char) -> Result<Token> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => return syntax(start, "unterminated string literal"),
                Some((_, c)) if c == quote => return Ok(Token::Str(value)),
                Some((at, '\\')) => match self.chars.next() {
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, '\'')) => value.push('\''),
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, c)) => {
                        return syntax(at, format!("invalid escape sequence \\{c}"));
                    }
                    None => return syntax(start, "unterminated string literal"),
                },
                Some((_, c)) => value.push(c),
            }
        }
    }
    fn tokens(mut self) -> Result<Vec<(usize, Token)>> {
        let mut out = Vec::new();
        while let Some((at, c)) = self.chars.next() {
            let token = match c {
                c if c.is_whitespace() => continue,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                '=' => Token::Equal,
                '!' | '<' => {
                    let want = if c == '!' { '=' } else { '>' };
                    match self.chars.next() {
                        Some((_, n)) if n == want => Token::NotEqual,
                        _ => return syntax(at, format!("unexpected character {c:?}")),
                    }
                }
                '"' | '\'' => self.string(at, c)?,
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut end = at + c.len_utf8();
                    while let Some((i, n)) = self.chars.peek().copied() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            end = i + n.len_utf8();
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    Token::Ident(self.text[at..end].to_owned())
                }
                c => return syntax(at, format!("unexpected character {c:?}")),
            };
            out.push((at, token));
        }
        out.push((self.text.len(), Token::End));
        Ok(out)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Parser                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Parser {
    tokens: Vec<(usize, Token)>,
    next: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &(usize, Token) {
        // The token stream always ends with `End`, and we never advance past it
        &self.tokens[self.next.min(self.tokens.len() - 1)]
    }
    fn advance(&mut self) -> (usize, Token) {
        let tok = self.peek().clone();
        if tok.1 != Token::End {
            self.next += 1;
        }
        tok
    }
    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().1, Token::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }
    fn expect(&mut self, want: Token) -> Result<()> {
        let (at, tok) = self.advance();
        if tok == want {
            Ok(())
        } else {
            syntax(at, format!("expected {want}, found {tok}"))
        }
    }
    fn string(&mut self) -> Result<String> {
        match self.advance() {
            (_, Token::Str(s)) => Ok(s),
            (at, tok) => syntax(at, format!("expected a string literal, found {tok}")),
        }
    }
    fn field(&mut self) -> Result<Field> {
        match self.advance() {
            (_, Token::Ident(s)) if s.eq_ignore_ascii_case("test") => Ok(Field::Test),
            (_, Token::Ident(s)) if s.eq_ignore_ascii_case("reason") => Ok(Field::Reason),
            (at, tok) => syntax(
                at,
                format!("expected a field (\"test\" or \"reason\"), found {tok}"),
            ),
        }
    }
    fn or(&mut self) -> Result<Expr> {
        let mut exprs = vec![self.and()?];
        while self.at_keyword("OR") {
            self.advance();
            exprs.push(self.and()?);
        }
        Ok(if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            Expr::Or(exprs)
        })
    }
    fn and(&mut self) -> Result<Expr> {
        let mut exprs = vec![self.unary()?];
        while self.at_keyword("AND") {
            self.advance();
            exprs.push(self.unary()?);
        }
        Ok(if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            Expr::And(exprs)
        })
    }
    /// Enter one level of `NOT` or parentheses
    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let at = self.peek().0;
            return syntax(
                at,
                format!("expression nested too deeply (at most {MAX_NESTING} levels)"),
            );
        }
        Ok(())
    }
    fn unary(&mut self) -> Result<Expr> {
        if self.at_keyword("NOT") {
            self.advance();
            self.descend()?;
            let expr = Expr::Not(Box::new(self.unary()?));
            self.depth -= 1;
            return Ok(expr);
        }
        if self.peek().1 == Token::LParen {
            self.advance();
            self.descend()?;
            let expr = self.or()?;
            self.expect(Token::RParen)?;
            self.depth -= 1;
            return Ok(expr);
        }
        if self.at_keyword("REGEXP_CONTAINS") {
            self.advance();
            self.expect(Token::LParen)?;
            let field = self.field()?;
            self.expect(Token::Comma)?;
            let pattern = self.string()?;
            self.expect(Token::RParen)?;
            let regex = Regex::new(&pattern).context(BadRegexSnafu { pattern })?;
            return Ok(Expr::RegexpContains { field, regex });
        }
        self.predicate()
    }
    fn predicate(&mut self) -> Result<Expr> {
        let field = self.field()?;
        let negated = self.at_keyword("NOT");
        if negated {
            self.advance();
        }
        let expr = match self.advance() {
            (_, Token::Ident(s)) if s.eq_ignore_ascii_case("LIKE") => {
                let pattern = self.string()?;
                Expr::Like {
                    field,
                    regex: compile_like(&pattern)?,
                }
            }
            (_, Token::Ident(s)) if s.eq_ignore_ascii_case("IN") => {
                self.expect(Token::LParen)?;
                let mut values = vec![self.string()?];
                while self.peek().1 == Token::Comma {
                    self.advance();
                    values.push(self.string()?);
                }
                self.expect(Token::RParen)?;
                Expr::In { field, values }
            }
            (at, Token::Equal) if negated => return syntax(at, "expected LIKE or IN after NOT"),
            (_, Token::Equal) => Expr::Equal {
                field,
                value: self.string()?,
            },
            (at, Token::NotEqual) if negated => return syntax(at, "expected LIKE or IN after NOT"),
            (_, Token::NotEqual) => Expr::Not(Box::new(Expr::Equal {
                field,
                value: self.string()?,
            })),
            (at, tok) => return syntax(at, format!("expected LIKE, IN, = or !=, found {tok}")),
        };
        Ok(if negated {
            Expr::Not(Box::new(expr))
        } else {
            expr
        })
    }
}

/// Parse (& compile) a rule definition
pub fn parse(text: &str) -> Result<Expr> {
    let mut parser = Parser {
        tokens: Lexer::new(text).tokens()?,
        next: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.advance() {
        (_, Token::End) => Ok(expr),
        (at, tok) => syntax(at, format!("unexpected {tok}")),
    }
}
