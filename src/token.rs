//! The token definition for the filter language.

use crate::ast::Operator;

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
    /// The raw source text of the token.
    pub text: &'a str,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Literals
    Identifier(&'a str),
    String(String), // unescaped contents, without quotes
    Int(i64),
    Float(f64),
    True,
    False,
    Null,

    /// `@name` or `@unit+N`, without the leading `@`.
    Macro(&'a str),
    /// `:name`, without the leading `:`.
    Modifier(&'a str),

    // Operators
    Op(Operator),
    And, // &&
    Or,  // ||
    Not, // !

    // Punctuation
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    Comma,    // ,
    Dot,      // .
}

impl TokenKind<'_> {
    /// Short human description used in parse errors.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier `{name}`"),
            TokenKind::String(s) => format!("string {s:?}"),
            TokenKind::Int(n) => format!("number {n}"),
            TokenKind::Float(n) => format!("number {n}"),
            TokenKind::True => "`true`".to_string(),
            TokenKind::False => "`false`".to_string(),
            TokenKind::Null => "`null`".to_string(),
            TokenKind::Macro(name) => format!("`@{name}`"),
            TokenKind::Modifier(name) => format!("modifier `:{name}`"),
            TokenKind::Op(op) => format!("operator `{op}`"),
            TokenKind::And => "`&&`".to_string(),
            TokenKind::Or => "`||`".to_string(),
            TokenKind::Not => "`!`".to_string(),
            TokenKind::LParen => "`(`".to_string(),
            TokenKind::RParen => "`)`".to_string(),
            TokenKind::LBracket => "`[`".to_string(),
            TokenKind::RBracket => "`]`".to_string(),
            TokenKind::Comma => "`,`".to_string(),
            TokenKind::Dot => "`.`".to_string(),
        }
    }
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}
