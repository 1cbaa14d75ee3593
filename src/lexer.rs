//! Filter 与访问规则表达式的词法分析器
//!
//! 多字符运算符按最长匹配优先: `?!=` 优先于 `?!`, `?!` 优先于 `?`。
//! `.` 作为独立的标点输出, 由语法分析器拼装字段路径。

use crate::ast::Operator;
use crate::error::LexError;
use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// 输入字符串中的当前位置（字节索引）
    position: usize,
    /// 尚未闭合的 `[` 数量
    bracket_depth: usize,
    /// 最外层 `[` 的位置
    bracket_start: usize,
    finished: bool,
}

/// 完整地切分 `source`, 遇到第一个非法 token 即失败
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, LexError> {
    Lexer::new(source).collect()
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input,
            position: 0,
            bracket_depth: 0,
            bracket_start: 0,
            finished: false,
        }
    }

    /// 查看当前字符但不前进
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// 查看下一个字符但不前进
    fn peek_next(&self) -> Option<char> {
        self.input[self.position..].chars().nth(1)
    }

    /// 前进一个字符并返回它
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    /// 当前字符为 `expected` 时前进
    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// 跳过空白和 `//` 行注释
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
            text: &self.input[start..self.position],
        }
    }

    fn consume_ident_chars(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// 读取整数或浮点数字面量, 前导 `-` 后面必定跟着数字
    fn read_number(&mut self, start: usize) -> Result<Token<'a>, LexError> {
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.'
                && !is_float
                && self.peek_next().is_some_and(|n| n.is_ascii_digit())
            {
                is_float = true;
                self.bump();
            } else {
                break;
            }
        }

        let text = &self.input[start..self.position];
        let invalid = || LexError::new(start, format!("invalid number `{text}`"));
        let kind = if is_float {
            TokenKind::Float(text.parse().map_err(|_| invalid())?)
        } else {
            match text.parse::<i64>() {
                Ok(n) => TokenKind::Int(n),
                // 超出 i64 范围, 按浮点数处理
                Err(_) => TokenKind::Float(text.parse().map_err(|_| invalid())?),
            }
        };
        Ok(self.token(kind, start))
    }

    /// 读取带引号的字符串字面量, 开头的引号已被消费
    fn read_string(&mut self, start: usize, quote: char) -> Result<Token<'a>, LexError> {
        let mut value = String::new();
        loop {
            let escape_at = self.position;
            match self.bump() {
                None => return Err(LexError::new(start, "unterminated string literal")),
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some(c @ ('\\' | '"' | '\'')) => value.push(c),
                    Some(other) => {
                        return Err(LexError::new(
                            escape_at,
                            format!("invalid escape sequence `\\{other}`"),
                        ))
                    }
                    None => return Err(LexError::new(start, "unterminated string literal")),
                },
                Some(c) => value.push(c),
            }
        }
        Ok(self.token(TokenKind::String(value), start))
    }

    /// 读取标识符或关键字
    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        self.consume_ident_chars();
        let literal = &self.input[start..self.position];
        let kind = match literal {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Identifier(literal),
        };
        self.token(kind, start)
    }

    /// 读取 `@name`, 可带符号后缀如 `@day-7`。后缀原样保留, 由宏解析器校验
    fn read_macro(&mut self, start: usize) -> Result<Token<'a>, LexError> {
        if !self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
            return Err(LexError::new(start, "expected a macro name after `@`"));
        }
        let name_start = self.position;
        self.consume_ident_chars();
        if matches!(self.peek(), Some('+' | '-')) {
            self.bump();
            self.consume_ident_chars();
        }
        let name = &self.input[name_start..self.position];
        Ok(self.token(TokenKind::Macro(name), start))
    }

    /// 读取 `:name`
    fn read_modifier(&mut self, start: usize) -> Result<Token<'a>, LexError> {
        if !self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(LexError::new(start, "expected a modifier name after `:`"));
        }
        let name_start = self.position;
        self.consume_ident_chars();
        let name = &self.input[name_start..self.position];
        Ok(self.token(TokenKind::Modifier(name), start))
    }

    /// 读取以 `?` 开头的量词运算符, `?` 已被消费
    fn read_quantifier(&mut self, start: usize) -> Result<Token<'a>, LexError> {
        let op = match self.bump() {
            Some('=') => Operator::AnyEq,
            Some('!') => {
                if self.eat('=') {
                    Operator::AnyNeq
                } else if self.eat('~') {
                    Operator::AnyNotLike
                } else {
                    return Err(LexError::new(start, "expected `=` or `~` after `?!`"));
                }
            }
            Some('>') => {
                if self.eat('=') {
                    Operator::AnyGte
                } else {
                    Operator::AnyGt
                }
            }
            Some('<') => {
                if self.eat('=') {
                    Operator::AnyLte
                } else {
                    Operator::AnyLt
                }
            }
            Some('~') => Operator::AnyLike,
            _ => return Err(LexError::new(start, "incomplete quantifier operator `?`")),
        };
        Ok(self.token(TokenKind::Op(op), start))
    }

    fn next_token(&mut self) -> Option<Result<Token<'a>, LexError>> {
        self.skip_trivia();
        let start = self.position;

        let Some(c) = self.bump() else {
            if self.bracket_depth > 0 {
                self.finished = true;
                return Some(Err(LexError::new(
                    self.bracket_start,
                    "unterminated array literal",
                )));
            }
            return None;
        };

        let token = match c {
            '=' => Ok(self.token(TokenKind::Op(Operator::Eq), start)),
            '!' => {
                let kind = if self.eat('=') {
                    TokenKind::Op(Operator::Neq)
                } else if self.eat('~') {
                    TokenKind::Op(Operator::NotLike)
                } else {
                    TokenKind::Not
                };
                Ok(self.token(kind, start))
            }
            '>' => {
                let op = if self.eat('=') { Operator::Gte } else { Operator::Gt };
                Ok(self.token(TokenKind::Op(op), start))
            }
            '<' => {
                let op = if self.eat('=') { Operator::Lte } else { Operator::Lt };
                Ok(self.token(TokenKind::Op(op), start))
            }
            '~' => Ok(self.token(TokenKind::Op(Operator::Like), start)),
            '?' => self.read_quantifier(start),
            '&' => {
                if self.eat('&') {
                    Ok(self.token(TokenKind::And, start))
                } else {
                    Err(LexError::new(start, "expected `&&`"))
                }
            }
            '|' => {
                if self.eat('|') {
                    Ok(self.token(TokenKind::Or, start))
                } else {
                    Err(LexError::new(start, "expected `||`"))
                }
            }
            '(' => Ok(self.token(TokenKind::LParen, start)),
            ')' => Ok(self.token(TokenKind::RParen, start)),
            '[' => {
                if self.bracket_depth == 0 {
                    self.bracket_start = start;
                }
                self.bracket_depth += 1;
                Ok(self.token(TokenKind::LBracket, start))
            }
            ']' => {
                if self.bracket_depth == 0 {
                    Err(LexError::new(start, "unexpected `]` without a matching `[`"))
                } else {
                    self.bracket_depth -= 1;
                    Ok(self.token(TokenKind::RBracket, start))
                }
            }
            ',' => Ok(self.token(TokenKind::Comma, start)),
            '.' => Ok(self.token(TokenKind::Dot, start)),
            '"' | '\'' => self.read_string(start, c),
            '@' => self.read_macro(start),
            ':' => self.read_modifier(start),
            '-' if self.peek().is_some_and(|n| n.is_ascii_digit()) => self.read_number(start),
            c if c.is_ascii_digit() => self.read_number(start),
            c if c.is_ascii_alphabetic() || c == '_' => Ok(self.read_identifier(start)),
            other => Err(LexError::new(start, format!("unexpected character `{other}`"))),
        };

        if token.is_err() {
            self.finished = true;
        }
        Some(token)
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token<'a>, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.next_token()
    }
}
