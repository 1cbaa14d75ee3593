//! Filter 与访问规则表达式的递归下降语法分析器
//!
//! ## 解析流程
//!
//! ```text
//! parse()
//!   └─ parse_or()                      a || b || c   (左结合)
//!        └─ parse_and()                a && b        (左结合)
//!             └─ parse_not()           !a, !!a
//!                  └─ parse_comparison()
//!                       ├─ "(" → parse_or() ")" → Group
//!                       ├─ operand op operand          → Comparison
//!                       └─ field ?op [literal, ...]    → AnyQuantifier
//! ```
//!
//! ## 操作数
//!
//! - **字面量**: `"text"`, `'text'`, `12`, `-3.5`, `true`, `false`, `null`
//! - **宏**: `@now`, `@todayStart`, `@day-7` 等, 每次解析基于同一个时钟快照求值
//! - **字段**: `title`, `author.company.name`, `@record.user_id`,
//!   `@request.auth.id`, `@request.headers.x_token`, `@request.method`
//! - **修饰符**: `title:lower`, `tags:length`, `body:excerpt(200, "...")`
//!
//! 运算符右侧或数组内不带 `.` 的裸标识符视为字符串: `status = active`
//! 等价于与 `"active"` 比较。没有运算符的单独字段是错误。
//!
//! 嵌套的 `(` / `!` 层数和比较式数量都有上限, 超限时返回 `ParseError`。

use chrono::{DateTime, Utc};

use crate::ast::{Expr, FieldPath, Literal, Modifier, Operand, PathRoot};
use crate::date_macro::{self, Clock};
use crate::error::{FilterError, ParseError};
use crate::token::{Token, TokenKind};

/// 解析时的限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParseOptions {
    /// 字段路径的最大段数
    pub max_path_depth: usize,
    /// 任一比较式外层 `(` 与 `!` 的最大嵌套层数
    pub max_nesting: usize,
    /// 单个表达式中比较式与量词的最大数量
    pub max_terms: usize,
}

impl ParseOptions {
    /// 客户端列表过滤条件的限制
    pub const FILTER: ParseOptions = ParseOptions {
        max_path_depth: 3,
        max_nesting: 64,
        max_terms: 512,
    };
    /// 管理员定义的访问规则的限制
    pub const RULE: ParseOptions = ParseOptions {
        max_path_depth: 6,
        max_nesting: 64,
        max_terms: 512,
    };
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::FILTER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
    /// 本次解析中所有宏共用的时间快照
    now: DateTime<Utc>,
    options: ParseOptions,
    /// 当前打开的 `(` 与 `!` 数量
    nesting: usize,
    terms: usize,
    /// 输入结束处报错时使用的位置
    end: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>], clock: &dyn Clock, options: ParseOptions) -> Self {
        Self {
            tokens,
            position: 0,
            now: clock.now(),
            options,
            nesting: 0,
            terms: 0,
            end: tokens.last().map(|t| t.span.end).unwrap_or(0),
        }
    }

    /// 返回当前 token 但不前进
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回下一个 token 但不前进
    fn peek_next(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position + 1)
    }

    /// 返回当前 token 并前进
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// 检查当前 token 是否与 `kind` 同类
    fn match_token(&self, kind: &TokenKind) -> bool {
        self.peek().is_some_and(|token| {
            std::mem::discriminant(&token.kind) == std::mem::discriminant(kind)
        })
    }

    /// 描述当前位置期望内容的错误
    fn error_here(&self, expected: impl Into<String>) -> ParseError {
        match self.peek() {
            Some(token) => ParseError::new(token.span.start, expected, token.kind.describe()),
            None => ParseError::new(self.end, expected, "end of input"),
        }
    }

    /// 期望指定类型的 token 并跳过它
    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<&'a Token<'a>, ParseError> {
        if self.match_token(&kind) {
            self.advance().ok_or_else(|| self.error_here(expected))
        } else {
            Err(self.error_here(expected))
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> Result<&'a str, ParseError> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Identifier(name),
                ..
            }) => {
                self.position += 1;
                Ok(name)
            }
            _ => Err(self.error_here(expected)),
        }
    }

    /// 进入一层 `(` 或 `!`, 超过上限时在继续递归之前报错
    fn enter(&mut self) -> Result<(), ParseError> {
        if self.nesting >= self.options.max_nesting {
            return Err(self.error_here(format!(
                "at most {} levels of `(` and `!`",
                self.options.max_nesting
            )));
        }
        self.nesting += 1;
        Ok(())
    }

    fn count_term(&mut self, offset: usize) -> Result<(), ParseError> {
        self.terms += 1;
        if self.terms > self.options.max_terms {
            return Err(ParseError::new(
                offset,
                format!("at most {} comparisons", self.options.max_terms),
                "another comparison",
            ));
        }
        Ok(())
    }

    /// 解析完整表达式, 末尾多余的 token 视为错误
    pub fn parse(&mut self) -> Result<Expr, FilterError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new(0, "expression", "end of input").into());
        }
        let expr = self.parse_or()?;
        if self.peek().is_some() {
            return Err(self.error_here("`&&`, `||` or end of input").into());
        }
        Ok(expr)
    }

    /// 解析逗号分隔的字段路径列表, 用于输出字段选择
    /// (`id,title:excerpt(20,true),author.name`)
    pub fn parse_field_list(&mut self) -> Result<Vec<FieldPath>, FilterError> {
        let mut fields = Vec::new();
        loop {
            match self.parse_operand(Side::Left)? {
                Operand::Field(path) => fields.push(path),
                Operand::Literal(_) => {
                    let offset = self.tokens[self.position - 1].span.start;
                    return Err(ParseError::new(offset, "field", "literal").into());
                }
            }
            if self.peek().is_none() {
                return Ok(fields);
            }
            self.expect(TokenKind::Comma, "`,` or end of input")?;
        }
    }

    /// 解析 OR 表达式 (最低优先级)
    ///
    /// 语法: `and_expr ('||' and_expr)*`
    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;

        while self.match_token(&TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// 解析 AND 表达式
    ///
    /// 语法: `not_expr ('&&' not_expr)*`
    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_not()?;

        while self.match_token(&TokenKind::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// 解析可选且可连续出现的 `!`
    fn parse_not(&mut self) -> Result<Expr, FilterError> {
        if self.match_token(&TokenKind::Not) {
            self.enter()?;
            self.advance();
            let inner = self.parse_not()?;
            self.nesting -= 1;
            Ok(Expr::Not(Box::new(inner)))
        } else {
            self.parse_comparison()
        }
    }

    /// 解析括号分组或单个比较式 (最高优先级)
    fn parse_comparison(&mut self) -> Result<Expr, FilterError> {
        if self.match_token(&TokenKind::LParen) {
            self.enter()?;
            self.advance();
            let inner = self.parse_or()?;
            self.expect(TokenKind::RParen, "`)`")?;
            self.nesting -= 1;
            return Ok(Expr::Group(Box::new(inner)));
        }

        let left_offset = self.peek().map(|t| t.span.start).unwrap_or(self.end);
        self.count_term(left_offset)?;
        let left = self.parse_operand(Side::Left)?;

        let op = match self.peek() {
            Some(Token {
                kind: TokenKind::Op(op),
                ..
            }) => {
                self.position += 1;
                *op
            }
            _ => return Err(self.error_here("operator").into()),
        };

        if op.is_quantifier() {
            let Operand::Field(field) = left else {
                return Err(ParseError::new(left_offset, "field before quantifier", "literal").into());
            };
            self.expect(TokenKind::LBracket, "array literal")?;
            let values = self.parse_array()?;
            return Ok(Expr::AnyQuantifier { field, op, values });
        }

        if self.match_token(&TokenKind::LBracket) {
            return Err(self
                .error_here(format!("value (arrays need a quantifier such as `?{op}`)"))
                .into());
        }
        let right = self.parse_operand(Side::Right)?;
        Ok(Expr::Comparison { left, op, right })
    }

    /// 解析字面量、宏或字段路径
    fn parse_operand(&mut self, side: Side) -> Result<Operand, FilterError> {
        let Some(token) = self.peek() else {
            return Err(self.error_here("field or value").into());
        };

        let literal = match &token.kind {
            TokenKind::String(s) => Literal::String(s.clone()),
            TokenKind::Int(n) => Literal::Int(*n),
            TokenKind::Float(n) => Literal::Float(*n),
            TokenKind::True => Literal::Bool(true),
            TokenKind::False => Literal::Bool(false),
            TokenKind::Null => Literal::Null,
            TokenKind::Macro("request") => {
                self.advance();
                return self.parse_request_path().map(Operand::Field);
            }
            TokenKind::Macro("record") => {
                self.advance();
                self.expect(TokenKind::Dot, "`.` after `@record`")?;
                let first = self.expect_identifier("record field name")?;
                return self.parse_path(PathRoot::Record, first).map(Operand::Field);
            }
            TokenKind::Macro(name) => self.resolve_macro(name, token.span.start)?,
            TokenKind::Identifier(name) => {
                let continues_path = self.peek_next().is_some_and(|next| {
                    matches!(next.kind, TokenKind::Dot | TokenKind::Modifier(_))
                });
                if side == Side::Right && !continues_path {
                    Literal::String(name.to_string())
                } else {
                    self.advance();
                    return self.parse_path(PathRoot::Record, name).map(Operand::Field);
                }
            }
            _ => return Err(self.error_here("field or value").into()),
        };

        self.advance();
        Ok(Operand::Literal(literal))
    }

    fn resolve_macro(&self, name: &str, offset: usize) -> Result<Literal, FilterError> {
        let (source, at) = date_macro::resolve(name, offset, self.now)?;
        Ok(Literal::Instant { source, at })
    }

    /// 解析 `@request` 之后的部分
    fn parse_request_path(&mut self) -> Result<FieldPath, FilterError> {
        self.expect(TokenKind::Dot, "`.` after `@request`")?;
        let namespace_offset = self.peek().map(|t| t.span.start).unwrap_or(self.end);
        let namespace = self.expect_identifier("request attribute")?;
        let root = match namespace {
            "auth" => PathRoot::Auth,
            "data" => PathRoot::Data,
            "headers" => PathRoot::Headers,
            "query" => PathRoot::Query,
            "method" => PathRoot::Method,
            "context" => PathRoot::Context,
            other => {
                return Err(ParseError::new(
                    namespace_offset,
                    "one of auth, data, headers, query, method, context",
                    format!("identifier `{other}`"),
                )
                .into())
            }
        };

        if root.is_leaf() {
            let mut path = FieldPath::new(root, Vec::new());
            path.modifier = self.parse_optional_modifier()?;
            return Ok(path);
        }

        self.expect(TokenKind::Dot, &format!("`.` after `@request.{namespace}`"))?;
        let first = self.expect_identifier("attribute name")?;
        self.parse_path(root, first)
    }

    /// 解析点分路径的剩余部分, 第一段已被消费
    fn parse_path(&mut self, root: PathRoot, first: &str) -> Result<FieldPath, FilterError> {
        let start = self.tokens[self.position - 1].span.start;
        let mut segments = vec![first.to_string()];

        while self.match_token(&TokenKind::Dot) {
            self.advance();
            segments.push(self.expect_identifier("field name after `.`")?.to_string());
        }

        if segments.len() > self.options.max_path_depth {
            return Err(ParseError::new(
                start,
                format!("a field path of at most {} segments", self.options.max_path_depth),
                format!("{} segments", segments.len()),
            )
            .into());
        }

        let mut path = FieldPath::new(root, segments);
        path.modifier = self.parse_optional_modifier()?;
        Ok(path)
    }

    fn parse_optional_modifier(&mut self) -> Result<Option<Modifier>, FilterError> {
        let Some(Token {
            kind: TokenKind::Modifier(name),
            span,
            ..
        }) = self.peek()
        else {
            return Ok(None);
        };
        self.advance();

        let modifier = match *name {
            "isset" => Modifier::IsSet,
            "length" => Modifier::Length,
            "lower" => Modifier::Lower,
            "upper" => Modifier::Upper,
            "each" => Modifier::Each,
            "excerpt" => return self.parse_excerpt_args().map(Some),
            other => {
                return Err(ParseError::new(
                    span.start,
                    "one of :isset, :length, :lower, :upper, :each, :excerpt",
                    format!("modifier `:{other}`"),
                )
                .into())
            }
        };

        if self.match_token(&TokenKind::LParen) {
            return Err(self
                .error_here(format!("operator (`:{name}` takes no arguments)"))
                .into());
        }
        Ok(Some(modifier))
    }

    /// 解析 `:excerpt` 之后的 `(n)` 或 `(n, ellipsis)`
    fn parse_excerpt_args(&mut self) -> Result<Modifier, FilterError> {
        self.expect(TokenKind::LParen, "`(` with 1-2 arguments for `:excerpt`")?;

        let max_chars = match self.peek() {
            Some(Token {
                kind: TokenKind::Int(n),
                ..
            }) if *n > 0 => {
                self.position += 1;
                *n as usize
            }
            _ => return Err(self.error_here("positive character count").into()),
        };

        let mut ellipsis = "...".to_string();
        if self.match_token(&TokenKind::Comma) {
            self.advance();
            ellipsis = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::String(s)) => s.clone(),
                Some(TokenKind::True) => "...".to_string(),
                Some(TokenKind::False) => String::new(),
                _ => return Err(self.error_here("ellipsis string or boolean").into()),
            };
            self.advance();
        }

        self.expect(TokenKind::RParen, "`)`")?;
        Ok(Modifier::Excerpt {
            max_chars,
            ellipsis,
        })
    }

    /// 解析 `[` 之后直到 `]` (含) 的数组元素
    fn parse_array(&mut self) -> Result<Vec<Literal>, FilterError> {
        let mut values = Vec::new();
        if self.match_token(&TokenKind::RBracket) {
            self.advance();
            return Ok(values);
        }

        loop {
            let Some(token) = self.peek() else {
                return Err(self.error_here("array element").into());
            };
            let value = match &token.kind {
                TokenKind::String(s) => Literal::String(s.clone()),
                TokenKind::Identifier(word) => Literal::String(word.to_string()),
                TokenKind::Int(n) => Literal::Int(*n),
                TokenKind::Float(n) => Literal::Float(*n),
                TokenKind::True => Literal::Bool(true),
                TokenKind::False => Literal::Bool(false),
                TokenKind::Null => Literal::Null,
                TokenKind::Macro(name) if !matches!(*name, "request" | "record") => {
                    self.resolve_macro(name, token.span.start)?
                }
                _ => return Err(self.error_here("literal array element").into()),
            };
            self.advance();
            values.push(value);

            if self.match_token(&TokenKind::RBracket) {
                self.advance();
                return Ok(values);
            }
            self.expect(TokenKind::Comma, "`,` or `]`")?;
        }
    }
}
