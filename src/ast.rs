//! Filter 与访问规则表达式的抽象语法树
//!
//! 语法树构建后不可变。`Display` 将表达式打印回源码形式, 重新解析打印结果
//! 会得到相等的语法树。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::date_macro::DateMacro;

/// 解析后表达式的根节点
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// 使用标量运算符的 `left op right`
    Comparison {
        left: Operand,
        op: Operator,
        right: Operand,
    },
    /// `field ?op [values]`: 字段中至少一个元素与至少一个值匹配
    AnyQuantifier {
        field: FieldPath,
        op: Operator,
        values: Vec<Literal>,
    },
    /// `&&`
    And(Box<Expr>, Box<Expr>),
    /// `||`
    Or(Box<Expr>, Box<Expr>),
    /// `!`
    Not(Box<Expr>),
    /// 使用括号分组的子表达式, 仅为打印保留
    Group(Box<Expr>),
}

/// 比较式任意一侧的操作数
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Field(FieldPath),
    Literal(Literal),
}

/// 比较运算符与量词运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,         // =
    Neq,        // !=
    Gt,         // >
    Gte,        // >=
    Lt,         // <
    Lte,        // <=
    Like,       // ~
    NotLike,    // !~
    AnyEq,      // ?=
    AnyNeq,     // ?!=
    AnyGt,      // ?>
    AnyGte,     // ?>=
    AnyLt,      // ?<
    AnyLte,     // ?<=
    AnyLike,    // ?~
    AnyNotLike, // ?!~
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "~",
            Operator::NotLike => "!~",
            Operator::AnyEq => "?=",
            Operator::AnyNeq => "?!=",
            Operator::AnyGt => "?>",
            Operator::AnyGte => "?>=",
            Operator::AnyLt => "?<",
            Operator::AnyLte => "?<=",
            Operator::AnyLike => "?~",
            Operator::AnyNotLike => "?!~",
        }
    }

    /// 是否为 `?` 开头的存在量词运算符
    pub fn is_quantifier(&self) -> bool {
        self.scalar() != *self
    }

    /// 量词对每对元素使用的标量运算符
    pub fn scalar(&self) -> Operator {
        match self {
            Operator::AnyEq => Operator::Eq,
            Operator::AnyNeq => Operator::Neq,
            Operator::AnyGt => Operator::Gt,
            Operator::AnyGte => Operator::Gte,
            Operator::AnyLt => Operator::Lt,
            Operator::AnyLte => Operator::Lte,
            Operator::AnyLike => Operator::Like,
            Operator::AnyNotLike => Operator::NotLike,
            scalar => *scalar,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 字段路径开始解析的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRoot {
    /// 正在求值的记录 (裸路径与 `@record.*`)
    Record,
    /// `@request.auth.*`
    Auth,
    /// `@request.data.*`
    Data,
    /// `@request.headers.*`
    Headers,
    /// `@request.query.*`
    Query,
    /// `@request.method`
    Method,
    /// `@request.context`
    Context,
}

impl PathRoot {
    fn prefix(&self) -> &'static str {
        match self {
            PathRoot::Record => "",
            PathRoot::Auth => "@request.auth.",
            PathRoot::Data => "@request.data.",
            PathRoot::Headers => "@request.headers.",
            PathRoot::Query => "@request.query.",
            PathRoot::Method => "@request.method",
            PathRoot::Context => "@request.context",
        }
    }

    /// 只代表单个属性、不带路径段的根
    pub fn is_leaf(&self) -> bool {
        matches!(self, PathRoot::Method | PathRoot::Context)
    }
}

/// 可能嵌套的字段引用, 末尾可带一个修饰符
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldPath {
    pub root: PathRoot,
    pub segments: Vec<String>,
    pub modifier: Option<Modifier>,
}

impl FieldPath {
    pub fn new(root: PathRoot, segments: Vec<String>) -> Self {
        Self {
            root,
            segments,
            modifier: None,
        }
    }

    /// 当前记录上的路径, 例如 `FieldPath::record(["author", "name"])`
    pub fn record<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(PathRoot::Record, segments.into_iter().map(Into::into).collect())
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// 路径经过的关联跳数
    pub fn relation_depth(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }

    /// 以点连接的路径段, 不含根前缀和修饰符
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// 不带修饰符的单段记录路径会打印成裸标识符, 在运算符右侧会被读回为字符串
    fn is_bare_word(&self) -> bool {
        self.root == PathRoot::Record && self.segments.len() == 1 && self.modifier.is_none()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.root.prefix(), self.dotted())?;
        if let Some(modifier) = &self.modifier {
            write!(f, "{modifier}")?;
        }
        Ok(())
    }
}

/// 字段修饰符 (`:isset`, `:excerpt(200, "...")` 等)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    IsSet,
    Length,
    Lower,
    Upper,
    Each,
    Excerpt { max_chars: usize, ellipsis: String },
}

impl Modifier {
    pub fn name(&self) -> &'static str {
        match self {
            Modifier::IsSet => "isset",
            Modifier::Length => "length",
            Modifier::Lower => "lower",
            Modifier::Upper => "upper",
            Modifier::Each => "each",
            Modifier::Excerpt { .. } => "excerpt",
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Excerpt {
                max_chars,
                ellipsis,
            } => {
                write!(f, ":excerpt({max_chars}, ")?;
                write_quoted(f, ellipsis)?;
                write!(f, ")")
            }
            other => write!(f, ":{}", other.name()),
        }
    }
}

/// 字面量值
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    /// 只能出现在量词的右侧
    Array(Vec<Literal>),
    /// 已解析的日期宏。保留宏本身, 打印时输出 `@day-7` 而不是固定的时间戳
    Instant {
        source: DateMacro,
        at: DateTime<Utc>,
    },
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write_quoted(f, s),
            Literal::Int(n) => write!(f, "{n}"),
            // 保留小数部分, 读回时仍为浮点数
            Literal::Float(n) if n.is_finite() && n.fract() == 0.0 => write!(f, "{n}.0"),
            Literal::Float(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Null => write!(f, "null"),
            Literal::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Literal::Instant { source, .. } => write!(f, "@{source}"),
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Field(path) => write!(f, "{path}"),
            Operand::Literal(literal) => write!(f, "{literal}"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Comparison { left, op, right } => {
                write!(f, "{left} {op} ")?;
                match right {
                    Operand::Field(path) if path.is_bare_word() => {
                        write!(f, "@record.{path}")
                    }
                    other => write!(f, "{other}"),
                }
            }
            Expr::AnyQuantifier { field, op, values } => {
                write!(f, "{field} {op} {}", Literal::Array(values.clone()))
            }
            Expr::And(left, right) => write!(f, "{left} && {right}"),
            Expr::Or(left, right) => write!(f, "{left} || {right}"),
            Expr::Not(inner) => write!(f, "!{inner}"),
            Expr::Group(inner) => write!(f, "({inner})"),
        }
    }
}

impl Expr {
    /// 从左到右对树中每个字段路径调用 `visit`
    pub fn walk_fields<'a>(&'a self, visit: &mut impl FnMut(&'a FieldPath)) {
        match self {
            Expr::Comparison { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Field(path) = operand {
                        visit(path);
                    }
                }
            }
            Expr::AnyQuantifier { field, .. } => visit(field),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.walk_fields(visit);
                right.walk_fields(visit);
            }
            Expr::Not(inner) | Expr::Group(inner) => inner.walk_fields(visit),
        }
    }

    /// 树中是否有来自日期宏的字面量
    pub fn has_macros(&self) -> bool {
        fn literal_has_macro(literal: &Literal) -> bool {
            match literal {
                Literal::Instant { .. } => true,
                Literal::Array(items) => items.iter().any(literal_has_macro),
                _ => false,
            }
        }

        match self {
            Expr::Comparison { left, right, .. } => [left, right]
                .iter()
                .any(|operand| matches!(operand, Operand::Literal(l) if literal_has_macro(l))),
            Expr::AnyQuantifier { values, .. } => values.iter().any(literal_has_macro),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.has_macros() || right.has_macros()
            }
            Expr::Not(inner) | Expr::Group(inner) => inner.has_macros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(field: &str, op: Operator, value: Literal) -> Expr {
        Expr::Comparison {
            left: Operand::Field(FieldPath::record([field])),
            op,
            right: Operand::Literal(value),
        }
    }

    #[test]
    fn test_operator_classification() {
        assert!(Operator::AnyNotLike.is_quantifier());
        assert!(!Operator::NotLike.is_quantifier());
        assert_eq!(Operator::AnyGte.scalar(), Operator::Gte);
        assert_eq!(Operator::Lt.scalar(), Operator::Lt);
    }

    #[test]
    fn test_display_comparison() {
        let expr = Expr::And(
            Box::new(cmp("status", Operator::Eq, Literal::String("active".to_string()))),
            Box::new(cmp("views", Operator::Gte, Literal::Int(100))),
        );
        assert_eq!(expr.to_string(), r#"status = "active" && views >= 100"#);
    }

    #[test]
    fn test_display_paths_and_modifiers() {
        let path = FieldPath::new(PathRoot::Auth, vec!["id".to_string()]);
        assert_eq!(path.to_string(), "@request.auth.id");

        let path = FieldPath::record(["title"]).with_modifier(Modifier::Excerpt {
            max_chars: 10,
            ellipsis: "…".to_string(),
        });
        assert_eq!(path.to_string(), "title:excerpt(10, \"…\")");

        let method = FieldPath::new(PathRoot::Method, vec![]);
        assert_eq!(method.to_string(), "@request.method");
    }

    #[test]
    fn test_display_right_hand_field_keeps_record_prefix() {
        let expr = Expr::Comparison {
            left: Operand::Field(FieldPath::new(PathRoot::Auth, vec!["id".to_string()])),
            op: Operator::Eq,
            right: Operand::Field(FieldPath::record(["user_id"])),
        };
        assert_eq!(expr.to_string(), "@request.auth.id = @record.user_id");
    }

    #[test]
    fn test_display_literals() {
        assert_eq!(Literal::Float(150.0).to_string(), "150.0");
        assert_eq!(Literal::Float(2.5).to_string(), "2.5");
        assert_eq!(Literal::String("a\"b".to_string()).to_string(), r#""a\"b""#);
        assert_eq!(
            Literal::Array(vec![Literal::Int(1), Literal::Null]).to_string(),
            "[1, null]"
        );
    }

    #[test]
    fn test_walk_fields_and_macros() {
        let expr = Expr::Or(
            Box::new(cmp("a", Operator::Eq, Literal::Int(1))),
            Box::new(Expr::Not(Box::new(Expr::AnyQuantifier {
                field: FieldPath::record(["tags", "name"]),
                op: Operator::AnyEq,
                values: vec![Literal::String("x".to_string())],
            }))),
        );
        let mut seen = Vec::new();
        expr.walk_fields(&mut |path| seen.push(path.dotted()));
        assert_eq!(seen, vec!["a".to_string(), "tags.name".to_string()]);
        assert!(!expr.has_macros());
    }
}
