//! 配置模块，负责从JSON加载引擎设置和集合schema

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::evaluator::EvalLimits;
use crate::parser::ParseOptions;
use crate::schema::{CollectionSchema, FieldInfo, FieldType, RelationTarget, StaticSchema};
use crate::sql_compiler::{CompilerConfig, Dialect};

/// 引擎全局设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dialect: Dialect,
    /// 客户端过滤条件允许的路径段数
    pub max_filter_depth: usize,
    /// 访问规则允许的路径段数
    pub max_rule_depth: usize,
    /// 比较式外层允许的 `(` 与 `!` 嵌套层数
    pub max_nesting: usize,
    /// 单个表达式允许的比较式数量
    pub max_terms: usize,
    pub eval_step_limit: usize,
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            max_filter_depth: ParseOptions::FILTER.max_path_depth,
            max_rule_depth: ParseOptions::RULE.max_path_depth,
            max_nesting: ParseOptions::FILTER.max_nesting,
            max_terms: ParseOptions::FILTER.max_terms,
            eval_step_limit: EvalLimits::default().max_steps,
            cache_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn filter_options(&self) -> ParseOptions {
        ParseOptions {
            max_path_depth: self.max_filter_depth,
            max_nesting: self.max_nesting,
            max_terms: self.max_terms,
        }
    }

    pub fn rule_options(&self) -> ParseOptions {
        ParseOptions {
            max_path_depth: self.max_rule_depth,
            max_nesting: self.max_nesting,
            max_terms: self.max_terms,
        }
    }

    pub fn eval_limits(&self) -> EvalLimits {
        EvalLimits {
            max_steps: self.eval_step_limit,
        }
    }

    /// 编译器设置, 关联跳数比路径段数少一
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            dialect: self.dialect,
            max_relation_depth: self.max_rule_depth.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// 关联字段指向的集合
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    /// 与字段名不同时的列名
    #[serde(default)]
    pub column: Option<String>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// 表名, 默认为集合名
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldConfig>,
}

/// 配置文件顶层结构
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionConfig>,
}

impl Config {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.display().to_string();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::Missing(path_str));
        }

        // 读取文件内容
        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;

        // 解析JSON
        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path_str.clone(),
            source,
        })?;

        info!(path = %path_str, collections = config.collections.len(), "loaded config");
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Json {
            path: "<inline>".to_string(),
            source,
        })
    }

    /// 构建schema, 并检查每个关联都指向已知集合
    pub fn schema(&self) -> Result<StaticSchema, ConfigError> {
        let mut schema = StaticSchema::new();
        for (name, collection) in &self.collections {
            let table = collection.table.clone().unwrap_or_else(|| name.clone());
            let mut built = CollectionSchema::new(table);
            for (field_name, field) in &collection.fields {
                let column = field.column.clone().unwrap_or_else(|| field_name.clone());
                let relation = match (field.kind, &field.collection) {
                    (FieldType::Relation, Some(target)) => {
                        if !self.collections.contains_key(target) {
                            return Err(ConfigError::Schema(format!(
                                "{name}.{field_name} points to unknown collection {target}"
                            )));
                        }
                        Some(RelationTarget {
                            collection: target.clone(),
                            multiple: field.multiple,
                        })
                    }
                    (FieldType::Relation, None) => {
                        return Err(ConfigError::Schema(format!(
                            "relation {name}.{field_name} has no target collection"
                        )));
                    }
                    _ => None,
                };
                built.insert(
                    field_name.clone(),
                    FieldInfo {
                        column,
                        kind: field.kind,
                        nullable: field.nullable,
                        relation,
                    },
                );
            }
            schema.insert(name.clone(), built);
        }
        Ok(schema)
    }
}
