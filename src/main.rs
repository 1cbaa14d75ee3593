//! 交互式 shell: 解析 filter, 基于样例记录求值, 并编译为 SQL
//!
//! 用法: `record_filter [config.json]`

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use record_filter::config::Config;
use record_filter::sql_compiler::CompilerConfig;
use record_filter::{
    AccessGate, EvaluationContext, Evaluator, Expr, ExprCache, Record, RequestInfo, Rule,
    SqlCompiler, StaticSchema, SystemClock,
};

/// REPL 状态: 当前配置、集合以及用于求值的样例记录
struct Shell {
    config: Config,
    schema: StaticSchema,
    cache: ExprCache,
    collection: String,
    record: Record,
    auth: Option<Record>,
}

impl Shell {
    fn new(config: Config) -> Result<Self> {
        let schema = config.schema()?;
        let collection = config
            .collections
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "records".to_string());
        Ok(Self {
            cache: ExprCache::new(config.engine.cache_capacity),
            config,
            schema,
            record: Record::new(collection.clone()),
            collection,
            auth: None,
        })
    }

    fn parse(&self, source: &str) -> Result<Arc<Expr>> {
        let options = self.config.engine.filter_options();
        Ok(self.cache.get_or_parse(source, options, &SystemClock)?)
    }

    fn context(&self) -> EvaluationContext {
        EvaluationContext::new(self.record.clone(), self.request())
    }

    fn request(&self) -> RequestInfo {
        let request = RequestInfo::new("GET");
        match &self.auth {
            Some(auth) => request.with_auth(auth.clone()),
            None => request,
        }
    }

    /// 处理一行输入, `:` 开头的是命令, 其余按表达式求值
    fn handle(&mut self, line: &str) -> Result<()> {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            ":help" => print_help(),
            ":load" => {
                let config = Config::from_json_file(rest)?;
                *self = Shell::new(config)?;
                println!("using collection {}", self.collection);
            }
            ":collection" => {
                if rest.is_empty() {
                    let names: Vec<&str> = self.schema.collection_names().collect();
                    println!("{} (known: {})", self.collection, names.join(", "));
                    return Ok(());
                }
                self.collection = rest.to_string();
                self.record.collection = rest.to_string();
            }
            ":record" => {
                self.record = json_record(&self.collection, rest)?;
            }
            ":auth" => {
                self.auth = match rest {
                    "" | "none" => None,
                    json => Some(json_record("users", json)?),
                };
            }
            ":ast" => {
                let expr = self.parse(rest)?;
                println!("{}", serde_json::to_string_pretty(&*expr)?);
            }
            ":allow" => {
                let options = self.config.engine.rule_options();
                let rule = match rest {
                    "" => Rule::Public,
                    source => Rule::Expr(self.cache.get_or_parse(source, options, &SystemClock)?),
                };
                let gate = AccessGate::new(self.config.engine.eval_limits());
                let verdict = if gate.check(&rule, &self.context()) { "allowed" } else { "denied" };
                println!("{verdict}");
            }
            ":sql" => {
                // 列表过滤条件按客户端的路径深度限制编译
                let expr = self.parse(rest)?;
                let request = self.request();
                let compiler_config = CompilerConfig {
                    max_relation_depth: self.config.engine.max_filter_depth.saturating_sub(1),
                    ..self.config.engine.compiler_config()
                };
                let compiled = SqlCompiler::new(&self.schema, self.collection.as_str())
                    .with_config(compiler_config)
                    .with_request(&request)
                    .compile(&expr)?;
                let (sql, params) = compiled.to_select_sql();
                println!("{sql}");
                println!("params: {params:?}");
            }
            _ if command.starts_with(':') => bail!("unknown command {command}, try :help"),
            _ => {
                let expr = self.parse(line)?;
                let ctx = self.context();
                let matched = Evaluator::with_limits(&ctx, self.config.engine.eval_limits())
                    .evaluate(&expr)?;
                println!("{expr}  =>  {matched}");
            }
        }
        Ok(())
    }
}

fn json_record(collection: &str, json: &str) -> Result<Record> {
    let value: serde_json::Value = serde_json::from_str(json).context("record must be JSON")?;
    Record::from_json(collection, value).ok_or_else(|| anyhow!("record must be a JSON object"))
}

fn print_help() {
    println!("  <expr>                 evaluate against the current record");
    println!("  :ast <expr>            print the parsed tree");
    println!("  :sql <expr>            compile to SQL for the current collection");
    println!("  :allow <rule>          check an access rule against the current record");
    println!("  :record {{json}}         set the current record");
    println!("  :auth {{json}}|none      set the authenticated user");
    println!("  :collection [name]     show or switch collection");
    println!("  :load <config.json>    load engine config and schema");
    println!("  :quit                  exit");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("record_filter=info")),
        )
        .with_target(false)
        .init();

    // 优先使用命令行指定的JSON配置，否则使用默认配置
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_json_file(&path)?,
        None => Config::default(),
    };
    let mut shell = Shell::new(config)?;
    let mut editor = DefaultEditor::new()?;

    println!("record_filter shell, :help for commands");
    loop {
        match editor.readline("filter> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if matches!(line, ":quit" | ":q" | "exit") {
                    break;
                }
                if let Err(e) = shell.handle(line) {
                    eprintln!("error: {e:#}");
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
