//! Username template engine
//!
//! Templates use a Go `text/template` style syntax restricted to a closed set
//! of builtins:
//!
//! | Function | Result |
//! |---|---|
//! | `truncate N S` | first N characters of S |
//! | `truncate_sha256 N S` | S cut to N characters, the tail replaced by 8 hex chars of its SHA-256 |
//! | `uppercase S`, `lowercase S` | case mapping |
//! | `replace OLD NEW S` | replace all occurrences |
//! | `sha256 S`, `base64 S` | hex digest / standard base64 |
//! | `random N` | N random alphanumeric characters |
//! | `unix_time`, `unix_time_millis` | current Unix time |
//! | `timestamp LAYOUT` | current UTC time in a Go reference layout |
//! | `uuid` | random v4 UUID |
//! | `printf FMT ARGS...` | `%s %d %v %q` formatting |
//!
//! Fields `.DisplayName` and `.RoleName` read the request metadata.
//!
//! ```rust
//! use dbsecrets_plugin::template::UsernameTemplate;
//! use dbsecrets_plugin::UsernameMetadata;
//!
//! let tpl = UsernameTemplate::new(r#"{{ printf "v-%s-%s" (.DisplayName | truncate 5) .RoleName }}"#)?;
//! let name = tpl.render(&UsernameMetadata::new("token-abc", "reader"))?;
//! assert_eq!(name, "v-token-reader");
//! # Ok::<(), dbsecrets_plugin::Error>(())
//! ```

mod funcs;
mod parse;

use crate::error::{Error, Result};
use crate::types::UsernameMetadata;
use funcs::Value;
use parse::{Command, Field, Node, Operand, Pipeline};

/// A compiled username template
#[derive(Debug, Clone)]
pub struct UsernameTemplate {
    source: String,
    nodes: Vec<Node>,
}

impl UsernameTemplate {
    /// Compile a template, rejecting syntax errors and unknown functions
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let nodes = parse::parse(&source)
            .map_err(|e| Error::template(format!("unable to parse template: {e}")))?;
        Ok(Self { source, nodes })
    }

    /// Compile the operator's template, or `default` when none is configured,
    /// and prove it renders against empty metadata.
    pub fn for_config(custom: Option<&str>, default: &str) -> Result<Self> {
        let source = custom.filter(|s| !s.trim().is_empty()).unwrap_or(default);
        let invalid = |e: Error| Error::template(format!("invalid username template: {e}"));

        let template = Self::new(source).map_err(invalid)?;
        template
            .render(&UsernameMetadata::default())
            .map_err(invalid)?;
        Ok(template)
    }

    /// Template source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the template for one request
    pub fn render(&self, metadata: &UsernameMetadata) -> Result<String> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, metadata)
                        .map_err(|e| Error::template(format!("unable to render template: {e}")))?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }
}

fn eval_pipeline(
    pipeline: &Pipeline,
    metadata: &UsernameMetadata,
) -> std::result::Result<Value, String> {
    let mut piped = None;
    for command in &pipeline.commands {
        piped = Some(eval_command(command, piped, metadata)?);
    }
    piped.ok_or_else(|| "empty pipeline".to_string())
}

fn eval_command(
    command: &Command,
    piped: Option<Value>,
    metadata: &UsernameMetadata,
) -> std::result::Result<Value, String> {
    match command.operands.split_first() {
        Some((Operand::Function(builtin), rest)) => {
            let mut args = rest
                .iter()
                .map(|op| eval_operand(op, metadata))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            args.extend(piped);
            builtin.call(args)
        }
        Some((operand, [])) => {
            if piped.is_some() {
                return Err("can't give argument to non-function".to_string());
            }
            eval_operand(operand, metadata)
        }
        Some(_) => Err("can't give argument to non-function".to_string()),
        None => Err("missing value for command".to_string()),
    }
}

fn eval_operand(
    operand: &Operand,
    metadata: &UsernameMetadata,
) -> std::result::Result<Value, String> {
    match operand {
        Operand::Function(builtin) => builtin.call(Vec::new()),
        Operand::Field(Field::DisplayName) => Ok(Value::Str(metadata.display_name.clone())),
        Operand::Field(Field::RoleName) => Ok(Value::Str(metadata.role_name.clone())),
        Operand::Str(s) => Ok(Value::Str(s.clone())),
        Operand::Int(n) => Ok(Value::Int(*n)),
        Operand::Pipeline(inner) => eval_pipeline(inner, metadata),
    }
}
