//! Command-line arguments for the plugin host

use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Database plugins this binary can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PluginKind {
    /// PostgreSQL
    Postgresql,
    /// Amazon Redshift
    Redshift,
    /// YugabyteDB (YSQL)
    Ysql,
    /// Microsoft SQL Server
    Mssql,
    /// Snowflake
    Snowflake,
    /// Neo4j
    Neo4j,
    /// Redis ACL users
    Redis,
    /// Elasticsearch native realm
    Elasticsearch,
    /// Couchbase RBAC
    Couchbase,
    /// MongoDB Atlas database users
    Mongodbatlas,
}

/// dbsecretsd - database credential plugin host
///
/// Serves one database plugin over line-delimited JSON on stdin/stdout.
/// Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "dbsecretsd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Plugin to serve
    #[arg(value_enum, env = "DBSECRETS_PLUGIN")]
    pub plugin: PluginKind,

    /// Per-request deadline, e.g. `30s` or `2m`; `0s` disables it
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration, env = "DBSECRETS_REQUEST_TIMEOUT")]
    pub request_timeout: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Shorthand for `--log-level debug`
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Effective log filter
    pub fn log_filter(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }

    /// Request deadline, `None` when disabled
    pub fn request_deadline(&self) -> Option<Duration> {
        (!self.request_timeout.is_zero()).then_some(self.request_timeout)
    }
}
