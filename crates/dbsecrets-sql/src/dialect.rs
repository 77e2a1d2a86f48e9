//! Per-database behaviour of the SQL credential lifecycle
//!
//! A dialect supplies everything that differs between SQL plugins: the
//! plugin type tag, default username template and statements, the existence
//! probe, the "forbidden in transaction" classifier code, statement
//! splitting, expiration rendering and the revocation strategy. The
//! lifecycle itself lives in [`crate::database::SqlDatabase`].

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use dbsecrets_plugin::lifecycle::format_expiration;
use dbsecrets_plugin::query::{split_statements, split_unless_multiline};
use dbsecrets_plugin::{CredentialType, Error, Result};

use crate::connection::DatabaseType;

const POSTGRES_USERNAME_TEMPLATE: &str = r#"{{ printf "v-%s-%s-%s-%s" (.DisplayName | truncate 8) (.RoleName | truncate 8) (random 20) (unix_time) | truncate 63 }}"#;
const REDSHIFT_USERNAME_TEMPLATE: &str = r#"{{ printf "v-%s-%s-%s-%s" (.DisplayName | truncate 8) (.RoleName | truncate 8) (random 20) (unix_time) | truncate 63 | lowercase }}"#;
const MSSQL_USERNAME_TEMPLATE: &str = r#"{{ printf "v-%s-%s-%s-%s" (.DisplayName | truncate 20) (.RoleName | truncate 20) (random 20) (unix_time) | truncate 128 }}"#;
const SNOWFLAKE_USERNAME_TEMPLATE: &str = r#"{{ printf "v_%s_%s_%s_%s" (.DisplayName | truncate 32) (.RoleName | truncate 32) (random 20) (unix_time) | truncate 255 | replace "-" "_" }}"#;

/// SQLSTATE `active_sql_transaction`
pub const POSTGRES_TRANSACTION_FORBIDDEN: &str = "25001";

/// SQL Server error 574, "statement not allowed within multi-statement transaction"
pub const MSSQL_TRANSACTION_FORBIDDEN: &str = "574";

/// How sessions are cut off during a PostgreSQL-family sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTermination {
    /// `REVOKE CONNECT ON DATABASE <current_database()>`
    RevokeConnect,
    /// Install and call a procedure that terminates every `stv_sessions` entry
    TerminateLoop,
}

/// What DeleteUser does when the operator supplies no statements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    /// Grant discovery, REVOKE sweep, then `DROP ROLE`
    PostgresSweep(SessionTermination),
    /// Disable the login, kill sessions, drop mapped users, then `DROP LOGIN`
    SqlServerSweep,
    /// Run fixed default statements
    Statements(&'static [&'static str]),
}

/// Database-specific behaviour plugged into the SQL lifecycle
pub trait SqlDialect: Send + Sync + 'static {
    /// Plugin type tag
    fn plugin_type(&self) -> &'static str;

    /// Backend family
    fn database_type(&self) -> DatabaseType;

    /// Username template used when the operator configures none
    fn default_username_template(&self) -> &'static str;

    /// Query returning a truthy first column when the user exists; `None`
    /// when the backend offers no cheap probe.
    fn user_exists_query(&self) -> Option<&'static str>;

    /// Password rotation statements used when none are supplied
    fn default_rotation_statements(&self) -> &'static [&'static str];

    /// Renewal statements used when none are supplied; empty means no-op
    fn default_renewal_statements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Public key rotation statements used when none are supplied
    fn default_public_key_statements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Default revocation strategy
    fn revocation(&self) -> Revocation;

    /// Driver code meaning "cannot run inside a transaction"
    fn transaction_forbidden_code(&self) -> Option<&'static str>;

    /// Split one operator statement into executable sub-statements
    fn split_statement<'a>(&self, statement: &'a str) -> Vec<&'a str> {
        split_statements(statement)
    }

    /// Render `{{expiration}}`
    fn format_expiration(&self, expiration: &DateTime<Utc>) -> Result<String> {
        Ok(format_expiration(expiration))
    }

    /// Whether NewUser accepts this credential type
    fn supports_credential_type(&self, credential_type: CredentialType) -> bool {
        credential_type == CredentialType::Password
    }

    /// Whether `auth_type = gcp_iam` is available
    fn supports_gcp_iam(&self) -> bool {
        false
    }

    /// Whether `password_authentication = scram-sha-256` is available
    fn supports_password_hashing(&self) -> bool {
        false
    }
}

/// PostgreSQL
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn plugin_type(&self) -> &'static str {
        "postgresql"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn default_username_template(&self) -> &'static str {
        POSTGRES_USERNAME_TEMPLATE
    }

    fn user_exists_query(&self) -> Option<&'static str> {
        Some("SELECT exists (SELECT rolname FROM pg_roles WHERE rolname=$1)")
    }

    fn default_rotation_statements(&self) -> &'static [&'static str] {
        &[r#"ALTER ROLE "{{name}}" WITH PASSWORD '{{password}}';"#]
    }

    fn default_renewal_statements(&self) -> &'static [&'static str] {
        &[r#"ALTER ROLE "{{name}}" VALID UNTIL '{{expiration}}';"#]
    }

    fn revocation(&self) -> Revocation {
        Revocation::PostgresSweep(SessionTermination::RevokeConnect)
    }

    fn transaction_forbidden_code(&self) -> Option<&'static str> {
        Some(POSTGRES_TRANSACTION_FORBIDDEN)
    }

    fn split_statement<'a>(&self, statement: &'a str) -> Vec<&'a str> {
        split_unless_multiline(statement)
    }

    fn supports_gcp_iam(&self) -> bool {
        true
    }

    fn supports_password_hashing(&self) -> bool {
        true
    }
}

/// Amazon Redshift
#[derive(Debug, Clone, Copy, Default)]
pub struct RedshiftDialect;

impl SqlDialect for RedshiftDialect {
    fn plugin_type(&self) -> &'static str {
        "redshift"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn default_username_template(&self) -> &'static str {
        REDSHIFT_USERNAME_TEMPLATE
    }

    fn user_exists_query(&self) -> Option<&'static str> {
        Some("SELECT exists (SELECT usename FROM pg_user WHERE usename=$1)")
    }

    fn default_rotation_statements(&self) -> &'static [&'static str] {
        &[r#"ALTER USER "{{name}}" WITH PASSWORD '{{password}}';"#]
    }

    fn revocation(&self) -> Revocation {
        Revocation::PostgresSweep(SessionTermination::TerminateLoop)
    }

    fn transaction_forbidden_code(&self) -> Option<&'static str> {
        Some(POSTGRES_TRANSACTION_FORBIDDEN)
    }
}

/// YugabyteDB YSQL
#[derive(Debug, Clone, Copy, Default)]
pub struct YugabyteDialect;

impl SqlDialect for YugabyteDialect {
    fn plugin_type(&self) -> &'static str {
        "ysql"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn default_username_template(&self) -> &'static str {
        POSTGRES_USERNAME_TEMPLATE
    }

    fn user_exists_query(&self) -> Option<&'static str> {
        PostgresDialect.user_exists_query()
    }

    fn default_rotation_statements(&self) -> &'static [&'static str] {
        PostgresDialect.default_rotation_statements()
    }

    fn default_renewal_statements(&self) -> &'static [&'static str] {
        PostgresDialect.default_renewal_statements()
    }

    fn revocation(&self) -> Revocation {
        Revocation::PostgresSweep(SessionTermination::RevokeConnect)
    }

    fn transaction_forbidden_code(&self) -> Option<&'static str> {
        Some(POSTGRES_TRANSACTION_FORBIDDEN)
    }

    fn split_statement<'a>(&self, statement: &'a str) -> Vec<&'a str> {
        split_unless_multiline(statement)
    }
}

/// Microsoft SQL Server
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn plugin_type(&self) -> &'static str {
        "mssql"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn default_username_template(&self) -> &'static str {
        MSSQL_USERNAME_TEMPLATE
    }

    fn user_exists_query(&self) -> Option<&'static str> {
        Some("SELECT COUNT(*) FROM sys.server_principals WHERE name = @P1")
    }

    fn default_rotation_statements(&self) -> &'static [&'static str] {
        &["ALTER LOGIN [{{name}}] WITH PASSWORD = '{{password}}';"]
    }

    fn revocation(&self) -> Revocation {
        Revocation::SqlServerSweep
    }

    fn transaction_forbidden_code(&self) -> Option<&'static str> {
        Some(MSSQL_TRANSACTION_FORBIDDEN)
    }
}

/// Snowflake
#[derive(Debug, Clone, Copy, Default)]
pub struct SnowflakeDialect;

impl SqlDialect for SnowflakeDialect {
    fn plugin_type(&self) -> &'static str {
        "snowflake"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Snowflake
    }

    fn default_username_template(&self) -> &'static str {
        SNOWFLAKE_USERNAME_TEMPLATE
    }

    fn user_exists_query(&self) -> Option<&'static str> {
        None
    }

    fn default_rotation_statements(&self) -> &'static [&'static str] {
        &["alter user {{name}} set PASSWORD = '{{password}}';"]
    }

    fn default_renewal_statements(&self) -> &'static [&'static str] {
        &["alter user {{name}} set DAYS_TO_EXPIRY = {{expiration}};"]
    }

    fn default_public_key_statements(&self) -> &'static [&'static str] {
        &["alter user {{name}} set RSA_PUBLIC_KEY = '{{public_key}}';"]
    }

    fn revocation(&self) -> Revocation {
        Revocation::Statements(&["DROP USER IF EXISTS {{name}};"])
    }

    fn transaction_forbidden_code(&self) -> Option<&'static str> {
        None
    }

    fn format_expiration(&self, expiration: &DateTime<Utc>) -> Result<String> {
        days_to_expiry(expiration, Utc::now()).map(|days| days.to_string())
    }

    fn supports_credential_type(&self, credential_type: CredentialType) -> bool {
        matches!(
            credential_type,
            CredentialType::Password | CredentialType::RsaPrivateKey
        )
    }
}

/// Whole days until `expiration`, never less than one.
///
/// An expiration that is not in the future is rejected.
pub fn days_to_expiry(expiration: &DateTime<Utc>, now: DateTime<Utc>) -> Result<i64> {
    let remaining = expiration.signed_duration_since(now);
    if remaining.num_milliseconds() <= 0 {
        return Err(Error::invalid_request(format!(
            "expiration {} is in the past",
            expiration.to_rfc3339()
        )));
    }
    Ok((remaining.num_seconds() / 86_400).max(1))
}

static SNOWFLAKE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<account>[A-Za-z0-9_.-]+)\.snowflakecomputing\.com/(?P<database>[^/?]+)(?:\?(?P<query>.*))?$")
        .expect("valid regex")
});

/// Parsed `<account>.snowflakecomputing.com/<db>` connection URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeLocator {
    /// Account identifier as written, e.g. `xy12345.us-east-1`
    pub account: String,
    /// Database name
    pub database: String,
    /// Optional warehouse from `?warehouse=`
    pub warehouse: Option<String>,
    /// Optional role from `?role=`
    pub role: Option<String>,
}

impl SnowflakeLocator {
    /// Parse a rendered connection URL.
    ///
    /// Userinfo (`user:pass@`) and a `snowflake://` or `https://` prefix are
    /// accepted and ignored.
    pub fn parse(url: &str) -> Result<Self> {
        let without_scheme = url
            .strip_prefix("snowflake://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url);
        let host_part = without_scheme
            .rsplit_once('@')
            .map_or(without_scheme, |(_, rest)| rest);

        let captures = SNOWFLAKE_URL.captures(host_part).ok_or_else(|| {
            Error::config(
                "connection_url must have the form <account>.snowflakecomputing.com/<database>",
            )
        })?;

        let mut locator = Self {
            account: captures["account"].to_string(),
            database: captures["database"].to_string(),
            warehouse: None,
            role: None,
        };
        if let Some(query) = captures.name("query") {
            for pair in query.as_str().split('&') {
                match pair.split_once('=') {
                    Some((k, v)) if k.eq_ignore_ascii_case("warehouse") => {
                        locator.warehouse = Some(v.to_string())
                    }
                    Some((k, v)) if k.eq_ignore_ascii_case("role") => {
                        locator.role = Some(v.to_string())
                    }
                    _ => {}
                }
            }
        }
        Ok(locator)
    }

    /// Account locator used in key-pair JWT claims: the part before the
    /// first `.`, upper-cased.
    pub fn account_locator(&self) -> String {
        self.account
            .split('.')
            .next()
            .unwrap_or(&self.account)
            .to_uppercase()
    }

    /// Base URL of the SQL API
    pub fn api_url(&self) -> String {
        format!("https://{}.snowflakecomputing.com", self.account)
    }
}
