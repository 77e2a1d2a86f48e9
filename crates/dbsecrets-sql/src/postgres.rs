//! PostgreSQL backend
//!
//! Serves the `postgresql`, `redshift` and `ysql` plugins over
//! tokio-postgres with rustls. Statements without parameters go through the
//! simple query protocol so operator text may hold several statements or
//! `$$`-quoted procedure bodies.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use dbsecrets_plugin::tls::{default_client_config, TlsMaterial};
use dbsecrets_plugin::{Error, Result};

use crate::connection::{Connection, ConnectionFactory, DatabaseType, Transaction};
use crate::database::SqlConfig;
use crate::types::{Row, Value};

/// Query parameters libpq accepts but tokio-postgres does not; TLS material
/// comes from the PEM configuration keys instead.
const IGNORED_PARAMS: &[&str] = &["sslrootcert", "sslcert", "sslkey", "sslpassword"];

/// Convert a Value to a tokio-postgres parameter
fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int(n) => Box::new(*n),
        Value::Text(s) => Box::new(s.clone()),
    }
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).ok().flatten().into(),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(i64::from)
            .into(),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(i64::from)
            .into(),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).ok().flatten().into(),
        _ => row.try_get::<_, Option<String>>(idx).ok().flatten().into(),
    }
}

fn pg_error(e: tokio_postgres::Error) -> Error {
    let code = e.code().map(|state| state.code().to_string());
    Error::statement_with_source(code, e)
}

/// PostgreSQL connection
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    in_transaction: Arc<AtomicBool>,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            in_transaction: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn execute_on(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<u64> {
    if params.is_empty() {
        client.batch_execute(sql).await.map_err(pg_error)?;
        return Ok(0);
    }
    let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client.execute(sql, &refs).await.map_err(pg_error)
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        execute_on(&self.client, sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(sql, &refs).await.map_err(pg_error)?;
        Ok(rows.iter().map(pg_row_to_row).collect())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.client.batch_execute("BEGIN").await.map_err(pg_error)?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            in_transaction: Arc::clone(&self.in_transaction),
        }))
    }

    async fn is_valid(&self) -> bool {
        !self.in_transaction.load(Ordering::SeqCst)
            && !self.client.is_closed()
            && self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        // The session ends when the client is dropped
        Ok(())
    }
}

/// PostgreSQL transaction.
///
/// Dropping it unfinished leaves the session flagged as in-transaction, so
/// the pool discards it instead of reusing it.
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    in_transaction: Arc<AtomicBool>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        execute_on(&self.client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("COMMIT").await.map_err(pg_error)?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(pg_error)?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Parsed connection string plus whether the server certificate must be
/// verified (`sslmode=verify-ca` / `verify-full`).
#[derive(Debug)]
pub struct PgTarget {
    /// Driver configuration
    pub config: tokio_postgres::Config,
    /// Verify the server certificate
    pub verify: bool,
}

fn decode_component(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::config(format!("invalid connection_url: {e}")))
}

/// Parse a rendered URL or key/value DSN into a driver configuration.
///
/// libpq-only settings are translated: `timezone` becomes
/// `options=-c TimeZone=...`, the `verify-*` ssl modes become `require`
/// with certificate verification, and file-based TLS keys are dropped.
pub fn parse_connection_string(rendered: &str) -> Result<PgTarget> {
    let mut verify = false;

    let normalized = if dbsecrets_plugin::config::is_postgres_url(rendered) {
        // Only the query is rewritten; tokio-postgres parses the authority,
        // including comma-separated hosts.
        let trimmed = rendered.trim();
        let (base, query) = trimmed.split_once('?').unwrap_or((trimmed, ""));

        let mut kept: Vec<(String, String)> = Vec::new();
        let mut options: Vec<String> = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(raw_key)?;
            let value = decode_component(raw_value)?;
            match key.to_ascii_lowercase().as_str() {
                "timezone" => options.push(format!("-c TimeZone={value}")),
                "options" => options.insert(0, value),
                "sslmode" => match value.as_str() {
                    "verify-ca" | "verify-full" => {
                        verify = true;
                        kept.push((key, "require".to_string()));
                    }
                    "allow" => kept.push((key, "prefer".to_string())),
                    _ => kept.push((key, value)),
                },
                k if IGNORED_PARAMS.contains(&k) => {
                    debug!(param = k, "ignoring file-based TLS parameter");
                }
                _ => kept.push((key, value)),
            }
        }
        if !options.is_empty() {
            kept.push(("options".to_string(), options.join(" ")));
        }

        let query = kept
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, NON_ALPHANUMERIC),
                    utf8_percent_encode(v, NON_ALPHANUMERIC)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        if query.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{query}")
        }
    } else {
        let mut dsn = rendered.to_string();
        for mode in ["sslmode=verify-full", "sslmode=verify-ca"] {
            if dsn.contains(mode) {
                verify = true;
                dsn = dsn.replace(mode, "sslmode=require");
            }
        }
        dsn
    };

    let config = tokio_postgres::Config::from_str(&normalized)
        .map_err(|e| Error::config(format!("invalid connection_url: {e}")))?;
    Ok(PgTarget { config, verify })
}

/// PostgreSQL connection factory
pub struct PgConnectionFactory {
    config: tokio_postgres::Config,
    tls: MakeRustlsConnect,
    #[cfg(feature = "gcp")]
    iam: Option<Arc<crate::gcp::IamTokenSource>>,
}

impl PgConnectionFactory {
    /// Build from a parsed plugin configuration
    pub fn from_config(config: &SqlConfig) -> Result<Self> {
        let target = parse_connection_string(
            &config
                .connection
                .render_url(DatabaseType::PostgreSQL.driver()),
        )?;

        let tls_config = match (&config.connection.tls, target.verify) {
            (Some(material), _) => material.client_config()?,
            (None, true) => default_client_config()?,
            (None, false) => TlsMaterial::insecure().client_config()?,
        };

        #[cfg(feature = "gcp")]
        let iam = match config.iam_driver() {
            Some(name) => Some(crate::gcp::lookup(name).ok_or_else(|| {
                Error::internal(format!("IAM token source {name} is not registered"))
            })?),
            None => None,
        };

        Ok(Self {
            config: target.config,
            tls: MakeRustlsConnect::new(tls_config),
            #[cfg(feature = "gcp")]
            iam,
        })
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        #[allow(unused_mut)]
        let mut config = self.config.clone();
        #[cfg(feature = "gcp")]
        if let Some(iam) = &self.iam {
            let token = iam.token().await?;
            config.password(token.expose_secret());
        }

        let (client, connection) = config
            .connect(self.tls.clone())
            .await
            .map_err(|e| Error::reachability_with_source("failed to connect to PostgreSQL", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection error");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
