//! Recording in-memory backend for lifecycle tests
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;

use dbsecrets_plugin::prelude::*;
use dbsecrets_sql::prelude::*;

/// A failure injected for statements containing `pattern`
#[derive(Clone)]
struct FailRule {
    pattern: String,
    code: Option<String>,
    in_transaction_only: bool,
}

/// Shared record of everything the plugin sent to the fake backend
#[derive(Default)]
pub struct Script {
    log: Mutex<Vec<String>>,
    failures: Mutex<Vec<FailRule>>,
    rows: Mutex<Vec<(String, Vec<Row>)>>,
    query_failures: Mutex<Vec<String>>,
    root_passwords: Mutex<Vec<String>>,
    pg_hosts: Mutex<Vec<usize>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every statement containing `pattern`
    pub fn fail(&self, pattern: &str, code: Option<&str>) {
        self.failures.lock().push(FailRule {
            pattern: pattern.to_string(),
            code: code.map(str::to_string),
            in_transaction_only: false,
        });
    }

    /// Fail statements containing `pattern` only inside a transaction
    pub fn fail_in_transaction(&self, pattern: &str, code: &str) {
        self.failures.lock().push(FailRule {
            pattern: pattern.to_string(),
            code: Some(code.to_string()),
            in_transaction_only: true,
        });
    }

    /// Answer queries containing `pattern` with `rows`
    pub fn rows(&self, pattern: &str, rows: Vec<Row>) {
        self.rows.lock().push((pattern.to_string(), rows));
    }

    /// Host count of every PostgreSQL target parsed at pool open
    pub fn pg_hosts(&self) -> Vec<usize> {
        self.pg_hosts.lock().clone()
    }

    /// Reject queries containing `pattern`
    pub fn fail_query(&self, pattern: &str) {
        self.query_failures.lock().push(pattern.to_string());
    }

    /// Answer queries containing `pattern` with a single boolean
    pub fn exists(&self, pattern: &str, exists: bool) {
        self.rows(
            pattern,
            vec![Row::new(vec!["exists".into()], vec![Value::Bool(exists)])],
        );
    }

    /// Everything executed so far, in order
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Executed statements, excluding queries and transaction control
    pub fn statements(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|s| !s.starts_with("QUERY ") && !matches!(s.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK"))
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Root passwords seen by every opened connection pool
    pub fn root_passwords(&self) -> Vec<String> {
        self.root_passwords.lock().clone()
    }

    fn run(&self, sql: &str, in_transaction: bool) -> Result<u64> {
        self.log.lock().push(sql.to_string());
        let failures = self.failures.lock().clone();
        for rule in failures {
            if sql.contains(&rule.pattern) && (in_transaction || !rule.in_transaction_only) {
                let message = format!("statement rejected: {sql}");
                return Err(match rule.code {
                    Some(code) => Error::statement_with_code(message, code),
                    None => Error::statement(message),
                });
            }
        }
        Ok(0)
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.log.lock().push(format!("QUERY {sql}"));
        if self.query_failures.lock().iter().any(|p| sql.contains(p.as_str())) {
            return Err(Error::statement("query rejected"));
        }
        for (pattern, rows) in self.rows.lock().iter() {
            if sql.contains(pattern.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }
}

struct FakeConnection {
    script: Arc<Script>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.script.run(sql, false)
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.script.query(sql)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.script.log.lock().push("BEGIN".into());
        Ok(Box::new(FakeTransaction {
            script: Arc::clone(&self.script),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeTransaction {
    script: Arc<Script>,
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.script.run(sql, true)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.script.log.lock().push("COMMIT".into());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.script.log.lock().push("ROLLBACK".into());
        Ok(())
    }
}

struct FakeFactory {
    script: Arc<Script>,
    database_type: DatabaseType,
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(FakeConnection {
            script: Arc::clone(&self.script),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }
}

/// [`Connector`] handing out fake sessions bound to a [`Script`]
pub struct FakeConnector {
    pub script: Arc<Script>,
}

impl Connector for FakeConnector {
    fn connection_factory(
        &self,
        database_type: DatabaseType,
        config: &SqlConfig,
    ) -> Result<Arc<dyn ConnectionFactory>> {
        self.script
            .root_passwords
            .lock()
            .push(config.connection.password.expose_secret().to_string());
        if database_type == DatabaseType::PostgreSQL {
            let target = dbsecrets_sql::postgres::parse_connection_string(
                &config.connection.render_url(database_type.driver()),
            )?;
            self.script.pg_hosts.lock().push(target.config.get_hosts().len());
        }
        Ok(Arc::new(FakeFactory {
            script: Arc::clone(&self.script),
            database_type,
        }))
    }
}

/// A plugin backed by the fake connector
pub fn plugin<D: SqlDialect>(dialect: D) -> (SqlDatabase<D>, Arc<Script>) {
    let script = Script::new();
    let db = SqlDatabase::with_connector(
        dialect,
        FakeConnector {
            script: Arc::clone(&script),
        },
    );
    (db, script)
}

/// Initialize with admin credentials `admin` / `secret`
pub async fn initialize<D: SqlDialect>(db: &SqlDatabase<D>, connection_url: &str) {
    initialize_with(db, json!({
        "connection_url": connection_url,
        "username": "admin",
        "password": "secret",
    }))
    .await;
}

pub async fn initialize_with<D: SqlDialect>(db: &SqlDatabase<D>, config: serde_json::Value) {
    db.initialize(InitializeRequest {
        config: config.as_object().cloned().unwrap(),
        verify_connection: true,
    })
    .await
    .unwrap();
}

pub fn new_user(statements: &[&str], expiration: DateTime<Utc>) -> NewUserRequest {
    NewUserRequest {
        username_config: UsernameMetadata::new("token", "readonly"),
        statements: Statements::new(statements.iter().copied()),
        rollback_statements: Statements::default(),
        credential_type: CredentialType::Password,
        password: SensitiveString::new("SuperSecret1!"),
        public_key: None,
        expiration,
    }
}

pub fn text_row(value: &str) -> Row {
    Row::new(vec!["value".into()], vec![Value::from(value)])
}
