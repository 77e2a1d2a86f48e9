//! Connection traits for SQL backends
//!
//! Core abstractions the lifecycle runs statements through:
//! - Connection: statement execution on one session
//! - Transaction: explicit BEGIN / COMMIT / ROLLBACK scope
//! - ConnectionFactory: opens sessions for the pool

use async_trait::async_trait;
use std::fmt;

use dbsecrets_plugin::Result;

use crate::types::{Row, Value};

/// Backend family a dialect talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    /// PostgreSQL wire protocol (PostgreSQL, Redshift, YugabyteDB)
    PostgreSQL,
    /// Microsoft SQL Server (TDS)
    SqlServer,
    /// Snowflake SQL REST API
    Snowflake,
}

impl DatabaseType {
    /// Driver name used when rendering the connection URL
    pub const fn driver(self) -> &'static str {
        match self {
            DatabaseType::PostgreSQL => "postgres",
            DatabaseType::SqlServer => "sqlserver",
            DatabaseType::Snowflake => "snowflake",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::PostgreSQL => f.write_str("PostgreSQL"),
            DatabaseType::SqlServer => f.write_str("SQL Server"),
            DatabaseType::Snowflake => f.write_str("Snowflake"),
        }
    }
}

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement, returns affected row count.
    ///
    /// With no parameters the text is sent as a simple (multi-statement
    /// capable) batch.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query that returns at most one row
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Check if connection is still valid.
    ///
    /// A connection whose transaction was dropped without commit or rollback
    /// is reported invalid so the pool discards it.
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// An open transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a statement within the transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens new sessions
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Backend family of the connections produced
    fn database_type(&self) -> DatabaseType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_driver() {
        assert_eq!(DatabaseType::PostgreSQL.driver(), "postgres");
        assert_eq!(DatabaseType::SqlServer.driver(), "sqlserver");
        assert_eq!(DatabaseType::Snowflake.to_string(), "Snowflake");
    }
}
