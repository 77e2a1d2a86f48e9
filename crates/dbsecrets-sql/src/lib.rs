//! # dbsecrets-sql
//!
//! SQL credential plugins: PostgreSQL, Amazon Redshift, YugabyteDB (YSQL),
//! Microsoft SQL Server and Snowflake.
//!
//! ## Features
//!
//! - **One lifecycle, many dialects**: [`SqlDatabase`] drives every plugin;
//!   a [`SqlDialect`] supplies defaults, probes and revocation strategy
//! - **Transactional statements** with a per-statement fallback when the
//!   backend refuses a statement inside a transaction
//! - **Revocation sweeps** synthesized from live catalog data when
//!   DeleteUser carries no statements
//! - **Connection pooling** bounded by `max_open_connections`,
//!   `max_idle_connections` and `max_connection_lifetime`
//! - **Client-side SCRAM-SHA-256 hashing** of PostgreSQL passwords when
//!   `password_authentication = scram-sha-256`
//! - **Key-pair authentication** for Snowflake and optional Cloud SQL IAM
//!   tokens for PostgreSQL (`gcp` feature)
//!
//! ## Feature flags
//!
//! | Feature | Driver |
//! |---------|--------|
//! | `postgres` | tokio-postgres (PostgreSQL, Redshift, YSQL) |
//! | `sqlserver` | tiberius |
//! | `snowflake` | Snowflake SQL API over reqwest |
//! | `gcp` | Cloud SQL IAM tokens for PostgreSQL |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let plugin = ErrorSanitizer::new(dbsecrets_sql::postgresql());
//! serve(Arc::new(plugin), ServeOptions::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod database;
pub mod dialect;
pub mod native;
pub mod pool;
pub mod revocation;
pub mod scram;
pub mod types;

#[cfg(feature = "gcp")]
pub mod gcp;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "snowflake")]
pub mod snowflake;
#[cfg(feature = "sqlserver")]
pub mod sqlserver;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionFactory, DatabaseType, Transaction};
    pub use crate::database::{Connector, SqlConfig, SqlDatabase};
    pub use crate::dialect::{
        PostgresDialect, RedshiftDialect, SnowflakeDialect, SqlDialect, SqlServerDialect,
        YugabyteDialect,
    };
    pub use crate::native::NativeConnector;
    pub use crate::pool::{PoolConfig, PoolStats, PooledConnection, SimpleConnectionPool};
    pub use crate::scram::PasswordAuthentication;
    pub use crate::types::{Row, Value};
}

pub use connection::{Connection, ConnectionFactory, DatabaseType, Transaction};
pub use database::{Connector, SqlConfig, SqlDatabase};
pub use dialect::{
    PostgresDialect, RedshiftDialect, SnowflakeDialect, SqlDialect, SqlServerDialect,
    YugabyteDialect,
};
pub use types::{Row, Value};

/// The `postgresql` plugin
pub type PostgreSql = SqlDatabase<PostgresDialect>;
/// The `redshift` plugin
pub type Redshift = SqlDatabase<RedshiftDialect>;
/// The `ysql` plugin
pub type Yugabyte = SqlDatabase<YugabyteDialect>;
/// The `mssql` plugin
pub type SqlServer = SqlDatabase<SqlServerDialect>;
/// The `snowflake` plugin
pub type Snowflake = SqlDatabase<SnowflakeDialect>;

/// New `postgresql` plugin
pub fn postgresql() -> PostgreSql {
    SqlDatabase::new(PostgresDialect)
}

/// New `redshift` plugin
pub fn redshift() -> Redshift {
    SqlDatabase::new(RedshiftDialect)
}

/// New `ysql` plugin
pub fn ysql() -> Yugabyte {
    SqlDatabase::new(YugabyteDialect)
}

/// New `mssql` plugin
pub fn mssql() -> SqlServer {
    SqlDatabase::new(SqlServerDialect)
}

/// New `snowflake` plugin
pub fn snowflake() -> Snowflake {
    SqlDatabase::new(SnowflakeDialect)
}
