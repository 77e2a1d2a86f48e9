//! Cypher client abstraction and the neo4rs-backed implementation
//!
//! The lifecycle talks to Neo4j only through [`CypherClient`]; statements
//! carry both the pre-substituted text and the native `$name` parameters.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use dbsecrets_plugin::prelude::*;

use crate::config::Neo4jConfig;

/// Error code for statements that may not run inside an explicit transaction
pub const FORBIDDEN_DUE_TO_TRANSACTION_TYPE: &str =
    "Neo.ClientError.Transaction.ForbiddenDueToTransactionType";

/// Prefix of retriable server error codes
pub const TRANSIENT_ERROR_PREFIX: &str = "Neo.TransientError.";

/// An open Cypher connection
#[async_trait]
pub trait CypherClient: Send + Sync + 'static {
    /// Run a statement in its own auto-commit transaction
    async fn run(&self, cypher: &str, params: &QueryParams) -> Result<()>;

    /// Run a statement returning a single integer
    async fn count(&self, cypher: &str, params: &QueryParams) -> Result<i64>;

    /// Open an explicit write transaction
    async fn begin(&self) -> Result<Box<dyn CypherTransaction>>;

    /// Liveness probe
    async fn verify(&self) -> Result<()>;
}

/// An explicit transaction
#[async_trait]
pub trait CypherTransaction: Send {
    /// Run a statement inside the transaction
    async fn run(&mut self, cypher: &str, params: &QueryParams) -> Result<()>;

    /// Commit
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens [`CypherClient`]s for a configuration
#[async_trait]
pub trait Neo4jConnector: Send + Sync + 'static {
    /// Open a client authenticated with the configured admin credentials
    async fn connect(&self, config: &Neo4jConfig) -> Result<Arc<dyn CypherClient>>;
}

fn query(cypher: &str, params: &QueryParams) -> neo4rs::Query {
    params
        .iter()
        .fold(neo4rs::query(cypher), |q, (key, value)| {
            q.param(key, value.to_string())
        })
}

fn driver_error(e: neo4rs::Error) -> Error {
    let code = match &e {
        neo4rs::Error::Neo4j(server) => Some(server.code().to_string()),
        _ => None,
    };
    Error::statement_with_source(code, e)
}

/// [`CypherClient`] over a neo4rs connection pool
pub struct Neo4rsClient {
    graph: neo4rs::Graph,
    acquisition_timeout: std::time::Duration,
}

impl Neo4rsClient {
    async fn acquire<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, neo4rs::Error>>,
    {
        match tokio::time::timeout(self.acquisition_timeout, op).await {
            Ok(result) => result.map_err(driver_error),
            Err(_) => Err(Error::reachability(format!(
                "timed out after {}ms acquiring a Neo4j session",
                self.acquisition_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CypherClient for Neo4rsClient {
    async fn run(&self, cypher: &str, params: &QueryParams) -> Result<()> {
        self.acquire(self.graph.run(query(cypher, params))).await
    }

    async fn count(&self, cypher: &str, params: &QueryParams) -> Result<i64> {
        let mut rows = self.acquire(self.graph.execute(query(cypher, params))).await?;
        let Some(row) = rows.next().await.map_err(driver_error)? else {
            return Ok(0);
        };
        row.get::<i64>("count(*)")
            .or_else(|_| row.get::<i64>("count"))
            .map_err(|e| Error::statement(format!("unexpected count result: {e}")))
    }

    async fn begin(&self) -> Result<Box<dyn CypherTransaction>> {
        let txn = self.acquire(self.graph.start_txn()).await?;
        Ok(Box::new(Neo4rsTransaction { txn }))
    }

    async fn verify(&self) -> Result<()> {
        self.run("RETURN 1", &QueryParams::new()).await
    }
}

struct Neo4rsTransaction {
    txn: neo4rs::Txn,
}

#[async_trait]
impl CypherTransaction for Neo4rsTransaction {
    async fn run(&mut self, cypher: &str, params: &QueryParams) -> Result<()> {
        self.txn
            .run(query(cypher, params))
            .await
            .map_err(driver_error)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit().await.map(|_| ()).map_err(driver_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.txn.rollback().await.map_err(driver_error)
    }
}

/// Connector using the neo4rs Bolt driver
#[derive(Debug, Default, Clone, Copy)]
pub struct Neo4rsConnector;

#[async_trait]
impl Neo4jConnector for Neo4rsConnector {
    async fn connect(&self, config: &Neo4jConfig) -> Result<Arc<dyn CypherClient>> {
        let mut builder = neo4rs::ConfigBuilder::default()
            .uri(config.uri())
            .user(config.connection.username.as_str())
            .password(config.connection.password.expose_secret())
            .max_connections(config.max_connection_pool_size);
        if let Some(db) = &config.database_name {
            builder = builder.db(db.as_str());
        }
        let driver_config = builder
            .build()
            .map_err(|e| Error::config(format!("invalid Neo4j configuration: {e}")))?;

        debug!(
            url = %config.connection.redacted_url("neo4j"),
            "connecting to Neo4j"
        );
        let graph = tokio::time::timeout(
            config.socket_connect_timeout,
            neo4rs::Graph::connect(driver_config),
        )
        .await
        .map_err(|_| Error::reachability("timed out connecting to Neo4j"))?
        .map_err(|e| Error::reachability_with_source("failed to connect to Neo4j", e))?;

        Ok(Arc::new(Neo4rsClient {
            graph,
            acquisition_timeout: config.connection_acquisition_timeout,
        }))
    }
}
