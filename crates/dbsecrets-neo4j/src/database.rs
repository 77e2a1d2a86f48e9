//! Neo4j credential lifecycle
//!
//! Statements are Cypher. Every statement is pre-substituted with the
//! `{{name}}` templater *and* sent with the same values as native
//! parameters, so operators may write either `{{username}}` or `$username`.
//!
//! Administration commands such as `CREATE USER` cannot share an explicit
//! transaction with data writes; the server answers with
//! `Neo.ClientError.Transaction.ForbiddenDueToTransactionType` and the
//! statement list is replayed in auto-commit mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use dbsecrets_plugin::lifecycle::{
    check_new_user, credential_params, format_expiration, require_password,
    statements_or_default,
};
use dbsecrets_plugin::prelude::*;
use dbsecrets_plugin::query::split_statements;

use crate::client::{
    CypherClient, Neo4jConnector, Neo4rsConnector, FORBIDDEN_DUE_TO_TRANSACTION_TYPE,
    TRANSIENT_ERROR_PREFIX,
};
use crate::config::Neo4jConfig;

/// Existence probe
pub const USER_EXISTS_QUERY: &str =
    "SHOW USERS YIELD user WHERE user = $username RETURN count(*)";

/// Default revocation statements
pub const DEFAULT_REVOCATION_STATEMENTS: &[&str] = &["DROP USER $username;"];

/// Default password rotation statements
pub const DEFAULT_ROTATION_STATEMENTS: &[&str] =
    &["ALTER USER $username SET PASSWORD $password CHANGE NOT REQUIRED"];

/// Undo statements when creation fails outside a transaction
const DEFAULT_ROLLBACK_STATEMENTS: &[&str] = &["DROP USER $username"];

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

fn is_forbidden_in_transaction(err: &Error) -> bool {
    err.code() == Some(FORBIDDEN_DUE_TO_TRANSACTION_TYPE)
}

fn is_transient(err: &Error) -> bool {
    err.code()
        .is_some_and(|code| code.starts_with(TRANSIENT_ERROR_PREFIX))
}

/// Split and template every statement
fn render(statements: &[String], params: &QueryParams) -> Vec<String> {
    statements
        .iter()
        .flat_map(|s| split_statements(s))
        .map(|s| query_template(s, params))
        .collect()
}

/// [`ClientFactory`] opening neo4rs-style clients
pub struct Neo4jClientFactory {
    connector: Box<dyn Neo4jConnector>,
}

#[async_trait]
impl ClientFactory for Neo4jClientFactory {
    type Config = Neo4jConfig;
    type Client = Arc<dyn CypherClient>;

    fn parse_config(&self, raw: &ConfigMap) -> Result<Neo4jConfig> {
        Neo4jConfig::from_map(raw)
    }

    async fn open(&self, config: &Neo4jConfig) -> Result<Arc<dyn CypherClient>> {
        self.connector.connect(config).await
    }

    async fn ping(&self, client: &Arc<dyn CypherClient>) -> Result<()> {
        client.verify().await
    }

    async fn close(&self, _client: Arc<dyn CypherClient>) {
        // The driver pool closes when the last handle is dropped
        debug!("released Neo4j client");
    }
}

/// The `neo4j` plugin
pub struct Neo4j {
    producer: ConnectionProducer<Neo4jClientFactory>,
}

impl Default for Neo4j {
    fn default() -> Self {
        Self::new()
    }
}

impl Neo4j {
    /// Create a plugin using the Bolt driver
    pub fn new() -> Self {
        Self::with_connector(Neo4rsConnector)
    }

    /// Create a plugin with a custom connector
    pub fn with_connector(connector: impl Neo4jConnector) -> Self {
        Self {
            producer: ConnectionProducer::new(Neo4jClientFactory {
                connector: Box::new(connector),
            }),
        }
    }

    /// Run the statements in one explicit transaction, retrying transient
    /// failures until `retry_time` has elapsed.
    async fn run_in_transaction(
        &self,
        client: &dyn CypherClient,
        statements: &[String],
        params: &QueryParams,
        retry_time: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            match self.try_transaction(client, statements, params).await {
                Err(e) if is_transient(&e) && started.elapsed() + delay < retry_time => {
                    debug!(error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying transaction");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    async fn try_transaction(
        &self,
        client: &dyn CypherClient,
        statements: &[String],
        params: &QueryParams,
    ) -> Result<()> {
        let mut tx = client.begin().await?;
        for cypher in render(statements, params) {
            if let Err(e) = tx.run(&cypher, params).await {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "rollback after failed statement also failed");
                }
                return Err(e);
            }
        }
        tx.commit().await
    }

    async fn run_each(
        &self,
        client: &dyn CypherClient,
        statements: &[String],
        params: &QueryParams,
    ) -> Result<()> {
        for cypher in render(statements, params) {
            client.run(&cypher, params).await?;
        }
        Ok(())
    }

    async fn run_with_fallback(
        &self,
        client: &dyn CypherClient,
        statements: &[String],
        params: &QueryParams,
        retry_time: Duration,
    ) -> Result<()> {
        match self
            .run_in_transaction(client, statements, params, retry_time)
            .await
        {
            Err(e) if is_forbidden_in_transaction(&e) => {
                info!("statement cannot run inside a transaction, retrying without one");
                self.run_each(client, statements, params).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Database for Neo4j {
    fn plugin_type(&self) -> &'static str {
        "neo4j"
    }

    async fn initialize(&self, request: InitializeRequest) -> Result<InitializeResponse> {
        let config = self
            .producer
            .initialize(request.config, request.verify_connection)
            .await?;
        Ok(InitializeResponse { config })
    }

    async fn new_user(&self, request: NewUserRequest) -> Result<NewUserResponse> {
        check_new_user(&request)?;
        require_password(request.credential_type)?;

        let mut guard = self.producer.lock().await;
        let config = guard.config()?;
        let username = config.username_template.render(&request.username_config)?;
        let retry_time = config.max_transaction_retry_time;
        let expiration = format_expiration(&request.expiration);
        let params = credential_params(
            &username,
            Some(request.password.expose_secret()),
            Some(&expiration),
        );

        let client = guard.connection().await?;
        let statements = &request.statements.commands;
        match self
            .run_in_transaction(&*client, statements, &params, retry_time)
            .await
        {
            Err(e) if is_forbidden_in_transaction(&e) => {
                info!("creation statement cannot run inside a transaction, retrying without one");
                if let Err(original) = self.run_each(&*client, statements, &params).await {
                    let rollback = statements_or_default(
                        &request.rollback_statements,
                        DEFAULT_ROLLBACK_STATEMENTS,
                    );
                    warn!(error = %original, "user creation failed outside a transaction, running rollback statements");
                    return Err(match self.run_each(&*client, &rollback, &params).await {
                        Ok(()) => original,
                        Err(rb) => Error::rollback(original, rb),
                    });
                }
            }
            other => other?,
        }

        debug!(username = %username, "user created");
        Ok(NewUserResponse { username })
    }

    async fn update_user(&self, request: UpdateUserRequest) -> Result<()> {
        if request.is_noop() {
            return Err(Error::NoChanges);
        }
        if request.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }
        if request.public_key.is_some() {
            return Err(Error::unsupported("public key rotation is not supported by neo4j"));
        }
        let username = request.username.as_str();

        let mut guard = self.producer.lock().await;
        let retry_time = guard.config()?.max_transaction_retry_time;
        let client = guard.connection().await?;

        let probe = credential_params(username, None, None);
        if client.count(USER_EXISTS_QUERY, &probe).await? == 0 {
            return Err(Error::user_not_found(username));
        }

        if let Some(change) = &request.password {
            let statements = statements_or_default(&change.statements, DEFAULT_ROTATION_STATEMENTS);
            let params = credential_params(username, Some(change.new_password.expose_secret()), None);
            self.run_with_fallback(&*client, &statements, &params, retry_time)
                .await?;
        }

        if let Some(change) = &request.expiration {
            if !change.statements.is_empty() {
                let expiration = format_expiration(&change.new_expiration);
                let params = credential_params(username, None, Some(&expiration));
                self.run_with_fallback(&*client, &change.statements.commands, &params, retry_time)
                    .await?;
            }
        }

        drop(client);
        if let Some(change) = &request.password {
            if guard.is_root_user(username) {
                guard.rotate_root_password(&change.new_password).await?;
            }
        }
        Ok(())
    }

    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()> {
        if request.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }

        let mut guard = self.producer.lock().await;
        let retry_time = guard.config()?.max_transaction_retry_time;
        let client = guard.connection().await?;

        let statements = statements_or_default(&request.statements, DEFAULT_REVOCATION_STATEMENTS);
        let params = credential_params(&request.username, None, None);
        self.run_with_fallback(&*client, &statements, &params, retry_time)
            .await
    }

    async fn close(&self) -> Result<()> {
        self.producer.close().await
    }

    fn secret_values(&self) -> SecretValues {
        self.producer.secret_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_keeps_native_parameters() {
        let params = credential_params("v-d-r", Some("pw"), None);
        let rendered = render(
            &["CREATE USER $username SET PASSWORD $password; GRANT ROLE r TO {{name}}".into()],
            &params,
        );
        assert_eq!(
            rendered,
            vec![
                "CREATE USER $username SET PASSWORD $password".to_string(),
                "GRANT ROLE r TO v-d-r".to_string(),
            ]
        );
    }

    #[test]
    fn test_error_classification() {
        let forbidden = Error::statement_with_code("nope", FORBIDDEN_DUE_TO_TRANSACTION_TYPE);
        assert!(is_forbidden_in_transaction(&forbidden));
        assert!(!is_transient(&forbidden));

        let substring = Error::statement("ForbiddenDueToTransactionType");
        assert!(!is_forbidden_in_transaction(&substring));

        let transient =
            Error::statement_with_code("deadlock", "Neo.TransientError.Transaction.DeadlockDetected");
        assert!(is_transient(&transient));
    }
}
