//! SQL credential lifecycle
//!
//! [`SqlDatabase`] implements the host operations for every SQL plugin on
//! top of a [`SqlDialect`]. Statements are templated with `{{name}}`,
//! `{{username}}`, `{{password}}`, `{{expiration}}` and `{{public_key}}`,
//! split on `;`, and executed inside one transaction. When the backend
//! answers with its "forbidden in transaction" code the whole list is
//! re-run statement by statement outside a transaction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use dbsecrets_plugin::config::{AuthType, ConfigReader, ConnectionConfig};
use dbsecrets_plugin::lifecycle::{check_new_user, credential_params, statements_or_default};
use dbsecrets_plugin::prelude::*;
use dbsecrets_plugin::template::UsernameTemplate;

use crate::connection::{Connection, ConnectionFactory, DatabaseType};
use crate::dialect::{Revocation, SnowflakeLocator, SqlDialect};
use crate::pool::{PoolConfig, SimpleConnectionPool};
use crate::revocation;
use crate::scram::PasswordAuthentication;

/// Parsed configuration of a SQL plugin instance
#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// Shared connection keys
    pub connection: ConnectionConfig,
    /// Compiled username template
    pub username_template: UsernameTemplate,
    /// PKCS#8 PEM key for key-pair authentication (Snowflake)
    pub private_key: Option<SensitiveString>,
    /// Parsed Snowflake URL
    pub snowflake: Option<SnowflakeLocator>,
    /// How generated passwords are templated into statements
    pub password_authentication: PasswordAuthentication,
    iam_driver: Option<String>,
}

impl SqlConfig {
    /// Parse and validate a raw configuration for `dialect`
    pub fn from_map<D: SqlDialect + ?Sized>(raw: &ConfigMap, dialect: &D) -> Result<Self> {
        let connection = ConnectionConfig::from_map(raw)?;
        let username_template = UsernameTemplate::for_config(
            connection.username_template.as_deref(),
            dialect.default_username_template(),
        )?;
        let reader = ConfigReader::new(raw);
        let private_key = reader.secret("private_key")?.filter(|key| !key.is_empty());

        let password_authentication = match reader.non_empty_string("password_authentication")? {
            Some(value) => PasswordAuthentication::parse(&value)?,
            None => PasswordAuthentication::default(),
        };
        if password_authentication != PasswordAuthentication::Password
            && !dialect.supports_password_hashing()
        {
            return Err(Error::config(format!(
                "password_authentication {password_authentication} is not supported by {}",
                dialect.plugin_type()
            )));
        }

        if connection.auth_type == AuthType::GcpIam && !dialect.supports_gcp_iam() {
            return Err(Error::config(format!(
                "auth_type gcp_iam is not supported by {}",
                dialect.plugin_type()
            )));
        }

        let snowflake = match dialect.database_type() {
            DatabaseType::Snowflake => {
                let locator = SnowflakeLocator::parse(
                    &connection.render_url(DatabaseType::Snowflake.driver()),
                )?;
                if private_key.is_none() {
                    return Err(Error::config(
                        "private_key is required for Snowflake key-pair authentication",
                    ));
                }
                Some(locator)
            }
            _ => None,
        };

        Ok(Self {
            connection,
            username_template,
            private_key,
            snowflake,
            password_authentication,
            iam_driver: None,
        })
    }

    /// Name of the registered IAM token source, if any
    pub fn iam_driver(&self) -> Option<&str> {
        self.iam_driver.as_deref()
    }
}

impl ProducerConfig for SqlConfig {
    fn root_username(&self) -> &str {
        &self.connection.username
    }

    fn root_password(&self) -> &str {
        self.connection.password.expose_secret()
    }

    fn set_root_password(&mut self, password: &SensitiveString) {
        self.connection.password = password.clone();
    }

    fn secret_values(&self) -> SecretValues {
        let mut secrets = SecretValues::new().with(self.root_password(), "[password]");
        if let Some(key) = &self.private_key {
            secrets.insert(key.expose_secret(), "[private_key]");
        }
        secrets
    }
}

/// Builds the session factory for a parsed configuration
pub trait Connector: Send + Sync + 'static {
    /// Session factory for `database_type`
    fn connection_factory(
        &self,
        database_type: DatabaseType,
        config: &SqlConfig,
    ) -> Result<Arc<dyn ConnectionFactory>>;
}

/// [`ClientFactory`] producing a connection pool per configuration
pub struct SqlClientFactory<D: SqlDialect> {
    dialect: Arc<D>,
    connector: Box<dyn Connector>,
}

#[async_trait]
impl<D: SqlDialect> ClientFactory for SqlClientFactory<D> {
    type Config = SqlConfig;
    type Client = Arc<SimpleConnectionPool>;

    fn parse_config(&self, raw: &ConfigMap) -> Result<SqlConfig> {
        SqlConfig::from_map(raw, &*self.dialect)
    }

    async fn register(&self, config: &mut SqlConfig) -> Result<()> {
        if config.connection.auth_type != AuthType::GcpIam {
            return Ok(());
        }
        #[cfg(feature = "gcp")]
        {
            let source = crate::gcp::IamTokenSource::from_config(
                config.connection.service_account_json.as_ref(),
            )?;
            config.iam_driver = Some(crate::gcp::register(source));
            Ok(())
        }
        #[cfg(not(feature = "gcp"))]
        {
            Err(Error::unsupported(
                "auth_type gcp_iam requires the gcp feature",
            ))
        }
    }

    async fn unregister(&self, config: &SqlConfig) {
        #[cfg(feature = "gcp")]
        if let Some(name) = config.iam_driver() {
            crate::gcp::unregister(name);
        }
        #[cfg(not(feature = "gcp"))]
        let _ = config;
    }

    async fn open(&self, config: &SqlConfig) -> Result<Arc<SimpleConnectionPool>> {
        let factory = self
            .connector
            .connection_factory(self.dialect.database_type(), config)?;
        debug!(
            url = %config.connection.redacted_url(self.dialect.database_type().driver()),
            "opening connection pool"
        );
        Ok(SimpleConnectionPool::new(
            PoolConfig::from_connection(&config.connection),
            factory,
        ))
    }

    async fn ping(&self, pool: &Arc<SimpleConnectionPool>) -> Result<()> {
        let conn = pool.get().await?;
        let valid = conn.is_valid().await;
        conn.release().await;
        if valid {
            Ok(())
        } else {
            Err(Error::reachability("liveness probe failed"))
        }
    }

    async fn close(&self, pool: Arc<SimpleConnectionPool>) {
        if let Err(e) = pool.close().await {
            warn!(error = %e, "error closing connection pool");
        }
    }
}

/// A SQL credential plugin
pub struct SqlDatabase<D: SqlDialect> {
    dialect: Arc<D>,
    producer: ConnectionProducer<SqlClientFactory<D>>,
}

impl<D: SqlDialect> SqlDatabase<D> {
    /// Create a plugin using the native drivers compiled into this crate
    pub fn new(dialect: D) -> Self {
        Self::with_connector(dialect, crate::native::NativeConnector)
    }

    /// Create a plugin with a custom session factory
    pub fn with_connector(dialect: D, connector: impl Connector) -> Self {
        let dialect = Arc::new(dialect);
        Self {
            producer: ConnectionProducer::new(SqlClientFactory {
                dialect: dialect.clone(),
                connector: Box::new(connector),
            }),
            dialect,
        }
    }

    /// The dialect of this plugin
    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    fn is_transaction_forbidden(&self, err: &Error) -> bool {
        match (self.dialect.transaction_forbidden_code(), err.code()) {
            (Some(expected), Some(code)) => expected == code,
            _ => false,
        }
    }

    fn render(&self, statements: &[String], params: &QueryParams) -> Vec<String> {
        statements
            .iter()
            .flat_map(|statement| self.dialect.split_statement(statement))
            .map(|part| query_template(part, params))
            .collect()
    }

    async fn run_in_transaction(
        &self,
        conn: &dyn Connection,
        statements: &[String],
        params: &QueryParams,
    ) -> Result<()> {
        let tx = conn.begin().await?;
        for sql in self.render(statements, params) {
            if let Err(e) = tx.execute(&sql, &[]).await {
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
        conn: &dyn Connection,
        statements: &[String],
        params: &QueryParams,
    ) -> Result<()> {
        for sql in self.render(statements, params) {
            conn.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    /// Run in one transaction, falling back to autocommit statements when
    /// the backend refuses one of them inside a transaction.
    async fn run_with_fallback(
        &self,
        conn: &dyn Connection,
        statements: &[String],
        params: &QueryParams,
    ) -> Result<()> {
        match self.run_in_transaction(conn, statements, params).await {
            Err(e) if self.is_transaction_forbidden(&e) => {
                info!("statement cannot run inside a transaction, retrying without one");
                self.run_each(conn, statements, params).await
            }
            other => other,
        }
    }

    async fn user_exists(&self, conn: &dyn Connection, username: &str) -> Result<bool> {
        revocation::user_exists(conn, self.dialect.user_exists_query(), username).await
    }

    async fn create_user(
        &self,
        conn: &dyn Connection,
        request: &NewUserRequest,
        params: &QueryParams,
    ) -> Result<()> {
        let statements = &request.statements.commands;
        match self.run_in_transaction(conn, statements, params).await {
            Err(e) if self.is_transaction_forbidden(&e) => {
                info!("creation statement cannot run inside a transaction, retrying without one");
                match self.run_each(conn, statements, params).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.undo_creation(conn, request, params, e).await),
                }
            }
            other => other,
        }
    }

    async fn undo_creation(
        &self,
        conn: &dyn Connection,
        request: &NewUserRequest,
        params: &QueryParams,
        original: Error,
    ) -> Error {
        if request.rollback_statements.is_empty() {
            return original;
        }
        warn!(error = %original, "user creation failed outside a transaction, running rollback statements");
        match self
            .run_each(conn, &request.rollback_statements.commands, params)
            .await
        {
            Ok(()) => original,
            Err(rollback) => Error::rollback(original, rollback),
        }
    }
}

#[async_trait]
impl<D: SqlDialect> Database for SqlDatabase<D> {
    fn plugin_type(&self) -> &'static str {
        self.dialect.plugin_type()
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
        if !self.dialect.supports_credential_type(request.credential_type) {
            return Err(Error::unsupported(format!(
                "credential type {} is not supported by {}",
                request.credential_type,
                self.dialect.plugin_type()
            )));
        }
        if request.credential_type == CredentialType::RsaPrivateKey && request.public_key.is_none()
        {
            return Err(Error::invalid_request("public_key is required"));
        }

        let mut guard = self.producer.lock().await;
        let username = guard.config()?.username_template.render(&request.username_config)?;
        let expiration = self.dialect.format_expiration(&request.expiration)?;
        let password = match request.credential_type {
            CredentialType::Password => guard
                .config()?
                .password_authentication
                .render(request.password.expose_secret())?,
            _ => request.password.expose_secret().to_string(),
        };

        let mut params = credential_params(&username, Some(&password), Some(&expiration));
        if let Some(public_key) = &request.public_key {
            params.insert("public_key", public_key.as_str());
        }

        let pool = guard.connection().await?;
        let conn = pool.get().await?;
        self.create_user(&*conn, &request, &params).await?;

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
        let username = request.username.as_str();

        let mut guard = self.producer.lock().await;
        let new_password = match &request.password {
            Some(change) => Some(
                guard
                    .config()?
                    .password_authentication
                    .render(change.new_password.expose_secret())?,
            ),
            None => None,
        };
        let pool = guard.connection().await?;
        let conn = pool.get().await?;

        if !self.user_exists(&*conn, username).await? {
            return Err(Error::user_not_found(username));
        }

        if let Some(change) = &request.password {
            let statements = statements_or_default(
                &change.statements,
                self.dialect.default_rotation_statements(),
            );
            if statements.is_empty() {
                return Err(Error::invalid_request("no rotation statements provided"));
            }
            let params = credential_params(username, new_password.as_deref(), None);
            self.run_with_fallback(&*conn, &statements, &params).await?;
        }

        if let Some(change) = &request.public_key {
            if !self
                .dialect
                .supports_credential_type(CredentialType::RsaPrivateKey)
            {
                return Err(Error::unsupported(format!(
                    "public key rotation is not supported by {}",
                    self.dialect.plugin_type()
                )));
            }
            let statements = statements_or_default(
                &change.statements,
                self.dialect.default_public_key_statements(),
            );
            let params = credential_params(username, None, None)
                .with("public_key", change.new_public_key.as_str());
            self.run_with_fallback(&*conn, &statements, &params).await?;
        }

        if let Some(change) = &request.expiration {
            let statements = statements_or_default(
                &change.statements,
                self.dialect.default_renewal_statements(),
            );
            if !statements.is_empty() {
                let expiration = self.dialect.format_expiration(&change.new_expiration)?;
                let params = credential_params(username, None, Some(&expiration));
                self.run_with_fallback(&*conn, &statements, &params).await?;
            }
        }

        drop(conn);
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
        let username = request.username.as_str();

        let mut guard = self.producer.lock().await;
        let pool = guard.connection().await?;
        let conn = pool.get().await?;

        if !request.statements.is_empty() {
            let params = credential_params(username, None, None);
            return self
                .run_with_fallback(&*conn, &request.statements.commands, &params)
                .await;
        }

        match self.dialect.revocation() {
            Revocation::Statements(defaults) => {
                let statements: Vec<String> = defaults.iter().map(|s| s.to_string()).collect();
                let params = credential_params(username, None, None);
                self.run_with_fallback(&*conn, &statements, &params).await
            }
            Revocation::PostgresSweep(termination) => {
                revocation::postgres_sweep(
                    &*conn,
                    self.dialect.user_exists_query(),
                    username,
                    termination,
                )
                .await
            }
            Revocation::SqlServerSweep => {
                revocation::sqlserver_sweep(&*conn, self.dialect.user_exists_query(), username)
                    .await
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.producer.close().await
    }

    fn secret_values(&self) -> SecretValues {
        self.producer.secret_values()
    }
}
