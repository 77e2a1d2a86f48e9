//! MongoDB Atlas credential lifecycle

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use dbsecrets_plugin::lifecycle::{check_new_user, require_password};
use dbsecrets_plugin::prelude::*;

use crate::client::{
    AtlasConnector, DatabaseUser, DatabaseUsersApi, HttpAtlasConnector, Role, Scope,
};
use crate::config::AtlasConfig;

/// Authentication database used when a statement names none
pub const DEFAULT_DATABASE: &str = "admin";

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

/// Parsed creation statement
#[derive(Debug, Clone, Deserialize)]
pub struct CreationStatement {
    /// Authentication database
    #[serde(default = "default_database")]
    pub database_name: String,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Cluster or data lake scopes
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

/// Parsed revocation statement
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationStatement {
    /// Authentication database
    #[serde(default = "default_database")]
    pub database_name: String,
}

impl Default for RevocationStatement {
    fn default() -> Self {
        Self {
            database_name: default_database(),
        }
    }
}

fn first_statement(statements: &Statements) -> Option<&str> {
    statements
        .commands
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
}

impl CreationStatement {
    /// Parse the first non-empty statement
    pub fn parse(statements: &Statements) -> Result<Self> {
        let command = first_statement(statements).ok_or(Error::EmptyCreationStatements)?;
        serde_json::from_str(command)
            .map_err(|e| Error::invalid_request(format!("invalid creation statement: {e}")))
    }
}

impl RevocationStatement {
    /// Parse the first non-empty statement, defaulting to [`DEFAULT_DATABASE`]
    pub fn parse(statements: &Statements) -> Result<Self> {
        match first_statement(statements) {
            None => Ok(Self::default()),
            Some(command) => serde_json::from_str(command)
                .map_err(|e| Error::invalid_request(format!("invalid revocation statement: {e}"))),
        }
    }
}

/// [`ClientFactory`] for Atlas API clients
pub struct AtlasClientFactory {
    connector: Box<dyn AtlasConnector>,
}

#[async_trait]
impl ClientFactory for AtlasClientFactory {
    type Config = AtlasConfig;
    type Client = Arc<dyn DatabaseUsersApi>;

    fn parse_config(&self, raw: &ConfigMap) -> Result<AtlasConfig> {
        AtlasConfig::from_map(raw)
    }

    async fn open(&self, config: &AtlasConfig) -> Result<Arc<dyn DatabaseUsersApi>> {
        self.connector.connect(config).await
    }

    async fn ping(&self, client: &Arc<dyn DatabaseUsersApi>) -> Result<()> {
        client.ping().await
    }

    async fn close(&self, _client: Arc<dyn DatabaseUsersApi>) {}
}

/// The `mongodbatlas` plugin
pub struct MongoDbAtlas {
    producer: ConnectionProducer<AtlasClientFactory>,
}

impl Default for MongoDbAtlas {
    fn default() -> Self {
        Self::new()
    }
}

impl MongoDbAtlas {
    /// Create a plugin talking to the Atlas Administration API
    pub fn new() -> Self {
        Self::with_connector(HttpAtlasConnector)
    }

    /// Create a plugin with a custom connector
    pub fn with_connector(connector: impl AtlasConnector) -> Self {
        Self {
            producer: ConnectionProducer::new(AtlasClientFactory {
                connector: Box::new(connector),
            }),
        }
    }
}

#[async_trait]
impl Database for MongoDbAtlas {
    fn plugin_type(&self) -> &'static str {
        "mongodbatlas"
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
        let statement = CreationStatement::parse(&request.statements)?;

        let mut guard = self.producer.lock().await;
        let config = guard.config()?;
        let username = config.username_template.render(&request.username_config)?;
        let project_id = config.project_id.clone();
        let client = guard.connection().await?;

        client
            .create(&DatabaseUser {
                database_name: statement.database_name,
                group_id: project_id,
                username: username.clone(),
                password: request.password.expose_secret().to_string(),
                roles: statement.roles,
                scopes: statement.scopes,
            })
            .await?;

        debug!(username = %username, "database user created");
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
            return Err(Error::unsupported(
                "public key rotation is not supported by mongodbatlas",
            ));
        }
        // Expiration is managed by the host
        let Some(change) = &request.password else {
            return Ok(());
        };

        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;
        client
            .update_password(
                DEFAULT_DATABASE,
                &request.username,
                change.new_password.expose_secret(),
            )
            .await
    }

    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()> {
        if request.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }
        let statement = RevocationStatement::parse(&request.statements)?;

        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;
        client
            .delete(&statement.database_name, &request.username)
            .await
    }

    async fn close(&self) -> Result<()> {
        self.producer.close().await
    }

    fn secret_values(&self) -> SecretValues {
        self.producer.secret_values()
    }
}
