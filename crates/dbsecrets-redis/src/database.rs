//! Redis ACL lifecycle
//!
//! Creation statements are JSON arrays of ACL rules such as
//! `["~*", "+@read"]`. Users are created enabled with the generated
//! password; expiration is not enforced by Redis and is ignored.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use dbsecrets_plugin::lifecycle::{check_new_user, require_password};
use dbsecrets_plugin::prelude::*;

use crate::client::{AclClient, NativeRedisConnector, RedisConnector};
use crate::config::RedisConfig;

/// Parse every statement as a JSON array of ACL rules
pub fn parse_acl_rules(statements: &Statements) -> Result<Vec<String>> {
    let mut rules = Vec::new();
    for command in statements.commands.iter().filter(|c| !c.trim().is_empty()) {
        let parsed: Vec<String> = serde_json::from_str(command).map_err(|e| {
            Error::invalid_request(format!(
                "creation statement must be a JSON array of ACL rules: {e}"
            ))
        })?;
        rules.extend(parsed);
    }
    Ok(rules)
}

/// [`ClientFactory`] for Redis ACL clients
pub struct RedisClientFactory {
    connector: Box<dyn RedisConnector>,
}

#[async_trait]
impl ClientFactory for RedisClientFactory {
    type Config = RedisConfig;
    type Client = Arc<dyn AclClient>;

    fn parse_config(&self, raw: &ConfigMap) -> Result<RedisConfig> {
        RedisConfig::from_map(raw)
    }

    async fn open(&self, config: &RedisConfig) -> Result<Arc<dyn AclClient>> {
        self.connector.connect(config).await
    }

    async fn ping(&self, client: &Arc<dyn AclClient>) -> Result<()> {
        client.ping().await
    }

    async fn close(&self, _client: Arc<dyn AclClient>) {}
}

/// The `redis` plugin
pub struct Redis {
    producer: ConnectionProducer<RedisClientFactory>,
}

impl Default for Redis {
    fn default() -> Self {
        Self::new()
    }
}

impl Redis {
    /// Create a plugin using redis-rs
    pub fn new() -> Self {
        Self::with_connector(NativeRedisConnector)
    }

    /// Create a plugin with a custom connector
    pub fn with_connector(connector: impl RedisConnector) -> Self {
        Self {
            producer: ConnectionProducer::new(RedisClientFactory {
                connector: Box::new(connector),
            }),
        }
    }
}

#[async_trait]
impl Database for Redis {
    fn plugin_type(&self) -> &'static str {
        "redis"
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
        let acl = parse_acl_rules(&request.statements)?;

        let mut guard = self.producer.lock().await;
        let username = guard
            .config()?
            .username_template
            .render(&request.username_config)?;
        let client = guard.connection().await?;

        let mut rules = vec![
            "ON".to_string(),
            format!(">{}", request.password.expose_secret()),
        ];
        rules.extend(acl);
        client.set_user(&username, &rules).await?;

        debug!(username = %username, "ACL user created");
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
            return Err(Error::unsupported("public key rotation is not supported by redis"));
        }
        let Some(change) = &request.password else {
            // Expiration is not enforced by Redis
            return Ok(());
        };

        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;
        if !client.user_exists(&request.username).await? {
            return Err(Error::user_not_found(&request.username));
        }

        let rules = vec![
            "resetpass".to_string(),
            format!(">{}", change.new_password.expose_secret()),
        ];
        client.set_user(&request.username, &rules).await?;
        drop(client);

        if guard.is_root_user(&request.username) {
            guard.rotate_root_password(&change.new_password).await?;
        }
        Ok(())
    }

    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()> {
        if request.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }
        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;
        client.del_user(&request.username).await
    }

    async fn close(&self) -> Result<()> {
        self.producer.close().await
    }

    fn secret_values(&self) -> SecretValues {
        self.producer.secret_values()
    }
}
