//! Couchbase credential lifecycle

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use dbsecrets_plugin::lifecycle::{check_new_user, require_password};
use dbsecrets_plugin::prelude::*;

use crate::client::{role_param, ClusterConnector, LocalUser, RestConnector, UserManager};
use crate::config::CouchbaseConfig;

/// Role granted when a creation statement names no roles or groups
pub const DEFAULT_ROLE: &str = "ro_admin";

const BUCKET_READY_TIMEOUT: Duration = Duration::from_secs(30);
const BUCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One role assignment of a creation statement
#[derive(Debug, Clone, Deserialize)]
pub struct RoleSpec {
    /// Role name
    pub role: String,
    /// Bucket the role is scoped to
    #[serde(default)]
    pub bucket_name: Option<String>,
    /// Scope inside the bucket
    #[serde(default)]
    pub scope_name: Option<String>,
    /// Collection inside the scope
    #[serde(default)]
    pub collection_name: Option<String>,
}

/// Parsed creation statement: `{"Roles": [...], "Groups": [...]}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreationStatement {
    /// Role assignments
    #[serde(rename = "Roles", default)]
    pub roles: Vec<RoleSpec>,
    /// Group memberships
    #[serde(rename = "Groups", default)]
    pub groups: Vec<String>,
}

impl CreationStatement {
    /// Parse the first non-empty statement
    pub fn parse(statements: &Statements) -> Result<Self> {
        let command = statements
            .commands
            .iter()
            .find(|c| !c.trim().is_empty())
            .ok_or(Error::EmptyCreationStatements)?;
        serde_json::from_str(command)
            .map_err(|e| Error::invalid_request(format!("invalid creation statement: {e}")))
    }

    /// Role parameters, falling back to [`DEFAULT_ROLE`]
    pub fn role_params(&self) -> Vec<String> {
        if self.roles.is_empty() && self.groups.is_empty() {
            return vec![DEFAULT_ROLE.to_string()];
        }
        self.roles
            .iter()
            .map(|r| {
                role_param(
                    &r.role,
                    r.bucket_name.as_deref(),
                    r.scope_name.as_deref(),
                    r.collection_name.as_deref(),
                )
            })
            .collect()
    }
}

/// [`ClientFactory`] for Couchbase management clients
pub struct CouchbaseClientFactory {
    connector: Box<dyn ClusterConnector>,
}

impl CouchbaseClientFactory {
    async fn wait_for_bucket(&self, client: &dyn UserManager, bucket: &str) -> Result<()> {
        let wait = async {
            loop {
                if client.bucket_ready(bucket).await? {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(BUCKET_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(BUCKET_READY_TIMEOUT, wait)
            .await
            .map_err(|_| Error::reachability(format!("bucket {bucket} did not become ready")))?
    }
}

#[async_trait]
impl ClientFactory for CouchbaseClientFactory {
    type Config = CouchbaseConfig;
    type Client = Arc<dyn UserManager>;

    fn parse_config(&self, raw: &ConfigMap) -> Result<CouchbaseConfig> {
        CouchbaseConfig::from_map(raw)
    }

    async fn open(&self, config: &CouchbaseConfig) -> Result<Arc<dyn UserManager>> {
        let client = self.connector.connect(config).await?;
        if let Some(bucket) = &config.bucket_name {
            self.wait_for_bucket(&*client, bucket).await?;
            debug!(bucket = %bucket, "bucket ready");
        }
        Ok(client)
    }

    async fn ping(&self, client: &Arc<dyn UserManager>) -> Result<()> {
        client.ping().await
    }

    async fn close(&self, _client: Arc<dyn UserManager>) {}
}

/// The `couchbase` plugin
pub struct Couchbase {
    producer: ConnectionProducer<CouchbaseClientFactory>,
}

impl Default for Couchbase {
    fn default() -> Self {
        Self::new()
    }
}

impl Couchbase {
    /// Create a plugin using the management REST API
    pub fn new() -> Self {
        Self::with_connector(RestConnector)
    }

    /// Create a plugin with a custom connector
    pub fn with_connector(connector: impl ClusterConnector) -> Self {
        Self {
            producer: ConnectionProducer::new(CouchbaseClientFactory {
                connector: Box::new(connector),
            }),
        }
    }
}

#[async_trait]
impl Database for Couchbase {
    fn plugin_type(&self) -> &'static str {
        "couchbase"
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
        let username = guard
            .config()?
            .username_template
            .render(&request.username_config)?;
        let client = guard.connection().await?;

        let user = LocalUser {
            password: request.password.expose_secret().to_string(),
            roles: statement.role_params(),
            groups: statement.groups,
        };
        client.upsert_user(&username, &user).await?;

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
            return Err(Error::unsupported("public key rotation is not supported by couchbase"));
        }
        let Some(change) = &request.password else {
            return Ok(());
        };
        let password = change.new_password.expose_secret();

        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;

        if guard.is_root_user(&request.username) {
            client.change_own_password(password).await?;
            drop(client);
            info!("rotating admin password");
            return guard.rotate_root_password(&change.new_password).await;
        }

        let mut user = client
            .get_user(&request.username)
            .await?
            .ok_or_else(|| Error::user_not_found(&request.username))?;
        user.password = password.to_string();
        client.upsert_user(&request.username, &user).await
    }

    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()> {
        if request.username.is_empty() {
            return Err(Error::invalid_request("missing username"));
        }
        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;
        client.drop_user(&request.username).await
    }

    async fn close(&self) -> Result<()> {
        self.producer.close().await
    }

    fn secret_values(&self) -> SecretValues {
        self.producer.secret_values()
    }
}
