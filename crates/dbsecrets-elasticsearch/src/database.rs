//! Elasticsearch credential lifecycle
//!
//! A creation statement is a JSON object naming either an inline role
//! definition or a list of existing roles:
//!
//! ```json
//! {"elasticsearch_role_definition": {"indices": [{"names": ["*"], "privileges": ["read"]}]}}
//! {"elasticsearch_roles": ["viewer", "monitoring_user"]}
//! ```
//!
//! An inline definition becomes a role named after the generated user; it
//! is removed again on DeleteUser.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use dbsecrets_plugin::lifecycle::{check_new_user, require_password};
use dbsecrets_plugin::prelude::*;

use crate::client::{HttpConnector, SecurityApi, SecurityConnector, UserBody};
use crate::config::ElasticsearchConfig;

/// Parsed creation statement
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreationStatement {
    /// Inline role created for the user
    #[serde(default)]
    pub elasticsearch_role_definition: Option<serde_json::Map<String, serde_json::Value>>,
    /// Existing roles granted to the user
    #[serde(default)]
    pub elasticsearch_roles: Vec<String>,
}

impl CreationStatement {
    /// Parse the first statement of a creation request
    pub fn parse(statements: &Statements) -> Result<Self> {
        let command = statements
            .commands
            .iter()
            .find(|c| !c.trim().is_empty())
            .ok_or(Error::EmptyCreationStatements)?;
        let statement: Self = serde_json::from_str(command)
            .map_err(|e| Error::invalid_request(format!("invalid creation statement: {e}")))?;

        let has_definition = statement
            .elasticsearch_role_definition
            .as_ref()
            .is_some_and(|d| !d.is_empty());
        match (has_definition, statement.elasticsearch_roles.is_empty()) {
            (true, false) => Err(Error::invalid_request(
                "elasticsearch_role_definition and elasticsearch_roles are mutually exclusive",
            )),
            (false, true) => Err(Error::invalid_request(
                "either elasticsearch_role_definition or elasticsearch_roles must be set",
            )),
            _ => Ok(statement),
        }
    }
}

/// [`ClientFactory`] for security API clients
pub struct SecurityClientFactory {
    connector: Box<dyn SecurityConnector>,
}

#[async_trait]
impl ClientFactory for SecurityClientFactory {
    type Config = ElasticsearchConfig;
    type Client = Arc<dyn SecurityApi>;

    fn parse_config(&self, raw: &ConfigMap) -> Result<ElasticsearchConfig> {
        ElasticsearchConfig::from_map(raw)
    }

    async fn open(&self, config: &ElasticsearchConfig) -> Result<Arc<dyn SecurityApi>> {
        self.connector.connect(config).await
    }

    async fn ping(&self, client: &Arc<dyn SecurityApi>) -> Result<()> {
        client.authenticate().await
    }

    async fn close(&self, _client: Arc<dyn SecurityApi>) {}
}

/// The `elasticsearch` plugin
pub struct Elasticsearch {
    producer: ConnectionProducer<SecurityClientFactory>,
}

impl Default for Elasticsearch {
    fn default() -> Self {
        Self::new()
    }
}

impl Elasticsearch {
    /// Create a plugin talking HTTP
    pub fn new() -> Self {
        Self::with_connector(HttpConnector)
    }

    /// Create a plugin with a custom connector
    pub fn with_connector(connector: impl SecurityConnector) -> Self {
        Self {
            producer: ConnectionProducer::new(SecurityClientFactory {
                connector: Box::new(connector),
            }),
        }
    }
}

#[async_trait]
impl Database for Elasticsearch {
    fn plugin_type(&self) -> &'static str {
        "elasticsearch"
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

        let mut created_role = false;
        let roles = match statement.elasticsearch_role_definition {
            Some(definition) if !definition.is_empty() => {
                client
                    .put_role(&username, &serde_json::Value::Object(definition))
                    .await?;
                created_role = true;
                vec![username.clone()]
            }
            _ => statement.elasticsearch_roles,
        };

        let user = UserBody {
            password: request.password.expose_secret().to_string(),
            roles,
        };
        if let Err(e) = client.put_user(&username, &user).await {
            if created_role {
                warn!(error = %e, "user creation failed, removing its role");
                if let Err(rollback) = client.delete_role(&username).await {
                    return Err(Error::rollback(e, rollback));
                }
            }
            return Err(e);
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
            return Err(Error::unsupported(
                "public key rotation is not supported by elasticsearch",
            ));
        }
        let Some(change) = &request.password else {
            return Ok(());
        };

        let mut guard = self.producer.lock().await;
        let client = guard.connection().await?;
        client
            .change_password(&request.username, change.new_password.expose_secret())
            .await?;
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

        // A role named after the user exists only for inline definitions
        client.delete_role(&request.username).await?;
        client.delete_user(&request.username).await
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
    fn test_parse_role_definition() {
        let statement = CreationStatement::parse(&Statements::new([
            r#"{"elasticsearch_role_definition": {"indices": [{"names": ["*"], "privileges": ["read"]}]}}"#,
        ]))
        .unwrap();
        assert!(statement.elasticsearch_role_definition.is_some());
        assert!(statement.elasticsearch_roles.is_empty());
    }

    #[test]
    fn test_parse_roles() {
        let statement =
            CreationStatement::parse(&Statements::new([r#"{"elasticsearch_roles": ["viewer"]}"#]))
                .unwrap();
        assert_eq!(statement.elasticsearch_roles, vec!["viewer"]);
    }

    #[test]
    fn test_parse_rejects_both_or_neither() {
        let both = CreationStatement::parse(&Statements::new([
            r#"{"elasticsearch_role_definition": {"cluster": ["all"]}, "elasticsearch_roles": ["viewer"]}"#,
        ]))
        .unwrap_err();
        assert_eq!(both.category(), ErrorCategory::InvalidRequest);

        let neither = CreationStatement::parse(&Statements::new(["{}"])).unwrap_err();
        assert_eq!(neither.category(), ErrorCategory::InvalidRequest);
    }
}
