//! Neo4j plugin configuration

use std::time::Duration;

use dbsecrets_plugin::config::{ConfigReader, ConnectionConfig};
use dbsecrets_plugin::prelude::*;

/// Default username template
pub const DEFAULT_USERNAME_TEMPLATE: &str = r#"{{ printf "v-%s-%s-%s-%s" (.DisplayName | truncate 8) (.RoleName | truncate 8) (random 4) (unix_time) | truncate 63 }}"#;

const DEFAULT_MAX_POOL_SIZE: usize = 100;
const DEFAULT_MAX_TRANSACTION_RETRY_TIME: Duration = Duration::from_secs(30);
const DEFAULT_CONNECTION_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed configuration of a Neo4j plugin instance
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    /// Bolt URL and admin credentials
    pub connection: ConnectionConfig,
    /// Compiled username template
    pub username_template: UsernameTemplate,
    /// Bolt connection pool size
    pub max_connection_pool_size: usize,
    /// How long transient transaction failures are retried
    pub max_transaction_retry_time: Duration,
    /// Deadline for obtaining a session
    pub connection_acquisition_timeout: Duration,
    /// Deadline for opening the driver
    pub socket_connect_timeout: Duration,
    /// Target database; the server default when unset
    pub database_name: Option<String>,
}

impl Neo4jConfig {
    /// Parse and validate a raw configuration map
    pub fn from_map(raw: &ConfigMap) -> Result<Self> {
        let connection = ConnectionConfig::from_map(raw)?;
        let reader = ConfigReader::new(raw);

        let username_template = UsernameTemplate::for_config(
            connection.username_template.as_deref(),
            DEFAULT_USERNAME_TEMPLATE,
        )?;

        let max_connection_pool_size = match reader.u32("max_connection_pool_size")? {
            None | Some(0) => DEFAULT_MAX_POOL_SIZE,
            Some(n) => n as usize,
        };

        Ok(Self {
            connection,
            username_template,
            max_connection_pool_size,
            max_transaction_retry_time: reader
                .duration("max_transaction_retry_time")?
                .unwrap_or(DEFAULT_MAX_TRANSACTION_RETRY_TIME),
            connection_acquisition_timeout: reader
                .duration("connection_acquisition_timeout")?
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_CONNECTION_ACQUISITION_TIMEOUT),
            socket_connect_timeout: reader
                .duration("socket_connect_timeout")?
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_SOCKET_CONNECT_TIMEOUT),
            database_name: reader.non_empty_string("database_name")?,
        })
    }

    /// Bolt URL with credentials substituted
    pub fn uri(&self) -> String {
        self.connection.render_url("neo4j")
    }
}

impl ProducerConfig for Neo4jConfig {
    fn root_username(&self) -> &str {
        &self.connection.username
    }

    fn root_password(&self) -> &str {
        self.connection.password.expose_secret()
    }

    fn set_root_password(&mut self, password: &SensitiveString) {
        self.connection.password = password.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Neo4jConfig::from_map(&raw(json!({
            "connection_url": "bolt://localhost:7687",
            "username": "neo4j",
            "password": "secret",
        })))
        .unwrap();

        assert_eq!(config.max_connection_pool_size, 100);
        assert_eq!(config.max_transaction_retry_time, Duration::from_secs(30));
        assert_eq!(config.connection_acquisition_timeout, Duration::from_secs(60));
        assert_eq!(config.socket_connect_timeout, Duration::from_secs(5));
        assert!(config.database_name.is_none());
        assert!(config.username_template.source().contains("random 4"));
        assert_eq!(config.uri(), "bolt://localhost:7687");
    }

    #[test]
    fn test_driver_options() {
        let config = Neo4jConfig::from_map(&raw(json!({
            "connection_url": "neo4j+s://graph.example.com",
            "username": "neo4j",
            "password": "secret",
            "max_connection_pool_size": "8",
            "max_transaction_retry_time": "5s",
            "connection_acquisition_timeout": 10,
            "socket_connect_timeout": "2s",
            "database_name": "people",
        })))
        .unwrap();

        assert_eq!(config.max_connection_pool_size, 8);
        assert_eq!(config.max_transaction_retry_time, Duration::from_secs(5));
        assert_eq!(config.connection_acquisition_timeout, Duration::from_secs(10));
        assert_eq!(config.socket_connect_timeout, Duration::from_secs(2));
        assert_eq!(config.database_name.as_deref(), Some("people"));
    }

    #[test]
    fn test_missing_url() {
        let err = Neo4jConfig::from_map(&raw(json!({"username": "neo4j"}))).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
