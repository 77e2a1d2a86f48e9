//! ACL client seam and its redis-rs implementation

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use dbsecrets_plugin::prelude::*;

use crate::config::RedisConfig;

/// The ACL commands the plugin issues
#[async_trait]
pub trait AclClient: Send + Sync + 'static {
    /// `ACL SETUSER <username> <rules...>`
    async fn set_user(&self, username: &str, rules: &[String]) -> Result<()>;

    /// `ACL DELUSER <username>`
    async fn del_user(&self, username: &str) -> Result<()>;

    /// Whether `ACL GETUSER <username>` finds the user
    async fn user_exists(&self, username: &str) -> Result<bool>;

    /// `PING`
    async fn ping(&self) -> Result<()>;
}

/// Opens [`AclClient`]s for a configuration
#[async_trait]
pub trait RedisConnector: Send + Sync + 'static {
    /// Connect and authenticate as the configured admin user
    async fn connect(&self, config: &RedisConfig) -> Result<Arc<dyn AclClient>>;
}

fn redis_error(e: redis::RedisError) -> Error {
    let code = e.code().map(str::to_string);
    Error::statement_with_source(code, e)
}

/// [`AclClient`] over a multiplexed async connection
#[derive(Clone)]
pub struct RedisAclClient {
    conn: MultiplexedConnection,
}

#[async_trait]
impl AclClient for RedisAclClient {
    async fn set_user(&self, username: &str, rules: &[String]) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ACL")
            .arg("SETUSER")
            .arg(username)
            .arg(rules)
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn del_user(&self, username: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ACL")
            .arg("DELUSER")
            .arg(username)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        debug!(removed, "ACL DELUSER");
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let user: redis::Value = redis::cmd("ACL")
            .arg("GETUSER")
            .arg(username)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(!matches!(user, redis::Value::Nil))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| Error::reachability_with_source("PING failed", e))
    }
}

/// Connector using redis-rs
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRedisConnector;

impl NativeRedisConnector {
    fn connection_info(config: &RedisConfig) -> redis::ConnectionInfo {
        let addr = if config.tls {
            redis::ConnectionAddr::TcpTls {
                host: config.host.clone(),
                port: config.port,
                insecure: config.insecure_tls,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(config.host.clone(), config.port)
        };
        redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                username: Some(config.username.clone()),
                password: Some(config.password.expose_secret().to_string()),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl RedisConnector for NativeRedisConnector {
    async fn connect(&self, config: &RedisConfig) -> Result<Arc<dyn AclClient>> {
        let info = Self::connection_info(config);
        let client = match (&config.ca_cert, config.tls) {
            (Some(ca), true) => redis::Client::build_with_tls(
                info,
                redis::TlsCertificates {
                    client_tls: None,
                    root_cert: Some(ca.as_bytes().to_vec()),
                },
            ),
            _ => redis::Client::open(info),
        }
        .map_err(|e| Error::config(format!("invalid Redis connection settings: {e}")))?;

        debug!(host = %config.host, port = config.port, tls = config.tls, "connecting to Redis");
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::reachability_with_source("failed to connect to Redis", e))?;
        Ok(Arc::new(RedisAclClient { conn }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(tls: bool) -> RedisConfig {
        RedisConfig::from_map(
            json!({
                "host": "cache.local",
                "port": 6380,
                "username": "admin",
                "password": "secret",
                "tls": tls,
                "insecure_tls": true,
            })
            .as_object()
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_plain_connection_info() {
        let info = NativeRedisConnector::connection_info(&config(false));
        assert!(matches!(
            info.addr,
            redis::ConnectionAddr::Tcp(ref host, 6380) if host == "cache.local"
        ));
        assert_eq!(info.redis.username.as_deref(), Some("admin"));
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_tls_connection_info() {
        let info = NativeRedisConnector::connection_info(&config(true));
        assert!(matches!(
            info.addr,
            redis::ConnectionAddr::TcpTls { insecure: true, .. }
        ));
    }
}
