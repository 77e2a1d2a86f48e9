//! Atlas database-user API seam and the digest-authenticated HTTP client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use dbsecrets_plugin::prelude::*;

use crate::config::AtlasConfig;
use crate::digest::{cnonce, DigestChallenge};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Role granted to a database user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Database the role applies to
    pub database_name: String,
    /// Role name, e.g. `readWrite`
    pub role_name: String,
    /// Collection the role is limited to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
}

/// Cluster or data lake the user is limited to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Resource name
    pub name: String,
    /// `CLUSTER` or `DATA_LAKE`
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of a create-user call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUser {
    /// Authentication database
    pub database_name: String,
    /// Project ID
    pub group_id: String,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Granted roles
    pub roles: Vec<Role>,
    /// Resource scopes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<Scope>,
}

/// The Atlas calls the plugin makes
#[async_trait]
pub trait DatabaseUsersApi: Send + Sync + 'static {
    /// `POST /groups/{project}/databaseUsers`
    async fn create(&self, user: &DatabaseUser) -> Result<()>;

    /// `PATCH /groups/{project}/databaseUsers/{database}/{username}` with a new password
    async fn update_password(&self, database: &str, username: &str, password: &str) -> Result<()>;

    /// `DELETE /groups/{project}/databaseUsers/{database}/{username}`
    async fn delete(&self, database: &str, username: &str) -> Result<()>;

    /// `GET /groups/{project}`
    async fn ping(&self) -> Result<()>;
}

/// Opens [`DatabaseUsersApi`] clients for a configuration
#[async_trait]
pub trait AtlasConnector: Send + Sync + 'static {
    /// Build a client authenticated with the configured API key
    async fn connect(&self, config: &AtlasConfig) -> Result<Arc<dyn DatabaseUsersApi>>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// [`DatabaseUsersApi`] over HTTP with digest authentication
pub struct HttpDatabaseUsers {
    http: reqwest::Client,
    api_url: String,
    project_id: String,
    public_key: String,
    private_key: SensitiveString,
    challenge: Mutex<Option<(DigestChallenge, u32)>>,
}

impl HttpDatabaseUsers {
    /// Build a client from configuration
    pub fn from_config(config: &AtlasConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            project_id: config.project_id.clone(),
            public_key: config.public_key.clone(),
            private_key: config.private_key.clone(),
            challenge: Mutex::new(None),
        })
    }

    fn path(&self, suffix: &str) -> String {
        format!(
            "/api/atlas/v1.0/groups/{}{suffix}",
            utf8_percent_encode(&self.project_id, NON_ALPHANUMERIC)
        )
    }

    fn user_path(&self, database: &str, username: &str) -> String {
        self.path(&format!(
            "/databaseUsers/{}/{}",
            utf8_percent_encode(database, NON_ALPHANUMERIC),
            utf8_percent_encode(username, NON_ALPHANUMERIC)
        ))
    }

    fn authorization(&self, method: &Method, path: &str) -> Option<String> {
        let mut cached = self.challenge.lock();
        let (challenge, count) = cached.as_mut()?;
        *count += 1;
        Some(challenge.authorization(
            &self.public_key,
            self.private_key.expose_secret(),
            method.as_str(),
            path,
            *count,
            &cnonce(),
        ))
    }

    async fn attempt(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{path}", self.api_url))
            .header(ACCEPT, "application/json");
        if let Some(auth) = self.authorization(method, path) {
            request = request.header(AUTHORIZATION, auth);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| Error::reachability_with_source(format!("{method} {path} failed"), e))
    }

    /// Send a request, answering a digest challenge once
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let response = self.attempt(&method, path, body).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::reachability("Atlas rejected the API key"))?;
        let challenge = DigestChallenge::parse(header)?;
        debug!(realm = %challenge.realm, "answering digest challenge");
        *self.challenge.lock() = Some((challenge, 0));

        let response = self.attempt(&method, path, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::reachability("Atlas rejected the API key"));
        }
        Ok(response)
    }

    async fn expect_success(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<StatusCode> {
        let what = format!("{method} {path}");
        let response = self.send(method, path, body).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(status);
        }
        let text = response.text().await.unwrap_or_default();
        let error: Option<ApiError> = serde_json::from_str(&text).ok();
        let code = error
            .as_ref()
            .and_then(|e| e.error_code.clone())
            .unwrap_or_else(|| status.as_u16().to_string());
        let detail = error.and_then(|e| e.detail).unwrap_or(text);
        Err(Error::statement_with_code(
            format!("{what} returned {status}: {detail}"),
            code,
        ))
    }
}

#[async_trait]
impl DatabaseUsersApi for HttpDatabaseUsers {
    async fn create(&self, user: &DatabaseUser) -> Result<()> {
        let body = serde_json::to_value(user)
            .map_err(|e| Error::internal(format!("failed to encode database user: {e}")))?;
        self.expect_success(Method::POST, &self.path("/databaseUsers"), Some(&body))
            .await
            .map(|_| ())
    }

    async fn update_password(&self, database: &str, username: &str, password: &str) -> Result<()> {
        let body = serde_json::json!({ "password": password });
        match self
            .expect_success(Method::PATCH, &self.user_path(database, username), Some(&body))
            .await
        {
            Err(e) if e.code() == Some("USER_NOT_FOUND") || e.code() == Some("404") => {
                Err(Error::user_not_found(username))
            }
            other => other.map(|_| ()),
        }
    }

    async fn delete(&self, database: &str, username: &str) -> Result<()> {
        match self
            .expect_success(Method::DELETE, &self.user_path(database, username), None)
            .await
        {
            Err(e) if e.code() == Some("USER_NOT_FOUND") || e.code() == Some("404") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.expect_success(Method::GET, &self.path(""), None)
            .await
            .map(|_| ())
            .map_err(|e| Error::reachability(e.to_string()))
    }
}

/// Connector building [`HttpDatabaseUsers`] clients
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpAtlasConnector;

#[async_trait]
impl AtlasConnector for HttpAtlasConnector {
    async fn connect(&self, config: &AtlasConfig) -> Result<Arc<dyn DatabaseUsersApi>> {
        Ok(Arc::new(HttpDatabaseUsers::from_config(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_body() {
        let user = DatabaseUser {
            database_name: "admin".into(),
            group_id: "5f1a".into(),
            username: "v-app".into(),
            password: "pw".into(),
            roles: vec![Role {
                database_name: "sales".into(),
                role_name: "read".into(),
                collection_name: None,
            }],
            scopes: vec![],
        };
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({
                "databaseName": "admin",
                "groupId": "5f1a",
                "username": "v-app",
                "password": "pw",
                "roles": [{"databaseName": "sales", "roleName": "read"}],
            })
        );
    }

    #[test]
    fn test_paths() {
        let config = AtlasConfig::from_map(
            json!({
                "public_key": "abc",
                "private_key": "def",
                "project_id": "5f1a",
            })
            .as_object()
            .unwrap(),
        )
        .unwrap();
        let api = HttpDatabaseUsers::from_config(&config).unwrap();
        assert_eq!(
            api.user_path("admin", "v-app"),
            "/api/atlas/v1.0/groups/5f1a/databaseUsers/admin/v%2Dapp"
        );
        assert!(api.authorization(&Method::GET, "/").is_none());
    }
}
