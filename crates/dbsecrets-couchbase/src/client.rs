//! Couchbase user-management seam and its REST implementation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use dbsecrets_plugin::prelude::*;

use crate::config::CouchbaseConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A local user as stored by the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalUser {
    /// Password; empty when read back from the cluster
    pub password: String,
    /// Roles in `role[bucket:scope:collection]` form
    pub roles: Vec<String>,
    /// Group names
    pub groups: Vec<String>,
}

/// The management calls the plugin makes
#[async_trait]
pub trait UserManager: Send + Sync + 'static {
    /// Create or replace a local user
    async fn upsert_user(&self, name: &str, user: &LocalUser) -> Result<()>;

    /// Fetch a local user's directly assigned roles and groups
    async fn get_user(&self, name: &str) -> Result<Option<LocalUser>>;

    /// Remove a local user; a missing user is not an error
    async fn drop_user(&self, name: &str) -> Result<()>;

    /// Change the password of the authenticated admin
    async fn change_own_password(&self, password: &str) -> Result<()>;

    /// Whether a bucket exists and reports healthy nodes
    async fn bucket_ready(&self, bucket: &str) -> Result<bool>;

    /// Cluster liveness probe
    async fn ping(&self) -> Result<()>;
}

/// Opens [`UserManager`] clients for a configuration
#[async_trait]
pub trait ClusterConnector: Send + Sync + 'static {
    /// Build a client authenticated as the configured admin
    async fn connect(&self, config: &CouchbaseConfig) -> Result<Arc<dyn UserManager>>;
}

#[derive(Deserialize)]
struct RoleOrigin {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct UserRole {
    role: String,
    #[serde(default)]
    bucket_name: Option<String>,
    #[serde(default)]
    scope_name: Option<String>,
    #[serde(default)]
    collection_name: Option<String>,
    #[serde(default)]
    origins: Vec<RoleOrigin>,
}

#[derive(Deserialize)]
struct UserResponse {
    #[serde(default)]
    roles: Vec<UserRole>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Deserialize)]
struct BucketResponse {
    #[serde(default)]
    nodes: Vec<BucketNode>,
}

#[derive(Deserialize)]
struct BucketNode {
    #[serde(default)]
    status: String,
}

/// Format a role assignment the way the RBAC API expects it
pub fn role_param(
    role: &str,
    bucket: Option<&str>,
    scope: Option<&str>,
    collection: Option<&str>,
) -> String {
    let target: Vec<&str> = [bucket, scope, collection]
        .into_iter()
        .map_while(|part| part.filter(|p| !p.is_empty()))
        .collect();
    if target.is_empty() {
        role.to_string()
    } else {
        format!("{role}[{}]", target.join(":"))
    }
}

impl UserResponse {
    fn into_user(self) -> LocalUser {
        let roles = self
            .roles
            .into_iter()
            // Roles inherited through a group are managed by the group
            .filter(|r| r.origins.is_empty() || r.origins.iter().any(|o| o.kind == "user"))
            .map(|r| {
                role_param(
                    &r.role,
                    r.bucket_name.as_deref(),
                    r.scope_name.as_deref(),
                    r.collection_name.as_deref(),
                )
            })
            .collect();
        LocalUser {
            password: String::new(),
            roles,
            groups: self.groups,
        }
    }
}

/// [`UserManager`] over the cluster management REST API
pub struct RestUserManager {
    http: reqwest::Client,
    base: String,
    username: String,
    password: SensitiveString,
}

impl RestUserManager {
    /// Build a client from configuration
    pub fn from_config(config: &CouchbaseConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(tls) = &config.tls_material {
            builder = builder.use_preconfigured_tls(tls.client_config()?);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: config.management_url(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn user_path(name: &str) -> String {
        format!(
            "/settings/rbac/users/local/{}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .basic_auth(&self.username, Some(self.password.expose_secret()))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::reachability_with_source(format!("{what} failed"), e))?;
        debug!(what, status = response.status().as_u16(), "management API call");
        Ok(response)
    }

    async fn failure(response: reqwest::Response, what: &str) -> Error {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Error::statement_with_code(
            format!("{what} returned {status}: {text}"),
            status.as_u16().to_string(),
        )
    }
}

#[async_trait]
impl UserManager for RestUserManager {
    async fn upsert_user(&self, name: &str, user: &LocalUser) -> Result<()> {
        let mut form = vec![("roles", user.roles.join(","))];
        if !user.password.is_empty() {
            form.push(("password", user.password.clone()));
        }
        if !user.groups.is_empty() {
            form.push(("groups", user.groups.join(",")));
        }
        let request = self.request(Method::PUT, &Self::user_path(name)).form(&form);
        let response = self.send(request, "upsert user").await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::failure(response, "upsert user").await)
    }

    async fn get_user(&self, name: &str) -> Result<Option<LocalUser>> {
        let request = self.request(Method::GET, &Self::user_path(name));
        let response = self.send(request, "get user").await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: UserResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::statement(format!("invalid user response: {e}")))?;
                Ok(Some(body.into_user()))
            }
            _ => Err(Self::failure(response, "get user").await),
        }
    }

    async fn drop_user(&self, name: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &Self::user_path(name));
        let response = self.send(request, "drop user").await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::failure(response, "drop user").await)
    }

    async fn change_own_password(&self, password: &str) -> Result<()> {
        let request = self
            .request(Method::POST, "/controller/changePassword")
            .form(&[("password", password)]);
        let response = self.send(request, "change password").await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::failure(response, "change password").await)
    }

    async fn bucket_ready(&self, bucket: &str) -> Result<bool> {
        let path = format!(
            "/pools/default/buckets/{}",
            utf8_percent_encode(bucket, NON_ALPHANUMERIC)
        );
        let response = self.send(self.request(Method::GET, &path), "get bucket").await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: BucketResponse = response
            .json()
            .await
            .map_err(|e| Error::statement(format!("invalid bucket response: {e}")))?;
        Ok(!body.nodes.is_empty() && body.nodes.iter().all(|n| n.status == "healthy"))
    }

    async fn ping(&self) -> Result<()> {
        let response = self.send(self.request(Method::GET, "/pools"), "ping").await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Error::reachability(format!(
            "cluster answered {}",
            response.status()
        )))
    }
}

/// Connector building [`RestUserManager`] clients
#[derive(Debug, Default, Clone, Copy)]
pub struct RestConnector;

#[async_trait]
impl ClusterConnector for RestConnector {
    async fn connect(&self, config: &CouchbaseConfig) -> Result<Arc<dyn UserManager>> {
        Ok(Arc::new(RestUserManager::from_config(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_param() {
        assert_eq!(role_param("ro_admin", None, None, None), "ro_admin");
        assert_eq!(
            role_param("bucket_admin", Some("travel"), None, None),
            "bucket_admin[travel]"
        );
        assert_eq!(
            role_param("data_reader", Some("travel"), Some("inventory"), Some("hotel")),
            "data_reader[travel:inventory:hotel]"
        );
        assert_eq!(role_param("data_reader", None, Some("x"), None), "data_reader");
    }

    #[test]
    fn test_group_roles_are_not_copied() {
        let body: UserResponse = serde_json::from_value(serde_json::json!({
            "id": "v-app",
            "roles": [
                {"role": "ro_admin", "origins": [{"type": "user"}]},
                {"role": "bucket_admin", "bucket_name": "travel", "origins": [{"type": "group", "name": "ops"}]},
                {"role": "data_reader", "bucket_name": "travel"}
            ],
            "groups": ["ops"]
        }))
        .unwrap();
        let user = body.into_user();
        assert_eq!(user.roles, vec!["ro_admin", "data_reader[travel]"]);
        assert_eq!(user.groups, vec!["ops"]);
    }
}
