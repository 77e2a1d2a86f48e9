//! Security API seam and the reqwest implementation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::debug;

use dbsecrets_plugin::prelude::*;

use crate::config::ElasticsearchConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters escaped in a user or role name path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Body of a user upsert
#[derive(Debug, Clone, Serialize)]
pub struct UserBody {
    /// Password
    pub password: String,
    /// Role names
    pub roles: Vec<String>,
}

/// The security endpoints the plugin calls
#[async_trait]
pub trait SecurityApi: Send + Sync + 'static {
    /// `PUT role/{name}`
    async fn put_role(&self, name: &str, definition: &serde_json::Value) -> Result<()>;

    /// `DELETE role/{name}`; a missing role is not an error
    async fn delete_role(&self, name: &str) -> Result<()>;

    /// `PUT user/{name}`
    async fn put_user(&self, name: &str, user: &UserBody) -> Result<()>;

    /// `POST user/{name}/_password`; a missing user is [`Error::UserNotFound`]
    async fn change_password(&self, name: &str, password: &str) -> Result<()>;

    /// `DELETE user/{name}`; a missing user is not an error
    async fn delete_user(&self, name: &str) -> Result<()>;

    /// `GET _authenticate`
    async fn authenticate(&self) -> Result<()>;
}

/// Opens [`SecurityApi`] clients for a configuration
#[async_trait]
pub trait SecurityConnector: Send + Sync + 'static {
    /// Build a client authenticated as the configured admin
    async fn connect(&self, config: &ElasticsearchConfig) -> Result<Arc<dyn SecurityApi>>;
}

/// [`SecurityApi`] over HTTP
pub struct HttpSecurityApi {
    http: reqwest::Client,
    base: String,
    username: String,
    password: SensitiveString,
}

impl HttpSecurityApi {
    /// Build a client from configuration
    pub fn from_config(config: &ElasticsearchConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(tls) = &config.tls {
            builder = builder.use_preconfigured_tls(tls.client_config()?);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: config.security_base(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, kind: &str, name: &str, suffix: &str) -> String {
        format!(
            "{}/{kind}/{}{suffix}",
            self.base,
            utf8_percent_encode(name, PATH_SEGMENT)
        )
    }

    /// Send a request; returns the status when it is a success or allowed
    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
        allowed: &[StatusCode],
    ) -> Result<StatusCode> {
        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(self.password.expose_secret()));
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::reachability_with_source(format!("{method} {url} failed"), e))?;

        let status = response.status();
        debug!(%method, %url, status = status.as_u16(), "security API call");
        if status.is_success() || allowed.contains(&status) {
            return Ok(status);
        }
        let text = response.text().await.unwrap_or_default();
        Err(Error::statement_with_code(
            format!("{method} {url} returned {status}: {text}"),
            status.as_u16().to_string(),
        ))
    }
}

#[async_trait]
impl SecurityApi for HttpSecurityApi {
    async fn put_role(&self, name: &str, definition: &serde_json::Value) -> Result<()> {
        self.send(Method::PUT, self.url("role", name, ""), Some(definition.clone()), &[])
            .await
            .map(|_| ())
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            self.url("role", name, ""),
            None,
            &[StatusCode::NOT_FOUND],
        )
        .await
        .map(|_| ())
    }

    async fn put_user(&self, name: &str, user: &UserBody) -> Result<()> {
        let body = serde_json::to_value(user)
            .map_err(|e| Error::internal(format!("failed to encode user: {e}")))?;
        self.send(Method::PUT, self.url("user", name, ""), Some(body), &[])
            .await
            .map(|_| ())
    }

    async fn change_password(&self, name: &str, password: &str) -> Result<()> {
        let status = self
            .send(
                Method::POST,
                self.url("user", name, "/_password"),
                Some(serde_json::json!({ "password": password })),
                &[StatusCode::NOT_FOUND],
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(Error::user_not_found(name));
        }
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            self.url("user", name, ""),
            None,
            &[StatusCode::NOT_FOUND],
        )
        .await
        .map(|_| ())
    }

    async fn authenticate(&self) -> Result<()> {
        self.send(Method::GET, format!("{}/_authenticate", self.base), None, &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::reachability(e.to_string()))
    }
}

/// Connector building [`HttpSecurityApi`] clients
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

#[async_trait]
impl SecurityConnector for HttpConnector {
    async fn connect(&self, config: &ElasticsearchConfig) -> Result<Arc<dyn SecurityApi>> {
        Ok(Arc::new(HttpSecurityApi::from_config(config)?))
    }
}
