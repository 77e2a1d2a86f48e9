//! Cloud SQL IAM authentication
//!
//! With `auth_type = gcp_iam` the PostgreSQL plugin logs in with a short-lived
//! OAuth access token instead of a password. Tokens are minted from a service
//! account key (the `service_account_json` config key, or the file named by
//! `GOOGLE_APPLICATION_CREDENTIALS`).
//!
//! Every initialized instance registers its token source under a unique
//! driver name; the name is released again when the instance closes.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use dbsecrets_plugin::{Error, Result, SensitiveString};

const CLOUD_SQL_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.admin";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
/// Renew access tokens this long before they expire
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

static DRIVERS: LazyLock<parking_lot::Mutex<HashMap<String, Arc<IamTokenSource>>>> =
    LazyLock::new(|| parking_lot::Mutex::new(HashMap::new()));

#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "type")]
    kind: String,
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct AccessToken {
    token: SensitiveString,
    expires_at: SystemTime,
}

/// Mints Cloud SQL access tokens for one service account
pub struct IamTokenSource {
    client_email: String,
    key_id: Option<String>,
    token_uri: String,
    encoding_key: EncodingKey,
    http: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for IamTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamTokenSource")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| Error::internal(format!("system time error: {e}")))
}

impl IamTokenSource {
    /// Build from inline credentials, falling back to
    /// `GOOGLE_APPLICATION_CREDENTIALS`
    pub fn from_config(service_account_json: Option<&SensitiveString>) -> Result<Self> {
        match service_account_json.filter(|json| !json.is_empty()) {
            Some(json) => Self::from_json(json.expose_secret()),
            None => {
                let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").map_err(|_| {
                    Error::config(
                        "gcp_iam requires service_account_json or GOOGLE_APPLICATION_CREDENTIALS",
                    )
                })?;
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    Error::config(format!("failed to read credentials file {path}: {e}"))
                })?;
                Self::from_json(&json)
            }
        }
    }

    /// Build from a service account key document
    pub fn from_json(json: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid service account credentials: {e}")))?;
        if key.kind != "service_account" {
            return Err(Error::config(format!(
                "unsupported credentials type {:?}, expected service_account",
                key.kind
            )));
        }
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::config(format!("invalid service account private key: {e}")))?;

        Ok(Self {
            client_email: key.client_email,
            key_id: key.private_key_id,
            token_uri: key
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            encoding_key,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        })
    }

    /// Service account e-mail
    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    fn assertion(&self) -> Result<String> {
        let iat = unix_now()?;
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_SQL_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::internal(format!("failed to sign token request: {e}")))
    }

    /// A valid access token, exchanged again once the cached one nears expiry
    pub async fn token(&self) -> Result<SensitiveString> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if SystemTime::now() + EXPIRY_SLACK < current.expires_at {
                return Ok(current.token.clone());
            }
        }

        let assertion = self.assertion()?;
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(|e| Error::reachability_with_source("failed to reach token endpoint", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::reachability(format!(
                "token endpoint returned {status}"
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::reachability_with_source("invalid token endpoint response", e))?;

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS));
        let token = SensitiveString::new(body.access_token);
        debug!(client_email = %self.client_email, "obtained Cloud SQL access token");
        *cached = Some(AccessToken {
            token: token.clone(),
            expires_at: SystemTime::now() + lifetime,
        });
        Ok(token)
    }
}

/// Register a token source and return its driver name
pub fn register(source: IamTokenSource) -> String {
    let name = format!("cloudsql-postgres-{}", uuid::Uuid::new_v4());
    DRIVERS.lock().insert(name.clone(), Arc::new(source));
    debug!(driver = %name, "registered IAM token source");
    name
}

/// Token source registered under `name`
pub fn lookup(name: &str) -> Option<Arc<IamTokenSource>> {
    DRIVERS.lock().get(name).cloned()
}

/// Release a driver name
pub fn unregister(name: &str) {
    if DRIVERS.lock().remove(name).is_some() {
        debug!(driver = %name, "unregistered IAM token source");
    }
}
