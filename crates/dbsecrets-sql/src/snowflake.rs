//! Snowflake backend
//!
//! Statements are submitted to the Snowflake SQL API (`/api/v2/statements`)
//! authenticated with a key-pair JWT signed by the root user's private key.
//! The SQL API has no session state between requests, so a transaction is
//! buffered and submitted as a single `BEGIN; ...; COMMIT;` multi-statement
//! request.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use dbsecrets_plugin::{Error, Result};

use crate::connection::{Connection, ConnectionFactory, DatabaseType, Transaction};
use crate::database::SqlConfig;
use crate::dialect::SnowflakeLocator;
use crate::types::{Row, Value};

/// JWT lifetime; Snowflake rejects anything above one hour
const TOKEN_LIFETIME_SECS: u64 = 3540;
/// Refresh tokens this long before they expire
const REFRESH_BUFFER: Duration = Duration::from_secs(300);
/// Server-side statement timeout in seconds
const STATEMENT_TIMEOUT_SECS: u64 = 60;
/// Statement still running
const ASYNC_IN_PROGRESS: &str = "333334";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// JWT claims for key-pair authentication
#[derive(Debug, Serialize, Deserialize)]
struct KeyPairClaims {
    /// `<ACCOUNT>.<USER>.SHA256:<public key fingerprint>`
    iss: String,
    /// `<ACCOUNT>.<USER>`
    sub: String,
    iat: u64,
    exp: u64,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// Key-pair JWT issuer
pub struct KeyPairAuth {
    encoding_key: EncodingKey,
    issuer: String,
    subject: String,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for KeyPairAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairAuth")
            .field("issuer", &self.issuer)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Base64 SHA-256 fingerprint of the DER public key
pub fn public_key_fingerprint(private_key: &RsaPrivateKey) -> Result<String> {
    use sha2::{Digest, Sha256};

    let der = private_key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| Error::config(format!("failed to encode public key: {e}")))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        digest,
    ))
}

impl KeyPairAuth {
    /// Build from an unencrypted PKCS#8 PEM key
    pub fn new(account_locator: &str, user: &str, private_key_pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| Error::config(format!("failed to parse private_key: {e}")))?;
        let fingerprint = public_key_fingerprint(&private_key)?;

        let account = account_locator.to_uppercase();
        let user = user.to_uppercase();

        let der = private_key
            .to_pkcs8_der()
            .map_err(|e| Error::config(format!("failed to encode private_key: {e}")))?;

        Ok(Self {
            encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
            issuer: format!("{account}.{user}.SHA256:{fingerprint}"),
            subject: format!("{account}.{user}"),
            cached: Mutex::new(None),
        })
    }

    /// The `iss` claim
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The `sub` claim
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Current token, re-signed when within five minutes of expiry
    pub fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock();
        if let Some(current) = cached.as_ref() {
            let fresh = SystemTime::now()
                .checked_add(REFRESH_BUFFER)
                .is_some_and(|t| t < current.expires_at);
            if fresh {
                return Ok(current.token.clone());
            }
        }

        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::internal(format!("system time error: {e}")))?
            .as_secs();
        let exp = iat + TOKEN_LIFETIME_SECS;
        let claims = KeyPairClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat,
            exp,
        };
        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| Error::internal(format!("failed to sign JWT: {e}")))?;

        debug!(subject = %self.subject, "signed new Snowflake key-pair token");
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: UNIX_EPOCH + Duration::from_secs(exp),
        });
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

impl StatementResponse {
    fn into_rows(self) -> Vec<Row> {
        let columns: Vec<String> = self
            .result_set_meta_data
            .unwrap_or_default()
            .row_type
            .into_iter()
            .map(|c| c.name)
            .collect();
        self.data
            .into_iter()
            .map(|values| {
                let values = values.into_iter().map(Value::from).collect();
                Row::new(columns.clone(), values)
            })
            .collect()
    }
}

/// Number of `;`-terminated statements in `sql`
fn statement_count(sql: &str) -> usize {
    sql.split(';').filter(|s| !s.trim().is_empty()).count()
}

/// Build the SQL API request body
fn request_body(locator: &SnowflakeLocator, sql: &str, params: &[Value]) -> serde_json::Value {
    let mut body = json!({
        "statement": sql,
        "timeout": STATEMENT_TIMEOUT_SECS,
        "database": locator.database,
    });
    if let Some(warehouse) = &locator.warehouse {
        body["warehouse"] = json!(warehouse);
    }
    if let Some(role) = &locator.role {
        body["role"] = json!(role);
    }
    if !params.is_empty() {
        let bindings: serde_json::Map<String, serde_json::Value> = params
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let binding = match value {
                    Value::Null => json!({"type": "TEXT", "value": null}),
                    Value::Bool(b) => json!({"type": "BOOLEAN", "value": b.to_string()}),
                    Value::Int(n) => json!({"type": "FIXED", "value": n.to_string()}),
                    Value::Text(s) => json!({"type": "TEXT", "value": s}),
                };
                ((i + 1).to_string(), binding)
            })
            .collect();
        body["bindings"] = serde_json::Value::Object(bindings);
    }
    if statement_count(sql) > 1 {
        body["parameters"] = json!({"MULTI_STATEMENT_COUNT": "0"});
    }
    body
}

/// Shared SQL API client
pub struct SnowflakeClient {
    http: reqwest::Client,
    locator: SnowflakeLocator,
    auth: KeyPairAuth,
}

impl SnowflakeClient {
    fn statements_url(&self) -> String {
        format!("{}/api/v2/statements", self.locator.api_url())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(request
            .bearer_auth(self.auth.token()?)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header("Accept", "application/json"))
    }

    async fn parse(response: reqwest::Response) -> Result<StatementResponse> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::reachability_with_source("failed to read Snowflake response", e))?;
        let parsed: StatementResponse = serde_json::from_str(&text).map_err(|_| {
            Error::statement(format!("unexpected Snowflake response ({status})"))
        })?;

        if status.is_success() {
            return Ok(parsed);
        }
        let message = parsed
            .message
            .clone()
            .unwrap_or_else(|| format!("Snowflake request failed ({status})"));
        match parsed.code.clone() {
            Some(code) => Err(Error::statement_with_code(message, code)),
            None => Err(Error::statement(message)),
        }
    }

    /// Submit a statement and wait for its result
    pub async fn submit(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let body = request_body(&self.locator, sql, params);
        let request = self.authorized(self.http.post(self.statements_url()).json(&body))?;
        let response = request
            .send()
            .await
            .map_err(|e| Error::reachability_with_source("failed to reach Snowflake", e))?;
        let mut parsed = Self::parse(response).await?;

        while parsed.code.as_deref() == Some(ASYNC_IN_PROGRESS) {
            let Some(handle) = parsed.statement_handle.clone() else {
                return Err(Error::statement("Snowflake statement pending without a handle"));
            };
            tokio::time::sleep(POLL_INTERVAL).await;
            let url = format!("{}/{handle}", self.statements_url());
            let response = self
                .authorized(self.http.get(url))?
                .send()
                .await
                .map_err(|e| Error::reachability_with_source("failed to reach Snowflake", e))?;
            parsed = Self::parse(response).await?;
        }

        Ok(parsed.into_rows())
    }
}

/// Snowflake "connection": a handle on the shared SQL API client
pub struct SnowflakeConnection {
    client: Arc<SnowflakeClient>,
}

#[async_trait]
impl Connection for SnowflakeConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let rows = self.client.submit(sql, params).await?;
        Ok(rows.len() as u64)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.client.submit(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(SnowflakeTransaction {
            client: Arc::clone(&self.client),
            buffered: Mutex::new(Vec::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        self.client.submit("SELECT 1", &[]).await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Buffered transaction submitted on commit
pub struct SnowflakeTransaction {
    client: Arc<SnowflakeClient>,
    buffered: Mutex<Vec<String>>,
}

impl SnowflakeTransaction {
    fn script(&self) -> String {
        let mut script = String::from("BEGIN;");
        for statement in self.buffered.lock().iter() {
            script.push(' ');
            script.push_str(statement.trim().trim_end_matches(';'));
            script.push(';');
        }
        script.push_str(" COMMIT;");
        script
    }
}

#[async_trait]
impl Transaction for SnowflakeTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        if !params.is_empty() {
            return Err(Error::unsupported(
                "bind parameters are not supported inside Snowflake transactions",
            ));
        }
        self.buffered.lock().push(sql.to_string());
        Ok(0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.buffered.lock().is_empty() {
            return Ok(());
        }
        self.client.submit(&self.script(), &[]).await.map(|_| ())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Nothing was sent
        Ok(())
    }
}

/// Snowflake connection factory
pub struct SnowflakeConnectionFactory {
    client: Arc<SnowflakeClient>,
}

impl SnowflakeConnectionFactory {
    /// Build from a parsed plugin configuration
    pub fn from_config(config: &SqlConfig) -> Result<Self> {
        let locator = config
            .snowflake
            .clone()
            .ok_or_else(|| Error::config("missing Snowflake connection_url"))?;
        let private_key = config
            .private_key
            .as_ref()
            .ok_or_else(|| Error::config("private_key is required"))?;
        let auth = KeyPairAuth::new(
            &locator.account_locator(),
            &config.connection.username,
            private_key.expose_secret(),
        )?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(STATEMENT_TIMEOUT_SECS + 30))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client: Arc::new(SnowflakeClient {
                http,
                locator,
                auth,
            }),
        })
    }
}

#[async_trait]
impl ConnectionFactory for SnowflakeConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(SnowflakeConnection {
            client: Arc::clone(&self.client),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Snowflake
    }
}
