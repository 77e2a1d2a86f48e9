//! Request and response types exchanged with the host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::secrets::SensitiveString;

/// Raw plugin configuration as supplied by the host
pub type ConfigMap = Map<String, Value>;

/// Metadata the username template renders against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameMetadata {
    /// Display name of the entity requesting the credential
    #[serde(default)]
    pub display_name: String,
    /// Role the credential is issued for
    #[serde(default)]
    pub role_name: String,
}

impl UsernameMetadata {
    /// Create metadata from display and role names
    pub fn new(display_name: impl Into<String>, role_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            role_name: role_name.into(),
        }
    }
}

/// Operator-supplied statements for one phase of the lifecycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statements {
    /// Statement texts, each possibly holding several `;`-separated commands
    #[serde(default)]
    pub commands: Vec<String>,
}

impl Statements {
    /// Build from any list of strings
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether no statement text was supplied
    pub fn is_empty(&self) -> bool {
        self.commands.iter().all(|c| c.trim().is_empty())
    }
}

/// Kind of credential the host asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Username and password
    #[default]
    Password,
    /// RSA key pair; the host keeps the private half
    RsaPrivateKey,
    /// X.509 client certificate
    ClientCertificate,
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password => write!(f, "password"),
            Self::RsaPrivateKey => write!(f, "rsa_private_key"),
            Self::ClientCertificate => write!(f, "client_certificate"),
        }
    }
}

/// Initialize request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeRequest {
    /// Raw configuration map
    #[serde(default)]
    pub config: ConfigMap,
    /// Open and ping a connection before returning
    #[serde(default)]
    pub verify_connection: bool,
}

/// Initialize response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeResponse {
    /// Normalized configuration the host should persist
    pub config: ConfigMap,
}

/// NewUser request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUserRequest {
    /// Username metadata
    #[serde(default)]
    pub username_config: UsernameMetadata,
    /// Creation statements
    #[serde(default)]
    pub statements: Statements,
    /// Statements run when creation has to be undone
    #[serde(default)]
    pub rollback_statements: Statements,
    /// Requested credential type
    #[serde(default)]
    pub credential_type: CredentialType,
    /// Password chosen by the host
    #[serde(default)]
    pub password: SensitiveString,
    /// PEM public key for key-pair credentials
    #[serde(default)]
    pub public_key: Option<String>,
    /// Credential expiration time
    pub expiration: DateTime<Utc>,
}

/// NewUser response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUserResponse {
    /// Generated username
    pub username: String,
}

/// Password change part of an UpdateUser request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePassword {
    /// New password
    pub new_password: SensitiveString,
    /// Rotation statements; backend default when empty
    #[serde(default)]
    pub statements: Statements,
}

/// Public key change part of an UpdateUser request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePublicKey {
    /// New PEM public key
    pub new_public_key: String,
    /// Rotation statements; backend default when empty
    #[serde(default)]
    pub statements: Statements,
}

/// Expiration change part of an UpdateUser request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeExpiration {
    /// New expiration time
    pub new_expiration: DateTime<Utc>,
    /// Renewal statements; backend default when empty
    #[serde(default)]
    pub statements: Statements,
}

/// UpdateUser request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    /// User to update
    pub username: String,
    /// Credential type of the user
    #[serde(default)]
    pub credential_type: CredentialType,
    /// Optional password change
    #[serde(default)]
    pub password: Option<ChangePassword>,
    /// Optional public key change
    #[serde(default)]
    pub public_key: Option<ChangePublicKey>,
    /// Optional expiration change
    #[serde(default)]
    pub expiration: Option<ChangeExpiration>,
}

impl UpdateUserRequest {
    /// Whether the request changes nothing
    pub fn is_noop(&self) -> bool {
        self.password.is_none() && self.public_key.is_none() && self.expiration.is_none()
    }
}

/// DeleteUser request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteUserRequest {
    /// User to remove
    pub username: String,
    /// Revocation statements; backend default when empty
    #[serde(default)]
    pub statements: Statements,
}
