//! SCRAM-SHA-256 password verifiers (RFC 5802, RFC 7677)
//!
//! With `password_authentication = scram-sha-256` the PostgreSQL plugin
//! hashes generated passwords before templating them into `CREATE ROLE` or
//! `ALTER ROLE`, so the plaintext never reaches the server or its logs.
//! PostgreSQL stores a string in this exact shape verbatim:
//!
//! ```text
//! SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use dbsecrets_plugin::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Iteration count PostgreSQL uses for its own verifiers
pub const DEFAULT_ITERATIONS: u32 = 4096;

const SALT_LEN: usize = 16;

/// How generated passwords are sent to PostgreSQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordAuthentication {
    /// Plaintext; the server hashes it
    #[default]
    Password,
    /// Client-side SCRAM-SHA-256 verifier
    ScramSha256,
}

impl PasswordAuthentication {
    /// Parse the `password_authentication` configuration value
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "password" => Ok(Self::Password),
            "scram-sha-256" => Ok(Self::ScramSha256),
            other => Err(Error::config(format!(
                "'{other}' is not a valid password authentication type"
            ))),
        }
    }

    /// Value as written in the configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::ScramSha256 => "scram-sha-256",
        }
    }

    /// Text substituted for `{{password}}`
    pub fn render(&self, password: &str) -> Result<String> {
        match self {
            Self::Password => Ok(password.to_string()),
            Self::ScramSha256 => scram_sha256_verifier(password),
        }
    }
}

impl fmt::Display for PasswordAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verifier for `password` with a fresh random salt
pub fn scram_sha256_verifier(password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    verifier_with_salt(password, &salt, DEFAULT_ITERATIONS)
}

/// Verifier for `password` with a caller-chosen salt and iteration count
pub fn verifier_with_salt(password: &str, salt: &[u8], iterations: u32) -> Result<String> {
    if iterations == 0 {
        return Err(Error::internal("SCRAM iteration count must be positive"));
    }

    let salted_password = pbkdf2_sha256(password.as_bytes(), salt, iterations)?;
    let client_key = hmac_sha256(&salted_password, b"Client Key")?;
    let server_key = hmac_sha256(&salted_password, b"Server Key")?;
    let stored_key = Sha256::digest(&client_key);

    Ok(format!(
        "SCRAM-SHA-256${iterations}:{}${}:{}",
        BASE64.encode(salt),
        BASE64.encode(stored_key),
        BASE64.encode(server_key)
    ))
}

fn mac_for(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| Error::internal(format!("HMAC key rejected: {e}")))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = mac_for(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// PBKDF2-HMAC-SHA256 with a single 32-byte output block
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
    // U1 = PRF(password, salt || INT(1))
    let mut mac = mac_for(password)?;
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = mac.finalize().into_bytes();
    let mut result = u.to_vec();

    for _ in 1..iterations {
        let mut mac = mac_for(password)?;
        mac.update(&u);
        u = mac.finalize().into_bytes();
        for (r, ui) in result.iter_mut().zip(u.iter()) {
            *r ^= ui;
        }
    }

    Ok(result)
}
