//! Helpers shared by every credential lifecycle

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::query::QueryParams;
use crate::types::{CredentialType, NewUserRequest, Statements};

/// `strftime` form of the `2006-01-02 15:04:05-0700` layout
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Render an expiration the way SQL `VALID UNTIL` clauses expect it
pub fn format_expiration(expiration: &DateTime<Utc>) -> String {
    expiration.format(EXPIRATION_FORMAT).to_string()
}

/// Substitution parameters for a statement about `username`.
///
/// The generated user is available as both `{{name}}` and `{{username}}`.
pub fn credential_params(
    username: &str,
    password: Option<&str>,
    expiration: Option<&str>,
) -> QueryParams {
    let mut params = QueryParams::new()
        .with("name", username)
        .with("username", username);
    if let Some(password) = password {
        params.insert("password", password);
    }
    if let Some(expiration) = expiration {
        params.insert("expiration", expiration);
    }
    params
}

/// Operator statements, or `defaults` when none were supplied
pub fn statements_or_default(given: &Statements, defaults: &[&str]) -> Vec<String> {
    if given.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        given.commands.clone()
    }
}

/// Reject a creation request that cannot do anything
pub fn check_new_user(request: &NewUserRequest) -> Result<()> {
    if request.statements.is_empty() {
        return Err(Error::EmptyCreationStatements);
    }
    Ok(())
}

/// Reject credential types other than passwords
pub fn require_password(credential_type: CredentialType) -> Result<()> {
    match credential_type {
        CredentialType::Password => Ok(()),
        other => Err(Error::unsupported(format!(
            "credential type {other} is not supported"
        ))),
    }
}
