//! Secret handling
//!
//! [`SensitiveString`] keeps credentials out of logs and debug output.
//! [`SecretValues`] is the secret-to-token table a plugin reports so that the
//! error sanitizer can scrub error text before it leaves the process.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// A wrapper around `SecretString` that redacts itself in `Debug`, `Display`
/// and serialized output.
///
/// # Example
///
/// ```rust
/// use dbsecrets_plugin::SensitiveString;
///
/// let secret = SensitiveString::new("s3cr3t");
/// assert_eq!(format!("{secret:?}"), "[REDACTED]");
/// assert_eq!(secret.expose_secret(), "s3cr3t");
/// ```
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use sparingly - only when the actual value is needed (e.g., for authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the secret is the empty string
    pub fn is_empty(&self) -> bool {
        self.expose_secret().is_empty()
    }
}

impl Default for SensitiveString {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SensitiveString {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Serialize as redacted to prevent accidental exposure in dumps/logs
impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

/// Deserialize from the actual string value
impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Secret value to placeholder token pairs, e.g. `hunter2 -> [password]`.
#[derive(Clone, Default)]
pub struct SecretValues {
    entries: Vec<(String, String)>,
}

impl SecretValues {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret and the token that replaces it. Empty secrets are ignored.
    pub fn insert(&mut self, secret: impl Into<String>, token: impl Into<String>) {
        let secret = secret.into();
        if secret.is_empty() {
            return;
        }
        let token = token.into();
        match self.entries.iter_mut().find(|(s, _)| *s == secret) {
            Some(entry) => entry.1 = token,
            None => self.entries.push((secret, token)),
        }
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with(mut self, secret: impl Into<String>, token: impl Into<String>) -> Self {
        self.insert(secret, token);
        self
    }

    /// Add every entry of `other` that is not already registered
    pub fn merge(&mut self, other: SecretValues) {
        for (secret, token) in other.entries {
            if !self.entries.iter().any(|(s, _)| *s == secret) {
                self.entries.push((secret, token));
            }
        }
    }

    /// Number of registered secrets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no secrets are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tokens currently registered, in insertion order
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, t)| t.as_str())
    }

    /// Replace every occurrence of every secret in `text` with its token.
    ///
    /// Longer secrets are replaced first so a secret that contains another
    /// one is never partially exposed.
    pub fn redact(&self, text: &str) -> String {
        let mut ordered: Vec<&(String, String)> = self.entries.iter().collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut out = text.to_string();
        for (secret, token) in ordered {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), token);
            }
        }
        out
    }
}

impl std::fmt::Debug for SecretValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tokens()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("my-secret-password");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(secret.expose_secret(), "my-secret-password");
    }

    #[test]
    fn test_sensitive_string_serde() {
        let secret: SensitiveString = serde_json::from_str("\"my-secret-password\"").unwrap();
        assert_eq!(secret.expose_secret(), "my-secret-password");

        let serialized = serde_json::to_string(&secret).unwrap();
        assert_eq!(serialized, "\"***REDACTED***\"");
    }

    #[test]
    fn test_redact_replaces_all_occurrences() {
        let secrets = SecretValues::new().with("SuperSecret1!", "[password]");
        let text = "auth failed for SuperSecret1! (SuperSecret1!)";
        assert_eq!(secrets.redact(text), "auth failed for [password] ([password])");
    }

    #[test]
    fn test_redact_longest_first() {
        let secrets = SecretValues::new()
            .with("abc", "[short]")
            .with("abcdef", "[long]");
        assert_eq!(secrets.redact("x abcdef y abc"), "x [long] y [short]");
    }

    #[test]
    fn test_empty_secret_ignored() {
        let secrets = SecretValues::new().with("", "[password]");
        assert!(secrets.is_empty());
        assert_eq!(secrets.redact("unchanged"), "unchanged");
    }

    #[test]
    fn test_merge_keeps_existing_tokens() {
        let mut current = SecretValues::new().with("new-pass", "[password]");
        current.merge(
            SecretValues::new()
                .with("old-pass", "[password]")
                .with("new-pass", "[other]"),
        );
        assert_eq!(current.len(), 2);
        assert_eq!(current.redact("new-pass old-pass"), "[password] [password]");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let secrets = SecretValues::new().with("hunter2", "[password]");
        let debug = format!("{:?}", secrets);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[password]"));
    }
}
