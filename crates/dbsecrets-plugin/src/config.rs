//! Configuration decoding
//!
//! The host hands plugins an untyped JSON object. [`ConfigReader`] decodes
//! individual keys weakly (numbers from numeric strings, booleans from
//! `"true"`/`"false"`, durations from seconds or `humantime` strings).
//! [`ConnectionConfig`] is the connection-URL style configuration shared by
//! SQL-family and Neo4j plugins, with the validation rules every driver
//! enforces at initialize.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::query::{query_template, QueryParams};
use crate::secrets::SensitiveString;
use crate::tls::TlsMaterial;
use crate::types::ConfigMap;

/// Default `max_open_connections`
pub const DEFAULT_MAX_OPEN_CONNECTIONS: u32 = 4;

/// Characters left untouched when escaping credentials into a URL
const USERINFO_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Weakly-typed accessor over a raw configuration map
#[derive(Debug, Clone, Copy)]
pub struct ConfigReader<'a> {
    map: &'a ConfigMap,
}

impl<'a> ConfigReader<'a> {
    /// Wrap a configuration map
    pub fn new(map: &'a ConfigMap) -> Self {
        Self { map }
    }

    fn value(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    /// String value; numbers and booleans are rendered as text
    pub fn string(&self, key: &str) -> Result<Option<String>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(type_error(key, "a string", other)),
        }
    }

    /// Non-empty string value
    pub fn non_empty_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.string(key)?.filter(|s| !s.is_empty()))
    }

    /// Secret string value
    pub fn secret(&self, key: &str) -> Result<Option<SensitiveString>> {
        Ok(self.string(key)?.map(SensitiveString::new))
    }

    /// Boolean value, accepting `true`/`false`, `"true"`/`"false"`, `"1"`/`"0"` and `1`/`0`
    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "true" | "t" | "1" => Ok(Some(true)),
                "false" | "f" | "0" => Ok(Some(false)),
                _ => Err(Error::config(format!("{key}: cannot parse {s:?} as a boolean"))),
            },
            Some(Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(Error::config(format!("{key}: cannot parse {n} as a boolean"))),
            },
            Some(other) => Err(type_error(key, "a boolean", other)),
        }
    }

    /// Integer value from a number or numeric string
    pub fn int(&self, key: &str) -> Result<Option<i64>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| Error::config(format!("{key}: {n} is not an integer"))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::config(format!("{key}: cannot parse {s:?} as an integer"))),
            Some(other) => Err(type_error(key, "an integer", other)),
        }
    }

    /// Non-negative integer that fits in `u32`
    pub fn u32(&self, key: &str) -> Result<Option<u32>> {
        match self.int(key)? {
            None => Ok(None),
            Some(n) => u32::try_from(n)
                .map(Some)
                .map_err(|_| Error::config(format!("{key}: {n} is out of range"))),
        }
    }

    /// Duration from a number of seconds, a numeric string, or a `humantime`
    /// string such as `"30s"` or `"1h"`
    pub fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| Error::config(format!("{key}: invalid duration {n}"))),
            Some(Value::String(s)) => parse_duration(s)
                .map_err(|e| Error::config(format!("{key}: invalid duration {s:?}: {e}"))),
            Some(other) => Err(type_error(key, "a duration", other)),
        }
    }

    /// List of strings from a JSON array or a comma-separated string
    pub fn string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.value(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(type_error(key, "a list of strings", other)),
                })
                .collect(),
            Some(Value::String(s)) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()),
            Some(other) => Err(type_error(key, "a list of strings", other)),
        }
    }
}

fn type_error(key: &str, expected: &str, found: &Value) -> Error {
    let kind = match found {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    Error::config(format!("{key}: expected {expected}, found {kind}"))
}

/// Parse seconds (`"300"`) or a humantime duration (`"5m"`); empty means zero
pub fn parse_duration(input: &str) -> std::result::Result<Option<Duration>, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Some(Duration::from_secs(secs)));
    }
    humantime::parse_duration(trimmed)
        .map(Some)
        .map_err(|e| e.to_string())
}

/// Percent-escape a credential for the userinfo part of a URL
pub fn escape_userinfo(value: &str) -> String {
    utf8_percent_encode(value, USERINFO_ESCAPE).to_string()
}

/// Authentication mode for the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthType {
    /// Username and password from the configuration
    #[default]
    Password,
    /// Cloud SQL IAM authentication with a service account
    GcpIam,
}

impl AuthType {
    fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Password),
            Some("gcp_iam") => Ok(Self::GcpIam),
            Some(other) => Err(Error::config(format!("invalid auth_type: {other:?}"))),
        }
    }
}

/// Connection-URL configuration shared by URL-driven plugins
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// URL template, may hold `{{username}}` and `{{password}}`
    pub connection_url: String,
    /// Administrative username
    pub username: String,
    /// Administrative password
    pub password: SensitiveString,
    /// Skip URL escaping of the credentials
    pub disable_escaping: bool,
    /// Maximum open connections
    pub max_open_connections: u32,
    /// Maximum idle connections, never larger than `max_open_connections`
    pub max_idle_connections: u32,
    /// Maximum connection lifetime; zero means unlimited
    pub max_connection_lifetime: Duration,
    /// Optional TLS material
    pub tls: Option<TlsMaterial>,
    /// Authentication mode
    pub auth_type: AuthType,
    /// Service account credentials for IAM authentication
    pub service_account_json: Option<SensitiveString>,
    /// Operator-supplied username template
    pub username_template: Option<String>,
}

impl ConnectionConfig {
    /// Parse and validate the shared connection keys
    pub fn from_map(map: &ConfigMap) -> Result<Self> {
        let reader = ConfigReader::new(map);

        let connection_url = reader.string("connection_url")?.unwrap_or_default();
        if connection_url.trim().is_empty() {
            return Err(Error::config("connection_url cannot be empty"));
        }

        let username = reader.string("username")?.unwrap_or_default();
        let password = reader.secret("password")?.unwrap_or_default();
        if contains_template_variable(&username) || contains_template_variable(password.expose_secret())
        {
            return Err(Error::config(
                "username and/or password cannot contain the template variables",
            ));
        }

        let max_open_connections = match reader.u32("max_open_connections")? {
            None | Some(0) => DEFAULT_MAX_OPEN_CONNECTIONS,
            Some(n) => n,
        };
        let max_idle_connections = match reader.u32("max_idle_connections")? {
            None | Some(0) => max_open_connections,
            Some(n) => n.min(max_open_connections),
        };
        let max_connection_lifetime = reader
            .duration("max_connection_lifetime")?
            .unwrap_or(Duration::ZERO);

        let tls = TlsMaterial::from_pem(
            reader.string("root_ca_pem_bundle")?.as_deref(),
            reader.string("tls_cert_chain_pem")?.as_deref(),
            reader.string("tls_key_pem")?.as_deref(),
        )?;

        let auth_type = AuthType::parse(reader.string("auth_type")?.as_deref())?;
        let service_account_json = reader
            .secret("service_account_json")?
            .filter(|s| !s.is_empty());

        Ok(Self {
            connection_url,
            username,
            password,
            disable_escaping: reader.bool("disable_escaping")?.unwrap_or(false),
            max_open_connections,
            max_idle_connections,
            max_connection_lifetime,
            tls,
            auth_type,
            service_account_json,
            username_template: reader.non_empty_string("username_template")?,
        })
    }

    /// Substitute the credentials into the URL template.
    ///
    /// The username is escaped unless `disable_escaping` is set; the password
    /// is escaped as well except for the `mysql` driver. PostgreSQL URLs get
    /// `timezone=UTC` and `application_name=vault` when absent.
    pub fn render_url(&self, driver: &str) -> String {
        let (username, password) = if self.disable_escaping {
            (
                self.username.clone(),
                self.password.expose_secret().to_string(),
            )
        } else {
            let password = if driver == "mysql" {
                self.password.expose_secret().to_string()
            } else {
                escape_userinfo(self.password.expose_secret())
            };
            (escape_userinfo(&self.username), password)
        };

        let params = QueryParams::new()
            .with("username", username)
            .with("password", password);
        let url = query_template(&self.connection_url, &params);

        if is_postgres_url(&url) {
            append_missing_query_params(&url, &[("timezone", "UTC"), ("application_name", "vault")])
        } else {
            url
        }
    }

    /// Rendered URL with any password replaced, for logging
    pub fn redacted_url(&self, driver: &str) -> String {
        let rendered = self.render_url(driver);
        let password = self.password.expose_secret();
        if password.is_empty() {
            return rendered;
        }
        let escaped = escape_userinfo(password);
        rendered.replace(&escaped, "***").replace(password, "***")
    }
}

fn contains_template_variable(value: &str) -> bool {
    value.contains("{{username}}") || value.contains("{{password}}")
}

/// Whether a URL uses the `postgres://` or `postgresql://` scheme
pub fn is_postgres_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("postgres://") || lower.starts_with("postgresql://")
}

/// Append `key=value` query parameters whose keys are not already present.
///
/// Only the query is touched; the authority is kept as written so
/// multi-host forms survive.
pub fn append_missing_query_params(url: &str, defaults: &[(&str, &str)]) -> String {
    let (base, fragment) = match url.find('#') {
        Some(idx) => (&url[..idx], &url[idx..]),
        None => (url, ""),
    };
    let (prefix, query) = base.split_once('?').unwrap_or((base, ""));

    let existing: Vec<String> = form_urlencoded::parse(query.as_bytes())
        .map(|(key, _)| key.into_owned())
        .collect();

    let mut serializer = form_urlencoded::Serializer::new(query.trim_end_matches('&').to_string());
    let mut appended = false;
    for (key, value) in defaults {
        if existing.iter().any(|k| k.eq_ignore_ascii_case(key)) {
            continue;
        }
        serializer.append_pair(key, value);
        appended = true;
    }
    if !appended {
        return url.to_string();
    }

    format!("{prefix}?{}{fragment}", serializer.finish())
}
