//! Redis plugin configuration

use dbsecrets_plugin::prelude::*;
use dbsecrets_plugin::tls::TlsMaterial;

/// Default username template
pub const DEFAULT_USERNAME_TEMPLATE: &str = r#"{{ printf "V_%s_%s_%s_%s" (.DisplayName | uppercase | truncate 10) (.RoleName | uppercase | truncate 10) (random 20 | uppercase) (unix_time) | truncate 100 }}"#;

/// Parsed configuration of a Redis plugin instance
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Admin ACL user
    pub username: String,
    /// Admin password
    pub password: SensitiveString,
    /// Connect over TLS
    pub tls: bool,
    /// Skip server certificate verification
    pub insecure_tls: bool,
    /// PEM root certificate trusted for TLS
    pub ca_cert: Option<String>,
    /// Compiled username template
    pub username_template: UsernameTemplate,
}

impl RedisConfig {
    /// Parse and validate a raw configuration map
    pub fn from_map(raw: &ConfigMap) -> Result<Self> {
        let reader = ConfigReader::new(raw);

        let host = reader
            .non_empty_string("host")?
            .ok_or_else(|| Error::config("host cannot be empty"))?;
        let port = match reader.int("port")? {
            None | Some(0) => return Err(Error::config("port cannot be empty")),
            Some(port) => u16::try_from(port)
                .map_err(|_| Error::config(format!("port {port} is out of range")))?,
        };
        let username = reader
            .non_empty_string("username")?
            .ok_or_else(|| Error::config("username cannot be empty"))?;
        let password = reader
            .secret("password")?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("password cannot be empty"))?;

        let tls = reader.bool("tls")?.unwrap_or(false);
        let ca_cert = reader.non_empty_string("ca_cert")?;
        if let Some(pem) = &ca_cert {
            TlsMaterial::from_pem(Some(pem), None, None)?;
        }

        let username_template = UsernameTemplate::for_config(
            reader.non_empty_string("username_template")?.as_deref(),
            DEFAULT_USERNAME_TEMPLATE,
        )?;

        Ok(Self {
            host,
            port,
            username,
            password,
            tls,
            insecure_tls: reader.bool("insecure_tls")?.unwrap_or(false),
            ca_cert,
            username_template,
        })
    }
}

impl ProducerConfig for RedisConfig {
    fn root_username(&self) -> &str {
        &self.username
    }

    fn root_password(&self) -> &str {
        self.password.expose_secret()
    }

    fn set_root_password(&mut self, password: &SensitiveString) {
        self.password = password.clone();
    }
}
