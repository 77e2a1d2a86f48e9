//! Elasticsearch plugin configuration
//!
//! TLS material is given as paths to PEM files on the plugin host.

use std::path::Path;

use url::Url;

use dbsecrets_plugin::prelude::*;
use dbsecrets_plugin::tls::TlsMaterial;

/// Default username template
pub const DEFAULT_USERNAME_TEMPLATE: &str = r#"{{ printf "v-%s-%s-%s-%s" (.DisplayName | truncate 15) (.RoleName | truncate 15) (random 20) (unix_time) | truncate 100 }}"#;

/// Parsed configuration of an Elasticsearch plugin instance
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster URL
    pub url: Url,
    /// Admin user
    pub username: String,
    /// Admin password
    pub password: SensitiveString,
    /// TLS settings; `None` uses the platform roots
    pub tls: Option<TlsMaterial>,
    /// Use the `/_xpack/security` API paths
    pub use_old_xpack: bool,
    /// Compiled username template
    pub username_template: UsernameTemplate,
}

fn read_pem(reader: &ConfigReader<'_>, key: &str) -> Result<Option<String>> {
    let Some(path) = reader.non_empty_string(key)? else {
        return Ok(None);
    };
    std::fs::read_to_string(Path::new(&path))
        .map(Some)
        .map_err(|e| Error::config(format!("{key}: unable to read {path}: {e}")))
}

impl ElasticsearchConfig {
    /// Parse and validate a raw configuration map
    pub fn from_map(raw: &ConfigMap) -> Result<Self> {
        let reader = ConfigReader::new(raw);

        let url = reader
            .non_empty_string("url")?
            .ok_or_else(|| Error::config("url cannot be empty"))?;
        let url = Url::parse(&url).map_err(|e| Error::config(format!("invalid url: {e}")))?;
        let username = reader
            .non_empty_string("username")?
            .ok_or_else(|| Error::config("username cannot be empty"))?;
        let password = reader
            .secret("password")?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("password cannot be empty"))?;

        let mut tls = TlsMaterial::from_pem(
            read_pem(&reader, "ca_cert")?.as_deref(),
            read_pem(&reader, "client_cert")?.as_deref(),
            read_pem(&reader, "client_key")?.as_deref(),
        )?;
        if reader.bool("insecure")?.unwrap_or(false) {
            tls.get_or_insert_with(TlsMaterial::insecure)
                .insecure_skip_verify = true;
        }

        let username_template = UsernameTemplate::for_config(
            reader.non_empty_string("username_template")?.as_deref(),
            DEFAULT_USERNAME_TEMPLATE,
        )?;

        Ok(Self {
            url,
            username,
            password,
            tls,
            use_old_xpack: reader.bool("use_old_xpack")?.unwrap_or(true),
            username_template,
        })
    }

    /// Base URL of the security API
    pub fn security_base(&self) -> String {
        let root = self.url.as_str().trim_end_matches('/');
        if self.use_old_xpack {
            format!("{root}/_xpack/security")
        } else {
            format!("{root}/_security")
        }
    }
}

impl ProducerConfig for ElasticsearchConfig {
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
