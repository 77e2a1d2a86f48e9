//! Couchbase plugin configuration

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use dbsecrets_plugin::prelude::*;
use dbsecrets_plugin::tls::TlsMaterial;

/// Default username template
pub const DEFAULT_USERNAME_TEMPLATE: &str = r#"{{ printf "V_%s_%s_%s_%s" (.DisplayName | uppercase | truncate 64) (.RoleName | uppercase | truncate 64) (random 20 | uppercase) (unix_time) | truncate 128 }}"#;

const MANAGEMENT_PORT: u16 = 8091;
const MANAGEMENT_TLS_PORT: u16 = 18091;

/// Parsed configuration of a Couchbase plugin instance
#[derive(Debug, Clone)]
pub struct CouchbaseConfig {
    /// Cluster hosts, as given
    pub hosts: String,
    /// Admin user
    pub username: String,
    /// Admin password
    pub password: SensitiveString,
    /// Connect over TLS
    pub tls: bool,
    /// Skip server certificate verification
    pub insecure_tls: bool,
    /// TLS settings decoded from `base64pem`
    pub tls_material: Option<TlsMaterial>,
    /// Bucket that must be ready before the cluster is considered usable
    pub bucket_name: Option<String>,
    /// Compiled username template
    pub username_template: UsernameTemplate,
}

impl CouchbaseConfig {
    /// Parse and validate a raw configuration map
    pub fn from_map(raw: &ConfigMap) -> Result<Self> {
        let reader = ConfigReader::new(raw);

        let hosts = reader
            .non_empty_string("hosts")?
            .ok_or_else(|| Error::config("hosts cannot be empty"))?;
        let username = reader
            .non_empty_string("username")?
            .ok_or_else(|| Error::config("username cannot be empty"))?;
        let password = reader
            .secret("password")?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("password cannot be empty"))?;

        let tls = reader.bool("tls")?.unwrap_or(false)
            || hosts.trim_start().starts_with("couchbases://");
        let insecure_tls = reader.bool("insecure_tls")?.unwrap_or(false);

        let tls_material = match reader.non_empty_string("base64pem")? {
            Some(encoded) => {
                let pem = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::config(format!("base64pem is not valid base64: {e}")))?;
                let pem = String::from_utf8(pem)
                    .map_err(|_| Error::config("base64pem does not decode to PEM text"))?;
                TlsMaterial::from_pem(Some(&pem), None, None)?
            }
            None if tls && !insecure_tls => {
                return Err(Error::config("base64pem is required when tls is enabled"))
            }
            None => None,
        };
        let tls_material = match (tls_material, insecure_tls) {
            (Some(mut material), true) => {
                material.insecure_skip_verify = true;
                Some(material)
            }
            (None, true) => Some(TlsMaterial::insecure()),
            (material, false) => material,
        };

        let username_template = UsernameTemplate::for_config(
            reader.non_empty_string("username_template")?.as_deref(),
            DEFAULT_USERNAME_TEMPLATE,
        )?;

        Ok(Self {
            hosts,
            username,
            password,
            tls,
            insecure_tls,
            tls_material,
            bucket_name: reader.non_empty_string("bucket_name")?,
            username_template,
        })
    }

    /// Management REST endpoint of the first configured host
    pub fn management_url(&self) -> String {
        let first = self.hosts.split(',').next().unwrap_or_default().trim();
        let host = first
            .split_once("://")
            .map_or(first, |(_, rest)| rest)
            .trim_end_matches('/');
        let (scheme, port) = if self.tls {
            ("https", MANAGEMENT_TLS_PORT)
        } else {
            ("http", MANAGEMENT_PORT)
        };
        let has_port = host
            .rsplit_once(':')
            .is_some_and(|(_, p)| p.parse::<u16>().is_ok());
        if has_port {
            format!("{scheme}://{host}")
        } else {
            format!("{scheme}://{host}:{port}")
        }
    }
}

impl ProducerConfig for CouchbaseConfig {
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
