//! MongoDB Atlas plugin configuration

use dbsecrets_plugin::prelude::*;

/// Default username template
pub const DEFAULT_USERNAME_TEMPLATE: &str = r#"{{ printf "v-%s-%s-%s-%s" (.DisplayName | truncate 15) (.RoleName | truncate 15) (random 20) (unix_time) | truncate 54 }}"#;

/// Public Atlas Administration API
pub const DEFAULT_API_URL: &str = "https://cloud.mongodb.com";

/// Parsed configuration of an Atlas plugin instance
#[derive(Debug, Clone)]
pub struct AtlasConfig {
    /// Programmatic API public key
    pub public_key: String,
    /// Programmatic API private key
    pub private_key: SensitiveString,
    /// Atlas project (group) ID
    pub project_id: String,
    /// API base URL
    pub api_url: String,
    /// Compiled username template
    pub username_template: UsernameTemplate,
}

impl AtlasConfig {
    /// Parse and validate a raw configuration map
    pub fn from_map(raw: &ConfigMap) -> Result<Self> {
        let reader = ConfigReader::new(raw);

        let public_key = reader
            .non_empty_string("public_key")?
            .ok_or_else(|| Error::config("public_key cannot be empty"))?;
        let private_key = reader
            .secret("private_key")?
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("private_key cannot be empty"))?;
        let project_id = reader
            .non_empty_string("project_id")?
            .ok_or_else(|| Error::config("project_id cannot be empty"))?;

        let username_template = UsernameTemplate::for_config(
            reader.non_empty_string("username_template")?.as_deref(),
            DEFAULT_USERNAME_TEMPLATE,
        )?;

        Ok(Self {
            public_key,
            private_key,
            project_id,
            api_url: reader
                .non_empty_string("api_url")?
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            username_template,
        })
    }
}

impl ProducerConfig for AtlasConfig {
    const PASSWORD_KEY: &'static str = "private_key";

    fn root_username(&self) -> &str {
        &self.public_key
    }

    fn root_password(&self) -> &str {
        self.private_key.expose_secret()
    }

    fn set_root_password(&mut self, password: &SensitiveString) {
        self.private_key = password.clone();
    }

    fn secret_values(&self) -> SecretValues {
        SecretValues::new().with(self.private_key.expose_secret(), "[private_key]")
    }
}
