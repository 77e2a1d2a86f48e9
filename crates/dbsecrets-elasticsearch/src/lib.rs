//! # dbsecrets-elasticsearch
//!
//! Elasticsearch credential plugin using the security REST API.
//!
//! ## Features
//!
//! - **Native users** with either an inline per-user role or existing roles
//! - **Legacy paths**: `use_old_xpack` switches between `/_xpack/security`
//!   and `/_security`
//! - **TLS** from PEM files (`ca_cert`, `client_cert`, `client_key`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let plugin = ErrorSanitizer::new(dbsecrets_elasticsearch::Elasticsearch::new());
//! serve(Arc::new(plugin), ServeOptions::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod database;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{HttpConnector, SecurityApi, SecurityConnector, UserBody};
    pub use crate::config::ElasticsearchConfig;
    pub use crate::database::{CreationStatement, Elasticsearch, SecurityClientFactory};
}

pub use client::{SecurityApi, SecurityConnector};
pub use config::ElasticsearchConfig;
pub use database::Elasticsearch;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use dbsecrets_plugin::Database;

    #[test]
    fn test_prelude_imports() {
        assert_eq!(Elasticsearch::new().plugin_type(), "elasticsearch");
        let _connector = HttpConnector;
    }
}
