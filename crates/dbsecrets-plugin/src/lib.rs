//! # dbsecrets-plugin
//!
//! Shared engine for database credential plugins.
//!
//! A plugin creates, rotates and revokes short-lived database accounts on
//! behalf of a secrets-management host. This crate holds everything that is
//! not specific to one database: the host contract, configuration decoding,
//! the username template engine, statement templating, the memoizing
//! connection producer and the error sanitizer.
//!
//! ## Features
//!
//! - **Host contract**: [`Database`] with `initialize`, `new_user`,
//!   `update_user`, `delete_user` and `close`
//! - **Statement templating**: single-pass `{{name}}` substitution that never
//!   re-expands substituted values
//! - **Username templates**: a closed set of builtins (`truncate`, `random`,
//!   `unix_time`, `printf`, ...) validated at initialize
//! - **Connection producer**: one memoized client per instance, probed before
//!   use and rebuilt on failure
//! - **Error sanitizer**: every outgoing error is scrubbed of secret values
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let db = ErrorSanitizer::new(MyPlugin::new());
//! serve(Arc::new(db), ServeOptions::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod database;
pub mod error;
pub mod lifecycle;
pub mod middleware;
pub mod producer;
pub mod query;
pub mod secrets;
pub mod security;
pub mod server;
pub mod template;
pub mod tls;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{
        ChangeExpiration, ChangePassword, ChangePublicKey, ConfigMap, CredentialType,
        DeleteUserRequest, InitializeRequest, InitializeResponse, NewUserRequest,
        NewUserResponse, Statements, UpdateUserRequest, UsernameMetadata,
    };

    pub use crate::config::{AuthType, ConfigReader, ConnectionConfig};
    pub use crate::database::Database;
    pub use crate::middleware::ErrorSanitizer;
    pub use crate::producer::{ClientFactory, ConnectionProducer, ProducerConfig, ProducerGuard};
    pub use crate::query::{query_template, QueryParams};
    pub use crate::secrets::{SecretValues, SensitiveString};
    pub use crate::server::{serve, ServeOptions};
    pub use crate::template::UsernameTemplate;
}

pub use database::Database;
pub use error::{Error, ErrorCategory, Result};
pub use secrets::{SecretValues, SensitiveString};
pub use types::{
    ConfigMap, CredentialType, DeleteUserRequest, InitializeRequest, InitializeResponse,
    NewUserRequest, NewUserResponse, Statements, UpdateUserRequest, UsernameMetadata,
};
