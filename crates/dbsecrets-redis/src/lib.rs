//! # dbsecrets-redis
//!
//! Redis ACL credential plugin.
//!
//! ## Features
//!
//! - **ACL users**: `ACL SETUSER <user> ON ><password> <rules>` from JSON
//!   rule arrays
//! - **Rotation** with `resetpass`, including the admin user itself
//! - **TLS** with an optional PEM root certificate or verification disabled
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let plugin = ErrorSanitizer::new(dbsecrets_redis::Redis::new());
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
    pub use crate::client::{AclClient, NativeRedisConnector, RedisConnector};
    pub use crate::config::RedisConfig;
    pub use crate::database::{parse_acl_rules, Redis, RedisClientFactory};
}

pub use client::{AclClient, RedisConnector};
pub use config::RedisConfig;
pub use database::Redis;
