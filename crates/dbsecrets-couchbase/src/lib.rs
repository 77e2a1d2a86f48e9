//! # dbsecrets-couchbase
//!
//! Couchbase credential plugin using the cluster's RBAC management API.
//!
//! ## Features
//!
//! - **Local users** with bucket, scope and collection scoped roles and
//!   group memberships
//! - **Rotation** that preserves a user's directly assigned roles
//! - **Bucket readiness**: with `bucket_name` set, connections wait for the
//!   bucket to report healthy nodes
//! - **TLS** from a base64-encoded PEM certificate
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let plugin = ErrorSanitizer::new(dbsecrets_couchbase::Couchbase::new());
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
    pub use crate::client::{ClusterConnector, LocalUser, RestConnector, UserManager};
    pub use crate::config::CouchbaseConfig;
    pub use crate::database::{Couchbase, CouchbaseClientFactory, CreationStatement, RoleSpec};
}

pub use client::{ClusterConnector, UserManager};
pub use config::CouchbaseConfig;
pub use database::Couchbase;
