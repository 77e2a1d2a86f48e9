//! # dbsecrets-mongodbatlas
//!
//! MongoDB Atlas credential plugin built on the Atlas Administration API.
//!
//! ## Features
//!
//! - **Database users** with roles and cluster scopes from a JSON
//!   creation statement
//! - **HTTP digest authentication** with a programmatic API key
//! - **Revocation** against any authentication database
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let plugin = ErrorSanitizer::new(dbsecrets_mongodbatlas::MongoDbAtlas::new());
//! serve(Arc::new(plugin), ServeOptions::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod database;
pub mod digest;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{
        AtlasConnector, DatabaseUser, DatabaseUsersApi, HttpAtlasConnector, Role, Scope,
    };
    pub use crate::config::AtlasConfig;
    pub use crate::database::{
        AtlasClientFactory, CreationStatement, MongoDbAtlas, RevocationStatement,
    };
    pub use crate::digest::DigestChallenge;
}

pub use client::{AtlasConnector, DatabaseUsersApi};
pub use config::AtlasConfig;
pub use database::MongoDbAtlas;
