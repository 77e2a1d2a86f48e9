//! # dbsecrets-neo4j
//!
//! Neo4j credential plugin.
//!
//! Users are managed with Cypher administration commands against the
//! `system` database. Creation statements are free-form Cypher; the values
//! `name`, `username`, `password` and `expiration` are both substituted into
//! `{{...}}` placeholders and bound as native `$` parameters.
//!
//! ## Features
//!
//! - **Transactional statements** retried on `Neo.TransientError.*` codes
//!   within `max_transaction_retry_time`
//! - **Auto-commit fallback** when the server refuses an administration
//!   command inside an explicit transaction
//! - **Rollback statements** (default `DROP USER $username`) when the
//!   fallback itself fails
//! - **Root rotation**: changing the admin password reconnects with it
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbsecrets_plugin::prelude::*;
//!
//! let plugin = ErrorSanitizer::new(dbsecrets_neo4j::Neo4j::new());
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
    pub use crate::client::{CypherClient, CypherTransaction, Neo4jConnector, Neo4rsConnector};
    pub use crate::config::Neo4jConfig;
    pub use crate::database::{Neo4j, Neo4jClientFactory};
}

pub use client::{CypherClient, CypherTransaction, Neo4jConnector};
pub use config::Neo4jConfig;
pub use database::Neo4j;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use dbsecrets_plugin::Database;

    #[test]
    fn test_prelude_imports() {
        let plugin = Neo4j::new();
        assert_eq!(plugin.plugin_type(), "neo4j");
        let _connector = Neo4rsConnector;
    }
}
