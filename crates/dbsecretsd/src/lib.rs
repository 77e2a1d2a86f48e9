//! # dbsecretsd
//!
//! Plugin host binary: serves one database credential plugin over
//! line-delimited JSON on stdin and stdout.
//!
//! Every plugin is wrapped in an [`ErrorSanitizer`] so no credential
//! reaches the host inside an error message.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cli;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use dbsecrets_plugin::prelude::*;
use dbsecrets_plugin::server::serve_io;

pub use cli::{Cli, PluginKind};

async fn serve_plugin<D, R, W>(db: D, reader: R, writer: W, options: ServeOptions) -> Result<()>
where
    D: Database + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_io(Arc::new(ErrorSanitizer::new(db)), reader, writer, options).await
}

/// Serve `kind` over the given streams until the reader reaches EOF
pub async fn run<R, W>(kind: PluginKind, reader: R, writer: W, options: ServeOptions) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match kind {
        PluginKind::Postgresql => serve_plugin(dbsecrets_sql::postgresql(), reader, writer, options).await,
        PluginKind::Redshift => serve_plugin(dbsecrets_sql::redshift(), reader, writer, options).await,
        PluginKind::Ysql => serve_plugin(dbsecrets_sql::ysql(), reader, writer, options).await,
        PluginKind::Mssql => serve_plugin(dbsecrets_sql::mssql(), reader, writer, options).await,
        PluginKind::Snowflake => serve_plugin(dbsecrets_sql::snowflake(), reader, writer, options).await,
        PluginKind::Neo4j => serve_plugin(dbsecrets_neo4j::Neo4j::new(), reader, writer, options).await,
        PluginKind::Redis => serve_plugin(dbsecrets_redis::Redis::new(), reader, writer, options).await,
        PluginKind::Elasticsearch => {
            serve_plugin(dbsecrets_elasticsearch::Elasticsearch::new(), reader, writer, options).await
        }
        PluginKind::Couchbase => {
            serve_plugin(dbsecrets_couchbase::Couchbase::new(), reader, writer, options).await
        }
        PluginKind::Mongodbatlas => {
            serve_plugin(dbsecrets_mongodbatlas::MongoDbAtlas::new(), reader, writer, options).await
        }
    }
}
