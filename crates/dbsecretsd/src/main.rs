//! dbsecretsd - database credential plugin host
//!
//! Usage:
//!   # Serve the PostgreSQL plugin on stdin/stdout
//!   dbsecretsd postgresql
//!
//!   # Debug logging and a shorter request deadline
//!   dbsecretsd neo4j --verbose --request-timeout 15s

use clap::Parser;
use dbsecrets_plugin::server::ServeOptions;
use dbsecretsd::{run, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = ServeOptions {
        request_timeout: cli.request_deadline(),
    };

    if let Err(e) = run(cli.plugin, tokio::io::stdin(), tokio::io::stdout(), options).await {
        tracing::error!(error = %e, "plugin host failed");
        std::process::exit(1);
    }

    Ok(())
}
