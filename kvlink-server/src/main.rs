//! KVLink reference server binary.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kvlink_server::{Server, ServerConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// In-memory RESP server for exercising kvlink clients
#[derive(Parser, Debug)]
#[command(name = "kvlink-server")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    addr: String,

    /// Require clients to authenticate with this password
    #[arg(short, long)]
    password: Option<String>,

    /// Interval between expired-key purge passes, in milliseconds
    #[arg(long, default_value = "100")]
    purge_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = ServerConfig {
        addr: args.addr,
        password: args.password,
        purge_interval: Duration::from_millis(args.purge_interval_ms),
    };

    let server = Server::bind(&config)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("received Ctrl+C, shutting down"),
                Err(err) => {
                    tracing::warn!(error = %err, "cannot listen for Ctrl+C");
                    std::future::pending::<()>().await
                }
            }
        })
        .await?;
    Ok(())
}
