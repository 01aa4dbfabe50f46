//! Gateway binary: load configuration, connect upstreams, serve stdio.

use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use onemcp_proxy::{McpProxy, ProxyConfig};

#[derive(Parser)]
#[command(name = "onemcp-proxy", version, about = "MCP aggregation gateway")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // Stdout carries the MCP stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = ProxyConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let (proxy, startup_errors) = McpProxy::start(config).await?;
    for (server, error) in &startup_errors {
        warn!(server, "upstream failed to start: {error}");
    }
    info!(
        "gateway ready: {}",
        proxy.aggregator().get_capabilities_summary()
    );

    let serve = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.serve_stdio().await })
    };

    tokio::select! {
        result = serve => {
            result.context("serve task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    proxy.shutdown().await;
    Ok(())
}
