//! MCP instrumenting reverse proxy.
//!
//! Forwards MCP traffic (SSE, streamable HTTP, OpenAPI passthrough, raw
//! WebSocket) to an upstream server while correlating JSON-RPC tool calls
//! with their asynchronous results and shipping spans to an analytics ingest
//! endpoint.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_trace_proxy::config::{load_config, watch_config};
use mcp_trace_proxy::runtime::ProxyRuntime;
use mcp_trace_proxy::telemetry::TelemetryClientOptions;

#[derive(Parser, Debug)]
#[command(name = "mcp-trace-proxy", about = "MCP instrumenting reverse proxy")]
struct Cli {
    /// Path to the listener configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Analytics server base URL, e.g. http://localhost:4000
    #[arg(long)]
    server_url: String,

    /// Reload the configuration when the file changes.
    #[arg(long)]
    hot_reload: bool,

    /// Telemetry source id.
    #[arg(long, default_value = "mcp-studio-proxy")]
    source_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_trace_proxy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(
        config = %cli.config.display(),
        server_url = %cli.server_url,
        hot_reload = cli.hot_reload,
        "mcp-trace-proxy starting"
    );

    let mut runtime = ProxyRuntime::new(TelemetryClientOptions::new(
        cli.server_url.clone(),
        cli.source_id.clone(),
    ))?;

    let config = load_config(&cli.config)?;
    runtime.apply_config(config).await;

    // keep the watcher alive for the lifetime of the process
    let mut watcher_guard = None;
    let mut updates = None;
    if cli.hot_reload {
        let (watcher, rx) = watch_config(&cli.config)?;
        watcher_guard = Some(watcher);
        updates = Some(rx);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            update = recv_update(&mut updates) => {
                match update {
                    Some(new_config) => {
                        tracing::info!("applying reloaded configuration");
                        runtime.apply_config(new_config).await;
                    }
                    // watcher channel closed; stop polling it
                    None => updates = None,
                }
            }
        }
    }

    drop(watcher_guard);
    runtime.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn recv_update(
    updates: &mut Option<tokio::sync::mpsc::UnboundedReceiver<mcp_trace_proxy::ProxyConfig>>,
) -> Option<mcp_trace_proxy::ProxyConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
