use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ccg_rust::config::Config;
use ccg_rust::stats::{MemoryStatsStorage, StatsStorage};
use ccg_rust::Gateway;

#[derive(Parser)]
#[command(name = "ccg-rust")]
#[command(about = "Protocol-translating failover gateway for Claude, OpenAI and Gemini backends", long_about = None)]
struct Cli {
    /// Path to the gateway config file
    #[arg(short, long, env = "CCG_CONFIG", default_value = "~/.ccg/config.json")]
    config: String,

    /// Server host (overrides HOST in the config file)
    #[arg(long, env = "CCG_HOST")]
    host: Option<String>,

    /// Server port (overrides PORT in the config file)
    #[arg(short, long, env = "CCG_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ccg_rust=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = Config::from_file(&config_path)?;
    tracing::info!("Loaded config from {}", config_path);
    tracing::info!(
        "Endpoints: {:?}",
        config
            .endpoints()
            .iter()
            .map(|e| format!("{} ({})", e.name, e.protocol))
            .collect::<Vec<_>>()
    );

    let host = cli.host.unwrap_or_else(|| config.host().to_string());
    let port = cli.port.unwrap_or(config.port());
    let flush_interval = config.stats_flush_interval();
    match flush_interval {
        Some(interval) => tracing::info!(
            "Stats flush interval: {}",
            humantime::format_duration(interval)
        ),
        None => tracing::info!("Periodic stats flush disabled; flushing at shutdown only"),
    }

    let storage: Arc<dyn StatsStorage> = Arc::new(MemoryStatsStorage::new());
    let gateway = Gateway::new(config, Some(storage))?;
    let app = gateway.router();

    let shutdown = CancellationToken::new();
    let flusher = flush_interval.map(|interval| {
        let gateway = gateway.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = gateway.flush_stats() {
                            tracing::warn!(error = %e, "periodic stats flush failed");
                        }
                    }
                }
            }
        })
    });

    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    tracing::info!(
        "CCG-Rust {} ({}) listening on {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT"),
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received, draining connections");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(flusher) = flusher {
        let _ = flusher.await;
    }
    match gateway.flush_stats() {
        Ok(rows) => tracing::info!(rows, "final stats flush"),
        Err(e) => tracing::warn!(error = %e, "final stats flush failed"),
    }

    Ok(())
}
