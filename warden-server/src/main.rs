//! # Warden Server
//!
//! Self-hosted supervisor for watching Twitch channels and capturing
//! their live broadcasts. This crate is the thin HTTP surface over the
//! engine in `warden-core`: a JSON API for the roster and recorder
//! controls, plus an SSE stream mirroring state changes to UI clients.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden_core::Config;
use warden_core::recorder::StreamlinkExtractor;
use warden_core::roster::RosterStore;
use warden_core::supervisor::Supervisor;
use warden_core::token::TokenManager;
use warden_core::upstream::UpstreamClient;
use warden_server::{AppState, routes};

/// Command line arguments for the Warden server
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Self-hosted Twitch stream watcher and recorder")]
struct Args {
    /// Bind host (overrides config)
    #[arg(long, env = "WARDEN_HOST")]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long, env = "WARDEN_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    config.ensure_directories()?;

    let api = Arc::new(UpstreamClient::new(&config)?);
    let tokens = Arc::new(TokenManager::new(&config)?);
    let roster = Arc::new(RosterStore::load(&config).await);
    let extractor = Arc::new(StreamlinkExtractor::new(config.streamlink_path.clone()));

    let supervisor = Supervisor::new(&config, api, tokens, roster, extractor);
    supervisor.start().await;

    let state = AppState {
        supervisor: supervisor.clone(),
    };
    let app = routes::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "warden listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
