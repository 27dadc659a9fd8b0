//! VPN fleet panel binary

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vpn_api::{app, AppState, PanelConfig};
use vpn_registry::spawn_enforcer;

#[derive(Parser, Debug)]
#[clap(
    name = "vpn-panel",
    version,
    about = "Control plane for a fleet of Xray VPN nodes"
)]
struct Args {
    /// TOML config file (falls back to VPN_PANEL_CONFIG)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Override the bind port
    #[clap(short, long)]
    port: Option<u16>,

    /// Emit JSON logs
    #[clap(long)]
    json_logs: bool,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {}", e);
        }
    }

    let args = Args::parse();
    let mut config = PanelConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config.log.level, config.log.json || args.json_logs);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting VPN fleet panel");
    if config.auth.uses_default_secret() {
        warn!("Using the built-in JWT secret; set VPN_PANEL_JWT_SECRET in production");
    }

    let state = AppState::from_config(&config)
        .await
        .context("initializing panel state")?;

    let enforcer = (config.quota.enforce_interval_secs > 0).then(|| {
        spawn_enforcer(
            Arc::clone(state.registry()),
            Duration::from_secs(config.quota.enforce_interval_secs),
        )
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("parsing bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!(%bind_addr, "Panel listening");

    axum::serve(listener, app(state, &config.server.cors_origins))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = enforcer {
        handle.abort();
    }
    info!("Panel stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
