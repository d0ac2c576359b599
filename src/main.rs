//! runner-forge daemon entry point.
//!
//! Startup sequence: load configuration, construct the GitHub client,
//! connect to Incus, then serve the webhook endpoint until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use runner_forge::api;
use runner_forge::config::Config;
use runner_forge::github::GithubClient;
use runner_forge::incus::api::IncusClient;
use runner_forge::incus::provision::Provisioner;
use runner_forge::state::AppState;

/// GitHub Actions to Incus ephemeral runner bridge.
#[derive(Debug, Parser)]
#[command(name = "runner-forge", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "FORGE_CONFIG")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runner-forge");

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.daemon.listen = listen;
    }
    info!(
        listen = %config.daemon.listen,
        incus = %config.incus.server.url,
        project = %config.incus.project,
        "Configuration loaded"
    );

    let github = GithubClient::new(&config.github.api_url, &config.github.token);

    let incus = IncusClient::connect(&config.incus).context("failed to connect to Incus")?;
    let provisioner = Provisioner::new(Arc::new(incus));

    let listen = config.daemon.listen.clone();
    let state = AppState::new(config, github, provisioner);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "Listening for webhook deliveries");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("runner-forge shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}
