//! keywarden - Main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keywarden::{
    cli::{run_device_command, run_status, Cli, Command},
    config::Config,
    elevation::ElevationEngine,
    gateway::{GatewayConfig, GatewayRpcClient},
    vault::{CredentialVault, VaultCrypto},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keywarden=info")),
        )
        .init();

    // keygen needs no configuration at all
    if let Some(Command::Keygen) = &cli.command {
        println!("{}", keywarden::vault::generate_master_key_hex());
        return Ok(());
    }

    let config = Config::from_env()?;

    match cli.command {
        Some(Command::Status) => return run_status(&config),
        Some(Command::Device(device_cmd)) => {
            return run_device_command(&config, device_cmd).await;
        }
        None | Some(Command::Run) | Some(Command::Keygen) => {}
    }

    tracing::info!("Starting keywarden sidecar...");

    let crypto = VaultCrypto::from_hex(config.store.master_key())?;
    let vault = Arc::new(CredentialVault::open(&config.store.path, crypto)?);
    tracing::info!(store = %config.store.path.display(), "Vault opened");

    let gateway = Arc::new(GatewayRpcClient::new(GatewayConfig::from_settings(
        &config.gateway,
    ))?);
    tracing::info!(device_id = %gateway.device_id(), "Device identity loaded");

    let engine = ElevationEngine::new(
        Arc::clone(&vault),
        Arc::clone(&gateway),
        &config.inject.env_file,
    );

    // Permanent secrets must be in place before the downstream process's
    // first health check; it reads the artifact itself while starting, so no
    // restart is requested here.
    if let Err(e) = engine.sync_on_startup().await {
        tracing::warn!(error = %e, "Startup secret sync incomplete");
    }

    if let Err(e) = gateway.connect().await {
        tracing::warn!(error = %e, "Initial gateway connect failed; retrying in background");
    }
    let reconnect = gateway.spawn_reconnect_loop();

    tracing::info!("keywarden running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    reconnect.abort();
    gateway.disconnect().await;
    Ok(())
}
