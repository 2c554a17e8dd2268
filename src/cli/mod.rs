//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the sidecar (`run`)
//! - Generating a master key (`keygen`)
//! - Inspecting vault state (`status`)
//! - Device pairing administration (`device list`, `device approve`, `device reject`)

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::gateway::{GatewayConfig, GatewayRpcClient};
use crate::vault::{CredentialVault, VaultCrypto};

#[derive(Parser, Debug)]
#[command(name = "keywarden")]
#[command(about = "Credential-custody sidecar for an autonomous agent gateway")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sidecar (default if no subcommand given)
    Run,

    /// Generate a fresh master key for KEYWARDEN_MASTER_KEY
    Keygen,

    /// Show vault counts and pending elevation requests
    Status,

    /// Manage gateway device pairing
    #[command(subcommand)]
    Device(DeviceCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum DeviceCommand {
    /// List devices known to the gateway
    List,
    /// Approve a pending pairing request
    Approve { request_id: String },
    /// Reject a pending pairing request
    Reject { request_id: String },
}

impl Cli {
    /// Check if we should run the sidecar (default behavior or explicit `run`).
    pub fn should_run_sidecar(&self) -> bool {
        matches!(self.command, None | Some(Command::Run))
    }
}

/// Print vault counts without starting the sidecar.
pub fn run_status(config: &Config) -> anyhow::Result<()> {
    let crypto = VaultCrypto::from_hex(config.store.master_key())?;
    let vault = CredentialVault::open(&config.store.path, crypto)?;

    let credentials = vault.list()?;
    println!("Store: {}", config.store.path.display());
    println!("Credentials: {}", credentials.len());
    for credential in &credentials {
        let gated = if credential.read_write.is_some() {
            "read + read-write"
        } else {
            "read only"
        };
        println!("  {} ({}) — {}", credential.service, credential.kind, gated);
    }

    let pending = vault.list_pending();
    println!("Pending elevation requests: {}", pending.len());
    for elevation in &pending {
        println!(
            "  {} {}/{} — {}",
            elevation.id, elevation.service, elevation.scope, elevation.reason
        );
    }
    Ok(())
}

/// Run one device-pairing operation over a fresh gateway session.
pub async fn run_device_command(config: &Config, command: DeviceCommand) -> anyhow::Result<()> {
    let client = GatewayRpcClient::new(GatewayConfig::from_settings(&config.gateway))?;
    client.connect().await?;

    match command {
        DeviceCommand::List => {
            let devices = client.list_devices().await?;
            if devices.is_empty() {
                println!("No devices known to the gateway");
            }
            for device in devices {
                println!(
                    "{}  {}  {}",
                    device.request_id.as_deref().unwrap_or("-"),
                    device.device_id.as_deref().unwrap_or("-"),
                    device.status.as_deref().unwrap_or("-"),
                );
            }
        }
        DeviceCommand::Approve { request_id } => {
            client.approve_device(&request_id).await?;
            println!("Approved pairing request {request_id}");
        }
        DeviceCommand::Reject { request_id } => {
            client.reject_device(&request_id).await?;
            println!("Rejected pairing request {request_id}");
        }
    }

    client.disconnect().await;
    Ok(())
}
