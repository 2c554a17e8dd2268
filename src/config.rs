//! Configuration for the keywarden sidecar.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Main configuration for the sidecar.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub gateway: GatewaySettings,
    pub inject: InjectConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let data_dir = data_dir()?;
        Ok(Self {
            store: StoreConfig::from_env(&data_dir)?,
            gateway: GatewaySettings::from_env(&data_dir)?,
            inject: InjectConfig::from_env(&data_dir)?,
        })
    }
}

fn data_dir() -> Result<PathBuf, ConfigError> {
    Ok(match optional_env("KEYWARDEN_DATA_DIR")? {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keywarden"),
    })
}

/// Encrypted store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// 64 hex chars (32 bytes). Generate one with `keywarden keygen`.
    pub master_key: SecretString,
}

impl StoreConfig {
    fn from_env(data_dir: &std::path::Path) -> Result<Self, ConfigError> {
        Ok(Self {
            path: optional_env("KEYWARDEN_STORE_PATH")?
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("store.json")),
            master_key: SecretString::from(required_env("KEYWARDEN_MASTER_KEY")?),
        })
    }

    /// Get the master key hex string (exposes the secret).
    pub fn master_key(&self) -> &str {
        self.master_key.expose_secret()
    }
}

/// Downstream gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// WebSocket control endpoint, e.g. `ws://127.0.0.1:18789`.
    pub url: String,
    /// Shared-secret token, if the gateway requires one.
    pub token: Option<SecretString>,
    /// Where the Ed25519 device seed lives.
    pub device_key_path: PathBuf,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl GatewaySettings {
    fn from_env(data_dir: &std::path::Path) -> Result<Self, ConfigError> {
        Ok(Self {
            url: optional_env("GATEWAY_WS_URL")?
                .unwrap_or_else(|| "ws://127.0.0.1:18789".to_string()),
            token: optional_env("GATEWAY_TOKEN")?.map(SecretString::from),
            device_key_path: optional_env("KEYWARDEN_DEVICE_KEY")?
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("device.key")),
            reconnect_interval: Duration::from_secs(parse_optional_env(
                "GATEWAY_RECONNECT_SECS",
                5,
            )?),
            max_reconnect_attempts: parse_optional_env("GATEWAY_RECONNECT_ATTEMPTS", 60)?,
        })
    }

    /// Get the shared-secret token (exposes the secret).
    pub fn token(&self) -> Option<String> {
        self.token.as_ref().map(|t| t.expose_secret().to_string())
    }
}

/// Secret injection targets on the host side.
#[derive(Debug, Clone)]
pub struct InjectConfig {
    /// Environment file consumed by the downstream process.
    pub env_file: PathBuf,
}

impl InjectConfig {
    fn from_env(data_dir: &std::path::Path) -> Result<Self, ConfigError> {
        Ok(Self {
            env_file: optional_env("KEYWARDEN_ENV_FILE")?
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("agent.env")),
        })
    }
}

// Helper functions

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
