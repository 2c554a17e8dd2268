//! Shared error types for configuration and bootstrap.
//!
//! Domain errors live next to their subsystems (`VaultError`,
//! `ElevationError`, `GatewayError`, `InjectError`); this module only carries
//! the configuration errors the binary layer reports before any subsystem
//! exists.

/// Error loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read environment: {0}")]
    ParseError(String),
}
