//! Encrypted credential storage and the elevation/audit ledger.
//!
//! This module provides:
//! - AES-256-GCM encrypted credential rows (one blob per service)
//! - Plaintext elevation and audit rows (no secret material)
//! - Backward-compatible reads of the legacy flat-scopes encoding
//!
//! # Security Model
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       Credential at rest                        │
//! │                                                                 │
//! │  metadata (service, displayName, kind, timestamps)  plaintext   │
//! │  {read, readWrite} access levels ──► serialize ──► AES-256-GCM  │
//! │                                      nonce ‖ ciphertext+tag     │
//! │                                                                 │
//! │  Elevations and audit entries never contain token material.    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The master key comes from `KEYWARDEN_MASTER_KEY` (64 hex chars); generate
//! one with `keywarden keygen`.

mod crypto;
mod store;
mod types;

pub use crypto::{generate_master_key_hex, VaultCrypto};
pub use store::CredentialVault;
pub use types::{
    AccessLevel, AdditionalField, AuditActor, AuditEntry, Credential, Elevation, ElevationStatus,
    InjectionTarget,
};

/// Error from vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Master key must be 32 bytes, got {got}")]
    BadKeyLength { got: usize },

    #[error("Master key is not valid hex: {0}")]
    BadKeyEncoding(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: ciphertext tampered, corrupted, or wrong master key")]
    Decrypt,

    #[error("No credential stored for service: {0}")]
    NotFound(String),

    #[error("No elevation with id: {0}")]
    ElevationNotFound(uuid::Uuid),

    #[error("Invalid stored record for {service}: {message}")]
    InvalidRecord { service: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
