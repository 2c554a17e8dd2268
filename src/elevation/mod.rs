//! The elevation workflow: time-bounded grants of read-write secrets.
//!
//! Only this module may grant, downgrade, or revoke a read-write secret, and
//! only it arms or disarms expiry timers. Every transition for a given
//! `service:scope` key is serialized by one mutex, so approve, revoke, and
//! expiry can never interleave for the same grant.

mod engine;

pub use engine::{ElevationEngine, PutOutcome};

use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::inject::InjectError;
use crate::vault::{ElevationStatus, VaultError};

/// Error from elevation operations.
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("No credential stored for service: {0}")]
    UnknownService(String),

    #[error("Credential {service} has no read-write access level for scope {scope}")]
    NoSuchLevel { service: String, scope: String },

    #[error("Elevation {id} is not pending (status: {status})")]
    NotPending { id: Uuid, status: ElevationStatus },

    #[error("No active elevation for {service}/{scope}")]
    NoActiveElevation { service: String, scope: String },

    #[error("Requested TTL is out of range")]
    InvalidTtl,

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Inject(#[from] InjectError),
}
