//! Authenticated WebSocket RPC session with the downstream gateway.
//!
//! The gateway speaks a JSON frame protocol (`req`/`res`/`event`) over a
//! single WebSocket. Connecting requires answering a `connect.challenge`
//! nonce, optionally signed with this host's persistent Ed25519 device
//! identity. Unknown devices land in a pending-pairing queue on the gateway
//! side until an operator approves them.

mod client;
mod device;
mod protocol;

pub use client::{ConnectionStatus, GatewayConfig, GatewayRpcClient, PairedDevice};
pub use device::DeviceIdentity;
pub use protocol::{
    classify_call_error, ConfigPatchParams, ConnectParams, ErrorBody, Frame, FrameKind,
    DEFAULT_RETRY_AFTER,
};

use std::time::Duration;

/// Error from gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Not connected to the gateway")]
    NotConnected,

    #[error("Handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    #[error("Gateway closed the connection during the handshake")]
    HandshakeClosed,

    #[error("Connect rejected: {0}")]
    ConnectRejected(String),

    #[error("This device is not paired with the gateway yet")]
    PairingRequired,

    #[error("Gateway rejected the shared-secret token")]
    TokenMismatch,

    #[error("Call to {method} timed out")]
    CallTimeout { method: String },

    #[error("Gateway rate limited the request; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Gateway config file is locked; resolve the lock before retrying")]
    ConfigLocked,

    #[error("Gateway restart is unavailable (method unknown or disabled)")]
    RestartDisabled,

    #[error("Gateway error on {method}: {message}")]
    Remote { method: String, message: String },

    #[error("Malformed gateway response on {method}: {message}")]
    MalformedResponse { method: String, message: String },

    #[error("Device identity error: {0}")]
    DeviceIdentity(String),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
