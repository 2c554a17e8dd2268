//! Gateway wire frames and error-text classification.
//!
//! Frames are JSON objects over the WebSocket:
//! `{type: "req"|"res"|"event", id?, method?, params?, event?, payload?,
//!  ok?, error?: {code, message}}`.
//!
//! The gateway reports failures as free text, so downstream-policy errors
//! (rate limits, config file locks, disabled restart) are detected by
//! substring. Those markers are a versioned contract with the gateway and
//! are pinned by the fixture tests at the bottom of this file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::GatewayError;

/// Protocol version bounds this client speaks.
pub const PROTOCOL_MIN: u32 = 1;
pub const PROTOCOL_MAX: u32 = 3;

/// Correlation id reserved for the `connect` request. Subsequent requests
/// count upward from 1.
pub const CONNECT_ID: &str = "0";

/// Fallback when a rate-limit message carries no parsable retry-after.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Req,
    Res,
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// One frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: FrameKind::Req,
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            event: None,
            payload: None,
            ok: None,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok == Some(true)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }
}

// ── connect parameters ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParams {
    pub id: String,
    /// base64url, unpadded.
    pub public_key: String,
    /// base64url, unpadded.
    pub signature: String,
    /// Milliseconds since the epoch.
    pub signed_at: i64,
    /// The server's single-use challenge nonce, echoed back.
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceParams>,
}

// ── config.patch parameters ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatchParams {
    /// JSON5 text of the patch body (plain JSON is valid JSON5).
    pub raw: String,
    /// Content hash the patch was computed against.
    pub base_hash: String,
    pub note: String,
    pub restart_delay_ms: u64,
}

// ── error-text classification ────────────────────────────────────

/// How a rejected `connect` should be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRejection {
    NeedsPairing { request_id: Option<String> },
    TokenMismatch,
    Other(String),
}

/// Classify a non-ok `connect` response.
pub fn classify_connect_error(message: &str, payload: Option<&serde_json::Value>) -> ConnectRejection {
    let lower = message.to_lowercase();
    if lower.contains("pairing") || lower.contains("pending approval") {
        let request_id = payload
            .and_then(|p| p.get("requestId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        ConnectRejection::NeedsPairing { request_id }
    } else if lower.contains("token mismatch") || lower.contains("invalid token") {
        ConnectRejection::TokenMismatch
    } else {
        ConnectRejection::Other(message.to_string())
    }
}

/// Classify a non-ok response to any post-connect call.
pub fn classify_call_error(method: &str, message: &str) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        return GatewayError::RateLimited {
            retry_after: parse_retry_after(&lower).unwrap_or(DEFAULT_RETRY_AFTER),
        };
    }
    if lower.contains("lock") {
        // "config file is locked" and friends. A lock is a persistent
        // condition; retrying only burns rate-limit budget.
        return GatewayError::ConfigLocked;
    }
    if lower.contains("unknown method") || (lower.contains("restart") && lower.contains("disabled")) {
        return GatewayError::RestartDisabled;
    }
    GatewayError::Remote {
        method: method.to_string(),
        message: message.to_string(),
    }
}

/// Pull a retry-after duration out of a rate-limit message. Understands
/// "retry after 30s", "retry in 1500ms", and bare "... 30 seconds".
fn parse_retry_after(lower: &str) -> Option<Duration> {
    let digits_at = lower.find(|c: char| c.is_ascii_digit())?;
    let rest = &lower[digits_at..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: u64 = digits.parse().ok()?;
    let tail = rest[digits.len()..].trim_start();
    if tail.starts_with("ms") || tail.starts_with("millis") {
        Some(Duration::from_millis(value))
    } else {
        Some(Duration::from_secs(value))
    }
}
