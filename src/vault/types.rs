//! Credential, elevation, and audit row types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a secret lands on the host side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InjectionTarget {
    /// A `KEY=value` line in the downstream env file.
    Env { var_name: String },
    /// A dotted path into the downstream structured config.
    Config { json_path: String },
}

impl InjectionTarget {
    /// The downstream key this target writes to. Two levels that share a key
    /// fall back seamlessly on downgrade.
    pub fn key(&self) -> &str {
        match self {
            Self::Env { var_name } => var_name,
            Self::Config { json_path } => json_path,
        }
    }
}

/// An extra co-injected secret (e.g. a session cookie next to a token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalField {
    pub name: String,
    pub injection: InjectionTarget,
    pub value: String,
}

/// One disclosure tier of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLevel {
    pub injection: InjectionTarget,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Upstream token lifetime. Distinct from any elevation TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Upper bound on elevations granted against this level, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_fields: Vec<AdditionalField>,
}

impl AccessLevel {
    pub fn new(injection: InjectionTarget, token: impl Into<String>) -> Self {
        Self {
            injection,
            token: token.into(),
            refresh_token: None,
            expires_at: None,
            max_ttl_secs: None,
            additional_fields: Vec::new(),
        }
    }

    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn max_ttl(&self) -> Option<Duration> {
        self.max_ttl_secs.map(Duration::from_secs)
    }

    /// Copy with all secret material removed.
    pub fn redacted(&self) -> Self {
        Self {
            injection: self.injection.clone(),
            token: String::new(),
            refresh_token: None,
            expires_at: self.expires_at,
            max_ttl_secs: self.max_ttl_secs,
            additional_fields: self
                .additional_fields
                .iter()
                .map(|f| AdditionalField {
                    name: f.name.clone(),
                    injection: f.injection.clone(),
                    value: String::new(),
                })
                .collect(),
        }
    }
}

/// One stored credential: a permanent `read` tier plus an optional
/// elevation-gated `read_write` tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: Uuid,
    pub service: String,
    pub display_name: String,
    /// Service credential shape: "oauth2", "token", "api_key", ...
    pub kind: String,
    pub read: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write: Option<AccessLevel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        service: impl Into<String>,
        display_name: impl Into<String>,
        kind: impl Into<String>,
        read: AccessLevel,
        read_write: Option<AccessLevel>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service: service.into(),
            display_name: display_name.into(),
            kind: kind.into(),
            read,
            read_write,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy with token material stripped from both levels.
    pub fn redacted(&self) -> Self {
        Self {
            read: self.read.redacted(),
            read_write: self.read_write.as_ref().map(AccessLevel::redacted),
            ..self.clone()
        }
    }
}

// ── Encrypted blob encodings ─────────────────────────────────────

/// The current encrypted payload: the `{read, readWrite}` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SecretPair {
    pub read: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write: Option<AccessLevel>,
}

/// A scope row in the legacy flat encoding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LegacyScope {
    pub injection: InjectionTarget,
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_ttl_secs: Option<u64>,
    /// Legacy permanence flag; a permanent scope never required approval.
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub requires_approval: bool,
}

/// Decodes either the current pair or the legacy flat map of named scopes.
/// The legacy shape never escapes the store's read path.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum StoredSecrets {
    Current(SecretPair),
    Legacy(BTreeMap<String, LegacyScope>),
}

impl StoredSecrets {
    /// Project onto the canonical `{read, read_write}` model. Scopes that do
    /// not require approval become `read`; approval-gated scopes become
    /// `read_write`. Returns `None` when no permanent scope exists (such a
    /// record was never valid).
    pub(crate) fn into_pair(self) -> Option<SecretPair> {
        match self {
            Self::Current(pair) => Some(pair),
            Self::Legacy(scopes) => {
                let mut read = None;
                let mut read_write = None;
                for (_, scope) in scopes {
                    let level = AccessLevel {
                        injection: scope.injection,
                        token: scope.token,
                        refresh_token: scope.refresh_token,
                        expires_at: scope.expires_at,
                        max_ttl_secs: scope.max_ttl_secs,
                        additional_fields: Vec::new(),
                    };
                    if scope.requires_approval && !scope.permanent {
                        read_write.get_or_insert(level);
                    } else {
                        read.get_or_insert(level);
                    }
                }
                Some(SecretPair {
                    read: read?,
                    read_write,
                })
            }
        }
    }
}

// ── Elevations ───────────────────────────────────────────────────

/// Lifecycle state of an elevation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Revoked,
}

impl ElevationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Expired | Self::Revoked)
    }
}

impl std::fmt::Display for ElevationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        };
        write!(f, "{s}")
    }
}

/// One access request row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Elevation {
    pub id: Uuid,
    pub service: String,
    /// Logical access-level name, e.g. "write".
    pub scope: String,
    pub reason: String,
    pub status: ElevationStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Elevation {
    /// An elevation the agent may currently read from: approved with a
    /// strictly-future deadline.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ElevationStatus::Approved
            && self.expires_at.map(|e| e > now).unwrap_or(false)
    }
}

// ── Audit ────────────────────────────────────────────────────────

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditActor {
    Agent,
    Admin,
    System,
}

impl std::fmt::Display for AuditActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Admin => "admin",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

/// Append-only record of a state transition or secret disclosure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub details: String,
    pub actor: AuditActor,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, actor: AuditActor, details: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            service: None,
            scope: None,
            details: details.into(),
            actor,
            timestamp: Utc::now(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_target(name: &str) -> InjectionTarget {
        InjectionTarget::Env {
            var_name: name.to_string(),
        }
    }

    #[test]
    fn test_injection_target_serde_tagged() {
        let t = env_target("GMAIL_TOKEN");
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"], "env");
        assert_eq!(json["varName"], "GMAIL_TOKEN");

        let c = InjectionTarget::Config {
            json_path: "channels.gmail.token".to_string(),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["kind"], "config");
        assert_eq!(json["jsonPath"], "channels.gmail.token");
    }

    #[test]
    fn test_redacted_strips_tokens() {
        let mut level = AccessLevel::new(env_target("T"), "secret");
        level.refresh_token = Some("refresh".into());
        level.additional_fields.push(AdditionalField {
            name: "cookie".into(),
            injection: env_target("C"),
            value: "session".into(),
        });

        let red = level.redacted();
        assert!(red.token.is_empty());
        assert!(red.refresh_token.is_none());
        assert!(red.additional_fields[0].value.is_empty());
        // Non-secret shape survives
        assert_eq!(red.injection, level.injection);
        assert_eq!(red.additional_fields[0].name, "cookie");
    }

    #[test]
    fn test_stored_secrets_current_decode() {
        let json = serde_json::json!({
            "read": { "injection": { "kind": "env", "varName": "A" }, "token": "r1" },
            "readWrite": { "injection": { "kind": "env", "varName": "A" }, "token": "w1", "maxTtlSecs": 3600 }
        });
        let decoded: StoredSecrets = serde_json::from_value(json).unwrap();
        let pair = decoded.into_pair().unwrap();
        assert_eq!(pair.read.token, "r1");
        assert_eq!(pair.read_write.unwrap().max_ttl_secs, Some(3600));
    }

    #[test]
    fn test_stored_secrets_legacy_projection() {
        let json = serde_json::json!({
            "default": {
                "injection": { "kind": "env", "varName": "A" },
                "token": "r1",
                "permanent": true
            },
            "write": {
                "injection": { "kind": "env", "varName": "A" },
                "token": "w1",
                "requiresApproval": true,
                "maxTtlSecs": 1800
            }
        });
        let decoded: StoredSecrets = serde_json::from_value(json).unwrap();
        assert!(matches!(decoded, StoredSecrets::Legacy(_)));
        let pair = decoded.into_pair().unwrap();
        assert_eq!(pair.read.token, "r1");
        let rw = pair.read_write.unwrap();
        assert_eq!(rw.token, "w1");
        assert_eq!(rw.max_ttl_secs, Some(1800));
    }

    #[test]
    fn test_stored_secrets_legacy_without_permanent_scope_is_invalid() {
        let json = serde_json::json!({
            "write": {
                "injection": { "kind": "env", "varName": "A" },
                "token": "w1",
                "requiresApproval": true
            }
        });
        let decoded: StoredSecrets = serde_json::from_value(json).unwrap();
        assert!(decoded.into_pair().is_none());
    }

    #[test]
    fn test_elevation_active_window() {
        let now = Utc::now();
        let mut e = Elevation {
            id: Uuid::new_v4(),
            service: "gmail".into(),
            scope: "write".into(),
            reason: "send mail".into(),
            status: ElevationStatus::Approved,
            requested_at: now,
            approved_at: Some(now),
            approved_by: Some("alice".into()),
            expires_at: Some(now + chrono::Duration::minutes(30)),
        };
        assert!(e.is_active_at(now));
        assert!(!e.is_active_at(now + chrono::Duration::minutes(31)));

        e.status = ElevationStatus::Revoked;
        assert!(!e.is_active_at(now));
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ElevationStatus::Pending.is_terminal());
        assert!(!ElevationStatus::Approved.is_terminal());
        assert!(ElevationStatus::Denied.is_terminal());
        assert!(ElevationStatus::Expired.is_terminal());
        assert!(ElevationStatus::Revoked.is_terminal());
    }
}
