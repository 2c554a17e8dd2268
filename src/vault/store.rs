//! File-backed credential vault.
//!
//! One versioned JSON document holds credential rows (metadata plaintext,
//! secrets as one encrypted blob each), elevation rows, and the audit ledger.
//! A single reader/writer lock guards the in-memory document; every mutation
//! rewrites the file atomically with owner-only permissions.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vault::crypto::VaultCrypto;
use crate::vault::types::{
    AuditEntry, Credential, Elevation, ElevationStatus, SecretPair, StoredSecrets,
};
use crate::vault::VaultError;

const STORE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRow {
    id: Uuid,
    service: String,
    display_name: String,
    kind: String,
    /// base64 of `nonce || ciphertext+tag` over the serialized access levels.
    secrets: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u8,
    credentials: Vec<CredentialRow>,
    elevations: Vec<Elevation>,
    audit: Vec<AuditEntry>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            credentials: Vec::new(),
            elevations: Vec::new(),
            audit: Vec::new(),
        }
    }
}

/// Durable, encrypted storage for credentials, elevations, and audit entries.
pub struct CredentialVault {
    path: PathBuf,
    crypto: VaultCrypto,
    inner: RwLock<StoreFile>,
}

impl CredentialVault {
    /// Open (or create) the store file at `path`.
    pub fn open(path: impl Into<PathBuf>, crypto: VaultCrypto) -> Result<Self, VaultError> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            crypto,
            inner: RwLock::new(doc),
        })
    }

    // Lock helpers. A poisoned lock only means another thread panicked
    // mid-operation; the document itself is last-write-consistent.
    fn read_lock(&self) -> RwLockReadGuard<'_, StoreFile> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, StoreFile> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Credentials ──────────────────────────────────────────────

    /// Upsert a credential by service name. Returns the stored row (with the
    /// original id/created_at preserved on update).
    pub fn put(&self, mut credential: Credential) -> Result<Credential, VaultError> {
        let mut doc = self.write_lock();

        credential.updated_at = Utc::now();
        if let Some(existing) = doc
            .credentials
            .iter()
            .find(|r| r.service == credential.service)
        {
            credential.id = existing.id;
            credential.created_at = existing.created_at;
        }

        let pair = SecretPair {
            read: credential.read.clone(),
            read_write: credential.read_write.clone(),
        };
        let plaintext = serde_json::to_vec(&pair)?;
        let blob = self.crypto.encrypt(&plaintext)?;

        let row = CredentialRow {
            id: credential.id,
            service: credential.service.clone(),
            display_name: credential.display_name.clone(),
            kind: credential.kind.clone(),
            secrets: BASE64.encode(blob),
            created_at: credential.created_at,
            updated_at: credential.updated_at,
        };

        match doc
            .credentials
            .iter_mut()
            .find(|r| r.service == row.service)
        {
            Some(slot) => *slot = row,
            None => doc.credentials.push(row),
        }

        self.persist(&doc)?;
        Ok(credential)
    }

    /// Fetch and decrypt one credential.
    pub fn get(&self, service: &str) -> Result<Credential, VaultError> {
        let doc = self.read_lock();
        let row = doc
            .credentials
            .iter()
            .find(|r| r.service == service)
            .ok_or_else(|| VaultError::NotFound(service.to_string()))?;
        self.decode_row(row)
    }

    /// List all credentials with secret material stripped.
    pub fn list(&self) -> Result<Vec<Credential>, VaultError> {
        let doc = self.read_lock();
        doc.credentials
            .iter()
            .map(|row| self.decode_row(row).map(|c| c.redacted()))
            .collect()
    }

    /// Service names of every stored credential.
    pub fn services(&self) -> Vec<String> {
        self.read_lock()
            .credentials
            .iter()
            .map(|r| r.service.clone())
            .collect()
    }

    /// Remove a credential row. Does not touch any downstream artifact.
    pub fn delete(&self, service: &str) -> Result<(), VaultError> {
        let mut doc = self.write_lock();
        let before = doc.credentials.len();
        doc.credentials.retain(|r| r.service != service);
        if doc.credentials.len() == before {
            return Err(VaultError::NotFound(service.to_string()));
        }
        self.persist(&doc)
    }

    fn decode_row(&self, row: &CredentialRow) -> Result<Credential, VaultError> {
        let blob = BASE64
            .decode(&row.secrets)
            .map_err(|e| VaultError::InvalidRecord {
                service: row.service.clone(),
                message: format!("secrets blob is not base64: {e}"),
            })?;
        let plaintext = self.crypto.decrypt(&blob)?;
        let stored: StoredSecrets = serde_json::from_slice(&plaintext)?;
        let pair = stored.into_pair().ok_or_else(|| VaultError::InvalidRecord {
            service: row.service.clone(),
            message: "no permanent access level".to_string(),
        })?;

        Ok(Credential {
            id: row.id,
            service: row.service.clone(),
            display_name: row.display_name.clone(),
            kind: row.kind.clone(),
            read: pair.read,
            read_write: pair.read_write,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    // ── Elevations ───────────────────────────────────────────────

    /// Create a new pending elevation row.
    pub fn create_elevation(
        &self,
        service: &str,
        scope: &str,
        reason: &str,
    ) -> Result<Elevation, VaultError> {
        let elevation = Elevation {
            id: Uuid::new_v4(),
            service: service.to_string(),
            scope: scope.to_string(),
            reason: reason.to_string(),
            status: ElevationStatus::Pending,
            requested_at: Utc::now(),
            approved_at: None,
            approved_by: None,
            expires_at: None,
        };
        let mut doc = self.write_lock();
        doc.elevations.push(elevation.clone());
        self.persist(&doc)?;
        Ok(elevation)
    }

    pub fn get_elevation(&self, id: Uuid) -> Result<Elevation, VaultError> {
        self.read_lock()
            .elevations
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(VaultError::ElevationNotFound(id))
    }

    /// The newest approved elevation for `(service, scope)` whose deadline is
    /// still in the future, if any.
    pub fn active_elevation(
        &self,
        service: &str,
        scope: &str,
    ) -> Result<Option<Elevation>, VaultError> {
        let now = Utc::now();
        Ok(self
            .read_lock()
            .elevations
            .iter()
            .filter(|e| e.service == service && e.scope == scope && e.is_active_at(now))
            .max_by_key(|e| e.approved_at.unwrap_or(e.requested_at))
            .cloned())
    }

    /// Assign a new status. `approved_by` and `expires_at` are written as
    /// given (pass `None` to clear them, e.g. when rolling back to pending);
    /// `approved_at` tracks the status.
    pub fn update_elevation_status(
        &self,
        id: Uuid,
        status: ElevationStatus,
        approved_by: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Elevation, VaultError> {
        let mut doc = self.write_lock();
        let row = doc
            .elevations
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(VaultError::ElevationNotFound(id))?;

        row.status = status;
        row.approved_by = approved_by;
        row.expires_at = expires_at;
        match status {
            ElevationStatus::Approved => row.approved_at = Some(Utc::now()),
            ElevationStatus::Pending => row.approved_at = None,
            _ => {}
        }

        let updated = row.clone();
        self.persist(&doc)?;
        Ok(updated)
    }

    /// All elevations still awaiting an administrator decision.
    pub fn list_pending(&self) -> Vec<Elevation> {
        self.read_lock()
            .elevations
            .iter()
            .filter(|e| e.status == ElevationStatus::Pending)
            .cloned()
            .collect()
    }

    /// Approved elevations regardless of deadline (startup reconciliation).
    pub fn list_approved(&self) -> Vec<Elevation> {
        self.read_lock()
            .elevations
            .iter()
            .filter(|e| e.status == ElevationStatus::Approved)
            .cloned()
            .collect()
    }

    // ── Audit ────────────────────────────────────────────────────

    /// Append one audit entry. Entries are never mutated or deleted.
    pub fn append_audit(&self, entry: AuditEntry) -> Result<(), VaultError> {
        let mut doc = self.write_lock();
        doc.audit.push(entry);
        self.persist(&doc)
    }

    /// The newest `limit` audit entries, newest first, optionally filtered by
    /// service.
    pub fn list_audit(&self, limit: usize, service: Option<&str>) -> Vec<AuditEntry> {
        self.read_lock()
            .audit
            .iter()
            .rev()
            .filter(|e| service.is_none() || e.service.as_deref() == service)
            .take(limit)
            .cloned()
            .collect()
    }

    // ── Persistence ──────────────────────────────────────────────

    fn persist(&self, doc: &StoreFile) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Write via a temp file in the same directory, then rename over the target.
/// The file is owner read/write only.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| VaultError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::crypto::KEY_LEN;
    use crate::vault::types::{AccessLevel, AuditActor, InjectionTarget};
    use tempfile::TempDir;

    fn test_vault() -> (CredentialVault, TempDir) {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::open(
            dir.path().join("store.json"),
            VaultCrypto::new(&[9u8; KEY_LEN]).unwrap(),
        )
        .unwrap();
        (vault, dir)
    }

    fn gmail_credential() -> Credential {
        let target = InjectionTarget::Env {
            var_name: "GMAIL_TOKEN".to_string(),
        };
        Credential::new(
            "gmail",
            "Gmail",
            "oauth2",
            AccessLevel::new(target.clone(), "r1"),
            Some(
                AccessLevel::new(target, "w1")
                    .with_max_ttl(std::time::Duration::from_secs(3600)),
            ),
        )
    }

    #[test]
    fn test_put_get_round_trip() {
        let (vault, _dir) = test_vault();
        vault.put(gmail_credential()).unwrap();

        let got = vault.get("gmail").unwrap();
        assert_eq!(got.read.token, "r1");
        assert_eq!(got.read_write.as_ref().unwrap().token, "w1");
        assert_eq!(got.read_write.unwrap().max_ttl_secs, Some(3600));
    }

    #[test]
    fn test_get_unknown_service_is_not_found() {
        let (vault, _dir) = test_vault();
        assert!(matches!(vault.get("nope"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_put_upserts_by_service() {
        let (vault, _dir) = test_vault();
        let first = vault.put(gmail_credential()).unwrap();

        let mut update = gmail_credential();
        update.read.token = "r2".to_string();
        let second = vault.put(update).unwrap();

        // Same row identity, new secret
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(vault.get("gmail").unwrap().read.token, "r2");
        assert_eq!(vault.services().len(), 1);
    }

    #[test]
    fn test_list_redacts_tokens() {
        let (vault, _dir) = test_vault();
        let mut cred = gmail_credential();
        cred.read.refresh_token = Some("refresh".into());
        vault.put(cred).unwrap();

        let listed = vault.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].read.token.is_empty());
        assert!(listed[0].read.refresh_token.is_none());
        assert!(listed[0].read_write.as_ref().unwrap().token.is_empty());
        // Metadata survives redaction
        assert_eq!(listed[0].service, "gmail");
        assert_eq!(listed[0].read_write.as_ref().unwrap().max_ttl_secs, Some(3600));
    }

    #[test]
    fn test_delete_removes_row() {
        let (vault, _dir) = test_vault();
        vault.put(gmail_credential()).unwrap();
        vault.delete("gmail").unwrap();
        assert!(matches!(vault.get("gmail"), Err(VaultError::NotFound(_))));
        assert!(matches!(vault.delete("gmail"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_wrong_key_reports_decrypt_not_notfound() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let vault =
            CredentialVault::open(&path, VaultCrypto::new(&[1u8; KEY_LEN]).unwrap()).unwrap();
        vault.put(gmail_credential()).unwrap();
        drop(vault);

        let reopened =
            CredentialVault::open(&path, VaultCrypto::new(&[2u8; KEY_LEN]).unwrap()).unwrap();
        assert!(matches!(reopened.get("gmail"), Err(VaultError::Decrypt)));
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let crypto = || VaultCrypto::new(&[3u8; KEY_LEN]).unwrap();

        let vault = CredentialVault::open(&path, crypto()).unwrap();
        vault.put(gmail_credential()).unwrap();
        vault.create_elevation("gmail", "write", "send mail").unwrap();
        drop(vault);

        let reopened = CredentialVault::open(&path, crypto()).unwrap();
        assert_eq!(reopened.get("gmail").unwrap().read.token, "r1");
        assert_eq!(reopened.list_pending().len(), 1);
    }

    #[test]
    fn test_store_file_has_owner_only_mode() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let (vault, dir) = test_vault();
            vault.put(gmail_credential()).unwrap();
            let mode = std::fs::metadata(dir.path().join("store.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_legacy_blob_projects_to_pair() {
        // Write a row whose encrypted payload uses the legacy flat-scopes
        // encoding, then read it back through the normal path.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let crypto = VaultCrypto::new(&[4u8; KEY_LEN]).unwrap();

        let legacy = serde_json::json!({
            "default": {
                "injection": { "kind": "env", "varName": "SLACK_TOKEN" },
                "token": "xoxb-read",
                "permanent": true
            },
            "admin": {
                "injection": { "kind": "env", "varName": "SLACK_ADMIN_TOKEN" },
                "token": "xoxb-admin",
                "requiresApproval": true
            }
        });
        let blob = crypto.encrypt(&serde_json::to_vec(&legacy).unwrap()).unwrap();
        let now = Utc::now();
        let doc = StoreFile {
            version: STORE_VERSION,
            credentials: vec![CredentialRow {
                id: Uuid::new_v4(),
                service: "slack".into(),
                display_name: "Slack".into(),
                kind: "token".into(),
                secrets: BASE64.encode(blob),
                created_at: now,
                updated_at: now,
            }],
            elevations: Vec::new(),
            audit: Vec::new(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

        let vault =
            CredentialVault::open(&path, VaultCrypto::new(&[4u8; KEY_LEN]).unwrap()).unwrap();
        let cred = vault.get("slack").unwrap();
        assert_eq!(cred.read.token, "xoxb-read");
        assert_eq!(cred.read_write.unwrap().token, "xoxb-admin");
    }

    #[test]
    fn test_elevation_lifecycle_rows() {
        let (vault, _dir) = test_vault();
        let e = vault.create_elevation("gmail", "write", "send").unwrap();
        assert_eq!(e.status, ElevationStatus::Pending);
        assert!(vault.active_elevation("gmail", "write").unwrap().is_none());

        let expires = Utc::now() + chrono::Duration::minutes(30);
        vault
            .update_elevation_status(
                e.id,
                ElevationStatus::Approved,
                Some("alice".into()),
                Some(expires),
            )
            .unwrap();

        let active = vault.active_elevation("gmail", "write").unwrap().unwrap();
        assert_eq!(active.id, e.id);
        assert_eq!(active.approved_by.as_deref(), Some("alice"));
        assert!(active.approved_at.is_some());

        // Rollback clears approval bookkeeping
        vault
            .update_elevation_status(e.id, ElevationStatus::Pending, None, None)
            .unwrap();
        let back = vault.get_elevation(e.id).unwrap();
        assert_eq!(back.status, ElevationStatus::Pending);
        assert!(back.approved_at.is_none());
        assert!(back.expires_at.is_none());
        assert!(vault.active_elevation("gmail", "write").unwrap().is_none());
    }

    #[test]
    fn test_active_elevation_ignores_past_deadlines() {
        let (vault, _dir) = test_vault();
        let e = vault.create_elevation("gmail", "write", "send").unwrap();
        vault
            .update_elevation_status(
                e.id,
                ElevationStatus::Approved,
                Some("alice".into()),
                Some(Utc::now() - chrono::Duration::seconds(1)),
            )
            .unwrap();
        assert!(vault.active_elevation("gmail", "write").unwrap().is_none());
    }

    #[test]
    fn test_active_elevation_picks_newest() {
        let (vault, _dir) = test_vault();
        let old = vault.create_elevation("gmail", "write", "first").unwrap();
        let new = vault.create_elevation("gmail", "write", "second").unwrap();
        let expires = Utc::now() + chrono::Duration::minutes(10);
        vault
            .update_elevation_status(old.id, ElevationStatus::Approved, None, Some(expires))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        vault
            .update_elevation_status(new.id, ElevationStatus::Approved, None, Some(expires))
            .unwrap();

        let active = vault.active_elevation("gmail", "write").unwrap().unwrap();
        assert_eq!(active.id, new.id);
    }

    #[test]
    fn test_audit_append_and_filter() {
        let (vault, _dir) = test_vault();
        vault
            .append_audit(
                AuditEntry::new("elevation.requested", AuditActor::Agent, "send mail")
                    .with_service("gmail")
                    .with_scope("write"),
            )
            .unwrap();
        vault
            .append_audit(
                AuditEntry::new("credential.created", AuditActor::Admin, "").with_service("slack"),
            )
            .unwrap();

        let all = vault.list_audit(10, None);
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].action, "credential.created");

        let gmail_only = vault.list_audit(10, Some("gmail"));
        assert_eq!(gmail_only.len(), 1);
        assert_eq!(gmail_only[0].actor, AuditActor::Agent);

        assert_eq!(vault.list_audit(1, None).len(), 1);
    }
}
