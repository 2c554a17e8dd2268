//! Approve/revoke/expire orchestration.
//!
//! The engine owns an expiry-timer table keyed `service:scope`. Timers never
//! run transitions themselves: a fired timer only sends a notice into an
//! internal channel, and a single worker task performs the expiry under the
//! same mutex every other transition takes. A revoke that wins the race
//! simply leaves the late notice with nothing to do.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::elevation::ElevationError;
use crate::gateway::GatewayRpcClient;
use crate::inject::{merge_patch_documents, EnvChange, EnvFileWriter};
use crate::vault::{
    AccessLevel, AuditActor, AuditEntry, Credential, CredentialVault, Elevation, ElevationStatus,
    InjectionTarget, VaultError,
};

/// Result of storing a credential through the engine. A failed downstream
/// injection does not fail the store; it surfaces here as a warning with the
/// manual remediation step.
#[derive(Debug)]
pub struct PutOutcome {
    /// The persisted credential, redacted.
    pub credential: Credential,
    pub warning: Option<String>,
}

struct ExpiryNotice {
    id: Uuid,
    service: String,
    scope: String,
}

struct TimerHandle {
    elevation_id: Uuid,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct EngineState {
    timers: HashMap<String, TimerHandle>,
}

/// Orchestrates the elevation lifecycle against the vault, the env file, and
/// the gateway.
pub struct ElevationEngine {
    vault: Arc<CredentialVault>,
    gateway: Arc<GatewayRpcClient>,
    env: EnvFileWriter,
    /// Guards the timer table and the check → store → inject → (dis)arm
    /// sequence of every transition.
    inner: Mutex<EngineState>,
    expiry_tx: mpsc::Sender<ExpiryNotice>,
}

impl ElevationEngine {
    /// Build the engine and start its expiry worker. Must run inside a tokio
    /// runtime.
    pub fn new(
        vault: Arc<CredentialVault>,
        gateway: Arc<GatewayRpcClient>,
        env_file: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let (expiry_tx, mut expiry_rx) = mpsc::channel::<ExpiryNotice>(32);
        let engine = Arc::new(Self {
            vault,
            gateway,
            env: EnvFileWriter::new(env_file),
            inner: Mutex::new(EngineState::default()),
            expiry_tx,
        });

        let weak = Arc::downgrade(&engine);
        tokio::spawn(async move {
            while let Some(notice) = expiry_rx.recv().await {
                let Some(engine) = weak.upgrade() else { break };
                engine.handle_expiry(notice).await;
            }
        });

        engine
    }

    // ── Credential lifecycle ─────────────────────────────────────

    /// Store a credential and push its `read` secret downstream. The store
    /// succeeding is what matters; an injection failure comes back as a
    /// warning, not an error.
    pub async fn put_credential(
        &self,
        credential: Credential,
    ) -> Result<PutOutcome, ElevationError> {
        let _state = self.inner.lock().await;

        let existed = self.vault.get(&credential.service).is_ok();
        let stored = self.vault.put(credential)?;

        let action = if existed {
            "credential.updated"
        } else {
            "credential.created"
        };
        self.audit(
            AuditEntry::new(action, AuditActor::Admin, &stored.display_name)
                .with_service(&stored.service),
        );

        let warning = match self.inject_level(&stored.read).await {
            Ok(()) => None,
            Err(e) => Some(format!(
                "credential stored, but injecting the read secret failed: {e}; \
                 fix the injection target and update the credential, or restart the sidecar to retry"
            )),
        };

        Ok(PutOutcome {
            credential: stored.redacted(),
            warning,
        })
    }

    /// Remove a credential: revoke any active elevation, clear its downstream
    /// keys, then delete the row. Downstream failures are logged, not
    /// surfaced; the deleted row is authoritative.
    pub async fn remove_credential(&self, service: &str) -> Result<(), ElevationError> {
        let mut state = self.inner.lock().await;
        let credential = self.get_credential(service)?;

        let now = Utc::now();
        for elevation in self
            .vault
            .list_approved()
            .into_iter()
            .filter(|e| e.service == service && e.is_active_at(now))
        {
            self.disarm_timer(&mut state, &elevation.service, &elevation.scope);
            if let Err(e) = self.vault.update_elevation_status(
                elevation.id,
                ElevationStatus::Revoked,
                elevation.approved_by.clone(),
                elevation.expires_at,
            ) {
                tracing::error!(service = %service, error = %e, "Failed to revoke elevation during credential removal");
            }
            self.audit(
                AuditEntry::new("elevation.revoked", AuditActor::Admin, "credential removed")
                    .with_service(service)
                    .with_scope(&elevation.scope),
            );
        }

        if let Err(e) = self.clear_level(&credential.read).await {
            tracing::warn!(service = %service, error = %e, "Failed to clear read secret downstream");
        }
        if let Some(rw) = &credential.read_write {
            if rw.injection.key() != credential.read.injection.key() {
                if let Err(e) = self.clear_level(rw).await {
                    tracing::warn!(service = %service, error = %e, "Failed to clear read-write secret downstream");
                }
            }
        }

        self.vault.delete(service)?;
        self.audit(
            AuditEntry::new("credential.deleted", AuditActor::Admin, "").with_service(service),
        );
        Ok(())
    }

    // ── Agent-facing disclosure ──────────────────────────────────

    /// Disclose the permanent `read` level. Every disclosure is audited.
    pub fn reveal_read(&self, service: &str) -> Result<AccessLevel, ElevationError> {
        let credential = self.get_credential(service)?;
        self.audit(
            AuditEntry::new("secret.disclosed", AuditActor::Agent, "read level")
                .with_service(service),
        );
        Ok(credential.read)
    }

    /// Disclose the `read_write` level, but only while an approved elevation
    /// with a future deadline exists for the scope.
    pub fn reveal_elevated(
        &self,
        service: &str,
        scope: &str,
    ) -> Result<AccessLevel, ElevationError> {
        let credential = self.get_credential(service)?;
        let level = credential
            .read_write
            .ok_or_else(|| ElevationError::NoSuchLevel {
                service: service.to_string(),
                scope: scope.to_string(),
            })?;
        if self.vault.active_elevation(service, scope)?.is_none() {
            return Err(ElevationError::NoActiveElevation {
                service: service.to_string(),
                scope: scope.to_string(),
            });
        }
        self.audit(
            AuditEntry::new("secret.disclosed", AuditActor::Agent, "read-write level")
                .with_service(service)
                .with_scope(scope),
        );
        Ok(level)
    }

    // ── Elevation lifecycle ──────────────────────────────────────

    /// Open an elevation request. Idempotent by key: when an active grant
    /// already exists it is returned instead of creating a duplicate.
    pub async fn request_elevation(
        &self,
        service: &str,
        scope: &str,
        reason: &str,
    ) -> Result<Elevation, ElevationError> {
        let _state = self.inner.lock().await;

        let credential = self.get_credential(service)?;
        if credential.read_write.is_none() {
            return Err(ElevationError::NoSuchLevel {
                service: service.to_string(),
                scope: scope.to_string(),
            });
        }

        if let Some(active) = self.vault.active_elevation(service, scope)? {
            return Ok(active);
        }

        let elevation = self.vault.create_elevation(service, scope, reason)?;
        self.audit(
            AuditEntry::new("elevation.requested", AuditActor::Agent, reason)
                .with_service(service)
                .with_scope(scope),
        );
        tracing::info!(service = %service, scope = %scope, id = %elevation.id, "Elevation requested");
        Ok(elevation)
    }

    /// Grant a pending elevation. The grant is written before injection; if
    /// injection then fails the status rolls back to pending and the error is
    /// surfaced, so a secret is never considered granted without having been
    /// delivered.
    pub async fn approve_elevation(
        &self,
        id: Uuid,
        requested_ttl: Duration,
        approved_by: &str,
    ) -> Result<Elevation, ElevationError> {
        let mut state = self.inner.lock().await;

        let elevation = self.vault.get_elevation(id)?;
        if elevation.status != ElevationStatus::Pending {
            return Err(ElevationError::NotPending {
                id,
                status: elevation.status,
            });
        }

        let credential = self.get_credential(&elevation.service)?;
        let level = credential
            .read_write
            .clone()
            .ok_or_else(|| ElevationError::NoSuchLevel {
                service: elevation.service.clone(),
                scope: elevation.scope.clone(),
            })?;

        let effective_ttl = match level.max_ttl() {
            Some(max) => requested_ttl.min(max),
            None => requested_ttl,
        };
        let lifetime =
            chrono::Duration::from_std(effective_ttl).map_err(|_| ElevationError::InvalidTtl)?;
        let expires_at = Utc::now() + lifetime;

        let approved = self.vault.update_elevation_status(
            id,
            ElevationStatus::Approved,
            Some(approved_by.to_string()),
            Some(expires_at),
        )?;

        if let Err(e) = self.inject_level(&level).await {
            // Not delivered, so not granted. Roll back to pending.
            if let Err(rollback_err) =
                self.vault
                    .update_elevation_status(id, ElevationStatus::Pending, None, None)
            {
                tracing::error!(id = %id, error = %rollback_err, "Rollback to pending failed after injection error");
            }
            self.audit(
                AuditEntry::new(
                    "elevation.approve_failed",
                    AuditActor::Admin,
                    format!("injection failed: {e}"),
                )
                .with_service(&elevation.service)
                .with_scope(&elevation.scope),
            );
            return Err(e);
        }

        self.arm_timer(&mut state, &approved, effective_ttl);
        self.audit(
            AuditEntry::new(
                "elevation.approved",
                AuditActor::Admin,
                format!(
                    "by {approved_by}; ttl {}s, expires {}",
                    effective_ttl.as_secs(),
                    expires_at.to_rfc3339()
                ),
            )
            .with_service(&elevation.service)
            .with_scope(&elevation.scope),
        );
        tracing::info!(
            service = %elevation.service,
            scope = %elevation.scope,
            expires_at = %expires_at,
            "Elevation approved"
        );
        Ok(approved)
    }

    /// Refuse a pending elevation.
    pub async fn deny_elevation(
        &self,
        id: Uuid,
        denied_by: &str,
        reason: &str,
    ) -> Result<Elevation, ElevationError> {
        let _state = self.inner.lock().await;

        let elevation = self.vault.get_elevation(id)?;
        if elevation.status != ElevationStatus::Pending {
            return Err(ElevationError::NotPending {
                id,
                status: elevation.status,
            });
        }

        let denied =
            self.vault
                .update_elevation_status(id, ElevationStatus::Denied, None, None)?;
        self.audit(
            AuditEntry::new(
                "elevation.denied",
                AuditActor::Admin,
                format!("by {denied_by}: {reason}"),
            )
            .with_service(&elevation.service)
            .with_scope(&elevation.scope),
        );
        Ok(denied)
    }

    /// Cut an active grant short: stop its timer, mark it revoked, downgrade
    /// the downstream secret. The revocation is audited even when the
    /// downgrade fails.
    pub async fn revoke_elevation(
        &self,
        service: &str,
        scope: &str,
        reason: &str,
    ) -> Result<Elevation, ElevationError> {
        let mut state = self.inner.lock().await;

        let active = self
            .vault
            .active_elevation(service, scope)?
            .ok_or_else(|| ElevationError::NoActiveElevation {
                service: service.to_string(),
                scope: scope.to_string(),
            })?;

        self.disarm_timer(&mut state, service, scope);
        let revoked = self.vault.update_elevation_status(
            active.id,
            ElevationStatus::Revoked,
            active.approved_by.clone(),
            active.expires_at,
        )?;

        let mut details = format!("by request: {reason}");
        match self.get_credential(service) {
            Ok(credential) => {
                if let Err(e) = self.downgrade(&credential).await {
                    tracing::warn!(service = %service, scope = %scope, error = %e, "Downgrade failed after revoke");
                    details.push_str(&format!("; downgrade failed: {e}"));
                }
            }
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Credential unreadable during revoke downgrade");
                details.push_str("; downgrade skipped: credential unreadable");
            }
        }

        self.audit(
            AuditEntry::new("elevation.revoked", AuditActor::Admin, details)
                .with_service(service)
                .with_scope(scope),
        );
        tracing::info!(service = %service, scope = %scope, "Elevation revoked");
        Ok(revoked)
    }

    /// Expiry worker entry point. The row saying `expired` is authoritative;
    /// downgrade errors are logged and swallowed.
    async fn handle_expiry(&self, notice: ExpiryNotice) {
        let mut state = self.inner.lock().await;

        let key = timer_key(&notice.service, &notice.scope);
        if state
            .timers
            .get(&key)
            .map(|h| h.elevation_id == notice.id)
            .unwrap_or(false)
        {
            state.timers.remove(&key);
        }

        let elevation = match self.vault.get_elevation(notice.id) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(id = %notice.id, error = %e, "Expiry fired for unknown elevation");
                return;
            }
        };
        // A concurrent revoke (or a replaced grant) won the race.
        if elevation.status != ElevationStatus::Approved {
            return;
        }

        if let Err(e) = self.vault.update_elevation_status(
            notice.id,
            ElevationStatus::Expired,
            elevation.approved_by.clone(),
            elevation.expires_at,
        ) {
            tracing::error!(id = %notice.id, error = %e, "Failed to mark elevation expired");
            return;
        }

        match self.get_credential(&notice.service) {
            Ok(credential) => {
                if let Err(e) = self.downgrade(&credential).await {
                    tracing::warn!(
                        service = %notice.service,
                        scope = %notice.scope,
                        error = %e,
                        "Downgrade failed after expiry"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(service = %notice.service, error = %e, "Credential unreadable during expiry downgrade");
            }
        }

        self.audit(
            AuditEntry::new("elevation.expired", AuditActor::System, "deadline reached")
                .with_service(&notice.service)
                .with_scope(&notice.scope),
        );
        tracing::info!(service = %notice.service, scope = %notice.scope, "Elevation expired");
    }

    // ── Startup ──────────────────────────────────────────────────

    /// Reconcile persisted elevations with wall-clock time, then push every
    /// stored `read` secret into the downstream artifact. No restart is
    /// triggered: the downstream process is assumed to be starting alongside
    /// us and will read the artifact itself.
    pub async fn sync_on_startup(&self) -> Result<(), ElevationError> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();

        for elevation in self.vault.list_approved() {
            match elevation.expires_at {
                Some(expires) if expires > now => {
                    let remaining = (expires - now).to_std().unwrap_or(Duration::ZERO);
                    self.arm_timer(&mut state, &elevation, remaining);
                    tracing::info!(
                        service = %elevation.service,
                        scope = %elevation.scope,
                        expires_at = %expires,
                        "Re-armed elevation timer from persisted state"
                    );
                }
                _ => {
                    // Deadline passed while the sidecar was down.
                    if let Err(e) = self.vault.update_elevation_status(
                        elevation.id,
                        ElevationStatus::Expired,
                        elevation.approved_by.clone(),
                        elevation.expires_at,
                    ) {
                        tracing::error!(id = %elevation.id, error = %e, "Failed to expire stale elevation");
                        continue;
                    }
                    if let Ok(credential) = self.get_credential(&elevation.service) {
                        if let Err(e) = self.downgrade(&credential).await {
                            tracing::warn!(
                                service = %elevation.service,
                                error = %e,
                                "Downgrade failed for stale elevation"
                            );
                        }
                    }
                    self.audit(
                        AuditEntry::new(
                            "elevation.expired",
                            AuditActor::System,
                            "deadline passed while sidecar was offline",
                        )
                        .with_service(&elevation.service)
                        .with_scope(&elevation.scope),
                    );
                }
            }
        }

        // One batched env rewrite for all permanent secrets.
        let mut env_changes: Vec<EnvChange> = Vec::new();
        let mut config_patches: Vec<(String, Option<String>)> = Vec::new();
        let mut synced = 0usize;
        for service in self.vault.services() {
            match self.vault.get(&service) {
                Ok(credential) => {
                    collect_level_changes(
                        &credential.read,
                        true,
                        &mut env_changes,
                        &mut config_patches,
                    );
                    synced += 1;
                }
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "Skipping unreadable credential in startup sync");
                }
            }
        }

        if !env_changes.is_empty() {
            self.env.apply(&env_changes)?;
        }
        if !config_patches.is_empty() {
            let doc = merge_patch_documents(&config_patches);
            if let Err(e) = self.gateway.patch_config(&doc, "startup secret sync").await {
                tracing::warn!(error = %e, "Config-target secrets not pushed at startup; will apply once the gateway is reachable");
            }
        }

        self.audit(AuditEntry::new(
            "startup.sync",
            AuditActor::System,
            format!("pushed read secrets for {synced} credential(s)"),
        ));
        tracing::info!(credentials = synced, "Startup secret sync complete");
        Ok(())
    }

    // ── Injection plumbing ───────────────────────────────────────

    /// Write a level's secret (and co-injected fields) downstream. Env-file
    /// changes are followed by a restart request so they take effect; a
    /// failed restart is only a warning because the file itself is already
    /// correct. Config patches are the delivery, so their failure is an
    /// error.
    async fn inject_level(&self, level: &AccessLevel) -> Result<(), ElevationError> {
        self.apply_level(level, true, "secret injection").await
    }

    /// Remove a level's keys downstream.
    async fn clear_level(&self, level: &AccessLevel) -> Result<(), ElevationError> {
        self.apply_level(level, false, "secret cleanup").await
    }

    async fn apply_level(
        &self,
        level: &AccessLevel,
        set: bool,
        note: &str,
    ) -> Result<(), ElevationError> {
        let mut env_changes: Vec<EnvChange> = Vec::new();
        let mut config_patches: Vec<(String, Option<String>)> = Vec::new();
        collect_level_changes(level, set, &mut env_changes, &mut config_patches);

        if !env_changes.is_empty() {
            self.env.apply(&env_changes)?;
            if let Err(e) = self.gateway.restart_gateway(note).await {
                tracing::warn!(
                    error = %e,
                    "Env file updated but gateway restart failed; the change applies on its next restart"
                );
            }
        }
        if !config_patches.is_empty() {
            let doc = merge_patch_documents(&config_patches);
            self.gateway.patch_config(&doc, note).await?;
        }
        Ok(())
    }

    /// Fall back after an elevation ends: when both levels share a downstream
    /// key, re-inject the permanent `read` secret; otherwise clear the
    /// read-write key entirely.
    async fn downgrade(&self, credential: &Credential) -> Result<(), ElevationError> {
        let Some(rw) = &credential.read_write else {
            return Ok(());
        };
        if rw.injection.key() == credential.read.injection.key() {
            self.inject_level(&credential.read).await
        } else {
            self.clear_level(rw).await
        }
    }

    // ── Timer table ──────────────────────────────────────────────

    fn arm_timer(&self, state: &mut EngineState, elevation: &Elevation, ttl: Duration) {
        let key = timer_key(&elevation.service, &elevation.scope);
        if let Some(old) = state.timers.remove(&key) {
            old.task.abort();
        }

        let tx = self.expiry_tx.clone();
        let notice = ExpiryNotice {
            id: elevation.id,
            service: elevation.service.clone(),
            scope: elevation.scope.clone(),
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = tx.send(notice).await;
        });

        state.timers.insert(
            key,
            TimerHandle {
                elevation_id: elevation.id,
                task,
            },
        );
    }

    fn disarm_timer(&self, state: &mut EngineState, service: &str, scope: &str) {
        if let Some(handle) = state.timers.remove(&timer_key(service, scope)) {
            handle.task.abort();
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn get_credential(&self, service: &str) -> Result<Credential, ElevationError> {
        self.vault.get(service).map_err(|e| match e {
            VaultError::NotFound(service) => ElevationError::UnknownService(service),
            other => other.into(),
        })
    }

    /// Best-effort audit write. The ledger is append-only; a failed write is
    /// logged loudly but never blocks a transition.
    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.vault.append_audit(entry) {
            tracing::error!(error = %e, "Audit write failed");
        }
    }
}

fn timer_key(service: &str, scope: &str) -> String {
    format!("{service}:{scope}")
}

fn collect_level_changes(
    level: &AccessLevel,
    set: bool,
    env_changes: &mut Vec<EnvChange>,
    config_patches: &mut Vec<(String, Option<String>)>,
) {
    push_change(&level.injection, set.then(|| level.token.clone()), env_changes, config_patches);
    for field in &level.additional_fields {
        push_change(
            &field.injection,
            set.then(|| field.value.clone()),
            env_changes,
            config_patches,
        );
    }
}

fn push_change(
    target: &InjectionTarget,
    value: Option<String>,
    env_changes: &mut Vec<EnvChange>,
    config_patches: &mut Vec<(String, Option<String>)>,
) {
    match target {
        InjectionTarget::Env { var_name } => env_changes.push((var_name.clone(), value)),
        InjectionTarget::Config { json_path } => config_patches.push((json_path.clone(), value)),
    }
}
