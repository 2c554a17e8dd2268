//! Persistent Ed25519 device identity.
//!
//! The gateway identifies this process by a long-lived Ed25519 keypair. The
//! raw 32-byte seed lives at a fixed path with owner-only permissions; when
//! that path is unwritable the seed falls back to the system temp directory.
//! The id shown to operators is the SHA-256 hex digest of the public key.
//!
//! Key material only moves through this narrow load-or-generate interface so
//! its lifetime stays auditable.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::gateway::protocol::DeviceParams;
use crate::gateway::GatewayError;

/// Version tag prefixed to every signed challenge payload.
pub const SIGNING_VERSION: &str = "v1";

const SEED_LEN: usize = 32;
const FALLBACK_FILE: &str = "keywarden-device.key";

/// This host's Ed25519 identity toward the gateway.
pub struct DeviceIdentity {
    signing: SigningKey,
    device_id: String,
}

impl DeviceIdentity {
    /// Load the seed from `path`, or generate one and persist it. The temp
    /// fallback is only used when the primary path is unavailable; if even
    /// that fails the identity stays in memory for this process.
    pub fn load_or_generate(path: &Path) -> Result<Self, GatewayError> {
        match read_seed(path) {
            Ok(Some(seed)) => return Ok(Self::from_seed(&seed)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Device key unreadable; trying temp fallback"
                );
            }
        }

        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut *seed);

        if persist_seed(path, &seed).is_ok() {
            return Ok(Self::from_seed(&seed));
        }

        // Primary unavailable: reuse (or create) the temp-path seed.
        let fallback = fallback_path();
        if let Ok(Some(existing)) = read_seed(&fallback) {
            tracing::warn!(
                primary = %path.display(),
                fallback = %fallback.display(),
                "Device key path unavailable; using temp-path identity"
            );
            return Ok(Self::from_seed(&existing));
        }
        match persist_seed(&fallback, &seed) {
            Ok(()) => {
                tracing::warn!(
                    primary = %path.display(),
                    fallback = %fallback.display(),
                    "Device key path unwritable; persisted seed to temp path"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Could not persist device seed anywhere; identity is in-memory only"
                );
            }
        }
        Ok(Self::from_seed(&seed))
    }

    fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let device_id = hex_digest(signing.verifying_key().as_bytes());
        Self { signing, device_id }
    }

    /// SHA-256 hex digest of the public key.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Public key, base64url unpadded.
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign a `connect.challenge` nonce, producing the device block of the
    /// connect request.
    pub fn sign_challenge(
        &self,
        client_id: &str,
        client_mode: &str,
        role: &str,
        scopes: &[String],
        token: &str,
        nonce: &str,
    ) -> DeviceParams {
        let signed_at = chrono::Utc::now().timestamp_millis();
        let payload = signing_payload(
            &self.device_id,
            client_id,
            client_mode,
            role,
            scopes,
            signed_at,
            token,
            nonce,
        );
        let signature = self.signing.sign(payload.as_bytes());
        DeviceParams {
            id: self.device_id.clone(),
            public_key: self.public_key_b64(),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            signed_at,
            nonce: nonce.to_string(),
        }
    }
}

/// The exact byte string a device signature covers. Field order and the `|`
/// delimiter are part of the wire contract.
#[allow(clippy::too_many_arguments)]
pub fn signing_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: i64,
    token: &str,
    nonce: &str,
) -> String {
    [
        SIGNING_VERSION,
        device_id,
        client_id,
        client_mode,
        role,
        &scopes.join(","),
        &signed_at_ms.to_string(),
        token,
        nonce,
    ]
    .join("|")
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn read_seed(path: &Path) -> std::io::Result<Option<Zeroizing<[u8; SEED_LEN]>>> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == SEED_LEN => {
            let mut seed = Zeroizing::new([0u8; SEED_LEN]);
            seed.copy_from_slice(&bytes);
            Ok(Some(seed))
        }
        // A wrong-sized file is not an identity; regenerate rather than crash.
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn persist_seed(path: &Path, seed: &[u8; SEED_LEN]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, seed)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn fallback_path() -> PathBuf {
    std::env::temp_dir().join(FALLBACK_FILE)
}
