//! At-rest encryption for credential secrets.
//!
//! Format: NONCE (12) || CIPHERTEXT (N + 16 tag). A fresh random nonce is
//! generated for every write. Decryption fails closed: a bad authentication
//! tag returns an error, never partial plaintext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::vault::VaultError;

/// Master key length in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher bound to the vault master key.
pub struct VaultCrypto {
    cipher: Aes256Gcm,
}

impl VaultCrypto {
    /// Create from raw key bytes. Hard error unless exactly 32 bytes.
    pub fn new(master_key: &[u8]) -> Result<Self, VaultError> {
        if master_key.len() != KEY_LEN {
            return Err(VaultError::BadKeyLength {
                got: master_key.len(),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(master_key).map_err(|_| {
            VaultError::BadKeyLength {
                got: master_key.len(),
            }
        })?;
        Ok(Self { cipher })
    }

    /// Create from a 64-char hex string (the `KEYWARDEN_MASTER_KEY` format).
    pub fn from_hex(hex: &str) -> Result<Self, VaultError> {
        let bytes = Zeroizing::new(hex_to_bytes(hex)?);
        Self::new(&bytes)
    }

    /// Encrypt plaintext, prepending the fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| VaultError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a `nonce || ciphertext+tag` blob.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, VaultError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decrypt)
    }
}

/// Generate a random master key as a hex string (for `keywarden keygen`).
pub fn generate_master_key_hex() -> String {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut *key);
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a hex string to bytes.
fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, VaultError> {
    if hex.len() % 2 != 0 {
        return Err(VaultError::BadKeyEncoding("odd length".to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| VaultError::BadKeyEncoding("invalid hex character".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_crypto() -> VaultCrypto {
        VaultCrypto::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let crypto = test_crypto();
        let blob = crypto.encrypt(b"hello secret").unwrap();
        assert_eq!(crypto.decrypt(&blob).unwrap(), b"hello secret");
    }

    #[test]
    fn test_overhead_is_nonce_plus_tag() {
        let crypto = test_crypto();
        let blob = crypto.encrypt(b"abc").unwrap();
        assert_eq!(blob.len(), 3 + NONCE_LEN + TAG_LEN);
    }

    #[test]
    fn test_nonce_is_fresh_per_write() {
        let crypto = test_crypto();
        let a = crypto.encrypt(b"same").unwrap();
        let b = crypto.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bit_flip_fails_closed() {
        let crypto = test_crypto();
        let mut blob = crypto.encrypt(b"integrity matters").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(crypto.decrypt(&blob), Err(VaultError::Decrypt)));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let blob = test_crypto().encrypt(b"for one key only").unwrap();
        let other = VaultCrypto::new(&[8u8; KEY_LEN]).unwrap();
        assert!(matches!(other.decrypt(&blob), Err(VaultError::Decrypt)));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let crypto = test_crypto();
        assert!(matches!(
            crypto.decrypt(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(VaultError::Decrypt)
        ));
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(matches!(
            VaultCrypto::new(&[0u8; 16]),
            Err(VaultError::BadKeyLength { got: 16 })
        ));
    }

    #[test]
    fn test_from_hex() {
        let hex = generate_master_key_hex();
        assert_eq!(hex.len(), KEY_LEN * 2);
        VaultCrypto::from_hex(&hex).unwrap();
        assert!(VaultCrypto::from_hex("abc").is_err());
        assert!(VaultCrypto::from_hex("zz").is_err());
    }
}
