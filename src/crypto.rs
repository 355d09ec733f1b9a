//! At-rest secret encryption (spec.md §4.A).
//!
//! Tenant-level secrets (the service-role JWT, the database password) are
//! stored encrypted in the metadata store and decrypted on demand using a
//! single process-wide key derived from `ENCRYPTION_KEY`. Same AES-256-GCM /
//! PBKDF2 construction the `shipper-encrypt` example crate uses for state
//! file secrets, adapted to short string values instead of whole files.
//!
//! Wire format: `base64(salt(16) || nonce(12) || ciphertext)`.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use crate::error::{GatewayError, Result};

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Derive the process-wide 256-bit key from the raw `ENCRYPTION_KEY` env var.
/// Unlike per-secret encryption this uses a fixed salt so the same
/// `ENCRYPTION_KEY` always yields the same key across process restarts.
pub fn derive_key(encryption_key: &str) -> Vec<u8> {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(
        encryption_key.as_bytes(),
        b"storage-gateway-encryption-key",
        PBKDF2_ITERATIONS,
    )
    .to_vec()
}

/// Encrypt a tenant secret for storage. `key` is the process key from
/// [`derive_key`]; each call still draws a fresh random salt and nonce so
/// identical plaintexts never produce identical ciphertexts.
pub fn encrypt(key: &[u8], plaintext: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let sub_key = pbkdf2_hmac_array::<Sha256, KEY_SIZE>(key, &salt, 1);
    let cipher = Aes256Gcm::new_from_slice(&sub_key)
        .map_err(|e| GatewayError::Internal(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| GatewayError::Internal(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Decrypt a tenant secret previously produced by [`encrypt`].
pub fn decrypt(key: &[u8], encoded: &str) -> Result<String> {
    let data = BASE64
        .decode(encoded)
        .map_err(|e| GatewayError::Internal(format!("invalid base64 ciphertext: {e}")))?;

    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(GatewayError::Internal("ciphertext too short".into()));
    }

    let salt = &data[..SALT_SIZE];
    let nonce_bytes = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let sub_key = pbkdf2_hmac_array::<Sha256, KEY_SIZE>(key, salt, 1);
    let cipher = Aes256Gcm::new_from_slice(&sub_key)
        .map_err(|e| GatewayError::Internal(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| GatewayError::Internal("decryption failed".into()))?;

    String::from_utf8(plaintext)
        .map_err(|e| GatewayError::Internal(format!("decrypted value is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = derive_key("a-process-wide-secret");
        let encrypted = encrypt(&key, "tenant-service-role-jwt").unwrap();
        assert_eq!(decrypt(&key, &encrypted).unwrap(), "tenant-service-role-jwt");
    }

    #[test]
    fn different_calls_produce_different_ciphertext() {
        let key = derive_key("a-process-wide-secret");
        let a = encrypt(&key, "same-plaintext").unwrap();
        let b = encrypt(&key, "same-plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let key_a = derive_key("key-a");
        let key_b = derive_key("key-b");
        let encrypted = encrypt(&key_a, "secret").unwrap();
        assert!(decrypt(&key_b, &encrypted).is_err());
    }
}
