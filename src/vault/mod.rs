//! Encrypted-at-rest vault envelopes.
//!
//! A [`VaultEnvelope`] is a small JSON document:
//!
//! ```json
//! {"fmt":"sshvault","v":1,"salt":"<b64 32B>","nonce":"<b64 12B>","ciphertext":"<b64>","created":1700000000}
//! ```
//!
//! The key is derived from the master password with Argon2id and the
//! plaintext is sealed with ChaCha20-Poly1305. Salt and nonce are drawn
//! from the OS RNG on every [`seal`], so the same plaintext never produces
//! the same ciphertext twice.

pub mod store;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

pub use store::VaultStore;

pub const FORMAT_TAG: &str = "sshvault";
pub const FORMAT_VERSION: u32 = 1;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Unsupported vault format {fmt:?} v{v}")]
    Format { fmt: String, v: u32 },
    #[error("Malformed vault envelope: {0}")]
    Malformed(String),
    /// Wrong password or modified data. Carries no plaintext.
    #[error("Decryption failed: wrong master password or corrupted vault")]
    Decryption,
    #[error("Key derivation failed: {0}")]
    Kdf(String),
    #[error("Invalid vault file name {0:?}")]
    InvalidName(String),
    #[error("Vault I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Vault encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk envelope. All binary fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEnvelope {
    pub fmt: String,
    pub v: u32,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    /// Unix seconds.
    pub created: i64,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// KiB.
    pub memory_cost: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 passes, single lane.
    fn default() -> Self {
        Self {
            memory_cost: 65536,
            iterations: 3,
            parallelism: 1,
        }
    }
}

fn derive_key(
    password: &str,
    salt: &[u8],
    kdf: KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
    let params = Params::new(
        kdf.memory_cost,
        kdf.iterations,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut *key)
        .map_err(|e| VaultError::Kdf(e.to_string()))?;
    Ok(key)
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(value)
        .map_err(|e| VaultError::Malformed(format!("{name}: {e}")))
}

/// Encrypt `plaintext` under `password` with the default cost parameters.
pub fn seal(plaintext: &[u8], password: &str) -> Result<VaultEnvelope, VaultError> {
    seal_with(plaintext, password, KdfParams::default())
}

pub fn seal_with(
    plaintext: &[u8],
    password: &str,
    kdf: KdfParams,
) -> Result<VaultEnvelope, VaultError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, kdf)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&*key)
        .map_err(|e| VaultError::Kdf(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::Kdf("encryption failed".into()))?;

    Ok(VaultEnvelope {
        fmt: FORMAT_TAG.to_string(),
        v: FORMAT_VERSION,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
        created: unix_now(),
    })
}

/// Decrypt with the default cost parameters.
pub fn open(envelope: &VaultEnvelope, password: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    open_with(envelope, password, KdfParams::default())
}

pub fn open_with(
    envelope: &VaultEnvelope,
    password: &str,
    kdf: KdfParams,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if envelope.fmt != FORMAT_TAG || envelope.v != FORMAT_VERSION {
        return Err(VaultError::Format {
            fmt: envelope.fmt.clone(),
            v: envelope.v,
        });
    }
    let salt = decode_field("salt", &envelope.salt)?;
    let nonce = decode_field("nonce", &envelope.nonce)?;
    let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;
    if salt.len() != SALT_LEN {
        return Err(VaultError::Malformed(format!(
            "salt must be {SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Malformed(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }

    let key = derive_key(password, &salt, kdf)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&*key)
        .map_err(|e| VaultError::Kdf(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Decryption)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
