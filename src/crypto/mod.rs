//! Symmetric encryption for upstream credentials.
//!
//! The vault key is derived from the operator secret with PBKDF2-HMAC-SHA256.
//! The salt is itself derived from the secret (SHA-256 of a fixed prefix plus
//! the secret), so every installation gets its own salt without a salt file,
//! and the same secret yields the same key across restarts.
//!
//! Every encrypted value is a single base64 blob: `nonce (12 bytes) || ciphertext`.
//! AES-256-GCM is authenticated, so a wrong key or a tampered blob fails with
//! [`CryptoError::Decryption`] instead of producing garbage plaintext.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

/// PBKDF2 iteration count for deriving the vault key
pub const KDF_ITERATIONS: u32 = 100_000;

/// Size of the derived key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Prefix hashed together with the operator secret to produce the salt
const SALT_PREFIX: &str = "m365-gateway-credential-salt:";

/// Symmetric key used to encrypt credential secrets at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey([u8; KEY_SIZE]);

impl VaultKey {
    /// Wraps raw key bytes. Mostly useful in tests; production keys come from [`derive_key`].
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

/// Crypto errors
#[derive(Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// Operator secret is empty
    EmptySecret,
    /// Blob is not valid base64 or is too short to hold a nonce
    Malformed(String),
    /// Authentication tag mismatch (wrong key or corrupted data)
    Decryption,
    /// Encryption itself failed
    Encryption,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::EmptySecret => write!(f, "Operator secret must not be empty"),
            CryptoError::Malformed(msg) => write!(f, "Malformed ciphertext: {}", msg),
            CryptoError::Decryption => {
                write!(f, "Decryption failed (wrong secret or corrupted data)")
            }
            CryptoError::Encryption => write!(f, "Encryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Derives the salt for an operator secret: SHA-256(prefix || secret).
fn derive_salt(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SALT_PREFIX.as_bytes());
    hasher.update(secret.as_bytes());
    let mut salt = [0u8; 32];
    salt.copy_from_slice(&hasher.finalize());
    salt
}

/// Derives the vault key from the operator secret.
///
/// Deterministic: the same secret always produces the same key.
pub fn derive_key(secret: &str) -> Result<VaultKey, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }

    let salt = derive_salt(secret);
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), &salt, KDF_ITERATIONS, &mut key);

    Ok(VaultKey(key))
}

/// Encrypts plaintext with a fresh random nonce.
///
/// Returns `base64(nonce || ciphertext)`.
pub fn encrypt(plaintext: &str, key: &VaultKey) -> Result<String, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encryption)?;

    // Never reuse a nonce under the same key
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encryption)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(blob))
}

/// Decrypts a blob produced by [`encrypt`].
pub fn decrypt(blob: &str, key: &VaultKey) -> Result<String, CryptoError> {
    let bytes = BASE64
        .decode(blob)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;

    if bytes.len() <= NONCE_SIZE {
        return Err(CryptoError::Malformed(format!(
            "expected more than {} bytes, got {}",
            NONCE_SIZE,
            bytes.len()
        )));
    }

    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
    let cipher =
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Decryption)?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption)?;

    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::Malformed("plaintext is not valid UTF-8".to_string()))
}
