//! Persisted upstream credential.
//!
//! The gateway holds exactly one delegated credential at a time. The record
//! only ever carries ciphertext: the [`crate::vault`] encrypts before writing
//! and decrypts after reading, so nothing in this module sees a plaintext token.
//!
//! ```text
//! ┌──────────────────────────┐
//! │ TokenVault               │  encrypt / decrypt, refresh
//! └──────────────────────────┘
//!          ↓            ↑
//! ┌──────────────────────────┐
//! │ CredentialStore          │  replace / get / update_tokens / delete_all
//! └──────────────────────────┘
//!          ↓            ↑
//! ┌──────────────────────────┐
//! │ SQLite `credentials`     │  at most one row
//! └──────────────────────────┘
//! ```

use chrono::{DateTime, Utc};

mod storage;

pub use storage::CredentialStore;

/// The single stored upstream credential.
///
/// `access_secret` and `refresh_secret` are opaque encrypted blobs.
#[derive(Clone, Debug, PartialEq)]
pub struct Credential {
    /// Upstream account identity (e.g. the signed-in user's principal name)
    pub identity: String,

    /// Encrypted access token
    pub access_secret: String,

    /// Encrypted refresh token
    pub refresh_secret: String,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
}
