//! Transfer Tokens: capability credentials scoping a bucket, a permission
//! set, an expiry, and a unique payload encryption key.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{self, CryptoError, KEY_LEN};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("token must grant at least one of read, write, delete")]
    EmptyPermissions,
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
}

/// The capability a data-plane operation needs from a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Delete,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub delete: bool,
}

impl Permissions {
    pub fn any(&self) -> bool {
        self.read || self.write || self.delete
    }

    pub fn allows(&self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            AccessKind::Delete => self.delete,
        }
    }
}

/// A Transfer Token. `bucket` and `key` never change after creation; the
/// token leaves the active set only through revocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferToken {
    pub id: Uuid,
    pub bucket: String,
    pub permissions: Permissions,
    /// Hex-encoded 32-byte payload key, unique to this token.
    pub key: String,
    /// Absolute UTC expiry; the token is valid iff `now < expiry`.
    pub expiry: DateTime<Utc>,
}

impl TransferToken {
    pub fn key_bytes(&self) -> Result<[u8; KEY_LEN], CryptoError> {
        crypto::decode_key(&self.key)
    }
}

/// The active token set, persisted as part of the server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenStore {
    tokens: Vec<TransferToken>,
}

impl TokenStore {
    /// Mint a token. The returned value is the only place the payload key
    /// is ever revealed to the creator.
    pub fn create(
        &mut self,
        bucket: impl Into<String>,
        permissions: Permissions,
        ttl: Duration,
    ) -> Result<TransferToken, TokenError> {
        if !permissions.any() {
            return Err(TokenError::EmptyPermissions);
        }
        let token = TransferToken {
            id: Uuid::new_v4(),
            bucket: bucket.into(),
            permissions,
            key: hex::encode(crypto::generate_key()),
            expiry: Utc::now() + ttl,
        };
        self.tokens.push(token.clone());
        tracing::info!("created token {} for bucket {}", token.id, token.bucket);
        Ok(token)
    }

    /// Look a token up by id, re-checking expiry on every call since
    /// revocation is not proactive.
    pub fn validate(&self, id: Uuid) -> Result<&TransferToken, TokenError> {
        let token = self
            .tokens
            .iter()
            .find(|t| t.id == id)
            .ok_or(TokenError::NotFound)?;
        if Utc::now() >= token.expiry {
            return Err(TokenError::Expired);
        }
        Ok(token)
    }

    /// Remove a token from the active set. Revoking an absent id is not an
    /// error, so retries are harmless.
    pub fn revoke(&mut self, id: Uuid) {
        let before = self.tokens.len();
        self.tokens.retain(|t| t.id != id);
        if self.tokens.len() < before {
            tracing::info!("revoked token {}", id);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> Permissions {
        Permissions {
            read: true,
            write: true,
            delete: false,
        }
    }

    #[test]
    fn test_create_and_validate() {
        let mut store = TokenStore::default();
        let token = store.create("archive", rw(), Duration::days(7)).unwrap();

        let found = store.validate(token.id).unwrap();
        assert_eq!(found, &token);
        assert_eq!(found.bucket, "archive");
        assert_eq!(found.key.len(), KEY_LEN * 2);
    }

    #[test]
    fn test_keys_are_unique_per_token() {
        let mut store = TokenStore::default();
        let a = store.create("archive", rw(), Duration::days(1)).unwrap();
        let b = store.create("archive", rw(), Duration::days(1)).unwrap();
        assert_ne!(a.key, b.key);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_empty_permissions_rejected_before_storage() {
        let mut store = TokenStore::default();
        let err = store
            .create("archive", Permissions::default(), Duration::days(1))
            .unwrap_err();
        assert_eq!(err, TokenError::EmptyPermissions);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_token_fails_validation() {
        let mut store = TokenStore::default();
        let token = store.create("archive", rw(), Duration::seconds(-1)).unwrap();
        assert_eq!(store.validate(token.id), Err(TokenError::Expired));
    }

    #[test]
    fn test_revoke_beats_expiry() {
        let mut store = TokenStore::default();
        let token = store.create("archive", rw(), Duration::days(7)).unwrap();
        store.revoke(token.id);
        assert_eq!(store.validate(token.id), Err(TokenError::NotFound));
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let mut store = TokenStore::default();
        let token = store.create("archive", rw(), Duration::days(7)).unwrap();
        store.revoke(token.id);
        store.revoke(token.id);
        store.revoke(Uuid::new_v4());
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let store = TokenStore::default();
        assert_eq!(store.validate(Uuid::new_v4()), Err(TokenError::NotFound));
    }
}
