//! Encrypted-at-rest persistence of the server configuration.
//!
//! Sensitive connection fields and the token table are sealed individually
//! under a locally held vault key. The key file is the trust boundary:
//! whoever can read it can decrypt the settings. Both files are owner-only
//! and are created together; settings without a matching key are corrupt,
//! never an empty config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{RemoteConfig, ServerConfig};
use crate::crypto::{self, CryptoError, KEY_LEN};
use crate::token::TokenStore;

const SETTINGS_FILE: &str = "settings.json";
const VAULT_KEY_FILE: &str = "vault_key";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("server already initialized")]
    AlreadyInitialized,
    #[error("vault corrupted: {0}")]
    Corrupted(String),
    #[error("vault i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("config sealing failed: {0}")]
    Seal(#[from] CryptoError),
}

/// On-disk form: each sensitive field is an independently sealed hex blob.
#[derive(Serialize, Deserialize)]
struct SealedConfig {
    user_id: Uuid,
    host: String,
    port: String,
    username: String,
    password: String,
    storage_root: String,
    tokens: String,
}

pub struct ConfigVault {
    dir: PathBuf,
}

impl ConfigVault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(VAULT_KEY_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.settings_path().exists()
    }

    /// One-shot provisioning: generate a vault key, seal and persist the
    /// config, and return the key string for out-of-band client bootstrap.
    pub fn initialize(&self, config: &ServerConfig) -> Result<String, VaultError> {
        if self.is_initialized() {
            return Err(VaultError::AlreadyInitialized);
        }
        fs::create_dir_all(&self.dir)?;

        // The settings file written last is the commit marker; if this is
        // interrupted after the key write, the orphan key is overwritten
        // on retry and never authenticates anything.
        let key = Zeroizing::new(crypto::generate_key());
        let key_hex = hex::encode(key.as_slice());
        fs::write(self.key_path(), &key_hex)?;
        restrict_permissions(&self.key_path())?;

        self.write_sealed(config, &key)?;
        tracing::info!("vault initialized at {:?}", self.dir);
        Ok(key_hex)
    }

    /// The locally held vault key, if this installation has one.
    pub fn vault_key(&self) -> Result<Option<[u8; KEY_LEN]>, VaultError> {
        if !self.key_path().exists() {
            return Ok(None);
        }
        let hex_key = fs::read_to_string(self.key_path())?;
        let key = crypto::decode_key(hex_key.trim())
            .map_err(|_| VaultError::Corrupted("vault key file is not a valid key".into()))?;
        Ok(Some(key))
    }

    /// Load and unseal the configuration. `None` means uninitialized;
    /// anything unreadable or undecryptable is `Corrupted`.
    pub fn load(&self) -> Result<Option<ServerConfig>, VaultError> {
        if !self.is_initialized() {
            return Ok(None);
        }
        let key = Zeroizing::new(self.vault_key()?.ok_or_else(|| {
            VaultError::Corrupted("settings exist but the vault key file is missing".into())
        })?);

        let raw = fs::read_to_string(self.settings_path())?;
        let sealed: SealedConfig = serde_json::from_str(&raw)
            .map_err(|e| VaultError::Corrupted(format!("settings file unreadable: {e}")))?;

        let host = unseal_string(&key, &sealed.host, "host")?;
        let port_str = unseal_string(&key, &sealed.port, "port")?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| VaultError::Corrupted("port field is not an integer".into()))?;
        let username = unseal_string(&key, &sealed.username, "username")?;
        let password = unseal_string(&key, &sealed.password, "password")?;
        let tokens_json = unseal_string(&key, &sealed.tokens, "tokens")?;
        let tokens: TokenStore = serde_json::from_str(&tokens_json)
            .map_err(|e| VaultError::Corrupted(format!("token table unreadable: {e}")))?;

        Ok(Some(ServerConfig {
            user_id: sealed.user_id,
            remote: RemoteConfig {
                host,
                port,
                username,
                password,
                storage_root: sealed.storage_root,
            },
            tokens,
        }))
    }

    /// Re-seal and overwrite the settings file atomically.
    pub fn save(&self, config: &ServerConfig) -> Result<(), VaultError> {
        let key = Zeroizing::new(self.vault_key()?.ok_or_else(|| {
            VaultError::Corrupted("cannot save: vault key file is missing".into())
        })?);
        self.write_sealed(config, &key)
    }

    fn write_sealed(&self, config: &ServerConfig, key: &[u8; KEY_LEN]) -> Result<(), VaultError> {
        let sealed = SealedConfig {
            user_id: config.user_id,
            host: seal_string(key, &config.remote.host)?,
            port: seal_string(key, &config.remote.port.to_string())?,
            username: seal_string(key, &config.remote.username)?,
            password: seal_string(key, &config.remote.password)?,
            storage_root: config.remote.storage_root.clone(),
            tokens: seal_string(key, &serde_json::to_string(&config.tokens)?)?,
        };
        let json = serde_json::to_string_pretty(&sealed)?;

        // Write to a temp file in the same directory, then rename, so an
        // interrupted save never leaves a torn settings file behind.
        let temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        fs::write(temp.path(), json)?;
        restrict_permissions(temp.path())?;
        temp.persist(self.settings_path()).map_err(|e| e.error)?;
        Ok(())
    }
}

fn seal_string(key: &[u8; KEY_LEN], value: &str) -> Result<String, VaultError> {
    let sealed = crypto::encrypt(key, value.as_bytes())?;
    Ok(hex::encode(sealed))
}

fn unseal_string(key: &[u8; KEY_LEN], sealed_hex: &str, field: &str) -> Result<String, VaultError> {
    let sealed = hex::decode(sealed_hex)
        .map_err(|_| VaultError::Corrupted(format!("{field} field is not hex")))?;
    let plain = crypto::decrypt(key, &sealed)
        .map_err(|_| VaultError::Corrupted(format!("{field} field failed to decrypt")))?;
    String::from_utf8(plain)
        .map_err(|_| VaultError::Corrupted(format!("{field} field is not utf-8")))
}

/// Owner read/write only. Secrets and audit records all get this.
#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
