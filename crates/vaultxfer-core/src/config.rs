use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::TokenStore;

/// Connection parameters for the remote storage backend. Host, port,
/// username, and password are sealed at rest by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Mount point of the storage root on the client side; not a secret.
    pub storage_root: String,
}

/// Full server-side configuration, including the token table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub user_id: Uuid,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub tokens: TokenStore,
}

impl ServerConfig {
    pub fn new(remote: RemoteConfig) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            remote,
            tokens: TokenStore::default(),
        }
    }

    /// The subset of the configuration that may leave the server boundary.
    /// Never carries the password or the token table.
    pub fn stub(&self) -> ConfigStub {
        ConfigStub {
            user_id: self.user_id,
            host: self.remote.host.clone(),
            port: self.remote.port,
            username: self.remote.username.clone(),
            storage_root: self.remote.storage_root.clone(),
        }
    }
}

/// Non-secret configuration returned to clients by `get_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStub {
    pub user_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub storage_root: String,
}
