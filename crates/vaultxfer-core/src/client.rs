//! Control-channel client: one connection, one command, one response.

use std::path::Path;
use thiserror::Error;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::channel::{ChannelAuth, ChannelError, SecureChannel};
use crate::config::{ConfigStub, RemoteConfig};
use crate::crypto::{self, KEY_LEN};
use crate::protocol::{self, ErrorCode, ProtocolError, Request, Response};
use crate::token::{Permissions, TransferToken};
use crate::vault::restrict_permissions;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot reach server: {0}")]
    Connect(#[from] std::io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Wire(#[from] ProtocolError),
    #[error("server error ({code:?}): {message}")]
    Command { code: ErrorCode, message: String },
    #[error("unexpected response kind from server")]
    Unexpected,
}

pub struct CommandClient {
    addr: String,
    auth: ChannelAuth,
}

impl CommandClient {
    pub fn new(addr: impl Into<String>, client_key: [u8; KEY_LEN]) -> Self {
        Self {
            addr: addr.into(),
            auth: ChannelAuth::ClientKey(client_key),
        }
    }

    /// Keyless client for first-boot provisioning; the server only honors
    /// this before it is initialized.
    pub fn bootstrap(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            auth: ChannelAuth::Bootstrap,
        }
    }

    /// Run one request/response exchange. Error responses become
    /// [`ClientError::Command`].
    pub async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        let channel = SecureChannel::connect(&self.auth, &mut stream).await?;

        channel
            .send_frame(&mut stream, &protocol::encode(request)?)
            .await?;
        let payload = channel.recv_frame(&mut stream).await?;

        match protocol::decode_response(&payload)? {
            Response::Error { code, message } => Err(ClientError::Command { code, message }),
            response => Ok(response),
        }
    }

    pub async fn init_server(&self, remote: RemoteConfig) -> Result<String, ClientError> {
        match self.send(&Request::InitServer { remote }).await? {
            Response::Initialized { client_key, .. } => Ok(client_key),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn get_config(&self) -> Result<ConfigStub, ClientError> {
        match self.send(&Request::GetConfig).await? {
            Response::Config { config } => Ok(config),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<String, ClientError> {
        match self
            .send(&Request::CreateBucket {
                bucket: bucket.into(),
            })
            .await?
        {
            Response::Ok { message } => Ok(message),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn create_subfolder(
        &self,
        bucket: &str,
        subfolder: &str,
    ) -> Result<String, ClientError> {
        match self
            .send(&Request::CreateSubfolder {
                bucket: bucket.into(),
                subfolder: subfolder.into(),
            })
            .await?
        {
            Response::Ok { message } => Ok(message),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn create_token(
        &self,
        bucket: &str,
        permissions: Permissions,
        ttl_secs: i64,
    ) -> Result<TransferToken, ClientError> {
        match self
            .send(&Request::CreateToken {
                bucket: bucket.into(),
                permissions,
                ttl_secs,
            })
            .await?
        {
            Response::Token { token } => Ok(token),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn validate_token(&self, token_id: Uuid) -> Result<TransferToken, ClientError> {
        match self.send(&Request::ValidateToken { token_id }).await? {
            Response::Token { token } => Ok(token),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn revoke_token(&self, token_id: Uuid) -> Result<String, ClientError> {
        match self.send(&Request::RevokeToken { token_id }).await? {
            Response::Ok { message } => Ok(message),
            _ => Err(ClientError::Unexpected),
        }
    }

    pub async fn log_transfer(&self, entry: AuditEntry) -> Result<(), ClientError> {
        match self.send(&Request::LogTransfer { entry }).await? {
            Response::Ok { .. } => Ok(()),
            _ => Err(ClientError::Unexpected),
        }
    }
}

/// Persist the administrator-issued client key, owner-only.
pub fn save_client_key(path: &Path, key_hex: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, key_hex.trim())?;
    restrict_permissions(path)
}

/// Load the stored client key, if this installation has been initialized.
pub fn load_client_key(path: &Path) -> anyhow::Result<Option<[u8; KEY_LEN]>> {
    if !path.exists() {
        return Ok(None);
    }
    let hex_key = std::fs::read_to_string(path)?;
    let key = crypto::decode_key(hex_key.trim())
        .map_err(|_| anyhow::anyhow!("client key file {:?} is not a valid key", path))?;
    Ok(Some(key))
}
