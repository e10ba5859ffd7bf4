//! Control-channel server: accept loop, per-connection workers, and the
//! command dispatcher.
//!
//! Every command that touches configuration reloads and re-decrypts it
//! under one lock, so concurrent token creation and revocation never race
//! a stale in-memory copy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use remote_store::RemoteStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::audit::AuditLog;
use crate::channel::{ChannelAuth, SecureChannel};
use crate::config::ServerConfig;
use crate::protocol::{self, ErrorCode, Request, Response};
use crate::token::TokenError;
use crate::vault::{ConfigVault, VaultError};

/// A client that connects but never completes its exchange must not wedge
/// a worker forever.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(20);

struct ServerInner {
    vault: ConfigVault,
    audit: AuditLog,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<Mutex<ServerInner>>,
    store: Arc<dyn RemoteStore>,
}

impl Server {
    pub fn new(vault: ConfigVault, store: Arc<dyn RemoteStore>, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServerInner { vault, audit })),
            store,
        }
    }

    /// Accept connections until the listener fails; one worker task per
    /// connection, one command per worker.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener address")?;
        tracing::info!("vaultxfer server listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            tracing::debug!("connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                match timeout(EXCHANGE_TIMEOUT, server.handle_connection(stream)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("connection from {} failed: {:#}", peer, e),
                    Err(_) => tracing::warn!("connection from {} timed out", peer),
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let auth = {
            let inner = self.inner.lock().await;
            // The settings file is the provisioning commit marker. A key
            // file without settings is debris from an interrupted
            // initialize; demanding that key would lock out the bootstrap
            // retry, since it was never handed to anyone.
            if inner.vault.is_initialized() {
                let key = inner
                    .vault
                    .vault_key()?
                    .context("settings exist but the vault key file is missing")?;
                ChannelAuth::ClientKey(key)
            } else {
                ChannelAuth::Bootstrap
            }
        };

        let channel = SecureChannel::accept(&auth, &mut stream)
            .await
            .context("channel handshake")?;
        let payload = channel
            .recv_frame(&mut stream)
            .await
            .context("reading command")?;

        let response = match protocol::decode_request(&payload) {
            Ok(request) => self.dispatch(request).await,
            Err(error_response) => error_response,
        };

        let bytes = protocol::encode(&response).context("encoding response")?;
        channel
            .send_frame(&mut stream, &bytes)
            .await
            .context("sending response")?;
        Ok(())
    }

    /// Serve one command. Takes the state lock for the whole
    /// load/modify/persist cycle.
    pub async fn dispatch(&self, request: Request) -> Response {
        let inner = self.inner.lock().await;
        match request {
            Request::InitServer { remote } => {
                let config = ServerConfig::new(remote);
                match inner.vault.initialize(&config) {
                    Ok(client_key) => Response::Initialized {
                        message: "server initialized".into(),
                        client_key,
                    },
                    Err(VaultError::AlreadyInitialized) => Response::error(
                        ErrorCode::AlreadyInitialized,
                        "server already initialized",
                    ),
                    Err(e) => internal(e),
                }
            }

            Request::GetConfig => match load_config(&inner.vault) {
                Ok(config) => Response::Config {
                    config: config.stub(),
                },
                Err(response) => response,
            },

            Request::CreateBucket { bucket } => {
                if !valid_name(&bucket) {
                    return Response::error(ErrorCode::BadRequest, "invalid bucket name");
                }
                if let Err(response) = load_config(&inner.vault) {
                    return response;
                }
                match self.store.mkdir(&bucket).await {
                    Ok(()) => Response::ok(format!("bucket '{bucket}' created")),
                    Err(e) => Response::error(ErrorCode::Remote, e.to_string()),
                }
            }

            Request::CreateSubfolder { bucket, subfolder } => {
                if !valid_name(&bucket) || !valid_name(&subfolder) {
                    return Response::error(ErrorCode::BadRequest, "invalid folder name");
                }
                if let Err(response) = load_config(&inner.vault) {
                    return response;
                }
                match self.store.mkdir(&format!("{bucket}/{subfolder}")).await {
                    Ok(()) => Response::ok(format!(
                        "subfolder '{subfolder}' created in bucket '{bucket}'"
                    )),
                    Err(e) => Response::error(ErrorCode::Remote, e.to_string()),
                }
            }

            Request::CreateToken {
                bucket,
                permissions,
                ttl_secs,
            } => {
                if !valid_name(&bucket) {
                    return Response::error(ErrorCode::BadRequest, "invalid bucket name");
                }
                if ttl_secs <= 0 {
                    return Response::error(ErrorCode::BadRequest, "ttl must be positive");
                }
                let mut config = match load_config(&inner.vault) {
                    Ok(config) => config,
                    Err(response) => return response,
                };
                let token = match config.tokens.create(
                    bucket,
                    permissions,
                    chrono::Duration::seconds(ttl_secs),
                ) {
                    Ok(token) => token,
                    Err(TokenError::EmptyPermissions) => {
                        return Response::error(
                            ErrorCode::EmptyPermissions,
                            "token must grant at least one permission",
                        )
                    }
                    Err(e) => return internal(e),
                };
                if let Err(e) = inner.vault.save(&config) {
                    return internal(e);
                }
                Response::Token { token }
            }

            Request::ValidateToken { token_id } => {
                let config = match load_config(&inner.vault) {
                    Ok(config) => config,
                    Err(response) => return response,
                };
                match config.tokens.validate(token_id) {
                    Ok(token) => Response::Token {
                        token: token.clone(),
                    },
                    // Absent and expired are deliberately indistinguishable.
                    Err(TokenError::NotFound) | Err(TokenError::Expired) => {
                        Response::error(ErrorCode::InvalidToken, "invalid or expired token")
                    }
                    Err(e) => internal(e),
                }
            }

            Request::RevokeToken { token_id } => {
                let mut config = match load_config(&inner.vault) {
                    Ok(config) => config,
                    Err(response) => return response,
                };
                config.tokens.revoke(token_id);
                match inner.vault.save(&config) {
                    Ok(()) => Response::ok(format!("token {token_id} revoked")),
                    Err(e) => internal(e),
                }
            }

            Request::LogTransfer { entry } => {
                if let Err(response) = load_config(&inner.vault) {
                    return response;
                }
                match inner.audit.append(&entry) {
                    Ok(()) => Response::ok("transfer logged"),
                    Err(e) => internal(e),
                }
            }
        }
    }
}

fn load_config(vault: &ConfigVault) -> Result<ServerConfig, Response> {
    match vault.load() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Err(Response::error(
            ErrorCode::NotInitialized,
            "server not initialized",
        )),
        Err(e) => Err(internal(e)),
    }
}

fn internal(err: impl std::fmt::Display) -> Response {
    tracing::error!("command failed: {}", err);
    Response::error(ErrorCode::Internal, err.to_string())
}

/// Bucket and subfolder names are single path components.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEntry, TransferAction};
    use crate::config::RemoteConfig;
    use crate::token::Permissions;
    use remote_store::LocalDirStore;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_server(dir: &TempDir) -> Server {
        let vault = ConfigVault::new(dir.path().join("vault"));
        let store = LocalDirStore::new(dir.path().join("storage")).unwrap();
        let audit = AuditLog::new(dir.path().join("transfers.jsonl"));
        Server::new(vault, Arc::new(store), audit)
    }

    fn remote() -> RemoteConfig {
        RemoteConfig {
            host: "store.example".into(),
            port: 22,
            username: "xfer".into(),
            password: "pw".into(),
            storage_root: "/srv/storage".into(),
        }
    }

    async fn init(server: &Server) -> String {
        match server
            .dispatch(Request::InitServer { remote: remote() })
            .await
        {
            Response::Initialized { client_key, .. } => client_key,
            other => panic!("init failed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_init_server_is_one_shot() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        init(&server).await;

        let second = server
            .dispatch(Request::InitServer { remote: remote() })
            .await;
        assert!(matches!(
            second,
            Response::Error {
                code: ErrorCode::AlreadyInitialized,
                ..
            }
        ));

        // The first configuration survives the rejected re-init.
        match server.dispatch(Request::GetConfig).await {
            Response::Config { config } => assert_eq!(config.host, "store.example"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commands_require_initialization() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        for request in [
            Request::GetConfig,
            Request::CreateBucket {
                bucket: "archive".into(),
            },
            Request::ValidateToken {
                token_id: Uuid::new_v4(),
            },
        ] {
            let response = server.dispatch(request).await;
            assert!(
                matches!(
                    response,
                    Response::Error {
                        code: ErrorCode::NotInitialized,
                        ..
                    }
                ),
                "unexpected {response:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        init(&server).await;

        let token = match server
            .dispatch(Request::CreateToken {
                bucket: "archive".into(),
                permissions: Permissions {
                    read: true,
                    write: true,
                    delete: false,
                },
                ttl_secs: 3600,
            })
            .await
        {
            Response::Token { token } => token,
            other => panic!("unexpected {other:?}"),
        };

        match server
            .dispatch(Request::ValidateToken { token_id: token.id })
            .await
        {
            Response::Token { token: found } => assert_eq!(found, token),
            other => panic!("unexpected {other:?}"),
        }

        server
            .dispatch(Request::RevokeToken { token_id: token.id })
            .await;
        let after = server
            .dispatch(Request::ValidateToken { token_id: token.id })
            .await;
        assert!(matches!(
            after,
            Response::Error {
                code: ErrorCode::InvalidToken,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_create_token_rejects_empty_permissions() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        init(&server).await;

        let response = server
            .dispatch(Request::CreateToken {
                bucket: "archive".into(),
                permissions: Permissions::default(),
                ttl_secs: 3600,
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::EmptyPermissions,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_create_bucket_and_subfolder() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        init(&server).await;

        assert!(matches!(
            server
                .dispatch(Request::CreateBucket {
                    bucket: "archive".into()
                })
                .await,
            Response::Ok { .. }
        ));
        assert!(matches!(
            server
                .dispatch(Request::CreateSubfolder {
                    bucket: "archive".into(),
                    subfolder: "2026".into()
                })
                .await,
            Response::Ok { .. }
        ));
        assert!(dir.path().join("storage/archive/2026").is_dir());

        // A second create reports the remote failure instead of lying.
        assert!(matches!(
            server
                .dispatch(Request::CreateBucket {
                    bucket: "archive".into()
                })
                .await,
            Response::Error {
                code: ErrorCode::Remote,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bucket_names_are_single_components() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        init(&server).await;

        for bad in ["", "a/b", "..", "."] {
            let response = server
                .dispatch(Request::CreateBucket { bucket: bad.into() })
                .await;
            assert!(
                matches!(
                    response,
                    Response::Error {
                        code: ErrorCode::BadRequest,
                        ..
                    }
                ),
                "name {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_log_transfer_requires_initialization() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        // Pre-provisioning the channel is unauthenticated, so an audit
        // append here would let anyone forge records.
        let entry = AuditEntry::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TransferAction::Upload,
            "archive/a.bin",
            None,
        );
        let response = server.dispatch(Request::LogTransfer { entry }).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::NotInitialized,
                ..
            }
        ));
        assert!(!dir.path().join("transfers.jsonl").exists());
    }

    #[tokio::test]
    async fn test_log_transfer_appends() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        init(&server).await;

        let entry = AuditEntry::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TransferAction::Upload,
            "archive/a.bin",
            Some("/tmp/a.bin".into()),
        );
        assert!(matches!(
            server
                .dispatch(Request::LogTransfer {
                    entry: entry.clone()
                })
                .await,
            Response::Ok { .. }
        ));

        let log = AuditLog::new(dir.path().join("transfers.jsonl"));
        assert_eq!(log.read_all().unwrap(), vec![entry]);
    }
}
