//! vaultxfer core - capability-scoped encrypted file transfer.
//!
//! Buckets on a remote store are reachable only through time-limited
//! Transfer Tokens. The control channel carries one administrative command
//! per authenticated connection; the data plane encrypts every payload
//! under the token's own key.

pub mod audit;
pub mod channel;
pub mod client;
pub mod config;
pub mod crypto;
pub mod pipeline;
pub mod protocol;
pub mod recursive;
pub mod server;
pub mod token;
pub mod vault;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditLog, TransferAction};
pub use client::CommandClient;
pub use config::{ConfigStub, RemoteConfig, ServerConfig};
pub use pipeline::TransferPipeline;
pub use server::Server;
pub use token::{Permissions, TokenStore, TransferToken};
pub use vault::ConfigVault;
