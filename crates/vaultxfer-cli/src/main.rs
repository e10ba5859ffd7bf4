use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use remote_store::LocalDirStore;
use vaultxfer_core::client::{load_client_key, save_client_key};
use vaultxfer_core::pipeline::remote_full_path;
use vaultxfer_core::recursive::DeleteReport;
use vaultxfer_core::{
    AuditEntry, AuditLog, CommandClient, ConfigStub, ConfigVault, Permissions, RemoteConfig,
    Server, TransferAction, TransferPipeline, TransferToken,
};

#[derive(Parser, Debug)]
#[command(name = "vaultxfer", version, about = "Token-scoped encrypted file transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for keys and server state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Control-channel address of the server (host:port)
    #[arg(long, global = true, default_value = "127.0.0.1:9440")]
    server: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-channel server
    Server {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:9440")]
        bind: String,

        /// Directory backing the remote store
        #[arg(long)]
        storage: Option<PathBuf>,
    },

    /// Store an administrator-issued client key and verify it against the
    /// server
    Init {
        /// Hex client key issued at server provisioning
        #[arg(long)]
        client_key: String,
    },

    /// Provision an uninitialized server and store the issued client key
    InitServer {
        /// Storage backend host
        #[arg(long)]
        host: String,

        /// Storage backend port
        #[arg(long, default_value_t = 22)]
        port: u16,

        /// Storage backend username
        #[arg(long)]
        username: String,

        /// Storage backend password
        #[arg(long)]
        password: String,

        /// Root path for buckets on the storage backend
        #[arg(long)]
        storage_root: String,
    },

    /// Show the server configuration (secrets withheld)
    Info {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a bucket
    CreateBucket {
        /// Bucket name
        #[arg(long)]
        bucket: String,
    },

    /// Create a subfolder directly under a bucket
    CreateSubfolder {
        /// Bucket name
        #[arg(long)]
        bucket: String,

        /// Subfolder name
        #[arg(long)]
        subfolder: String,
    },

    /// Mint a Transfer Token for a bucket
    CreateToken {
        /// Bucket the token is scoped to
        #[arg(long)]
        bucket: String,

        /// Grant read access
        #[arg(long)]
        read: bool,

        /// Grant write access
        #[arg(long)]
        write: bool,

        /// Grant delete access
        #[arg(long)]
        delete: bool,

        /// Token lifetime in days
        #[arg(long, default_value_t = 1)]
        expiry_days: u32,
    },

    /// Revoke a Transfer Token
    RevokeToken {
        /// Token id
        #[arg(long)]
        token: Uuid,
    },

    /// Upload one file into the token's bucket
    Upload {
        /// Token id
        #[arg(long)]
        token: Uuid,

        /// Local file to upload
        #[arg(long)]
        file: PathBuf,

        /// Destination path relative to the bucket
        #[arg(long)]
        to: String,
    },

    /// Download one file from the token's bucket
    Download {
        /// Token id
        #[arg(long)]
        token: Uuid,

        /// Source path relative to the bucket
        #[arg(long)]
        from: String,

        /// Local destination file
        #[arg(long)]
        output: PathBuf,
    },

    /// Delete one remote file
    Delete {
        /// Token id
        #[arg(long)]
        token: Uuid,

        /// Path relative to the bucket
        #[arg(long)]
        path: String,
    },

    /// Upload a directory tree into the token's bucket
    UploadFolder {
        /// Token id
        #[arg(long)]
        token: Uuid,

        /// Local directory to upload
        #[arg(long)]
        dir: PathBuf,

        /// Destination path relative to the bucket
        #[arg(long)]
        to: String,
    },

    /// Recursively delete a remote folder
    DeleteFolder {
        /// Token id
        #[arg(long)]
        token: Uuid,

        /// Path relative to the bucket
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vaultxfer")
    });
    let key_path = data_dir.join("client_key");

    match cli.cmd {
        Commands::Server { bind, storage } => {
            run_server(&data_dir, &bind, storage).await?;
        }

        Commands::Init { client_key } => {
            save_client_key(&key_path, &client_key)?;
            let client = connect(&cli.server, &key_path)?;
            let stub = client
                .get_config()
                .await
                .context("Key stored, but the server rejected it")?;

            println!("✓ Client key stored at: {}", key_path.display());
            print_info(&stub);
        }

        Commands::InitServer {
            host,
            port,
            username,
            password,
            storage_root,
        } => {
            let remote = RemoteConfig {
                host,
                port,
                username,
                password,
                storage_root,
            };
            let key_hex = CommandClient::bootstrap(&cli.server)
                .init_server(remote)
                .await?;
            save_client_key(&key_path, &key_hex)?;

            println!("✓ Server initialized");
            println!("  Client key stored at: {}", key_path.display());
        }

        Commands::Info { json } => {
            let client = connect(&cli.server, &key_path)?;
            let stub = client.get_config().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stub)?);
            } else {
                print_info(&stub);
            }
        }

        Commands::CreateBucket { bucket } => {
            let client = connect(&cli.server, &key_path)?;
            let message = client.create_bucket(&bucket).await?;
            println!("✓ {}", message);
        }

        Commands::CreateSubfolder { bucket, subfolder } => {
            let client = connect(&cli.server, &key_path)?;
            let message = client.create_subfolder(&bucket, &subfolder).await?;
            println!("✓ {}", message);
        }

        Commands::CreateToken {
            bucket,
            read,
            write,
            delete,
            expiry_days,
        } => {
            let client = connect(&cli.server, &key_path)?;
            let ttl_secs = i64::from(expiry_days) * 86_400;
            let token = client
                .create_token(&bucket, Permissions { read, write, delete }, ttl_secs)
                .await?;
            print_token(&token);
        }

        Commands::RevokeToken { token } => {
            let client = connect(&cli.server, &key_path)?;
            let message = client.revoke_token(token).await?;
            println!("✓ {}", message);
        }

        Commands::Upload { token, file, to } => {
            let (client, stub, token) = open_data_plane(&cli.server, &key_path, token).await?;
            let pipeline = mount_pipeline(&stub)?;

            let remote = pipeline.upload(&token, &file, &to).await?;
            audit(&client, &stub, &token, TransferAction::Upload, &remote, Some(&file)).await?;
            println!("✓ Uploaded {} to {}", file.display(), remote);
        }

        Commands::Download { token, from, output } => {
            let (client, stub, token) = open_data_plane(&cli.server, &key_path, token).await?;
            let pipeline = mount_pipeline(&stub)?;

            let remote = pipeline.download(&token, &from, &output).await?;
            audit(
                &client,
                &stub,
                &token,
                TransferAction::Download,
                &remote,
                Some(&output),
            )
            .await?;
            println!("✓ Downloaded {} to {}", remote, output.display());
        }

        Commands::Delete { token, path } => {
            let (client, stub, token) = open_data_plane(&cli.server, &key_path, token).await?;
            let pipeline = mount_pipeline(&stub)?;

            let remote = pipeline.delete(&token, &path).await?;
            audit(&client, &stub, &token, TransferAction::Delete, &remote, None).await?;
            println!("✓ Deleted {}", remote);
        }

        Commands::UploadFolder { token, dir, to } => {
            let (client, stub, token) = open_data_plane(&cli.server, &key_path, token).await?;
            let pipeline = mount_pipeline(&stub)?;

            let count = pipeline.upload_folder(&token, &dir, &to).await?;
            let remote = remote_full_path(&token, &to);
            audit(
                &client,
                &stub,
                &token,
                TransferAction::UploadFolder,
                &remote,
                Some(&dir),
            )
            .await?;
            println!("✓ Uploaded {} file(s) from {}", count, dir.display());
        }

        Commands::DeleteFolder { token, path } => {
            let (client, stub, token) = open_data_plane(&cli.server, &key_path, token).await?;
            let pipeline = mount_pipeline(&stub)?;

            let report = pipeline.delete_folder(&token, &path).await?;
            let remote = remote_full_path(&token, &path);
            audit(
                &client,
                &stub,
                &token,
                TransferAction::DeleteFolder,
                &remote,
                None,
            )
            .await?;
            print_delete_report(&report);
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run_server(data_dir: &PathBuf, bind: &str, storage: Option<PathBuf>) -> Result<()> {
    let storage = storage.unwrap_or_else(|| data_dir.join("storage"));
    let vault = ConfigVault::new(data_dir.join("vault"));
    let store = LocalDirStore::new(&storage)?;
    let log = AuditLog::new(data_dir.join("transfers.jsonl"));
    let server = Server::new(vault, Arc::new(store), log);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    println!("✓ Listening on {}", bind);
    println!("  Storage: {}", storage.display());
    println!("  Press Ctrl+C to stop");

    server.run(listener).await?;
    Ok(())
}

fn connect(server: &str, key_path: &std::path::Path) -> Result<CommandClient> {
    let key = load_client_key(key_path)?
        .context("No client key. Run 'vaultxfer init' or 'vaultxfer init-server' first.")?;
    Ok(CommandClient::new(server, key))
}

/// Validate the token over the control channel and fetch the config stub;
/// everything a data-plane command needs.
async fn open_data_plane(
    server: &str,
    key_path: &std::path::Path,
    token_id: Uuid,
) -> Result<(CommandClient, ConfigStub, TransferToken)> {
    let client = connect(server, key_path)?;
    let token = client
        .validate_token(token_id)
        .await
        .context("Token rejected by server")?;
    let stub = client.get_config().await?;
    Ok((client, stub, token))
}

/// The remote share is expected to be mounted at the configured storage
/// root.
fn mount_pipeline(stub: &ConfigStub) -> Result<TransferPipeline> {
    let store = LocalDirStore::new(&stub.storage_root)?;
    Ok(TransferPipeline::new(Arc::new(store)))
}

async fn audit(
    client: &CommandClient,
    stub: &ConfigStub,
    token: &TransferToken,
    action: TransferAction,
    remote_path: &str,
    local_path: Option<&std::path::Path>,
) -> Result<()> {
    let entry = AuditEntry::new(
        stub.user_id,
        token.id,
        action,
        remote_path,
        local_path.map(|p| p.display().to_string()),
    );
    client
        .log_transfer(entry)
        .await
        .context("Transfer completed but could not be audited")?;
    Ok(())
}

fn print_info(stub: &ConfigStub) {
    println!("Server configuration:");
    println!("  Installation: {}", stub.user_id);
    println!("  Storage host: {}:{}", stub.host, stub.port);
    println!("  Storage user: {}", stub.username);
    println!("  Storage root: {}", stub.storage_root);
}

fn print_token(token: &TransferToken) {
    println!("✓ Token created");
    println!("  Id: {}", token.id);
    println!("  Bucket: {}", token.bucket);
    println!(
        "  Permissions: read={} write={} delete={}",
        token.permissions.read, token.permissions.write, token.permissions.delete
    );
    println!("  Expires: {}", token.expiry);
    println!("  Payload key: {}", token.key);
    println!("  The payload key is shown once; store it with the token id.");
}

fn print_delete_report(report: &DeleteReport) {
    println!("✓ Removed {} item(s)", report.removed.len());
    if !report.is_clean() {
        println!("✗ {} item(s) could not be removed:", report.failed.len());
        for (path, reason) in &report.failed {
            println!("    {} ({})", path, reason);
        }
    }
}
