use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use azblobfs::cadapter::client::{BlobBackend, ContainerAccess};
use azblobfs::cadapter::memory::MemoryBackend;
use azblobfs::config::StorageConfig;
use azblobfs::fuse::mount::mount_unprivileged;
use azblobfs::vfs::config::FsConfig;
use azblobfs::vfs::fs::BlobFs;

#[derive(Parser)]
#[command(name = "azblobfs", version, about = "Mount a blob storage account via FUSE")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the storage account.
    Mount(MountArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Signed HTTP calls against the blob service.
    Azure,
    /// Process-local storage, lost on unmount.
    Memory,
}

#[derive(Args)]
struct MountArgs {
    /// Directory to mount the filesystem.
    #[arg(value_name = "MOUNT_POINT")]
    mount_point: PathBuf,

    /// Storage account name.
    #[arg(long, env = "AZBLOBFS_ACCOUNT")]
    account: Option<String>,

    /// Base64 account key.
    #[arg(long, env = "AZBLOBFS_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Blob service host (defaults to blob.core.windows.net).
    #[arg(long, env = "AZBLOBFS_HOST")]
    host: Option<String>,

    /// Address the account in the URL path instead of the host name.
    #[arg(long)]
    path_style: bool,

    /// Use https.
    #[arg(long)]
    https: bool,

    /// Use the local storage emulator account.
    #[arg(long)]
    dev_storage: bool,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Create containers with public read access.
    #[arg(long)]
    public_containers: bool,

    #[arg(long, value_enum, default_value_t = BackendKind::Azure)]
    backend: BackendKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "azblobfs=info".to_string()))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Mount(args) => mount_cmd(args).await?,
    }

    Ok(())
}

fn storage_config(args: &MountArgs) -> anyhow::Result<StorageConfig> {
    let mut config = if args.dev_storage {
        StorageConfig::dev_storage()
    } else {
        let account = args
            .account
            .clone()
            .context("--account (or AZBLOBFS_ACCOUNT) is required")?;
        let key = args
            .key
            .clone()
            .context("--key (or AZBLOBFS_KEY) is required")?;
        StorageConfig::new(account, key, args.host.clone())
    };
    config.https |= args.https;
    config.path_style |= args.path_style;
    config.timeout = Duration::from_secs(args.timeout_secs);
    if args.public_containers {
        config.container_access = ContainerAccess::Public;
    }
    Ok(config)
}

async fn mount_cmd(args: MountArgs) -> anyhow::Result<()> {
    if !args.mount_point.exists() {
        std::fs::create_dir_all(&args.mount_point)?;
    }
    if !args.mount_point.is_dir() {
        anyhow::bail!("mount point must be a directory");
    }

    let (backend, fs_config): (Arc<dyn BlobBackend>, FsConfig) = match args.backend {
        BackendKind::Azure => {
            let config = storage_config(&args)?;
            info!(account = %config.account, host = %config.host, "connecting");
            let backend: Arc<dyn BlobBackend> = Arc::new(config.connect()?);
            (backend, config.fs_config())
        }
        BackendKind::Memory => {
            info!("using in-memory storage");
            let backend: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
            (backend, memory_fs_config(&args))
        }
    };

    let fs = BlobFs::mount(backend, fs_config)
        .await
        .context("initial container listing failed")?;
    let handle = mount_unprivileged(fs, &args.mount_point).await?;

    info!(mount_point = %args.mount_point.display(), "mounted");
    tokio::signal::ctrl_c().await?;
    info!("unmounting");
    handle.unmount().await?;
    Ok(())
}

/// The memory backend needs no account; only driver options apply.
fn memory_fs_config(args: &MountArgs) -> FsConfig {
    let mut config = FsConfig::default();
    if args.public_containers {
        config.container_access = ContainerAccess::Public;
    }
    config
}
