//! Stowage CLI - command line access to configured storage disks.
//!
//! Disks come from a JSON configuration file (`--config`, default
//! `stowage.json`); every command runs against the default disk unless
//! `--disk` names another.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stowage_common::{Error, StoragePath, Visibility};
use stowage_storage::{
    ByteStream, DiskRegistry, PutOptions, StorageConfig, StorageDriver, TemporaryUrlOptions,
    TimedOptions, DEFAULT_TEMPORARY_URL_TTL,
};

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Stowage - one interface over many storage backends")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Disk configuration file.
    #[arg(short, long, default_value = "stowage.json")]
    config: PathBuf,

    /// Disk to operate on (default disk when omitted).
    #[arg(short, long)]
    disk: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file.
    Put {
        /// Local source file.
        source: PathBuf,
        /// Destination path on the disk.
        dest: String,
        /// Store with public visibility.
        #[arg(long)]
        public: bool,
    },

    /// Download a file (to stdout unless --output is given).
    Get {
        path: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a file.
    Delete { path: String },

    /// Check whether a file exists.
    Exists { path: String },

    /// Copy a file within the disk.
    Copy { from: String, to: String },

    /// Move a file within the disk.
    Move { from: String, to: String },

    /// List files.
    Ls {
        #[arg(default_value = "")]
        dir: String,
        #[arg(short, long)]
        recursive: bool,
    },

    /// List directories.
    Dirs {
        #[arg(default_value = "")]
        dir: String,
        #[arg(short, long)]
        recursive: bool,
    },

    /// Show file metadata as JSON.
    Meta { path: String },

    /// Print the public URL of a file.
    Url { path: String },

    /// Issue a temporary URL.
    TempUrl {
        path: String,
        /// Lifetime in seconds.
        #[arg(long)]
        ttl: Option<u64>,
        /// Only this client address may use the link.
        #[arg(long)]
        ip: Option<IpAddr>,
        /// Only requests carrying this device id may use the link.
        #[arg(long)]
        device_id: Option<String>,
    },

    /// Upload a local file that expires after --ttl seconds.
    PutTimed {
        source: PathBuf,
        dest: String,
        #[arg(long)]
        ttl: u64,
    },

    /// Delete every expired file on the disk.
    Sweep,

    /// List configured disks.
    Disks,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = StorageConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let registry = DiskRegistry::build(config)
        .await
        .context("Failed to build disks")?;

    if let Commands::Disks = cli.command {
        return cmd_disks(&registry);
    }

    let driver = match &cli.disk {
        Some(name) => registry.driver(name),
        None => registry.default_disk().map(|disk| disk.driver.clone()),
    }
    .context("Failed to select disk")?;
    debug!(disk = ?cli.disk, driver = driver.name(), "Disk selected");

    match cli.command {
        Commands::Put {
            source,
            dest,
            public,
        } => cmd_put(driver, &source, &dest, public).await,

        Commands::Get { path, output } => cmd_get(driver, &path, output).await,

        Commands::Delete { path } => {
            driver
                .delete(&parse_path(&path)?)
                .await
                .context("Failed to delete file")?;
            println!("Deleted: {}", path);
            Ok(())
        }

        Commands::Exists { path } => {
            let exists = driver
                .exists(&parse_path(&path)?)
                .await
                .context("Failed to check file")?;
            println!("{}", exists);
            Ok(())
        }

        Commands::Copy { from, to } => {
            driver
                .copy(&parse_path(&from)?, &parse_path(&to)?)
                .await
                .context("Failed to copy file")?;
            println!("Copied {} -> {}", from, to);
            Ok(())
        }

        Commands::Move { from, to } => {
            driver
                .move_file(&parse_path(&from)?, &parse_path(&to)?)
                .await
                .context("Failed to move file")?;
            println!("Moved {} -> {}", from, to);
            Ok(())
        }

        Commands::Ls { dir, recursive } => {
            let files = driver
                .list_files(&parse_path(&dir)?, recursive)
                .await
                .context("Failed to list files")?;
            print_paths(&files);
            Ok(())
        }

        Commands::Dirs { dir, recursive } => {
            let dirs = driver
                .list_directories(&parse_path(&dir)?, recursive)
                .await
                .context("Failed to list directories")?;
            print_paths(&dirs);
            Ok(())
        }

        Commands::Meta { path } => {
            let metadata = driver
                .metadata(&parse_path(&path)?)
                .await
                .context("Failed to read metadata")?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }

        Commands::Url { path } => {
            let url = driver
                .url(&parse_path(&path)?)
                .await
                .context("Failed to build URL")?;
            println!("{}", url);
            Ok(())
        }

        Commands::TempUrl {
            path,
            ttl,
            ip,
            device_id,
        } => {
            let expires_in = ttl.map(Duration::from_secs).unwrap_or(DEFAULT_TEMPORARY_URL_TTL);
            let options = TemporaryUrlOptions { ip, device_id };
            let url = driver
                .temporary_url(&parse_path(&path)?, expires_in, options)
                .await
                .context("Failed to issue temporary URL")?;
            println!("{}", url);
            Ok(())
        }

        Commands::PutTimed { source, dest, ttl } => {
            let content = tokio::fs::read(&source)
                .await
                .context("Failed to read source file")?;
            let size = content.len();
            driver
                .put_timed(
                    &parse_path(&dest)?,
                    content.into(),
                    TimedOptions::ttl(Duration::from_secs(ttl)),
                )
                .await
                .context("Failed to upload file")?;
            println!("Uploaded {} ({} bytes), expires in {}s", dest, size, ttl);
            Ok(())
        }

        Commands::Sweep => {
            let deleted = driver
                .delete_expired()
                .await
                .context("Failed to delete expired files")?;
            info!(deleted, "Sweep finished");
            println!("Deleted {} expired file(s)", deleted);
            Ok(())
        }

        Commands::Disks => cmd_disks(&registry),
    }
}

fn parse_path(path: &str) -> Result<StoragePath> {
    StoragePath::parse(path).with_context(|| format!("Invalid path: {}", path))
}

fn print_paths(paths: &[StoragePath]) {
    if paths.is_empty() {
        println!("(empty)");
    }
    for path in paths {
        println!("{}", path);
    }
}

/// Upload a local file as a stream.
async fn cmd_put(
    driver: Arc<dyn StorageDriver>,
    source: &PathBuf,
    dest: &str,
    public: bool,
) -> Result<()> {
    info!("Uploading {} as {}", source.display(), dest);

    let file = tokio::fs::File::open(source)
        .await
        .context("Failed to open source file")?;
    let size = file.metadata().await?.len();
    let stream: ByteStream = Box::pin(ReaderStream::new(file).map(|chunk| chunk.map_err(Error::from)));

    let options = if public {
        PutOptions::with_visibility(Visibility::Public)
    } else {
        PutOptions::default()
    };
    driver
        .put_stream(&parse_path(dest)?, stream, options)
        .await
        .context("Failed to upload file")?;

    println!("Uploaded {} ({} bytes)", dest, size);
    Ok(())
}

/// Download a file to `output` or stdout.
async fn cmd_get(driver: Arc<dyn StorageDriver>, path: &str, output: Option<PathBuf>) -> Result<()> {
    let mut stream = driver
        .read_stream(&parse_path(path)?)
        .await
        .context("Failed to open file")?;

    match output {
        Some(output) => {
            let mut file = tokio::fs::File::create(&output)
                .await
                .context("Failed to create output file")?;
            let mut written = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Download failed")?;
                written += chunk.len();
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            println!("Downloaded {} to {} ({} bytes)", path, output.display(), written);
        }
        None => {
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk.context("Download failed")?).await?;
            }
            stdout.flush().await?;
        }
    }
    Ok(())
}

/// Print every configured disk.
fn cmd_disks(registry: &DiskRegistry) -> Result<()> {
    let default = registry.default_name();
    for name in registry.names() {
        let disk = registry.disk(name)?;
        let marker = if Some(name) == default { "*" } else { " " };
        let read_only = if disk.config.read_only { " (read-only)" } else { "" };
        println!(
            "{} {:<16} {}{}",
            marker,
            name,
            disk.config.config.driver_name(),
            read_only
        );
    }
    Ok(())
}
