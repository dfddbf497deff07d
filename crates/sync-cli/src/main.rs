//! vault-sync: run sync passes for a vault directory from the command line.
//!
//! The remote is a plain directory (see `DirRemote`), which makes it easy to
//! sync two vaults on one machine or through a shared mount.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sync_cli::{DirRemote, NativeFs};
use sync_engine::config::CONFIG_FILE;
use sync_engine::{
    DeviceId, FileIndex, FileSystem, LocalFileCollector, SyncConfig, SyncEngine, SyncReport,
    SYNC_DIR,
};

#[derive(Parser, Debug)]
#[command(name = "vault-sync")]
#[command(about = "Vector-clock vault file sync")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the vault's sync state (config and device ID)
    Init {
        /// Use this device ID instead of generating one
        #[arg(long)]
        device_id: Option<String>,
    },

    /// Collect local files and show what changed since the last sync
    Scan,

    /// Show the device ID and tracked files
    Status,

    /// Plan a sync pass against a remote without executing it
    Plan {
        /// Path to the remote directory
        #[arg(short, long)]
        remote: PathBuf,

        /// Print the plan as wire-format JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one sync pass against a remote
    Sync {
        /// Path to the remote directory
        #[arg(short, long)]
        remote: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_engine=debug,vault_sync=debug"
    } else {
        "info,sync_engine=info,vault_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let fs = NativeFs::new(args.vault.clone());

    match args.command {
        Command::Init { device_id } => init(&fs, device_id).await,
        Command::Scan => scan(&fs).await,
        Command::Status => status(&fs).await,
        Command::Plan { remote, json } => plan(fs, remote, json).await,
        Command::Sync { remote } => sync(fs, remote).await,
    }
}

async fn init(fs: &NativeFs, device_id: Option<String>) -> Result<()> {
    fs.mkdir(SYNC_DIR).await.context("Failed to create sync directory")?;

    if fs.exists(CONFIG_FILE).await? {
        info!("Keeping existing configuration");
    } else {
        SyncConfig::default()
            .save(fs)
            .await
            .context("Failed to write configuration")?;
    }

    let device_id = match device_id {
        Some(raw) => {
            let id: DeviceId = raw.parse().context("Invalid device ID")?;
            id.save(fs).await.context("Failed to write device ID")?;
            id
        }
        None => DeviceId::load_or_create(fs).await?,
    };

    println!("Initialized {} as device {}", fs.base_path().display(), device_id);
    Ok(())
}

async fn scan(fs: &NativeFs) -> Result<()> {
    let config = SyncConfig::load(fs).await?;
    let device_id = DeviceId::load_or_create(fs).await?;
    let index = FileIndex::load(fs).await.context("Failed to load file index")?;

    let collection = LocalFileCollector::new(fs, &device_id, config.max_file_size)
        .collect(&index)
        .await;

    for file in &collection.files {
        let marker = match index.get(&file.path) {
            None => "new",
            Some(entry) if entry.content_hash.as_ref() != Some(&file.content_hash) => "modified",
            Some(_) => "",
        };
        println!("{:<9} {}  {}", marker, file.path, file.vector_clock);
    }
    for (path, _) in index.get_all() {
        if collection.get(path).is_none() && !collection.skipped.iter().any(|(p, _)| p == path) {
            println!("{:<9} {}", "deleted", path);
        }
    }
    for (path, error) in &collection.skipped {
        println!("{:<9} {}  ({})", "skipped", path, error);
    }
    Ok(())
}

async fn status(fs: &NativeFs) -> Result<()> {
    let device_id = DeviceId::load_or_create(fs).await?;
    let index = FileIndex::load(fs).await.context("Failed to load file index")?;

    println!("Device:  {}", device_id);
    println!("Tracked: {} files", index.len());
    for (path, entry) in index.get_all() {
        println!("  {}  {}  {}", entry.file_id, path, entry.vector_clock);
    }
    Ok(())
}

async fn open(fs: NativeFs, remote: PathBuf) -> Result<SyncEngine<NativeFs, DirRemote>> {
    SyncEngine::open(fs, DirRemote::new(remote))
        .await
        .context("Failed to open vault")
}

async fn plan(fs: NativeFs, remote: PathBuf, json: bool) -> Result<()> {
    let engine = open(fs, remote).await?;
    let plan = engine.plan().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan.to_wire())?);
        return Ok(());
    }

    if plan.is_empty() {
        println!("Up to date");
        return Ok(());
    }
    for action in &plan.actions {
        println!("{:<9} {}", action.kind(), action.path());
    }
    for merge in &plan.clock_merges {
        println!("{:<9} {}", "merge", merge.path);
    }
    println!("{} actions, {} bytes", plan.actions.len(), plan.bytes_total);
    Ok(())
}

async fn sync(fs: NativeFs, remote: PathBuf) -> Result<()> {
    let engine = open(fs, remote).await?;
    let report = engine.sync().await?;

    let rejected = engine
        .remote()
        .apply_report(&report)
        .await
        .context("Failed to commit sync report to remote")?;
    for file_id in &rejected {
        warn!("Remote rejected upload of {}; it will be retried next pass", file_id);
    }

    print_report(&report);
    if !report.errors.is_empty() {
        bail!("{} actions failed", report.errors.len());
    }
    if let Some(e) = &report.clock_merge_error {
        bail!("Failed to save clock merges: {}", e);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    for file in &report.completed {
        println!("{:<9} {}", file.action, file.path);
    }
    for failure in &report.errors {
        println!("{:<9} {}  ({})", "failed", failure.action.path(), failure.error);
    }
    if let Some(e) = &report.clock_merge_error {
        println!("{:<9} clock merges not saved ({})", "failed", e);
    }
    println!(
        "{} completed, {} deleted, {} failed",
        report.completed.len(),
        report.deleted.len(),
        report.errors.len()
    );
}
