//! # sync2rag CLI
//!
//! ## Usage
//!
//! ```bash
//! sync2rag --config ./config.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sync2rag scan` | Fingerprint the input tree and persist the manifest |
//! | `sync2rag changes` | Print added / modified / removed paths without writing state |
//! | `sync2rag run` | Scan, convert what changed, sync the remote store |
//! | `sync2rag sync` | Sync the remote store from the last persisted manifest |
//! | `sync2rag clear` | Reset local state (`--all`: also remote docs and artifacts) |
//!
//! ## Exit Codes
//!
//! - `0` everything succeeded
//! - `1` at least one conversion, remote operation or delete failed
//! - `2` configuration error or unusable input root

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use sync2rag::backends::Backends;
use sync2rag::cancel::CancelFlag;
use sync2rag::caption::VlmCaptioner;
use sync2rag::config::{self, Config};
use sync2rag::docling::DoclingClient;
use sync2rag::error::is_fatal_config;
use sync2rag::lightrag::LightRagClient;
use sync2rag::models::Changeset;
use sync2rag::progress::ProgressMode;
use sync2rag::state::Coordinator;

#[derive(Parser)]
#[command(
    name = "sync2rag",
    about = "Incrementally convert a document tree and keep a LightRAG knowledge base in sync with it",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Progress on stderr. Defaults to human on a TTY, off otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint the input tree and persist the manifest and changeset.
    Scan,

    /// Show what changed since the last scan. Writes nothing.
    Changes,

    /// Reconcile the remote store with the last persisted manifest.
    Sync {
        /// Use this full manifest instead of the persisted scan state.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Plan and report without touching the remote store.
        #[arg(long)]
        dry_run: bool,
    },

    /// Scan, convert and sync.
    Run {
        /// Reconvert entries that are already converted.
        #[arg(long)]
        force: bool,

        /// Sync from this full manifest instead of the fresh scan.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Plan the sync and report without touching the remote store.
        #[arg(long)]
        dry_run: bool,
    },

    /// Reset local state.
    Clear {
        /// Also delete remote documents, output artifacts and published manifests.
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool, configured: &str) {
    use tracing_subscriber::EnvFilter;

    // Honor RUST_LOG if set, otherwise the verbosity flags, then the config.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::try_new(configured).unwrap_or_else(|_| EnvFilter::new("info")),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,hyper=info,reqwest=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_backends(cfg: &Config) -> Result<Backends> {
    let mut backends = Backends {
        converter: Some(Arc::new(DoclingClient::new(&cfg.docling)?)),
        ..Backends::default()
    };
    if let Some(captioning) = cfg.active_captioning() {
        backends.captioner = Some(Arc::new(VlmCaptioner::new(captioning)?));
    }
    if cfg.lightrag.is_configured() {
        backends.remote = Some(Arc::new(LightRagClient::new(&cfg.lightrag)?));
    }
    Ok(backends)
}

fn print_changes(changes: &Changeset) {
    if changes.has_state {
        println!("changes since last scan");
    } else {
        println!("changes (no previous scan)");
    }
    for (label, marker, paths) in [
        ("added", '+', &changes.added),
        ("modified", '~', &changes.modified),
        ("removed", '-', &changes.removed),
    ] {
        println!("  {}: {}", label, paths.len());
        for path in paths {
            println!("    {} {}", marker, path);
        }
    }
    println!("  unchanged: {}", changes.unchanged.len());
}

async fn execute(cli: Cli, mut cfg: Config) -> Result<bool> {
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    match &cli.command {
        Commands::Sync { dry_run: true, .. } | Commands::Run { dry_run: true, .. } => {
            cfg.runtime.dry_run = true;
        }
        _ => {}
    }

    let coordinator = Coordinator::new(cfg.clone(), build_backends(&cfg)?)
        .with_progress(progress.reporter())
        .with_cancel(cancel);

    let summary = match cli.command {
        Commands::Changes => {
            print_changes(&coordinator.changes()?);
            return Ok(true);
        }
        Commands::Scan => coordinator.scan()?,
        Commands::Sync { manifest, .. } => coordinator.sync(manifest.as_deref()).await?,
        Commands::Run {
            force, manifest, ..
        } => coordinator.run(force, manifest.as_deref()).await?,
        Commands::Clear { all } => coordinator.clear(all).await?,
    };

    summary.print();
    Ok(!summary.has_failures() && !summary.cancelled)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing(cli.verbose, cli.quiet, &cfg.runtime.log_level);

    match execute(cli, cfg).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            if is_fatal_config(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
