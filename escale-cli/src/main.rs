//! # escale
//!
//! File synchronization through a shared dumb blob store.
//!
//! ## Commands
//!
//! - `run`: drive one or more repositories until interrupted
//! - `status`: show what the local index knows
//! - `access`: read or change a path's access rights, or grant a gate
//! - `migrate`: copy a relay repository to another relay
//! - `backup` / `restore`: archive a relay repository to a tarball
//!
//! ## Example
//!
//! ```bash
//! # Synchronize the repository described by escale.toml
//! escale run
//!
//! # Gate writes on a path and tell the peers
//! escale access "docs/spec.md" --set "r w?"
//!
//! # Move the whole relay elsewhere, safely
//! escale migrate file:///mnt/new-relay
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 license not accepted,
//! 3 relay error, 4 local filesystem error, 5 integrity failure,
//! 6 conflict halted operation.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use escale_core::EngineError;

mod commands;

/// File synchronization through a dumb blob-store relay.
#[derive(Parser, Debug)]
#[command(name = "escale")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Repository configuration file.
    #[arg(long, global = true, default_value = "escale.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the synchronization worker until interrupted.
    Run {
        /// Additional repository configurations to drive in parallel.
        #[arg(long = "also")]
        also: Vec<PathBuf>,
    },

    /// Show the local index state.
    Status,

    /// Read or modify a path's access rights.
    Access {
        /// The logical path inside the repository.
        path: String,

        /// New rights in the modifier syntax, e.g. "r w?".
        #[arg(long, conflicts_with = "grant")]
        set: Option<String>,

        /// Grant a pending gated request to this peer.
        #[arg(long, conflicts_with = "set")]
        grant: Option<String>,
    },

    /// Copy every blob of the repository's relay to another relay.
    Migrate {
        /// Destination relay URI (e.g. file:///mnt/new-relay).
        dest: String,

        /// Assume no client is active; skip the per-path lock dance.
        #[arg(long)]
        fast: bool,
    },

    /// Archive the relay's blob set into a gzip tarball.
    Backup {
        /// Output archive path.
        output: PathBuf,

        /// Assume no client is active; skip the per-path lock dance.
        #[arg(long)]
        fast: bool,
    },

    /// Unpack a backup archive onto the relay.
    Restore {
        /// Input archive path.
        input: PathBuf,

        /// Assume no client is active; skip the per-path lock dance.
        #[arg(long)]
        fast: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "escale=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { also } => commands::run::run(&cli.config, &also).await,
        Commands::Status => commands::status::run(&cli.config).await,
        Commands::Access { path, set, grant } => {
            commands::access::run(&cli.config, &path, set.as_deref(), grant.as_deref()).await
        }
        Commands::Migrate { dest, fast } => {
            commands::migrate::run(&cli.config, &dest, fast).await
        }
        Commands::Backup { output, fast } => {
            commands::backup::run(&cli.config, &output, fast).await
        }
        Commands::Restore { input, fast } => {
            commands::restore::run(&cli.config, &input, fast).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Map the error taxonomy onto the documented exit codes.
fn exit_code(error: &EngineError) -> u8 {
    match error {
        EngineError::Config(_) => 1,
        EngineError::Relay(_) | EngineError::Busy { .. } | EngineError::Protocol { .. } => 3,
        EngineError::LocalIo { .. } => 4,
        EngineError::Integrity { .. } | EngineError::Content(_) => 5,
        EngineError::Conflict { .. } => 6,
        EngineError::Cancelled => 0,
    }
}
