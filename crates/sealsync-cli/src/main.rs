//! sealsync CLI
//!
//! Command-line interface for sealsync - encrypted, offline-first document sync.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sealsync_core::{Config, StorageError};

mod commands;
mod engine;
mod output;

use engine::Engine;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "sealsync")]
#[command(about = "sealsync - Offline-first encrypted document sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize sealsync (generate key file and author id)
    Init {
        /// Author id to announce to the relay
        #[arg(long)]
        author: Option<String>,
    },
    /// Show status (author, relay, per-document local state)
    Status,
    /// Print a new document ID
    New,
    /// List unpushed ops of a document
    Ops {
        /// Document ID
        document: String,
    },
    /// Set a key in a document
    Put {
        /// Document ID
        document: String,
        key: String,
        value: String,
    },
    /// Read a key, or every key, from a document
    Get {
        /// Document ID
        document: String,
        key: Option<String>,
    },
    /// Remove a key from a document
    #[command(alias = "rm")]
    Delete {
        /// Document ID
        document: String,
        key: String,
    },
    /// Sync a document with the relay
    Sync {
        /// Document ID
        document: String,
        /// Compact the op log into a snapshot afterwards
        #[arg(long)]
        snapshot: bool,
        /// Stay connected and report peer updates
        #[arg(short, long)]
        watch: bool,
    },
    /// Wipe the local cache of a document
    Clear {
        /// Document ID
        document: String,
        /// Discard unpushed ops without asking
        #[arg(short, long)]
        force: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, relay_url, sync_enabled, author_id, key_file, log_file)
        key: String,
        /// Configuration value ("none" clears optional keys)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let result = run(cli, &output).await;
    if let Some(hint) = result.as_ref().err().and_then(recovery_hint) {
        output.warn(hint);
    }
    result
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let config_path = cli.config.as_ref();

    // Commands that don't need the store
    match &cli.command {
        Commands::Config { command } => {
            return handle_config_command(command.clone(), config_path, output);
        }
        Commands::Init { author } => {
            return commands::init::run(config_path, author.clone(), output);
        }
        Commands::New => return commands::doc::new(output),
        _ => {}
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);
    let engine = Engine::open(config)?;

    match cli.command {
        Commands::Status => commands::status::show(&engine, output),
        Commands::Ops { document } => commands::ops::list(&engine, &document, output),
        Commands::Put {
            document,
            key,
            value,
        } => commands::doc::put(&engine, &document, &key, &value, output).await,
        Commands::Get { document, key } => {
            commands::doc::get(&engine, &document, key.as_deref(), output).await
        }
        Commands::Delete { document, key } => {
            commands::doc::delete(&engine, &document, &key, output).await
        }
        Commands::Sync {
            document,
            snapshot,
            watch,
        } => commands::sync::sync(&engine, &document, snapshot, watch, output).await,
        Commands::Clear { document, force } => {
            commands::clear::run(&engine, &document, force, output)
        }
        Commands::Config { .. } | Commands::Init { .. } | Commands::New => Ok(()),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Recovery suggestion for a storage failure anywhere in the error chain
fn recovery_hint(error: &anyhow::Error) -> Option<&'static str> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<StorageError>())
        .and_then(StorageError::recovery_suggestion)
}

/// Initialize logging
///
/// Only initializes if SEALSYNC_LOG is set. Logs to config.log_file when
/// set, stderr otherwise.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("SEALSYNC_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "sealsync_core={},sealsync_cli={}",
        log_level, log_level
    ));

    let Some(ref log_path) = config.log_file else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let log_file = match File::create(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            return;
        }
    };

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging initialized to {:?}", log_path);
}
