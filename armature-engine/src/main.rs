//! Armature - component lifecycle engine.
//!
//! This is the command-line entry point, which:
//! - Loads configuration from TOML
//! - Initializes logging
//! - Dispatches component commands (install, update, uninstall, rollback, ...)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use armature_engine::components::cli::{self, ComponentCommand};
use armature_engine::config::ArmatureConfig;

/// Armature - install, update and roll back isolated components
#[derive(Parser, Debug)]
#[command(name = "armature")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the storage root from config
    #[arg(short, long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Run in verbose mode (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: ComponentCommand,
}

/// Load configuration from the given path or default locations.
///
/// Without an explicit path, `./armature.toml` is tried first, then the XDG
/// config directory. If neither exists the defaults are used.
fn load_config(path: Option<PathBuf>) -> Result<ArmatureConfig> {
    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        return ArmatureConfig::load(&path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let local = PathBuf::from("armature.toml");
    if local.exists() {
        info!("Loading configuration from {}", local.display());
        return Ok(ArmatureConfig::load(&local)?);
    }

    if let Some(dirs) = directories::ProjectDirs::from("ai", "govcraft", "armature") {
        let xdg_config = dirs.config_dir().join("armature.toml");
        if xdg_config.exists() {
            info!("Loading configuration from {}", xdg_config.display());
            return Ok(ArmatureConfig::load(&xdg_config)?);
        }
    }

    debug!("No configuration file found; using defaults");
    Ok(ArmatureConfig::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let mut config = load_config(args.config).context("Failed to load configuration")?;
    if let Some(root) = args.root {
        config.storage.root = root.display().to_string();
    }
    debug!("Storage root: {}", config.storage_root().display());

    cli::execute(args.command, &config).await
}
