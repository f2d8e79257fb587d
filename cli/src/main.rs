// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # LHTML Shell CLI
//!
//! The `lhtml` binary drives the sandboxed document filesystem from a
//! terminal or from a guest process.
//!
//! ## Commands
//!
//! - `lhtml fs write|read|rm|ls <working-dir> ...` - One sandboxed file operation
//! - `lhtml serve <working-dir>` - Guest RPC over JSON lines on stdin/stdout
//! - `lhtml config show|validate|generate` - Configuration management
//!
//! Logs always go to stderr so stdout stays clean for file contents and the
//! RPC stream.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lhtml_core::domain::shell_config::ShellConfigManifest;
use lhtml_shell::commands::{self, ConfigCommand, FsCommand, ServeArgs};

/// LHTML Shell - Sandboxed storage for LHTML documents
#[derive(Parser)]
#[command(name = "lhtml")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "LHTML_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: from config, else info]
    #[arg(long, global = true, env = "LHTML_LOG_LEVEL")]
    log_level: Option<String>,

    /// Approve document size increases without asking
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sandboxed file operations on a document's working directory
    #[command(name = "fs")]
    Fs {
        #[command(subcommand)]
        command: FsCommand,
    },

    /// Serve guest RPC for one document over stdin/stdout
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            commands::config::handle_command(command, cli.config).await
        }
        Commands::Fs { command } => {
            let config = load_config(cli.config, cli.yes)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.spec.logging.level))?;
            commands::fs::handle_command(command, &config).await
        }
        Commands::Serve(args) => {
            let config = load_config(cli.config, cli.yes)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.spec.logging.level))?;
            commands::serve::run(args, &config).await
        }
    }
}

fn load_config(path: Option<PathBuf>, auto_approve: bool) -> Result<ShellConfigManifest> {
    let mut config = ShellConfigManifest::load_or_default(path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    if auto_approve {
        config.spec.sandbox.auto_approve_size_increase = true;
    }
    Ok(config)
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
