// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Sandboxed file commands
//!
//! Commands: write, read, rm, ls

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use lhtml_core::application::SessionOptions;
use lhtml_core::domain::chroot_fs::ChrootFs;
use lhtml_core::domain::shell_config::ShellConfigManifest;
use lhtml_core::domain::storage::{DirEntry, ListOptions};
use lhtml_core::infrastructure::storage::LocalDocumentStorage;

use crate::prompt::TerminalSizePrompt;

#[derive(Subcommand)]
pub enum FsCommand {
    /// Write a file inside the working directory
    Write {
        /// Document working directory
        working_dir: PathBuf,

        /// Path inside the working directory
        path: String,

        /// Read contents from this file instead of stdin
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Print a file from the working directory to stdout
    Read {
        working_dir: PathBuf,
        path: String,
    },

    /// Remove a file or directory tree
    Rm {
        working_dir: PathBuf,
        path: String,
    },

    /// List the working directory (or a directory inside it)
    Ls {
        working_dir: PathBuf,

        /// Directory inside the working directory (default: root)
        path: Option<String>,

        /// Only list immediate children
        #[arg(long)]
        shallow: bool,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: FsCommand, config: &ShellConfigManifest) -> Result<()> {
    match command {
        FsCommand::Write {
            working_dir,
            path,
            input,
        } => write(sandbox(working_dir, config), &path, input).await,
        FsCommand::Read { working_dir, path } => read(sandbox(working_dir, config), &path).await,
        FsCommand::Rm { working_dir, path } => remove(sandbox(working_dir, config), &path).await,
        FsCommand::Ls {
            working_dir,
            path,
            shallow,
            json,
        } => {
            let options = if shallow {
                ListOptions::shallow()
            } else {
                ListOptions::default()
            };
            list(sandbox(working_dir, config), path.as_deref(), options, json).await
        }
    }
}

fn sandbox(working_dir: PathBuf, config: &ShellConfigManifest) -> ChrootFs {
    let options = SessionOptions::from_config(config, Some(Arc::new(TerminalSizePrompt)));
    ChrootFs::new(Arc::new(LocalDocumentStorage), working_dir, options.chroot)
}

async fn write(fs: ChrootFs, path: &str, input: Option<PathBuf>) -> Result<()> {
    let data = match input {
        Some(file) => tokio::fs::read(&file)
            .await
            .with_context(|| format!("Failed to read {:?}", file))?,
        None => {
            let mut data = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("Failed to read stdin")?;
            data
        }
    };

    fs.write_file(path, &data)
        .await
        .with_context(|| format!("Failed to write {}", path))?;

    eprintln!("{}", format!("✓ Wrote {} bytes to {}", data.len(), path).green());
    Ok(())
}

async fn read(fs: ChrootFs, path: &str) -> Result<()> {
    let data = fs
        .read_file(path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&data).await?;
    stdout.flush().await?;
    Ok(())
}

async fn remove(fs: ChrootFs, path: &str) -> Result<()> {
    fs.remove(path)
        .await
        .with_context(|| format!("Failed to remove {}", path))?;

    eprintln!("{}", format!("✓ Removed {}", path).green());
    Ok(())
}

async fn list(fs: ChrootFs, path: Option<&str>, options: ListOptions, json: bool) -> Result<()> {
    let entries = fs
        .listdir(path, options)
        .await
        .with_context(|| format!("Failed to list {}", path.unwrap_or("/")))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", "(empty)".dimmed());
        return Ok(());
    }

    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn format_entry(entry: &DirEntry) -> String {
    if entry.is_dir {
        format!("{:>10}  {}", "-", format!("{}/", entry.path).blue().bold())
    } else {
        format!("{:>10}  {}", entry.size, entry.path)
    }
}
