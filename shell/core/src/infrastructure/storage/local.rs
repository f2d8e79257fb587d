// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Filesystem Tree Walking
//!
//! Directory sizing and listing for the sandboxed document filesystem.
//! Both walks run on tokio's blocking pool via `walkdir` and never follow
//! symlinks, so a link pointing outside the sandbox (or back at an ancestor)
//! is measured and listed as the link itself.
//!
//! **Concurrency:**
//! Walks are best-effort snapshots. An entry deleted between `readdir` and
//! `lstat` is skipped instead of failing the whole walk; any other error
//! (permission denied, I/O failure) is returned to the caller.
//!
//! Names that are not valid UTF-8 still count towards the size but are left
//! out of listings, since a guest could not address them.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::domain::storage::{DirEntry, DocumentStorage, ListOptions};

/// [`DocumentStorage`] on the local disk
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDocumentStorage;

#[async_trait]
impl DocumentStorage for LocalDocumentStorage {
    async fn usage(&self, path: &Path) -> io::Result<u64> {
        dir_size(path).await
    }

    async fn list(&self, root: &Path, dir: &Path, options: ListOptions) -> io::Result<Vec<DirEntry>> {
        list_tree(root, dir, options).await
    }
}

/// Total bytes taken by `path`: a file's size, or a directory's own entry
/// size plus the recursive sum of its children.
pub async fn dir_size(path: impl Into<PathBuf>) -> io::Result<u64> {
    let path = path.into();
    tokio::task::spawn_blocking(move || calculate_size(&path))
        .await
        .map_err(io::Error::other)?
}

/// List entries below `dir`, reporting paths relative to `root`.
///
/// `dir` itself is never included. Entries are sorted by file name within
/// each directory.
pub async fn list_tree(
    root: impl Into<PathBuf>,
    dir: impl Into<PathBuf>,
    options: ListOptions,
) -> io::Result<Vec<DirEntry>> {
    let root = root.into();
    let dir = dir.into();
    tokio::task::spawn_blocking(move || collect_entries(&root, &dir, options))
        .await
        .map_err(io::Error::other)?
}

fn calculate_size(path: &Path) -> io::Result<u64> {
    let mut total = 0u64;

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if vanished(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        match entry.metadata() {
            Ok(metadata) => total = total.saturating_add(metadata.len()),
            Err(e) if vanished(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(total)
}

fn collect_entries(root: &Path, dir: &Path, options: ListOptions) -> io::Result<Vec<DirEntry>> {
    if !std::fs::metadata(dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let mut walker = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    if !options.recursive {
        walker = walker.max_depth(1);
    }

    let mut entries = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if vanished(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if vanished(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        let relative = entry.path().strip_prefix(root).map_err(|_| {
            io::Error::other(format!(
                "{} escaped listing root {}",
                entry.path().display(),
                root.display()
            ))
        })?;

        if relative.to_str().is_none() {
            warn!(path = %relative.display(), "Skipping entry with a non UTF-8 name");
            continue;
        }

        if let Some(item) = DirEntry::from_relative(relative, metadata.len(), entry.file_type().is_dir()) {
            entries.push(item);
        }
    }

    Ok(entries)
}

/// True for errors below the walk root caused by an entry disappearing
/// mid-walk.
fn vanished(error: &walkdir::Error) -> bool {
    error.depth() > 0
        && error
            .io_error()
            .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
