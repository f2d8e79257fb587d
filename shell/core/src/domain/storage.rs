// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage value types shared by the sandboxed filesystem and its callers,
//! and the [`DocumentStorage`] port the filesystem measures and lists
//! through.
//!
//! The value types cross the guest boundary as JSON, so field names follow
//! the guest API (`isdir`, `dir`) rather than Rust conventions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path};

/// Measures and lists a document's directory tree.
///
/// Implementations never follow symlinks: a link is measured and listed as
/// the link itself.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Total bytes taken by `path`: a file's size, or a directory's own
    /// entry size plus everything below it
    async fn usage(&self, path: &Path) -> io::Result<u64>;

    /// Entries below `dir` with paths relative to `root`. `dir` itself is
    /// not included.
    async fn list(&self, root: &Path, dir: &Path, options: ListOptions) -> io::Result<Vec<DirEntry>>;
}

/// Directory entry
///
/// Produced transiently by listing; never persisted. All paths are relative
/// to the sandbox root, using `/` as separator regardless of platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Final path component
    pub name: String,
    /// Path relative to the sandbox root (e.g., "sub/c.txt")
    pub path: String,
    /// Parent path relative to the sandbox root, "" for root-level entries
    pub dir: String,
    /// Size in bytes as reported by lstat
    pub size: u64,
    /// Present (and true) only for directories
    #[serde(rename = "isdir", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dir: bool,
}

impl DirEntry {
    /// Build an entry from a path already made relative to the sandbox root.
    ///
    /// Returns `None` for the empty path (the root itself is never listed)
    /// and for paths that are not valid UTF-8, which guests could not name
    /// back.
    pub fn from_relative(relative: &Path, size: u64, is_dir: bool) -> Option<Self> {
        let parts = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_str().map(str::to_string)),
                _ => None,
            })
            .collect::<Option<Vec<String>>>()?;

        let (name, parents) = parts.split_last()?;

        Some(Self {
            name: name.clone(),
            path: parts.join("/"),
            dir: parents.join("/"),
            size,
            is_dir,
        })
    }
}

/// Options for directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Descend into subdirectories (default: true)
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self { recursive: true }
    }
}

impl ListOptions {
    /// Only the immediate children of the listed directory
    pub fn shallow() -> Self {
        Self { recursive: false }
    }
}

fn default_recursive() -> bool {
    true
}
