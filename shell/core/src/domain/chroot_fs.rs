// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sandboxed Document Filesystem
//!
//! [`ChrootFs`] is the only way guest code touches a document's working
//! directory. Every call:
//!
//! 1. resolves the guest path with [`safe_join`] against the current root;
//! 2. for writes, measures the tree and applies the [`QuotaPolicy`];
//! 3. performs the disk operation while holding the `io` lock group.
//!
//! Checks happen before any mutation, so a refused write leaves the tree
//! untouched.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Path confinement, size quota and save/io exclusion for one document

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::events::SandboxEvent;
use crate::domain::lock::{with_lock, AccessLock, LockError, LockGroup, NoopLock};
use crate::domain::quota::{
    DenyIncrease, QuotaDecision, QuotaExceeded, QuotaPolicy, SizePrompt, DEFAULT_MAX_BYTES,
};
use crate::domain::safe_join::{safe_join, SafeJoinError};
use crate::domain::storage::{DirEntry, DocumentStorage, ListOptions};

/// Sandboxed filesystem errors
#[derive(Debug, Error)]
pub enum ChrootError {
    #[error("{path} is outside base dir")]
    UnsafePath { path: String },

    #[error("Document would take {requested_bytes} bytes, limit is {max_bytes} bytes")]
    TooBig { requested_bytes: u64, max_bytes: u64 },

    #[error(transparent)]
    Release(#[from] LockError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<SafeJoinError> for ChrootError {
    fn from(e: SafeJoinError) -> Self {
        match e {
            SafeJoinError::UnsafePath(path) => ChrootError::UnsafePath { path },
            SafeJoinError::Io(e) => ChrootError::Io(e),
        }
    }
}

impl From<QuotaExceeded> for ChrootError {
    fn from(e: QuotaExceeded) -> Self {
        ChrootError::TooBig {
            requested_bytes: e.requested_bytes,
            max_bytes: e.max_bytes,
        }
    }
}

/// Sink for sandbox audit events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_sandbox_event(&self, event: SandboxEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardEvents;

#[async_trait]
impl EventPublisher for DiscardEvents {
    async fn publish_sandbox_event(&self, _event: SandboxEvent) {}
}

/// Construction options
#[derive(Clone, Default)]
pub struct ChrootOptions {
    /// Initial size ceiling in bytes (default: 10 MiB)
    pub max_bytes: Option<u64>,
    /// Asked when a write would cross the ceiling (default: always refuse)
    pub increase_size_prompt: Option<Arc<dyn SizePrompt>>,
}

/// The requested root and, once known, its symlink-free form
#[derive(Debug, Clone)]
struct RootBinding {
    requested: PathBuf,
    resolved: Option<PathBuf>,
}

impl RootBinding {
    fn new(requested: PathBuf) -> Self {
        Self {
            requested,
            resolved: None,
        }
    }
}

pub struct ChrootFs {
    storage: Arc<dyn DocumentStorage>,
    root: Mutex<RootBinding>,
    quota: QuotaPolicy,
    lock: Arc<dyn AccessLock>,
    events: Arc<dyn EventPublisher>,
}

impl ChrootFs {
    /// Sandbox rooted at `root`, measuring and listing through `storage`
    pub fn new(
        storage: Arc<dyn DocumentStorage>,
        root: impl Into<PathBuf>,
        options: ChrootOptions,
    ) -> Self {
        let prompt = options
            .increase_size_prompt
            .unwrap_or_else(|| Arc::new(DenyIncrease));

        Self {
            storage,
            root: Mutex::new(RootBinding::new(root.into())),
            quota: QuotaPolicy::new(options.max_bytes.unwrap_or(DEFAULT_MAX_BYTES), prompt),
            lock: Arc::new(NoopLock),
            events: Arc::new(DiscardEvents),
        }
    }

    /// Guard guest I/O with `lock` (default: no locking)
    pub fn with_lock(mut self, lock: Arc<dyn AccessLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Current size ceiling in bytes
    pub fn max_bytes(&self) -> u64 {
        self.quota.max_bytes()
    }

    /// Absolute, symlink-resolved root.
    ///
    /// Resolved on first use and cached until [`ChrootFs::set_root`]. A root
    /// that does not exist yet is returned in absolute form and not cached.
    pub async fn root(&self) -> Result<PathBuf, ChrootError> {
        let requested = {
            let binding = self.root.lock();
            if let Some(resolved) = &binding.resolved {
                return Ok(resolved.clone());
            }
            binding.requested.clone()
        };

        let resolved = match tokio::fs::canonicalize(&requested).await {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(std::path::absolute(&requested)?);
            }
            Err(e) => return Err(e.into()),
        };

        let mut binding = self.root.lock();
        // Rebound while we were resolving; the newer binding wins.
        if binding.requested == requested {
            binding.resolved = Some(resolved.clone());
        }
        Ok(resolved)
    }

    /// Point the sandbox at a different directory
    pub async fn set_root(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        info!(root = %root.display(), "Rebinding sandbox root");
        *self.root.lock() = RootBinding::new(root.clone());

        self.publish(SandboxEvent::RootRebound {
            root,
            rebound_at: Utc::now(),
        })
        .await;
    }

    /// Create or overwrite `path` with `data`, creating missing parent
    /// directories.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ChrootError> {
        let (root, target) = self.resolve(path).await?;

        let current_size = match self.storage.usage(&root).await {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        match self.quota.admit(current_size, data.len() as u64).await {
            Ok(QuotaDecision::Within) => {}
            Ok(QuotaDecision::Raised { from, to }) => {
                self.publish(SandboxEvent::QuotaRaised {
                    from_bytes: from,
                    to_bytes: to,
                    raised_at: Utc::now(),
                })
                .await;
            }
            Err(exceeded) => {
                debug!(
                    path = %path,
                    requested_bytes = exceeded.requested_bytes,
                    max_bytes = exceeded.max_bytes,
                    "Write refused by size quota"
                );
                self.publish(SandboxEvent::QuotaExceeded {
                    path: path.to_string(),
                    requested_bytes: exceeded.requested_bytes,
                    max_bytes: exceeded.max_bytes,
                    exceeded_at: Utc::now(),
                })
                .await;
                return Err(exceeded.into());
            }
        }

        with_lock(self.lock.as_ref(), LockGroup::Io, || async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, data).await?;
            Ok::<_, ChrootError>(())
        })
        .await?;

        self.publish(SandboxEvent::FileWritten {
            path: path.to_string(),
            bytes_written: data.len() as u64,
            written_at: Utc::now(),
        })
        .await;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChrootError> {
        let (_, target) = self.resolve(path).await?;

        let data = with_lock(self.lock.as_ref(), LockGroup::Io, || async {
            Ok::<_, ChrootError>(tokio::fs::read(&target).await?)
        })
        .await?;

        self.publish(SandboxEvent::FileRead {
            path: path.to_string(),
            bytes_read: data.len() as u64,
            read_at: Utc::now(),
        })
        .await;
        Ok(data)
    }

    /// Delete a file or a whole directory tree.
    ///
    /// Missing paths are not an error. Removing the root empties it but
    /// keeps the directory itself.
    pub async fn remove(&self, path: &str) -> Result<(), ChrootError> {
        let (root, target) = self.resolve(path).await?;

        let removed = with_lock(self.lock.as_ref(), LockGroup::Io, || async {
            let metadata = match tokio::fs::symlink_metadata(&target).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(ChrootError::Io(e)),
            };

            if !metadata.is_dir() {
                tokio::fs::remove_file(&target).await?;
            } else if target == root {
                clear_dir(&target).await?;
            } else {
                tokio::fs::remove_dir_all(&target).await?;
            }
            Ok(true)
        })
        .await?;

        if removed {
            self.publish(SandboxEvent::PathRemoved {
                path: path.to_string(),
                removed_at: Utc::now(),
            })
            .await;
        } else {
            debug!(path = %path, "Nothing to remove");
        }
        Ok(())
    }

    /// List entries below `path` (the root when `None`), with paths relative
    /// to the root. The listed directory itself is not included.
    pub async fn listdir(
        &self,
        path: Option<&str>,
        options: ListOptions,
    ) -> Result<Vec<DirEntry>, ChrootError> {
        let (root, dir) = self.resolve(path.unwrap_or("")).await?;

        let entries = with_lock(self.lock.as_ref(), LockGroup::Io, || async {
            Ok::<_, ChrootError>(self.storage.list(&root, &dir, options).await?)
        })
        .await?;

        self.publish(SandboxEvent::DirectoryListed {
            path: path.unwrap_or("").to_string(),
            entry_count: entries.len(),
            listed_at: Utc::now(),
        })
        .await;
        Ok(entries)
    }

    async fn resolve(&self, path: &str) -> Result<(PathBuf, PathBuf), ChrootError> {
        let root = self.root().await?;
        match safe_join(&root, path).await {
            Ok(target) => Ok((root, target)),
            Err(SafeJoinError::UnsafePath(path)) => {
                self.publish(SandboxEvent::UnsafePathRejected {
                    path: path.clone(),
                    rejected_at: Utc::now(),
                })
                .await;
                Err(ChrootError::UnsafePath { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, event: SandboxEvent) {
        self.events.publish_sandbox_event(event).await;
    }
}

impl std::fmt::Debug for ChrootFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChrootFs")
            .field("root", &*self.root.lock())
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

async fn clear_dir(dir: &Path) -> io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::{dir_size, LocalDocumentStorage};
    use tempfile::TempDir;

    fn local(root: impl Into<PathBuf>, options: ChrootOptions) -> ChrootFs {
        ChrootFs::new(Arc::new(LocalDocumentStorage), root, options)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SandboxEvent>>);

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish_sandbox_event(&self, event: SandboxEvent) {
            self.0.lock().push(event);
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<&'static str> {
            self.0.lock().iter().map(SandboxEvent::kind).collect()
        }
    }

    #[tokio::test]
    async fn test_root_is_resolved_and_cached() {
        let dir = TempDir::new().unwrap();
        let fs = local(dir.path(), ChrootOptions::default());

        let root = fs.root().await.unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
        assert!(fs.root.lock().resolved.is_some());
    }

    #[tokio::test]
    async fn test_missing_root_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let fs = local(dir.path().join("later"), ChrootOptions::default());

        let root = fs.root().await.unwrap();
        assert!(root.ends_with("later"));
        assert!(fs.root.lock().resolved.is_none());
    }

    #[tokio::test]
    async fn test_set_root_rebinds() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(second.path().join("marker"), b"2").unwrap();

        let fs = local(first.path(), ChrootOptions::default());
        fs.write_file("marker", b"1").await.unwrap();

        fs.set_root(second.path()).await;
        assert_eq!(fs.root().await.unwrap(), second.path().canonicalize().unwrap());
        assert_eq!(fs.read_file("marker").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_remove_missing_path_is_noop() {
        let dir = TempDir::new().unwrap();
        let fs = local(dir.path(), ChrootOptions::default());
        fs.remove("never/was/here").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_root_keeps_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();

        let fs = local(dir.path(), ChrootOptions::default());
        fs.remove("/").await.unwrap();

        assert!(dir.path().is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_write_into_missing_root_creates_it() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("doc");
        let fs = local(&root, ChrootOptions::default());

        fs.write_file("hello.txt", b"hi").await.unwrap();
        assert_eq!(std::fs::read(root.join("hello.txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        // Directory entries count towards the quota too
        let baseline = dir_size(dir.path()).await.unwrap();
        let fs = local(
            dir.path(),
            ChrootOptions {
                max_bytes: Some(baseline + 1000),
                ..Default::default()
            },
        )
        .with_event_publisher(recorder.clone());

        fs.write_file("a.txt", b"abc").await.unwrap();
        fs.read_file("a.txt").await.unwrap();
        fs.listdir(None, ListOptions::default()).await.unwrap();
        fs.remove("a.txt").await.unwrap();
        assert!(fs.write_file("../escape", b"x").await.is_err());
        assert!(fs.write_file("big", &[0u8; 2000]).await.is_err());

        assert_eq!(
            recorder.kinds(),
            vec![
                "FileWritten",
                "FileRead",
                "DirectoryListed",
                "PathRemoved",
                "UnsafePathRejected",
                "QuotaExceeded"
            ]
        );
    }

    #[tokio::test]
    async fn test_safe_join_errors_map_to_chroot_errors() {
        let err: ChrootError = SafeJoinError::UnsafePath("../x".into()).into();
        assert!(matches!(err, ChrootError::UnsafePath { path } if path == "../x"));

        let err: ChrootError = SafeJoinError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).into();
        assert!(matches!(err, ChrootError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied));
    }
}
