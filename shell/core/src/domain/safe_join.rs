// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Safe Join Domain Service
//!
//! Joins a trusted base directory with an untrusted, guest-supplied relative
//! path and proves the result stays inside the base, following symlinks.
//! Path confinement is a domain rule, not an infrastructure concern: every
//! sandboxed operation goes through [`safe_join`] before touching the disk.
//!
//! # Resolution rules
//!
//! | base exists | target exists | checked form                               | returned path        |
//! |-------------|---------------|--------------------------------------------|----------------------|
//! | yes         | yes           | target real path within base real path     | target real path     |
//! | yes         | no            | target real path within base (orig or real)| target textual path  |
//! | no          | any           | target real path within base real path     | target real path     |
//!
//! The "real path" of something that does not exist is the real path of its
//! deepest existing ancestor with the missing components appended, so a
//! symlinked intermediate directory cannot smuggle a new file out of the base.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Path confinement for the sandboxed document filesystem

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Upper bound on dangling-symlink hops followed while resolving a missing path
const MAX_SYMLINK_HOPS: usize = 40;

/// Path resolution errors
#[derive(Debug, Error)]
pub enum SafeJoinError {
    /// The requested path resolves outside the base directory
    #[error("{0} is outside base dir")]
    UnsafePath(String),

    /// A stat/realpath call failed for a reason other than "does not exist"
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of resolving a path to its real (symlink-free) form
#[derive(Debug, Clone, PartialEq, Eq)]
enum RealPath {
    /// The path exists; holds its canonical form
    Exists(PathBuf),
    /// The path does not exist; holds the canonical form of its deepest
    /// existing ancestor with the missing tail appended
    Missing(PathBuf),
    /// The path does not exist and its would-be location cannot be proven
    Unprovable,
}

impl RealPath {
    fn exists(&self) -> bool {
        matches!(self, RealPath::Exists(_))
    }

    fn path(&self) -> Option<&Path> {
        match self {
            RealPath::Exists(p) | RealPath::Missing(p) => Some(p),
            RealPath::Unprovable => None,
        }
    }
}

/// Join `relative` onto `base`, failing closed if the result escapes `base`.
///
/// A leading `/` in `relative` means "the base directory", never the
/// filesystem root. `..` segments are collapsed lexically before any
/// symlink resolution happens.
///
/// # Examples
/// ```no_run
/// # async fn demo() -> Result<(), lhtml_core::domain::safe_join::SafeJoinError> {
/// use lhtml_core::domain::safe_join::safe_join;
///
/// let inside = safe_join("/tmp/doc", "/images/logo.png").await?;
/// assert!(inside.starts_with("/tmp/doc"));
///
/// assert!(safe_join("/tmp/doc", "../../etc/passwd").await.is_err());
/// # Ok(())
/// # }
/// ```
pub async fn safe_join(
    base: impl AsRef<Path>,
    relative: &str,
) -> Result<PathBuf, SafeJoinError> {
    if relative.contains('\0') {
        tracing::warn!(path = %relative.escape_debug(), "Rejected path containing a NUL byte");
        return Err(SafeJoinError::UnsafePath(relative.to_string()));
    }

    let base = absolutize(base.as_ref())?;
    let alleged = normalize(&base.join(normalize_relative(relative)));

    let (real_base, real_alleged) = futures::try_join!(real_path(&base), real_path(&alleged))?;

    let verdict = match (&real_base, &real_alleged) {
        (RealPath::Exists(root), RealPath::Exists(target)) => {
            is_path_within(root, target).then(|| target.clone())
        }
        (RealPath::Exists(root), RealPath::Missing(target)) => {
            (is_path_within(&base, target) || is_path_within(root, target))
                .then(|| alleged.clone())
        }
        (_, target) if !real_base.exists() => match (real_base.path(), target.path()) {
            (Some(root), Some(target)) if is_path_within(root, target) => {
                Some(target.to_path_buf())
            }
            _ => None,
        },
        _ => None,
    };

    verdict.ok_or_else(|| {
        tracing::warn!(
            path = %relative,
            base = %base.display(),
            "Path resolves outside sandbox root"
        );
        SafeJoinError::UnsafePath(relative.to_string())
    })
}

/// Return true if `child` equals `root` or sits below it.
///
/// Component-wise comparison, so `/doc-other` is not within `/doc`.
/// Both paths are expected to be absolute and normalized.
pub fn is_path_within(root: &Path, child: &Path) -> bool {
    child.starts_with(root)
}

/// Normalize an untrusted relative path and strip any root marker, so the
/// result can be joined onto a base directory.
pub fn normalize_relative(relative: &str) -> PathBuf {
    let normalized = normalize(Path::new(relative));
    normalized
        .components()
        .filter(|c| !matches!(c, Component::Prefix(_) | Component::RootDir))
        .collect()
}

/// Lexically normalize a path: drop `.`, collapse `..` against preceding
/// segments, and clamp `..` at the root of absolute paths.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    let mut anchored = false;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                out.push(component);
                anchored = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !anchored {
                    out.push("..");
                }
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }

    out
}

fn absolutize(base: &Path) -> io::Result<PathBuf> {
    if base.is_absolute() {
        Ok(normalize(base))
    } else {
        Ok(normalize(&std::env::current_dir()?.join(base)))
    }
}

/// Resolve `path` to its real form, distinguishing "does not exist" from
/// other failures.
async fn real_path(path: &Path) -> io::Result<RealPath> {
    match tokio::fs::canonicalize(path).await {
        Ok(real) => Ok(RealPath::Exists(real)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => resolve_missing(path).await,
        Err(e) => Err(e),
    }
}

/// Resolve a path that does not exist by canonicalizing its deepest existing
/// ancestor. Dangling symlinks along the way are followed so that the
/// eventual create lands where the check says it will.
async fn resolve_missing(path: &Path) -> io::Result<RealPath> {
    let mut cursor = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    let mut hops = 0usize;

    loop {
        match tokio::fs::canonicalize(&cursor).await {
            Ok(mut real) => {
                for part in tail.iter().rev() {
                    real.push(part);
                }
                return Ok(RealPath::Missing(real));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let dangling = match tokio::fs::symlink_metadata(&cursor).await {
            Ok(meta) => meta.file_type().is_symlink(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        if dangling {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Ok(RealPath::Unprovable);
            }
            let target = tokio::fs::read_link(&cursor).await?;
            let parent = match cursor.parent() {
                Some(parent) => parent.to_path_buf(),
                None => return Ok(RealPath::Unprovable),
            };
            cursor = parent.join(target);
            continue;
        }

        // Popping `..` or `.` would change what the path means.
        match cursor.components().next_back() {
            Some(Component::Normal(name)) => {
                tail.push(name.to_os_string());
                cursor.pop();
            }
            _ => return Ok(RealPath::Unprovable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn real_tempdir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let real = std::fs::canonicalize(dir.path()).unwrap();
        (dir, real)
    }

    #[test]
    fn test_normalize_relative_strips_root() {
        assert_eq!(normalize_relative("/a/b"), PathBuf::from("a/b"));
        assert_eq!(normalize_relative("a/./b//c"), PathBuf::from("a/b/c"));
        assert_eq!(normalize_relative("/../../etc"), PathBuf::from("etc"));
        assert_eq!(normalize_relative("a/../../hey"), PathBuf::from("../hey"));
        assert_eq!(normalize_relative(""), PathBuf::new());
    }

    #[test]
    fn test_is_path_within_is_component_wise() {
        assert!(is_path_within(Path::new("/doc"), Path::new("/doc")));
        assert!(is_path_within(Path::new("/doc"), Path::new("/doc/a.txt")));
        assert!(!is_path_within(Path::new("/doc"), Path::new("/doc-other/a.txt")));
        assert!(!is_path_within(Path::new("/doc"), Path::new("/")));
    }

    #[tokio::test]
    async fn test_nonexistent_base_rejects_parent_escape() {
        let result = safe_join("/foo/bar", "../hey").await;
        assert!(matches!(result, Err(SafeJoinError::UnsafePath(p)) if p == "../hey"));
    }

    #[tokio::test]
    async fn test_nonexistent_base_allows_rooted_path() {
        let joined = safe_join("/foo/bar", "/hey").await.unwrap();
        assert_eq!(joined, PathBuf::from("/foo/bar/hey"));
    }

    #[tokio::test]
    async fn test_existing_file_returns_real_path() {
        let (_dir, root) = real_tempdir();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();

        let joined = safe_join(&root, "/a.txt").await.unwrap();
        assert_eq!(joined, root.join("a.txt"));
    }

    #[tokio::test]
    async fn test_missing_file_returns_textual_path() {
        let (_dir, root) = real_tempdir();

        let joined = safe_join(&root, "not/yet/here.txt").await.unwrap();
        assert_eq!(joined, root.join("not/yet/here.txt"));
    }

    #[tokio::test]
    async fn test_traversal_is_clamped_or_rejected() {
        let (_dir, root) = real_tempdir();
        std::fs::create_dir(root.join("sub")).unwrap();

        for escape in ["..", "../x", "sub/../../x", "./../../../../etc/passwd"] {
            let result = safe_join(&root, escape).await;
            assert!(
                matches!(result, Err(SafeJoinError::UnsafePath(_))),
                "{escape} should be rejected"
            );
        }

        // Absolute inputs are re-rooted, never escaped
        let joined = safe_join(&root, "/../../etc/passwd").await.unwrap();
        assert_eq!(joined, root.join("etc/passwd"));

        // Collapsing inside the base is fine
        let joined = safe_join(&root, "sub/../a.txt").await.unwrap();
        assert_eq!(joined, root.join("a.txt"));
    }

    #[tokio::test]
    async fn test_root_itself_is_within() {
        let (_dir, root) = real_tempdir();
        assert_eq!(safe_join(&root, "").await.unwrap(), root);
        assert_eq!(safe_join(&root, "/").await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_nul_byte_rejected() {
        let (_dir, root) = real_tempdir();
        let result = safe_join(&root, "a\0b").await;
        assert!(matches!(result, Err(SafeJoinError::UnsafePath(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (_dir, root) = real_tempdir();
        let (_outside_dir, outside) = real_tempdir();
        std::fs::write(outside.join("secret"), b"s3cret").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        // Existing file behind a symlink
        let result = safe_join(&root, "link/secret").await;
        assert!(matches!(result, Err(SafeJoinError::UnsafePath(_))));

        // New file behind a symlinked directory
        let result = safe_join(&root, "link/new-file").await;
        assert!(matches!(result, Err(SafeJoinError::UnsafePath(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dangling_symlink_escape_rejected() {
        let (_dir, root) = real_tempdir();
        let (_outside_dir, outside) = real_tempdir();
        std::os::unix::fs::symlink(outside.join("planted"), root.join("trap")).unwrap();

        let result = safe_join(&root, "trap").await;
        assert!(matches!(result, Err(SafeJoinError::UnsafePath(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_internal_symlink_allowed() {
        let (_dir, root) = real_tempdir();
        std::fs::create_dir(root.join("real")).unwrap();
        std::fs::write(root.join("real/data.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        let joined = safe_join(&root, "alias/data.txt").await.unwrap();
        assert_eq!(joined, root.join("real/data.txt"));

        let joined = safe_join(&root, "alias/fresh.txt").await.unwrap();
        assert_eq!(joined, root.join("alias/fresh.txt"));
    }
}
