// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sandbox audit events
///
/// Emitted by the sandboxed filesystem for every guest-visible operation and
/// every refusal. Paths are the guest-supplied relative paths, not resolved
/// host paths, except for `RootRebound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SandboxEvent {
    UnsafePathRejected {
        path: String,
        rejected_at: DateTime<Utc>,
    },
    QuotaExceeded {
        path: String,
        requested_bytes: u64,
        max_bytes: u64,
        exceeded_at: DateTime<Utc>,
    },
    QuotaRaised {
        from_bytes: u64,
        to_bytes: u64,
        raised_at: DateTime<Utc>,
    },
    FileWritten {
        path: String,
        bytes_written: u64,
        written_at: DateTime<Utc>,
    },
    FileRead {
        path: String,
        bytes_read: u64,
        read_at: DateTime<Utc>,
    },
    PathRemoved {
        path: String,
        removed_at: DateTime<Utc>,
    },
    DirectoryListed {
        path: String,
        entry_count: usize,
        listed_at: DateTime<Utc>,
    },
    RootRebound {
        root: PathBuf,
        rebound_at: DateTime<Utc>,
    },
}

impl SandboxEvent {
    /// Variant name, for log fields and filtering
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxEvent::UnsafePathRejected { .. } => "UnsafePathRejected",
            SandboxEvent::QuotaExceeded { .. } => "QuotaExceeded",
            SandboxEvent::QuotaRaised { .. } => "QuotaRaised",
            SandboxEvent::FileWritten { .. } => "FileWritten",
            SandboxEvent::FileRead { .. } => "FileRead",
            SandboxEvent::PathRemoved { .. } => "PathRemoved",
            SandboxEvent::DirectoryListed { .. } => "DirectoryListed",
            SandboxEvent::RootRebound { .. } => "RootRebound",
        }
    }
}
