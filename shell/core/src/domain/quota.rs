// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Document Size Quota
//!
//! Enforces a per-document ceiling on the total size of the sandbox tree.
//! A write that would cross the ceiling is first offered to a [`SizePrompt`]
//! (usually the user); the ceiling is raised only when the answer covers the
//! projected size, and it never goes down.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const MIB: u64 = 1024 * 1024;

/// Ceiling used when nothing else is configured
pub const DEFAULT_MAX_BYTES: u64 = 10 * MIB;

/// Asks whoever owns the document whether it may grow.
#[async_trait]
pub trait SizePrompt: Send + Sync {
    /// Return the new ceiling. Anything below `requested_bytes` is a refusal.
    async fn increase_size(&self, requested_bytes: u64, current_max: u64) -> u64;
}

/// Refuses every increase
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyIncrease;

#[async_trait]
impl SizePrompt for DenyIncrease {
    async fn increase_size(&self, _requested_bytes: u64, current_max: u64) -> u64 {
        current_max
    }
}

/// Grants every increase at the suggested ceiling
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveIncrease;

#[async_trait]
impl SizePrompt for ApproveIncrease {
    async fn increase_size(&self, requested_bytes: u64, _current_max: u64) -> u64 {
        suggested_ceiling(requested_bytes)
    }
}

/// Ceiling offered to the user for a document that wants `requested_bytes`:
/// 10% headroom over the requested MiB, rounded up to a multiple of 5 MiB.
pub fn suggested_ceiling(requested_bytes: u64) -> u64 {
    let requested_mib = requested_bytes.div_ceil(MIB);
    let with_headroom = (requested_mib * 11).div_ceil(10);
    let rounded = with_headroom.div_ceil(5) * 5;
    rounded.max(5) * MIB
}

/// The projected size does not fit and no larger ceiling was granted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Document would take {requested_bytes} bytes, limit is {max_bytes} bytes")]
pub struct QuotaExceeded {
    pub requested_bytes: u64,
    pub max_bytes: u64,
}

/// Result of an admitted write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Within,
    Raised { from: u64, to: u64 },
}

pub struct QuotaPolicy {
    max_bytes: AtomicU64,
    prompt: Arc<dyn SizePrompt>,
    // One prompt outstanding at a time
    prompt_gate: Mutex<()>,
}

impl QuotaPolicy {
    pub fn new(max_bytes: u64, prompt: Arc<dyn SizePrompt>) -> Self {
        Self {
            max_bytes: AtomicU64::new(max_bytes),
            prompt,
            prompt_gate: Mutex::new(()),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Check that adding `incoming` bytes to a tree of `current_size` bytes
    /// stays under the ceiling, prompting for a raise when it doesn't.
    pub async fn admit(&self, current_size: u64, incoming: u64) -> Result<QuotaDecision, QuotaExceeded> {
        let projected = current_size.saturating_add(incoming);
        if projected <= self.max_bytes() {
            return Ok(QuotaDecision::Within);
        }

        let _gate = self.prompt_gate.lock().await;

        // A prompt that finished while we waited may already cover us.
        let current_max = self.max_bytes();
        if projected <= current_max {
            debug!(requested_bytes = projected, max_bytes = current_max, "Covered by concurrent raise");
            return Ok(QuotaDecision::Within);
        }

        let offered = self.prompt.increase_size(projected, current_max).await;
        if offered < projected {
            return Err(QuotaExceeded {
                requested_bytes: projected,
                max_bytes: current_max,
            });
        }

        let previous = self.max_bytes.fetch_max(offered, Ordering::AcqRel);
        info!(from = previous, to = offered, "Raised document size limit");
        Ok(QuotaDecision::Raised {
            from: previous,
            to: offered.max(previous),
        })
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES, Arc::new(DenyIncrease))
    }
}

impl std::fmt::Debug for QuotaPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaPolicy")
            .field("max_bytes", &self.max_bytes())
            .finish_non_exhaustive()
    }
}
