// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Terminal size prompt
//!
//! Asks the user on the controlling terminal whether a document may grow past
//! its size limit. When no terminal is available the increase is refused.

use async_trait::async_trait;
use dialoguer::Confirm;
use tracing::warn;

use lhtml_core::domain::quota::{suggested_ceiling, SizePrompt, MIB};

#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalSizePrompt;

#[async_trait]
impl SizePrompt for TerminalSizePrompt {
    async fn increase_size(&self, requested_bytes: u64, current_max: u64) -> u64 {
        let offered = suggested_ceiling(requested_bytes);
        let question = question(offered);

        let answer = tokio::task::spawn_blocking(move || {
            Confirm::new().with_prompt(question).default(false).interact()
        })
        .await;

        match answer {
            Ok(Ok(true)) => offered,
            Ok(Ok(false)) => current_max,
            Ok(Err(e)) => {
                warn!(error = %e, "Cannot ask about document size; refusing increase");
                current_max
            }
            Err(e) => {
                warn!(error = %e, "Size prompt task failed; refusing increase");
                current_max
            }
        }
    }
}

fn question(offered_bytes: u64) -> String {
    format!(
        "Do you want to allow this document to take {} MB of space?",
        offered_bytes / MIB
    )
}
