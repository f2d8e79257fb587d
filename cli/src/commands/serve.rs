// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Guest RPC server over stdio
//!
//! Opens one document and answers guest calls read as JSON lines from
//! stdin, writing one JSON response per line to stdout. Calls are handled
//! concurrently, so a guest blocked in `acquire_io_lock` does not stall
//! unrelated calls; responses may therefore arrive out of order and are
//! matched by `id`.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lhtml_core::application::{
    DocumentRegistry, DocumentSession, RequestContext, RpcDispatcher, RpcMessage, RpcResponse,
    SessionOptions,
};
use lhtml_core::domain::shell_config::ShellConfigManifest;
use lhtml_core::infrastructure::event_bus::{EventBus, EventBusError};

use crate::prompt::TerminalSizePrompt;

#[derive(Args)]
pub struct ServeArgs {
    /// Document working directory
    pub working_dir: PathBuf,

    /// Log sandbox audit events
    #[arg(long)]
    pub events: bool,
}

pub async fn run(args: ServeArgs, config: &ShellConfigManifest) -> Result<()> {
    let bus = EventBus::new(config.spec.events.capacity);
    let options = SessionOptions::from_config(config, Some(Arc::new(TerminalSizePrompt)))
        .with_events(bus.clone());

    let registry = Arc::new(DocumentRegistry::new());
    let session = registry.insert(DocumentSession::open(&args.working_dir, options));
    let ctx = RequestContext {
        sender_id: session.id(),
    };

    if args.events {
        tokio::spawn(log_events(bus.clone()));
    }

    info!(
        document_id = %ctx.sender_id,
        working_dir = %args.working_dir.display(),
        max_bytes = session.fs().max_bytes(),
        "Serving guest RPC on stdio"
    );

    let dispatcher = RpcDispatcher::new(registry.clone());
    serve(
        dispatcher,
        ctx,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;

    registry.close(ctx.sender_id);
    Ok(())
}

/// Answer every line of `input` on `output` until `input` ends
pub async fn serve<R, W>(dispatcher: RpcDispatcher, ctx: RequestContext, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();
    let mut lines = input.lines();

    let read_loop = async move {
        while let Some(line) = lines.next_line().await.context("Failed to read request")? {
            if line.trim().is_empty() {
                continue;
            }

            let message = match parse_line(&line) {
                Ok(message) => message,
                Err(response) => {
                    let _ = tx.send(response);
                    continue;
                }
            };

            let dispatcher = dispatcher.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = dispatcher.handle(&ctx, message).await;
                let _ = tx.send(response);
            });
        }
        debug!("Request stream closed");
        anyhow::Ok(())
    };

    let write_loop = async {
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            output.write_all(&line).await.context("Failed to write response")?;
            output.flush().await?;
        }
        anyhow::Ok(())
    };

    let (read, write) = tokio::join!(read_loop, write_loop);
    read?;
    write
}

/// Parse one request line; malformed lines are answered directly when
/// they carry a usable id.
fn parse_line(line: &str) -> std::result::Result<RpcMessage, RpcResponse> {
    match serde_json::from_str::<RpcMessage>(line) {
        Ok(message) => Ok(message),
        Err(e) => {
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64))
                .unwrap_or(0);
            warn!(error = %e, "Malformed request line");
            Err(RpcResponse::failure(id, format!("Malformed message: {}", e)))
        }
    }
}

async fn log_events(bus: EventBus) {
    let mut receiver = bus.subscribe();
    loop {
        match receiver.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "Sandbox event"),
                Err(e) => warn!(error = %e, "Failed to serialize sandbox event"),
            },
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
