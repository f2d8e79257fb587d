// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Remote Access Lock
//!
//! Guest-side [`AccessLock`] that forwards `io` acquire/release to the host
//! document's lock as RPC round trips, so a guest's own sandbox waits for
//! host saves.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::rpc::{GuestRequest, RpcError};
use crate::domain::lock::{AccessLock, LockError, LockGroup};

/// Sends one guest call to the host and waits for its answer
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, request: GuestRequest) -> Result<Value, RpcError>;
}

pub struct RemoteLock {
    transport: Arc<dyn RpcTransport>,
}

impl RemoteLock {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    async fn forward(&self, request: GuestRequest) -> Result<(), LockError> {
        let method = request.method();
        debug!(method, "Forwarding lock call to host");
        self.transport
            .call(request)
            .await
            .map(|_| ())
            .map_err(|e| LockError::Remote(format!("{}: {}", method, e)))
    }
}

#[async_trait]
impl AccessLock for RemoteLock {
    async fn acquire(&self, group: LockGroup) -> Result<(), LockError> {
        match group {
            LockGroup::Io => self.forward(GuestRequest::AcquireIoLock).await,
            LockGroup::Save => Err(LockError::Remote(
                "the save lock is only taken by the host".to_string(),
            )),
        }
    }

    async fn release(&self, group: LockGroup) -> Result<(), LockError> {
        match group {
            LockGroup::Io => self.forward(GuestRequest::ReleaseIoLock).await,
            LockGroup::Save => Err(LockError::NotHeld { group }),
        }
    }

    fn release_abandoned(&self, group: LockGroup) {
        if group != LockGroup::Io {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to return abandoned io lock on");
            return;
        };

        let transport = self.transport.clone();
        runtime.spawn(async move {
            if let Err(e) = transport.call(GuestRequest::ReleaseIoLock).await {
                warn!(error = %e, "Failed to return abandoned io lock to host");
            }
        });
    }
}
