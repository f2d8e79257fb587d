// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod document_session;
pub mod remote_lock;
pub mod rpc;

pub use document_session::{DocumentRegistry, DocumentSession, SessionOptions};
pub use remote_lock::{RemoteLock, RpcTransport};
pub use rpc::{GuestEndpoint, GuestRequest, HostRequest, RequestContext, RpcDispatcher, RpcError, RpcMessage, RpcResponse};
