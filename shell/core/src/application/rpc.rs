// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Guest/Host RPC Contract
//!
//! Messages crossing the boundary between a guest document and the shell.
//! On the wire every call is `{ "id": n, "method": "...", "params": ... }`
//! and is answered by `{ "id": n, "result": ... }` or
//! `{ "id": n, "error": "..." }`.
//!
//! Methods are closed enums ([`GuestRequest`] for guest → host,
//! [`HostRequest`] for host → guest). A method name outside the enum is
//! answered with `No such method: <name>`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Route guest calls to the sender's document session

use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::document_session::DocumentRegistry;
use crate::domain::chroot_fs::{ChrootError, ChrootFs};
use crate::domain::document::DocumentId;
use crate::domain::lock::LockError;
use crate::domain::storage::ListOptions;

/// RPC failures; rendered to the guest as their display string
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("No such method: {0}")]
    NoSuchMethod(String),

    #[error("Invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("No open document for sender {0}")]
    UnknownDocument(DocumentId),

    #[error("Invalid base64 data: {0}")]
    InvalidData(#[from] base64::DecodeError),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Chroot(#[from] ChrootError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// One call on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Answer to an [`RpcMessage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl ToString) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Request context threaded through dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// Document the calling guest belongs to
    pub sender_id: DocumentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileParams {
    pub path: String,
    /// Base64-encoded file contents
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListdirParams {
    Path(String),
    Detailed {
        #[serde(default)]
        path: Option<String>,
        #[serde(flatten)]
        options: ListOptions,
    },
}

/// Guest → host calls
#[derive(Debug, Clone, PartialEq)]
pub enum GuestRequest {
    Echo(String),
    WriteFile(WriteFileParams),
    ReadFile(String),
    Remove(String),
    Listdir(Option<ListdirParams>),
    GetChrootfsRoot,
    AcquireIoLock,
    ReleaseIoLock,
    SetDocumentEdited(bool),
}

impl GuestRequest {
    pub fn parse(method: &str, params: Value) -> Result<Self, RpcError> {
        let request = match method {
            "echo" => GuestRequest::Echo(from_params(method, params)?),
            "writeFile" => GuestRequest::WriteFile(from_params(method, params)?),
            "readFile" => GuestRequest::ReadFile(from_params(method, params)?),
            "remove" => GuestRequest::Remove(from_params(method, params)?),
            "listdir" => GuestRequest::Listdir(from_params(method, params)?),
            "get_chrootfs_root" => GuestRequest::GetChrootfsRoot,
            "acquire_io_lock" => GuestRequest::AcquireIoLock,
            "release_io_lock" => GuestRequest::ReleaseIoLock,
            "set_document_edited" => GuestRequest::SetDocumentEdited(from_params(method, params)?),
            other => return Err(RpcError::NoSuchMethod(other.to_string())),
        };
        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            GuestRequest::Echo(_) => "echo",
            GuestRequest::WriteFile(_) => "writeFile",
            GuestRequest::ReadFile(_) => "readFile",
            GuestRequest::Remove(_) => "remove",
            GuestRequest::Listdir(_) => "listdir",
            GuestRequest::GetChrootfsRoot => "get_chrootfs_root",
            GuestRequest::AcquireIoLock => "acquire_io_lock",
            GuestRequest::ReleaseIoLock => "release_io_lock",
            GuestRequest::SetDocumentEdited(_) => "set_document_edited",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            GuestRequest::Echo(text) => json!(text),
            GuestRequest::WriteFile(params) => json!(params),
            GuestRequest::ReadFile(path) | GuestRequest::Remove(path) => json!(path),
            GuestRequest::Listdir(params) => json!(params),
            GuestRequest::GetChrootfsRoot
            | GuestRequest::AcquireIoLock
            | GuestRequest::ReleaseIoLock => Value::Null,
            GuestRequest::SetDocumentEdited(edited) => json!(edited),
        }
    }

    pub fn into_message(self, id: u64) -> RpcMessage {
        RpcMessage {
            id,
            method: self.method().to_string(),
            params: self.params(),
        }
    }
}

/// Host → guest calls
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    /// The document's working directory moved
    SetChrootfsRoot(PathBuf),
    /// Flush in-page state to the working directory before a save
    SaveYourStuff,
}

impl HostRequest {
    pub fn parse(method: &str, params: Value) -> Result<Self, RpcError> {
        match method {
            "set_chrootfs_root" => Ok(HostRequest::SetChrootfsRoot(from_params(method, params)?)),
            "save_your_stuff" => Ok(HostRequest::SaveYourStuff),
            other => Err(RpcError::NoSuchMethod(other.to_string())),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            HostRequest::SetChrootfsRoot(_) => "set_chrootfs_root",
            HostRequest::SaveYourStuff => "save_your_stuff",
        }
    }

    pub fn into_message(self, id: u64) -> RpcMessage {
        let params = match &self {
            HostRequest::SetChrootfsRoot(root) => path_value(root),
            HostRequest::SaveYourStuff => Value::Null,
        };
        RpcMessage {
            id,
            method: self.method().to_string(),
            params,
        }
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn from_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Host-side dispatcher for guest calls
#[derive(Clone)]
pub struct RpcDispatcher {
    documents: Arc<DocumentRegistry>,
}

impl RpcDispatcher {
    pub fn new(documents: Arc<DocumentRegistry>) -> Self {
        Self { documents }
    }

    /// Answer one wire message; never fails, errors become `error` responses
    pub async fn handle(&self, ctx: &RequestContext, message: RpcMessage) -> RpcResponse {
        debug!(id = message.id, method = %message.method, sender = %ctx.sender_id, "RPC request");

        let outcome = match GuestRequest::parse(&message.method, message.params) {
            Ok(request) => self.dispatch(ctx, request).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => RpcResponse::success(message.id, result),
            Err(e) => {
                warn!(id = message.id, method = %message.method, error = %e, "RPC request failed");
                RpcResponse::failure(message.id, e)
            }
        }
    }

    pub async fn dispatch(&self, ctx: &RequestContext, request: GuestRequest) -> Result<Value, RpcError> {
        let session = || {
            self.documents
                .get(ctx.sender_id)
                .ok_or(RpcError::UnknownDocument(ctx.sender_id))
        };

        match request {
            GuestRequest::Echo(text) => Ok(json!(format!("echo: {}", text))),
            GuestRequest::WriteFile(params) => {
                let data = base64::engine::general_purpose::STANDARD.decode(params.data.as_bytes())?;
                session()?.fs().write_file(&params.path, &data).await?;
                Ok(Value::Null)
            }
            GuestRequest::ReadFile(path) => {
                let data = session()?.fs().read_file(&path).await?;
                Ok(json!(base64::engine::general_purpose::STANDARD.encode(data)))
            }
            GuestRequest::Remove(path) => {
                session()?.fs().remove(&path).await?;
                Ok(Value::Null)
            }
            GuestRequest::Listdir(params) => {
                let (path, options) = match params {
                    None => (None, ListOptions::default()),
                    Some(ListdirParams::Path(path)) => (Some(path), ListOptions::default()),
                    Some(ListdirParams::Detailed { path, options }) => (path, options),
                };
                let entries = session()?.fs().listdir(path.as_deref(), options).await?;
                Ok(serde_json::to_value(entries)?)
            }
            GuestRequest::GetChrootfsRoot => Ok(path_value(&session()?.working_dir())),
            GuestRequest::AcquireIoLock => {
                session()?.acquire_guest_io().await?;
                Ok(Value::Null)
            }
            GuestRequest::ReleaseIoLock => {
                session()?.release_guest_io()?;
                Ok(Value::Null)
            }
            GuestRequest::SetDocumentEdited(edited) => {
                session()?.set_edited(edited);
                Ok(json!(edited))
            }
        }
    }
}

/// Guest-side handler for host calls
pub struct GuestEndpoint {
    fs: Arc<ChrootFs>,
}

impl GuestEndpoint {
    pub fn new(fs: Arc<ChrootFs>) -> Self {
        Self { fs }
    }

    pub async fn handle(&self, message: RpcMessage) -> RpcResponse {
        match HostRequest::parse(&message.method, message.params) {
            Ok(request) => RpcResponse::success(message.id, self.dispatch(request).await),
            Err(e) => RpcResponse::failure(message.id, e),
        }
    }

    pub async fn dispatch(&self, request: HostRequest) -> Value {
        match request {
            HostRequest::SetChrootfsRoot(root) => {
                self.fs.set_root(root).await;
                Value::Null
            }
            HostRequest::SaveYourStuff => Value::Null,
        }
    }
}
