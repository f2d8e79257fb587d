// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the guest RPC boundary
//!
//! These tests verify:
//! 1. Per-method dispatch against the sender's document
//! 2. Error answers (unknown method, unknown sender, unsafe path)
//! 3. Guest io lock calls against host saves
//! 4. A guest-side sandbox locking through the host via `RemoteLock`
//! 5. Root rebinding pushed from host to guest
//! 6. Audit events reaching the event bus

use async_trait::async_trait;
use base64::Engine as _;
use lhtml_core::application::{
    DocumentRegistry, DocumentSession, GuestEndpoint, GuestRequest, RemoteLock, RequestContext,
    RpcDispatcher, RpcError, RpcMessage, RpcTransport, SessionOptions,
};
use lhtml_core::domain::chroot_fs::{ChrootFs, ChrootOptions};
use lhtml_core::domain::document::DocumentId;
use lhtml_core::domain::events::SandboxEvent;
use lhtml_core::domain::lock::{LockError, LockGroup};
use lhtml_core::infrastructure::event_bus::EventBus;
use lhtml_core::infrastructure::storage::LocalDocumentStorage;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn local_fs(root: impl Into<PathBuf>, options: ChrootOptions) -> ChrootFs {
    ChrootFs::new(Arc::new(LocalDocumentStorage), root, options)
}

struct Host {
    _dir: TempDir,
    dispatcher: RpcDispatcher,
    session: Arc<DocumentSession>,
    ctx: RequestContext,
}

fn host_with(options: SessionOptions) -> Host {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(DocumentRegistry::new());
    let session = registry.insert(DocumentSession::open(dir.path(), options));
    let ctx = RequestContext {
        sender_id: session.id(),
    };
    Host {
        _dir: dir,
        dispatcher: RpcDispatcher::new(registry),
        session,
        ctx,
    }
}

fn host() -> Host {
    host_with(SessionOptions::default())
}

async fn call(host: &Host, method: &str, params: Value) -> Value {
    let response = host
        .dispatcher
        .handle(
            &host.ctx,
            RpcMessage {
                id: 1,
                method: method.to_string(),
                params,
            },
        )
        .await;
    serde_json::to_value(response).unwrap()
}

/// Start a host save and wait until it is queued on the document lock
async fn queue_save(host: &Host) -> tokio::task::JoinHandle<Result<(), LockError>> {
    let session = host.session.clone();
    let save = tokio::spawn(async move { session.save(|_| async { Ok::<_, LockError>(()) }).await });
    while host.session.lock().pending() == 0 {
        tokio::task::yield_now().await;
    }
    save
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Transport that hands guest calls straight to a host dispatcher
struct Loopback {
    dispatcher: RpcDispatcher,
    ctx: RequestContext,
    next_id: AtomicU64,
}

#[async_trait]
impl RpcTransport for Loopback {
    async fn call(&self, request: GuestRequest) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.dispatcher
            .handle(&self.ctx, request.into_message(id))
            .await
            .into_result()
    }
}

#[tokio::test]
async fn test_echo() {
    let host = host();
    assert_eq!(call(&host, "echo", json!("ping")).await, json!({"id": 1, "result": "echo: ping"}));
}

#[tokio::test]
async fn test_unknown_method() {
    let host = host();
    assert_eq!(
        call(&host, "open_devtools", Value::Null).await,
        json!({"id": 1, "error": "No such method: open_devtools"})
    );
}

#[tokio::test]
async fn test_file_methods() {
    let host = host();

    let written = call(&host, "writeFile", json!({"path": "notes/today.txt", "data": b64(b"hi")})).await;
    assert_eq!(written, json!({"id": 1, "result": null}));

    let read = call(&host, "readFile", json!("notes/today.txt")).await;
    assert_eq!(read["result"], json!(b64(b"hi")));

    let listed = call(&host, "listdir", Value::Null).await;
    let entries = listed["result"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["path"], "notes");
    assert_eq!(entries[0]["isdir"], true);
    assert_eq!(entries[1]["path"], "notes/today.txt");
    assert!(entries[1].get("isdir").is_none());

    let removed = call(&host, "remove", json!("notes")).await;
    assert_eq!(removed["result"], Value::Null);
    assert!(host.session.working_dir().read_dir().unwrap().next().is_none());
}

#[tokio::test]
async fn test_unsafe_path_is_an_error_answer() {
    let host = host();
    let answer = call(&host, "readFile", json!("../../etc/passwd")).await;
    assert_eq!(answer["error"], "../../etc/passwd is outside base dir");
}

#[tokio::test]
async fn test_bad_base64_is_rejected() {
    let host = host();
    let answer = call(&host, "writeFile", json!({"path": "x", "data": "***"})).await;
    assert!(answer["error"].as_str().unwrap().starts_with("Invalid base64 data"));
}

#[tokio::test]
async fn test_unknown_sender() {
    let host = host();
    let stranger = RequestContext {
        sender_id: DocumentId::new(),
    };
    let err = host
        .dispatcher
        .dispatch(&stranger, GuestRequest::ReadFile("a".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::UnknownDocument(_)));
}

#[tokio::test]
async fn test_get_chrootfs_root_and_edited_flag() {
    let host = host();

    let root = call(&host, "get_chrootfs_root", Value::Null).await;
    assert_eq!(root["result"], json!(host.session.working_dir().to_string_lossy()));

    let edited = call(&host, "set_document_edited", json!(true)).await;
    assert_eq!(edited["result"], json!(true));
    assert!(host.session.is_edited());
}

#[tokio::test]
async fn test_io_lock_methods() {
    let host = host();

    assert_eq!(call(&host, "acquire_io_lock", Value::Null).await["result"], Value::Null);
    assert_eq!(host.session.lock().holders(), Some((LockGroup::Io, 1)));

    assert_eq!(call(&host, "release_io_lock", Value::Null).await["result"], Value::Null);
    assert_eq!(host.session.lock().holders(), None);

    let extra = call(&host, "release_io_lock", Value::Null).await;
    assert!(extra["error"].is_string());
}

#[tokio::test]
async fn test_guest_cannot_release_io_it_never_acquired() {
    let host = host();
    host.session.lock().acquire(LockGroup::Io).await.unwrap();
    let save = queue_save(&host).await;

    let answer = call(&host, "release_io_lock", Value::Null).await;
    assert_eq!(answer["error"], "Cannot release io lock: it is not held");

    // The host's io operation still holds the lock and the save still waits
    tokio::task::yield_now().await;
    assert_eq!(host.session.lock().holders(), Some((LockGroup::Io, 1)));
    assert!(!save.is_finished());

    host.session.lock().release(LockGroup::Io).unwrap();
    save.await.unwrap().unwrap();
    assert_eq!(host.session.lock().holders(), None);
}

#[tokio::test]
async fn test_guest_release_leaves_host_io_in_place() {
    let host = host();
    host.session.lock().acquire(LockGroup::Io).await.unwrap();
    call(&host, "acquire_io_lock", Value::Null).await;
    assert_eq!(host.session.lock().holders(), Some((LockGroup::Io, 2)));

    assert_eq!(call(&host, "release_io_lock", Value::Null).await["result"], Value::Null);
    assert!(call(&host, "release_io_lock", Value::Null).await["error"].is_string());
    assert_eq!(host.session.lock().holders(), Some((LockGroup::Io, 1)));
}

#[tokio::test]
async fn test_file_calls_under_guest_io_lock_do_not_wait_for_queued_save() {
    let host = host();
    assert_eq!(call(&host, "acquire_io_lock", Value::Null).await["result"], Value::Null);
    let save = queue_save(&host).await;

    let written = tokio::time::timeout(
        Duration::from_secs(2),
        call(&host, "writeFile", json!({"path": "during-save.txt", "data": b64(b"w")})),
    )
    .await
    .expect("writeFile queued behind the save it blocks");
    assert_eq!(written["result"], Value::Null);

    let listed = tokio::time::timeout(Duration::from_secs(2), call(&host, "listdir", Value::Null))
        .await
        .expect("listdir queued behind the save it blocks");
    assert_eq!(listed["result"][0]["path"], "during-save.txt");

    // Only the guest's own admission is left; the save is still waiting on it
    assert_eq!(host.session.lock().holders(), Some((LockGroup::Io, 1)));
    assert!(!save.is_finished());

    assert_eq!(call(&host, "release_io_lock", Value::Null).await["result"], Value::Null);
    save.await.unwrap().unwrap();
    assert_eq!(host.session.lock().holders(), None);
}

#[tokio::test]
async fn test_guest_sandbox_waits_for_host_save() {
    let host = host();
    let transport = Arc::new(Loopback {
        dispatcher: host.dispatcher.clone(),
        ctx: host.ctx,
        next_id: AtomicU64::new(0),
    });
    let guest_fs = Arc::new(
        local_fs(host.session.working_dir(), ChrootOptions::default())
            .with_lock(Arc::new(RemoteLock::new(transport))),
    );

    host.session.lock().acquire(LockGroup::Save).await.unwrap();

    let write = {
        let guest_fs = guest_fs.clone();
        tokio::spawn(async move { guest_fs.write_file("from-guest.txt", b"g").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!host.session.working_dir().join("from-guest.txt").exists());

    host.session.lock().release(LockGroup::Save).unwrap();
    write.await.unwrap().unwrap();

    assert!(host.session.working_dir().join("from-guest.txt").exists());
    assert_eq!(host.session.lock().holders(), None);
}

#[tokio::test]
async fn test_relocation_reaches_guest_sandbox() {
    let host = host();
    let moved = TempDir::new().unwrap();
    let guest_fs = Arc::new(local_fs(host.session.working_dir(), ChrootOptions::default()));
    let guest = GuestEndpoint::new(guest_fs.clone());

    let message = host.session.relocate(moved.path()).await.unwrap().into_message(9);
    let answer = guest.handle(message).await;
    assert_eq!(answer.error, None);

    guest_fs.write_file("after-move.txt", b"m").await.unwrap();
    assert!(moved.path().join("after-move.txt").exists());
}

#[tokio::test]
async fn test_events_reach_the_bus() {
    let bus = EventBus::new(16);
    let host = host_with(SessionOptions::default().with_events(bus.clone()));
    let mut events = bus.subscribe_document(host.session.id());

    call(&host, "writeFile", json!({"path": "a.txt", "data": b64(b"a")})).await;
    call(&host, "readFile", json!("../outside")).await;

    let written = events.recv().await.unwrap();
    assert!(matches!(written.event, SandboxEvent::FileWritten { ref path, bytes_written: 1, .. } if path == "a.txt"));

    let rejected = events.recv().await.unwrap();
    assert!(matches!(rejected.event, SandboxEvent::UnsafePathRejected { .. }));
}
