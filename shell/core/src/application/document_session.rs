// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Document Sessions
//!
//! A [`DocumentSession`] owns one open document's working directory: its
//! grouped lock, the sandboxed filesystem guests write through, and the
//! edited flag. Saves and working-directory moves run under the `save`
//! group, so they never overlap guest `io` traffic.
//!
//! The guest may also hold `io` itself (`acquire_io_lock`). Those
//! admissions are counted per session: the guest can only give back what it
//! took, and file calls it makes while holding `io` join the running group
//! rather than queueing behind a save that is waiting on the guest.
//!
//! Open sessions are kept in a [`DocumentRegistry`] keyed by
//! [`DocumentId`]; the RPC dispatcher resolves each call's sender there.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::rpc::HostRequest;
use crate::domain::chroot_fs::{ChrootFs, ChrootOptions};
use crate::domain::document::DocumentId;
use crate::domain::lock::{AccessLock, GroupSemaphore, LockError, LockGroup};
use crate::domain::quota::{ApproveIncrease, DenyIncrease, SizePrompt};
use crate::domain::shell_config::ShellConfigManifest;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::storage::LocalDocumentStorage;

/// How a session's sandbox is set up
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub chroot: ChrootOptions,
    /// Where sandbox audit events go (default: nowhere)
    pub events: Option<EventBus>,
}

impl SessionOptions {
    /// Options derived from shell configuration. `prompt` is used unless
    /// the configuration auto-approves size increases.
    pub fn from_config(config: &ShellConfigManifest, prompt: Option<Arc<dyn SizePrompt>>) -> Self {
        let sandbox = &config.spec.sandbox;
        let prompt: Arc<dyn SizePrompt> = if sandbox.auto_approve_size_increase {
            Arc::new(ApproveIncrease)
        } else {
            prompt.unwrap_or_else(|| Arc::new(DenyIncrease))
        };

        Self {
            chroot: ChrootOptions {
                max_bytes: Some(sandbox.effective_max_bytes()),
                increase_size_prompt: Some(prompt),
            },
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

/// The document lock as seen by the session's own sandbox
struct SessionLock {
    semaphore: Arc<GroupSemaphore>,
    guest_io: Arc<AtomicUsize>,
}

#[async_trait]
impl AccessLock for SessionLock {
    async fn acquire(&self, group: LockGroup) -> Result<(), LockError> {
        // The guest already holds io, so its file calls run under that
        // admission. Queueing could wait on a save that waits on the guest.
        if group == LockGroup::Io
            && self.guest_io.load(Ordering::Acquire) > 0
            && self.semaphore.join(group)
        {
            return Ok(());
        }
        self.semaphore.acquire(group).await
    }

    async fn release(&self, group: LockGroup) -> Result<(), LockError> {
        self.semaphore.release(group)
    }

    fn release_abandoned(&self, group: LockGroup) {
        AccessLock::release_abandoned(self.semaphore.as_ref(), group);
    }
}

pub struct DocumentSession {
    id: DocumentId,
    working_dir: RwLock<PathBuf>,
    lock: Arc<GroupSemaphore>,
    guest_io: Arc<AtomicUsize>,
    fs: ChrootFs,
    edited: AtomicBool,
}

impl DocumentSession {
    pub fn open(working_dir: impl Into<PathBuf>, options: SessionOptions) -> Self {
        let id = DocumentId::new();
        let working_dir = working_dir.into();
        let lock = Arc::new(GroupSemaphore::for_document());
        let guest_io = Arc::new(AtomicUsize::new(0));
        let session_lock = Arc::new(SessionLock {
            semaphore: lock.clone(),
            guest_io: guest_io.clone(),
        });

        let mut fs = ChrootFs::new(Arc::new(LocalDocumentStorage), &working_dir, options.chroot)
            .with_lock(session_lock);
        if let Some(bus) = &options.events {
            fs = fs.with_event_publisher(bus.publisher_for(id));
        }

        info!(document_id = %id, working_dir = %working_dir.display(), "Opened document");
        Self {
            id,
            working_dir: RwLock::new(working_dir),
            lock,
            guest_io,
            fs,
            edited: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn working_dir(&self) -> PathBuf {
        self.working_dir.read().clone()
    }

    pub fn fs(&self) -> &ChrootFs {
        &self.fs
    }

    pub fn lock(&self) -> &GroupSemaphore {
        &self.lock
    }

    /// Admit the guest to `io` on behalf of its own sandbox
    pub async fn acquire_guest_io(&self) -> Result<(), LockError> {
        self.lock.acquire(LockGroup::Io).await?;
        self.guest_io.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Give back one `io` admission the guest took with
    /// [`DocumentSession::acquire_guest_io`]. Fails with
    /// [`LockError::NotHeld`] when the guest holds none, whoever else holds
    /// `io` at the time.
    pub fn release_guest_io(&self) -> Result<(), LockError> {
        self.guest_io
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1))
            .map_err(|_| LockError::NotHeld {
                group: LockGroup::Io,
            })?;

        if let Err(e) = self.lock.release(LockGroup::Io) {
            self.guest_io.fetch_add(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    /// `io` admissions currently held by the guest
    pub fn guest_io_held(&self) -> usize {
        self.guest_io.load(Ordering::Acquire)
    }

    /// Return every `io` admission the guest still holds
    fn release_all_guest_io(&self) {
        let mut returned = 0;
        while self.release_guest_io().is_ok() {
            returned += 1;
        }
        if returned > 0 {
            warn!(document_id = %self.id, returned, "Returned io locks left held by guest");
        }
    }

    pub fn is_edited(&self) -> bool {
        self.edited.load(Ordering::Acquire)
    }

    pub fn set_edited(&self, edited: bool) {
        self.edited.store(edited, Ordering::Release);
    }

    /// Run `persist` with the working directory while holding the `save`
    /// group. The document is marked clean when `persist` succeeds.
    pub async fn save<F, Fut, T, E>(&self, persist: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let working_dir = self.working_dir();
        let saved = self
            .lock
            .run(LockGroup::Save, || persist(working_dir.clone()))
            .await?;

        self.set_edited(false);
        info!(document_id = %self.id, working_dir = %working_dir.display(), "Saved document");
        Ok(saved)
    }

    /// Move the document to a new working directory (Save As).
    ///
    /// Returns the host → guest call that tells the guest's own sandbox
    /// about the new root.
    pub async fn relocate(&self, working_dir: impl AsRef<Path>) -> Result<HostRequest, LockError> {
        let working_dir = working_dir.as_ref().to_path_buf();

        self.lock
            .run(LockGroup::Save, || async {
                *self.working_dir.write() = working_dir.clone();
                self.fs.set_root(working_dir.clone()).await;
                Ok::<_, LockError>(())
            })
            .await?;

        info!(document_id = %self.id, working_dir = %working_dir.display(), "Relocated document");
        Ok(HostRequest::SetChrootfsRoot(working_dir))
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("id", &self.id)
            .field("working_dir", &*self.working_dir.read())
            .field("edited", &self.is_edited())
            .finish_non_exhaustive()
    }
}

/// Open documents by id
#[derive(Default)]
pub struct DocumentRegistry {
    documents: RwLock<HashMap<DocumentId, Arc<DocumentSession>>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: DocumentSession) -> Arc<DocumentSession> {
        let session = Arc::new(session);
        self.documents.write().insert(session.id(), session.clone());
        session
    }

    pub fn get(&self, id: DocumentId) -> Option<Arc<DocumentSession>> {
        self.documents.read().get(&id).cloned()
    }

    pub fn close(&self, id: DocumentId) -> Option<Arc<DocumentSession>> {
        let closed = self.documents.write().remove(&id);
        if let Some(session) = &closed {
            session.release_all_guest_io();
            info!(document_id = %id, "Closed document");
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}
