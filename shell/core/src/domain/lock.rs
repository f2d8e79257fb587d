// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Grouped I/O Lock
//!
//! A FIFO admission lock whose holders are tagged with a [`LockGroup`].
//! Each group declares a [`Concurrency`] class:
//!
//! - `single` groups (document `save`) run one holder at a time;
//! - `multiple` groups (guest `io`) admit any number of holders together;
//! - different groups never run at the same time.
//!
//! Admission is strictly FIFO across group boundaries: an `io` request queued
//! behind a pending `save` waits for the save even though `io` could share
//! with the currently running `io` holders.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Serialize document saves against guest filesystem traffic

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Lock group tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockGroup {
    /// Document save / working-directory changes
    Save,
    /// Guest filesystem reads and writes
    Io,
}

impl fmt::Display for LockGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockGroup::Save => write!(f, "save"),
            LockGroup::Io => write!(f, "io"),
        }
    }
}

/// How many holders of one group may run at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    Single,
    Multiple,
}

/// Lock misuse and transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Cannot release {group} lock: it is not held")]
    NotHeld { group: LockGroup },

    #[error("Cannot release {requested} lock while it is held by {holder}")]
    WrongGroup {
        requested: LockGroup,
        holder: LockGroup,
    },

    #[error("Lock request was dropped before admission")]
    Abandoned,

    #[error("Remote lock call failed: {0}")]
    Remote(String),
}

/// Anything that can be acquired and released per group.
///
/// Implemented by the in-process [`GroupSemaphore`], the pass-through
/// [`NoopLock`], and the RPC-forwarding remote lock used by guest contexts.
#[async_trait]
pub trait AccessLock: Send + Sync {
    /// Wait until the caller is admitted for `group`
    async fn acquire(&self, group: LockGroup) -> Result<(), LockError>;

    /// Give back one admission for `group`
    async fn release(&self, group: LockGroup) -> Result<(), LockError>;

    /// Give back an admission whose holder was dropped before it could call
    /// [`AccessLock::release`]. Runs from `Drop`, so it must not block.
    fn release_abandoned(&self, group: LockGroup);
}

/// Run `f` while holding `group` on `lock`.
///
/// The lock is released whether `f` succeeds or fails; `f`'s outcome wins
/// over a release failure. If the returned future is dropped while holding
/// the lock, the admission is handed back through
/// [`AccessLock::release_abandoned`].
pub async fn with_lock<L, F, Fut, T, E>(lock: &L, group: LockGroup, f: F) -> Result<T, E>
where
    L: AccessLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    lock.acquire(group).await?;
    let mut admission = Admission {
        lock,
        group,
        armed: true,
    };
    let outcome = f().await;
    let released = lock.release(group).await;
    admission.armed = false;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), released) => {
            if let Err(release_error) = released {
                error!(group = %group, error = %release_error, "Failed to release lock after error");
            }
            Err(e)
        }
    }
}

/// Admission taken by [`with_lock`], returned on drop unless disarmed
struct Admission<'a, L: AccessLock + ?Sized> {
    lock: &'a L,
    group: LockGroup,
    armed: bool,
}

impl<L: AccessLock + ?Sized> Drop for Admission<'_, L> {
    fn drop(&mut self) {
        if self.armed {
            debug!(group = %self.group, "Lock holder dropped, returning admission");
            self.lock.release_abandoned(self.group);
        }
    }
}

/// Pass-through lock for callers that need no concurrency control
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl AccessLock for NoopLock {
    async fn acquire(&self, _group: LockGroup) -> Result<(), LockError> {
        Ok(())
    }

    async fn release(&self, _group: LockGroup) -> Result<(), LockError> {
        Ok(())
    }

    fn release_abandoned(&self, _group: LockGroup) {}
}

struct Waiter {
    group: LockGroup,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct SemaphoreState {
    holder: Option<LockGroup>,
    held: usize,
    queue: VecDeque<Waiter>,
}

/// In-process grouped semaphore
pub struct GroupSemaphore {
    groups: HashMap<LockGroup, Concurrency>,
    state: Mutex<SemaphoreState>,
}

impl GroupSemaphore {
    /// Create a semaphore with the given group classes. Groups left out
    /// behave as [`Concurrency::Single`].
    pub fn new(groups: impl IntoIterator<Item = (LockGroup, Concurrency)>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
            state: Mutex::new(SemaphoreState::default()),
        }
    }

    /// The standard document lock: exclusive `save`, shared `io`
    pub fn for_document() -> Self {
        Self::new([
            (LockGroup::Save, Concurrency::Single),
            (LockGroup::Io, Concurrency::Multiple),
        ])
    }

    pub fn concurrency(&self, group: LockGroup) -> Concurrency {
        self.groups.get(&group).copied().unwrap_or(Concurrency::Single)
    }

    /// Queue a request for `group`.
    ///
    /// The request takes its place in the queue immediately, before the
    /// returned future is first polled, so call order is admission order.
    pub fn acquire(&self, group: LockGroup) -> Acquire<'_> {
        let (admit, admitted) = oneshot::channel();
        let mut state = self.state.lock();
        state.queue.push_back(Waiter { group, admit });
        self.pump(&mut state);

        Acquire {
            semaphore: self,
            group,
            admitted,
            settled: false,
        }
    }

    /// Give back one admission for `group`
    pub fn release(&self, group: LockGroup) -> Result<(), LockError> {
        let mut state = self.state.lock();
        match state.holder {
            None => Err(LockError::NotHeld { group }),
            Some(holder) if holder != group => Err(LockError::WrongGroup {
                requested: group,
                holder,
            }),
            Some(_) => {
                state.held -= 1;
                debug!(group = %group, held = state.held, "Released lock");
                if state.held == 0 {
                    state.holder = None;
                    self.pump(&mut state);
                }
                Ok(())
            }
        }
    }

    /// Join `group` without queueing if it is already running and admits
    /// several holders. Returns `false` (and takes nothing) otherwise.
    ///
    /// Only for callers acting on behalf of a current holder; anyone else
    /// would jump waiters queued behind that group.
    pub fn join(&self, group: LockGroup) -> bool {
        let mut state = self.state.lock();
        if state.holder != Some(group) || self.concurrency(group) != Concurrency::Multiple {
            return false;
        }
        state.held += 1;
        debug!(group = %group, held = state.held, "Joined running lock group");
        true
    }

    /// Run `f` while holding `group`.
    ///
    /// The admission is given back when `f` finishes, fails, panics, or the
    /// returned future is dropped.
    pub async fn run<F, Fut, T, E>(&self, group: LockGroup, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.acquire(group).await?;
        let _held = Held {
            semaphore: self,
            group,
        };
        f().await
    }

    /// Group currently running and its number of holders
    pub fn holders(&self) -> Option<(LockGroup, usize)> {
        let state = self.state.lock();
        state.holder.map(|group| (group, state.held))
    }

    /// Number of requests still waiting for admission
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn admissible(&self, state: &SemaphoreState) -> bool {
        match (state.queue.front(), state.holder) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(head), Some(holder)) => {
                head.group == holder && self.concurrency(holder) == Concurrency::Multiple
            }
        }
    }

    fn pump(&self, state: &mut SemaphoreState) {
        while self.admissible(state) {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            // A closed receiver means the requester gave up; skip it.
            if waiter.admit.send(()).is_ok() {
                state.holder = Some(waiter.group);
                state.held += 1;
                debug!(group = %waiter.group, held = state.held, "Admitted lock holder");
            }
        }
    }
}

impl Default for GroupSemaphore {
    fn default() -> Self {
        Self::for_document()
    }
}

#[async_trait]
impl AccessLock for GroupSemaphore {
    async fn acquire(&self, group: LockGroup) -> Result<(), LockError> {
        GroupSemaphore::acquire(self, group).await
    }

    async fn release(&self, group: LockGroup) -> Result<(), LockError> {
        GroupSemaphore::release(self, group)
    }

    fn release_abandoned(&self, group: LockGroup) {
        if let Err(e) = GroupSemaphore::release(self, group) {
            error!(group = %group, error = %e, "Failed to return abandoned admission");
        }
    }
}

/// Future returned by [`GroupSemaphore::acquire`].
///
/// Dropping it before admission withdraws the request; dropping it after
/// admission but before it was polled to completion gives the slot back.
pub struct Acquire<'a> {
    semaphore: &'a GroupSemaphore,
    group: LockGroup,
    admitted: oneshot::Receiver<()>,
    settled: bool,
}

impl Future for Acquire<'_> {
    type Output = Result<(), LockError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.admitted).poll(cx) {
            Poll::Ready(Ok(())) => {
                self.settled = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.settled = true;
                Poll::Ready(Err(LockError::Abandoned))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.admitted.close();
        if self.admitted.try_recv().is_ok() {
            if let Err(e) = self.semaphore.release(self.group) {
                error!(group = %self.group, error = %e, "Failed to return abandoned admission");
            }
        }
    }
}

struct Held<'a> {
    semaphore: &'a GroupSemaphore,
    group: LockGroup,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.release(self.group) {
            error!(group = %self.group, error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn test_saves_are_sequential() {
        let sem = GroupSemaphore::for_document();

        let mut r1 = task::spawn(sem.acquire(LockGroup::Save));
        assert_ready_ok!(r1.poll());

        let mut r2 = task::spawn(sem.acquire(LockGroup::Save));
        assert_pending!(r2.poll());

        sem.release(LockGroup::Save).unwrap();
        assert!(r2.is_woken());
        assert_ready_ok!(r2.poll());
    }

    #[test]
    fn test_save_then_io_is_sequential() {
        let sem = GroupSemaphore::for_document();

        let mut r1 = task::spawn(sem.acquire(LockGroup::Save));
        assert_ready_ok!(r1.poll());

        let mut r2 = task::spawn(sem.acquire(LockGroup::Io));
        assert_pending!(r2.poll());

        sem.release(LockGroup::Save).unwrap();
        assert_ready_ok!(r2.poll());
    }

    #[test]
    fn test_io_then_save_is_sequential() {
        let sem = GroupSemaphore::for_document();

        let mut r1 = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(r1.poll());

        let mut r2 = task::spawn(sem.acquire(LockGroup::Save));
        assert_pending!(r2.poll());

        sem.release(LockGroup::Io).unwrap();
        assert_ready_ok!(r2.poll());
    }

    #[test]
    fn test_io_runs_in_parallel() {
        let sem = GroupSemaphore::for_document();

        let mut r1 = task::spawn(sem.acquire(LockGroup::Io));
        let mut r2 = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(r1.poll());
        assert_ready_ok!(r2.poll());
        assert_eq!(sem.holders(), Some((LockGroup::Io, 2)));
    }

    #[test]
    fn test_io_does_not_jump_pending_save() {
        let sem = GroupSemaphore::for_document();

        let mut r1 = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(r1.poll());
        let mut r2 = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(r2.poll());

        let mut r3 = task::spawn(sem.acquire(LockGroup::Save));
        assert_pending!(r3.poll());
        let mut r4 = task::spawn(sem.acquire(LockGroup::Io));
        assert_pending!(r4.poll());

        sem.release(LockGroup::Io).unwrap();
        sem.release(LockGroup::Io).unwrap();
        assert_ready_ok!(r3.poll());
        assert_pending!(r4.poll());

        sem.release(LockGroup::Save).unwrap();
        assert_ready_ok!(r4.poll());
    }

    #[test]
    fn test_unlisted_group_defaults_to_single() {
        let sem = GroupSemaphore::new([(LockGroup::Save, Concurrency::Single)]);

        let mut r1 = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(r1.poll());
        let mut r2 = task::spawn(sem.acquire(LockGroup::Io));
        assert_pending!(r2.poll());
    }

    #[test]
    fn test_release_without_acquire_fails() {
        let sem = GroupSemaphore::for_document();
        assert_eq!(
            sem.release(LockGroup::Io),
            Err(LockError::NotHeld {
                group: LockGroup::Io
            })
        );
    }

    #[test]
    fn test_release_of_wrong_group_fails() {
        let sem = GroupSemaphore::for_document();
        let mut r1 = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(r1.poll());

        assert_eq!(
            sem.release(LockGroup::Save),
            Err(LockError::WrongGroup {
                requested: LockGroup::Save,
                holder: LockGroup::Io
            })
        );
        assert_eq!(sem.holders(), Some((LockGroup::Io, 1)));
    }

    #[test]
    fn test_dropped_waiter_is_skipped() {
        let sem = GroupSemaphore::for_document();
        let mut r1 = task::spawn(sem.acquire(LockGroup::Save));
        assert_ready_ok!(r1.poll());

        let r2 = sem.acquire(LockGroup::Save);
        let mut r3 = task::spawn(sem.acquire(LockGroup::Io));
        drop(r2);

        sem.release(LockGroup::Save).unwrap();
        assert_ready_ok!(r3.poll());
        assert_eq!(sem.holders(), Some((LockGroup::Io, 1)));
    }

    #[test]
    fn test_admitted_but_unobserved_acquire_gives_slot_back() {
        let sem = GroupSemaphore::for_document();
        let unobserved = sem.acquire(LockGroup::Save);
        assert_eq!(sem.holders(), Some((LockGroup::Save, 1)));

        drop(unobserved);
        assert_eq!(sem.holders(), None);
    }

    #[tokio::test]
    async fn test_run_releases_on_error() {
        let sem = GroupSemaphore::for_document();

        let result: Result<(), LockError> = sem
            .run(LockGroup::Save, || async { Err(LockError::Remote("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(sem.holders(), None);

        let value: Result<u32, LockError> = sem.run(LockGroup::Io, || async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        assert_eq!(sem.holders(), None);
    }

    #[tokio::test]
    async fn test_with_lock_through_trait_object() {
        let lock: Arc<dyn AccessLock> = Arc::new(GroupSemaphore::for_document());

        let value: Result<&str, LockError> =
            with_lock(lock.as_ref(), LockGroup::Io, || async { Ok("done") }).await;
        assert_eq!(value, Ok("done"));

        // The admission was returned
        assert!(lock.release(LockGroup::Io).await.is_err());
    }

    #[test]
    fn test_dropped_with_lock_returns_admission() {
        let sem = GroupSemaphore::for_document();

        let mut held = task::spawn(with_lock(&sem, LockGroup::Io, || {
            std::future::pending::<Result<(), LockError>>()
        }));
        assert_pending!(held.poll());
        assert_eq!(sem.holders(), Some((LockGroup::Io, 1)));

        let mut save = task::spawn(sem.acquire(LockGroup::Save));
        assert_pending!(save.poll());

        drop(held);
        assert_ready_ok!(save.poll());
        assert_eq!(sem.holders(), Some((LockGroup::Save, 1)));
    }

    #[test]
    fn test_join_only_a_running_shared_group() {
        let sem = GroupSemaphore::for_document();
        assert!(!sem.join(LockGroup::Io));

        let mut io = task::spawn(sem.acquire(LockGroup::Io));
        assert_ready_ok!(io.poll());
        let mut save = task::spawn(sem.acquire(LockGroup::Save));
        assert_pending!(save.poll());

        // Joins the running io group even with a save queued
        assert!(sem.join(LockGroup::Io));
        assert_eq!(sem.holders(), Some((LockGroup::Io, 2)));
        assert!(!sem.join(LockGroup::Save));

        sem.release(LockGroup::Io).unwrap();
        assert_pending!(save.poll());
        sem.release(LockGroup::Io).unwrap();
        assert_ready_ok!(save.poll());
        assert!(!sem.join(LockGroup::Save));
    }

    #[tokio::test]
    async fn test_save_excludes_concurrent_io() {
        let sem = Arc::new(GroupSemaphore::for_document());
        let log = Arc::new(Mutex::new(Vec::new()));

        sem.acquire(LockGroup::Save).await.unwrap();

        let io_task = {
            let sem = sem.clone();
            let log = log.clone();
            tokio::spawn(async move {
                sem.run(LockGroup::Io, || async {
                    log.lock().push("io");
                    Ok::<_, LockError>(())
                })
                .await
            })
        };

        tokio::task::yield_now().await;
        log.lock().push("save");
        sem.release(LockGroup::Save).unwrap();

        io_task.await.unwrap().unwrap();
        assert_eq!(*log.lock(), vec!["save", "io"]);
    }
}
