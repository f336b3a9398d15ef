//! Cancellation scopes for groups of in-flight protocol calls.
//!
//! Every call run through [`CancellationSupport::execute`] gets a child token
//! of the scope. Cancelling a single call cancels its token only; cancelling
//! the scope cancels them all. Registration happens under the same lock as
//! `cancel_all`, so a call is either registered before the scope is cancelled
//! (and gets cancelled with it) or refused.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::session::SessionId;
use crate::utils::error::{HubError, Result};

pub type OperationId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    /// Cancelled but not yet deregistered by its task.
    Cancelled,
}

/// One outstanding call, visible while it is registered.
#[derive(Clone, Debug)]
pub struct InFlightOperation {
    pub id: OperationId,
    pub session: Option<SessionId>,
    pub submitted: Instant,
    token: CancellationToken,
}

impl InFlightOperation {
    pub fn state(&self) -> OperationState {
        if self.token.is_cancelled() {
            OperationState::Cancelled
        } else {
            OperationState::Pending
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[derive(Clone, Default)]
pub struct CancellationSupport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    scope: CancellationToken,
    next_id: AtomicU64,
    operations: Mutex<HashMap<OperationId, InFlightOperation>>,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

impl CancellationSupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call` as part of this scope.
    ///
    /// Resolves to `OperationCancelled` as soon as the call or the scope is
    /// cancelled; `call` is dropped at that point, which is what makes an
    /// [`RpcClient`](crate::lsp::RpcClient) request emit `$/cancelRequest`.
    pub async fn execute<F, T>(&self, session: Option<SessionId>, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let (id, token) = self.register(session)?;
        let _registration = Registration { inner: &self.inner, id };

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(HubError::OperationCancelled),
            result = call => result,
        };

        let counter = match &outcome {
            Ok(_) => &self.inner.completed,
            Err(e) if e.is_cancellation() => &self.inner.cancelled,
            Err(_) => &self.inner.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn register(&self, session: Option<SessionId>) -> Result<(OperationId, CancellationToken)> {
        let mut operations = self.inner.operations.lock().expect("operations mutex poisoned");
        if self.inner.scope.is_cancelled() {
            return Err(HubError::OperationCancelled);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.scope.child_token();
        operations.insert(id, InFlightOperation { id, session, submitted: Instant::now(), token: token.clone() });
        Ok((id, token))
    }

    /// Cancel one call. Returns `false` when it already finished.
    pub fn cancel(&self, id: OperationId) -> bool {
        let operations = self.inner.operations.lock().expect("operations mutex poisoned");
        operations.get(&id).map(|op| op.token.cancel()).is_some()
    }

    /// Cancel every pending call and refuse new ones from now on.
    pub fn cancel_all(&self) {
        let _operations = self.inner.operations.lock().expect("operations mutex poisoned");
        self.inner.scope.cancel();
    }

    /// Cooperative poll point for loops consuming streamed results.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(HubError::OperationCancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    /// Resolves once the whole scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.scope.cancelled().await;
    }

    pub fn pending(&self) -> usize {
        self.inner.operations.lock().expect("operations mutex poisoned").len()
    }

    pub fn pending_operations(&self) -> Vec<InFlightOperation> {
        let operations = self.inner.operations.lock().expect("operations mutex poisoned");
        let mut pending: Vec<_> = operations.values().cloned().collect();
        pending.sort_by_key(|op| op.id);
        pending
    }

    pub fn stats(&self) -> OperationStats {
        OperationStats {
            completed: self.inner.completed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

/// Deregisters the call however `execute` ends, including being dropped.
struct Registration<'a> {
    inner: &'a Inner,
    id: OperationId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Ok(mut operations) = self.inner.operations.lock() {
            operations.remove(&self.id);
        }
    }
}
