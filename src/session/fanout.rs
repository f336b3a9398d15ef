//! Fan one logical request out to every matching session and merge the answers.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::cancellation::CancellationSupport;
use super::registry::SessionRegistry;
use super::session::{LanguageServerSession, SessionSnapshot};
use crate::definition::Document;
use crate::lsp::capabilities::{Capability, ServerCapabilities};
use crate::utils::error::{HubError, Result};

/// One session's share of a fanout.
#[derive(Serialize, Clone, Debug)]
pub struct Contribution<T> {
    pub session: SessionSnapshot,
    pub value: T,
}

/// Merged outcome of a fanout.
///
/// `contributions` follow session resolution order. Sessions that answered
/// with nothing, failed or missed the deadline are only counted.
#[derive(Serialize, Clone, Debug)]
pub struct FanoutResult<T> {
    pub contributions: Vec<Contribution<T>>,
    pub matched: usize,
    pub empty: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl<T> FanoutResult<T> {
    fn new(matched: usize) -> Self {
        Self { contributions: Vec::new(), matched, empty: 0, failed: 0, timed_out: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.contributions.iter().map(|c| &c.value)
    }

    pub fn into_values(self) -> Vec<T> {
        self.contributions.into_iter().map(|c| c.value).collect()
    }
}

type Arrival<T> = (usize, SessionSnapshot, Result<Option<T>>);

#[derive(Clone)]
pub struct RequestFanout {
    registry: Arc<SessionRegistry>,
}

impl RequestFanout {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Issue `request_fn` on every session matching `document` and `predicate`.
    ///
    /// `timeout` bounds the wait for answers, not session start-up. Calls still
    /// running at the deadline keep running in the background and are left out
    /// of the result; their sessions are not touched. Only cancellation of
    /// `scope` or a failure to resolve sessions fails the whole fanout.
    pub async fn fanout<P, F, Fut, T>(
        &self,
        document: &Document,
        predicate: P,
        request_fn: F,
        timeout: Duration,
        scope: &CancellationSupport,
    ) -> Result<FanoutResult<T>>
    where
        P: Fn(&ServerCapabilities) -> bool,
        F: Fn(Arc<LanguageServerSession>) -> Fut,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
        T: Send + 'static,
    {
        scope.check_cancelled()?;
        let sessions = tokio::select! {
            biased;
            () = scope.cancelled() => return Err(HubError::OperationCancelled),
            sessions = self.registry.get_sessions(document, predicate) => sessions?,
        };

        let mut result = FanoutResult::new(sessions.len());
        if sessions.is_empty() {
            return Ok(result);
        }

        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = mpsc::unbounded_channel::<Arrival<T>>();
        for (index, session) in sessions.into_iter().enumerate() {
            let tx = tx.clone();
            let scope = scope.clone();
            let snapshot = session.snapshot();
            let id = session.id();
            let call = request_fn(session);
            tokio::spawn(async move {
                let outcome = scope.execute(Some(id), call).await;
                let _ = tx.send((index, snapshot, outcome));
            });
        }
        drop(tx);

        let mut arrived = 0;
        let mut contributions = Vec::new();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = scope.cancelled() => return Err(HubError::OperationCancelled),
                () = &mut sleep => {
                    result.timed_out = result.matched - arrived;
                    tracing::warn!(
                        "{} of {} sessions did not answer within {}ms",
                        result.timed_out,
                        result.matched,
                        timeout.as_millis()
                    );
                    break;
                }
                arrival = rx.recv() => {
                    let Some((index, session, outcome)) = arrival else {
                        break;
                    };
                    arrived += 1;
                    match outcome {
                        Ok(Some(value)) => contributions.push((index, Contribution { session, value })),
                        Ok(None) => result.empty += 1,
                        Err(e) if e.is_cancellation() => {
                            tracing::debug!("Request to {} was cancelled", session.definition_id);
                            result.failed += 1;
                        }
                        Err(e) => {
                            tracing::warn!("Request to {} failed: {e}", session.definition_id);
                            result.failed += 1;
                        }
                    }
                }
            }
        }

        contributions.sort_by_key(|(index, _)| *index);
        result.contributions = contributions.into_iter().map(|(_, c)| c).collect();
        Ok(result)
    }

    /// Fan a raw LSP request out, keeping sessions whose capabilities cover `method`.
    ///
    /// Methods without a known capability go to every running session. `null`
    /// and `[]` answers count as no contribution.
    pub async fn request(
        &self,
        document: &Document,
        method: &str,
        params: Value,
        timeout: Duration,
        scope: &CancellationSupport,
    ) -> Result<FanoutResult<Value>> {
        let capability = Capability::for_method(method);
        let predicate = move |caps: &ServerCapabilities| capability.is_none_or(|c| caps.supports(c));
        let method = method.to_string();
        let request_fn = move |session: Arc<LanguageServerSession>| {
            let method = method.clone();
            let params = params.clone();
            async move {
                let value = session.request(&method, Some(params)).await?;
                Ok::<_, HubError>(value.filter(|v| !is_empty_answer(v)))
            }
        };
        self.fanout(document, predicate, request_fn, timeout, scope).await
    }
}

fn is_empty_answer(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
