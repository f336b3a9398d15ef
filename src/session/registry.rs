//! Session registry management.
//!
//! The registry owns the server definitions and one session per
//! (definition, root) pair. Sessions are started lazily by the first document
//! that needs them and replaced by a fresh session once they end.

use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::lifecycle::LifecycleManager;
use super::session::{LanguageServerSession, SessionSnapshot};
use super::state::SessionState;
use crate::definition::{Document, RestartPolicy, ServerDefinition};
use crate::lsp::capabilities::ServerCapabilities;
use crate::lsp::connection::{ConnectionFactory, ProcessConnectionFactory};
use crate::utils::error::{HubError, Result};
use crate::workspace::WorkspaceDetector;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub definition_id: String,
    pub root: PathBuf,
}

impl SessionKey {
    pub fn new(definition_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self { definition_id: definition_id.into(), root: root.into() }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    failures: u32,
    last_failure: Instant,
}

/// Failed starts and crashes per key, with exponential back-off.
///
/// Only [`reset`](Self::reset) clears a key; a start that reaches `Running`
/// does not, so a server that keeps crashing after the handshake still runs
/// into the limit.
#[derive(Debug, Default)]
pub struct RestartTracker {
    records: HashMap<SessionKey, FailureRecord>,
}

impl RestartTracker {
    pub fn failures(&self, key: &SessionKey) -> u32 {
        self.records.get(key).map_or(0, |r| r.failures)
    }

    /// Whether a new session may be started for `key` right now.
    pub fn check(&self, key: &SessionKey, policy: &RestartPolicy) -> Result<()> {
        let Some(record) = self.records.get(key) else {
            return Ok(());
        };
        if policy.is_exhausted(record.failures) {
            return Err(HubError::RestartLimitReached {
                server: key.definition_id.clone(),
                root: key.root.display().to_string(),
                attempts: record.failures,
            });
        }
        if record.last_failure.elapsed() < policy.backoff(record.failures) {
            return Err(HubError::unavailable(&key.definition_id));
        }
        Ok(())
    }

    pub fn record_failure(&mut self, key: &SessionKey) -> u32 {
        let record = self
            .records
            .entry(key.clone())
            .or_insert(FailureRecord { failures: 0, last_failure: Instant::now() });
        record.failures += 1;
        record.last_failure = Instant::now();
        record.failures
    }

    pub fn reset(&mut self, key: &SessionKey) -> bool {
        self.records.remove(key).is_some()
    }
}

/// Maps documents to live sessions.
///
/// Constructed once and shared behind an `Arc`; every method takes `&self`.
/// The session map lock is never held across an `.await`: sessions are
/// created under it and started after it is released.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use lsp_hub::definition::{Document, DocumentSelector, ServerDefinition};
/// use lsp_hub::lsp::Capability;
/// use lsp_hub::session::{LifecycleManager, SessionRegistry};
///
/// # async fn example() -> lsp_hub::Result<()> {
/// let registry = SessionRegistry::with_process_factory(Arc::new(LifecycleManager::new()));
/// registry.register(
///     ServerDefinition::new("txt-ls", vec!["txt-ls".into(), "--stdio".into()])
///         .with_selector(DocumentSelector::patterns(&["*.txt"])?),
/// )?;
///
/// let document = Document::new("/work/notes.txt", "/work");
/// let sessions = registry
///     .get_sessions(&document, |caps| caps.supports(Capability::Completion))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionRegistry {
    definitions: RwLock<Vec<Arc<ServerDefinition>>>,
    sessions: Mutex<HashMap<SessionKey, Arc<LanguageServerSession>>>,
    restarts: Mutex<RestartTracker>,
    lifecycle: Arc<LifecycleManager>,
    factory: Arc<dyn ConnectionFactory>,
}

impl SessionRegistry {
    pub fn new(lifecycle: Arc<LifecycleManager>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            restarts: Mutex::new(RestartTracker::default()),
            lifecycle,
            factory,
        }
    }

    /// A registry that launches servers as child processes.
    pub fn with_process_factory(lifecycle: Arc<LifecycleManager>) -> Self {
        Self::new(lifecycle, Arc::new(ProcessConnectionFactory))
    }

    /// Add a definition. Definitions are matched in registration order.
    pub fn register(&self, definition: ServerDefinition) -> Result<()> {
        definition.validate()?;
        let mut definitions = self.definitions.write().expect("definitions lock poisoned");
        if definitions.iter().any(|d| d.id == definition.id) {
            return Err(HubError::Config(format!("duplicate server id '{}'", definition.id)));
        }
        definitions.push(Arc::new(definition));
        Ok(())
    }

    pub fn definitions(&self) -> Vec<Arc<ServerDefinition>> {
        self.definitions.read().expect("definitions lock poisoned").clone()
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Running sessions eligible for `document` whose capabilities satisfy `predicate`.
    ///
    /// Sessions that do not exist yet are started first; the call completes
    /// once every one of them is `Running` or `Failed`. Failed sessions,
    /// definitions in back-off and non-matching capabilities are simply left
    /// out, so "nothing matched" is an empty vector.
    pub async fn get_sessions<P>(&self, document: &Document, predicate: P) -> Result<Vec<Arc<LanguageServerSession>>>
    where
        P: Fn(&ServerCapabilities) -> bool,
    {
        let eligible: Vec<(Arc<ServerDefinition>, SessionKey)> = self
            .definitions()
            .into_iter()
            .filter(|definition| definition.selector.matches(document))
            .map(|definition| {
                let key = SessionKey::new(&definition.id, resolve_root(&definition, document));
                (definition, key)
            })
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.acquire(eligible);

        let started = join_all(candidates.iter().map(|(session, _, _)| async move {
            if let Err(e) = session.start(self.factory.as_ref()).await {
                tracing::warn!("{} failed to start for {}: {e}", session.definition().id, session.root().display());
            }
        }));
        started.await;

        let mut matched = Vec::new();
        for (session, key, created) in candidates {
            let running = session.state() == SessionState::Running;
            if created {
                self.record_start(&key, &session.definition().restart, running);
            }
            if !running {
                continue;
            }
            session.touch();
            if let Err(e) = session.open_document(document).await {
                tracing::warn!("Failed to open {} on {}: {e}", document.path.display(), session.definition().id);
                continue;
            }
            if session.capabilities().is_some_and(&predicate) {
                matched.push(session);
            }
        }
        Ok(matched)
    }

    /// Reuse live sessions, create the missing ones. Returns `(session, key, created)`.
    fn acquire(
        &self,
        eligible: Vec<(Arc<ServerDefinition>, SessionKey)>,
    ) -> Vec<(Arc<LanguageServerSession>, SessionKey, bool)> {
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        let mut restarts = self.restarts.lock().expect("restarts mutex poisoned");

        let mut candidates = Vec::with_capacity(eligible.len());
        for (definition, key) in eligible {
            if let Some(existing) = sessions.get(&key) {
                if !existing.is_ended() {
                    candidates.push((Arc::clone(existing), key, false));
                    continue;
                }
                if existing.take_crash() {
                    let failures = restarts.record_failure(&key);
                    warn_if_exhausted(&key, &definition.restart, failures);
                }
            }
            if let Err(e) = restarts.check(&key, &definition.restart) {
                tracing::debug!("Not starting {} for {}: {e}", key.definition_id, key.root.display());
                continue;
            }
            let session = LanguageServerSession::new(
                definition,
                key.root.clone(),
                restarts.failures(&key),
                Arc::clone(&self.lifecycle),
            );
            sessions.insert(key.clone(), Arc::clone(&session));
            candidates.push((session, key, true));
        }
        candidates
    }

    fn record_start(&self, key: &SessionKey, policy: &RestartPolicy, running: bool) {
        if running {
            return;
        }
        let failures = self.restarts.lock().expect("restarts mutex poisoned").record_failure(key);
        warn_if_exhausted(key, policy, failures);
    }

    /// Send `didClose` for `document` to every session that has it open.
    pub async fn disconnect(&self, document: &Document) -> usize {
        let sessions = self.live_sessions(|_| true);
        let mut closed = 0;
        for session in sessions {
            match session.close_document(document).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => tracing::debug!("didClose on {} failed: {e}", session.definition().id),
            }
        }
        closed
    }

    /// Stop running sessions that were not used within `timeout`.
    ///
    /// Returns the number of sessions stopped.
    pub async fn stop_idle(&self, timeout: Duration) -> usize {
        let idle = self.live_sessions(|s| s.state() == SessionState::Running && s.idle_for() >= timeout);
        self.stop_sessions(idle).await
    }

    /// Stop every session of `root`, e.g. when its project is closed.
    pub async fn shutdown_root(&self, root: &Path) -> usize {
        let sessions = self.live_sessions(|s| s.root() == root);
        self.stop_sessions(sessions).await
    }

    /// Stop everything and dispose the lifecycle manager.
    pub async fn shutdown_all(&self) -> usize {
        let sessions = self.live_sessions(|_| true);
        let stopped = self.stop_sessions(sessions).await;
        self.sessions.lock().expect("sessions mutex poisoned").clear();
        self.lifecycle.dispose();
        stopped
    }

    async fn stop_sessions(&self, sessions: Vec<Arc<LanguageServerSession>>) -> usize {
        let count = sessions.len();
        join_all(sessions.iter().map(|s| s.shutdown())).await;
        self.sessions.lock().expect("sessions mutex poisoned").retain(|_, s| !s.is_ended());
        count
    }

    /// Clear the failure history of a definition for `root`, re-enabling it.
    pub fn reset(&self, definition_id: &str, root: &Path) -> bool {
        self.restarts.lock().expect("restarts mutex poisoned").reset(&SessionKey::new(definition_id, root))
    }

    pub fn failures(&self, definition_id: &str, root: &Path) -> u32 {
        self.restarts.lock().expect("restarts mutex poisoned").failures(&SessionKey::new(definition_id, root))
    }

    pub fn session(&self, definition_id: &str, root: &Path) -> Option<Arc<LanguageServerSession>> {
        let sessions = self.sessions.lock().expect("sessions mutex poisoned");
        sessions.get(&SessionKey::new(definition_id, root)).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock().expect("sessions mutex poisoned");
        let mut snapshots: Vec<_> = sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Number of sessions that have not ended.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("sessions mutex poisoned").values().filter(|s| !s.is_ended()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_sessions<F>(&self, filter: F) -> Vec<Arc<LanguageServerSession>>
    where
        F: Fn(&LanguageServerSession) -> bool,
    {
        let sessions = self.sessions.lock().expect("sessions mutex poisoned");
        sessions
            .values()
            .filter(|s| {
                let session: &LanguageServerSession = s;
                !session.is_ended() && filter(session)
            })
            .cloned()
            .collect()
    }
}

fn warn_if_exhausted(key: &SessionKey, policy: &RestartPolicy, failures: u32) {
    if policy.is_exhausted(failures) {
        tracing::warn!(
            "{} failed {failures} times for {}; disabled until reset",
            key.definition_id,
            key.root.display()
        );
    }
}

fn resolve_root(definition: &ServerDefinition, document: &Document) -> PathBuf {
    if definition.root_markers.is_empty() {
        return document.root.clone();
    }
    let start = document.path.parent().unwrap_or(&document.root);
    WorkspaceDetector::new(definition.root_markers.as_slice())
        .find_workspace_root(start)
        .unwrap_or_else(|| document.root.clone())
}
