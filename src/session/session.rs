//! One logical connection to a language server for one root.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use super::lifecycle::{LifecycleEvent, LifecycleManager};
use super::state::SessionState;
use crate::definition::{Document, ServerDefinition};
use crate::lsp::capabilities::ServerCapabilities;
use crate::lsp::client::{RpcClient, Traffic, TrafficTap};
use crate::lsp::connection::{ConnectionFactory, ConnectionProvider, InputStream};
use crate::utils::error::{HubError, Result};
use crate::workspace::file_uri;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time view of a session, handed to listeners and printed by the CLI.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub definition_id: String,
    pub name: String,
    pub root: PathBuf,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub commands: Vec<String>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ProcessInfo {
    pid: Option<u32>,
    commands: Vec<String>,
}

/// A language server session for one (definition, root) pair.
///
/// State transitions run under `transition`, which also owns the connection
/// provider, so a start, a shutdown and a crash never interleave. Requests
/// only take a clone of the client and never wait on that lock.
pub struct LanguageServerSession {
    id: SessionId,
    definition: Arc<ServerDefinition>,
    root: PathBuf,
    state: watch::Sender<SessionState>,
    transition: tokio::sync::Mutex<Option<Box<dyn ConnectionProvider>>>,
    client: RwLock<Option<Arc<RpcClient>>>,
    capabilities: OnceLock<ServerCapabilities>,
    process: OnceLock<ProcessInfo>,
    documents: Mutex<HashSet<String>>,
    last_access: Mutex<Instant>,
    last_error: Mutex<Option<String>>,
    restart_count: u32,
    /// Set once the session reached a terminal state after leaving `Stopped`.
    ended: AtomicBool,
    /// Set when a running connection dropped; the registry counts it once.
    crashed: AtomicBool,
    lifecycle: Arc<LifecycleManager>,
}

impl LanguageServerSession {
    pub fn new(
        definition: Arc<ServerDefinition>,
        root: impl Into<PathBuf>,
        restart_count: u32,
        lifecycle: Arc<LifecycleManager>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Stopped);
        Arc::new(Self {
            id: SessionId::next(),
            definition,
            root: root.into(),
            state,
            transition: tokio::sync::Mutex::new(None),
            client: RwLock::new(None),
            capabilities: OnceLock::new(),
            process: OnceLock::new(),
            documents: Mutex::new(HashSet::new()),
            last_access: Mutex::new(Instant::now()),
            last_error: Mutex::new(None),
            restart_count,
            ended: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            lifecycle,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// `None` until the handshake completed.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.get()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error mutex poisoned").clone()
    }

    /// A session that ended is never restarted; the registry replaces it.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Whether the session failed after reaching `Running`. True at most once.
    pub(crate) fn take_crash(&self) -> bool {
        self.crashed.swap(false, Ordering::AcqRel)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().expect("last_access mutex poisoned").elapsed()
    }

    pub fn touch(&self) {
        *self.last_access.lock().expect("last_access mutex poisoned") = Instant::now();
    }

    pub fn open_documents(&self) -> usize {
        self.documents.lock().expect("documents mutex poisoned").len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let process = self.process.get().cloned().unwrap_or_default();
        SessionSnapshot {
            id: self.id,
            definition_id: self.definition.id.clone(),
            name: self.definition.display_name().to_string(),
            root: self.root.clone(),
            state: self.state(),
            pid: process.pid,
            commands: process.commands,
            restart_count: self.restart_count,
            last_error: self.last_error(),
        }
    }

    /// Drive `Stopped → Starting → Initializing → Running`.
    ///
    /// Returns immediately when the session already left `Stopped`; callers
    /// racing a start wait for it and then read [`state`](Self::state).
    pub async fn start(self: &Arc<Self>, factory: &dyn ConnectionFactory) -> Result<()> {
        let mut slot = self.transition.lock().await;
        if self.state() != SessionState::Stopped || self.is_ended() {
            return Ok(());
        }

        self.transition_to(SessionState::Starting, None);
        match self.launch(&mut slot, factory).await {
            Ok(()) => {
                self.transition_to(SessionState::Running, None);
                Ok(())
            }
            Err(e) => {
                self.teardown(&mut slot).await;
                self.transition_to(SessionState::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        slot: &mut Option<Box<dyn ConnectionProvider>>,
        factory: &dyn ConnectionFactory,
    ) -> Result<()> {
        let provider = slot.insert(factory.create(&self.definition, &self.root)?);
        provider.start().await?;
        provider.ensure_alive()?;
        let _ = self.process.set(ProcessInfo { pid: provider.pid(), commands: provider.commands().to_vec() });

        let (Some(input), Some(output)) = (provider.take_input(), provider.take_output()) else {
            return Err(HubError::process_start(format!("{} exposes no streams", self.definition.id)));
        };
        if let Some(stderr) = provider.take_error() {
            spawn_stderr_drain(self.definition.id.clone(), stderr);
        }

        let root_uri = file_uri(&self.root);
        let params = self.initialize_params(provider.as_ref(), &root_uri);
        let client = Arc::new(RpcClient::start(&self.definition.id, input, output, self.traffic_tap()));
        *self.client.write().expect("client lock poisoned") = Some(Arc::clone(&client));

        self.transition_to(SessionState::Initializing, None);
        let result = self.handshake(&client, params).await?;
        let _ = self.capabilities.set(ServerCapabilities::from_initialize_result(&result));
        client
            .notify("initialized", Some(json!({})))
            .await
            .map_err(|e| self.handshake_error(e.to_string()))?;

        self.spawn_monitor(&client);
        tracing::info!(
            "Started {} for {} (pid: {:?})",
            self.definition.id,
            self.root.display(),
            self.process.get().and_then(|p| p.pid)
        );
        Ok(())
    }

    async fn handshake(&self, client: &RpcClient, params: Value) -> Result<Value> {
        let timeout = self.definition.handshake_timeout();
        let result = match tokio::time::timeout(timeout, client.request("initialize", Some(params))).await {
            Err(_) => return Err(self.handshake_error(format!("no response within {}ms", timeout.as_millis()))),
            Ok(Err(e)) => return Err(self.handshake_error(e.to_string())),
            Ok(Ok(result)) => result,
        };
        match result {
            Some(result) if result.is_object() => Ok(result),
            other => Err(self.handshake_error(format!("malformed initialize result: {other:?}"))),
        }
    }

    fn handshake_error(&self, reason: String) -> HubError {
        HubError::Handshake { server: self.definition.id.clone(), reason }
    }

    fn initialize_params(&self, provider: &dyn ConnectionProvider, root_uri: &str) -> Value {
        let folder_name = self.root.file_name().map_or_else(
            || self.root.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        let initialization_options = provider
            .initialization_options(root_uri)
            .or_else(|| self.definition.initialization_options.clone());

        json!({
            "processId": std::process::id(),
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "rootUri": root_uri,
            "rootPath": self.root.display().to_string(),
            "workspaceFolders": [{ "uri": root_uri, "name": folder_name }],
            "capabilities": client_capabilities(),
            "initializationOptions": initialization_options,
            "trace": provider.trace(root_uri).as_str(),
        })
    }

    fn traffic_tap(self: &Arc<Self>) -> Option<TrafficTap> {
        let session = Arc::downgrade(self);
        Some(Arc::new(move |direction, content: &str| {
            let Some(session) = session.upgrade() else {
                return;
            };
            if !session.lifecycle.has_listeners() {
                return;
            }
            let message = content.to_string();
            let event = match direction {
                Traffic::Sent => LifecycleEvent::MessageSent { message },
                Traffic::Received => LifecycleEvent::MessageReceived { message },
            };
            session.lifecycle.publish(&session.snapshot(), &event);
        }))
    }

    /// Marks the session failed when a running connection goes away on its own.
    fn spawn_monitor(self: &Arc<Self>, client: &Arc<RpcClient>) {
        let session = Arc::downgrade(self);
        let client = Arc::clone(client);
        tokio::spawn(async move {
            client.closed().await;
            if let Some(session) = session.upgrade() {
                session.connection_lost().await;
            }
        });
    }

    async fn connection_lost(&self) {
        let mut slot = self.transition.lock().await;
        if self.state() != SessionState::Running {
            return;
        }
        tracing::warn!("Connection to {} for {} lost", self.definition.id, self.root.display());
        self.teardown(&mut slot).await;
        self.crashed.store(true, Ordering::Release);
        let error = HubError::unavailable(&self.definition.id).to_string();
        self.transition_to(SessionState::Failed, Some(error));
    }

    /// Drive `Running → Stopping → Stopped`: `shutdown`, `exit`, then stop the provider.
    ///
    /// Protocol errors on the way are reported with the `stopped` event and do
    /// not keep the session from reaching `Stopped`.
    pub async fn shutdown(&self) {
        let mut slot = self.transition.lock().await;
        match self.state() {
            SessionState::Running => {}
            SessionState::Stopped if !self.is_ended() => {
                // Never started; nothing to tear down but it must not start later.
                self.ended.store(true, Ordering::Release);
                return;
            }
            _ => return,
        }

        self.transition_to(SessionState::Stopping, None);
        let mut error = None;
        if let Some(client) = self.take_client() {
            let timeout = self.definition.shutdown_timeout();
            match tokio::time::timeout(timeout, client.request("shutdown", None)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error = Some(e.to_string()),
                Err(_) => error = Some(format!("shutdown not acknowledged within {}ms", timeout.as_millis())),
            }
            if let Err(e) = client.notify("exit", None).await {
                tracing::debug!("Failed to send exit to {}: {e}", self.definition.id);
            }
            client.close();
        }
        if let Some(mut provider) = slot.take() {
            provider.stop().await;
        }
        self.documents.lock().expect("documents mutex poisoned").clear();

        tracing::info!("Stopped {} for {}", self.definition.id, self.root.display());
        self.transition_to(SessionState::Stopped, error);
    }

    async fn teardown(&self, slot: &mut Option<Box<dyn ConnectionProvider>>) {
        if let Some(client) = self.take_client() {
            client.close();
        }
        if let Some(mut provider) = slot.take() {
            provider.stop().await;
        }
        self.documents.lock().expect("documents mutex poisoned").clear();
    }

    fn take_client(&self) -> Option<Arc<RpcClient>> {
        self.client.write().expect("client lock poisoned").take()
    }

    fn client(&self) -> Result<Arc<RpcClient>> {
        if self.state() != SessionState::Running {
            return Err(HubError::unavailable(&self.definition.id));
        }
        self.client
            .read()
            .expect("client lock poisoned")
            .clone()
            .ok_or_else(|| HubError::unavailable(&self.definition.id))
    }

    /// Publish the transition before returning so observers never miss a state.
    fn transition_to(&self, next: SessionState, error: Option<String>) {
        let previous = self.state();
        if !previous.can_transition_to(next) {
            tracing::warn!("{} {}: ignoring transition {previous} -> {next}", self.definition.id, self.id);
            return;
        }
        if let Some(error) = &error {
            *self.last_error.lock().expect("last_error mutex poisoned") = Some(error.clone());
        }
        if next == SessionState::Failed || (next == SessionState::Stopped && previous == SessionState::Stopping) {
            self.ended.store(true, Ordering::Release);
        }
        self.state.send_replace(next);
        tracing::debug!("{} {}: {previous} -> {next}", self.definition.id, self.id);

        let snapshot = self.snapshot();
        for event in LifecycleEvent::for_transition(previous, next, error) {
            self.lifecycle.publish(&snapshot, &event);
        }
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Option<Value>> {
        self.touch();
        let client = self.client()?;
        client.request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let client = self.client()?;
        client.notify(method, params).await
    }

    /// Send `didOpen` unless this document is already open on the session.
    pub async fn open_document(&self, document: &Document) -> Result<bool> {
        let uri = document.uri();
        if !self.documents.lock().expect("documents mutex poisoned").insert(uri.clone()) {
            return Ok(false);
        }
        let params = json!({
            "textDocument": {
                "uri": uri,
                "languageId": document.language_id,
                "version": 0,
                "text": document.load_text().await,
            }
        });
        if let Err(e) = self.notify("textDocument/didOpen", Some(params)).await {
            self.documents.lock().expect("documents mutex poisoned").remove(&uri);
            return Err(e);
        }
        Ok(true)
    }

    /// Send `didClose` if the document is open on this session.
    pub async fn close_document(&self, document: &Document) -> Result<bool> {
        let uri = document.uri();
        if !self.documents.lock().expect("documents mutex poisoned").remove(&uri) {
            return Ok(false);
        }
        self.notify("textDocument/didClose", Some(json!({ "textDocument": { "uri": uri } })))
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for LanguageServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageServerSession")
            .field("id", &self.id)
            .field("definition", &self.definition.id)
            .field("root", &self.root)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn spawn_stderr_drain(server: String, stderr: InputStream) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(server = %server, "{line}");
        }
    });
}

/// What the hub tells servers it can handle.
fn client_capabilities() -> Value {
    json!({
        "workspace": {
            "configuration": true,
            "workspaceFolders": true,
            "didChangeConfiguration": { "dynamicRegistration": true },
        },
        "textDocument": {
            "synchronization": { "didSave": true, "dynamicRegistration": true },
            "completion": { "completionItem": { "snippetSupport": true, "resolveSupport": { "properties": ["documentation", "detail"] } } },
            "hover": { "contentFormat": ["markdown", "plaintext"] },
            "definition": { "linkSupport": true },
            "references": {},
            "documentHighlight": {},
            "documentLink": {},
            "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
            "codeAction": {},
            "codeLens": {},
            "formatting": {},
            "inlayHint": {},
        },
        "window": { "workDoneProgress": true, "showMessage": {} },
    })
}
