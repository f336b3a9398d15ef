//! Broadcast of session transitions and protocol traffic.
//!
//! Listeners are called synchronously on the publishing task. A listener that
//! returns an error or panics is logged and skipped; the others still get the
//! event and the publisher never sees the failure.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use super::session::SessionSnapshot;
use super::state::SessionState;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Starting,
    /// The process is alive; the handshake is about to be sent.
    Started,
    Initialized { error: Option<String> },
    MessageSent { message: String },
    MessageReceived { message: String },
    Stopping,
    Stopped { error: Option<String> },
}

impl LifecycleEvent {
    /// Events announcing the move from `previous` to `next`.
    pub fn for_transition(previous: SessionState, next: SessionState, error: Option<String>) -> Vec<Self> {
        match next {
            SessionState::Starting => vec![Self::Starting],
            SessionState::Initializing => vec![Self::Started],
            SessionState::Running => vec![Self::Initialized { error: None }],
            SessionState::Stopping => vec![Self::Stopping],
            SessionState::Stopped => vec![Self::Stopped { error }],
            SessionState::Failed if previous == SessionState::Initializing => {
                vec![Self::Initialized { error: error.clone() }, Self::Stopped { error }]
            }
            SessionState::Failed => vec![Self::Stopped { error }],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Initialized { .. } => "initialized",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageReceived { .. } => "message_received",
            Self::Stopping => "stopping",
            Self::Stopped { .. } => "stopped",
        }
    }
}

pub trait LifecycleListener: Send + Sync {
    fn handle_event(&self, session: &SessionSnapshot, event: &LifecycleEvent) -> anyhow::Result<()>;

    /// Called once when the manager is disposed.
    fn dispose(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct LifecycleManager {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn LifecycleListener>)>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listeners subscribed after [`dispose`](Self::dispose) are never called.
    pub fn subscribe(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.is_disposed() {
            tracing::debug!("Ignoring listener subscribed after dispose");
            return id;
        }
        self.listeners.write().expect("listener lock poisoned").push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("listener lock poisoned").len()
    }

    pub fn has_listeners(&self) -> bool {
        !self.is_disposed() && self.listener_count() > 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn publish(&self, session: &SessionSnapshot, event: &LifecycleEvent) {
        if self.is_disposed() {
            return;
        }
        // Listeners run outside the lock so they may (un)subscribe.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .expect("listener lock poisoned")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.handle_event(session, event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(session = %session.id, "Lifecycle listener failed on {}: {e:#}", event.name());
                }
                Err(_) => {
                    tracing::error!(session = %session.id, "Lifecycle listener panicked on {}", event.name());
                }
            }
        }
    }

    /// Drop every listener and turn later `publish` calls into no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = std::mem::take(&mut *self.listeners.write().expect("listener lock poisoned"));
        for (_, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.dispose())).is_err() {
                tracing::error!("Lifecycle listener panicked during dispose");
            }
        }
    }
}

/// Forwards events into an unbounded channel, e.g. for a console view.
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<(SessionSnapshot, LifecycleEvent)>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SessionSnapshot, LifecycleEvent)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl LifecycleListener for ChannelListener {
    fn handle_event(&self, session: &SessionSnapshot, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.sender
            .send((session.clone(), event.clone()))
            .map_err(|_| anyhow::anyhow!("lifecycle channel closed"))
    }
}

/// Mirrors lifecycle events into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl LifecycleListener for TracingListener {
    fn handle_event(&self, session: &SessionSnapshot, event: &LifecycleEvent) -> anyhow::Result<()> {
        let server = session.definition_id.as_str();
        match event {
            LifecycleEvent::MessageSent { message } => {
                tracing::trace!(session = %session.id, server, ">> {message}");
            }
            LifecycleEvent::MessageReceived { message } => {
                tracing::trace!(session = %session.id, server, "<< {message}");
            }
            LifecycleEvent::Initialized { error: Some(error) } | LifecycleEvent::Stopped { error: Some(error) } => {
                tracing::warn!(session = %session.id, server, "{}: {error}", event.name());
            }
            _ => tracing::info!(session = %session.id, server, root = %session.root.display(), "{}", event.name()),
        }
        Ok(())
    }
}
