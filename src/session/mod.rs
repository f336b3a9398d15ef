//! Session management: lifecycle state machine, registry, cancellation
//! scopes, lifecycle events and request fanout.

pub mod cancellation;
pub mod fanout;
pub mod lifecycle;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;
pub mod state;

pub use cancellation::{CancellationSupport, InFlightOperation, OperationId, OperationState, OperationStats};
pub use fanout::{Contribution, FanoutResult, RequestFanout};
pub use lifecycle::{ChannelListener, LifecycleEvent, LifecycleListener, LifecycleManager, ListenerId, TracingListener};
pub use registry::{RestartTracker, SessionKey, SessionRegistry};
pub use session::{LanguageServerSession, SessionId, SessionSnapshot};
pub use state::SessionState;
