use serde::Serialize;
use std::fmt;

/// Lifecycle of a [`LanguageServerSession`](super::LanguageServerSession).
///
/// ```text
/// Stopped -> Starting -> Initializing -> Running -> Stopping -> Stopped
///                 \            \             \          \
///                  +------------+-------------+----------+--> Failed
/// ```
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Initializing,
    Running,
    Stopping,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Failed, Initializing, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Initializing)
                | (Initializing, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped | Starting | Initializing | Running | Stopping, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
