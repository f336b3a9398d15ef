use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Cannot start language server process: {reason}")]
    ProcessStart { reason: String },

    #[error("Initialize handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("Language server '{server}' is unavailable")]
    ServerUnavailable { server: String },

    #[error("Operation cancelled")]
    OperationCancelled,

    #[error("Language server '{server}' answered with error {code}: {message}")]
    Rpc { server: String, code: i64, message: String },

    #[error("Language server '{server}' disabled for {root} after {attempts} failed starts")]
    RestartLimitReached { server: String, root: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    pub fn process_start(reason: impl Into<String>) -> Self {
        Self::ProcessStart { reason: reason.into() }
    }

    pub fn unavailable(server: impl Into<String>) -> Self {
        Self::ServerUnavailable { server: server.into() }
    }

    /// `OperationCancelled` is an early-exit signal, not a failure worth logging.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::OperationCancelled)
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
