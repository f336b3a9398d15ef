//! How a session obtains the byte streams of a language server.
//!
//! [`ConnectionProvider`] is the transport seam; [`ProcessConnectionProvider`]
//! is the stock implementation that spawns a child process and talks over its
//! stdio.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::definition::ServerDefinition;
use crate::utils::error::{HubError, Result};

/// Bytes coming from the server (its stdout or stderr).
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;
/// Bytes going to the server (its stdin).
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Trace level requested in the `initialize` handshake.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl TraceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Messages => "messages",
            Self::Verbose => "verbose",
        }
    }
}

/// Where the server's stderr goes. Only `Pipe` exposes an error stream.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    #[default]
    Pipe,
    Inherit,
    Null,
}

impl StderrMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Pipe => Stdio::piped(),
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
        }
    }
}

#[async_trait]
pub trait ConnectionProvider: Send + fmt::Debug {
    /// Establish the transport. Fails with `ProcessStart` when nothing usable came up.
    async fn start(&mut self) -> Result<()>;

    /// Server → client bytes. `None` before `start`, after `stop`, or once taken.
    fn take_input(&mut self) -> Option<InputStream>;

    /// Client → server bytes. `None` before `start`, after `stop`, or once taken.
    fn take_output(&mut self) -> Option<OutputStream>;

    /// Diagnostic stream, when it is distinct from the protocol stream.
    fn take_error(&mut self) -> Option<InputStream> {
        None
    }

    fn is_alive(&mut self) -> bool;

    fn ensure_alive(&mut self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(HubError::process_start(format!("{self:?} is not alive")))
        }
    }

    /// Idempotent; never fails.
    async fn stop(&mut self);

    fn initialization_options(&self, _root_uri: &str) -> Option<Value> {
        None
    }

    fn trace(&self, _root_uri: &str) -> TraceLevel {
        TraceLevel::Off
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn commands(&self) -> &[String] {
        &[]
    }
}

/// Creates one provider per session. Registries are handed a factory so the
/// transport can be swapped without touching session logic.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, definition: &ServerDefinition, root: &Path) -> Result<Box<dyn ConnectionProvider>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessConnectionFactory;

impl ConnectionFactory for ProcessConnectionFactory {
    fn create(&self, definition: &ServerDefinition, root: &Path) -> Result<Box<dyn ConnectionProvider>> {
        Ok(Box::new(ProcessConnectionProvider::from_definition(definition, root)))
    }
}

#[derive(Debug)]
pub struct ProcessConnectionProvider {
    commands: Vec<String>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    stderr_mode: StderrMode,
    startup_grace: Duration,
    stop_grace: Duration,
    initialization_options: Option<Value>,
    trace: TraceLevel,
    process: Option<Child>,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ProcessConnectionProvider {
    pub fn new(commands: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            working_dir: working_dir.into(),
            env: HashMap::new(),
            stderr_mode: StderrMode::Pipe,
            startup_grace: Duration::from_millis(100),
            stop_grace: Duration::from_secs(1),
            initialization_options: None,
            trace: TraceLevel::Off,
            process: None,
            pid: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn from_definition(definition: &ServerDefinition, root: &Path) -> Self {
        let mut provider = Self::new(definition.launch_command(), root);
        provider.env.clone_from(&definition.env);
        provider.stderr_mode = definition.stderr;
        provider.startup_grace = Duration::from_millis(definition.startup_grace_ms);
        provider.initialization_options.clone_from(&definition.initialization_options);
        provider.trace = definition.trace;
        provider
    }

    #[must_use]
    pub fn with_stderr(mut self, mode: StderrMode) -> Self {
        self.stderr_mode = mode;
        self
    }

    /// How long a freshly spawned process must survive to count as started.
    #[must_use]
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn label(&self) -> String {
        self.commands.join(" ")
    }

    fn validate_commands(&self) -> Result<(&String, &[String])> {
        let Some((program, args)) = self.commands.split_first() else {
            return Err(HubError::process_start("empty command line"));
        };
        if let Some(index) = self.commands.iter().position(|token| token.trim().is_empty()) {
            return Err(HubError::process_start(format!(
                "empty token at position {index} in command line '{}'",
                self.label()
            )));
        }
        Ok((program, args))
    }
}

impl PartialEq for ProcessConnectionProvider {
    fn eq(&self, other: &Self) -> bool {
        self.commands == other.commands && self.working_dir == other.working_dir
    }
}

#[async_trait]
impl ConnectionProvider for ProcessConnectionProvider {
    async fn start(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        let (program, args) = self.validate_commands()?;

        tracing::debug!("Starting '{}' in {}", self.label(), self.working_dir.display());

        let mut process = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr_mode.stdio())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HubError::process_start(format!("failed to spawn '{}': {e}", self.label())))?;

        // `Child::wait` closes stdin, so the pipes must be taken first.
        let stdin = process.stdin.take();
        let stdout = process.stdout.take();
        let stderr = process.stderr.take();

        if let Ok(status) = tokio::time::timeout(self.startup_grace, process.wait()).await {
            let detail = status.map_or_else(|e| e.to_string(), |s| s.to_string());
            return Err(HubError::process_start(format!("'{}' exited immediately ({detail})", self.label())));
        }

        self.pid = process.id();
        tracing::debug!("Language server process started (pid: {:?})", self.pid);

        self.stdin = stdin;
        self.stdout = stdout;
        self.stderr = stderr;
        self.process = Some(process);
        Ok(())
    }

    fn take_input(&mut self) -> Option<InputStream> {
        self.stdout.take().map(|s| Box::new(s) as InputStream)
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.stdin.take().map(|s| Box::new(s) as OutputStream)
    }

    fn take_error(&mut self) -> Option<InputStream> {
        self.stderr.take().map(|s| Box::new(s) as InputStream)
    }

    fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| matches!(p.try_wait(), Ok(None)))
    }

    async fn stop(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;

        let Some(mut process) = self.process.take() else {
            return;
        };
        if !matches!(process.try_wait(), Ok(None)) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = process.id() {
            terminate(pid);
        }
        if tokio::time::timeout(self.stop_grace, process.wait()).await.is_err() {
            tracing::debug!("'{}' ignored SIGTERM, killing it", self.label());
            if let Err(e) = process.kill().await {
                tracing::warn!("Failed to kill '{}': {e}", self.label());
            }
        }
    }

    fn initialization_options(&self, _root_uri: &str) -> Option<Value> {
        self.initialization_options.clone()
    }

    fn trace(&self, _root_uri: &str) -> TraceLevel {
        self.trace
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn commands(&self) -> &[String] {
        &self.commands
    }
}

/// Ask the process to exit on its own before it gets killed.
#[cfg(unix)]
fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    #[allow(unsafe_code)]
    // SAFETY: kill(2) only takes integers; `pid` belongs to a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!("SIGTERM to pid {pid} failed: {}", std::io::Error::last_os_error());
    }
}
