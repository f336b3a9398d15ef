//! Server definitions and the documents they are matched against.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lsp::command::JavaProcessCommandBuilder;
use crate::lsp::connection::{StderrMode, TraceLevel};
use crate::utils::error::{HubError, Result};
use crate::workspace::file_uri;

/// Immutable description of one language server.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Literal argv. Takes precedence over `java`.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub java: Option<JavaLaunch>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub selector: DocumentSelector,
    /// Files or directories marking the server's root. Empty means the document's root.
    #[serde(default)]
    pub root_markers: Vec<String>,
    #[serde(default)]
    pub initialization_options: Option<Value>,
    #[serde(default)]
    pub trace: TraceLevel,
    #[serde(default)]
    pub stderr: StderrMode,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub restart: RestartPolicy,
}

const fn default_startup_grace_ms() -> u64 {
    100
}

const fn default_handshake_timeout_ms() -> u64 {
    10_000
}

const fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl ServerDefinition {
    pub fn new(id: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            command,
            java: None,
            env: HashMap::new(),
            selector: DocumentSelector::default(),
            root_markers: Vec::new(),
            initialization_options: None,
            trace: TraceLevel::Off,
            stderr: StderrMode::Pipe,
            startup_grace_ms: default_startup_grace_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            restart: RestartPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: DocumentSelector) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// The argv handed to the process launcher.
    pub fn launch_command(&self) -> Vec<String> {
        if !self.command.is_empty() {
            return self.command.clone();
        }
        self.java.as_ref().map(JavaLaunch::command).unwrap_or_default()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HubError::Config("server definition with an empty id".to_string()));
        }
        if self.launch_command().is_empty() {
            return Err(HubError::Config(format!("server '{}' has no command", self.id)));
        }
        if self.selector.is_empty() {
            return Err(HubError::Config(format!("server '{}' has an empty selector", self.id)));
        }
        Ok(())
    }
}

/// A JVM launch recipe, expanded with [`JavaProcessCommandBuilder`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JavaLaunch {
    #[serde(default = "default_java_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub jar: Option<String>,
    #[serde(default)]
    pub classpath: Option<String>,
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub debug_suspend: bool,
    /// Appended after the builder's output, e.g. `-DrunAsync=true`.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_java_runtime() -> String {
    "java".to_string()
}

impl JavaLaunch {
    pub fn command(&self) -> Vec<String> {
        let mut builder = JavaProcessCommandBuilder::new(&self.runtime)
            .debug_port(self.debug_port)
            .debug_suspend(self.debug_suspend);
        if let Some(jar) = &self.jar {
            builder = builder.jar(jar);
        }
        if let Some(classpath) = &self.classpath {
            builder = builder.classpath(classpath);
        }
        let mut commands = builder.build();
        commands.extend(self.args.iter().cloned());
        commands
    }
}

/// Failed starts and crashes tolerated per (definition, root).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `0` never disables the server.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RestartPolicy {
    /// Delay before another start after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts != 0 && failures >= self.max_attempts
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct SelectorConfig {
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

/// Which documents a server is eligible for: a language id or a path glob.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(try_from = "SelectorConfig", into = "SelectorConfig")]
pub struct DocumentSelector {
    languages: Vec<String>,
    patterns: Vec<String>,
    globs: GlobSet,
}

impl DocumentSelector {
    pub fn new(languages: Vec<String>, patterns: Vec<String>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| HubError::Config(format!("invalid pattern '{pattern}': {e}")))?;
            builder.add(glob);
        }
        let globs = builder.build().map_err(|e| HubError::Config(e.to_string()))?;
        Ok(Self { languages, patterns, globs })
    }

    pub fn languages(languages: &[&str]) -> Self {
        Self { languages: languages.iter().map(ToString::to_string).collect(), ..Self::default() }
    }

    pub fn patterns(patterns: &[&str]) -> Result<Self> {
        Self::new(Vec::new(), patterns.iter().map(ToString::to_string).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.patterns.is_empty()
    }

    /// Patterns are tried against the full path and against the bare file name,
    /// so `*.txt` matches wherever the file lives.
    pub fn matches(&self, document: &Document) -> bool {
        if self.languages.iter().any(|l| l == &document.language_id) {
            return true;
        }
        if self.globs.is_match(&document.path) {
            return true;
        }
        document.path.file_name().is_some_and(|name| self.globs.is_match(name))
    }
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self { languages: Vec::new(), patterns: Vec::new(), globs: GlobSet::empty() }
    }
}

impl TryFrom<SelectorConfig> for DocumentSelector {
    type Error = HubError;

    fn try_from(config: SelectorConfig) -> Result<Self> {
        Self::new(config.languages, config.patterns)
    }
}

impl From<DocumentSelector> for SelectorConfig {
    fn from(selector: DocumentSelector) -> Self {
        Self { languages: selector.languages, patterns: selector.patterns }
    }
}

/// A document a feature request is issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub language_id: String,
    /// Contents sent with `didOpen`; read from disk when absent.
    pub text: Option<String>,
    /// Fallback root for definitions without root markers.
    pub root: PathBuf,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let language_id = guess_language_id(&path).to_string();
        Self { path, language_id, text: None, root: root.into() }
    }

    #[must_use]
    pub fn with_language(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = language_id.into();
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn uri(&self) -> String {
        file_uri(&self.path)
    }

    pub async fn load_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("Opening {} with empty text: {e}", self.path.display());
                String::new()
            }
        }
    }
}

fn guess_language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        "rs" => "rust",
        "py" => "python",
        "java" => "java",
        "js" => "javascript",
        "ts" => "typescript",
        "json" => "json",
        "md" => "markdown",
        "html" => "html",
        "properties" => "properties",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        _ => "plaintext",
    }
}
