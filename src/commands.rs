use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::args::OutputFormat;
use crate::cli::output::OutputFormatter;
use lsp_hub::config::HubConfig;
use lsp_hub::definition::{Document, JavaLaunch};
use lsp_hub::session::{
    CancellationSupport, ChannelListener, LifecycleManager, RequestFanout, SessionRegistry, TracingListener,
};

/// Load the discovered configuration, or an empty one when there is none.
pub fn load_config(explicit: Option<&Path>, workspace_root: &Path) -> Result<HubConfig> {
    let Some(path) = HubConfig::discover(explicit, workspace_root) else {
        tracing::debug!("No configuration found above {}", workspace_root.display());
        return Ok(HubConfig::default());
    };
    tracing::debug!("Using configuration {}", path.display());
    HubConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

pub fn handle_servers_command(config: &HubConfig, formatter: &OutputFormatter) {
    println!("{}", formatter.format_servers(&config.servers));
}

pub struct JavaCommandArgs {
    pub java: String,
    pub jar: Option<String>,
    pub classpath: Option<String>,
    pub debug_port: Option<u16>,
    pub debug_suspend: bool,
    pub args: Vec<String>,
}

impl From<JavaCommandArgs> for JavaLaunch {
    fn from(args: JavaCommandArgs) -> Self {
        Self {
            runtime: args.java,
            jar: args.jar,
            classpath: args.classpath,
            debug_port: args.debug_port,
            debug_suspend: args.debug_suspend,
            args: args.args,
        }
    }
}

pub fn handle_java_command(args: JavaCommandArgs, formatter: &OutputFormatter) {
    let commands = JavaLaunch::from(args).command();
    println!("{}", formatter.format_command(&commands));
}

pub struct RequestArgs {
    pub file: PathBuf,
    pub method: String,
    pub params: Option<String>,
    pub language: Option<String>,
    pub trace: bool,
    pub timeout: Option<Duration>,
}

pub async fn handle_request_command(
    workspace_root: &Path,
    config: &HubConfig,
    args: RequestArgs,
    format: OutputFormat,
    formatter: &OutputFormatter,
) -> Result<()> {
    let lifecycle = Arc::new(LifecycleManager::new());
    lifecycle.subscribe(Arc::new(TracingListener));
    let trace_task = args.trace.then(|| {
        let (listener, mut events) = ChannelListener::new();
        lifecycle.subscribe(Arc::new(listener));
        tokio::spawn(async move {
            let formatter = OutputFormatter::new(format);
            while let Some((session, event)) = events.recv().await {
                eprintln!("{}", formatter.format_event(&session, &event));
            }
        })
    });

    let registry = Arc::new(SessionRegistry::with_process_factory(Arc::clone(&lifecycle)));
    for server in &config.servers {
        registry.register(server.clone())?;
    }

    let path = if args.file.is_absolute() { args.file.clone() } else { workspace_root.join(&args.file) };
    let mut document = Document::new(path, workspace_root);
    if let Some(language) = args.language {
        document = document.with_language(language);
    }
    let params = request_params(&document, args.params.as_deref())?;
    let timeout = args.timeout.unwrap_or_else(|| config.fanout_timeout());

    let scope = CancellationSupport::new();
    let interrupt = tokio::spawn({
        let scope = scope.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                scope.cancel_all();
            }
        }
    });

    let fanout = RequestFanout::new(Arc::clone(&registry));
    let result = fanout.request(&document, &args.method, params, timeout, &scope).await;

    interrupt.abort();
    registry.shutdown_all().await;
    if let Some(task) = trace_task {
        let _ = task.await;
    }

    let result = result.with_context(|| format!("{} on {} failed", args.method, args.file.display()))?;
    let query_info = format!("{} {}", args.method, args.file.display());
    println!("{}", formatter.format_fanout(&result, &query_info));
    Ok(())
}

/// `{"textDocument": {"uri": ...}}` merged with the user's JSON object.
fn request_params(document: &Document, extra: Option<&str>) -> Result<Value> {
    let mut params = match extra {
        None => json!({}),
        Some(raw) => serde_json::from_str(raw).context("--params is not valid JSON")?,
    };
    let Some(object) = params.as_object_mut() else {
        bail!("--params must be a JSON object");
    };
    object.entry("textDocument").or_insert_with(|| json!({ "uri": document.uri() }));
    Ok(params)
}
