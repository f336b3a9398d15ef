use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::args::{Cli, Commands};
use cli::output::OutputFormatter;
use commands::{JavaCommandArgs, RequestArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let formatter = OutputFormatter::new(cli.format);

    if let Commands::JavaCommand { java, jar, classpath, debug_port, debug_suspend, args } = cli.command {
        commands::handle_java_command(
            JavaCommandArgs { java, jar, classpath, debug_port, debug_suspend, args },
            &formatter,
        );
        return Ok(());
    }

    let workspace_root = match cli.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir().context("Cannot determine the current directory")?,
    };
    let workspace_root = workspace_root
        .canonicalize()
        .with_context(|| format!("Workspace {} does not exist", workspace_root.display()))?;
    let config = commands::load_config(cli.config.as_deref(), &workspace_root)?;

    match cli.command {
        Commands::Servers => commands::handle_servers_command(&config, &formatter),
        Commands::Request { file, method, params, language, trace } => {
            let args = RequestArgs {
                file,
                method,
                params,
                language,
                trace,
                timeout: cli.timeout.map(Duration::from_millis),
            };
            commands::handle_request_command(&workspace_root, &config, args, cli.format, &formatter).await?;
        }
        Commands::JavaCommand { .. } => {}
    }

    Ok(())
}

/// `--verbose` wins over `LSP_HUB_LOG`; logs go to stderr so stdout stays parseable.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("lsp_hub=debug,lsph=debug")
    } else {
        EnvFilter::try_from_env("LSP_HUB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
