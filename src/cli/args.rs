use clap::builder::styling::{AnsiColor, Styles};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().bold())
    .literal(AnsiColor::Cyan.on_default().bold())
    .placeholder(AnsiColor::Cyan.on_default())
    .error(AnsiColor::Red.on_default().bold());

const AFTER_HELP: &str = "\x1b[1;32mQuick Reference:\x1b[0m
  \x1b[1;36mInspect the configuration\x1b[0m (.lsp-hub.json, nearest to the workspace):
    lsph servers                                   List configured language servers

  \x1b[1;36mTalk to servers\x1b[0m:
    lsph request notes.txt -m textDocument/codeLens  Ask every matching server, merge answers
    lsph request App.java -m textDocument/hover -p '{\"position\":{\"line\":3,\"character\":7}}'

  \x1b[1;36mBuild launch commands\x1b[0m:
    lsph java-command --jar server.jar --debug-port 5005 --debug-suspend";

#[derive(Parser)]
#[command(name = "lsph")]
#[command(about = "Start language servers on demand and fan requests out to all of them")]
#[command(version)]
#[command(styles = STYLES)]
#[command(after_help = AFTER_HELP)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Configuration file (default: $LSP_HUB_CONFIG, then the nearest .lsp-hub.json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    pub format: OutputFormat,

    /// Milliseconds to wait for server answers (default: from config, else 2000)
    #[arg(long, value_name = "MILLIS")]
    pub timeout: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the configured language servers and the documents they handle
    Servers,

    /// Print the argument vector for a JVM-hosted language server
    #[command(
        long_about = "Print the argument vector used to launch a JVM-hosted language server, \
        one token per line (or a JSON array with --format json).\n\n\
        Examples:\n  \
        lsph java-command --jar /x.jar --debug-port 5005 --debug-suspend\n  \
        lsph java-command --java /opt/jdk/bin/java --cp 'lib/*' --jar server.jar"
    )]
    JavaCommand {
        /// Path of the java executable
        #[arg(long, default_value = "java")]
        java: String,

        #[arg(long)]
        jar: Option<String>,

        #[arg(long = "cp", value_name = "CLASSPATH")]
        classpath: Option<String>,

        /// Listen for a debugger on this port
        #[arg(long)]
        debug_port: Option<u16>,

        /// Wait for the debugger before starting
        #[arg(long, requires = "debug_port")]
        debug_suspend: bool,

        /// Extra arguments appended after the builder's output
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Send one LSP request to every matching server and merge the answers
    #[command(
        long_about = "Start the servers whose selector matches FILE, send the request to each \
        one that advertises the matching capability, and print every non-empty answer.\n\n\
        Examples:\n  \
        lsph request notes.txt -m textDocument/codeLens\n  \
        lsph request notes.txt -m textDocument/completion -p '{\"position\":{\"line\":0,\"character\":0}}'\n  \
        lsph --format json request notes.txt -m textDocument/documentSymbol --trace"
    )]
    Request {
        file: PathBuf,

        /// LSP method, e.g. textDocument/hover
        #[arg(short, long)]
        method: String,

        /// Extra params merged into {"textDocument":{"uri":...}}
        #[arg(short, long, value_name = "JSON")]
        params: Option<String>,

        /// Language id sent with didOpen (default: guessed from the extension)
        #[arg(long)]
        language: Option<String>,

        /// Print lifecycle events and protocol traffic to stderr
        #[arg(long)]
        trace: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}
