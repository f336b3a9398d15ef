use owo_colors::OwoColorize;
use serde_json::Value;
use std::fmt::Write;

use crate::cli::args::OutputFormat;
use lsp_hub::definition::ServerDefinition;
use lsp_hub::session::{FanoutResult, LifecycleEvent, SessionSnapshot, SessionState};

pub struct OutputFormatter {
    format: OutputFormat,
    color: bool,
}

impl OutputFormatter {
    /// Colour is used only when stdout is a terminal that supports it.
    pub fn new(format: OutputFormat) -> Self {
        let color = supports_color::on(supports_color::Stream::Stdout).is_some();
        Self { format, color }
    }

    #[cfg(test)]
    fn plain(format: OutputFormat) -> Self {
        Self { format, color: false }
    }

    pub fn format_servers(&self, servers: &[ServerDefinition]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&servers),
            OutputFormat::Human => {
                if servers.is_empty() {
                    return "No language servers configured".to_string();
                }
                let mut output = format!("{} language server(s)\n\n", servers.len());
                for server in servers {
                    let _ = writeln!(output, "{} ({})", self.bold(server.display_name()), server.id);
                    if !server.description.is_empty() {
                        let _ = writeln!(output, "   {}", server.description);
                    }
                    let _ = writeln!(output, "   command: {}", server.launch_command().join(" "));
                    let selector = serde_json::to_string(&server.selector).unwrap_or_default();
                    let _ = writeln!(output, "   selector: {selector}");
                    output.push('\n');
                }
                output
            }
        }
    }

    pub fn format_command(&self, commands: &[String]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&commands),
            OutputFormat::Human => commands.join("\n"),
        }
    }

    pub fn format_fanout(&self, result: &FanoutResult<Value>, query_info: &str) -> String {
        if self.format == OutputFormat::Json {
            return to_json(result);
        }
        if result.is_empty() {
            return format!("No contributions for: {query_info}");
        }

        let mut output = format!(
            "{} contribution(s) from {} matching server(s) for: {query_info}\n",
            result.contributions.len(),
            result.matched
        );
        if result.failed > 0 || result.timed_out > 0 {
            let _ = writeln!(output, "({} failed, {} timed out)", result.failed, result.timed_out);
        }
        output.push('\n');

        for contribution in &result.contributions {
            let session = &contribution.session;
            let _ = writeln!(output, "{} {}", self.bold(&session.name), self.paint_state(session.state));
            let body = serde_json::to_string_pretty(&contribution.value).unwrap_or_default();
            for line in body.lines() {
                let _ = writeln!(output, "   {line}");
            }
            output.push('\n');
        }
        output
    }

    /// One line per lifecycle event, for `--trace`.
    pub fn format_event(&self, session: &SessionSnapshot, event: &LifecycleEvent) -> String {
        if self.format == OutputFormat::Json {
            let value = serde_json::json!({ "session": session.id, "server": session.definition_id, "event": event });
            return value.to_string();
        }
        let label = format!("[{} {}]", session.definition_id, session.id);
        match event {
            LifecycleEvent::MessageSent { message } => format!("{} >> {message}", self.dim(&label)),
            LifecycleEvent::MessageReceived { message } => format!("{} << {message}", self.dim(&label)),
            LifecycleEvent::Initialized { error: Some(error) } | LifecycleEvent::Stopped { error: Some(error) } => {
                format!("{label} {} ({error})", self.paint_state(session.state))
            }
            _ => format!("{label} {}", event.name()),
        }
    }

    fn paint_state(&self, state: SessionState) -> String {
        if !self.color {
            return state.to_string();
        }
        match state {
            SessionState::Running => state.green().to_string(),
            SessionState::Failed => state.red().bold().to_string(),
            SessionState::Starting | SessionState::Initializing | SessionState::Stopping => state.yellow().to_string(),
            SessionState::Stopped => state.dimmed().to_string(),
        }
    }

    fn bold(&self, text: &str) -> String {
        if self.color {
            text.bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn dim(&self, text: &str) -> String {
        if self.color {
            text.dimmed().to_string()
        } else {
            text.to_string()
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}
