//! Argument vectors for language servers that run on a JVM.

/// Builds `java [-agentlib:jdwp=...] [-cp <path>] [-jar <path>]`.
///
/// The vector is handed unmodified to the process launcher, so callers may
/// append server-specific flags (`-DrunAsync=true`, ...) afterwards.
#[derive(Debug, Clone)]
pub struct JavaProcessCommandBuilder {
    java_path: String,
    debug_port: Option<u16>,
    debug_suspend: bool,
    jar: Option<String>,
    classpath: Option<String>,
}

impl JavaProcessCommandBuilder {
    pub fn new(java_path: impl Into<String>) -> Self {
        Self { java_path: java_path.into(), debug_port: None, debug_suspend: false, jar: None, classpath: None }
    }

    #[must_use]
    pub fn debug_port(mut self, port: Option<u16>) -> Self {
        self.debug_port = port;
        self
    }

    #[must_use]
    pub fn debug_suspend(mut self, suspend: bool) -> Self {
        self.debug_suspend = suspend;
        self
    }

    #[must_use]
    pub fn jar(mut self, jar: impl Into<String>) -> Self {
        self.jar = Some(jar.into());
        self
    }

    #[must_use]
    pub fn classpath(mut self, classpath: impl Into<String>) -> Self {
        self.classpath = Some(classpath.into());
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut commands = vec![self.java_path.clone()];

        if let Some(port) = self.debug_port {
            let suspend = if self.debug_suspend { "y" } else { "n" };
            commands.push(format!(
                "-agentlib:jdwp=transport=dt_socket,server=y,suspend={suspend},address={port}"
            ));
        }
        // The JVM treats everything after `-jar <file>` as program arguments.
        if let Some(classpath) = &self.classpath {
            commands.push("-cp".to_string());
            commands.push(classpath.clone());
        }
        if let Some(jar) = &self.jar {
            commands.push("-jar".to_string());
            commands.push(jar.clone());
        }

        commands
    }
}
