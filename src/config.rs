//! Loading server definitions from `.lsp-hub.json`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::definition::ServerDefinition;
use crate::utils::error::{HubError, Result};
use crate::workspace::find_upwards;

pub const CONFIG_FILE_NAME: &str = ".lsp-hub.json";
pub const CONFIG_ENV_VAR: &str = "LSP_HUB_CONFIG";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
    #[serde(default)]
    pub fanout_timeout_ms: Option<u64>,
}

impl HubConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| HubError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HubError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Locate the configuration: explicit path, then `LSP_HUB_CONFIG`, then
    /// the nearest `.lsp-hub.json` at or above `workspace`.
    pub fn discover(explicit: Option<&Path>, workspace: &Path) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(path));
        }
        find_upwards(workspace, CONFIG_FILE_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(HubError::Config(format!("duplicate server id '{}'", server.id)));
            }
        }
        Ok(())
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms.unwrap_or(2_000))
    }
}
