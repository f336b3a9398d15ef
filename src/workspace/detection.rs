use std::path::{Path, PathBuf};

/// Finds the directory a language server should treat as its root.
#[derive(Debug, Clone)]
pub struct WorkspaceDetector {
    markers: Vec<String>,
}

impl WorkspaceDetector {
    pub fn new<S: AsRef<str>>(markers: &[S]) -> Self {
        Self { markers: markers.iter().map(|m| m.as_ref().to_string()).collect() }
    }

    /// Walk up from `start_path` to the nearest directory containing a marker.
    pub fn find_workspace_root(&self, start_path: &Path) -> Option<PathBuf> {
        if self.markers.is_empty() {
            return None;
        }
        start_path.ancestors().find(|dir| self.has_markers(dir)).map(Path::to_path_buf)
    }

    fn has_markers(&self, path: &Path) -> bool {
        self.markers.iter().any(|marker| path.join(marker).exists())
    }
}

/// Nearest ancestor of `start_path` (inclusive) holding a file called `name`.
pub fn find_upwards(start_path: &Path, name: &str) -> Option<PathBuf> {
    start_path.ancestors().map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}
