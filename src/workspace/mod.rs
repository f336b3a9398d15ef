pub mod detection;

pub use detection::{find_upwards, WorkspaceDetector};

use std::path::{Path, PathBuf};

/// `file://` URI for a path, absolutised against the current directory.
pub fn file_uri(path: &Path) -> String {
    let absolute = path.canonicalize().unwrap_or_else(|_| absolutize(path));
    format!("file://{}", absolute.display().to_string().replace(' ', "%20"))
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}
