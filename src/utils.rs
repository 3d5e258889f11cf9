//! Utility functions for llama-bridge

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Require that `path` names an existing regular file.
///
/// Symlinks are followed, so a link to a real binary is accepted. The
/// returned error names the offending path and what it was expected to be.
pub fn require_regular_file(path: &Path, what: &str) -> Result<PathBuf> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| Error::configuration(path, format!("{} not found", what)))?;

    if !metadata.is_file() {
        return Err(Error::configuration(
            path,
            format!("{} is not a regular file", what),
        ));
    }

    Ok(path.to_path_buf())
}

/// Expand a leading `~/` against the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
