//! Error types for llama-bridge

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// A launch artifact is missing or unusable. Fatal at startup.
    #[error("Configuration error: {reason}: {}", path.display())]
    Configuration { path: PathBuf, reason: String },

    /// The backing process closed its output or exited and cannot serve turns.
    #[error("Backing process terminated: {0}")]
    ProcessTerminated(String),

    #[error("Failed to spawn backing process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    ConfigParse(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn configuration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Path named by a [`Error::Configuration`], if that is what this is.
    pub fn config_path(&self) -> Option<&std::path::Path> {
        match self {
            Error::Configuration { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;
