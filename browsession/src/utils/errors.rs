//! Error types for the session safekeeper.
//!
//! Everything below the scheduler reports through [`BrowsessionError`]. None of
//! these variants is fatal to the daemon except `Config`, which only surfaces
//! during startup.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowsessionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Source locked by another process: {}", .0.display())]
    SourceLocked(PathBuf),

    #[error("Backup destination unwritable ({}): {source}", path.display())]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot {id} is partial: {missing} main file(s) not captured")]
    PartialSnapshot { id: u64, missing: usize },

    #[error("Failed to prune {}: {source}", path.display())]
    PruneFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup root contention at {}: {reason}", path.display())]
    Contention { path: PathBuf, reason: String },

    #[error("Snapshot cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrowsessionError {
    /// Wraps an I/O failure that happened while writing under the backup root.
    pub fn unwritable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DestinationUnwritable {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrowsessionError>;
