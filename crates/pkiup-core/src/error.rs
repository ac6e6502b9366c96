use std::fmt::Display;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Version;

/// Failures surfaced by the upgrade engine to its caller.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// A catalog version directory or its manifest is malformed.
    #[error("catalog corruption at {}: {reason}", path.display())]
    CatalogCorruption { path: PathBuf, reason: String },

    /// A step names a scriptlet that cannot be resolved.
    #[error("failed to load scriptlet '{name}' for version {version} step {index}: {reason}")]
    PluginLoad {
        version: Version,
        index: u32,
        name: String,
        reason: String,
    },

    /// A scriptlet-level filesystem mutation failed.
    #[error("filesystem error at {}: {reason}", path.display())]
    Filesystem { path: PathBuf, reason: String },

    /// Restoring backups failed; the instance is marked for manual repair.
    #[error("rollback of version {version} failed for instance '{instance_id}': {reason}")]
    Rollback {
        instance_id: String,
        version: Version,
        reason: String,
    },

    /// The persisted upgrade state could not be read or written.
    #[error("upgrade state error at {}: {reason}", path.display())]
    StateIo { path: PathBuf, reason: String },

    #[error("instance '{instance_id}' is being upgraded by process {pid}")]
    Locked { instance_id: String, pid: u32 },

    #[error("instance '{instance_id}' needs manual repair: {reason}")]
    NeedsRepair { instance_id: String, reason: String },

    #[error("invalid upgrade configuration: {0}")]
    Config(String),
}

impl UpgradeError {
    pub fn catalog(path: &Path, reason: impl Display) -> Self {
        Self::CatalogCorruption {
            path: path.to_path_buf(),
            reason: format!("{reason:#}"),
        }
    }

    pub fn filesystem(path: &Path, reason: impl Display) -> Self {
        Self::Filesystem {
            path: path.to_path_buf(),
            reason: format!("{reason:#}"),
        }
    }

    pub fn state_io(path: &Path, reason: impl Display) -> Self {
        Self::StateIo {
            path: path.to_path_buf(),
            reason: format!("{reason:#}"),
        }
    }

    /// Errors that leave the instance untouched and are safe to retry by
    /// re-running the upgrade.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rollback { .. } | Self::NeedsRepair { .. })
    }
}
