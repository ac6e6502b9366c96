use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pkiup_core::Version;

/// On-disk layout of engine-owned state, one directory per instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeLayout {
    state_root: PathBuf,
}

impl UpgradeLayout {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.state_root.join(instance_id)
    }

    pub fn state_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("state.json")
    }

    pub fn lock_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("upgrade.lock")
    }

    pub fn repair_marker_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("needs-repair")
    }

    pub fn backups_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("backups")
    }

    pub fn backup_scope_dir(&self, instance_id: &str, version: &Version) -> PathBuf {
        self.backups_dir(instance_id).join(version.to_string())
    }

    pub fn backup_journal_path(&self, instance_id: &str, version: &Version) -> PathBuf {
        self.backup_scope_dir(instance_id, version)
            .join("journal.json")
    }

    pub fn ensure_instance_dirs(&self, instance_id: &str) -> Result<()> {
        for dir in [self.instance_dir(instance_id), self.backups_dir(instance_id)] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
