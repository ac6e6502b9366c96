use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use pkiup_core::{sha256_file, UpgradeError, Version};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::fs_utils::{
    copy_tree, create_symlink, file_mode, path_exists_no_follow, remove_path_if_exists,
    set_file_mode, write_atomic,
};
use crate::repair::write_repair_marker;
use crate::{InstanceState, UpgradeLayout};

const JOURNAL_FORMAT_VERSION: u32 = 1;

/// What a path looked like before a scriptlet touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupKind {
    File { sha256: String, mode: Option<u32> },
    Symlink { target: PathBuf },
    Directory,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original_path: PathBuf,
    pub saved_path: Option<PathBuf>,
    #[serde(flatten)]
    pub kind: BackupKind,
    /// Step index of the version that recorded the entry.
    pub step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeJournal {
    format: u32,
    version: Version,
    previous_state: InstanceState,
    last_checkpoint: Option<u32>,
    entries: Vec<BackupEntry>,
}

/// Owns the rollback journals of one instance, one scope per catalog version.
#[derive(Debug, Clone)]
pub struct BackupManager {
    layout: UpgradeLayout,
    instance_id: String,
}

impl BackupManager {
    pub fn new(layout: UpgradeLayout, instance_id: impl Into<String>) -> Self {
        Self {
            layout,
            instance_id: instance_id.into(),
        }
    }

    /// Opens the scope for `version`. A journal left behind by an interrupted
    /// run is reopened, and entries of steps that `current` does not record as
    /// committed are restored first.
    pub fn begin_scope(
        &self,
        version: &Version,
        current: &InstanceState,
    ) -> Result<BackupScope, UpgradeError> {
        if let Some(mut scope) = self.open_scope(version)? {
            let keep_through = if &current.current_version == version {
                current.last_completed_step
            } else {
                None
            };
            let restored = scope.rollback_steps_after(keep_through)?;
            info!(
                instance = %self.instance_id,
                %version,
                restored,
                "reopened interrupted backup scope"
            );
            return Ok(scope);
        }

        let dir = self.layout.backup_scope_dir(&self.instance_id, version);
        fs::create_dir_all(dir.join("payload"))
            .map_err(|err| UpgradeError::filesystem(&dir, err))?;
        let scope = BackupScope {
            dir,
            repair_marker_layout: self.layout.clone(),
            instance_id: self.instance_id.clone(),
            current_step: 0,
            journal: ScopeJournal {
                format: JOURNAL_FORMAT_VERSION,
                version: version.clone(),
                previous_state: current.clone(),
                last_checkpoint: None,
                entries: Vec::new(),
            },
        };
        scope.persist()?;
        debug!(instance = %self.instance_id, %version, "opened backup scope");
        Ok(scope)
    }

    pub fn open_scope(&self, version: &Version) -> Result<Option<BackupScope>, UpgradeError> {
        let path = self.layout.backup_journal_path(&self.instance_id, version);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(UpgradeError::filesystem(&path, err)),
        };

        let journal: ScopeJournal = serde_json::from_str(&raw)
            .map_err(|err| UpgradeError::filesystem(&path, format!("corrupt journal: {err}")))?;
        if journal.format != JOURNAL_FORMAT_VERSION {
            return Err(UpgradeError::filesystem(
                &path,
                format!(
                    "unsupported journal format {} (expected {JOURNAL_FORMAT_VERSION})",
                    journal.format
                ),
            ));
        }
        if &journal.version != version {
            return Err(UpgradeError::filesystem(
                &path,
                format!("journal records version {}", journal.version),
            ));
        }

        Ok(Some(BackupScope {
            dir: self.layout.backup_scope_dir(&self.instance_id, version),
            repair_marker_layout: self.layout.clone(),
            instance_id: self.instance_id.clone(),
            current_step: journal.last_checkpoint.map_or(0, |step| step + 1),
            journal,
        }))
    }

    /// Versions that still have a scope on disk, ascending.
    pub fn existing_scopes(&self) -> Result<Vec<Version>, UpgradeError> {
        let dir = self.layout.backups_dir(&self.instance_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(UpgradeError::filesystem(&dir, err)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| UpgradeError::filesystem(&dir, err))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            match Version::parse(name) {
                Ok(version) => versions.push(version),
                Err(_) => warn!(path = %path.display(), "ignoring unknown backup directory"),
            }
        }
        versions.sort();
        Ok(versions)
    }
}

/// Rollback journal for one version. Entries are recorded before mutation and
/// persisted immediately, so a crash never loses a snapshot.
#[derive(Debug)]
pub struct BackupScope {
    dir: PathBuf,
    repair_marker_layout: UpgradeLayout,
    instance_id: String,
    current_step: u32,
    journal: ScopeJournal,
}

impl BackupScope {
    pub fn version(&self) -> &Version {
        &self.journal.version
    }

    /// State record to restore if the whole version is rolled back.
    pub fn previous_state(&self) -> &InstanceState {
        &self.journal.previous_state
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.journal.entries
    }

    pub fn begin_step(&mut self, index: u32) {
        self.current_step = index;
    }

    /// Snapshots `path` for the current step. Repeated calls for the same path
    /// within a step keep the first snapshot.
    pub fn backup(&mut self, path: &Path) -> Result<(), UpgradeError> {
        let step = self.current_step;
        if self
            .journal
            .entries
            .iter()
            .any(|entry| entry.step == step && entry.original_path == path)
        {
            return Ok(());
        }

        let saved_path = self
            .dir
            .join("payload")
            .join(format!("{:04}", self.journal.entries.len()));
        let kind = snapshot(path, &saved_path).map_err(|err| UpgradeError::filesystem(path, err))?;
        let saved_path = match kind {
            BackupKind::File { .. } | BackupKind::Directory => Some(saved_path),
            BackupKind::Symlink { .. } | BackupKind::Absent => None,
        };

        debug!(
            instance = %self.instance_id,
            path = %path.display(),
            step,
            kind = ?kind,
            "recorded backup"
        );
        self.journal.entries.push(BackupEntry {
            original_path: path.to_path_buf(),
            saved_path,
            kind,
            step,
        });
        self.persist()
    }

    /// Durably marks `index` as finished. Must succeed before the state store
    /// is advanced past the step.
    pub fn checkpoint_step(&mut self, index: u32) -> Result<(), UpgradeError> {
        self.journal.last_checkpoint = Some(index);
        self.persist()
    }

    /// Discards all snapshots; the version is done.
    pub fn commit(self) -> Result<(), UpgradeError> {
        remove_path_if_exists(&self.dir).map_err(|err| UpgradeError::filesystem(&self.dir, err))?;
        debug!(
            instance = %self.instance_id,
            version = %self.journal.version,
            "committed backup scope"
        );
        Ok(())
    }

    /// Restores every recorded path, newest entry first. On failure the scope
    /// is kept on disk and the instance is marked for manual repair.
    ///
    /// Once everything is restored the journal is emptied before the scope
    /// directory goes away, so a leftover directory never replays a restore
    /// from half-deleted payloads. Failing to clean up is only logged.
    pub fn rollback(mut self) -> Result<(), UpgradeError> {
        let entries = std::mem::take(&mut self.journal.entries);
        let failures = restore_entries(&entries);
        if !failures.is_empty() {
            self.journal.entries = entries;
            return Err(self.fail_rollback(failures));
        }

        info!(
            instance = %self.instance_id,
            version = %self.journal.version,
            restored = entries.len(),
            "rolled back backup scope"
        );
        self.journal.last_checkpoint = None;
        if let Err(err) = self.persist() {
            warn!(
                instance = %self.instance_id,
                version = %self.journal.version,
                error = %err,
                "backups restored but the journal could not be cleared"
            );
            return Ok(());
        }
        if let Err(err) = remove_path_if_exists(&self.dir) {
            warn!(
                instance = %self.instance_id,
                dir = %self.dir.display(),
                error = %err,
                "failed to remove restored backup scope"
            );
        }
        Ok(())
    }

    /// Restores entries recorded by steps after `keep_through` (all entries
    /// when `None`) and drops them from the journal. Returns how many were
    /// restored.
    pub fn rollback_steps_after(&mut self, keep_through: Option<u32>) -> Result<usize, UpgradeError> {
        let is_kept = |entry: &BackupEntry| keep_through.is_some_and(|kept| entry.step <= kept);
        let (kept, undone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.journal.entries)
            .into_iter()
            .partition(is_kept);

        let failures = restore_entries(&undone);
        if !failures.is_empty() {
            self.journal.entries = kept.into_iter().chain(undone).collect();
            return Err(self.fail_rollback(failures));
        }

        for entry in &undone {
            if let Some(saved_path) = &entry.saved_path {
                if let Err(err) = remove_path_if_exists(saved_path) {
                    warn!(
                        path = %saved_path.display(),
                        error = %err,
                        "failed to remove undone backup payload"
                    );
                }
            }
        }
        self.journal.entries = kept;
        self.journal.last_checkpoint = keep_through;
        self.current_step = keep_through.map_or(0, |step| step + 1);
        self.persist()?;
        Ok(undone.len())
    }

    fn fail_rollback(&self, failures: Vec<String>) -> UpgradeError {
        let reason = failures.join("; ");
        error!(
            instance = %self.instance_id,
            version = %self.journal.version,
            %reason,
            "rollback failed, instance needs manual repair"
        );
        let _ = self.persist();
        let marker = format!(
            "rollback of version {} failed: {reason}\nbackups kept in {}",
            self.journal.version,
            self.dir.display()
        );
        if let Err(err) =
            write_repair_marker(&self.repair_marker_layout, &self.instance_id, &marker)
        {
            error!(instance = %self.instance_id, error = %err, "failed to write repair marker");
        }

        UpgradeError::Rollback {
            instance_id: self.instance_id.clone(),
            version: self.journal.version.clone(),
            reason,
        }
    }

    fn persist(&self) -> Result<(), UpgradeError> {
        let path = self.dir.join("journal.json");
        let payload = serde_json::to_vec_pretty(&self.journal)
            .map_err(|err| UpgradeError::filesystem(&path, err))?;
        write_atomic(&path, &payload).map_err(|err| UpgradeError::filesystem(&path, err))
    }
}

fn snapshot(path: &Path, saved_path: &Path) -> anyhow::Result<BackupKind> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BackupKind::Absent),
        Err(err) => {
            return Err(err).with_context(|| format!("failed inspecting {}", path.display()))
        }
    };

    // Payload slots are numbered by entry count and may be reused after
    // entries were undone.
    remove_path_if_exists(saved_path)
        .with_context(|| format!("failed clearing payload {}", saved_path.display()))?;
    if let Some(parent) = saved_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path)
            .with_context(|| format!("failed reading link {}", path.display()))?;
        return Ok(BackupKind::Symlink { target });
    }

    if file_type.is_dir() {
        copy_tree(path, saved_path)?;
        return Ok(BackupKind::Directory);
    }

    if file_type.is_file() {
        fs::copy(path, saved_path).with_context(|| {
            format!(
                "failed copying {} to {}",
                path.display(),
                saved_path.display()
            )
        })?;
        let sha256 = sha256_file(saved_path)?;
        return Ok(BackupKind::File {
            sha256,
            mode: file_mode(&metadata),
        });
    }

    Err(anyhow!("unsupported file type at {}", path.display()))
}

/// Restores entries newest first and collects a description of every
/// failure rather than stopping at the first one.
fn restore_entries(entries: &[BackupEntry]) -> Vec<String> {
    let mut failures = Vec::new();
    for entry in entries.iter().rev() {
        if let Err(err) = restore_entry(entry) {
            warn!(
                path = %entry.original_path.display(),
                error = %format!("{err:#}"),
                "failed to restore backup entry"
            );
            failures.push(format!("{}: {err:#}", entry.original_path.display()));
        }
    }
    failures
}

fn restore_entry(entry: &BackupEntry) -> anyhow::Result<()> {
    let path = &entry.original_path;
    remove_path_if_exists(path).with_context(|| format!("failed clearing {}", path.display()))?;
    if let Some(parent) = path.parent() {
        if !matches!(entry.kind, BackupKind::Absent) && !path_exists_no_follow(parent) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
    }

    match &entry.kind {
        BackupKind::Absent => Ok(()),
        BackupKind::Symlink { target } => create_symlink(target, path)
            .with_context(|| format!("failed recreating link {}", path.display())),
        BackupKind::Directory => {
            let saved = saved_payload(entry)?;
            copy_tree(saved, path)
        }
        BackupKind::File { sha256, mode } => {
            let saved = saved_payload(entry)?;
            fs::copy(saved, path).with_context(|| {
                format!("failed copying {} to {}", saved.display(), path.display())
            })?;
            set_file_mode(path, *mode)
                .with_context(|| format!("failed restoring mode of {}", path.display()))?;
            let restored = sha256_file(path)?;
            if &restored != sha256 {
                return Err(anyhow!(
                    "restored content digest mismatch (expected {sha256}, got {restored})"
                ));
            }
            Ok(())
        }
    }
}

fn saved_payload(entry: &BackupEntry) -> anyhow::Result<&Path> {
    entry.saved_path.as_deref().ok_or_else(|| {
        anyhow!(
            "backup entry for {} has no saved payload",
            entry.original_path.display()
        )
    })
}
