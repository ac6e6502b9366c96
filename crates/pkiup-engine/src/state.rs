use std::fs;
use std::io;

use pkiup_core::{UpgradeError, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fs_utils::write_atomic;
use crate::UpgradeLayout;

/// Persisted upgrade progress of one instance.
///
/// `last_completed_step == None` means `current_version` is fully applied
/// (fresh install, or a version without scriptlets). `Some(k)` means steps
/// `0..=k` of `current_version` have committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: String,
    pub current_version: Version,
    pub last_completed_step: Option<u32>,
}

impl InstanceState {
    pub fn installed(instance_id: impl Into<String>, version: Version) -> Self {
        Self {
            instance_id: instance_id.into(),
            current_version: version,
            last_completed_step: None,
        }
    }

    pub fn at_step(instance_id: impl Into<String>, version: Version, step: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            current_version: version,
            last_completed_step: Some(step),
        }
    }

    /// Index of the first step of `current_version` still to run, if the
    /// version has `step_count` steps and is only partially applied.
    pub fn resume_index(&self, step_count: usize) -> Option<u32> {
        let next = self.last_completed_step?.checked_add(1)?;
        ((next as usize) < step_count).then_some(next)
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeStateStore {
    layout: UpgradeLayout,
}

impl UpgradeStateStore {
    pub fn new(layout: UpgradeLayout) -> Self {
        Self { layout }
    }

    pub fn read(&self, instance_id: &str) -> Result<Option<InstanceState>, UpgradeError> {
        let path = self.layout.state_path(instance_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(UpgradeError::state_io(&path, err)),
        };

        let state: InstanceState = serde_json::from_str(&raw)
            .map_err(|err| UpgradeError::state_io(&path, format!("corrupt state file: {err}")))?;
        if state.instance_id != instance_id {
            return Err(UpgradeError::state_io(
                &path,
                format!(
                    "state belongs to instance '{}', expected '{instance_id}'",
                    state.instance_id
                ),
            ));
        }
        Ok(Some(state))
    }

    pub fn write(&self, instance_id: &str, state: &InstanceState) -> Result<(), UpgradeError> {
        let path = self.layout.state_path(instance_id);
        if state.instance_id != instance_id {
            return Err(UpgradeError::state_io(
                &path,
                format!(
                    "refusing to store state of '{}' under '{instance_id}'",
                    state.instance_id
                ),
            ));
        }

        let mut payload = serde_json::to_string_pretty(state)
            .map_err(|err| UpgradeError::state_io(&path, err))?;
        payload.push('\n');
        write_atomic(&path, payload.as_bytes()).map_err(|err| UpgradeError::state_io(&path, err))?;
        debug!(
            instance = instance_id,
            version = %state.current_version,
            step = ?state.last_completed_step,
            "stored upgrade state"
        );
        Ok(())
    }

    /// Records the installed version of a new instance. An existing record is
    /// left untouched and returned.
    pub fn initialize(
        &self,
        instance_id: &str,
        version: Version,
    ) -> Result<InstanceState, UpgradeError> {
        if let Some(existing) = self.read(instance_id)? {
            return Ok(existing);
        }

        let state = InstanceState::installed(instance_id, version);
        self.write(instance_id, &state)?;
        Ok(state)
    }
}
