use std::fs;
use std::io;
use std::path::PathBuf;

use pkiup_core::UpgradeError;

use crate::fs_utils::write_atomic;
use crate::UpgradeLayout;

pub fn write_repair_marker(
    layout: &UpgradeLayout,
    instance_id: &str,
    reason: &str,
) -> Result<PathBuf, UpgradeError> {
    let path = layout.repair_marker_path(instance_id);
    write_atomic(&path, format!("{}\n", reason.trim()).as_bytes())
        .map_err(|err| UpgradeError::state_io(&path, err))?;
    Ok(path)
}

pub fn read_repair_marker(
    layout: &UpgradeLayout,
    instance_id: &str,
) -> Result<Option<String>, UpgradeError> {
    let path = layout.repair_marker_path(instance_id);
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Ok(Some("unspecified failure".to_string()))
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(UpgradeError::state_io(&path, err)),
    }
}

/// Called by an operator after fixing the instance by hand.
pub fn clear_repair_marker(layout: &UpgradeLayout, instance_id: &str) -> Result<bool, UpgradeError> {
    let path = layout.repair_marker_path(instance_id);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(UpgradeError::state_io(&path, err)),
    }
}
