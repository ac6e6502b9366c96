use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Version;

/// One scriptlet invocation of a catalog version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStep {
    pub version: Version,
    /// 0-based execution position within `version`.
    pub index: u32,
    /// Sort key declared in the version manifest.
    pub ordinal: u32,
    pub name: String,
    pub message: Option<String>,
}

impl UpgradeStep {
    pub fn label(&self) -> String {
        format!("{:02}-{}", self.ordinal, self.name)
    }
}

impl fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} ({})", self.version, self.index, self.label())
    }
}
