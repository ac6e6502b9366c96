use std::collections::HashSet;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::{UpgradeStep, Version};

pub const MANIFEST_FILE_NAME: &str = "manifest.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptletDeclaration {
    pub ordinal: u32,
    pub name: String,
    pub message: Option<String>,
}

/// Contents of `<catalog>/<version>/manifest.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionManifest {
    pub version: Option<Version>,
    #[serde(default)]
    pub scriptlets: Vec<ScriptletDeclaration>,
}

impl VersionManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse version manifest")?;

        let mut seen_ordinals = HashSet::new();
        for scriptlet in &manifest.scriptlets {
            if scriptlet.name.trim().is_empty() {
                return Err(anyhow!(
                    "scriptlet name must not be empty (ordinal {})",
                    scriptlet.ordinal
                ));
            }
            if !seen_ordinals.insert(scriptlet.ordinal) {
                return Err(anyhow!(
                    "duplicate scriptlet ordinal {} ('{}')",
                    scriptlet.ordinal,
                    scriptlet.name
                ));
            }
        }
        Ok(manifest)
    }

    /// Steps ordered by declared ordinal, indexed from 0.
    pub fn steps(&self, version: &Version) -> Vec<UpgradeStep> {
        let mut declarations = self.scriptlets.iter().collect::<Vec<_>>();
        declarations.sort_by_key(|declaration| declaration.ordinal);

        declarations
            .into_iter()
            .enumerate()
            .map(|(index, declaration)| UpgradeStep {
                version: version.clone(),
                index: index as u32,
                ordinal: declaration.ordinal,
                name: declaration.name.trim().to_string(),
                message: declaration.message.clone(),
            })
            .collect()
    }
}
