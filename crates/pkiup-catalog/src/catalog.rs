use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use pkiup_core::{UpgradeError, UpgradeStep, Version, VersionManifest, MANIFEST_FILE_NAME};
use tracing::debug;

/// Read-only view over an upgrade catalog directory: one subdirectory per
/// version, each carrying a `manifest.toml` that lists its scriptlets.
#[derive(Debug, Clone)]
pub struct VersionCatalog {
    root: PathBuf,
}

impl VersionCatalog {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All catalog versions in ascending order.
    pub fn list_versions(&self) -> Result<Vec<Version>, UpgradeError> {
        Ok(self.scan()?.into_keys().collect())
    }

    pub fn latest(&self) -> Result<Option<Version>, UpgradeError> {
        Ok(self.scan()?.into_keys().next_back())
    }

    /// Versions strictly greater than `current`, ascending.
    pub fn pending_versions(&self, current: &Version) -> Result<Vec<Version>, UpgradeError> {
        Ok(self
            .scan()?
            .into_keys()
            .filter(|version| version > current)
            .collect())
    }

    pub fn steps_for(&self, version: &Version) -> Result<Vec<UpgradeStep>, UpgradeError> {
        let versions = self.scan()?;
        let dir = versions.get(version).ok_or_else(|| {
            UpgradeError::catalog(
                &self.root,
                format!("version {version} is not present in the catalog"),
            )
        })?;

        let manifest = self.read_manifest(dir, version)?;
        Ok(manifest.steps(version))
    }

    /// Steps of every version after `current`, read up front so that a
    /// malformed manifest is reported before anything is executed.
    pub fn pending_plan(
        &self,
        current: &Version,
    ) -> Result<Vec<(Version, Vec<UpgradeStep>)>, UpgradeError> {
        let mut plan = Vec::new();
        for (version, dir) in self.scan()? {
            if &version <= current {
                continue;
            }
            let steps = self.read_manifest(&dir, &version)?.steps(&version);
            plan.push((version, steps));
        }
        Ok(plan)
    }

    fn scan(&self) -> Result<BTreeMap<Version, PathBuf>, UpgradeError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "upgrade catalog root does not exist");
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(UpgradeError::catalog(&self.root, err)),
        };

        let mut versions = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| UpgradeError::catalog(&self.root, err))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| UpgradeError::catalog(&path, err))?;
            if !file_type.is_dir() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                return Err(UpgradeError::catalog(
                    &path,
                    "version directory name is not valid UTF-8",
                ));
            };
            let version = Version::parse(name).map_err(|err| UpgradeError::catalog(&path, err))?;
            if let Some(existing) = versions.insert(version.clone(), path.clone()) {
                return Err(UpgradeError::catalog(
                    &path,
                    format!(
                        "version {version} is declared twice (also {})",
                        existing.display()
                    ),
                ));
            }
        }

        Ok(versions)
    }

    fn read_manifest(&self, dir: &Path, version: &Version) -> Result<VersionManifest, UpgradeError> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(UpgradeError::catalog(&path, "missing version manifest"));
            }
            Err(err) => return Err(UpgradeError::catalog(&path, err)),
        };

        let manifest =
            VersionManifest::from_toml_str(&raw).map_err(|err| UpgradeError::catalog(&path, err))?;
        if let Some(declared) = &manifest.version {
            if declared != version {
                return Err(UpgradeError::catalog(
                    &path,
                    format!("manifest declares version {declared} but directory is {version}"),
                ));
            }
        }
        Ok(manifest)
    }
}
