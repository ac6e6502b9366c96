use std::fs;
use std::path::{Path, PathBuf};

use pkiup_core::UpgradeError;
use serde::{Deserialize, Serialize};

use crate::{UpgradeLayout, DEFAULT_TOMCAT_CONF_DIR};

const DEFAULT_CATALOG_DIR: &str = "/usr/share/pki/server/upgrade";
const DEFAULT_INSTANCES_DIR: &str = "/var/lib/pki";
const DEFAULT_STATE_DIR: &str = "/var/lib/pki-upgrade";
const DEFAULT_CONFIG_PATH: &str = "/etc/pki/upgrade.toml";

/// Where the engine finds its catalog and instances and keeps its own state.
///
/// Every field may be omitted from `upgrade.toml`; missing values come from
/// `PKI_UPGRADE_CATALOG`, `PKI_INSTANCES_DIR`, `PKI_UPGRADE_STATE_DIR` and
/// `TOMCAT_CONF_DIR`, then from the packaged defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,
    #[serde(default = "default_instances_dir")]
    pub instances_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_tomcat_conf_dir")]
    pub tomcat_conf_dir: PathBuf,
}

impl UpgradeConfig {
    pub fn from_env() -> Self {
        Self {
            catalog_dir: default_catalog_dir(),
            instances_dir: default_instances_dir(),
            state_dir: default_state_dir(),
            tomcat_conf_dir: default_tomcat_conf_dir(),
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, UpgradeError> {
        let config: Self = toml::from_str(input)
            .map_err(|err| UpgradeError::Config(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`; a missing file yields the environment defaults.
    pub fn load(path: &Path) -> Result<Self, UpgradeError> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw).map_err(|err| match err {
                UpgradeError::Config(reason) => {
                    UpgradeError::Config(format!("{}: {reason}", path.display()))
                }
                other => other,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::from_env();
                config.validate()?;
                Ok(config)
            }
            Err(err) => Err(UpgradeError::Config(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), UpgradeError> {
        for (field, path) in [
            ("catalog_dir", &self.catalog_dir),
            ("instances_dir", &self.instances_dir),
            ("state_dir", &self.state_dir),
            ("tomcat_conf_dir", &self.tomcat_conf_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(UpgradeError::Config(format!("{field} must not be empty")));
            }
            if !path.is_absolute() {
                return Err(UpgradeError::Config(format!(
                    "{field} must be an absolute path: {}",
                    path.display()
                )));
            }
        }

        if self.state_dir.starts_with(&self.catalog_dir) {
            return Err(UpgradeError::Config(format!(
                "state_dir {} must not live inside catalog_dir {}",
                self.state_dir.display(),
                self.catalog_dir.display()
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> UpgradeLayout {
        UpgradeLayout::new(&self.state_dir)
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

pub fn default_config_path() -> PathBuf {
    env_path("PKI_UPGRADE_CONFIG").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn default_catalog_dir() -> PathBuf {
    env_path("PKI_UPGRADE_CATALOG").unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_DIR))
}

fn default_instances_dir() -> PathBuf {
    env_path("PKI_INSTANCES_DIR").unwrap_or_else(|| PathBuf::from(DEFAULT_INSTANCES_DIR))
}

fn default_state_dir() -> PathBuf {
    env_path("PKI_UPGRADE_STATE_DIR").unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

fn default_tomcat_conf_dir() -> PathBuf {
    env_path("TOMCAT_CONF_DIR").unwrap_or_else(|| PathBuf::from(DEFAULT_TOMCAT_CONF_DIR))
}
