use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pkiup_core::UpgradeError;

use crate::fs_utils::{create_symlink, path_exists_no_follow};

pub const DEFAULT_TOMCAT_CONF_DIR: &str = "/usr/share/tomcat/conf";

/// An installed server instance as seen by scriptlets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    name: String,
    base_dir: PathBuf,
    tomcat_conf_dir: PathBuf,
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        tomcat_conf_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            tomcat_conf_dir: tomcat_conf_dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Shared directory holding the stock Tomcat configuration files.
    pub fn tomcat_conf_dir(&self) -> &Path {
        &self.tomcat_conf_dir
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.base_dir.join("conf")
    }

    pub fn server_xml(&self) -> PathBuf {
        self.conf_dir().join("server.xml")
    }

    pub fn context_xml(&self) -> PathBuf {
        self.conf_dir().join("context.xml")
    }

    pub fn web_xml(&self) -> PathBuf {
        self.conf_dir().join("web.xml")
    }

    pub fn tomcat_users_xml(&self) -> PathBuf {
        self.conf_dir().join("tomcat-users.xml")
    }

    pub fn tomcat_users_xsd(&self) -> PathBuf {
        self.conf_dir().join("tomcat-users.xsd")
    }

    /// Creates `link_path` pointing at `target`. The target must exist.
    pub fn symlink(&self, target: &Path, link_path: &Path) -> Result<(), UpgradeError> {
        if !target.exists() {
            return Err(UpgradeError::filesystem(
                target,
                format!("link target does not exist (for {})", link_path.display()),
            ));
        }
        if path_exists_no_follow(link_path) {
            return Err(UpgradeError::filesystem(link_path, "link path already exists"));
        }
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).map_err(|err| UpgradeError::filesystem(parent, err))?;
        }

        create_symlink(target, link_path).map_err(|err| UpgradeError::filesystem(link_path, err))
    }
}

/// Every directory under `instances_dir` that carries a `conf/` directory,
/// sorted by name.
pub fn discover_instances(
    instances_dir: &Path,
    tomcat_conf_dir: &Path,
) -> anyhow::Result<Vec<Instance>> {
    let entries = match fs::read_dir(instances_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read instances directory: {}",
                    instances_dir.display()
                )
            })
        }
    };

    let mut instances = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !path.join("conf").is_dir() {
            continue;
        }
        instances.push(Instance::new(name, &path, tomcat_conf_dir));
    }

    instances.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(instances)
}
