use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use crate::{Instance, ScriptContext, Scriptlet};

/// Replaces the instance's copies of the stock Tomcat files with links to the
/// shared defaults. Paths that already are links are left alone.
#[derive(Debug, Default)]
pub struct FixDefaultTomcatFiles;

impl FixDefaultTomcatFiles {
    pub fn new() -> Self {
        Self
    }

    fn linked_files(instance: &Instance) -> [(PathBuf, &'static str); 4] {
        [
            (instance.context_xml(), "context.xml"),
            (instance.tomcat_users_xml(), "tomcat-users.xml"),
            (instance.tomcat_users_xsd(), "tomcat-users.xsd"),
            (instance.web_xml(), "web.xml"),
        ]
    }
}

impl Scriptlet for FixDefaultTomcatFiles {
    fn message(&self) -> &str {
        "Fix links to default Tomcat files"
    }

    fn upgrade_instance(&self, ctx: &mut ScriptContext<'_>) -> anyhow::Result<()> {
        let instance = ctx.instance().clone();
        for (path, default_name) in Self::linked_files(&instance) {
            if path.is_symlink() {
                continue;
            }

            ctx.backup(&path)?;
            if path.is_dir() {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            } else if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }

            let target = instance.tomcat_conf_dir().join(default_name);
            instance.symlink(&target, &path)?;
            info!(
                instance = instance.name(),
                link = %path.display(),
                target = %target.display(),
                "linked default Tomcat file"
            );
        }
        Ok(())
    }
}
