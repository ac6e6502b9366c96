use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use pkiup_core::{UpgradeError, UpgradeStep};

use crate::scriptlets::FixDefaultTomcatFiles;
use crate::{BackupScope, Instance};

/// A single versioned upgrade action.
pub trait Scriptlet {
    fn message(&self) -> &str;

    /// Any error halts the upgrade and rolls the current version back.
    fn upgrade_instance(&self, ctx: &mut ScriptContext<'_>) -> anyhow::Result<()>;
}

/// What a scriptlet gets to work with: the instance and the active backup
/// scope.
pub struct ScriptContext<'a> {
    instance: &'a Instance,
    step: &'a UpgradeStep,
    scope: &'a mut BackupScope,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(
        instance: &'a Instance,
        step: &'a UpgradeStep,
        scope: &'a mut BackupScope,
    ) -> Self {
        Self {
            instance,
            step,
            scope,
        }
    }

    pub fn instance(&self) -> &Instance {
        self.instance
    }

    pub fn step(&self) -> &UpgradeStep {
        self.step
    }

    /// Snapshots `path` so it is restored if the version rolls back. Call it
    /// before mutating the path.
    pub fn backup(&mut self, path: impl AsRef<Path>) -> Result<(), UpgradeError> {
        self.scope.backup(path.as_ref())
    }
}

type ScriptletFactory = Box<dyn Fn() -> Box<dyn Scriptlet>>;

/// Statically linked scriptlets, looked up by the name used in version
/// manifests.
pub struct ScriptletRegistry {
    factories: BTreeMap<String, ScriptletFactory>,
}

impl ScriptletRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("FixDefaultTomcatFiles", || {
            Box::new(FixDefaultTomcatFiles::new())
        });
        registry
    }

    /// Adds or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Scriptlet> + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds a fresh scriptlet for `step`.
    pub fn load(&self, step: &UpgradeStep) -> Result<Box<dyn Scriptlet>, UpgradeError> {
        let factory = self
            .factories
            .get(&step.name)
            .ok_or_else(|| unregistered(step))?;
        Ok(factory())
    }

    /// Fails on the first step whose scriptlet is not registered.
    pub fn validate<'s>(
        &self,
        steps: impl IntoIterator<Item = &'s UpgradeStep>,
    ) -> Result<(), UpgradeError> {
        for step in steps {
            if !self.contains(&step.name) {
                return Err(unregistered(step));
            }
        }
        Ok(())
    }
}

fn unregistered(step: &UpgradeStep) -> UpgradeError {
    UpgradeError::PluginLoad {
        version: step.version.clone(),
        index: step.index,
        name: step.name.clone(),
        reason: "no scriptlet registered under this name".to_string(),
    }
}

impl Default for ScriptletRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for ScriptletRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptletRegistry")
            .field("scriptlets", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
