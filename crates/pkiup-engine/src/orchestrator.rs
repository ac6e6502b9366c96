use anyhow::Context;
use pkiup_catalog::VersionCatalog;
use pkiup_core::{UpgradeError, UpgradeStep, Version};
use tracing::{debug, error, info, info_span, warn};

use crate::lock::{process_is_alive, read_lock_owner};
use crate::repair::{read_repair_marker, write_repair_marker};
use crate::{
    BackupManager, BackupScope, Instance, InstanceLock, InstanceState, ScriptContext,
    ScriptletRegistry, UpgradeConfig, UpgradeLayout, UpgradeStateStore,
};

/// Terminal state of one upgrade run.
#[derive(Debug)]
pub enum UpgradeOutcome {
    /// Nothing left to apply.
    Completed,
    /// A step failed and its version was restored to how it was before the
    /// version started. Earlier versions of the run stay applied.
    RolledBack {
        step: UpgradeStep,
        cause: anyhow::Error,
    },
    /// A step failed and restoring the version failed too. The instance
    /// carries a needs-repair marker.
    Failed {
        step: UpgradeStep,
        cause: anyhow::Error,
        rollback_error: UpgradeError,
    },
}

#[derive(Debug)]
pub struct UpgradeReport {
    pub instance_id: String,
    pub starting_state: InstanceState,
    pub final_state: InstanceState,
    /// Steps committed by this run, in execution order.
    pub applied: Vec<UpgradeStep>,
    pub outcome: UpgradeOutcome,
}

impl UpgradeReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, UpgradeOutcome::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub pending: Vec<UpgradeStep>,
    pub needs_repair: Option<String>,
    pub locked_by: Option<u32>,
}

impl InstanceStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

type UpgradePlan = Vec<(Version, Vec<UpgradeStep>)>;

/// Drives instances through every pending catalog version, one step at a
/// time, under backup protection.
#[derive(Debug)]
pub struct UpgradeOrchestrator {
    catalog: VersionCatalog,
    scriptlets: ScriptletRegistry,
    layout: UpgradeLayout,
    store: UpgradeStateStore,
}

impl UpgradeOrchestrator {
    pub fn new(
        catalog: VersionCatalog,
        scriptlets: ScriptletRegistry,
        layout: UpgradeLayout,
    ) -> Self {
        Self {
            catalog,
            scriptlets,
            store: UpgradeStateStore::new(layout.clone()),
            layout,
        }
    }

    pub fn from_config(config: &UpgradeConfig) -> Self {
        Self::new(
            VersionCatalog::open(&config.catalog_dir),
            ScriptletRegistry::builtin(),
            config.layout(),
        )
    }

    pub fn layout(&self) -> &UpgradeLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &VersionCatalog {
        &self.catalog
    }

    pub fn status(&self, instance: &Instance) -> Result<InstanceStatus, UpgradeError> {
        let instance_id = instance.name();
        let state = self.read_state(instance_id)?;
        let pending = self
            .plan(&state)?
            .into_iter()
            .flat_map(|(_, steps)| steps)
            .collect();
        let needs_repair = read_repair_marker(&self.layout, instance_id)?;
        let locked_by = read_lock_owner(&self.layout.lock_path(instance_id))?
            .filter(|pid| process_is_alive(*pid));

        Ok(InstanceStatus {
            state,
            pending,
            needs_repair,
            locked_by,
        })
    }

    /// Upgrades every instance in turn. A failure of one instance does not
    /// stop the others.
    pub fn upgrade_all(
        &self,
        instances: &[Instance],
    ) -> Vec<(String, Result<UpgradeReport, UpgradeError>)> {
        instances
            .iter()
            .map(|instance| {
                let span = info_span!("instance", name = instance.name());
                let _entered = span.enter();
                let result = self.upgrade(instance);
                match &result {
                    Ok(report) if report.is_completed() => {
                        info!(applied = report.applied.len(), "instance is up to date")
                    }
                    Ok(report) => warn!(outcome = ?report.outcome, "instance upgrade halted"),
                    Err(err) => error!(error = %err, "instance upgrade did not start"),
                }
                (instance.name().to_string(), result)
            })
            .collect()
    }

    /// Applies all pending steps to `instance`.
    ///
    /// Errors are returned only for conditions detected before anything was
    /// mutated (bad catalog, unknown scriptlet, lock held, unreadable state).
    /// Step failures are reported through [`UpgradeOutcome`].
    pub fn upgrade(&self, instance: &Instance) -> Result<UpgradeReport, UpgradeError> {
        let instance_id = instance.name();
        if let Some(reason) = read_repair_marker(&self.layout, instance_id)? {
            return Err(UpgradeError::NeedsRepair {
                instance_id: instance_id.to_string(),
                reason,
            });
        }

        let backups = BackupManager::new(self.layout.clone(), instance_id);
        let starting_state = self.read_state(instance_id)?;
        if self.plan(&starting_state)?.is_empty() && backups.existing_scopes()?.is_empty() {
            debug!(instance = instance_id, version = %starting_state.current_version, "nothing to upgrade");
            return Ok(UpgradeReport {
                instance_id: instance_id.to_string(),
                final_state: starting_state.clone(),
                starting_state,
                applied: Vec::new(),
                outcome: UpgradeOutcome::Completed,
            });
        }

        let _lock = InstanceLock::acquire(&self.layout, instance_id)?;
        self.layout
            .ensure_instance_dirs(instance_id)
            .map_err(|err| UpgradeError::state_io(&self.layout.instance_dir(instance_id), err))?;

        // Another run may have progressed while we waited for the lock.
        let starting_state = self.read_state(instance_id)?;
        let plan = self.plan(&starting_state)?;
        self.scriptlets
            .validate(plan.iter().flat_map(|(_, steps)| steps))?;
        self.recover_scopes(&backups, &starting_state, &plan)?;

        let mut state = starting_state.clone();
        let mut applied = Vec::new();
        for (version, steps) in plan {
            info!(
                instance = instance_id,
                from = %state.current_version,
                to = %version,
                steps = steps.len(),
                "upgrading instance"
            );
            let mut scope = backups.begin_scope(&version, &state)?;

            if steps.is_empty() {
                let next = InstanceState::installed(instance_id, version.clone());
                self.store.write(instance_id, &next)?;
                state = next;
                finish_scope(scope);
                continue;
            }

            for step in &steps {
                match self.apply_step(instance, &mut scope, step) {
                    Ok(next) => {
                        state = next;
                        applied.push(step.clone());
                    }
                    Err(cause) => {
                        applied.retain(|done: &UpgradeStep| done.version != version);
                        return Ok(self.abort_version(
                            instance_id,
                            scope,
                            step.clone(),
                            cause,
                            starting_state,
                            state,
                            applied,
                        ));
                    }
                }
            }
            finish_scope(scope);
            info!(instance = instance_id, %version, "version applied");
        }

        Ok(UpgradeReport {
            instance_id: instance_id.to_string(),
            starting_state,
            final_state: state,
            applied,
            outcome: UpgradeOutcome::Completed,
        })
    }

    fn read_state(&self, instance_id: &str) -> Result<InstanceState, UpgradeError> {
        self.store.read(instance_id)?.ok_or_else(|| {
            UpgradeError::state_io(
                &self.layout.state_path(instance_id),
                "no upgrade state recorded; the instance must be initialized at install time",
            )
        })
    }

    /// Remaining steps of a partially applied current version, then every
    /// later catalog version in ascending order.
    fn plan(&self, state: &InstanceState) -> Result<UpgradePlan, UpgradeError> {
        let mut plan = Vec::new();
        if state.last_completed_step.is_some() {
            let steps = self.catalog.steps_for(&state.current_version)?;
            if let Some(next) = state.resume_index(steps.len()) {
                plan.push((
                    state.current_version.clone(),
                    steps[next as usize..].to_vec(),
                ));
            }
        }
        plan.extend(self.catalog.pending_plan(&state.current_version)?);
        Ok(plan)
    }

    /// Deals with scopes left behind by an interrupted run. The scope of the
    /// first planned version is reopened later by `begin_scope`.
    fn recover_scopes(
        &self,
        backups: &BackupManager,
        state: &InstanceState,
        plan: &UpgradePlan,
    ) -> Result<(), UpgradeError> {
        let resumed = plan.first().map(|(version, _)| version);
        for version in backups.existing_scopes()? {
            if Some(&version) == resumed {
                continue;
            }
            let Some(scope) = backups.open_scope(&version)? else {
                continue;
            };

            if version <= state.current_version {
                info!(instance = %state.instance_id, %version, "discarding backups of applied version");
                scope.commit()?;
            } else {
                warn!(instance = %state.instance_id, %version, "restoring backups of interrupted version");
                scope.rollback()?;
            }
        }
        Ok(())
    }

    fn apply_step(
        &self,
        instance: &Instance,
        scope: &mut BackupScope,
        step: &UpgradeStep,
    ) -> anyhow::Result<InstanceState> {
        scope.begin_step(step.index);
        let scriptlet = self.scriptlets.load(step)?;
        info!(
            instance = instance.name(),
            version = %step.version,
            step = step.index,
            scriptlet = %step.label(),
            "{}",
            scriptlet.message()
        );

        let mut ctx = ScriptContext::new(instance, step, scope);
        scriptlet
            .upgrade_instance(&mut ctx)
            .with_context(|| format!("scriptlet {} failed", step.label()))?;

        scope.checkpoint_step(step.index)?;
        let next = InstanceState::at_step(instance.name(), step.version.clone(), step.index);
        self.store.write(instance.name(), &next)?;
        Ok(next)
    }

    #[allow(clippy::too_many_arguments)]
    fn abort_version(
        &self,
        instance_id: &str,
        scope: BackupScope,
        step: UpgradeStep,
        cause: anyhow::Error,
        starting_state: InstanceState,
        last_state: InstanceState,
        applied: Vec<UpgradeStep>,
    ) -> UpgradeReport {
        let previous = scope.previous_state().clone();
        warn!(
            instance = instance_id,
            step = %step,
            error = %format!("{cause:#}"),
            "upgrade step failed, rolling back version"
        );

        // State first: if the restore is interrupted, the next run sees the
        // pre-version record and replays the journal that is still on disk.
        let restored = self
            .store
            .write(instance_id, &previous)
            .map_err(|err| {
                let reason = format!("state could not be reset before restoring backups: {err}");
                if let Err(marker_err) = write_repair_marker(&self.layout, instance_id, &reason) {
                    error!(instance = instance_id, error = %marker_err, "failed to write repair marker");
                }
                err
            })
            .and_then(|()| scope.rollback());

        let (final_state, outcome) = match restored {
            Ok(()) => (previous, UpgradeOutcome::RolledBack { step, cause }),
            Err(rollback_error) => {
                let final_state = self
                    .store
                    .read(instance_id)
                    .ok()
                    .flatten()
                    .unwrap_or(last_state);
                (
                    final_state,
                    UpgradeOutcome::Failed {
                        step,
                        cause,
                        rollback_error,
                    },
                )
            }
        };

        UpgradeReport {
            instance_id: instance_id.to_string(),
            starting_state,
            final_state,
            applied,
            outcome,
        }
    }
}

fn finish_scope(scope: BackupScope) {
    let version = scope.version().clone();
    if let Err(err) = scope.commit() {
        // Leftover journals of applied versions are discarded on the next run.
        warn!(%version, error = %err, "failed to discard backups");
    }
}
