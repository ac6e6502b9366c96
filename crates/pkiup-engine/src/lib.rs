mod backup;
mod config;
mod fs_utils;
mod instance;
mod layout;
mod lock;
mod orchestrator;
mod repair;
mod scriptlet;
mod scriptlets;
mod state;

pub use backup::{BackupEntry, BackupKind, BackupManager, BackupScope};
pub use config::{default_config_path, UpgradeConfig};
pub use instance::{discover_instances, Instance, DEFAULT_TOMCAT_CONF_DIR};
pub use layout::UpgradeLayout;
pub use lock::InstanceLock;
pub use orchestrator::{InstanceStatus, UpgradeOrchestrator, UpgradeOutcome, UpgradeReport};
pub use repair::{clear_repair_marker, read_repair_marker, write_repair_marker};
pub use scriptlet::{ScriptContext, Scriptlet, ScriptletRegistry};
pub use scriptlets::FixDefaultTomcatFiles;
pub use state::{InstanceState, UpgradeStateStore};

pub use pkiup_catalog::VersionCatalog;
pub use pkiup_core::{UpgradeError, UpgradeStep, Version};
