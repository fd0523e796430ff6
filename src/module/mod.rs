//! Module lifecycle: install, uninstall and update state machines.
//!
//! Each machine runs its steps in order, publishes a `LifecycleStatus` through
//! a `StatusCell` and returns its terminal phase. Cancellation is checked
//! between steps only.

mod context;
mod files;
mod install_log;
mod installer;
mod scripts;
mod uninstaller;
mod updater;

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PathsConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::download::{Checksums, DownloadManager};
use crate::error::{EngineError, Result};
use crate::process::ProcessRunner;
use crate::status::OperationStatus;

pub use install_log::InstallLog;
pub use installer::ModuleInstaller;
pub use scripts::{ScriptKind, KILLED_EXIT_CODE};
pub use uninstaller::ModuleUninstaller;
pub use updater::ModuleUpdater;

/// File in the install directory naming the installed version.
pub(crate) const VERSION_FILE: &str = "version";

static MODULE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("module name pattern is valid")
});

/// A module as supplied by the caller, dependencies already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub checksums: Checksums,
    /// Ships no artifact; lifecycle operations succeed without touching disk.
    #[serde(default)]
    pub local: bool,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !MODULE_NAME.is_match(&self.name) || self.name == ".." {
            return Err(EngineError::usage(format!(
                "invalid module name '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Cache key of the module artifact.
    pub(crate) fn artifact_key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Everything the lifecycle machines need from their host.
#[derive(Clone)]
pub struct ModuleEnv {
    pub paths: PathsConfig,
    pub runner: ProcessRunner,
    pub downloads: DownloadManager,
    pub script_timeout: Duration,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

impl ModuleEnv {
    /// Durable per-module directory holding the install log and uninstall scripts.
    pub fn install_dir(&self, module: &str) -> PathBuf {
        self.paths.install_root.join(module)
    }

    pub fn install_log_path(&self, module: &str) -> PathBuf {
        InstallLog::path_in(&self.install_dir(module))
    }

    /// Version recorded by the last successful backup step, if any.
    pub async fn installed_version(&self, module: &str) -> Option<String> {
        let path = self.install_dir(module).join(VERSION_FILE);
        let content = tokio::fs::read_to_string(path).await.ok()?;
        let version = content.trim();
        (!version.is_empty()).then(|| version.to_string())
    }
}

/// Outcome of one lifecycle script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptStatus {
    /// False when the script does not exist.
    pub ran: bool,
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ScriptStatus {
    pub fn failed(&self) -> bool {
        self.ran && (self.killed || self.exit_code != Some(0))
    }
}

/// Phases shared by the lifecycle status types.
pub trait Phase: Copy + Eq + Send + Sync + 'static {
    const RUNNING: Self;
    const CANCELED: Self;
    const INTERNAL: Self;

    fn is_terminal(self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    #[default]
    Idle,
    Running,
    Installed,
    Canceled,
    ErrorDownload,
    ErrorExtract,
    ErrorBackup,
    ErrorPreInstall,
    ErrorCopy,
    ErrorPostInstall,
    ErrorInternal,
}

impl Phase for InstallPhase {
    const RUNNING: Self = InstallPhase::Running;
    const CANCELED: Self = InstallPhase::Canceled;
    const INTERNAL: Self = InstallPhase::ErrorInternal;

    fn is_terminal(self) -> bool {
        !matches!(self, InstallPhase::Idle | InstallPhase::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UninstallPhase {
    #[default]
    Idle,
    Running,
    Uninstalled,
    Canceled,
    ErrorPreUninstall,
    ErrorRemove,
    ErrorPostUninstall,
    ErrorInternal,
}

impl Phase for UninstallPhase {
    const RUNNING: Self = UninstallPhase::Running;
    const CANCELED: Self = UninstallPhase::Canceled;
    const INTERNAL: Self = UninstallPhase::ErrorInternal;

    fn is_terminal(self) -> bool {
        !matches!(self, UninstallPhase::Idle | UninstallPhase::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Running,
    Updated,
    Canceled,
    ErrorInstall,
    ErrorInternal,
}

impl Phase for UpdatePhase {
    const RUNNING: Self = UpdatePhase::Running;
    const CANCELED: Self = UpdatePhase::Canceled;
    const INTERNAL: Self = UpdatePhase::ErrorInternal;

    fn is_terminal(self) -> bool {
        !matches!(self, UpdatePhase::Idle | UpdatePhase::Running)
    }
}

/// Live status of an install or uninstall run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStatus<P> {
    pub module: String,
    pub version: String,
    pub phase: P,
    /// Step currently executing.
    pub step: Option<String>,
    /// Download progress in percent.
    pub progress: Option<u8>,
    pub pre_script: ScriptStatus,
    pub post_script: ScriptStatus,
    /// Script output lines in arrival order, prefixed with the script name.
    pub process_log: Vec<String>,
    /// Run is part of an update.
    pub updating: bool,
    pub error: Option<String>,
}

impl<P: Phase + Default> LifecycleStatus<P> {
    pub fn new(module: &ModuleInfo) -> Self {
        Self {
            module: module.name.clone(),
            version: module.version.clone(),
            ..Self::default()
        }
    }
}

impl<P: Phase + Serialize> OperationStatus for LifecycleStatus<P> {
    fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    fn fail_internal(&mut self, message: String) {
        self.phase = P::INTERNAL;
        self.step = None;
        self.error = Some(message);
    }
}

pub type InstallStatus = LifecycleStatus<InstallPhase>;
pub type UninstallStatus = LifecycleStatus<UninstallPhase>;

/// Status of an update: both sub-runs plus the combined phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateStatus {
    pub module: String,
    pub version: String,
    pub phase: UpdatePhase,
    pub uninstall: UninstallStatus,
    pub install: InstallStatus,
    pub error: Option<String>,
}

impl UpdateStatus {
    pub fn new(module: &ModuleInfo) -> Self {
        Self {
            module: module.name.clone(),
            version: module.version.clone(),
            ..Self::default()
        }
    }
}

impl OperationStatus for UpdateStatus {
    fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    fn fail_internal(&mut self, message: String) {
        self.phase = UpdatePhase::ErrorInternal;
        self.error = Some(message);
    }
}
