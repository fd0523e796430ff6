//! Per-run bookkeeping shared by the lifecycle machines.

use std::fmt;
use std::path::PathBuf;

use log::{debug, info};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{InstallPhase, UninstallPhase};

/// Why a run stopped before its last step.
pub(crate) enum StepError<S> {
    Canceled,
    Failed(S, anyhow::Error),
    /// Unexpected failure outside the step's own contract.
    Internal(anyhow::Error),
}

/// Return `Canceled` when cancellation was requested. Called between steps only.
pub(crate) fn checkpoint<S>(cancel: &CancellationToken) -> Result<(), StepError<S>> {
    if cancel.is_cancelled() {
        info!("Cancellation requested, stopping before the next step");
        Err(StepError::Canceled)
    } else {
        Ok(())
    }
}

/// Attach the failing step to an error.
pub(crate) trait StepContext<T, S> {
    fn step(self, step: S) -> Result<T, StepError<S>>;
}

impl<T, S> StepContext<T, S> for anyhow::Result<T> {
    fn step(self, step: S) -> Result<T, StepError<S>> {
        self.map_err(|e| StepError::Failed(step, e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallStep {
    Download,
    Extract,
    BackupScripts,
    PreInstall,
    CopyFiles,
    PostInstall,
}

impl InstallStep {
    pub(crate) fn error_phase(self) -> InstallPhase {
        match self {
            InstallStep::Download => InstallPhase::ErrorDownload,
            InstallStep::Extract => InstallPhase::ErrorExtract,
            InstallStep::BackupScripts => InstallPhase::ErrorBackup,
            InstallStep::PreInstall => InstallPhase::ErrorPreInstall,
            InstallStep::CopyFiles => InstallPhase::ErrorCopy,
            InstallStep::PostInstall => InstallPhase::ErrorPostInstall,
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstallStep::Download => "download",
            InstallStep::Extract => "extract",
            InstallStep::BackupScripts => "backup_uninstall_scripts",
            InstallStep::PreInstall => "pre_install_script",
            InstallStep::CopyFiles => "copy_module_files",
            InstallStep::PostInstall => "post_install_script",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UninstallStep {
    PreUninstall,
    RemoveFiles,
    PostUninstall,
}

impl UninstallStep {
    pub(crate) fn error_phase(self) -> UninstallPhase {
        match self {
            UninstallStep::PreUninstall => UninstallPhase::ErrorPreUninstall,
            UninstallStep::RemoveFiles => UninstallPhase::ErrorRemove,
            UninstallStep::PostUninstall => UninstallPhase::ErrorPostUninstall,
        }
    }
}

impl fmt::Display for UninstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UninstallStep::PreUninstall => "pre_uninstall_script",
            UninstallStep::RemoveFiles => "remove_installed_files",
            UninstallStep::PostUninstall => "post_uninstall_script",
        })
    }
}

/// Mutable state of one install run. Dropped when the run ends, which also
/// removes the extraction directory.
pub(crate) struct InstallContext {
    pub step: Option<InstallStep>,
    pub archive: Option<PathBuf>,
    pub extract_dir: Option<TempDir>,
    pub install_dir: PathBuf,
    pub log_path: PathBuf,
    /// Set once the download step is behind us; failures then roll back.
    pub rollback_armed: bool,
}

impl InstallContext {
    pub(crate) fn new(archive: Option<PathBuf>, install_dir: PathBuf, log_path: PathBuf) -> Self {
        Self {
            step: None,
            archive,
            extract_dir: None,
            install_dir,
            log_path,
            rollback_armed: false,
        }
    }

    pub(crate) fn enter(&mut self, step: InstallStep) {
        debug!("Entering install step {step}");
        self.step = Some(step);
    }
}
