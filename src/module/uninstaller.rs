use std::io;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use log::{error, info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::context::{checkpoint, StepContext, StepError, UninstallStep};
use super::files::remove_installed_files;
use super::install_log::InstallLog;
use super::scripts::{process_log_sink, run_script, script_failure, ScriptKind};
use super::{ModuleEnv, ModuleInfo, UninstallPhase, UninstallStatus};
use crate::config::PathsConfig;
use crate::diagnostics::DiagnosticReport;
use crate::status::StatusCell;

type StepResult<T> = std::result::Result<T, StepError<UninstallStep>>;

/// Removes an installed module: preuninst, delete logged files, postuninst.
#[derive(Clone)]
pub struct ModuleUninstaller {
    env: ModuleEnv,
}

impl ModuleUninstaller {
    pub fn new(env: ModuleEnv) -> Self {
        Self { env }
    }

    /// Run the uninstall to a terminal phase. With `force`, a missing install
    /// log or failed removals do not fail the run.
    pub async fn run(
        &self,
        module: &ModuleInfo,
        force: bool,
        status: &StatusCell<UninstallStatus>,
        cancel: &CancellationToken,
    ) -> UninstallPhase {
        status.update(|s| {
            s.phase = UninstallPhase::Running;
            s.error = None;
        });
        info!("Uninstalling {} (force={force})", module.name);

        if module.local {
            info!("{} is a local module, nothing to uninstall", module.name);
            status.update(|s| s.phase = UninstallPhase::Uninstalled);
            return UninstallPhase::Uninstalled;
        }

        // Uninstall scripts belong to the installed version, which may not be the requested one.
        let installed = match self.env.installed_version(&module.name).await {
            Some(version) if version != module.version => {
                status.update(|s| s.version = version.clone());
                ModuleInfo {
                    version,
                    ..module.clone()
                }
            }
            _ => module.clone(),
        };
        let module = &installed;

        let install_dir = self.env.install_dir(&module.name);
        let mut current = None;
        let phase = match self
            .steps(&install_dir, module, force, status, cancel, &mut current)
            .await
        {
            Ok(()) => {
                self.forget(&install_dir).await;
                UninstallPhase::Uninstalled
            }
            Err(StepError::Canceled) => UninstallPhase::Canceled,
            Err(StepError::Failed(step, e)) => {
                error!("Uninstall of {} failed at {step}: {e:#}", module.name);
                status.update(|s| s.error = Some(format!("{step}: {e:#}")));
                step.error_phase()
            }
            Err(StepError::Internal(e)) => {
                error!("Uninstall of {} hit an internal error: {e:#}", module.name);
                self.env.diagnostics.report(&DiagnosticReport::new(
                    "module-uninstaller",
                    format!("{e:#}"),
                    json!({
                        "module": module.name,
                        "force": force,
                        "step": current.map(|s: UninstallStep| s.to_string()),
                    }),
                ));
                status.update(|s| s.error = Some(format!("{e:#}")));
                UninstallPhase::ErrorInternal
            }
        };

        status.update(|s| {
            s.phase = phase;
            s.step = None;
        });
        info!("Uninstall of {} finished: {phase:?}", module.name);
        phase
    }

    async fn steps(
        &self,
        install_dir: &Path,
        module: &ModuleInfo,
        force: bool,
        status: &StatusCell<UninstallStatus>,
        cancel: &CancellationToken,
        current: &mut Option<UninstallStep>,
    ) -> StepResult<()> {
        let mut enter = |step: UninstallStep| {
            *current = Some(step);
            status.update(|s| s.step = Some(step.to_string()));
        };

        enter(UninstallStep::PreUninstall);
        self.script(ScriptKind::PreUninstall, install_dir, module, status)
            .await
            .step(UninstallStep::PreUninstall)?;
        checkpoint(cancel)?;

        enter(UninstallStep::RemoveFiles);
        let paths = self.env.paths.clone();
        let log_path = InstallLog::path_in(install_dir);
        tokio::task::spawn_blocking(move || remove_logged_files(&paths, &log_path, force))
            .await
            .map_err(|e| StepError::Internal(anyhow!("removal task failed: {e}")))?
            .step(UninstallStep::RemoveFiles)?;
        checkpoint(cancel)?;

        enter(UninstallStep::PostUninstall);
        self.script(ScriptKind::PostUninstall, install_dir, module, status)
            .await
            .step(UninstallStep::PostUninstall)?;
        Ok(())
    }

    async fn script(
        &self,
        kind: ScriptKind,
        install_dir: &Path,
        module: &ModuleInfo,
        status: &StatusCell<UninstallStatus>,
    ) -> anyhow::Result<()> {
        let path = install_dir.join(kind.file_name());
        let result = run_script(&self.env, kind, &path, module, process_log_sink(status)).await;
        let failure = result.failed().then(|| script_failure(kind, &result));
        status.update(|s| match kind {
            ScriptKind::PreUninstall => s.pre_script = result,
            _ => s.post_script = result,
        });
        failure.map_or(Ok(()), Err)
    }

    /// Drop the install log and backed-up scripts once the module is gone.
    async fn forget(&self, install_dir: &Path) {
        match tokio::fs::remove_dir_all(install_dir).await {
            Ok(()) => info!("Removed {}", install_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {e}", install_dir.display()),
        }
    }
}

fn remove_logged_files(paths: &PathsConfig, log_path: &Path, force: bool) -> anyhow::Result<()> {
    let entries = match InstallLog::read(log_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if force {
                warn!(
                    "install log not found at {}, nothing to remove",
                    log_path.display()
                );
                return Ok(());
            }
            bail!("install log not found: {}", log_path.display());
        }
        Err(e) if force => {
            warn!("Failed to read {}: {e}, nothing removed", log_path.display());
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", log_path.display()));
        }
    };
    match remove_installed_files(paths, &entries, force) {
        Ok(_) => Ok(()),
        Err(e) if force => {
            warn!("Removal incomplete: {e:#}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
