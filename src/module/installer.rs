use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::context::{checkpoint, InstallContext, InstallStep, StepContext, StepError};
use super::files::{copy_module_files, remove_installed_files};
use super::install_log::InstallLog;
use super::scripts::{process_log_sink, run_script, script_failure, ScriptKind, SCRIPTS_DIR};
use super::{InstallPhase, InstallStatus, ModuleEnv, ModuleInfo, VERSION_FILE};
use crate::archive;
use crate::diagnostics::DiagnosticReport;
use crate::download::{DownloadProgress, DownloadRequest, DownloadState, ProgressCallback};
use crate::error::{EngineError, Result};
use crate::status::StatusCell;

type StepResult<T> = std::result::Result<T, StepError<InstallStep>>;

/// Installs one module: download, extract, back up uninstall scripts, preinst,
/// copy files, postinst. Any failure after the download rolls back.
#[derive(Clone)]
pub struct ModuleInstaller {
    env: ModuleEnv,
}

impl ModuleInstaller {
    pub fn new(env: ModuleEnv) -> Self {
        Self { env }
    }

    /// Reject requests that cannot start. Nothing is touched.
    pub fn validate(module: &ModuleInfo, archive: Option<&Path>) -> Result<()> {
        module.validate()?;
        if module.local {
            return Ok(());
        }
        match archive {
            Some(path) if !path.is_file() => Err(EngineError::usage(format!(
                "archive {} does not exist",
                path.display()
            ))),
            Some(_) => Ok(()),
            None if module.url.as_deref().is_none_or(str::is_empty) => Err(EngineError::usage(
                format!("module '{}' has neither a download URL nor an archive", module.name),
            )),
            None => Ok(()),
        }
    }

    /// Run the install to a terminal phase, publishing progress into `status`.
    pub async fn run(
        &self,
        module: &ModuleInfo,
        archive: Option<PathBuf>,
        status: &StatusCell<InstallStatus>,
        cancel: &CancellationToken,
    ) -> InstallPhase {
        status.update(|s| {
            s.phase = InstallPhase::Running;
            s.error = None;
        });
        info!("Installing {} {}", module.name, module.version);

        if module.local {
            info!("{} is a local module, nothing to install", module.name);
            status.update(|s| s.phase = InstallPhase::Installed);
            return InstallPhase::Installed;
        }

        let mut ctx = InstallContext::new(
            archive,
            self.env.install_dir(&module.name),
            self.env.install_log_path(&module.name),
        );
        let phase = match self.steps(&mut ctx, module, status, cancel).await {
            Ok(()) => InstallPhase::Installed,
            Err(StepError::Canceled) => InstallPhase::Canceled,
            Err(StepError::Failed(step, e)) => {
                error!("Install of {} failed at {step}: {e:#}", module.name);
                status.update(|s| s.error = Some(format!("{step}: {e:#}")));
                step.error_phase()
            }
            Err(StepError::Internal(e)) => {
                error!("Install of {} hit an internal error: {e:#}", module.name);
                self.env.diagnostics.report(&DiagnosticReport::new(
                    "module-installer",
                    format!("{e:#}"),
                    json!({
                        "module": module.name,
                        "version": module.version,
                        "step": ctx.step.map(|s| s.to_string()),
                    }),
                ));
                status.update(|s| s.error = Some(format!("{e:#}")));
                InstallPhase::ErrorInternal
            }
        };

        if phase != InstallPhase::Installed && ctx.rollback_armed {
            self.rollback(&ctx).await;
        }
        drop(ctx);

        status.update(|s| {
            s.phase = phase;
            s.step = None;
        });
        info!("Install of {} {} finished: {phase:?}", module.name, module.version);
        phase
    }

    async fn steps(
        &self,
        ctx: &mut InstallContext,
        module: &ModuleInfo,
        status: &StatusCell<InstallStatus>,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        enter(ctx, status, InstallStep::Download);
        let archive = match ctx.archive.clone() {
            Some(archive) => {
                info!("Using supplied archive {}", archive.display());
                archive
            }
            None => self.download(module, status, cancel).await?,
        };
        ctx.archive = Some(archive.clone());
        ctx.rollback_armed = true;
        checkpoint(cancel)?;

        enter(ctx, status, InstallStep::Extract);
        let root = self.extract(ctx, &archive).await.step(InstallStep::Extract)?;
        checkpoint(cancel)?;

        enter(ctx, status, InstallStep::BackupScripts);
        backup_uninstall_scripts(&root, &ctx.install_dir, &module.version)
            .await
            .step(InstallStep::BackupScripts)?;
        checkpoint(cancel)?;

        enter(ctx, status, InstallStep::PreInstall);
        self.script(ScriptKind::PreInstall, &root, module, status)
            .await
            .step(InstallStep::PreInstall)?;
        checkpoint(cancel)?;

        // Runs to completion once started.
        enter(ctx, status, InstallStep::CopyFiles);
        let log_path = ctx.log_path.clone();
        let paths = self.env.paths.clone();
        let source = root.clone();
        tokio::task::spawn_blocking(move || {
            let mut log = InstallLog::open(&log_path)
                .with_context(|| format!("Failed to open {}", log_path.display()))?;
            copy_module_files(&source, &paths, &mut log)
        })
        .await
        .map_err(|e| StepError::Internal(anyhow!("copy task failed: {e}")))?
        .step(InstallStep::CopyFiles)?;
        checkpoint(cancel)?;

        enter(ctx, status, InstallStep::PostInstall);
        self.script(ScriptKind::PostInstall, &root, module, status)
            .await
            .step(InstallStep::PostInstall)?;
        Ok(())
    }

    async fn download(
        &self,
        module: &ModuleInfo,
        status: &StatusCell<InstallStatus>,
        cancel: &CancellationToken,
    ) -> StepResult<PathBuf> {
        let url = module
            .url
            .as_deref()
            .ok_or_else(|| StepError::Failed(InstallStep::Download, anyhow!("no download URL")))?;
        let downloads = self.env.downloads.with_cancel_token(cancel.clone());
        let sink = status.clone();
        let progress: ProgressCallback = Arc::new(move |p: &DownloadProgress| {
            if let Some(percent) = p.percent {
                sink.update(|s| s.progress = Some(percent));
            }
        });
        let request = DownloadRequest::new(url)
            .checksums(module.checksums.clone())
            .cache_key(module.artifact_key());

        let outcome = downloads
            .download_file(&request, Some(progress))
            .await
            .map_err(|e| StepError::Failed(InstallStep::Download, e.into()))?;
        match (outcome.state, outcome.path) {
            (DownloadState::Canceled, _) => Err(StepError::Canceled),
            (state, Some(path)) if state.is_success() => Ok(path),
            (state, _) => Err(StepError::Failed(
                InstallStep::Download,
                anyhow!("download of {url} ended with {state:?}"),
            )),
        }
    }

    async fn extract(&self, ctx: &mut InstallContext, archive: &Path) -> anyhow::Result<PathBuf> {
        let temp_dir = &self.env.paths.temp_dir;
        tokio::fs::create_dir_all(temp_dir)
            .await
            .with_context(|| format!("Failed to create {}", temp_dir.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("pkgwarden_extract_")
            .tempdir_in(temp_dir)
            .context("Failed to create extraction directory")?;
        let root = dir.path().to_path_buf();
        ctx.extract_dir = Some(dir);
        archive::extract(archive, &root).await?;
        Ok(root)
    }

    async fn script(
        &self,
        kind: ScriptKind,
        root: &Path,
        module: &ModuleInfo,
        status: &StatusCell<InstallStatus>,
    ) -> anyhow::Result<()> {
        let path = root.join(SCRIPTS_DIR).join(kind.file_name());
        let result = run_script(&self.env, kind, &path, module, process_log_sink(status)).await;
        let failure = result.failed().then(|| script_failure(kind, &result));
        status.update(|s| match kind {
            ScriptKind::PreInstall => s.pre_script = result,
            _ => s.post_script = result,
        });
        failure.map_or(Ok(()), Err)
    }

    /// Remove everything the install log names, then the install directory.
    async fn rollback(&self, ctx: &InstallContext) {
        warn!("Rolling back install into {}", ctx.install_dir.display());
        let log_path = ctx.log_path.clone();
        let install_dir = ctx.install_dir.clone();
        let paths = self.env.paths.clone();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            match InstallLog::read(&log_path) {
                Ok(entries) => {
                    remove_installed_files(&paths, &entries, true)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Nothing was copied, no files to roll back");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", log_path.display()));
                }
            }
            match std::fs::remove_dir_all(&install_dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e)
                    .with_context(|| format!("Failed to remove {}", install_dir.display())),
                _ => Ok(()),
            }
        })
        .await;

        let failure = match result {
            Ok(Ok(())) => {
                info!("Rollback complete");
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(e) => format!("rollback task failed: {e}"),
        };
        error!("Rollback incomplete: {failure}");
        self.env.diagnostics.report(&DiagnosticReport::new(
            "module-installer",
            format!("rollback incomplete: {failure}"),
            json!({ "install_dir": ctx.install_dir }),
        ));
    }
}

fn enter(ctx: &mut InstallContext, status: &StatusCell<InstallStatus>, step: InstallStep) {
    ctx.enter(step);
    status.update(|s| s.step = Some(step.to_string()));
}

/// Keep `preuninst`/`postuninst` next to the install log, along with the
/// version they belong to. Missing scripts are fine; stale copies from an
/// earlier version are removed.
async fn backup_uninstall_scripts(
    extract_root: &Path,
    install_dir: &Path,
    version: &str,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(install_dir)
        .await
        .with_context(|| format!("Failed to create {}", install_dir.display()))?;
    tokio::fs::write(install_dir.join(VERSION_FILE), format!("{version}\n"))
        .await
        .context("Failed to record the installed version")?;
    for kind in ScriptKind::UNINSTALL {
        let source = extract_root.join(SCRIPTS_DIR).join(kind.file_name());
        let backup = install_dir.join(kind.file_name());
        if tokio::fs::try_exists(&source).await.unwrap_or(false) {
            tokio::fs::copy(&source, &backup)
                .await
                .with_context(|| format!("Failed to back up {}", kind.file_name()))?;
            debug!("Backed up {} to {}", kind.file_name(), backup.display());
        } else if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            tokio::fs::remove_file(&backup)
                .await
                .with_context(|| format!("Failed to remove stale {}", backup.display()))?;
        }
    }
    Ok(())
}
