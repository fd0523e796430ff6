//! Single entry point serializing every lifecycle operation.
//!
//! One operation runs at a time. Each has a `start_*` form returning an
//! [`Operation`] handle and a blocking form that awaits the same handle.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ExtractReport};
use crate::config::{EngineConfig, PackageConfig};
use crate::diagnostics::{DiagnosticReport, DiagnosticsSink, FileSink, LogSink};
use crate::download::{CachedFile, DownloadManager};
use crate::error::{EngineError, Result};
use crate::guard::WriteGuard;
use crate::module::{
    InstallLog, InstallStatus, ModuleEnv, ModuleInfo, ModuleInstaller, ModuleUninstaller,
    ModuleUpdater, UninstallStatus, UpdateStatus,
};
use crate::package::{PackageAction, PackageInstaller, PackageReport};
use crate::process::ProcessRunner;
use crate::status::{OperationStatus, Publisher, StatusCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RefreshIndex,
    InstallPackages,
    RemovePackages,
    DryRunDeb,
    InstallDeb,
    InstallModule,
    UninstallModule,
    UpdateModule,
    Extract,
}

impl From<&PackageAction> for OperationKind {
    fn from(action: &PackageAction) -> Self {
        match action {
            PackageAction::RefreshIndex => OperationKind::RefreshIndex,
            PackageAction::Install(_) => OperationKind::InstallPackages,
            PackageAction::Remove(_) | PackageAction::Purge(_) => OperationKind::RemovePackages,
            PackageAction::DryRunDeb(_) => OperationKind::DryRunDeb,
            PackageAction::InstallDeb(_) => OperationKind::InstallDeb,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::RefreshIndex => "refresh-index",
            OperationKind::InstallPackages => "install-packages",
            OperationKind::RemovePackages => "remove-packages",
            OperationKind::DryRunDeb => "dry-run-deb",
            OperationKind::InstallDeb => "install-deb",
            OperationKind::InstallModule => "install-module",
            OperationKind::UninstallModule => "uninstall-module",
            OperationKind::UpdateModule => "update-module",
            OperationKind::Extract => "extract",
        })
    }
}

/// The operation currently holding the processing permit.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentOperation {
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractPhase {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractStatus {
    pub archive: PathBuf,
    pub destination: PathBuf,
    pub phase: ExtractPhase,
    pub report: Option<ExtractReport>,
    pub error: Option<String>,
}

impl OperationStatus for ExtractStatus {
    fn is_terminal(&self) -> bool {
        matches!(self.phase, ExtractPhase::Done | ExtractPhase::Error)
    }

    fn fail_internal(&mut self, message: String) {
        self.phase = ExtractPhase::Error;
        self.error = Some(message);
    }
}

/// Handle to a started operation.
pub struct Operation<T> {
    kind: OperationKind,
    status: watch::Receiver<T>,
    cancel: CancellationToken,
    task: JoinHandle<T>,
}

impl<T: OperationStatus> Operation<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Latest published status.
    pub fn current(&self) -> T {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.status.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the terminal status.
    pub async fn wait(self) -> T {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                let mut status = self.status.borrow().clone();
                status.fail_internal(format!("{} task failed: {e}", self.kind));
                status
            }
        }
    }
}

struct Running {
    info: CurrentOperation,
    cancel: CancellationToken,
}

struct Inner {
    permit: Arc<Semaphore>,
    current: Mutex<Option<Running>>,
    guard: WriteGuard,
    env: ModuleEnv,
    packages: PackageInstaller,
    installer: ModuleInstaller,
    uninstaller: ModuleUninstaller,
    updater: ModuleUpdater,
    diagnostics: Arc<dyn DiagnosticsSink>,
    package_config: PackageConfig,
}

impl Inner {
    fn set_current(&self, running: Option<Running>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = running;
    }
}

#[derive(Clone)]
pub struct InstallOrchestrator {
    inner: Arc<Inner>,
}

impl InstallOrchestrator {
    /// Build the engine from its configuration, remounting through the configured commands.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let diagnostics: Arc<dyn DiagnosticsSink> = match &config.diagnostics.report_dir {
            Some(dir) => Arc::new(FileSink::new(dir)),
            None => Arc::new(LogSink),
        };
        Self::with_parts(config, WriteGuard::from_config(&config.write_guard), diagnostics)
    }

    /// Build the engine around an existing write guard and diagnostics sink.
    pub fn with_parts(
        config: &EngineConfig,
        guard: WriteGuard,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        let runner = ProcessRunner::new();
        let downloads = DownloadManager::new(&config.paths.temp_dir, config.download.clone())?;
        let env = ModuleEnv {
            paths: config.paths.clone(),
            runner: runner.clone(),
            downloads,
            script_timeout: config.modules.script_timeout(),
            diagnostics: Arc::clone(&diagnostics),
        };
        let packages = PackageInstaller::new(
            runner,
            config.packages.clone(),
            guard.clone(),
            Arc::clone(&diagnostics),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                permit: Arc::new(Semaphore::new(1)),
                current: Mutex::new(None),
                guard,
                installer: ModuleInstaller::new(env.clone()),
                uninstaller: ModuleUninstaller::new(env.clone()),
                updater: ModuleUpdater::new(env.clone()),
                env,
                packages,
                diagnostics,
                package_config: config.packages.clone(),
            }),
        })
    }

    pub fn is_processing(&self) -> bool {
        self.inner.permit.available_permits() == 0
    }

    pub fn current_operation(&self) -> Option<CurrentOperation> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.info.clone())
    }

    /// Cancel whatever is running. Returns false when idle.
    pub fn cancel_current(&self) -> bool {
        match &*self.inner.current.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(running) => {
                info!("Canceling {}", running.info.kind);
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.inner.env.downloads
    }

    pub fn write_guard(&self) -> &WriteGuard {
        &self.inner.guard
    }

    // ---- OS packages ----

    pub fn start_package(
        &self,
        action: PackageAction,
        timeout: Option<Duration>,
        on_status: Option<Publisher<PackageReport>>,
    ) -> Result<Operation<PackageReport>> {
        // Reject bad names and missing tools before taking the permit.
        action.command(&self.inner.package_config)?;
        let packages = self.inner.packages.clone();
        let initial = PackageReport::new(&action);
        // The package installer takes write access itself.
        self.launch(
            OperationKind::from(&action),
            initial,
            on_status,
            false,
            move |status, cancel| async move {
                if let Err(e) = packages
                    .run_guarded(&action, timeout, status.clone(), cancel)
                    .await
                {
                    status.update(|s| s.fail_internal(e.to_string()));
                }
            },
        )
    }

    pub async fn run_package(
        &self,
        action: PackageAction,
        timeout: Option<Duration>,
    ) -> Result<PackageReport> {
        Ok(self.start_package(action, timeout, None)?.wait().await)
    }

    pub async fn refresh_index(&self) -> Result<PackageReport> {
        self.run_package(PackageAction::RefreshIndex, None).await
    }

    pub async fn install_packages(&self, names: Vec<String>) -> Result<PackageReport> {
        self.run_package(PackageAction::Install(names), None).await
    }

    pub async fn remove_packages(&self, names: Vec<String>, purge: bool) -> Result<PackageReport> {
        let action = if purge {
            PackageAction::Purge(names)
        } else {
            PackageAction::Remove(names)
        };
        self.run_package(action, None).await
    }

    pub async fn dry_run_deb(&self, deb: PathBuf) -> Result<PackageReport> {
        self.run_package(PackageAction::DryRunDeb(deb), None).await
    }

    pub async fn install_deb(&self, deb: PathBuf) -> Result<PackageReport> {
        self.run_package(PackageAction::InstallDeb(deb), None).await
    }

    // ---- modules ----

    pub fn start_install_module(
        &self,
        module: ModuleInfo,
        archive: Option<PathBuf>,
        on_status: Option<Publisher<InstallStatus>>,
    ) -> Result<Operation<InstallStatus>> {
        ModuleInstaller::validate(&module, archive.as_deref())?;
        let installer = self.inner.installer.clone();
        let initial = InstallStatus::new(&module);
        self.launch(
            OperationKind::InstallModule,
            initial,
            on_status,
            true,
            move |status, cancel| async move {
                installer.run(&module, archive, &status, &cancel).await;
            },
        )
    }

    pub async fn install_module(
        &self,
        module: ModuleInfo,
        archive: Option<PathBuf>,
    ) -> Result<InstallStatus> {
        Ok(self.start_install_module(module, archive, None)?.wait().await)
    }

    pub fn start_uninstall_module(
        &self,
        module: ModuleInfo,
        force: bool,
        on_status: Option<Publisher<UninstallStatus>>,
    ) -> Result<Operation<UninstallStatus>> {
        module.validate()?;
        let uninstaller = self.inner.uninstaller.clone();
        let initial = UninstallStatus::new(&module);
        self.launch(
            OperationKind::UninstallModule,
            initial,
            on_status,
            true,
            move |status, cancel| async move {
                uninstaller.run(&module, force, &status, &cancel).await;
            },
        )
    }

    pub async fn uninstall_module(&self, module: ModuleInfo, force: bool) -> Result<UninstallStatus> {
        Ok(self.start_uninstall_module(module, force, None)?.wait().await)
    }

    pub fn start_update_module(
        &self,
        module: ModuleInfo,
        archive: Option<PathBuf>,
        force_uninstall: bool,
        on_status: Option<Publisher<UpdateStatus>>,
    ) -> Result<Operation<UpdateStatus>> {
        ModuleInstaller::validate(&module, archive.as_deref())?;
        let updater = self.inner.updater.clone();
        let initial = UpdateStatus::new(&module);
        self.launch(
            OperationKind::UpdateModule,
            initial,
            on_status,
            true,
            move |status, cancel| async move {
                updater
                    .run(&module, archive, force_uninstall, &status, &cancel)
                    .await;
            },
        )
    }

    pub async fn update_module(
        &self,
        module: ModuleInfo,
        archive: Option<PathBuf>,
        force_uninstall: bool,
    ) -> Result<UpdateStatus> {
        Ok(self
            .start_update_module(module, archive, force_uninstall, None)?
            .wait()
            .await)
    }

    /// Paths recorded in a module's install log. Empty when it is not installed.
    pub fn installed_files(&self, module: &str) -> Result<Vec<PathBuf>> {
        ModuleInfo::new(module, "").validate()?;
        match InstallLog::read(&self.inner.env.install_log_path(module)) {
            Ok(entries) => Ok(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- archives ----

    pub fn start_extract(
        &self,
        archive: PathBuf,
        destination: PathBuf,
        on_status: Option<Publisher<ExtractStatus>>,
    ) -> Result<Operation<ExtractStatus>> {
        if !archive.is_file() {
            return Err(EngineError::usage(format!(
                "archive {} does not exist",
                archive.display()
            )));
        }
        archive::ArchiveFormat::detect(&archive)
            .map_err(|e| EngineError::usage(format!("{e:#}")))?;
        let initial = ExtractStatus {
            archive: archive.clone(),
            destination: destination.clone(),
            ..ExtractStatus::default()
        };
        self.launch(
            OperationKind::Extract,
            initial,
            on_status,
            true,
            move |status, _cancel| async move {
                status.update(|s| s.phase = ExtractPhase::Running);
                match archive::extract(&archive, &destination).await {
                    Ok(report) => status.update(|s| {
                        s.phase = ExtractPhase::Done;
                        s.report = Some(report);
                    }),
                    Err(e) => {
                        error!("Extracting {} failed: {e:#}", archive.display());
                        status.update(|s| {
                            s.phase = ExtractPhase::Error;
                            s.error = Some(format!("{e:#}"));
                        });
                    }
                }
            },
        )
    }

    pub async fn extract(&self, archive: PathBuf, destination: PathBuf) -> Result<ExtractStatus> {
        Ok(self.start_extract(archive, destination, None)?.wait().await)
    }

    // ---- cache ----

    pub async fn purge_files(&self, all: bool) -> usize {
        self.inner.env.downloads.purge_files(all).await
    }

    pub async fn cached_files(&self) -> Vec<CachedFile> {
        self.inner.env.downloads.cached_files().await
    }

    /// Cancel the running operation, give it `grace` to finish, then drop
    /// any write access still held.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_current();
        match tokio::time::timeout(grace, self.inner.permit.acquire()).await {
            Ok(Ok(_permit)) => {}
            _ => warn!("An operation was still running at shutdown"),
        }
        let guard = self.inner.guard.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || guard.release_idle()).await {
            error!("Releasing write access failed: {e}");
        }
    }

    fn launch<T, F, Fut>(
        &self,
        kind: OperationKind,
        initial: T,
        on_status: Option<Publisher<T>>,
        mutating: bool,
        work: F,
    ) -> Result<Operation<T>>
    where
        T: OperationStatus + Serialize,
        F: FnOnce(StatusCell<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.inner.permit)
            .try_acquire_owned()
            .map_err(|_| {
                let busy_with = self
                    .current_operation()
                    .map_or_else(|| "another operation".to_string(), |c| c.kind.to_string());
                EngineError::Busy(format!("{busy_with} is in progress"))
            })?;

        let cancel = CancellationToken::new();
        self.inner.set_current(Some(Running {
            info: CurrentOperation {
                kind,
                started_at: Utc::now(),
            },
            cancel: cancel.clone(),
        }));
        info!("Starting {kind}");

        let (tx, rx) = watch::channel(initial.clone());
        let publisher: Publisher<T> = Arc::new(move |s: &T| {
            tx.send_replace(s.clone());
            if let Some(callback) = &on_status {
                callback(s);
            }
        });
        let status = StatusCell::with_publisher(initial, publisher);

        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if mutating {
                inner.guard.acquire(true, true).await;
            }

            if let Err(e) = tokio::spawn(work(status.clone(), token)).await {
                let message = if e.is_panic() {
                    format!("{kind} panicked: {}", panic_message(e.into_panic()))
                } else {
                    format!("{kind} was aborted")
                };
                error!("{message}");
                inner.diagnostics.report(&DiagnosticReport::new(
                    "orchestrator",
                    message.clone(),
                    json!({
                        "operation": kind.to_string(),
                        "status": serde_json::to_value(status.snapshot()).unwrap_or_default(),
                    }),
                ));
                status.update(|s| s.fail_internal(message));
            }
            if !status.snapshot().is_terminal() {
                status.update(|s| {
                    s.fail_internal(format!("{kind} ended without a terminal status"))
                });
            }

            if mutating {
                inner.guard.disable_write(true, true);
            }
            inner.set_current(None);
            drop(permit);
            info!("Finished {kind}");
            status.snapshot()
        });

        Ok(Operation {
            kind,
            status: rx,
            cancel,
            task,
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
