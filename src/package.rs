//! OS-level package operations (apt index, apt packages, local .deb files).

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::{info, warn};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PackageConfig;
use crate::diagnostics::{DiagnosticReport, DiagnosticsSink};
use crate::error::{EngineError, Result};
use crate::guard::WriteGuard;
use crate::process::{CommandSpec, OutputCallback, ProcessRunner, StreamEvent, StreamHandle};
use crate::status::{OperationStatus, StatusCell};

/// Debian package names: lower case alphanumerics plus `+ - .`, at least two characters.
static PACKAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9+.\-]+$").expect("package name pattern is valid")
});

/// Lines kept from each stream in a watchdog diagnostic report.
const REPORT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageAction {
    RefreshIndex,
    Install(Vec<String>),
    Remove(Vec<String>),
    /// Remove including configuration files.
    Purge(Vec<String>),
    DryRunDeb(PathBuf),
    InstallDeb(PathBuf),
}

impl PackageAction {
    pub fn label(&self) -> &'static str {
        match self {
            PackageAction::RefreshIndex => "refresh-index",
            PackageAction::Install(_) => "install-packages",
            PackageAction::Remove(_) => "remove-packages",
            PackageAction::Purge(_) => "purge-packages",
            PackageAction::DryRunDeb(_) => "dry-run-deb",
            PackageAction::InstallDeb(_) => "install-deb",
        }
    }

    /// True when the action writes to the system.
    pub fn mutating(&self) -> bool {
        !matches!(self, PackageAction::DryRunDeb(_))
    }

    /// Validate parameters and resolve the command line.
    pub fn command(&self, config: &PackageConfig) -> Result<CommandSpec> {
        let mut args: Vec<String> = Vec::new();
        let tool = match self {
            PackageAction::RefreshIndex => {
                args.push("update".into());
                &config.apt_get
            }
            PackageAction::Install(names)
            | PackageAction::Remove(names)
            | PackageAction::Purge(names) => {
                validate_names(names)?;
                let verb = match self {
                    PackageAction::Install(_) => "install",
                    PackageAction::Remove(_) => "remove",
                    _ => "purge",
                };
                args.extend([verb.to_string(), "-y".to_string()]);
                args.extend(names.iter().cloned());
                &config.apt_get
            }
            PackageAction::DryRunDeb(path) => {
                validate_deb(path)?;
                args.extend(["--dry-run".into(), "-i".into(), path.display().to_string()]);
                &config.dpkg
            }
            PackageAction::InstallDeb(path) => {
                validate_deb(path)?;
                args.extend(["-i".into(), path.display().to_string()]);
                &config.dpkg
            }
        };
        let program = which::which(tool)
            .map_err(|e| EngineError::Config(format!("Package tool '{tool}' not found: {e}")))?;
        Ok(CommandSpec::exec(program, args).env("DEBIAN_FRONTEND", "noninteractive"))
    }
}

fn validate_names(names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(EngineError::usage("no package names given"));
    }
    if let Some(bad) = names.iter().find(|n| !PACKAGE_NAME.is_match(n)) {
        return Err(EngineError::usage(format!("invalid package name '{bad}'")));
    }
    Ok(())
}

fn validate_deb(path: &Path) -> Result<()> {
    if path.extension().and_then(|e| e.to_str()) != Some("deb") {
        return Err(EngineError::usage(format!(
            "{} is not a .deb file",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(EngineError::usage(format!("{} does not exist", path.display())));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Idle,
    Running,
    Done,
    Error,
    Killed,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
    pub action: String,
    pub command: String,
    pub state: PackageState,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl PackageReport {
    pub fn new(action: &PackageAction) -> Self {
        Self {
            action: action.label().to_string(),
            command: String::new(),
            state: PackageState::Idle,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

impl OperationStatus for PackageReport {
    fn is_terminal(&self) -> bool {
        !matches!(self.state, PackageState::Idle | PackageState::Running)
    }

    fn fail_internal(&mut self, message: String) {
        self.state = PackageState::Error;
        self.stderr.push(message);
    }
}

/// A package command in flight.
pub struct PackageJob {
    status: StatusCell<PackageReport>,
    stream: StreamHandle,
    task: JoinHandle<PackageReport>,
}

impl PackageJob {
    pub fn status(&self) -> PackageReport {
        self.status.snapshot()
    }

    pub fn kill(&self) {
        self.stream.kill();
    }

    /// Wait for the job, killing it if `cancel` fires first.
    pub async fn wait_or_kill(self, cancel: CancellationToken) -> PackageReport {
        let stream = self.stream.clone();
        let watcher = tokio::spawn(async move {
            cancel.cancelled().await;
            warn!("Package command canceled, killing it");
            stream.kill();
        });
        let report = self.wait().await;
        watcher.abort();
        report
    }

    pub async fn wait(self) -> PackageReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                self.status.update(|s| s.fail_internal(format!("package job failed: {e}")));
                self.status.snapshot()
            }
        }
    }
}

#[derive(Clone)]
pub struct PackageInstaller {
    runner: ProcessRunner,
    config: PackageConfig,
    guard: WriteGuard,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl PackageInstaller {
    pub fn new(
        runner: ProcessRunner,
        config: PackageConfig,
        guard: WriteGuard,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            runner,
            config,
            guard,
            diagnostics,
        }
    }

    /// Simulate installing `deb` and wait for the result.
    pub async fn dry_run(&self, deb: &Path, timeout: Option<Duration>) -> Result<PackageReport> {
        self.run_standalone(PackageAction::DryRunDeb(deb.to_path_buf()), timeout)
            .await
    }

    /// Install `deb` and wait, holding write access for the duration.
    pub async fn install(&self, deb: &Path, timeout: Option<Duration>) -> Result<PackageReport> {
        self.run_standalone(PackageAction::InstallDeb(deb.to_path_buf()), timeout)
            .await
    }

    async fn run_standalone(
        &self,
        action: PackageAction,
        timeout: Option<Duration>,
    ) -> Result<PackageReport> {
        let status = StatusCell::new(PackageReport::new(&action));
        self.run_guarded(&action, timeout, status, CancellationToken::new())
            .await
    }

    /// Run `action` to completion, taking write access when it mutates.
    /// Canceling `cancel` kills the command.
    pub async fn run_guarded(
        &self,
        action: &PackageAction,
        timeout: Option<Duration>,
        status: StatusCell<PackageReport>,
        cancel: CancellationToken,
    ) -> Result<PackageReport> {
        let cmd = action.command(&self.config)?;
        if action.mutating() {
            self.guard.acquire(true, true).await;
        }
        let report = match self.spawn(cmd, timeout, status) {
            Ok(job) => Ok(job.wait_or_kill(cancel).await),
            Err(e) => Err(e),
        };
        if action.mutating() {
            self.guard.disable_write(true, true);
        }
        report
    }

    /// Start a `.deb` install and return at once. Write access is the caller's business.
    pub fn start_install_deb(
        &self,
        deb: &Path,
        timeout: Option<Duration>,
        status: StatusCell<PackageReport>,
    ) -> Result<PackageJob> {
        self.start(&PackageAction::InstallDeb(deb.to_path_buf()), timeout, status)
    }

    pub fn start_refresh_index(&self, status: StatusCell<PackageReport>) -> Result<PackageJob> {
        self.start(&PackageAction::RefreshIndex, None, status)
    }

    pub fn start_install_package(
        &self,
        name: &str,
        status: StatusCell<PackageReport>,
    ) -> Result<PackageJob> {
        self.start(&PackageAction::Install(vec![name.to_string()]), None, status)
    }

    /// Remove `name`, dropping its configuration files too with `purge`.
    pub fn start_uninstall_package(
        &self,
        name: &str,
        purge: bool,
        status: StatusCell<PackageReport>,
    ) -> Result<PackageJob> {
        let names = vec![name.to_string()];
        let action = if purge {
            PackageAction::Purge(names)
        } else {
            PackageAction::Remove(names)
        };
        self.start(&action, None, status)
    }

    /// Start `action` and return at once. Write access is the caller's business.
    pub fn start(
        &self,
        action: &PackageAction,
        timeout: Option<Duration>,
        status: StatusCell<PackageReport>,
    ) -> Result<PackageJob> {
        let cmd = action.command(&self.config)?;
        self.spawn(cmd, timeout, status)
    }

    fn spawn(
        &self,
        cmd: CommandSpec,
        timeout: Option<Duration>,
        status: StatusCell<PackageReport>,
    ) -> Result<PackageJob> {
        let watchdog = timeout.unwrap_or_else(|| self.config.watchdog());
        if watchdog.is_zero() {
            return Err(EngineError::usage("watchdog timeout must be greater than zero"));
        }
        let command = cmd.describe();
        info!("Running package command '{command}'");
        status.update(|s| {
            s.state = PackageState::Running;
            s.command = command.clone();
        });

        let sink = status.clone();
        let on_output: OutputCallback = Arc::new(move |event| {
            sink.update(|s| match event {
                StreamEvent::Stdout(line) => s.stdout.push(line),
                StreamEvent::Stderr(line) => s.stderr.push(line),
            });
            Ok(())
        });
        let stream = self
            .runner
            .run_streaming(&cmd, on_output, Box::new(|_| Ok(())))
            .inspect_err(|e| {
                status.update(|s| s.fail_internal(e.to_string()));
            })?;

        let task = tokio::spawn(watchdog_run(
            stream.clone(),
            watchdog,
            status.clone(),
            Arc::clone(&self.diagnostics),
            command,
        ));
        Ok(PackageJob {
            status,
            stream,
            task,
        })
    }
}

async fn watchdog_run(
    stream: StreamHandle,
    watchdog: Duration,
    status: StatusCell<PackageReport>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    command: String,
) -> PackageReport {
    let (exit, timed_out) = match tokio::time::timeout(watchdog, stream.wait()).await {
        Ok(exit) => (exit, false),
        Err(_) => {
            warn!("'{command}' exceeded its watchdog of {watchdog:?}, killing it");
            stream.kill();
            (stream.wait().await, true)
        }
    };

    let state = if timed_out {
        PackageState::Timeout
    } else if exit.killed {
        PackageState::Killed
    } else if exit.exit_code == Some(0) {
        PackageState::Done
    } else {
        PackageState::Error
    };
    status.update(|s| {
        s.state = state;
        s.exit_code = exit.exit_code;
    });
    let report = status.snapshot();
    info!("'{command}' finished: {state:?} (exit code {:?})", exit.exit_code);

    if timed_out {
        diagnostics.report(&DiagnosticReport::new(
            "package-installer",
            "watchdog expired",
            json!({
                "command": command,
                "watchdog_secs": watchdog.as_secs(),
                "stdout_tail": tail(&report.stdout),
                "stderr_tail": tail(&report.stderr),
            }),
        ));
    }
    report
}

fn tail(lines: &[String]) -> &[String] {
    &lines[lines.len().saturating_sub(REPORT_TAIL_LINES)..]
}
