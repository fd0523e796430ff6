//! Vendor lifecycle scripts (`preinst`, `postinst`, `preuninst`, `postuninst`).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{LifecycleStatus, ModuleEnv, ModuleInfo, Phase, ScriptStatus};
use crate::process::{CommandSpec, OutputCallback, StreamEvent};
use crate::status::StatusCell;

/// Reported exit code of a script that had to be killed.
pub const KILLED_EXIT_CODE: i32 = 130;

/// Directory of the lifecycle scripts inside a module archive.
pub(crate) const SCRIPTS_DIR: &str = "scripts";

const DEFAULT_INTERPRETER: &str = "/bin/sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PreInstall,
    PostInstall,
    PreUninstall,
    PostUninstall,
}

impl ScriptKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ScriptKind::PreInstall => "preinst",
            ScriptKind::PostInstall => "postinst",
            ScriptKind::PreUninstall => "preuninst",
            ScriptKind::PostUninstall => "postuninst",
        }
    }

    /// Scripts kept in the install directory for a later uninstall.
    pub(crate) const UNINSTALL: [ScriptKind; 2] = [ScriptKind::PreUninstall, ScriptKind::PostUninstall];
}

/// Interpreter and arguments from the `#!` line, `/bin/sh` without one.
///
/// Running the interpreter directly works for freshly extracted scripts that
/// lost their executable bit.
async fn interpreter(script: &Path) -> std::io::Result<Vec<String>> {
    let file = tokio::fs::File::open(script).await?;
    let mut first = String::new();
    // Binary content is not a shebang; fall through to the default.
    let _ = BufReader::new(file).read_line(&mut first).await;
    let argv: Vec<String> = first
        .strip_prefix("#!")
        .map(|rest| rest.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();
    if argv.is_empty() {
        Ok(vec![DEFAULT_INTERPRETER.to_string()])
    } else {
        Ok(argv)
    }
}

/// Run `script` when it exists, streaming its lines into `on_line` with a
/// `[name]` prefix. Kills it once the configured script timeout is exceeded.
pub(crate) async fn run_script(
    env: &ModuleEnv,
    kind: ScriptKind,
    script: &Path,
    module: &ModuleInfo,
    on_line: Arc<dyn Fn(String) + Send + Sync>,
) -> ScriptStatus {
    let name = kind.file_name();
    if !script.is_file() {
        info!("No {name} script for {}", module.name);
        return ScriptStatus::default();
    }

    let mut argv = match interpreter(script).await {
        Ok(argv) => argv,
        Err(e) => return script_error(format!("Failed to read {}: {e}", script.display())),
    };
    let program = PathBuf::from(argv.remove(0));
    argv.push(script.display().to_string());

    let mut cmd = CommandSpec::exec(program, argv)
        .env("PKGWARDEN_MODULE", &module.name)
        .env("PKGWARDEN_VERSION", &module.version)
        .env(
            "PKGWARDEN_INSTALL_DIR",
            env.install_dir(&module.name).display().to_string(),
        );
    if let Some(dir) = script.parent() {
        cmd = cmd.current_dir(dir);
    }

    let captured = Arc::new(Mutex::new(ScriptStatus {
        ran: true,
        ..ScriptStatus::default()
    }));
    let sink = Arc::clone(&captured);
    let on_output: OutputCallback = Arc::new(move |event| {
        on_line(format!("[{name}] {}", event.line()));
        let mut status = sink.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            StreamEvent::Stdout(line) => status.stdout.push(line),
            StreamEvent::Stderr(line) => status.stderr.push(line),
        }
        Ok(())
    });

    info!("Running {name} for {} {}", module.name, module.version);
    let handle = match env.runner.run_streaming(&cmd, on_output, Box::new(|_| Ok(()))) {
        Ok(handle) => handle,
        Err(e) => return script_error(e.to_string()),
    };
    let exit = match tokio::time::timeout(env.script_timeout, handle.wait()).await {
        Ok(exit) => exit,
        Err(_) => {
            warn!("{name} for {} exceeded {:?}, killing it", module.name, env.script_timeout);
            handle.kill();
            handle.wait().await
        }
    };

    let mut status = captured.lock().unwrap_or_else(PoisonError::into_inner).clone();
    // A signal death without our involvement is reported the same way as a kill.
    status.killed = exit.killed || exit.exit_code.is_none();
    status.exit_code = if status.killed {
        Some(KILLED_EXIT_CODE)
    } else {
        exit.exit_code
    };
    if status.failed() {
        warn!("{name} for {} failed with exit code {:?}", module.name, status.exit_code);
    }
    status
}

/// Forward script output into a lifecycle status' process log.
pub(crate) fn process_log_sink<P: Phase>(
    status: &StatusCell<LifecycleStatus<P>>,
) -> Arc<dyn Fn(String) + Send + Sync> {
    let sink = status.clone();
    Arc::new(move |line| sink.update(|s| s.process_log.push(line)))
}

/// Step error for a failed script; kills are told apart from plain non-zero exits.
pub(crate) fn script_failure(kind: ScriptKind, status: &ScriptStatus) -> anyhow::Error {
    let name = kind.file_name();
    match status.exit_code {
        _ if status.killed => anyhow::anyhow!("{name} was killed (exit code {KILLED_EXIT_CODE})"),
        Some(code) => anyhow::anyhow!("{name} exited with code {code}"),
        None => anyhow::anyhow!(
            "{name} could not be run: {}",
            status.stderr.last().map(String::as_str).unwrap_or("unknown error")
        ),
    }
}

fn script_error(message: String) -> ScriptStatus {
    warn!("{message}");
    ScriptStatus {
        ran: true,
        exit_code: None,
        killed: false,
        stdout: Vec::new(),
        stderr: vec![message],
    }
}
