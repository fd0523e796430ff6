mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;

use pkgwarden::download::Checksums;
use pkgwarden::orchestrator::Operation;
use pkgwarden::status::{OperationStatus, Publisher};
use pkgwarden::{
    CommandSpec, EngineConfig, InstallOrchestrator, InstallPhase, ModuleInfo, PackageAction,
    PackageState, ProcessRunner, UninstallPhase, UpdatePhase,
};

/// How long a canceled operation gets to wind down before exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn main() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    let cfg_path = if let Some(path) = args.config {
        path
    } else if args.system {
        PathBuf::from("/etc/pkgwarden/pkgwarden.toml")
    } else {
        dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("pkgwarden")
            .join("pkgwarden.toml")
    };
    let cfg = EngineConfig::load_or_create(&cfg_path)
        .with_context(|| format!("Failed to load config {}", cfg_path.display()))?;
    info!("Using config from: {}", cfg_path.display());

    let engine = InstallOrchestrator::from_config(&cfg)?;
    let result = dispatch(&engine, args.sub).await;
    engine.shutdown(SHUTDOWN_GRACE).await;
    result
}

async fn dispatch(engine: &InstallOrchestrator, cmd: cli::Cmd) -> Result<()> {
    match cmd {
        cli::Cmd::Install(source) => {
            let (module, archive) = module_from(source);
            let op = engine.start_install_module(module, archive, Some(step_logger()))?;
            let status = wait_interruptible(op).await;
            print_status(&status)?;
            ensure(status.phase == InstallPhase::Installed, status.phase)
        }
        cli::Cmd::Uninstall { name, force } => {
            let op = engine.start_uninstall_module(ModuleInfo::new(name, ""), force, None)?;
            let status = wait_interruptible(op).await;
            print_status(&status)?;
            ensure(status.phase == UninstallPhase::Uninstalled, status.phase)
        }
        cli::Cmd::Update { source, force } => {
            let (module, archive) = module_from(source);
            let op = engine.start_update_module(module, archive, force, None)?;
            let status = wait_interruptible(op).await;
            print_status(&status)?;
            ensure(status.phase == UpdatePhase::Updated, status.phase)
        }
        cli::Cmd::Deb { path, dry_run } => {
            let action = if dry_run {
                PackageAction::DryRunDeb(path)
            } else {
                PackageAction::InstallDeb(path)
            };
            package(engine, action).await
        }
        cli::Cmd::Pkg { action } => {
            let action = match action {
                cli::PkgCmd::Refresh => PackageAction::RefreshIndex,
                cli::PkgCmd::Install { names } => PackageAction::Install(names),
                cli::PkgCmd::Remove { names, purge: false } => PackageAction::Remove(names),
                cli::PkgCmd::Remove { names, purge: true } => PackageAction::Purge(names),
            };
            package(engine, action).await
        }
        cli::Cmd::Extract {
            archive,
            destination,
        } => {
            let op = engine.start_extract(archive, destination, None)?;
            let status = wait_interruptible(op).await;
            print_status(&status)?;
            ensure(status.error.is_none(), status.phase)
        }
        cli::Cmd::Exec { command, timeout } => {
            let result = ProcessRunner::new()
                .run(&CommandSpec::shell(command), Duration::from_secs(timeout))
                .await?;
            print_status(&result)?;
            if !result.success() {
                bail!("command failed (exit code {:?}, killed: {})", result.exit_code, result.killed);
            }
            Ok(())
        }
        cli::Cmd::Cache { action } => match action {
            cli::CacheCmd::List => print_status(&engine.cached_files().await),
            cli::CacheCmd::Purge { all } => {
                let removed = engine.purge_files(all).await;
                info!("Removed {removed} file(s)");
                Ok(())
            }
        },
        cli::Cmd::Files { name } => {
            for path in engine.installed_files(&name)? {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

async fn package(engine: &InstallOrchestrator, action: PackageAction) -> Result<()> {
    let op = engine.start_package(action, None, None)?;
    let report = wait_interruptible(op).await;
    print_status(&report)?;
    ensure(report.state == PackageState::Done, report.state)
}

fn module_from(source: cli::ModuleSource) -> (ModuleInfo, Option<PathBuf>) {
    let mut module = ModuleInfo::new(source.name, source.version);
    module.url = source.url;
    module.checksums = Checksums {
        sha1: source.sha1,
        sha256: source.sha256,
        md5: source.md5,
    };
    (module, source.archive)
}

/// Wait for `op`, canceling it on Ctrl-C.
async fn wait_interruptible<T: OperationStatus>(op: Operation<T>) -> T {
    let cancel = op.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling the running operation");
            cancel.cancel();
        }
    });
    let status = op.wait().await;
    interrupt.abort();
    status
}

/// Log each step change of an install run.
fn step_logger() -> Publisher<pkgwarden::InstallStatus> {
    let last = std::sync::Mutex::new(None::<String>);
    Arc::new(move |s: &pkgwarden::InstallStatus| {
        let mut last = last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if s.step.is_some() && *last != s.step {
            info!("{}: {}", s.module, s.step.as_deref().unwrap_or_default());
            *last = s.step.clone();
        }
    })
}

fn print_status<T: Serialize>(status: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(status).context("Failed to serialize status")?;
    println!("{json}");
    Ok(())
}

fn ensure(ok: bool, outcome: impl std::fmt::Debug) -> Result<()> {
    if !ok {
        bail!("operation ended {outcome:?}");
    }
    Ok(())
}
