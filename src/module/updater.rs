use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use super::{
    InstallPhase, InstallStatus, ModuleEnv, ModuleInfo, ModuleInstaller, ModuleUninstaller,
    UninstallPhase, UninstallStatus, UpdatePhase, UpdateStatus,
};
use crate::status::StatusCell;

/// Uninstall followed by install of the new version, strictly in sequence.
///
/// A failed uninstall is logged and the install still runs: leaving the old
/// version half removed is worse than installing over it.
#[derive(Clone)]
pub struct ModuleUpdater {
    installer: ModuleInstaller,
    uninstaller: ModuleUninstaller,
}

impl ModuleUpdater {
    pub fn new(env: ModuleEnv) -> Self {
        Self {
            installer: ModuleInstaller::new(env.clone()),
            uninstaller: ModuleUninstaller::new(env),
        }
    }

    pub async fn run(
        &self,
        module: &ModuleInfo,
        archive: Option<PathBuf>,
        force_uninstall: bool,
        status: &StatusCell<UpdateStatus>,
        cancel: &CancellationToken,
    ) -> UpdatePhase {
        status.update(|s| {
            s.phase = UpdatePhase::Running;
            s.error = None;
        });
        info!("Updating {} to {}", module.name, module.version);

        let mut uninstall_initial = UninstallStatus::new(module);
        uninstall_initial.updating = true;
        let parent = status.clone();
        let uninstall_status = StatusCell::with_publisher(
            uninstall_initial,
            Arc::new(move |s: &UninstallStatus| parent.update(|u| u.uninstall = s.clone())),
        );
        let uninstalled = self
            .uninstaller
            .run(module, force_uninstall, &uninstall_status, cancel)
            .await;

        match uninstalled {
            UninstallPhase::Uninstalled => {}
            UninstallPhase::Canceled => return finish(status, UpdatePhase::Canceled, None),
            other => warn!(
                "Uninstall of the installed {} ended {other:?}, installing {} anyway",
                module.name, module.version
            ),
        }

        let mut install_initial = InstallStatus::new(module);
        install_initial.updating = true;
        let parent = status.clone();
        let install_status = StatusCell::with_publisher(
            install_initial,
            Arc::new(move |s: &InstallStatus| parent.update(|u| u.install = s.clone())),
        );
        let installed = self
            .installer
            .run(module, archive, &install_status, cancel)
            .await;

        match installed {
            InstallPhase::Installed => finish(status, UpdatePhase::Updated, None),
            InstallPhase::Canceled => finish(status, UpdatePhase::Canceled, None),
            other => finish(
                status,
                UpdatePhase::ErrorInstall,
                Some(format!("install ended {other:?}")),
            ),
        }
    }
}

fn finish(status: &StatusCell<UpdateStatus>, phase: UpdatePhase, error: Option<String>) -> UpdatePhase {
    status.update(|s| {
        s.phase = phase;
        s.error = error;
    });
    info!("Update of {} finished: {phase:?}", status.snapshot().module);
    phase
}
