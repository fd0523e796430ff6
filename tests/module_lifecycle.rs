use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pkgwarden::config::EngineConfig;
use pkgwarden::diagnostics::LogSink;
use pkgwarden::download::Checksums;
use pkgwarden::{
    EngineError, GuardedFs, InstallOrchestrator, InstallPhase, ModuleInfo, Remounter,
    UninstallPhase, UpdatePhase, WriteGuard,
};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

#[derive(Default)]
struct CountingRemounter {
    writable: AtomicUsize,
    readonly: AtomicUsize,
}

impl Remounter for CountingRemounter {
    fn remount(&self, _fs: GuardedFs, writable: bool) -> anyhow::Result<()> {
        if writable {
            self.writable.fetch_add(1, Ordering::SeqCst);
        } else {
            self.readonly.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct Fixture {
    root: tempfile::TempDir,
    config: EngineConfig,
    remounter: Arc<CountingRemounter>,
    engine: InstallOrchestrator,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path();
        let mut config = EngineConfig::default();
        config.paths.backend_dir = base.join("backend");
        config.paths.frontend_dir = base.join("frontend");
        config.paths.install_root = base.join("install");
        config.paths.temp_dir = base.join("tmp");
        config.paths.protected_paths = vec![base.join("backend/core")];
        fs::create_dir_all(&config.paths.temp_dir).unwrap();

        let remounter = Arc::new(CountingRemounter::default());
        let guard = WriteGuard::new(remounter.clone(), Duration::from_millis(50));
        let engine = InstallOrchestrator::with_parts(&config, guard, Arc::new(LogSink)).unwrap();
        Self {
            root,
            config,
            remounter,
            engine,
        }
    }

    fn backend(&self, rel: &str) -> PathBuf {
        self.config.paths.backend_dir.join(rel)
    }

    fn frontend(&self, rel: &str) -> PathBuf {
        self.config.paths.frontend_dir.join(rel)
    }

    fn install_dir(&self, module: &str) -> PathBuf {
        self.config.paths.install_root.join(module)
    }

    fn archive(&self, name: &str, entries: &[(&str, &str)]) -> PathBuf {
        let path = self.root.path().join(name);
        write_zip(&path, entries);
        path
    }
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o755);
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

const PAYLOAD: &[(&str, &str)] = &[
    ("backend/weather/app.py", "print('weather')\n"),
    ("backend/weather/lib/util.py", "X = 1\n"),
    ("frontend/weather/index.html", "<html></html>\n"),
];

fn with_scripts<'a>(scripts: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut entries = PAYLOAD.to_vec();
    entries.extend_from_slice(scripts);
    entries
}

fn module() -> ModuleInfo {
    ModuleInfo::new("weather", "1.0.0")
}

#[tokio::test]
async fn install_logs_every_file_and_uninstall_is_not_repeatable() {
    let fx = Fixture::new();
    let archive = fx.archive(
        "weather.zip",
        &with_scripts(&[
            ("scripts/postinst", "#!/bin/sh\necho \"installed $PKGWARDEN_MODULE\"\n"),
            ("scripts/postuninst", "#!/bin/sh\necho bye\n"),
        ]),
    );

    let status = fx.engine.install_module(module(), Some(archive)).await.unwrap();
    assert_eq!(status.phase, InstallPhase::Installed, "{status:?}");
    assert!(status.process_log.iter().any(|l| l.contains("installed weather")));
    assert!(fx.install_dir("weather").join("postuninst").is_file());

    let mut logged = fx.engine.installed_files("weather").unwrap();
    logged.sort();
    let mut expected = vec![
        fx.backend("weather/app.py"),
        fx.backend("weather/lib/util.py"),
        fx.frontend("weather/index.html"),
    ];
    expected.sort();
    assert_eq!(logged, expected);
    for path in &expected {
        assert!(path.is_file(), "{} missing", path.display());
    }

    let first = fx
        .engine
        .uninstall_module(module(), false)
        .await
        .unwrap();
    assert_eq!(first.phase, UninstallPhase::Uninstalled, "{first:?}");
    assert!(first.post_script.ran);
    for path in &expected {
        assert!(!path.exists(), "{} left behind", path.display());
    }
    assert!(!fx.install_dir("weather").exists());
    assert!(fx.engine.installed_files("weather").unwrap().is_empty());

    let second = fx
        .engine
        .uninstall_module(module(), false)
        .await
        .unwrap();
    assert_eq!(second.phase, UninstallPhase::ErrorRemove);
    assert!(
        second
            .error
            .as_deref()
            .is_some_and(|e| e.contains("install log not found")),
        "{second:?}"
    );
}

#[tokio::test]
async fn failing_postinst_rolls_back_files_and_install_dir() {
    let fx = Fixture::new();
    let archive = fx.archive(
        "weather.zip",
        &with_scripts(&[
            ("scripts/preuninst", "#!/bin/sh\nexit 0\n"),
            ("scripts/postinst", "#!/bin/sh\necho broken >&2\nexit 1\n"),
        ]),
    );

    let status = fx.engine.install_module(module(), Some(archive)).await.unwrap();

    assert_eq!(status.phase, InstallPhase::ErrorPostInstall);
    assert_eq!(status.post_script.exit_code, Some(1));
    assert!(status.post_script.stderr.iter().any(|l| l == "broken"));
    assert!(!fx.backend("weather/app.py").exists());
    assert!(!fx.frontend("weather/index.html").exists());
    assert!(!fx.backend("weather").exists());
    assert!(!fx.install_dir("weather").exists());
}

#[tokio::test]
async fn core_paths_are_never_installed_over() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.backend("core")).unwrap();
    fs::write(fx.backend("core/platform.py"), "original").unwrap();
    let archive = fx.archive(
        "weather.zip",
        &with_scripts(&[("backend/core/platform.py", "replaced")]),
    );

    let status = fx.engine.install_module(module(), Some(archive)).await.unwrap();

    assert_eq!(status.phase, InstallPhase::Installed);
    assert_eq!(fs::read_to_string(fx.backend("core/platform.py")).unwrap(), "original");
    assert!(!fx
        .engine
        .installed_files("weather")
        .unwrap()
        .contains(&fx.backend("core/platform.py")));
}

#[tokio::test]
async fn forced_uninstall_without_log_succeeds() {
    let fx = Fixture::new();

    let status = fx
        .engine
        .uninstall_module(ModuleInfo::new("never-installed", "0.1"), true)
        .await
        .unwrap();

    assert_eq!(status.phase, UninstallPhase::Uninstalled);
    assert!(!status.pre_script.ran);
}

#[tokio::test]
async fn update_proceeds_after_failed_uninstall() {
    let fx = Fixture::new();
    let old = fx.archive(
        "weather-1.zip",
        &with_scripts(&[("scripts/preuninst", "#!/bin/sh\nexit 3\n")]),
    );
    let installed = fx.engine.install_module(module(), Some(old)).await.unwrap();
    assert_eq!(installed.phase, InstallPhase::Installed);

    let new = fx.archive(
        "weather-2.zip",
        &[("backend/weather/app.py", "print('v2')\n")],
    );
    let status = fx
        .engine
        .update_module(ModuleInfo::new("weather", "2.0.0"), Some(new), false)
        .await
        .unwrap();

    assert_eq!(status.phase, UpdatePhase::Updated, "{status:?}");
    assert_eq!(status.uninstall.phase, UninstallPhase::ErrorPreUninstall);
    assert!(status.uninstall.updating);
    assert_eq!(status.install.phase, InstallPhase::Installed);
    assert!(status.install.updating);
    assert_eq!(
        fs::read_to_string(fx.backend("weather/app.py")).unwrap(),
        "print('v2')\n"
    );
}

#[tokio::test]
async fn second_operation_is_rejected_while_busy() {
    let fx = Fixture::new();
    let archive = fx.archive(
        "weather.zip",
        &with_scripts(&[("scripts/preinst", "#!/bin/sh\nsleep 1\n")]),
    );

    let running = fx
        .engine
        .start_install_module(module(), Some(archive), None)
        .unwrap();
    assert!(fx.engine.is_processing());

    let rejected = fx
        .engine
        .start_uninstall_module(ModuleInfo::new("other", "1"), true, None);
    assert!(matches!(rejected, Err(EngineError::Busy(_))));

    assert_eq!(running.wait().await.phase, InstallPhase::Installed);
    assert!(!fx.engine.is_processing());
    assert!(fx.engine.current_operation().is_none());
}

#[tokio::test]
async fn cancel_between_steps_rolls_back() {
    let fx = Fixture::new();
    let archive = fx.archive(
        "weather.zip",
        &with_scripts(&[("scripts/preinst", "#!/bin/sh\nsleep 1\n")]),
    );

    let op = fx
        .engine
        .start_install_module(module(), Some(archive), None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    op.cancel();
    let status = op.wait().await;

    assert_eq!(status.phase, InstallPhase::Canceled);
    assert!(status.pre_script.ran);
    assert!(!fx.backend("weather/app.py").exists());
    assert!(!fx.install_dir("weather").exists());
}

#[tokio::test]
async fn usage_errors_fail_before_anything_starts() {
    let fx = Fixture::new();

    let missing = fx
        .engine
        .start_install_module(module(), Some(fx.root.path().join("nope.zip")), None);
    assert!(matches!(missing, Err(ref e) if e.is_usage()));

    let no_source = fx.engine.start_install_module(module(), None, None);
    assert!(matches!(no_source, Err(ref e) if e.is_usage()));

    let bad_name = fx
        .engine
        .start_uninstall_module(ModuleInfo::new("../etc", "1"), true, None);
    assert!(matches!(bad_name, Err(ref e) if e.is_usage()));

    assert!(!fx.engine.is_processing());
    assert_eq!(fx.remounter.writable.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn write_access_is_bracketed_and_debounced() {
    let fx = Fixture::new();
    let archive = fx.archive("weather.zip", PAYLOAD);

    fx.engine
        .install_module(module(), Some(archive.clone()))
        .await
        .unwrap();
    fx.engine
        .install_module(module(), Some(archive))
        .await
        .unwrap();

    // Root and boot were each made writable once; the second run reused it.
    assert_eq!(fx.remounter.writable.load(Ordering::SeqCst), 2);
    assert_eq!(fx.engine.write_guard().references(GuardedFs::Root), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.remounter.readonly.load(Ordering::SeqCst), 2);
    assert!(!fx.engine.write_guard().is_writable(GuardedFs::Root));
}

#[tokio::test]
async fn downloaded_module_is_verified_and_cached() {
    let fx = Fixture::new();
    let zip_path = fx.archive("served.zip", PAYLOAD);
    let body = fs::read(&zip_path).unwrap();
    let digest = hex::encode(Sha256::digest(&body));

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/modules/weather-1.0.0.zip")
        .with_status(200)
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let mut info = module();
    info.url = Some(format!("{}/modules/weather-1.0.0.zip", server.url()));
    info.checksums = Checksums {
        sha256: Some(digest),
        ..Checksums::default()
    };

    let first = fx.engine.install_module(info.clone(), None).await.unwrap();
    assert_eq!(first.phase, InstallPhase::Installed, "{first:?}");
    assert_eq!(first.progress, Some(100));

    let again = fx.engine.install_module(info, None).await.unwrap();
    assert_eq!(again.phase, InstallPhase::Installed);
    mock.assert_async().await;

    let cached = fx.engine.cached_files().await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].name, "weather-1.0.0");
}

#[tokio::test]
async fn bad_checksum_fails_the_download_step() {
    let fx = Fixture::new();
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/weather.zip")
        .with_status(200)
        .with_body("not really a zip")
        .create_async()
        .await;

    let mut info = module();
    info.url = Some(format!("{}/weather.zip", server.url()));
    info.checksums = Checksums {
        sha1: Some("0".repeat(40)),
        ..Checksums::default()
    };

    let status = fx.engine.install_module(info, None).await.unwrap();
    assert_eq!(status.phase, InstallPhase::ErrorDownload);
    assert!(fx.engine.cached_files().await.is_empty());
    assert!(!fx.install_dir("weather").exists());
}

#[tokio::test]
async fn local_modules_touch_nothing_on_disk() {
    let fx = Fixture::new();
    let mut local = module();
    local.local = true;

    let installed = fx.engine.install_module(local.clone(), None).await.unwrap();
    assert_eq!(installed.phase, InstallPhase::Installed);
    assert!(!installed.pre_script.ran);
    assert!(!fx.install_dir("weather").exists());
    assert!(!fx.backend("weather").exists());

    let removed = fx.engine.uninstall_module(local, false).await.unwrap();
    assert_eq!(removed.phase, UninstallPhase::Uninstalled);
    assert!(!removed.pre_script.ran);
    assert!(!fx.install_dir("weather").exists());
}

#[tokio::test]
async fn forced_uninstall_survives_an_unremovable_entry() {
    let fx = Fixture::new();
    let archive = fx.archive("weather.zip", PAYLOAD);
    let installed = fx.engine.install_module(module(), Some(archive)).await.unwrap();
    assert_eq!(installed.phase, InstallPhase::Installed);

    // A logged path below a regular file can never be removed.
    fs::write(fx.backend("blocker"), "plain file").unwrap();
    let log_path = fx.install_dir("weather").join("install.log");
    let mut log = fs::OpenOptions::new().append(true).open(&log_path).unwrap();
    writeln!(log, "{}", fx.backend("blocker/child.py").display()).unwrap();
    drop(log);

    let strict = fx.engine.uninstall_module(module(), false).await.unwrap();
    assert_eq!(strict.phase, UninstallPhase::ErrorRemove, "{strict:?}");
    assert!(fx.install_dir("weather").exists());

    let forced = fx.engine.uninstall_module(module(), true).await.unwrap();
    assert_eq!(forced.phase, UninstallPhase::Uninstalled, "{forced:?}");
    assert!(!fx.backend("weather/app.py").exists());
    assert!(!fx.install_dir("weather").exists());
    assert!(fx.backend("blocker").is_file());
}

#[tokio::test]
async fn update_reports_a_failed_install_after_a_clean_uninstall() {
    let fx = Fixture::new();
    let old = fx.archive("weather-1.zip", PAYLOAD);
    let installed = fx.engine.install_module(module(), Some(old)).await.unwrap();
    assert_eq!(installed.phase, InstallPhase::Installed);

    let broken = fx.archive(
        "weather-2.zip",
        &with_scripts(&[("scripts/postinst", "#!/bin/sh\nexit 1\n")]),
    );
    let status = fx
        .engine
        .update_module(ModuleInfo::new("weather", "2.0.0"), Some(broken), false)
        .await
        .unwrap();

    assert_eq!(status.phase, UpdatePhase::ErrorInstall, "{status:?}");
    assert_eq!(status.uninstall.phase, UninstallPhase::Uninstalled);
    assert_eq!(status.install.phase, InstallPhase::ErrorPostInstall);
    assert!(status.error.is_some());
    assert!(!fx.backend("weather/app.py").exists());
    assert!(!fx.install_dir("weather").exists());
}

#[tokio::test]
async fn update_runs_old_uninstall_scripts_with_the_installed_version() {
    let fx = Fixture::new();
    let old = fx.archive(
        "weather-1.zip",
        &with_scripts(&[(
            "scripts/preuninst",
            "#!/bin/sh\necho \"removing $PKGWARDEN_VERSION\"\n",
        )]),
    );
    let installed = fx.engine.install_module(module(), Some(old)).await.unwrap();
    assert_eq!(installed.phase, InstallPhase::Installed);

    let new = fx.archive("weather-2.zip", PAYLOAD);
    let status = fx
        .engine
        .update_module(ModuleInfo::new("weather", "2.0.0"), Some(new), false)
        .await
        .unwrap();

    assert_eq!(status.phase, UpdatePhase::Updated, "{status:?}");
    assert_eq!(status.uninstall.version, "1.0.0");
    assert!(
        status.uninstall.process_log.iter().any(|l| l.contains("removing 1.0.0")),
        "{:?}",
        status.uninstall.process_log
    );
    assert_eq!(status.install.version, "2.0.0");
}
