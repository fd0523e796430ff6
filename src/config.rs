use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top‑level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub download: DownloadConfig,
    pub write_guard: WriteGuardConfig,
    pub packages: PackageConfig,
    pub modules: ModuleConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Where module files land and where install bookkeeping lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Destination of archive entries under `backend/`.
    pub backend_dir: PathBuf,
    /// Destination of archive entries under `frontend/`.
    pub frontend_dir: PathBuf,
    /// One sub-directory per installed module (install log, uninstall scripts).
    pub install_root: PathBuf,
    /// Downloads, cache entries and extraction directories.
    pub temp_dir: PathBuf,
    /// Platform core library prefixes. Never overwritten, never deleted.
    pub protected_paths: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backend_dir: "/opt/pkgwarden/backend".into(),
            frontend_dir: "/opt/pkgwarden/frontend".into(),
            install_root: "/var/lib/pkgwarden/install".into(),
            temp_dir: std::env::temp_dir(),
            protected_paths: vec![
                "/opt/pkgwarden/backend/core".into(),
                "/opt/pkgwarden/backend/libs".into(),
                "/opt/pkgwarden/frontend/core".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub download_prefix: String,
    pub cache_prefix: String,
    pub connect_timeout_secs: u64,
    /// Abort when no bytes arrive for this long.
    pub inactivity_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_prefix: "pkgwarden_dl".into(),
            cache_prefix: "pkgwarden_cache".into(),
            connect_timeout_secs: 30,
            inactivity_timeout_secs: 300,
            user_agent: concat!("pkgwarden/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl DownloadConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteGuardConfig {
    /// When false, remount commands are never issued (development hosts).
    pub enabled: bool,
    pub debounce_secs: u64,
    pub root_writable_cmd: String,
    pub root_readonly_cmd: String,
    pub boot_writable_cmd: String,
    pub boot_readonly_cmd: String,
}

impl Default for WriteGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_secs: 10,
            root_writable_cmd: "/bin/mount -o remount,rw /".into(),
            root_readonly_cmd: "/bin/mount -o remount,ro /".into(),
            boot_writable_cmd: "/bin/mount -o remount,rw /boot".into(),
            boot_readonly_cmd: "/bin/mount -o remount,ro /boot".into(),
        }
    }
}

impl WriteGuardConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Hard ceiling on any OS package command.
    pub watchdog_secs: u64,
    pub dpkg: String,
    pub apt_get: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            watchdog_secs: 3600,
            dpkg: "dpkg".into(),
            apt_get: "apt-get".into(),
        }
    }
}

impl PackageConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Lifecycle scripts still running after this long are killed (exit code 130).
    pub script_timeout_secs: u64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            script_timeout_secs: 1800,
        }
    }
}

impl ModuleConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// When set, reports are also written as JSON files here.
    pub report_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Read the config at `path`, writing the defaults there first when it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let default_toml = toml::to_string_pretty(&EngineConfig::default())
                .map_err(|e| EngineError::Config(format!("Failed to serialize default config: {e}")))?;
            fs::write(path, default_toml)?;
        }

        let content = fs::read_to_string(path)?;
        let cfg: EngineConfig = toml::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("backend_dir", &self.paths.backend_dir),
            ("frontend_dir", &self.paths.frontend_dir),
            ("install_root", &self.paths.install_root),
        ] {
            if !dir.is_absolute() {
                return Err(EngineError::Config(format!(
                    "paths.{name} must be absolute: {}",
                    dir.display()
                )));
            }
        }
        if self.download.download_prefix.is_empty() || self.download.cache_prefix.is_empty() {
            return Err(EngineError::Config(
                "download prefixes must not be empty".into(),
            ));
        }
        if self.download.download_prefix == self.download.cache_prefix {
            return Err(EngineError::Config(
                "download.download_prefix and download.cache_prefix must differ".into(),
            ));
        }
        if self.packages.watchdog_secs == 0 {
            return Err(EngineError::Config("packages.watchdog_secs must be > 0".into()));
        }
        if self.modules.script_timeout_secs == 0 {
            return Err(EngineError::Config(
                "modules.script_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
