//! Copying module payloads into place and removing them again.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use super::install_log::InstallLog;
use crate::config::PathsConfig;

const BACKEND_PREFIX: &str = "backend";
const FRONTEND_PREFIX: &str = "frontend";

/// Where an archive entry is installed, if anywhere.
pub(crate) fn destination(paths: &PathsConfig, relative: &Path) -> Option<PathBuf> {
    let mut components = relative.components();
    let root = match components.next()? {
        Component::Normal(first) if first == BACKEND_PREFIX => &paths.backend_dir,
        Component::Normal(first) if first == FRONTEND_PREFIX => &paths.frontend_dir,
        _ => return None,
    };
    let rest = components.as_path();
    if rest.as_os_str().is_empty()
        || !rest.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(rest))
}

pub(crate) fn is_protected(paths: &PathsConfig, path: &Path) -> bool {
    paths.protected_paths.iter().any(|p| path.starts_with(p))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct CopySummary {
    pub copied: usize,
    pub overwritten: usize,
    pub refused: usize,
    pub ignored: usize,
}

/// Copy `backend/` and `frontend/` from `extract_dir` into place.
///
/// Every destination is appended to `log` before it is written, so the log
/// covers partially written files too. Protected destinations are refused.
pub(crate) fn copy_module_files(
    extract_dir: &Path,
    paths: &PathsConfig,
    log: &mut InstallLog,
) -> Result<CopySummary> {
    let mut summary = CopySummary::default();
    let walker = WalkDir::new(extract_dir).min_depth(1).sort_by_file_name();
    for entry in walker {
        let entry = entry.context("Failed to walk extracted archive")?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(extract_dir)
            .context("Walked outside the extraction directory")?;
        let Some(dest) = destination(paths, relative) else {
            debug!("Not installing {}", relative.display());
            summary.ignored += 1;
            continue;
        };
        if is_protected(paths, &dest) {
            warn!("Refusing to install over core path {}", dest.display());
            summary.refused += 1;
            continue;
        }
        let existing = fs::symlink_metadata(&dest).ok();
        if existing.as_ref().is_some_and(fs::Metadata::is_dir) {
            bail!(
                "{} is an existing directory, refusing to replace it with {}",
                dest.display(),
                relative.display()
            );
        }
        let exists = existing.is_some();
        if exists {
            warn!("Overwriting existing {}", dest.display());
            summary.overwritten += 1;
        }

        log.append(&dest)
            .with_context(|| format!("Failed to record {} in the install log", dest.display()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            if exists {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(&target, &dest)
                .with_context(|| format!("Failed to link {}", dest.display()))?;
        } else {
            fs::copy(entry.path(), &dest).with_context(|| {
                format!("Failed to copy {} to {}", relative.display(), dest.display())
            })?;
        }
        summary.copied += 1;
    }
    info!(
        "Copied {} file(s) ({} overwritten, {} refused, {} ignored)",
        summary.copied, summary.overwritten, summary.refused, summary.ignored
    );
    Ok(summary)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RemoveSummary {
    pub removed: usize,
    pub missing: usize,
    pub refused: usize,
    pub failed: usize,
}

/// Delete every logged path, then prune directories left empty. Directory
/// entries are skipped and counted as refused.
///
/// Without `force` the first removal error aborts; with it errors are
/// counted and skipped.
pub(crate) fn remove_installed_files(
    paths: &PathsConfig,
    entries: &[PathBuf],
    force: bool,
) -> Result<RemoveSummary> {
    let mut summary = RemoveSummary::default();
    let mut parents = BTreeSet::new();
    for path in entries {
        if is_protected(paths, path) {
            warn!("Refusing to remove core path {}", path.display());
            summary.refused += 1;
            continue;
        }
        // Logged entries are files or links; a directory there belongs to someone else.
        let removed = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => {
                warn!("{} is a directory, not removing it", path.display());
                summary.refused += 1;
                continue;
            }
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => {
                debug!("Removed {}", path.display());
                summary.removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("{} is already gone", path.display());
                summary.missing += 1;
            }
            Err(e) if force => {
                warn!("Failed to remove {}: {e}", path.display());
                summary.failed += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
        if let Some(parent) = path.parent() {
            parents.insert(parent.to_path_buf());
        }
    }
    prune_empty_parents(paths, parents);
    info!(
        "Removed {} file(s) ({} missing, {} refused, {} failed)",
        summary.removed, summary.missing, summary.refused, summary.failed
    );
    Ok(summary)
}

/// Remove empty directories up to, not including, the backend/frontend roots.
fn prune_empty_parents(paths: &PathsConfig, dirs: BTreeSet<PathBuf>) {
    let roots = [&paths.backend_dir, &paths.frontend_dir];
    // Reverse order visits children before their parents.
    for dir in dirs.into_iter().rev() {
        let mut current = dir.as_path();
        while roots.iter().any(|root| current.starts_with(root) && current != root.as_path())
            && !is_protected(paths, current)
        {
            if fs::remove_dir(current).is_err() {
                break;
            }
            debug!("Removed empty directory {}", current.display());
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path) -> PathsConfig {
        PathsConfig {
            backend_dir: root.join("backend"),
            frontend_dir: root.join("frontend"),
            install_root: root.join("install"),
            temp_dir: root.join("tmp"),
            protected_paths: vec![root.join("backend/core")],
        }
    }

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn destinations_follow_top_level_prefix() {
        let p = paths(Path::new("/srv"));
        assert_eq!(
            destination(&p, Path::new("backend/weather/main.py")),
            Some(PathBuf::from("/srv/backend/weather/main.py"))
        );
        assert_eq!(
            destination(&p, Path::new("frontend/weather.js")),
            Some(PathBuf::from("/srv/frontend/weather.js"))
        );
        assert_eq!(destination(&p, Path::new("scripts/postinst")), None);
        assert_eq!(destination(&p, Path::new("backend")), None);
        assert_eq!(destination(&p, Path::new("README")), None);
    }

    #[test]
    fn copy_logs_files_and_refuses_core_paths() {
        let root = tempfile::tempdir().unwrap();
        let p = paths(root.path());
        let extract = root.path().join("extract");
        write(&extract.join("backend/weather/main.py"), "new");
        write(&extract.join("backend/core/lib.py"), "evil");
        write(&extract.join("frontend/weather/index.html"), "ui");
        write(&extract.join("scripts/postinst"), "#!/bin/sh\n");
        write(&p.backend_dir.join("weather/main.py"), "old");

        let mut log = InstallLog::open(&InstallLog::path_in(&p.install_root.join("weather"))).unwrap();
        let summary = copy_module_files(&extract, &p, &mut log).unwrap();

        assert_eq!(summary.copied, 2);
        assert_eq!(summary.overwritten, 1);
        assert_eq!(summary.refused, 1);
        assert_eq!(summary.ignored, 1);
        assert_eq!(fs::read_to_string(p.backend_dir.join("weather/main.py")).unwrap(), "new");
        assert!(!p.backend_dir.join("core/lib.py").exists());
        assert_eq!(
            log.entries(),
            &[
                p.backend_dir.join("weather/main.py"),
                p.frontend_dir.join("weather/index.html"),
            ]
        );
    }

    #[test]
    fn removal_prunes_empty_dirs_and_skips_core() {
        let root = tempfile::tempdir().unwrap();
        let p = paths(root.path());
        let file = p.backend_dir.join("weather/deep/a.py");
        let core = p.backend_dir.join("core/lib.py");
        write(&file, "a");
        write(&core, "core");

        let summary = remove_installed_files(
            &p,
            &[file.clone(), core.clone(), p.backend_dir.join("gone.py")],
            false,
        )
        .unwrap();

        assert_eq!(summary.removed, 1);
        assert_eq!(summary.refused, 1);
        assert_eq!(summary.missing, 1);
        assert!(!p.backend_dir.join("weather").exists());
        assert!(p.backend_dir.exists());
        assert!(core.exists());
    }

    #[test]
    fn directory_destination_fails_before_logging() {
        let root = tempfile::tempdir().unwrap();
        let p = paths(root.path());
        let extract = root.path().join("extract");
        write(&extract.join("backend/aaa.py"), "first");
        write(&extract.join("backend/other"), "not a dir");
        let precious = p.backend_dir.join("other/precious.py");
        write(&precious, "keep");

        let log_path = InstallLog::path_in(&p.install_root.join("weather"));
        let mut log = InstallLog::open(&log_path).unwrap();
        let err = copy_module_files(&extract, &p, &mut log).unwrap_err();

        assert!(format!("{err:#}").contains("existing directory"), "{err:#}");
        assert_eq!(log.entries(), &[p.backend_dir.join("aaa.py")]);
        assert_eq!(fs::read_to_string(&precious).unwrap(), "keep");
    }

    #[test]
    fn directory_entries_are_never_removed() {
        let root = tempfile::tempdir().unwrap();
        let p = paths(root.path());
        let precious = p.backend_dir.join("other/precious.py");
        write(&precious, "keep");

        let summary =
            remove_installed_files(&p, &[p.backend_dir.join("other")], true).unwrap();

        assert_eq!(summary.refused, 1);
        assert_eq!(summary.removed, 0);
        assert!(precious.exists());
    }

    #[test]
    fn forced_removal_counts_failures_and_continues() {
        let root = tempfile::tempdir().unwrap();
        let p = paths(root.path());
        // A path below a regular file cannot be stat'ed or removed (ENOTDIR).
        let blocker = p.backend_dir.join("weather/blocker");
        write(&blocker, "file");
        let stuck = blocker.join("child.py");
        let file = p.backend_dir.join("weather/app.py");
        write(&file, "a");

        let summary = remove_installed_files(&p, &[stuck.clone(), file.clone()], true).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.removed, 1);
        assert!(!file.exists());

        let err = remove_installed_files(&p, &[stuck], false).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to remove"), "{err:#}");
    }
}
