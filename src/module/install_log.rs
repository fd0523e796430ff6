use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LOG_FILE_NAME: &str = "install.log";

/// Append-only record of every path an install wrote, one absolute path per line.
#[derive(Debug)]
pub struct InstallLog {
    file: File,
    entries: Vec<PathBuf>,
}

impl InstallLog {
    pub fn path_in(install_dir: &Path) -> PathBuf {
        install_dir.join(LOG_FILE_NAME)
    }

    /// Open for appending, creating the file and its directory when missing.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            entries: Vec::new(),
        })
    }

    /// Record `entry` durably. Call before writing the file itself.
    pub fn append(&mut self, entry: &Path) -> io::Result<()> {
        let line = entry.to_str().filter(|s| !s.contains('\n')).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path cannot be logged: {}", entry.display()),
            )
        })?;
        if !entry.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("install log entries must be absolute: {line}"),
            ));
        }
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        self.entries.push(entry.to_path_buf());
        Ok(())
    }

    /// Paths appended through this handle.
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Read back every entry of the log at `path`, skipping blank lines.
    pub fn read(path: &Path) -> io::Result<Vec<PathBuf>> {
        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_entries_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = InstallLog::path_in(&dir.path().join("weather"));

        let mut log = InstallLog::open(&path).unwrap();
        log.append(Path::new("/opt/backend/weather/a.py")).unwrap();
        log.append(Path::new("/opt/frontend/weather/index.html")).unwrap();
        drop(log);

        let mut log = InstallLog::open(&path).unwrap();
        log.append(Path::new("/opt/backend/weather/b.py")).unwrap();
        assert_eq!(log.entries().len(), 1);

        let entries = InstallLog::read(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("/opt/backend/weather/a.py"),
                PathBuf::from("/opt/frontend/weather/index.html"),
                PathBuf::from("/opt/backend/weather/b.py"),
            ]
        );
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn relative_and_multiline_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = InstallLog::open(&InstallLog::path_in(dir.path())).unwrap();

        assert!(log.append(Path::new("relative/file")).is_err());
        assert!(log.append(Path::new("/opt/evil\nname")).is_err());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn missing_log_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = InstallLog::read(&dir.path().join("install.log")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
