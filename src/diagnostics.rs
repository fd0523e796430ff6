//! Diagnostic reports for unexpected failures (internal errors, watchdog kills).

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::Serialize;
use serde_json::Value;

/// One unexpected failure with enough context to investigate it later.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    /// Component that raised the report, e.g. `module-installer`.
    pub source: String,
    pub message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticReport {
    pub fn new(source: impl Into<String>, message: impl Into<String>, context: Value) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, report: &DiagnosticReport);
}

/// Writes reports to the error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn report(&self, report: &DiagnosticReport) {
        match serde_json::to_string(report) {
            Ok(json) => error!("[{}] {}: {json}", report.source, report.message),
            Err(_) => error!("[{}] {}", report.source, report.message),
        }
    }
}

/// Logs reports and keeps a JSON copy of each in `dir`.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DiagnosticsSink for FileSink {
    fn report(&self, report: &DiagnosticReport) {
        LogSink.report(report);

        let name = format!(
            "report-{}-{}.json",
            report.timestamp.format("%Y%m%dT%H%M%S"),
            uuid::Uuid::new_v4()
        );
        let path = self.dir.join(name);
        let written = fs::create_dir_all(&self.dir).and_then(|()| {
            let body = serde_json::to_vec_pretty(report).map_err(std::io::Error::other)?;
            fs::write(&path, body)
        });
        if let Err(e) = written {
            warn!("Failed to persist diagnostic report to {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_sink_persists_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("reports"));

        sink.report(&DiagnosticReport::new(
            "package-installer",
            "watchdog expired",
            json!({ "command": "dpkg -i foo.deb" }),
        ));

        let entries: Vec<_> = fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(entries.len(), 1);
        let body: Value =
            serde_json::from_slice(&fs::read(entries[0].path()).unwrap()).unwrap();
        assert_eq!(body["source"], "package-installer");
        assert_eq!(body["context"]["command"], "dpkg -i foo.deb");
    }
}
