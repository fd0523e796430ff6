//! Archive extraction for module artifacts and ad-hoc extract requests.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use serde::Serialize;
use tar::Archive;
use zip::ZipArchive;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect by file name, falling back to the leading magic bytes.
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            return Ok(ArchiveFormat::Zip);
        }
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Ok(ArchiveFormat::TarGz);
        }

        let mut magic = [0u8; 4];
        let read = File::open(path)
            .and_then(|mut f| f.read(&mut magic))
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let magic = &magic[..read];
        if magic.starts_with(ZIP_MAGIC) {
            Ok(ArchiveFormat::Zip)
        } else if magic.starts_with(GZIP_MAGIC) {
            Ok(ArchiveFormat::TarGz)
        } else {
            Err(anyhow!("Unsupported archive format: {}", path.display()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub format: ArchiveFormat,
    pub destination: PathBuf,
    /// Regular files written.
    pub files: usize,
}

/// Extract `archive` into `dest`, creating it when needed.
///
/// Entries that would land outside `dest` abort the extraction.
pub async fn extract(archive: &Path, dest: &Path) -> Result<ExtractReport> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    // CPU-bound decompression stays off the async workers.
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .context("Extraction task failed")?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<ExtractReport> {
    let format = ArchiveFormat::detect(archive)?;
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let files = match format {
        ArchiveFormat::Zip => extract_zip(archive, dest),
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
    }
    .with_context(|| format!("Failed to extract {}", archive.display()))?;

    info!(
        "Extracted {files} file(s) from {} into {}",
        archive.display(),
        dest.display()
    );
    Ok(ExtractReport {
        format,
        destination: dest.to_path_buf(),
        files,
    })
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut files = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("Entry '{}' escapes the destination", entry.name());
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o777))?;
        }
        debug!("Extracted {}", out.display());
        files += 1;
    }
    Ok(files)
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<usize> {
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    let mut files = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let is_file = entry.header().entry_type().is_file();
        let path = entry.path()?.into_owned();
        if !entry.unpack_in(dest)? {
            bail!("Entry '{}' escapes the destination", path.display());
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(0o755);
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn zip_entries_land_under_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("module.zip");
        write_zip(
            &archive,
            &[
                ("backend/weather/main.py", b"print('hi')"),
                ("scripts/postinst", b"#!/bin/sh\nexit 0\n"),
            ],
        );

        let dest = dir.path().join("out");
        let report = extract(&archive, &dest).await.unwrap();

        assert_eq!(report.format, ArchiveFormat::Zip);
        assert_eq!(report.files, 2);
        assert_eq!(
            fs::read(dest.join("backend/weather/main.py")).unwrap(),
            b"print('hi')"
        );
        let mode = fs::metadata(dest.join("scripts/postinst"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn tar_gz_is_detected_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("artifact.bin");
        {
            let encoder =
                flate2::write::GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::fast());
            let mut builder = tar::Builder::new(encoder);
            let body = b"ui";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "frontend/weather/index.html", &body[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = dir.path().join("out");
        let report = extract(&archive, &dest).await.unwrap();
        assert_eq!(report.format, ArchiveFormat::TarGz);
        assert_eq!(report.files, 1);
        assert!(dest.join("frontend/weather/index.html").is_file());
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("notes.txt");
        fs::write(&archive, b"plain text").unwrap();

        assert!(extract(&archive, &dir.path().join("out")).await.is_err());
    }
}
