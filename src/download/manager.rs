use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Context};
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::cache::{self, PART_SUFFIX};
use super::checksum::Verifier;
use super::{
    CachedFile, DownloadOutcome, DownloadProgress, DownloadRequest, DownloadState,
    ProgressCallback,
};
use crate::config::DownloadConfig;
use crate::error::{EngineError, Result};

/// Progress is reported at least this often when the size is unknown.
const UNKNOWN_SIZE_CHUNK_THRESHOLD: u64 = 256 * 1024;
/// Percent granularity of progress reports when the size is known.
const PERCENT_STEP: u64 = 5;

/// Downloads into one directory. Cheap to clone; clones share the cancel slot.
#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    dir: PathBuf,
    config: DownloadConfig,
    parent: Option<CancellationToken>,
    current: Arc<Mutex<CancellationToken>>,
}

impl DownloadManager {
    pub fn new(dir: impl Into<PathBuf>, config: DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            dir: dir.into(),
            config,
            parent: None,
            current: Arc::new(Mutex::new(CancellationToken::new())),
        })
    }

    /// A manager whose downloads are also canceled by `token`.
    pub fn with_cancel_token(&self, token: CancellationToken) -> Self {
        Self {
            parent: Some(token),
            current: Arc::new(Mutex::new(CancellationToken::new())),
            ..self.clone()
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cancel the download in flight. Checked at every chunk and while waiting on the network.
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.dir.join(cache::cache_name(&self.config.cache_prefix, key))
    }

    /// Fetch a small document fully into memory.
    pub async fn download_content(&self, url: &str) -> Result<(DownloadState, Option<Vec<u8>>)> {
        validate_url(url)?;
        let token = self.fresh_token();
        let fetched = tokio::select! {
            () = token.cancelled() => return Ok((DownloadState::Canceled, None)),
            fetched = self.fetch_bytes(url) => fetched,
        };
        match fetched {
            Ok(body) => Ok((DownloadState::Done, Some(body))),
            Err(e) => {
                warn!("Download of {url} failed: {e:#}");
                Ok((DownloadState::Error, None))
            }
        }
    }

    async fn fetch_bytes(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;
        if response.status() != StatusCode::OK {
            bail!("Server answered {}", response.status());
        }
        let body = timeout(self.config.inactivity_timeout(), response.bytes())
            .await
            .map_err(|_| anyhow!("No data received for {:?}", self.config.inactivity_timeout()))??;
        Ok(body.to_vec())
    }

    /// Stream `request.url` to disk, verify it and move it to its final name.
    ///
    /// With a cache key and an existing entry, returns `Cached` without any
    /// network traffic. Usage errors are returned as `Err`; every other failure
    /// is a terminal `DownloadState` and leaves no final file behind.
    pub async fn download_file(
        &self,
        request: &DownloadRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        validate_request(request)?;
        let token = self.fresh_token();
        let mut reporter = Reporter::new(progress);

        if let Some(key) = &request.cache_key {
            let cached = self.cache_path(key);
            if tokio::fs::metadata(&cached).await.is_ok_and(|m| m.is_file()) {
                info!("Using cached {key} at {}", cached.display());
                reporter.finish(DownloadState::Cached, 0);
                return Ok(DownloadOutcome {
                    state: DownloadState::Cached,
                    path: Some(cached),
                    downloaded: 0,
                });
            }
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let name = cache::download_name(&self.config.download_prefix);
        let part = self.dir.join(format!("{name}{PART_SUFFIX}"));
        let target = match &request.cache_key {
            Some(key) => self.cache_path(key),
            None => self.dir.join(&name),
        };

        let (mut state, downloaded) = match self.transfer(request, &part, &token, &mut reporter).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Download of {} failed: {e:#}", request.url);
                (DownloadState::Error, reporter.downloaded)
            }
        };

        let mut path = None;
        if state == DownloadState::Done {
            match tokio::fs::rename(&part, &target).await {
                Ok(()) => path = Some(target),
                Err(e) => {
                    warn!(
                        "Failed to move {} to {}: {e}",
                        part.display(),
                        target.display()
                    );
                    state = DownloadState::Error;
                }
            }
        }
        if path.is_none() {
            remove_quietly(&part).await;
        }

        reporter.finish(state, downloaded);
        debug!("Download of {} ended {state:?} ({downloaded} bytes)", request.url);
        Ok(DownloadOutcome {
            state,
            path,
            downloaded,
        })
    }

    async fn transfer(
        &self,
        request: &DownloadRequest,
        part: &Path,
        token: &CancellationToken,
        reporter: &mut Reporter,
    ) -> anyhow::Result<(DownloadState, u64)> {
        let mut verifier = request.checksums.verifier();

        let response = tokio::select! {
            () = token.cancelled() => return Ok((DownloadState::Canceled, 0)),
            response = self.client.get(&request.url).send() => {
                response.with_context(|| format!("Request to {} failed", request.url))?
            }
        };
        if response.status() != StatusCode::OK {
            bail!("Server answered {}", response.status());
        }

        reporter.start(response.content_length());
        let mut file = tokio::fs::File::create(part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;
        let inactivity = self.config.inactivity_timeout();
        let mut stream = response.bytes_stream();

        loop {
            if token.is_cancelled() {
                return Ok((DownloadState::Canceled, reporter.downloaded));
            }
            let chunk = tokio::select! {
                () = token.cancelled() => return Ok((DownloadState::Canceled, reporter.downloaded)),
                next = timeout(inactivity, stream.next()) => match next {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(Some(Err(e))) => return Err(e.into()),
                    Ok(None) => break,
                    Err(_) => bail!(
                        "No data received for {} seconds after {} bytes",
                        inactivity.as_secs(),
                        reporter.downloaded
                    ),
                },
            };
            file.write_all(&chunk).await?;
            if let Some(verifier) = verifier.as_mut() {
                verifier.update(&chunk);
            }
            reporter.advance(chunk.len() as u64);
        }
        file.flush().await?;
        drop(file);

        let downloaded = reporter.downloaded;
        if let Some(total) = reporter.size_mismatch() {
            warn!("{}: expected {total} bytes, received {downloaded}", request.url);
            return Ok((DownloadState::ErrorInvalidSize, downloaded));
        }
        if let Some(verifier) = verifier {
            let algorithm = verifier.algorithm();
            if let Err(actual) = verifier.finish() {
                warn!("{}: {algorithm} mismatch, got {actual}", request.url);
                return Ok((DownloadState::ErrorBadChecksum, downloaded));
            }
        }
        Ok((DownloadState::Done, downloaded))
    }

    /// `download_file` on a background task; `on_end` receives the outcome.
    pub fn download_file_async<F>(
        &self,
        request: DownloadRequest,
        progress: Option<ProgressCallback>,
        on_end: F,
    ) -> Result<JoinHandle<DownloadOutcome>>
    where
        F: FnOnce(&DownloadOutcome) + Send + 'static,
    {
        validate_request(&request)?;
        let manager = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = match manager.download_file(&request, progress).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Download of {} failed: {e}", request.url);
                    DownloadOutcome {
                        state: DownloadState::Error,
                        path: None,
                        downloaded: 0,
                    }
                }
            };
            on_end(&outcome);
            outcome
        }))
    }

    /// Delete plain downloads and, with `all`, cache entries too. Returns how many files went.
    pub async fn purge_files(&self, all: bool) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {}: {e}", self.dir.display());
                return 0;
            }
        };
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to list {}: {e}", self.dir.display());
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let wanted = cache::is_download_name(&self.config.download_prefix, &name)
                || (all && cache::decode_cache_name(&self.config.cache_prefix, &name).is_some());
            if !wanted {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {e}", entry.path().display()),
            }
        }
        info!("Purged {removed} download file(s) from {}", self.dir.display());
        removed
    }

    pub async fn cached_files(&self) -> Vec<CachedFile> {
        let mut files = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return files;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = cache::decode_cache_name(&self.config.cache_prefix, &file_name) else {
                continue;
            };
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            files.push(CachedFile {
                name,
                path: entry.path(),
                size,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| EngineError::usage(format!("Invalid URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(EngineError::usage(format!(
            "Unsupported URL scheme '{other}' in {url}"
        ))),
    }
}

fn validate_request(request: &DownloadRequest) -> Result<()> {
    validate_url(&request.url)?;
    if request.cache_key.as_deref().is_some_and(str::is_empty) {
        return Err(EngineError::usage("cache key must not be empty"));
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {e}", path.display());
    }
}

/// Throttles progress callbacks: every 5% with a known size, every 256 KiB otherwise.
struct Reporter {
    callback: Option<ProgressCallback>,
    total: Option<u64>,
    downloaded: u64,
    last_step: u64,
    last_bytes: u64,
}

impl Reporter {
    fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            total: None,
            downloaded: 0,
            last_step: 0,
            last_bytes: 0,
        }
    }

    fn running_state(&self) -> DownloadState {
        if self.total.is_some() {
            DownloadState::Downloading
        } else {
            DownloadState::DownloadingUnknownSize
        }
    }

    fn percent(&self) -> Option<u64> {
        match self.total {
            Some(0) => Some(100),
            Some(total) => Some((self.downloaded.saturating_mul(100) / total).min(100)),
            None => None,
        }
    }

    fn start(&mut self, total: Option<u64>) {
        self.total = total;
        self.emit(self.running_state());
    }

    fn advance(&mut self, bytes: u64) {
        self.downloaded += bytes;
        let due = match self.percent() {
            Some(percent) => {
                let step = percent / PERCENT_STEP;
                let due = step > self.last_step;
                if due {
                    self.last_step = step;
                }
                due
            }
            None => {
                let due = self.downloaded - self.last_bytes >= UNKNOWN_SIZE_CHUNK_THRESHOLD;
                if due {
                    self.last_bytes = self.downloaded;
                }
                due
            }
        };
        if due {
            self.emit(self.running_state());
        }
    }

    /// The announced size, when the bytes received differ from it.
    fn size_mismatch(&self) -> Option<u64> {
        self.total.filter(|&total| total != self.downloaded)
    }

    fn finish(&mut self, state: DownloadState, downloaded: u64) {
        self.downloaded = downloaded;
        if state.is_success() {
            self.total = Some(self.total.unwrap_or(downloaded));
        }
        self.emit(state);
    }

    fn emit(&self, state: DownloadState) {
        let Some(callback) = &self.callback else {
            return;
        };
        let percent = if state.is_success() {
            Some(100)
        } else {
            self.percent().map(|p| p as u8)
        };
        callback(&DownloadProgress {
            state,
            downloaded: self.downloaded,
            total: self.total,
            percent,
        });
    }
}
