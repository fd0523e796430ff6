//! Reference-counted, debounced write access to normally read-only filesystems.

use std::fmt;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::WriteGuardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardedFs {
    Root,
    Boot,
}

impl GuardedFs {
    fn index(self) -> usize {
        match self {
            GuardedFs::Root => 0,
            GuardedFs::Boot => 1,
        }
    }

    fn selected(root: bool, boot: bool) -> impl Iterator<Item = GuardedFs> {
        [(root, GuardedFs::Root), (boot, GuardedFs::Boot)]
            .into_iter()
            .filter_map(|(wanted, fs)| wanted.then_some(fs))
    }
}

impl fmt::Display for GuardedFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardedFs::Root => f.write_str("root filesystem"),
            GuardedFs::Boot => f.write_str("boot filesystem"),
        }
    }
}

/// Performs the actual remount. Called with the guard's lock held, never concurrently.
pub trait Remounter: Send + Sync {
    fn remount(&self, fs: GuardedFs, writable: bool) -> anyhow::Result<()>;
}

/// Runs the configured mount commands through `/bin/sh -c`.
#[derive(Debug, Clone)]
pub struct CommandRemounter {
    config: WriteGuardConfig,
}

impl CommandRemounter {
    pub fn new(config: WriteGuardConfig) -> Self {
        Self { config }
    }
}

impl Remounter for CommandRemounter {
    fn remount(&self, fs: GuardedFs, writable: bool) -> anyhow::Result<()> {
        let line = match (fs, writable) {
            (GuardedFs::Root, true) => &self.config.root_writable_cmd,
            (GuardedFs::Root, false) => &self.config.root_readonly_cmd,
            (GuardedFs::Boot, true) => &self.config.boot_writable_cmd,
            (GuardedFs::Boot, false) => &self.config.boot_readonly_cmd,
        };
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(line)
            .output()
            .with_context(|| format!("Failed to run '{line}'"))?;
        if !output.status.success() {
            bail!(
                "'{line}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Used when write protection is disabled in the configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemounter;

impl Remounter for NoopRemounter {
    fn remount(&self, fs: GuardedFs, writable: bool) -> anyhow::Result<()> {
        debug!("Write guard disabled, skipping remount of {fs} (writable={writable})");
        Ok(())
    }
}

#[derive(Default)]
struct Counter {
    count: u32,
    writable: bool,
    /// Bumped on every acquire and every scheduled release; a timer only
    /// releases when its generation is still current.
    generation: u64,
    pending: Option<CancellationToken>,
}

struct Inner {
    remounter: Arc<dyn Remounter>,
    debounce: Duration,
    counters: Mutex<[Counter; 2]>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, [Counter; 2]> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, fs: GuardedFs, generation: Option<u64>) {
        let mut counters = self.lock();
        let counter = &mut counters[fs.index()];
        if counter.count != 0 || generation.is_some_and(|g| g != counter.generation) {
            return;
        }
        if let Some(token) = counter.pending.take() {
            token.cancel();
        }
        if !counter.writable {
            return;
        }
        match self.remounter.remount(fs, false) {
            Ok(()) => {
                counter.writable = false;
                info!("{fs} is read-only again");
            }
            Err(e) => warn!("Failed to make {fs} read-only: {e:#}"),
        }
    }
}

/// Shared write-enable counters for the root and boot filesystems.
#[derive(Clone)]
pub struct WriteGuard {
    inner: Arc<Inner>,
}

impl WriteGuard {
    pub fn new(remounter: Arc<dyn Remounter>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                remounter,
                debounce,
                counters: Mutex::new(Default::default()),
            }),
        }
    }

    pub fn from_config(config: &WriteGuardConfig) -> Self {
        let remounter: Arc<dyn Remounter> = if config.enabled {
            Arc::new(CommandRemounter::new(config.clone()))
        } else {
            Arc::new(NoopRemounter)
        };
        Self::new(remounter, config.debounce())
    }

    /// Take a write reference. The first reference remounts read-write; any
    /// pending release is canceled. Blocks while a remount runs.
    pub fn enable_write(&self, root: bool, boot: bool) {
        for fs in GuardedFs::selected(root, boot) {
            let mut counters = self.inner.lock();
            let counter = &mut counters[fs.index()];
            if let Some(token) = counter.pending.take() {
                token.cancel();
            }
            counter.generation += 1;
            counter.count += 1;
            if counter.writable {
                continue;
            }
            match self.inner.remounter.remount(fs, true) {
                Ok(()) => {
                    counter.writable = true;
                    info!("{fs} is writable");
                }
                Err(e) => warn!("Failed to make {fs} writable: {e:#}"),
            }
        }
    }

    /// `enable_write` on the blocking pool, for async callers.
    pub async fn acquire(&self, root: bool, boot: bool) {
        let guard = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || guard.enable_write(root, boot)).await {
            warn!("Write guard acquire failed: {e}");
        }
    }

    /// Drop a write reference. The last reference schedules a read-only
    /// remount after the debounce period instead of remounting right away.
    pub fn disable_write(&self, root: bool, boot: bool) {
        for fs in GuardedFs::selected(root, boot) {
            let mut counters = self.inner.lock();
            let counter = &mut counters[fs.index()];
            if counter.count == 0 {
                warn!("disable_write({fs}) without a matching enable_write, ignoring");
                continue;
            }
            counter.count -= 1;
            if counter.count > 0 {
                continue;
            }
            counter.generation += 1;
            let generation = counter.generation;
            if let Some(token) = counter.pending.take() {
                token.cancel();
            }

            let Ok(handle) = Handle::try_current() else {
                drop(counters);
                self.inner.release(fs, Some(generation));
                continue;
            };
            let token = CancellationToken::new();
            counter.pending = Some(token.clone());
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(inner.debounce) => {
                        let released = tokio::task::spawn_blocking(move || {
                            inner.release(fs, Some(generation));
                        })
                        .await;
                        if let Err(e) = released {
                            warn!("Write guard release for {fs} failed: {e}");
                        }
                    }
                }
            });
        }
    }

    /// Immediately remount idle filesystems read-only, skipping the debounce.
    pub fn release_idle(&self) {
        for fs in [GuardedFs::Root, GuardedFs::Boot] {
            self.inner.release(fs, None);
        }
    }

    pub fn references(&self, fs: GuardedFs) -> u32 {
        self.inner.lock()[fs.index()].count
    }

    pub fn is_writable(&self, fs: GuardedFs) -> bool {
        self.inner.lock()[fs.index()].writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRemounter {
        enables: AtomicUsize,
        disables: AtomicUsize,
    }

    impl Remounter for CountingRemounter {
        fn remount(&self, _fs: GuardedFs, writable: bool) -> anyhow::Result<()> {
            if writable {
                self.enables.fetch_add(1, Ordering::SeqCst);
            } else {
                self.disables.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn guard(debounce: Duration) -> (WriteGuard, Arc<CountingRemounter>) {
        let remounter = Arc::new(CountingRemounter::default());
        (WriteGuard::new(remounter.clone(), debounce), remounter)
    }

    #[tokio::test]
    async fn overlapping_pairs_remount_once_each_way() {
        let (guard, calls) = guard(Duration::from_millis(100));

        for _ in 0..5 {
            guard.enable_write(true, false);
            guard.enable_write(true, false);
            guard.disable_write(true, false);
            guard.disable_write(true, false);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.enables.load(Ordering::SeqCst), 1);
        assert_eq!(calls.disables.load(Ordering::SeqCst), 0);
        assert!(guard.is_writable(GuardedFs::Root));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.enables.load(Ordering::SeqCst), 1);
        assert_eq!(calls.disables.load(Ordering::SeqCst), 1);
        assert!(!guard.is_writable(GuardedFs::Root));
    }

    #[tokio::test]
    async fn reacquire_cancels_pending_release() {
        let (guard, calls) = guard(Duration::from_millis(100));

        guard.enable_write(true, true);
        guard.disable_write(true, true);
        guard.enable_write(true, true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(calls.disables.load(Ordering::SeqCst), 0);
        assert_eq!(guard.references(GuardedFs::Boot), 1);
    }

    #[tokio::test]
    async fn unmatched_disable_is_ignored() {
        let (guard, calls) = guard(Duration::from_millis(10));

        guard.disable_write(true, true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(guard.references(GuardedFs::Root), 0);
        assert_eq!(calls.enables.load(Ordering::SeqCst), 0);
        assert_eq!(calls.disables.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn release_idle_skips_debounce() {
        let (guard, calls) = guard(Duration::from_secs(60));

        guard.enable_write(true, false);
        guard.disable_write(true, false);
        guard.release_idle();

        assert_eq!(calls.disables.load(Ordering::SeqCst), 1);
        assert!(!guard.is_writable(GuardedFs::Root));
    }

    #[test]
    fn without_runtime_release_is_immediate() {
        let (guard, calls) = guard(Duration::from_secs(60));

        guard.enable_write(false, true);
        guard.disable_write(false, true);

        assert_eq!(calls.disables.load(Ordering::SeqCst), 1);
    }
}
