//! Disk cache of built indexes
//!
//! Maps an `IndexKey` to one index file under `<dir>/<component>/`:
//! - `<digest>.sqlite`: a finished index, visible only once complete
//! - `<digest>.<uuid>.tmp`: a build in progress
//!
//! At most one build runs per key. The first requester for a missing key
//! registers a shared pending outcome and spawns the build; later
//! requesters attach to the same outcome. The build runs as its own task,
//! so a requester going away never cancels it. Only the background timeout
//! does.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::error::{Result, SymbolsError};
use crate::models::{CacheEntry, CacheState, IndexKey};

const INDEX_EXT: &str = "sqlite";
const TEMP_EXT: &str = "tmp";

/// Failure records kept for `status`
const MAX_FAILED_RECORDS: usize = 1024;
/// Failure records older than this are dropped by `evict`
const FAILED_RETENTION: Duration = Duration::from_secs(3600);

type BuildOutcome = Shared<BoxFuture<'static, Result<PathBuf>>>;

/// A build in progress
struct PendingBuild {
    key: IndexKey,
    started_at: DateTime<Utc>,
    outcome: BuildOutcome,
}

#[derive(Default)]
struct Registry {
    building: HashMap<String, PendingBuild>,
    /// Last failure per key, cleared when the key is requested again
    failed: HashMap<String, (IndexKey, DateTime<Utc>)>,
}

impl Registry {
    fn record_failure(&mut self, digest: String, key: IndexKey) {
        if self.failed.len() >= MAX_FAILED_RECORDS {
            let oldest = self
                .failed
                .iter()
                .min_by_key(|(_, (_, failed_at))| *failed_at)
                .map(|(digest, _)| digest.clone());
            if let Some(oldest) = oldest {
                self.failed.remove(&oldest);
            }
        }
        self.failed.insert(digest, (key, Utc::now()));
    }
}

#[derive(Default)]
struct BuildCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Build activity of one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCounts {
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

struct CacheInner {
    dir: PathBuf,
    background_timeout: Duration,
    registry: Mutex<Registry>,
    counters: BuildCounters,
}

/// Result of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Shared handle to the on-disk index cache
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<CacheInner>,
}

impl DiskCache {
    /// Open (creating if needed) the cache for `component` under `root`
    ///
    /// Temp files left by builds of a previous process are removed.
    pub fn open(root: &Path, component: &str, background_timeout: Duration) -> Result<Self> {
        let dir = root.join(component);
        std::fs::create_dir_all(&dir)?;

        let cache = Self {
            inner: Arc::new(CacheInner {
                dir,
                background_timeout,
                registry: Mutex::new(Registry::default()),
                counters: BuildCounters::default(),
            }),
        };

        let removed = cache.clean_temp_files()?;
        if removed > 0 {
            log::info!("Removed {} leftover temp files from {:?}", removed, cache.dir());
        }

        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Final location of the index for `key`
    pub fn index_path(&self, key: &IndexKey) -> PathBuf {
        self.inner.dir.join(format!("{}.{}", key.digest(), INDEX_EXT))
    }

    /// Return the ready index for `key`, building it with `build` on a miss
    ///
    /// `build` receives a temp path to write the index into. On success the
    /// file is renamed into place; on failure or timeout it is removed and
    /// every waiter receives the same error.
    pub async fn get_or_build<F, Fut>(&self, key: &IndexKey, build: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let digest = key.digest();
        let final_path = self.index_path(key);

        let outcome = {
            let mut registry = self.inner.lock_registry();

            if let Some(pending) = registry.building.get(&digest) {
                log::debug!("Cache join: {} (building since {})", key, pending.started_at);
                pending.outcome.clone()
            } else if final_path.exists() {
                drop(registry);
                log::debug!("Cache hit: {}", key);
                touch(&final_path);
                return Ok(final_path);
            } else {
                log::info!("Cache miss: {} ({} other builds running)", key, registry.building.len());
                registry.failed.remove(&digest);
                let outcome = self.spawn_build(key.clone(), digest.clone(), final_path, build);
                registry.building.insert(
                    digest,
                    PendingBuild {
                        key: key.clone(),
                        started_at: Utc::now(),
                        outcome: outcome.clone(),
                    },
                );
                outcome
            }
        };

        outcome.await
    }

    /// Spawn the build task; must be called with the registry locked so the
    /// task cannot deregister before it is registered
    fn spawn_build<F, Fut>(&self, key: IndexKey, digest: String, final_path: PathBuf, build: F) -> BuildOutcome
    where
        F: FnOnce(PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let temp_path = inner
            .dir
            .join(format!("{}.{}.{}", digest, uuid::Uuid::new_v4().simple(), TEMP_EXT));

        let task = tokio::spawn(async move {
            // Deregister even if the build panics
            let _registered = scopeguard::guard((Arc::clone(&inner), digest.clone()), |(inner, digest)| {
                inner.lock_registry().building.remove(&digest);
            });

            let result = match tokio::time::timeout(inner.background_timeout, build(temp_path.clone())).await {
                Ok(Ok(())) => tokio::fs::rename(&temp_path, &final_path)
                    .await
                    .map(|_| final_path)
                    .map_err(|e| SymbolsError::Build(format!("failed to publish index: {}", e))),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    log::warn!(
                        "Build for {} exceeded background timeout of {:?}, abandoning",
                        key,
                        inner.background_timeout
                    );
                    Err(SymbolsError::CacheTimeout(key.to_string()))
                }
            };

            if result.is_err() {
                if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove temp file {:?}: {}", temp_path, e);
                    }
                }
            }

            let counters = &inner.counters;
            match &result {
                Ok(path) => {
                    let succeeded = counters.succeeded.fetch_add(1, Ordering::Relaxed) + 1;
                    log::info!("Cache entry ready: {} -> {:?} ({} builds succeeded)", key, path, succeeded);
                }
                // Timed-out entries are simply gone
                Err(e) if e.is_retryable() => {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::error!("Build for {} failed: {}", key, e);
                    inner.lock_registry().record_failure(digest, key);
                }
            }
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(SymbolsError::Build(format!("build task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    /// Current state of the entry for `key`, if there is one
    pub fn status(&self, key: &IndexKey) -> Option<CacheEntry> {
        let digest = key.digest();
        let path = self.index_path(key);
        let registry = self.inner.lock_registry();

        if let Some(pending) = registry.building.get(&digest) {
            return Some(CacheEntry {
                key: pending.key.clone(),
                path,
                state: CacheState::Building,
                build_started_at: Some(pending.started_at),
            });
        }
        if path.exists() {
            return Some(CacheEntry {
                key: key.clone(),
                path,
                state: CacheState::Ready,
                build_started_at: None,
            });
        }
        if let Some((failed_key, _)) = registry.failed.get(&digest) {
            return Some(CacheEntry {
                key: failed_key.clone(),
                path,
                state: CacheState::Failed,
                build_started_at: None,
            });
        }
        drop(registry);

        // A build running in another process
        self.live_temp_file(&digest).map(|started| CacheEntry {
            key: key.clone(),
            path,
            state: CacheState::Building,
            build_started_at: Some(started),
        })
    }

    /// Start time of the newest temp file for `digest` still within the
    /// background timeout
    fn live_temp_file(&self, digest: &str) -> Option<DateTime<Utc>> {
        let prefix = format!("{}.", digest);
        let now = SystemTime::now();
        std::fs::read_dir(&self.inner.dir)
            .ok()?
            .filter_map(|dir_entry| dir_entry.ok())
            .filter(|dir_entry| {
                let name = dir_entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(&prefix) && name.ends_with(TEMP_EXT)
            })
            .filter_map(|dir_entry| dir_entry.metadata().ok()?.modified().ok())
            .filter(|modified| now.duration_since(*modified).unwrap_or_default() < self.inner.background_timeout)
            .max()
            .map(DateTime::<Utc>::from)
    }

    /// Builds running now and outcomes since the cache was opened
    pub fn build_counts(&self) -> BuildCounts {
        let counters = &self.inner.counters;
        BuildCounts {
            running: self.inner.lock_registry().building.len(),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Forget failure records older than `max_age`
    pub fn prune_failed(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut registry = self.inner.lock_registry();
        let before = registry.failed.len();
        registry.failed.retain(|_, (_, failed_at)| {
            (now - *failed_at).to_std().unwrap_or_default() < max_age
        });
        before - registry.failed.len()
    }

    /// Remove ready indexes older than `max_age`, then the least recently
    /// used ones until the cache holds at most `max_bytes`
    ///
    /// Failure records past their retention are dropped too.
    pub fn evict(&self, max_bytes: u64, max_age: Option<Duration>) -> Result<EvictionStats> {
        let pruned = self.prune_failed(FAILED_RETENTION);
        if pruned > 0 {
            log::debug!("Dropped {} stale failure records", pruned);
        }

        let now = SystemTime::now();
        let mut files = Vec::new();

        for dir_entry in std::fs::read_dir(&self.inner.dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INDEX_EXT) {
                continue;
            }
            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                // Removed concurrently
                Err(_) => continue,
            };
            let modified = metadata.modified().unwrap_or(now);
            files.push((path, metadata.len(), modified));
        }

        // Oldest first
        files.sort_by_key(|(_, _, modified)| *modified);

        let building: Vec<String> = self.inner.lock_registry().building.keys().cloned().collect();
        let is_building = |path: &Path| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| building.iter().any(|d| d == stem))
        };

        let mut stats = EvictionStats {
            remaining_bytes: files.iter().map(|(_, size, _)| size).sum(),
            ..Default::default()
        };

        for (path, size, modified) in files {
            let too_old = max_age
                .is_some_and(|max_age| now.duration_since(modified).unwrap_or_default() > max_age);
            let over_budget = stats.remaining_bytes > max_bytes;
            if !(too_old || over_budget) || is_building(&path) {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("Evicted {:?} ({} bytes)", path, size);
                    stats.removed += 1;
                    stats.freed_bytes += size;
                    stats.remaining_bytes -= size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    stats.remaining_bytes -= size;
                }
                Err(e) => log::warn!("Failed to evict {:?}: {}", path, e),
            }
        }

        if stats.removed > 0 {
            log::info!(
                "Evicted {} indexes ({} bytes freed, {} bytes remaining)",
                stats.removed,
                stats.freed_bytes,
                stats.remaining_bytes
            );
        }
        Ok(stats)
    }

    /// Remove temp files that do not belong to a build of this process
    ///
    /// Files younger than the background timeout are kept, since they may
    /// belong to a build still running in another process.
    pub fn clean_temp_files(&self) -> Result<usize> {
        let building: Vec<String> = self.inner.lock_registry().building.keys().cloned().collect();
        let mut removed = 0;

        for dir_entry in std::fs::read_dir(&self.inner.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXT) {
                continue;
            }
            let digest = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('.').next())
                .unwrap_or("");
            if building.iter().any(|d| d == digest) {
                continue;
            }
            let age = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or(Duration::MAX);
            if age < self.inner.background_timeout {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run eviction every `interval` until the returned task is aborted
    pub fn spawn_janitor(
        &self,
        interval: Duration,
        max_bytes: u64,
        max_age: Option<Duration>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cache = cache.clone();
                match tokio::task::spawn_blocking(move || cache.evict(max_bytes, max_age)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::error!("Cache eviction failed: {}", e),
                    Err(e) => log::error!("Cache eviction task failed: {}", e),
                }
            }
        })
    }
}

impl CacheInner {
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Refresh a file's mtime so eviction sees it as recently used
fn touch(path: &Path) {
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = result {
        log::debug!("Failed to refresh mtime of {:?}: {}", path, e);
    }
}
