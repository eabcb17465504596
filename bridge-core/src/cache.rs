//! LRU-style cache management for the torrent engine.
//!
//! Tracks when each torrent was last streamed and evicts stale or oversized
//! entries from the engine on a background schedule. The access log is the
//! bridge's view; every cycle reconciles it against what the engine actually
//! holds before enforcing limits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::SharedSettings;
use crate::engine::{EngineError, TorrentEngine};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// When a torrent was last streamed and how big it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntry {
    pub info_hash: String,
    #[serde(default)]
    pub name: String,
    pub last_accessed: DateTime<Utc>,
    /// Total byte count summed across the torrent's files.
    #[serde(default)]
    pub size: u64,
}

/// Snapshot of the cache state for the management API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_size_bytes: u64,
    #[serde(rename = "totalSizeGB")]
    pub total_size_gb: f64,
    pub torrent_count: usize,
    #[serde(rename = "maxSizeGB")]
    pub max_size_gb: u64,
    pub max_age_days: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_access: Option<DateTime<Utc>>,
    /// Sorted most recently accessed first.
    pub torrents: Vec<AccessEntry>,
}

/// Tracks torrent access times and evicts by age and total-size caps.
pub struct CacheManager {
    engine: Arc<dyn TorrentEngine>,
    settings: SharedSettings,
    access_log: RwLock<HashMap<String, AccessEntry>>,
    file_path: PathBuf,
    shutdown: CancellationToken,
}

impl CacheManager {
    /// Creates a cache manager, loading any persisted access log from disk.
    pub fn new(engine: Arc<dyn TorrentEngine>, settings: SharedSettings, data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("cache_access.json");

        let mut access_log = HashMap::new();
        match std::fs::read(&file_path) {
            Ok(data) => match serde_json::from_slice::<Vec<AccessEntry>>(&data) {
                Ok(entries) => {
                    for entry in entries {
                        access_log.insert(entry.info_hash.clone(), entry);
                    }
                    tracing::info!(
                        "cache manager: loaded {} entries from {}",
                        access_log.len(),
                        file_path.display()
                    );
                }
                Err(err) => {
                    tracing::warn!("cache manager: parsing access log failed: {err} (starting fresh)");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!("cache manager: reading access log failed: {err} (starting fresh)");
            }
        }

        Self {
            engine,
            settings,
            access_log: RwLock::new(access_log),
            file_path,
            shutdown: CancellationToken::new(),
        }
    }

    /// Updates the access timestamp for a torrent. Called from the stream
    /// proxy on every request; disk persistence happens in the background so
    /// the hot path never blocks on I/O.
    pub async fn record_access(self: &Arc<Self>, info_hash: &str, name: &str, size: u64) {
        {
            let mut log = self.access_log.write().await;
            let entry = log
                .entry(info_hash.to_string())
                .or_insert_with(|| AccessEntry {
                    info_hash: info_hash.to_string(),
                    name: String::new(),
                    last_accessed: Utc::now(),
                    size: 0,
                });
            entry.last_accessed = Utc::now();
            if !name.is_empty() {
                entry.name = name.to_string();
            }
            if size > 0 {
                entry.size = size;
            }
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.save().await;
        });
    }

    /// Launches the background cleanup task: once immediately, then hourly
    /// until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => {
                        tracing::info!("cache manager: stopped");
                        return;
                    }
                    _ = ticker.tick() => manager.sync_and_cleanup().await,
                }
            }
        });
    }

    /// Signals the background task to exit on its next tick.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn sync_and_cleanup(&self) {
        if let Err(err) = self.sync_with_engine().await {
            tracing::warn!("cache manager: engine sync failed: {err} (will retry next cycle)");
            return;
        }
        match self.run_cleanup().await {
            Ok(removed) if removed > 0 => {
                tracing::info!("cache manager: cleanup removed {removed} torrents");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("cache manager: cleanup failed: {err} (will retry next cycle)");
            }
        }
    }

    /// Reconciles the access log with the engine's actual torrent list.
    /// Torrents the engine has but we don't are added with the current time;
    /// entries for torrents the engine lost are dropped.
    pub async fn sync_with_engine(&self) -> Result<(), EngineError> {
        let torrents = tokio::time::timeout(ENGINE_CALL_TIMEOUT, self.engine.list_torrents())
            .await
            .map_err(|_| EngineError::Backend {
                reason: "listing torrents timed out".to_string(),
            })??;

        let mut log = self.access_log.write().await;

        for torrent in &torrents {
            match log.get_mut(&torrent.info_hash) {
                None => {
                    log.insert(
                        torrent.info_hash.clone(),
                        AccessEntry {
                            info_hash: torrent.info_hash.clone(),
                            name: torrent.name.clone(),
                            last_accessed: Utc::now(),
                            size: torrent.total_size,
                        },
                    );
                }
                Some(entry) => {
                    // Fill in what wasn't known when the entry was created
                    // (metadata may not have been ready yet).
                    if entry.size == 0 && torrent.total_size > 0 {
                        entry.size = torrent.total_size;
                    }
                    if entry.name.is_empty() && !torrent.name.is_empty() {
                        entry.name = torrent.name.clone();
                    }
                }
            }
        }

        let engine_hashes: std::collections::HashSet<&str> =
            torrents.iter().map(|t| t.info_hash.as_str()).collect();
        log.retain(|hash, _| engine_hashes.contains(hash.as_str()));

        Ok(())
    }

    /// Enforces age and size limits by removing torrents from the engine.
    /// Returns the number of torrents removed. Individual removal failures
    /// are logged and the entry kept for the next cycle.
    pub async fn run_cleanup(&self) -> Result<usize, EngineError> {
        let (max_age_days, max_bytes) = {
            let settings = self.settings.read().await;
            (
                settings.cache_max_age_days,
                settings.cache_size_gb * 1024 * 1024 * 1024,
            )
        };

        let mut entries: Vec<AccessEntry> = {
            let log = self.access_log.read().await;
            log.values().cloned().collect()
        };
        entries.sort_by_key(|entry| entry.last_accessed);

        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);

        // Age pass first, then a greedy size pass over the survivors
        // (already oldest-first).
        let mut to_remove: Vec<String> = Vec::new();
        let mut remaining: Vec<&AccessEntry> = Vec::new();
        for entry in &entries {
            if entry.last_accessed < cutoff {
                to_remove.push(entry.info_hash.clone());
            } else {
                remaining.push(entry);
            }
        }

        let mut total_size: u64 = remaining.iter().map(|entry| entry.size).sum();
        for entry in &remaining {
            if total_size <= max_bytes {
                break;
            }
            to_remove.push(entry.info_hash.clone());
            total_size -= entry.size;
        }

        if to_remove.is_empty() {
            self.log_stats(max_bytes, max_age_days).await;
            return Ok(0);
        }

        let mut removed = 0;
        for hash in &to_remove {
            let result =
                tokio::time::timeout(ENGINE_CALL_TIMEOUT, self.engine.remove_torrent(hash, true))
                    .await;
            match result {
                Ok(Ok(())) => {
                    removed += 1;
                    self.access_log.write().await.remove(hash);
                }
                Ok(Err(err)) => {
                    tracing::warn!("cache manager: removing {hash} failed: {err}");
                }
                Err(_) => {
                    tracing::warn!("cache manager: removing {hash} timed out");
                }
            }
        }

        self.save().await;
        self.log_stats(max_bytes, max_age_days).await;
        Ok(removed)
    }

    async fn log_stats(&self, max_bytes: u64, max_age_days: u64) {
        let log = self.access_log.read().await;
        let total: u64 = log.values().map(|entry| entry.size).sum();
        tracing::info!(
            "cache: {} torrents using {:.2} GB (limit: {} GB, max age: {} days)",
            log.len(),
            total as f64 / (1024.0 * 1024.0 * 1024.0),
            max_bytes / (1024 * 1024 * 1024),
            max_age_days,
        );
    }

    /// Snapshot of the current cache state for the API.
    pub async fn stats(&self) -> CacheStats {
        let (max_age_days, max_size_gb) = {
            let settings = self.settings.read().await;
            (settings.cache_max_age_days, settings.cache_size_gb)
        };

        let mut torrents: Vec<AccessEntry> = {
            let log = self.access_log.read().await;
            log.values().cloned().collect()
        };
        // Most recently accessed first for the API response.
        torrents.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

        let total_size_bytes: u64 = torrents.iter().map(|entry| entry.size).sum();

        CacheStats {
            total_size_bytes,
            total_size_gb: total_size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            torrent_count: torrents.len(),
            max_size_gb,
            max_age_days,
            oldest_access: torrents.last().map(|entry| entry.last_accessed),
            torrents,
        }
    }

    /// Writes the access log to disk. Failures are logged, not propagated.
    async fn save(&self) {
        let entries: Vec<AccessEntry> = {
            let log = self.access_log.read().await;
            log.values().cloned().collect()
        };

        let data = match serde_json::to_vec_pretty(&entries) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!("cache manager: serialize failed: {err}");
                return;
            }
        };

        if let Err(err) = tokio::fs::write(&self.file_path, data).await {
            tracing::error!(
                "cache manager: writing {} failed: {err}",
                self.file_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::config::RuntimeSettings;
    use crate::engine::{
        StreamRequest, StreamResponse, TorrentFile, TorrentInfo,
    };
    use crate::{EngineKind, FetchMethod};

    use super::*;

    /// Engine stub with an in-memory torrent set.
    struct FakeEngine {
        torrents: Mutex<HashMap<String, TorrentInfo>>,
        removed: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn with_torrents(torrents: Vec<TorrentInfo>) -> Arc<Self> {
            Arc::new(Self {
                torrents: Mutex::new(
                    torrents
                        .into_iter()
                        .map(|t| (t.info_hash.clone(), t))
                        .collect(),
                ),
                removed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TorrentEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn add_torrent(&self, _magnet_uri: &str) -> Result<TorrentInfo, EngineError> {
            Err(EngineError::Backend {
                reason: "not supported".to_string(),
            })
        }

        async fn stream_file(
            &self,
            _info_hash: &str,
            _file_index: usize,
            _request: &StreamRequest,
        ) -> Result<StreamResponse, EngineError> {
            Err(EngineError::Backend {
                reason: "not supported".to_string(),
            })
        }

        async fn remove_torrent(
            &self,
            info_hash: &str,
            _delete_files: bool,
        ) -> Result<(), EngineError> {
            self.torrents.lock().unwrap().remove(info_hash);
            self.removed.lock().unwrap().push(info_hash.to_string());
            Ok(())
        }

        async fn get_torrent(
            &self,
            info_hash: &str,
        ) -> Result<Option<TorrentInfo>, EngineError> {
            Ok(self.torrents.lock().unwrap().get(info_hash).cloned())
        }

        async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, EngineError> {
            Ok(self.torrents.lock().unwrap().values().cloned().collect())
        }

        async fn ping(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn torrent(hash: &str, size: u64) -> TorrentInfo {
        TorrentInfo {
            info_hash: hash.to_string(),
            name: format!("torrent {hash}"),
            files: vec![TorrentFile {
                index: 0,
                path: format!("{hash}.mkv"),
                size,
            }],
            engine_id: hash.to_string(),
            total_size: size,
            stats: None,
        }
    }

    fn settings(size_gb: u64, max_age_days: u64) -> SharedSettings {
        Arc::new(RwLock::new(RuntimeSettings {
            default_engine: EngineKind::TorrServer,
            default_fetch_method: FetchMethod::SwFallback,
            proxy_url: String::new(),
            cache_size_gb: size_gb,
            cache_max_age_days: max_age_days,
        }))
    }

    fn manager_with(
        engine: Arc<FakeEngine>,
        settings: SharedSettings,
    ) -> (tempfile::TempDir, Arc<CacheManager>) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CacheManager::new(
            engine as Arc<dyn TorrentEngine>,
            settings,
            dir.path().to_str().unwrap(),
        ));
        (dir, manager)
    }

    #[tokio::test]
    async fn test_sync_adds_and_removes_entries() {
        let engine = FakeEngine::with_torrents(vec![torrent("aaa", 100), torrent("bbb", 200)]);
        let (_dir, manager) = manager_with(engine.clone(), settings(60, 7));

        // A stale entry for a torrent the engine no longer has.
        manager.access_log.write().await.insert(
            "gone".to_string(),
            AccessEntry {
                info_hash: "gone".to_string(),
                name: String::new(),
                last_accessed: Utc::now(),
                size: 5,
            },
        );

        manager.sync_with_engine().await.unwrap();

        let log = manager.access_log.read().await;
        assert!(log.contains_key("aaa"));
        assert!(log.contains_key("bbb"));
        assert!(!log.contains_key("gone"));
        assert_eq!(log.get("bbb").unwrap().size, 200);
    }

    #[tokio::test]
    async fn test_age_eviction_removes_expired_entries() {
        let engine = FakeEngine::with_torrents(vec![torrent("old", 100), torrent("new", 100)]);
        let (_dir, manager) = manager_with(engine.clone(), settings(60, 7));
        manager.sync_with_engine().await.unwrap();

        manager
            .access_log
            .write()
            .await
            .get_mut("old")
            .unwrap()
            .last_accessed = Utc::now() - chrono::Duration::days(10);

        let removed = manager.run_cleanup().await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(engine.removed.lock().unwrap().as_slice(), &["old"]);
        assert!(!manager.access_log.read().await.contains_key("old"));
        assert!(manager.access_log.read().await.contains_key("new"));
    }

    #[tokio::test]
    async fn test_size_cap_evicts_oldest_first() {
        // Ten torrents of 10 GB each with a 50 GB cap: the five oldest go.
        const GB: u64 = 1024 * 1024 * 1024;
        let torrents: Vec<TorrentInfo> =
            (0..10).map(|i| torrent(&format!("t{i}"), 10 * GB)).collect();
        let engine = FakeEngine::with_torrents(torrents);
        let (_dir, manager) = manager_with(engine.clone(), settings(50, 7));
        manager.sync_with_engine().await.unwrap();

        {
            let mut log = manager.access_log.write().await;
            for i in 0..10 {
                log.get_mut(&format!("t{i}")).unwrap().last_accessed =
                    Utc::now() - chrono::Duration::minutes(100 - i as i64);
            }
        }

        let removed = manager.run_cleanup().await.unwrap();

        assert_eq!(removed, 5);
        let removed_hashes = engine.removed.lock().unwrap().clone();
        assert_eq!(removed_hashes, vec!["t0", "t1", "t2", "t3", "t4"]);

        let log = manager.access_log.read().await;
        assert_eq!(log.len(), 5);
        let total: u64 = log.values().map(|entry| entry.size).sum();
        assert!(total <= 50 * GB);
    }

    #[tokio::test]
    async fn test_record_access_is_monotonic_and_fills_metadata() {
        let engine = FakeEngine::with_torrents(vec![]);
        let (_dir, manager) = manager_with(engine, settings(60, 7));

        manager.record_access("abc", "", 0).await;
        let first = manager.access_log.read().await.get("abc").unwrap().clone();

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.record_access("abc", "Named", 123).await;
        let second = manager.access_log.read().await.get("abc").unwrap().clone();

        assert!(second.last_accessed > first.last_accessed);
        assert_eq!(second.name, "Named");
        assert_eq!(second.size, 123);
    }

    #[tokio::test]
    async fn test_stats_sorted_most_recent_first() {
        let engine = FakeEngine::with_torrents(vec![torrent("aaa", 10), torrent("bbb", 20)]);
        let (_dir, manager) = manager_with(engine, settings(60, 7));
        manager.sync_with_engine().await.unwrap();

        manager
            .access_log
            .write()
            .await
            .get_mut("aaa")
            .unwrap()
            .last_accessed = Utc::now() - chrono::Duration::hours(1);

        let stats = manager.stats().await;
        assert_eq!(stats.torrent_count, 2);
        assert_eq!(stats.total_size_bytes, 30);
        assert_eq!(stats.torrents[0].info_hash, "bbb");
        assert_eq!(stats.oldest_access, Some(stats.torrents[1].last_accessed));
    }
}
