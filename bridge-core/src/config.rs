//! Centralized configuration for the bridge.
//!
//! All tunable parameters are defined here and overridden from environment
//! variables at startup. The subset that the management API may change at
//! runtime lives in [`RuntimeSettings`] behind a shared lock.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::addon::FetchMethod;

/// Torrent engine backends the bridge can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    TorrServer,
    Rqbit,
    QBittorrent,
}

impl EngineKind {
    /// Engine identifier as used in configuration and API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::TorrServer => "torrserver",
            EngineKind::Rqbit => "rqbit",
            EngineKind::QBittorrent => "qbittorrent",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "torrserver" => Ok(EngineKind::TorrServer),
            "rqbit" => Ok(EngineKind::Rqbit),
            "qbittorrent" => Ok(EngineKind::QBittorrent),
            other => Err(format!("unknown engine: {other}")),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Central configuration for all bridge components.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub engines: EngineConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

/// HTTP server bind settings and the externally visible base URL.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Base URL clients use to reach the bridge. Empty means the request's
    /// Host header (plus X-Forwarded-Proto) decides.
    pub external_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            external_url: String::new(),
        }
    }
}

/// Per-engine endpoints and credentials.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_engine: EngineKind,
    pub torrserver_url: String,
    pub rqbit_url: String,
    pub rqbit_username: String,
    pub rqbit_password: String,
    pub qbittorrent_url: String,
    /// Local mount point of qBittorrent's download directory.
    pub qbittorrent_download_path: String,
    pub qbittorrent_username: String,
    pub qbittorrent_password: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_engine: EngineKind::TorrServer,
            torrserver_url: "http://torrserver:8090".to_string(),
            rqbit_url: "http://rqbit:3030".to_string(),
            rqbit_username: String::new(),
            rqbit_password: String::new(),
            qbittorrent_url: "http://qbittorrent:8080".to_string(),
            qbittorrent_download_path: "/downloads".to_string(),
            qbittorrent_username: "admin".to_string(),
            qbittorrent_password: "adminadmin".to_string(),
        }
    }
}

/// How upstream addon JSON is fetched by default.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub default_method: FetchMethod,
    pub proxy_url: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            default_method: FetchMethod::SwFallback,
            proxy_url: String::new(),
        }
    }
}

/// Cache eviction limits.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub size_gb: u64,
    pub max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_gb: 60,
            max_age_days: 7,
        }
    }
}

/// Where persisted state (addon registry, access log) lives.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("BIND_ADDR") {
            config.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_EXTERNAL_URL") {
            config.server.external_url = v;
        }
        if let Ok(v) = std::env::var("TORRENT_ENGINE") {
            if let Ok(kind) = v.parse() {
                config.engines.default_engine = kind;
            }
        }
        if let Ok(v) = std::env::var("TORRSERVER_URL") {
            config.engines.torrserver_url = v;
        }
        if let Ok(v) = std::env::var("RQBIT_URL") {
            config.engines.rqbit_url = v;
        }
        if let Ok(v) = std::env::var("RQBIT_USERNAME") {
            config.engines.rqbit_username = v;
        }
        if let Ok(v) = std::env::var("RQBIT_PASSWORD") {
            config.engines.rqbit_password = v;
        }
        if let Ok(v) = std::env::var("QBITTORRENT_URL") {
            config.engines.qbittorrent_url = v;
        }
        if let Ok(v) = std::env::var("QBITTORRENT_DOWNLOAD_PATH") {
            config.engines.qbittorrent_download_path = v;
        }
        if let Ok(v) = std::env::var("QBITTORRENT_USERNAME") {
            config.engines.qbittorrent_username = v;
        }
        if let Ok(v) = std::env::var("QBITTORRENT_PASSWORD") {
            config.engines.qbittorrent_password = v;
        }
        if let Ok(v) = std::env::var("DEFAULT_FETCH_METHOD") {
            if let Ok(method) = v.parse::<FetchMethod>() {
                if method != FetchMethod::Global {
                    config.fetch.default_method = method;
                }
            }
        }
        if let Ok(v) = std::env::var("PROXY_URL") {
            config.fetch.proxy_url = v;
        }
        if let Ok(v) = std::env::var("CACHE_SIZE_GB") {
            if let Ok(size) = v.parse::<u64>() {
                config.cache.size_gb = size;
            }
        }
        if let Ok(v) = std::env::var("CACHE_MAX_AGE_DAYS") {
            if let Ok(age) = v.parse::<u64>() {
                config.cache.max_age_days = age;
            }
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            config.storage.data_dir = v;
        }

        config
    }

    /// Splits off the runtime-mutable subset for the management API.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            default_engine: self.engines.default_engine,
            default_fetch_method: self.fetch.default_method,
            proxy_url: self.fetch.proxy_url.clone(),
            cache_size_gb: self.cache.size_gb,
            cache_max_age_days: self.cache.max_age_days,
        }
    }
}

/// Settings the management API may change while the bridge is running.
///
/// A changed `default_engine` only takes effect after a restart; the engine
/// adapter is constructed once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub default_engine: EngineKind,
    pub default_fetch_method: FetchMethod,
    pub proxy_url: String,
    pub cache_size_gb: u64,
    pub cache_max_age_days: u64,
}

/// Shared handle to the runtime-mutable settings.
pub type SharedSettings = Arc<RwLock<RuntimeSettings>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = BridgeConfig::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engines.default_engine, EngineKind::TorrServer);
        assert_eq!(config.engines.torrserver_url, "http://torrserver:8090");
        assert_eq!(config.engines.qbittorrent_download_path, "/downloads");
        assert_eq!(config.fetch.default_method, FetchMethod::SwFallback);
        assert_eq!(config.cache.size_gb, 60);
        assert_eq!(config.cache.max_age_days, 7);
        assert_eq!(config.storage.data_dir, "/data");
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("PORT", "9090");
            std::env::set_var("TORRENT_ENGINE", "qbittorrent");
            std::env::set_var("CACHE_SIZE_GB", "120");
            std::env::set_var("DATA_DIR", "/tmp/bridge-data");
        }

        let config = BridgeConfig::from_env();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.engines.default_engine, EngineKind::QBittorrent);
        assert_eq!(config.cache.size_gb, 120);
        assert_eq!(config.storage.data_dir, "/tmp/bridge-data");

        unsafe {
            std::env::remove_var("PORT");
            std::env::remove_var("TORRENT_ENGINE");
            std::env::remove_var("CACHE_SIZE_GB");
            std::env::remove_var("DATA_DIR");
        }
    }

    #[test]
    fn test_engine_kind_round_trip() {
        for kind in [
            EngineKind::TorrServer,
            EngineKind::Rqbit,
            EngineKind::QBittorrent,
        ] {
            assert_eq!(kind.as_str().parse::<EngineKind>().unwrap(), kind);
        }
        assert!("deluge".parse::<EngineKind>().is_err());
    }
}
