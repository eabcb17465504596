//! Bridge Core - torrent engine adapters and addon wrapping
//!
//! This crate provides the building blocks of the torrent bridge: a uniform
//! interface over heterogeneous torrent engines, the addon registry and
//! response rewriter, LRU-style cache management, and the browser tab relay.

pub mod addon;
pub mod cache;
pub mod config;
pub mod engine;
pub mod http;
pub mod relay;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use addon::{AddonStore, FetchMethod, FetchStatus, WrapError, WrappedAddon, Wrapper};
pub use cache::{AccessEntry, CacheManager, CacheStats};
pub use config::{BridgeConfig, EngineKind, RuntimeSettings, SharedSettings};
pub use engine::{
    EngineError, StreamRequest, StreamResponse, TorrentEngine, TorrentFile, TorrentInfo,
    TorrentStats,
};
pub use relay::{FetchRequest, FetchResponse, RelayError, RelayServer};
