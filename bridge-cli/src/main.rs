//! Torrent bridge server binary.
//!
//! Wires configuration, the selected engine adapter, the addon registry,
//! cache manager, and relay together, then serves HTTP until terminated.

use std::sync::Arc;

use bridge_core::config::{BridgeConfig, EngineKind};
use bridge_core::engine::{QBittorrentAdapter, RqbitAdapter, TorrServerAdapter};
use bridge_core::tracing_setup::{CliLogLevel, init_tracing};
use bridge_core::{AddonStore, CacheManager, RelayServer, TorrentEngine, Wrapper};
use bridge_web::AppState;
use clap::Parser;

#[derive(Parser)]
#[command(name = "torrent-bridge")]
#[command(about = "Bridges Stremio addons to a local torrent engine")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

fn build_engine(config: &BridgeConfig) -> Arc<dyn TorrentEngine> {
    let engines = &config.engines;
    match engines.default_engine {
        EngineKind::TorrServer => Arc::new(TorrServerAdapter::new(&engines.torrserver_url)),
        EngineKind::Rqbit => Arc::new(RqbitAdapter::new(
            &engines.rqbit_url,
            &engines.rqbit_username,
            &engines.rqbit_password,
        )),
        EngineKind::QBittorrent => Arc::new(QBittorrentAdapter::new(
            &engines.qbittorrent_url,
            &engines.qbittorrent_download_path,
            &engines.qbittorrent_username,
            &engines.qbittorrent_password,
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level());

    let config = Arc::new(BridgeConfig::from_env());
    let settings = Arc::new(tokio::sync::RwLock::new(config.runtime_settings()));

    let engine = build_engine(&config);
    tracing::info!("using engine: {}", engine.name());

    let store = Arc::new(AddonStore::open(&config.storage.data_dir)?);
    let wrapper = Arc::new(Wrapper::new(Arc::clone(&store), Arc::clone(&engine)));
    let cache = Arc::new(CacheManager::new(
        Arc::clone(&engine),
        Arc::clone(&settings),
        &config.storage.data_dir,
    ));
    let relay = Arc::new(RelayServer::new());

    cache.start();

    let state = AppState {
        config,
        settings,
        engine,
        store,
        wrapper,
        cache: Arc::clone(&cache),
        relay,
    };

    let result = bridge_web::run_server(state).await;
    cache.stop();
    result
}
