//! Application state and router wiring.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use bridge_core::config::{BridgeConfig, SharedSettings};
use bridge_core::{AddonStore, CacheManager, RelayServer, TorrentEngine, Wrapper};
use tower_http::cors::CorsLayer;

use crate::handlers::{api, relay, static_files, stream, wrap};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub settings: SharedSettings,
    pub engine: Arc<dyn TorrentEngine>,
    pub store: Arc<AddonStore>,
    pub wrapper: Arc<Wrapper>,
    pub cache: Arc<CacheManager>,
    pub relay: Arc<RelayServer>,
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(static_files::root_redirect))
        .route("/ui/{*path}", get(static_files::ui_asset))
        // Stremio wrap endpoints (addon protocol).
        .route("/wrap/{wrap_id}/manifest.json", get(wrap::manifest))
        .route(
            "/wrap/{wrap_id}/catalog/{content_type}/{*rest}",
            get(wrap::catalog),
        )
        .route(
            "/wrap/{wrap_id}/meta/{content_type}/{*rest}",
            get(wrap::meta),
        )
        .route(
            "/wrap/{wrap_id}/stream/{content_type}/{*rest}",
            get(wrap::stream),
        )
        // Video stream proxy (no .json suffix; raw bytes).
        .route("/stream/{info_hash}/{file_index}", get(stream::stream_file))
        // Management API.
        .route("/api/addons", post(api::add_addon).get(api::list_addons))
        .route(
            "/api/addons/{id}",
            delete(api::remove_addon).patch(api::update_addon),
        )
        .route("/api/config", get(api::get_config).put(api::update_config))
        .route("/api/cache/stats", get(api::cache_stats))
        .route("/api/cache/cleanup", post(api::cache_cleanup))
        .route("/api/cache/torrents/{hash}", delete(api::remove_torrent))
        .route("/api/torrents/stats", get(api::torrent_stats))
        .route("/api/health", get(api::health_check))
        // Browser tab relay.
        .route("/api/relay/pending", get(relay::pending))
        .route("/api/relay/response/{id}", post(relay::response))
        .route("/api/relay/status", get(relay::status))
        // Service worker configuration.
        .route("/sw/config.json", get(api::sw_config))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the listener and serves until the process exits.
pub async fn run_server(state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!(
        "{}:{}",
        state.config.server.bind_addr, state.config.server.port
    );
    let app = router(state);

    tracing::info!("torrent bridge listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
