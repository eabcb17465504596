//! Management REST API: addon CRUD, runtime config, cache controls,
//! torrent stats, health diagnostics, and service-worker configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bridge_core::addon::FetchMethod;
use bridge_core::config::EngineKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::AppState;

use super::{json_error, resolve_external_base};

const PING_TIMEOUT: Duration = Duration::from_secs(3);
const STATS_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

// --- addon endpoints --------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAddonRequest {
    #[serde(default)]
    manifest_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddAddonResponse {
    id: String,
    original_url: String,
    wrapped_url: String,
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListAddonItem {
    id: String,
    original_url: String,
    wrapped_url: String,
    name: String,
    fetch_method: FetchMethod,
    fetch_status: bridge_core::FetchStatus,
    created_at: DateTime<Utc>,
}

fn wrapped_url(external_base: &str, id: &str) -> String {
    format!("{external_base}/wrap/{id}/manifest.json")
}

/// POST /api/addons
pub async fn add_addon(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AddAddonRequest>,
) -> Response {
    let manifest_url = request.manifest_url.trim().to_string();
    if manifest_url.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "manifestUrl is required");
    }

    let addon = state.store.add(&manifest_url).await;

    // Best-effort: populate the addon name from the upstream manifest.
    if addon.name.is_empty() {
        let wrapper = Arc::clone(&state.wrapper);
        let store = Arc::clone(&state.store);
        let id = addon.id.clone();
        tokio::spawn(async move {
            if let Some(name) = wrapper.fetch_remote_name(&manifest_url).await {
                if let Err(err) = store.update_name(&id, &name).await {
                    tracing::warn!("updating addon name for {id} failed: {err}");
                }
            }
        });
    }

    let external_base = resolve_external_base(&state.config, &headers);
    let response = AddAddonResponse {
        wrapped_url: wrapped_url(&external_base, &addon.id),
        id: addon.id,
        original_url: addon.original_url,
        name: addon.name,
    };

    (StatusCode::CREATED, Json(response)).into_response()
}

/// GET /api/addons
pub async fn list_addons(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let external_base = resolve_external_base(&state.config, &headers);

    let items: Vec<ListAddonItem> = state
        .store
        .list()
        .await
        .into_iter()
        .map(|addon| ListAddonItem {
            wrapped_url: wrapped_url(&external_base, &addon.id),
            id: addon.id,
            original_url: addon.original_url,
            name: addon.name,
            fetch_method: addon.fetch_method,
            fetch_status: addon.fetch_status,
            created_at: addon.created_at,
        })
        .collect();

    Json(items).into_response()
}

/// DELETE /api/addons/{id}
pub async fn remove_addon(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.remove(&id).await {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(_) => json_error(StatusCode::NOT_FOUND, "addon not found"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAddonRequest {
    fetch_method: Option<String>,
}

/// PATCH /api/addons/{id}
pub async fn update_addon(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateAddonRequest>,
) -> Response {
    if state.store.get(&id).await.is_none() {
        return json_error(StatusCode::NOT_FOUND, "addon not found");
    }

    if let Some(method) = request.fetch_method {
        let Ok(method) = method.parse::<FetchMethod>() else {
            return json_error(
                StatusCode::BAD_REQUEST,
                "fetchMethod must be one of: global, sw_fallback, tab_relay, sw_only, direct, proxy",
            );
        };
        if let Err(err) = state.store.update_fetch_method(&id, method).await {
            tracing::warn!("updating fetch method for {id} failed: {err}");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to update fetch method",
            );
        }
    }

    Json(json!({"success": true})).into_response()
}

// --- config endpoints -------------------------------------------------------

#[derive(Serialize)]
struct EngineStatus {
    url: String,
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    default_engine: String,
    default_fetch_method: FetchMethod,
    #[serde(rename = "proxyURL")]
    proxy_url: String,
    #[serde(rename = "cacheSizeGB")]
    cache_size_gb: u64,
    cache_max_age_days: u64,
    engines: HashMap<&'static str, EngineStatus>,
}

fn engine_map(state: &AppState) -> HashMap<&'static str, EngineStatus> {
    HashMap::from([
        (
            "torrserver",
            EngineStatus {
                url: state.config.engines.torrserver_url.clone(),
                status: "unknown",
            },
        ),
        (
            "rqbit",
            EngineStatus {
                url: state.config.engines.rqbit_url.clone(),
                status: "unknown",
            },
        ),
        (
            "qbittorrent",
            EngineStatus {
                url: state.config.engines.qbittorrent_url.clone(),
                status: "unknown",
            },
        ),
    ])
}

async fn config_response(state: &AppState, ping_active: bool) -> ConfigResponse {
    let mut engines = engine_map(state);

    if ping_active {
        if let Some(status) = engines.get_mut(state.engine.name()) {
            status.status =
                match tokio::time::timeout(PING_TIMEOUT, state.engine.ping()).await {
                    Ok(Ok(())) => "online",
                    _ => "offline",
                };
        }
    }

    let settings = state.settings.read().await;
    ConfigResponse {
        default_engine: settings.default_engine.to_string(),
        default_fetch_method: settings.default_fetch_method,
        proxy_url: settings.proxy_url.clone(),
        cache_size_gb: settings.cache_size_gb,
        cache_max_age_days: settings.cache_max_age_days,
        engines,
    }
}

/// GET /api/config
pub async fn get_config(State(state): State<AppState>) -> Response {
    Json(config_response(&state, true).await).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
    default_engine: Option<String>,
    default_fetch_method: Option<String>,
    #[serde(rename = "proxyURL")]
    proxy_url: Option<String>,
    #[serde(rename = "cacheSizeGB")]
    cache_size_gb: Option<i64>,
    cache_max_age_days: Option<i64>,
}

/// PUT /api/config
///
/// Partial runtime update. A changed default engine only takes effect on
/// restart; the adapter is constructed once at startup.
pub async fn update_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateConfigRequest>,
) -> Response {
    let default_engine = match &request.default_engine {
        Some(value) => match value.parse::<EngineKind>() {
            Ok(kind) => Some(kind),
            Err(_) => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "defaultEngine must be one of: torrserver, rqbit, qbittorrent",
                );
            }
        },
        None => None,
    };

    let default_fetch_method = match &request.default_fetch_method {
        Some(value) => match value.parse::<FetchMethod>() {
            Ok(method) if method != FetchMethod::Global => Some(method),
            _ => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "defaultFetchMethod must be one of: sw_fallback, tab_relay, sw_only, direct, proxy",
                );
            }
        },
        None => None,
    };

    if matches!(request.cache_size_gb, Some(size) if size <= 0) {
        return json_error(StatusCode::BAD_REQUEST, "cacheSizeGB must be positive");
    }
    if matches!(request.cache_max_age_days, Some(age) if age <= 0) {
        return json_error(StatusCode::BAD_REQUEST, "cacheMaxAgeDays must be positive");
    }

    {
        let mut settings = state.settings.write().await;
        if let Some(kind) = default_engine {
            settings.default_engine = kind;
        }
        if let Some(method) = default_fetch_method {
            settings.default_fetch_method = method;
        }
        if let Some(url) = request.proxy_url {
            settings.proxy_url = url;
        }
        if let Some(size) = request.cache_size_gb {
            settings.cache_size_gb = size as u64;
        }
        if let Some(age) = request.cache_max_age_days {
            settings.cache_max_age_days = age as u64;
        }
    }

    // Same shape as GET /api/config, minus the engine ping for speed.
    Json(config_response(&state, false).await).into_response()
}

// --- cache endpoints --------------------------------------------------------

/// GET /api/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Response {
    Json(state.cache.stats().await).into_response()
}

/// POST /api/cache/cleanup
pub async fn cache_cleanup(State(state): State<AppState>) -> Response {
    match state.cache.run_cleanup().await {
        Ok(removed) => Json(json!({
            "removed": removed,
            "stats": state.cache.stats().await,
        }))
        .into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

/// DELETE /api/cache/torrents/{hash}
pub async fn remove_torrent(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    if hash.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "missing hash parameter");
    }

    match tokio::time::timeout(REMOVE_TIMEOUT, state.engine.remove_torrent(&hash, true)).await {
        Ok(Ok(())) => Json(json!({"success": true})).into_response(),
        Ok(Err(err)) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "remove timed out"),
    }
}

// --- live torrent stats -----------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TorrentStatsItem {
    info_hash: String,
    name: String,
    total_size: u64,
    download_speed: f64,
    upload_speed: f64,
    active_peers: u32,
    total_peers: u32,
    connected_seeders: u32,
}

/// GET /api/torrents/stats
pub async fn torrent_stats(State(state): State<AppState>) -> Response {
    let torrents = match tokio::time::timeout(STATS_TIMEOUT, state.engine.list_torrents()).await
    {
        Ok(Ok(torrents)) => torrents,
        Ok(Err(err)) => return json_error(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        Err(_) => return json_error(StatusCode::SERVICE_UNAVAILABLE, "engine listing timed out"),
    };

    let items: Vec<TorrentStatsItem> = torrents
        .into_iter()
        .map(|torrent| {
            let stats = torrent.stats.unwrap_or_default();
            TorrentStatsItem {
                info_hash: torrent.info_hash,
                name: torrent.name,
                total_size: torrent.total_size,
                download_speed: stats.download_speed,
                upload_speed: stats.upload_speed,
                active_peers: stats.active_peers,
                total_peers: stats.total_peers,
                connected_seeders: stats.connected_seeders,
            }
        })
        .collect();

    Json(items).into_response()
}

// --- health diagnostics -----------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddonHealthItem {
    id: String,
    name: String,
    original_url: String,
    fetch_method: FetchMethod,
    effective_method: FetchMethod,
    direct_reachable: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    direct_error: String,
    relay_connected: bool,
    status: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    recommendation: String,
}

/// GET /api/health
///
/// Probes each addon upstream and reports per-addon status with a
/// recommendation when the current fetch method looks wrong.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let relay_connected = state.relay.connected();
    let default_method = state.settings.read().await.default_fetch_method;
    let client = bridge_core::http::api_client();

    let mut items = Vec::new();
    for addon in state.store.list().await {
        let effective = addon.fetch_method.resolve(default_method);

        let (direct_reachable, direct_error) =
            match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.head(&addon.original_url).send())
                .await
            {
                Ok(Ok(response)) if response.status().is_success() || response.status().is_redirection() => {
                    (true, String::new())
                }
                Ok(Ok(response)) => (false, format!("HTTP {}", response.status().as_u16())),
                Ok(Err(_)) => (false, "connection failed".to_string()),
                Err(_) => (false, "connection timed out".to_string()),
            };

        let (status, recommendation) = if direct_reachable {
            ("ok", String::new())
        } else if relay_connected {
            let recommendation = match effective {
                FetchMethod::Direct => {
                    "Direct fetch is blocked. Switch to Tab Relay or SW + Fallback.".to_string()
                }
                _ => String::new(),
            };
            ("degraded", recommendation)
        } else {
            let recommendation = match effective {
                FetchMethod::Direct | FetchMethod::SwFallback => {
                    "Addon is unreachable. Switch to Tab Relay and keep this tab open.".to_string()
                }
                FetchMethod::TabRelay => {
                    "Relay disconnected. Keep this tab open while using Stremio.".to_string()
                }
                _ => String::new(),
            };
            ("failing", recommendation)
        };

        items.push(AddonHealthItem {
            id: addon.id,
            name: addon.name,
            original_url: addon.original_url,
            fetch_method: addon.fetch_method,
            effective_method: effective,
            direct_reachable,
            direct_error,
            relay_connected,
            status,
            recommendation,
        });
    }

    Json(items).into_response()
}

// --- service worker configuration -------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwConfigResponse {
    #[serde(rename = "bridgeBaseURL")]
    bridge_base_url: String,
    default_fetch_method: FetchMethod,
    addons: Vec<SwAddonEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwAddonEntry {
    wrap_id: String,
    original_url: String,
    /// Resolved method: never `global`.
    fetch_method: FetchMethod,
}

/// GET /sw/config.json
pub async fn sw_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let external_base = resolve_external_base(&state.config, &headers);
    let default_method = state.settings.read().await.default_fetch_method;

    let addons: Vec<SwAddonEntry> = state
        .store
        .list()
        .await
        .into_iter()
        .map(|addon| SwAddonEntry {
            wrap_id: addon.id,
            original_url: addon.original_url,
            fetch_method: addon.fetch_method.resolve(default_method),
        })
        .collect();

    let response = SwConfigResponse {
        bridge_base_url: external_base,
        default_fetch_method: default_method,
        addons,
    };

    (
        [
            ("Cache-Control", "no-cache"),
            ("Access-Control-Allow-Origin", "*"),
        ],
        Json(response),
    )
        .into_response()
}
