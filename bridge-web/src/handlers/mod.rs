//! HTTP handlers, grouped by surface.

pub mod api;
pub mod relay;
pub mod static_files;
pub mod stream;
pub mod wrap;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bridge_core::config::BridgeConfig;
use serde_json::json;

/// Standard JSON error body.
pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Base URL external clients should use to reach this bridge.
///
/// Prefers the explicit external URL from configuration and falls back to
/// inferring scheme and host from the request headers.
pub(crate) fn resolve_external_base(config: &BridgeConfig, headers: &HeaderMap) -> String {
    if !config.server.external_url.is_empty() {
        return config.server.external_url.trim_end_matches('/').to_string();
    }

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    format!("{scheme}://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_base_prefers_config() {
        let mut config = BridgeConfig::default();
        config.server.external_url = "https://bridge.example.com/".to_string();

        let headers = HeaderMap::new();
        assert_eq!(
            resolve_external_base(&config, &headers),
            "https://bridge.example.com"
        );
    }

    #[test]
    fn test_external_base_infers_from_headers() {
        let config = BridgeConfig::default();

        let mut headers = HeaderMap::new();
        headers.insert("host", "bridge.local:8080".parse().unwrap());
        assert_eq!(
            resolve_external_base(&config, &headers),
            "http://bridge.local:8080"
        );

        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(
            resolve_external_base(&config, &headers),
            "https://bridge.local:8080"
        );
    }
}
