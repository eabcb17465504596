//! Stremio wrap endpoints: manifest, catalog, meta, and stream.
//!
//! Catalog, meta, and stream failures return empty sentinel bodies with 200
//! so one bad upstream addon never bricks the whole client view; only the
//! manifest surfaces upstream failures as 502.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bridge_core::WrapError;

use crate::server::AppState;

use super::{json_error, resolve_external_base};

/// GET /wrap/{wrapId}/manifest.json
pub async fn manifest(
    State(state): State<AppState>,
    Path(wrap_id): Path<String>,
) -> Response {
    match state.wrapper.manifest(&wrap_id).await {
        Ok(manifest) => Json(manifest).into_response(),
        Err(WrapError::UnknownAddon { .. }) => {
            json_error(StatusCode::NOT_FOUND, "addon not found")
        }
        Err(err) => {
            tracing::warn!("wrap manifest {wrap_id}: {err}");
            json_error(
                StatusCode::BAD_GATEWAY,
                "failed to fetch original manifest",
            )
        }
    }
}

/// GET /wrap/{wrapId}/catalog/{type}/{catalogId}.json
pub async fn catalog(
    State(state): State<AppState>,
    Path((wrap_id, content_type, rest)): Path<(String, String, String)>,
) -> Response {
    let catalog_id = strip_json_suffix(&rest);
    match state.wrapper.catalog(&wrap_id, &content_type, catalog_id).await {
        Ok(body) => passthrough_json(body),
        Err(WrapError::UnknownAddon { .. }) => {
            json_error(StatusCode::NOT_FOUND, "addon not found")
        }
        Err(err) => {
            tracing::warn!("wrap catalog {wrap_id}/{content_type}/{catalog_id}: {err}");
            sentinel(r#"{"metas":[]}"#)
        }
    }
}

/// GET /wrap/{wrapId}/meta/{type}/{metaId}.json
pub async fn meta(
    State(state): State<AppState>,
    Path((wrap_id, content_type, rest)): Path<(String, String, String)>,
) -> Response {
    let meta_id = strip_json_suffix(&rest);
    match state.wrapper.meta(&wrap_id, &content_type, meta_id).await {
        Ok(body) => passthrough_json(body),
        Err(WrapError::UnknownAddon { .. }) => {
            json_error(StatusCode::NOT_FOUND, "addon not found")
        }
        Err(err) => {
            tracing::warn!("wrap meta {wrap_id}/{content_type}/{meta_id}: {err}");
            sentinel(r#"{"meta":{}}"#)
        }
    }
}

/// GET /wrap/{wrapId}/stream/{type}/{streamId}.json
pub async fn stream(
    State(state): State<AppState>,
    Path((wrap_id, content_type, rest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let stream_id = strip_json_suffix(&rest);
    let external_base = resolve_external_base(&state.config, &headers);

    match state
        .wrapper
        .stream(&wrap_id, &content_type, stream_id, &external_base)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(WrapError::UnknownAddon { .. }) => {
            json_error(StatusCode::NOT_FOUND, "addon not found")
        }
        Err(err) => {
            tracing::warn!("wrap stream {wrap_id}/{content_type}/{stream_id}: {err}");
            sentinel(r#"{"streams":[]}"#)
        }
    }
}

fn strip_json_suffix(rest: &str) -> &str {
    rest.strip_suffix(".json").unwrap_or(rest)
}

fn passthrough_json(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn sentinel(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_suffix() {
        assert_eq!(strip_json_suffix("tt0111161.json"), "tt0111161");
        // Extra-props segments keep their inner structure.
        assert_eq!(strip_json_suffix("top/skip=100.json"), "top/skip=100");
        assert_eq!(strip_json_suffix("no-suffix"), "no-suffix");
    }
}
