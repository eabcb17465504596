//! Video stream proxy: GET /stream/{infoHash}/{fileIndex}.
//!
//! Thin forwarder of Range-capable bytes from the engine to the client with
//! zero buffering. The engine call runs without a timeout because a stream
//! can stay open for hours.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bridge_core::engine::{EngineError, StreamRequest};

use crate::server::AppState;

use super::json_error;

/// Connection-scoped headers that must not be forwarded from the engine
/// response to the client.
const HOP_BY_HOP_HEADERS: [&str; 6] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Splits response headers into the forwardable set, dropping hop-by-hop
/// headers and the content type (set separately from the engine response).
fn forwardable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("content-type"))
        .cloned()
        .collect()
}

pub async fn stream_file(
    State(state): State<AppState>,
    Path((info_hash, file_index)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if info_hash.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "missing infoHash path parameter");
    }
    let Ok(file_index) = file_index.parse::<usize>() else {
        return json_error(StatusCode::BAD_REQUEST, "fileIndex must be an integer");
    };

    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let request = StreamRequest {
        range: header_value("range"),
        if_range: header_value("if-range"),
        if_none_match: header_value("if-none-match"),
        accept: header_value("accept"),
    };

    let stream = match state.engine.stream_file(&info_hash, file_index, &request).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!("stream {info_hash}/{file_index}: {err}");
            return json_error(status_for(&err), &format!("engine stream failed: {err}"));
        }
    };

    // Record the access for LRU cache management off the hot path.
    let engine = Arc::clone(&state.engine);
    let cache = Arc::clone(&state.cache);
    let hash_for_log = info_hash.clone();
    tokio::spawn(async move {
        match engine.get_torrent(&hash_for_log).await {
            Ok(Some(info)) => {
                cache
                    .record_access(&hash_for_log, &info.name, info.total_size)
                    .await;
            }
            // Still record the access even without full info.
            _ => cache.record_access(&hash_for_log, "", 0).await,
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(stream.status).unwrap_or(StatusCode::OK))
        .header("Content-Type", stream.content_type.clone());
    for (name, value) in forwardable_headers(&stream.headers) {
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from_stream(stream.body))
        .unwrap_or_else(|err| {
            tracing::error!("stream {info_hash}/{file_index}: building response failed: {err}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
        })
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        EngineError::NotFound { .. } | EngineError::IndexOutOfRange { .. } => {
            StatusCode::NOT_FOUND
        }
        EngineError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        EngineError::MetadataTimeout { .. }
        | EngineError::Backend { .. }
        | EngineError::Cancelled
        | EngineError::Io(_) => StatusCode::BAD_GATEWAY,
    }
}
