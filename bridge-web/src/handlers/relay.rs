//! Browser tab relay endpoints.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bridge_core::relay::{FetchResponse, RelayError};
use serde_json::json;

use crate::server::AppState;

use super::json_error;

const LONG_POLL_WAIT: Duration = Duration::from_secs(25);

/// GET /api/relay/pending
///
/// Long-poll endpoint the browser calls repeatedly. Blocks up to 25 seconds
/// waiting for a pending request; 204 when nothing is queued.
pub async fn pending(State(state): State<AppState>) -> Response {
    match state.relay.wait_for_request(LONG_POLL_WAIT).await {
        Some(request) => Json(request).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// POST /api/relay/response/{id}
///
/// Callback with the fetched data. Unknown or expired IDs return 410 Gone so
/// late browsers stop retrying.
pub async fn response(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "missing request id");
    }

    let Ok(fetch_response) = serde_json::from_slice::<FetchResponse>(&body) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid JSON body");
    };

    match state.relay.complete(&id, fetch_response) {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(RelayError::UnknownRequest { .. }) => {
            json_error(StatusCode::GONE, "request expired or unknown")
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

/// GET /api/relay/status
pub async fn status(State(state): State<AppState>) -> Response {
    let connected = state.relay.connected();
    Json(json!({
        "connected": connected,
        "status": if connected { "connected" } else { "disconnected" },
    }))
    .into_response()
}
