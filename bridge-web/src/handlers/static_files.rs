//! Embedded management UI.

use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};

const INDEX_HTML: &str = include_str!("../../static/index.html");

/// GET / — the UI lives under /ui/.
pub async fn root_redirect() -> Redirect {
    Redirect::permanent("/ui/index.html")
}

/// GET /ui/{*path}
pub async fn ui_asset(Path(path): Path<String>) -> Response {
    match path.as_str() {
        "" | "index.html" => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            INDEX_HTML,
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}
