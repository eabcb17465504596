//! Bridge Web - HTTP surface of the torrent bridge
//!
//! Routes the Stremio-facing wrap endpoints, the video stream proxy, the
//! management REST API, the browser tab relay, and the embedded UI.

pub mod handlers;
pub mod server;

pub use server::{AppState, run_server};
