//! Pooled HTTP clients for engine and upstream addon traffic.
//!
//! Two clients with different timeout profiles: API calls are bounded at
//! 30 seconds, streaming requests have no timeout because a movie can play
//! for hours over a single response.

use std::time::Duration;

use reqwest::Client;

const USER_AGENT: &str = concat!("torrent-bridge/", env!("CARGO_PKG_VERSION"));

/// Client for API calls (30 second timeout).
pub fn api_client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .unwrap_or_default()
}

/// Client for streaming (no overall timeout).
pub fn streaming_client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .unwrap_or_default()
}
