//! Upstream addon fetching and response rewriting.
//!
//! The wrapper rebrands upstream manifests and replaces torrent info-hash
//! stream entries with direct HTTP URLs served by the bridge's stream proxy.
//! Torrent registration with the engine is fire-and-forget so the stream
//! list returns immediately.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::engine::TorrentEngine;
use crate::http;

use super::{AddonStore, WrappedAddon};

/// Namespace prefixed onto upstream manifest IDs.
const ID_NAMESPACE: &str = "com.yundera.bridge.";
/// Tag prefixed onto upstream manifest names.
const NAME_TAG: &str = "[Bridge] ";
/// Tag appended to rewritten stream titles.
const TITLE_TAG: &str = " [Bridge]";

const NAME_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from wrapping upstream addon responses.
#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("addon {id} not found")]
    UnknownAddon { id: String },

    #[error("upstream request failed: {reason}")]
    Upstream { reason: String },

    #[error("upstream returned invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub struct Wrapper {
    store: Arc<AddonStore>,
    engine: Arc<dyn TorrentEngine>,
    client: reqwest::Client,
}

impl Wrapper {
    pub fn new(store: Arc<AddonStore>, engine: Arc<dyn TorrentEngine>) -> Self {
        Self {
            store,
            engine,
            client: http::api_client(),
        }
    }

    async fn addon(&self, wrap_id: &str) -> Result<WrappedAddon, WrapError> {
        self.store
            .get(wrap_id)
            .await
            .ok_or_else(|| WrapError::UnknownAddon {
                id: wrap_id.to_string(),
            })
    }

    /// Fetches the upstream manifest and rebrands it for the bridge.
    ///
    /// The manifest ID and name get the bridge prefix, and `behaviorHints`
    /// is stripped so the client never prompts for configuration. The first
    /// successful fetch backfills the registry name.
    pub async fn manifest(&self, wrap_id: &str) -> Result<Value, WrapError> {
        let addon = self.addon(wrap_id).await?;

        let data = self.fetch_json(&addon.original_url).await?;
        let mut manifest: Value = serde_json::from_slice(&data)?;

        let original_name = manifest
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(object) = manifest.as_object_mut() {
            if let Some(id) = object.get("id").and_then(Value::as_str) {
                let rebranded = format!("{ID_NAMESPACE}{id}");
                object.insert("id".to_string(), Value::String(rebranded));
            }
            if let Some(name) = object.get("name").and_then(Value::as_str) {
                let rebranded = format!("{NAME_TAG}{name}");
                object.insert("name".to_string(), Value::String(rebranded));
            }
            object.remove("behaviorHints");
        }

        if addon.name.is_empty() && !original_name.is_empty() {
            if let Err(err) = self.store.update_name(wrap_id, &original_name).await {
                tracing::warn!("wrapper: updating name for {wrap_id} failed: {err}");
            }
        }

        Ok(manifest)
    }

    /// Proxies a catalog request to the upstream addon, unchanged.
    pub async fn catalog(
        &self,
        wrap_id: &str,
        content_type: &str,
        catalog_id: &str,
    ) -> Result<Vec<u8>, WrapError> {
        self.proxy_resource(wrap_id, "catalog", content_type, catalog_id)
            .await
    }

    /// Proxies a meta request to the upstream addon, unchanged.
    pub async fn meta(
        &self,
        wrap_id: &str,
        content_type: &str,
        meta_id: &str,
    ) -> Result<Vec<u8>, WrapError> {
        self.proxy_resource(wrap_id, "meta", content_type, meta_id)
            .await
    }

    async fn proxy_resource(
        &self,
        wrap_id: &str,
        resource: &str,
        content_type: &str,
        id: &str,
    ) -> Result<Vec<u8>, WrapError> {
        let addon = self.addon(wrap_id).await?;
        let url = format!(
            "{}/{resource}/{content_type}/{id}.json",
            base_url(&addon.original_url)
        );
        self.fetch_json(&url).await
    }

    /// Fetches the upstream stream list and rewrites every info-hash entry
    /// into a direct bridge URL, registering the torrent in the background.
    pub async fn stream(
        &self,
        wrap_id: &str,
        content_type: &str,
        stream_id: &str,
        external_base: &str,
    ) -> Result<Value, WrapError> {
        let addon = self.addon(wrap_id).await?;
        let url = format!(
            "{}/stream/{content_type}/{stream_id}.json",
            base_url(&addon.original_url)
        );

        let data = self.fetch_json(&url).await?;
        let mut response: Value = serde_json::from_slice(&data)?;

        let Some(streams) = response.get_mut("streams").and_then(Value::as_array_mut) else {
            return Ok(serde_json::json!({"streams": []}));
        };

        for entry in streams.iter_mut() {
            let Some(item) = entry.as_object_mut() else {
                continue;
            };
            let Some(info_hash) = item.get("infoHash").and_then(Value::as_str) else {
                continue;
            };
            let info_hash = info_hash.to_string();
            if info_hash.is_empty() {
                continue;
            }

            let mut magnet = format!("magnet:?xt=urn:btih:{info_hash}");
            if let Some(sources) = item.get("sources").and_then(Value::as_array) {
                for source in sources {
                    if let Some(tracker) = source.as_str() {
                        magnet.push_str("&tr=");
                        magnet.push_str(&urlencoding::encode(tracker));
                    }
                }
            }

            // Fire-and-forget: the engine starts resolving metadata now so
            // the stream URL is hot by the time the player opens it. The URL
            // works either way; the engine adds lazily on first request.
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                if let Err(err) = engine.add_torrent(&magnet).await {
                    tracing::warn!("wrapper: background add torrent failed: {err}");
                }
            });

            let file_idx = item
                .get("fileIdx")
                .and_then(Value::as_u64)
                .unwrap_or_default();

            item.remove("infoHash");
            item.remove("fileIdx");
            item.remove("sources");
            item.insert(
                "url".to_string(),
                Value::String(format!(
                    "{external_base}/stream/{}/{file_idx}",
                    info_hash.to_lowercase()
                )),
            );

            if let Some(title) = item.get("title").and_then(Value::as_str) {
                let tagged = format!("{title}{TITLE_TAG}");
                item.insert("title".to_string(), Value::String(tagged));
            }
        }

        Ok(response)
    }

    /// Best-effort fetch of an upstream manifest's `name`, used to backfill
    /// the registry right after registration.
    pub async fn fetch_remote_name(&self, manifest_url: &str) -> Option<String> {
        let data = tokio::time::timeout(NAME_FETCH_TIMEOUT, self.fetch_json(manifest_url))
            .await
            .ok()?
            .ok()?;

        let manifest: Value = serde_json::from_slice(&data).ok()?;
        manifest
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    async fn fetch_json(&self, url: &str) -> Result<Vec<u8>, WrapError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| WrapError::Upstream {
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(WrapError::Upstream {
                reason: format!("unexpected status {} from {url}", response.status()),
            });
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| WrapError::Upstream {
                reason: err.to_string(),
            })
    }
}

/// Derives the addon's base URL from its manifest URL by stripping the query
/// string, the `/manifest.json` suffix, and any trailing slash.
pub fn base_url(manifest_url: &str) -> &str {
    let base = manifest_url
        .split_once('?')
        .map_or(manifest_url, |(before, _)| before);
    let base = base.strip_suffix("/manifest.json").unwrap_or(base);
    base.trim_end_matches('/')
}
