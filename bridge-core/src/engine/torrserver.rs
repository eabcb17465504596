//! TorrServer engine adapter.
//!
//! TorrServer exposes a single JSON action endpoint for torrent management
//! and streams file bytes over a plain GET, so streaming is a passthrough:
//! the client's Range headers go upstream and the response comes back
//! unchanged.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use super::{
    EngineError, StreamRequest, StreamResponse, TorrentEngine, TorrentFile, TorrentInfo,
    total_size_of,
};
use crate::http;

pub struct TorrServerAdapter {
    base_url: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl TorrServerAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http::api_client(),
            stream_client: http::streaming_client(),
        }
    }

    /// Sends a POST to the /torrents action endpoint.
    async fn torrents_request(
        &self,
        body: &TorrServerRequest,
    ) -> Result<reqwest::Response, EngineError> {
        let response = self
            .client
            .post(format!("{}/torrents", self.base_url))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("torrserver: unexpected status {status}: {body}"),
            });
        }

        Ok(response)
    }
}

/// Generic request body for TorrServer's /torrents endpoint.
#[derive(Debug, Serialize)]
struct TorrServerRequest {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TorrServerTorrent {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    file_stat: Vec<TorrServerFileStat>,
}

#[derive(Debug, Deserialize)]
struct TorrServerFileStat {
    id: usize,
    path: String,
    length: u64,
}

impl From<TorrServerTorrent> for TorrentInfo {
    fn from(ts: TorrServerTorrent) -> Self {
        let files: Vec<TorrentFile> = ts
            .file_stat
            .into_iter()
            .map(|f| TorrentFile {
                index: f.id,
                path: f.path,
                size: f.length,
            })
            .collect();

        let hash = ts.hash.to_lowercase();
        TorrentInfo {
            total_size: total_size_of(&files),
            info_hash: hash.clone(),
            name: ts.name,
            files,
            engine_id: hash,
            stats: None,
        }
    }
}

#[async_trait::async_trait]
impl TorrentEngine for TorrServerAdapter {
    fn name(&self) -> &'static str {
        "torrserver"
    }

    async fn add_torrent(&self, magnet_uri: &str) -> Result<TorrentInfo, EngineError> {
        let response = self
            .torrents_request(&TorrServerRequest {
                action: "add",
                link: Some(magnet_uri.to_string()),
                hash: None,
            })
            .await?;

        let torrent: TorrServerTorrent = response.json().await?;
        Ok(torrent.into())
    }

    async fn stream_file(
        &self,
        info_hash: &str,
        file_index: usize,
        request: &StreamRequest,
    ) -> Result<StreamResponse, EngineError> {
        let stream_url = format!(
            "{}/stream?link={}&index={}&play",
            self.base_url,
            info_hash.to_lowercase(),
            file_index
        );

        let mut builder = self.stream_client.get(stream_url);
        for (name, value) in [
            ("Range", &request.range),
            ("If-Range", &request.if_range),
            ("If-None-Match", &request.if_none_match),
        ] {
            if let Some(value) = value {
                builder = builder.header(name, value);
            }
        }

        let response = builder.send().await?;
        Ok(passthrough_response(response))
    }

    async fn remove_torrent(
        &self,
        info_hash: &str,
        _delete_files: bool,
    ) -> Result<(), EngineError> {
        // TorrServer always removes files; the flag has no effect here.
        self.torrents_request(&TorrServerRequest {
            action: "rem",
            link: None,
            hash: Some(info_hash.to_lowercase()),
        })
        .await?;
        Ok(())
    }

    async fn get_torrent(&self, info_hash: &str) -> Result<Option<TorrentInfo>, EngineError> {
        let response = match self
            .torrents_request(&TorrServerRequest {
                action: "get",
                link: None,
                hash: Some(info_hash.to_lowercase()),
            })
            .await
        {
            Ok(response) => response,
            // TorrServer errors on unknown hashes; treat as not found.
            Err(_) => return Ok(None),
        };

        let Ok(torrent) = response.json::<TorrServerTorrent>().await else {
            return Ok(None);
        };
        if torrent.hash.is_empty() {
            return Ok(None);
        }

        Ok(Some(torrent.into()))
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, EngineError> {
        let response = self
            .torrents_request(&TorrServerRequest {
                action: "list",
                link: None,
                hash: None,
            })
            .await?;

        let torrents: Vec<TorrServerTorrent> = response.json().await?;
        Ok(torrents.into_iter().map(Into::into).collect())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let response = self
            .client
            .get(format!("{}/echo", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Backend {
                reason: format!("torrserver ping: unexpected status {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Wraps an upstream HTTP response into a StreamResponse without touching
/// the body, status, or headers.
pub(super) fn passthrough_response(response: reqwest::Response) -> StreamResponse {
    let status = response.status().as_u16();
    let content_length = response.content_length();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    StreamResponse {
        body: response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed(),
        content_length,
        content_type,
        status,
        headers,
    }
}
