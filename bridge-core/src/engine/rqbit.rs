//! rqbit engine adapter.
//!
//! rqbit addresses torrents by a locally assigned numeric ID, so the adapter
//! maintains a bidirectional infoHash <-> ID map. The map is refreshed from
//! every successful listing because IDs are not stable across restarts.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;

use super::torrserver::passthrough_response;
use super::{
    EngineError, StreamRequest, StreamResponse, TorrentEngine, TorrentFile, TorrentInfo,
    parse_info_hash_from_magnet, total_size_of,
};
use crate::http;

#[derive(Default)]
struct IdMaps {
    hash_to_id: HashMap<String, u64>,
    id_to_hash: HashMap<u64, String>,
}

impl IdMaps {
    fn insert(&mut self, hash: &str, id: u64) {
        self.hash_to_id.insert(hash.to_string(), id);
        self.id_to_hash.insert(id, hash.to_string());
    }

    fn remove(&mut self, hash: &str, id: u64) {
        self.hash_to_id.remove(hash);
        self.id_to_hash.remove(&id);
    }
}

pub struct RqbitAdapter {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
    maps: RwLock<IdMaps>,
}

impl RqbitAdapter {
    /// Creates an rqbit adapter. Non-empty credentials enable HTTP Basic
    /// Auth on every request.
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client: http::api_client(),
            stream_client: http::streaming_client(),
            maps: RwLock::new(IdMaps::default()),
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() || self.password.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    fn lookup_id(&self, hash: &str) -> Option<u64> {
        self.maps.read().expect("id map lock").hash_to_id.get(hash).copied()
    }

    fn record_mapping(&self, hash: &str, id: u64) {
        if !hash.is_empty() {
            self.maps.write().expect("id map lock").insert(hash, id);
        }
    }

    /// Fetches a single torrent's details by its numeric ID. `known_hash`
    /// fills in when the response omits the info hash.
    async fn torrent_by_id(
        &self,
        id: u64,
        known_hash: &str,
    ) -> Result<TorrentInfo, EngineError> {
        let response = self
            .with_auth(self.client.get(format!("{}/torrents/{id}", self.base_url)))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("rqbit get torrent {id}: unexpected status {status}: {body}"),
            });
        }

        let detail: RqbitTorrentDetail = response.json().await?;

        let mut hash = detail.info_hash.to_lowercase();
        if hash.is_empty() {
            hash = known_hash.to_string();
        }
        self.record_mapping(&hash, id);

        Ok(detail.into_info(&hash, Some(id)))
    }

    fn details_to_infos(&self, details: Vec<RqbitTorrentDetail>) -> Vec<TorrentInfo> {
        details
            .into_iter()
            .map(|detail| {
                let hash = detail.info_hash.to_lowercase();
                let id = self.lookup_id(&hash);
                detail.into_info(&hash, id)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RqbitAddResponse {
    id: u64,
    #[serde(default)]
    details: Option<RqbitAddDetails>,
}

#[derive(Debug, Deserialize)]
struct RqbitAddDetails {
    #[serde(default)]
    info_hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    files: Vec<RqbitFileInfo>,
}

#[derive(Debug, Deserialize)]
struct RqbitTorrentDetail {
    #[serde(default)]
    info_hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    files: Vec<RqbitFileInfo>,
}

#[derive(Debug, Deserialize)]
struct RqbitFileInfo {
    name: String,
    length: u64,
}

impl RqbitTorrentDetail {
    fn into_info(self, hash: &str, id: Option<u64>) -> TorrentInfo {
        let files: Vec<TorrentFile> = self
            .files
            .into_iter()
            .enumerate()
            .map(|(index, f)| TorrentFile {
                index,
                path: f.name,
                size: f.length,
            })
            .collect();

        TorrentInfo {
            total_size: total_size_of(&files),
            info_hash: hash.to_string(),
            name: self.name,
            files,
            engine_id: id.map(|id| id.to_string()).unwrap_or_default(),
            stats: None,
        }
    }
}

/// Wrapper shape some rqbit versions return from GET /torrents.
#[derive(Debug, Deserialize)]
struct RqbitListWrapper {
    torrents: Vec<RqbitTorrentDetail>,
}

#[async_trait::async_trait]
impl TorrentEngine for RqbitAdapter {
    fn name(&self) -> &'static str {
        "rqbit"
    }

    async fn add_torrent(&self, magnet_uri: &str) -> Result<TorrentInfo, EngineError> {
        let info_hash = parse_info_hash_from_magnet(magnet_uri);

        // Already mapped means already added; return the current info.
        if let Some(hash) = &info_hash {
            if let Some(id) = self.lookup_id(hash) {
                return self.torrent_by_id(id, hash).await;
            }
        }

        let response = self
            .with_auth(
                self.client
                    .post(format!("{}/torrents?overwrite=true", self.base_url))
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(magnet_uri.to_string()),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("rqbit add torrent: unexpected status {status}: {body}"),
            });
        }

        let add: RqbitAddResponse = response.json().await?;

        let response_hash = add
            .details
            .as_ref()
            .filter(|d| !d.info_hash.is_empty())
            .map(|d| d.info_hash.to_lowercase())
            .or(info_hash)
            .unwrap_or_default();
        self.record_mapping(&response_hash, add.id);

        // Use the add response directly when it carried full details.
        if let Some(details) = add.details {
            if !response_hash.is_empty() && !details.name.is_empty() {
                let detail = RqbitTorrentDetail {
                    info_hash: response_hash.clone(),
                    name: details.name,
                    files: details.files,
                };
                return Ok(detail.into_info(&response_hash, Some(add.id)));
            }
        }

        // Details not in the add response; fetch them by ID.
        self.torrent_by_id(add.id, &response_hash).await
    }

    async fn stream_file(
        &self,
        info_hash: &str,
        file_index: usize,
        request: &StreamRequest,
    ) -> Result<StreamResponse, EngineError> {
        let hash = info_hash.to_lowercase();

        let id = match self.lookup_id(&hash) {
            Some(id) => id,
            None => {
                // Refresh the mapping from rqbit and retry once.
                self.list_torrents().await?;
                self.lookup_id(&hash).ok_or_else(|| EngineError::NotFound {
                    info_hash: hash.clone(),
                })?
            }
        };

        let stream_url = format!("{}/torrents/{id}/stream/{file_index}", self.base_url);
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

        let response = self.with_auth(builder).send().await?;
        Ok(passthrough_response(response))
    }

    async fn remove_torrent(
        &self,
        info_hash: &str,
        delete_files: bool,
    ) -> Result<(), EngineError> {
        let hash = info_hash.to_lowercase();
        let id = self.lookup_id(&hash).ok_or_else(|| EngineError::NotFound {
            info_hash: hash.clone(),
        })?;

        // /delete removes torrent and files, /forget keeps the files.
        let action = if delete_files { "delete" } else { "forget" };
        let response = self
            .with_auth(
                self.client
                    .post(format!("{}/torrents/{id}/{action}", self.base_url)),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("rqbit remove: unexpected status {status}: {body}"),
            });
        }

        self.maps.write().expect("id map lock").remove(&hash, id);
        Ok(())
    }

    async fn get_torrent(&self, info_hash: &str) -> Result<Option<TorrentInfo>, EngineError> {
        let hash = info_hash.to_lowercase();

        let id = match self.lookup_id(&hash) {
            Some(id) => id,
            None => {
                if self.list_torrents().await.is_err() {
                    return Ok(None);
                }
                match self.lookup_id(&hash) {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };

        self.torrent_by_id(id, &hash).await.map(Some)
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, EngineError> {
        let response = self
            .with_auth(self.client.get(format!("{}/torrents", self.base_url)))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("rqbit list torrents: unexpected status {status}: {body}"),
            });
        }

        let data = response.bytes().await?;

        // rqbit has returned three different shapes across versions: a bare
        // array, an object wrapping the array, or a map keyed by numeric ID.
        if let Ok(details) = serde_json::from_slice::<Vec<RqbitTorrentDetail>>(&data) {
            let mut maps = self.maps.write().expect("id map lock");
            for (index, detail) in details.iter().enumerate() {
                let hash = detail.info_hash.to_lowercase();
                if !hash.is_empty() {
                    maps.insert(&hash, index as u64);
                }
            }
            drop(maps);
            return Ok(self.details_to_infos(details));
        }

        if let Ok(wrapper) = serde_json::from_slice::<RqbitListWrapper>(&data) {
            let mut maps = self.maps.write().expect("id map lock");
            for (index, detail) in wrapper.torrents.iter().enumerate() {
                let hash = detail.info_hash.to_lowercase();
                if !hash.is_empty() {
                    maps.insert(&hash, index as u64);
                }
            }
            drop(maps);
            return Ok(self.details_to_infos(wrapper.torrents));
        }

        let id_map: HashMap<String, RqbitTorrentDetail> = serde_json::from_slice(&data)
            .map_err(|err| EngineError::Backend {
                reason: format!("rqbit list torrents: unrecognized response shape: {err}"),
            })?;

        let mut details = Vec::with_capacity(id_map.len());
        {
            let mut maps = self.maps.write().expect("id map lock");
            for (id_str, detail) in id_map {
                let Ok(id) = id_str.parse::<u64>() else {
                    continue;
                };
                let hash = detail.info_hash.to_lowercase();
                if !hash.is_empty() {
                    maps.insert(&hash, id);
                }
                details.push(detail);
            }
        }

        Ok(self.details_to_infos(details))
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let response = self
            .with_auth(self.client.get(format!("{}/stats", self.base_url)))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Backend {
                reason: format!("rqbit ping: unexpected status {}", response.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "aabbccddeeff00112233445566778899aabbccdd";

    fn detail_json(name: &str) -> String {
        format!(
            r#"{{"info_hash":"{HASH}","name":"{name}","files":[{{"name":"movie.mkv","length":2000}}]}}"#
        )
    }

    #[tokio::test]
    async fn test_list_parses_bare_array() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/torrents")
            .with_body(format!("[{}]", detail_json("Array Shape")))
            .create_async()
            .await;

        let adapter = RqbitAdapter::new(&server.url(), "", "");
        let torrents = adapter.list_torrents().await.unwrap();

        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0].info_hash, HASH);
        assert_eq!(adapter.lookup_id(HASH), Some(0));
    }

    #[tokio::test]
    async fn test_list_parses_wrapped_object() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/torrents")
            .with_body(format!(r#"{{"torrents":[{}]}}"#, detail_json("Wrapped")))
            .create_async()
            .await;

        let adapter = RqbitAdapter::new(&server.url(), "", "");
        let torrents = adapter.list_torrents().await.unwrap();

        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0].name, "Wrapped");
    }

    #[tokio::test]
    async fn test_list_parses_id_keyed_map() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/torrents")
            .with_body(format!(r#"{{"42":{}}}"#, detail_json("Map Shape")))
            .create_async()
            .await;

        let adapter = RqbitAdapter::new(&server.url(), "", "");
        let torrents = adapter.list_torrents().await.unwrap();

        assert_eq!(torrents.len(), 1);
        assert_eq!(torrents[0].engine_id, "42");
        assert_eq!(adapter.lookup_id(HASH), Some(42));
    }

    #[tokio::test]
    async fn test_add_uses_details_from_add_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/torrents")
            .match_query(mockito::Matcher::UrlEncoded(
                "overwrite".into(),
                "true".into(),
            ))
            .with_body(format!(r#"{{"id":7,"details":{}}}"#, detail_json("Added")))
            .create_async()
            .await;

        let adapter = RqbitAdapter::new(&server.url(), "", "");
        let info = adapter
            .add_torrent(&format!("magnet:?xt=urn:btih:{HASH}"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(info.info_hash, HASH);
        assert_eq!(info.engine_id, "7");
        assert_eq!(adapter.lookup_id(HASH), Some(7));
    }

    #[tokio::test]
    async fn test_add_is_idempotent_once_mapped() {
        let mut server = mockito::Server::new_async().await;
        let add_mock = server
            .mock("POST", "/torrents")
            .match_query(mockito::Matcher::Any)
            .with_body(format!(r#"{{"id":7,"details":{}}}"#, detail_json("Added")))
            .expect(1)
            .create_async()
            .await;
        let get_mock = server
            .mock("GET", "/torrents/7")
            .with_body(detail_json("Added"))
            .expect(1)
            .create_async()
            .await;

        let adapter = RqbitAdapter::new(&server.url(), "", "");
        let magnet = format!("magnet:?xt=urn:btih:{HASH}");

        let first = adapter.add_torrent(&magnet).await.unwrap();
        let second = adapter.add_torrent(&magnet).await.unwrap();

        // The second add resolves through the mapping; the engine sees
        // exactly one registration.
        add_mock.assert_async().await;
        get_mock.assert_async().await;
        assert_eq!(first.info_hash, second.info_hash);
        assert_eq!(first.engine_id, second.engine_id);
    }

    #[tokio::test]
    async fn test_remove_uses_delete_or_forget() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/torrents")
            .with_body(format!("[{}]", detail_json("Listed")))
            .create_async()
            .await;
        let delete_mock = server
            .mock("POST", "/torrents/0/delete")
            .with_status(200)
            .create_async()
            .await;

        let adapter = RqbitAdapter::new(&server.url(), "", "");
        adapter.list_torrents().await.unwrap();
        adapter.remove_torrent(HASH, true).await.unwrap();

        delete_mock.assert_async().await;
        assert_eq!(adapter.lookup_id(HASH), None);
    }
}
