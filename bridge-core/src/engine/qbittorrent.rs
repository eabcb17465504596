//! qBittorrent engine adapter.
//!
//! Unlike the direct-stream backends, qBittorrent downloads files to disk.
//! The bridge reads those files from a shared volume and serves them with
//! Range support, using a [`PieceAwareReader`] so the response can start
//! before the download finishes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::{
    EngineError, PieceAwareReader, PieceState, PieceStateSource, StreamRequest, StreamResponse,
    TorrentEngine, TorrentFile, TorrentInfo, TorrentStats, content_type_for,
    parse_info_hash_from_magnet, parse_range_header,
};
use crate::http;

const METADATA_WAIT: Duration = Duration::from_secs(30);
const STREAM_READY_WAIT: Duration = Duration::from_secs(90);
const FILE_ON_DISK_WAIT: Duration = Duration::from_secs(60);
const PIECE_SIZE_RETRIES: u32 = 10;
const PIECE_SIZE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum file priority in the qBittorrent Web API.
const PRIORITY_MAX: &str = "7";
/// "Do not download" priority.
const PRIORITY_SKIP: &str = "0";

pub struct QBittorrentAdapter {
    client: Arc<QbitClient>,
    download_path: PathBuf,
}

impl QBittorrentAdapter {
    /// Creates a qBittorrent adapter. `download_path` is the local mount
    /// point of qBittorrent's download directory.
    pub fn new(base_url: &str, download_path: &str, username: &str, password: &str) -> Self {
        Self {
            client: Arc::new(QbitClient::new(base_url, username, password)),
            download_path: PathBuf::from(download_path),
        }
    }
}

/// Shared Web API client. Split from the adapter so the piece-aware reader
/// can keep polling piece states after the stream handler returned.
pub(crate) struct QbitClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    sid: tokio::sync::Mutex<Option<String>>,
}

impl QbitClient {
    fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http: http::api_client(),
            sid: tokio::sync::Mutex::new(None),
        }
    }

    /// Authenticates against the Web API and stores the session cookie.
    async fn login(&self) -> Result<(), EngineError> {
        let response = self
            .http
            .post(format!("{}/api/v2/auth/login", self.base_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let cookies: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() || body.trim() != "Ok." {
            return Err(EngineError::Backend {
                reason: format!("qbittorrent login failed (status {status}): {body}"),
            });
        }

        for cookie in cookies {
            if let Some(value) = cookie
                .split(';')
                .next()
                .and_then(|pair| pair.trim().strip_prefix("SID="))
            {
                *self.sid.lock().await = Some(value.to_string());
                return Ok(());
            }
        }

        Err(EngineError::Backend {
            reason: "qbittorrent login: no SID cookie in response".to_string(),
        })
    }

    /// Sends a request with the session cookie attached. On 403 the session
    /// is re-established exactly once and the request retried.
    async fn send_with_reauth<F>(&self, build: F) -> Result<reqwest::Response, EngineError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attach = |builder: reqwest::RequestBuilder, sid: &Option<String>| match sid {
            Some(sid) => builder.header(reqwest::header::COOKIE, format!("SID={sid}")),
            None => builder,
        };

        let sid = self.sid.lock().await.clone();
        let response = attach(build(), &sid).send().await?;
        if response.status() != reqwest::StatusCode::FORBIDDEN {
            return Ok(response);
        }

        self.login().await?;
        let sid = self.sid.lock().await.clone();
        Ok(attach(build(), &sid).send().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
    ) -> Result<T, EngineError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self.send_with_reauth(|| self.http.get(&url)).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("qbittorrent: unexpected status {status} from {path_and_query}: {body}"),
            });
        }

        Ok(response.json().await?)
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<reqwest::Response, EngineError> {
        let url = format!("{}{}", self.base_url, path);
        self.send_with_reauth(|| self.http.post(&url).form(form))
            .await
    }

    /// Fetches torrent metadata; an empty hash returns all torrents.
    async fn torrent_info(&self, hash: &str) -> Result<Vec<QbitTorrentInfo>, EngineError> {
        let path = if hash.is_empty() {
            "/api/v2/torrents/info".to_string()
        } else {
            format!("/api/v2/torrents/info?hashes={hash}")
        };
        self.get_json(&path).await
    }

    async fn files(&self, hash: &str) -> Result<Vec<QbitFileInfo>, EngineError> {
        self.get_json(&format!("/api/v2/torrents/files?hash={hash}"))
            .await
    }

    async fn piece_states(&self, hash: &str) -> Result<Vec<i64>, EngineError> {
        self.get_json(&format!("/api/v2/torrents/pieceStates?hash={hash}"))
            .await
    }

    /// Piece size comes from the properties endpoint; the info endpoint does
    /// not carry it on this backend.
    async fn piece_size(&self, hash: &str) -> Result<u64, EngineError> {
        #[derive(Deserialize)]
        struct Properties {
            #[serde(default)]
            piece_size: u64,
        }
        let props: Properties = self
            .get_json(&format!("/api/v2/torrents/properties?hash={hash}"))
            .await?;
        Ok(props.piece_size)
    }

    async fn set_file_priority(
        &self,
        hash: &str,
        ids: &[usize],
        priority: &str,
    ) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join("|");
        self.post_form(
            "/api/v2/torrents/filePrio",
            &[
                ("hash", hash.to_string()),
                ("id", id_list),
                ("priority", priority.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<(), EngineError> {
        let response = self
            .post_form(
                "/api/v2/torrents/delete",
                &[
                    ("hashes", hash.to_string()),
                    ("deleteFiles", delete_files.to_string()),
                ],
            )
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                reason: format!("qbittorrent remove torrent: unexpected status {status}: {body}"),
            });
        }
        Ok(())
    }

    /// Deletes every torrent except `keep_hash`, freeing bandwidth and disk
    /// for the active stream. Best-effort.
    async fn remove_other_torrents(&self, keep_hash: &str) {
        let torrents = match self.torrent_info("").await {
            Ok(torrents) => torrents,
            Err(err) => {
                tracing::warn!("qbittorrent: listing torrents for cleanup failed: {err}");
                return;
            }
        };

        for torrent in torrents {
            let hash = torrent.hash.to_lowercase();
            if hash != keep_hash {
                if let Err(err) = self.delete(&hash, true).await {
                    tracing::warn!("qbittorrent: removing {hash} failed: {err}");
                }
            }
        }
    }
}

// qBittorrent Web API response types.

#[derive(Debug, Default, Deserialize)]
struct QbitTorrentInfo {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    num_complete: u32,
    #[serde(default)]
    num_incomplete: u32,
    #[serde(default)]
    num_seeds: u32,
    #[serde(default)]
    num_leechs: u32,
    #[serde(default)]
    dlspeed: f64,
    #[serde(default)]
    upspeed: f64,
}

#[derive(Debug, Deserialize)]
struct QbitFileInfo {
    #[serde(default)]
    index: usize,
    name: String,
    size: u64,
}

fn to_torrent_info(torrent: &QbitTorrentInfo, files: &[QbitFileInfo]) -> TorrentInfo {
    let torrent_files: Vec<TorrentFile> = files
        .iter()
        .map(|f| TorrentFile {
            index: f.index,
            path: f.name.clone(),
            size: f.size,
        })
        .collect();

    let mut total_size = torrent.size;
    if total_size == 0 {
        total_size = torrent_files.iter().map(|f| f.size).sum();
    }

    let has_activity = torrent.num_seeds > 0
        || torrent.num_leechs > 0
        || torrent.dlspeed > 0.0
        || torrent.num_complete > 0;
    let stats = has_activity.then(|| TorrentStats {
        download_speed: torrent.dlspeed,
        upload_speed: torrent.upspeed,
        active_peers: torrent.num_seeds + torrent.num_leechs,
        total_peers: torrent.num_complete + torrent.num_incomplete,
        connected_seeders: torrent.num_seeds,
    });

    let hash = torrent.hash.to_lowercase();
    TorrentInfo {
        info_hash: hash.clone(),
        name: torrent.name.clone(),
        files: torrent_files,
        engine_id: hash,
        total_size,
        stats,
    }
}

/// Byte offset of a file within the torrent's linear layout: the sum of all
/// preceding file sizes.
fn file_offset_before(files: &[QbitFileInfo], file_index: usize) -> u64 {
    files[..file_index].iter().map(|f| f.size).sum()
}

fn piece_state_from_code(code: i64) -> PieceState {
    match code {
        2 => PieceState::Downloaded,
        1 => PieceState::Downloading,
        _ => PieceState::Missing,
    }
}

/// Piece state source backed by the qBittorrent pieceStates endpoint.
struct QbitPieceStates {
    client: Arc<QbitClient>,
    hash: String,
}

#[async_trait::async_trait]
impl PieceStateSource for QbitPieceStates {
    async fn piece_states(&self) -> Result<Vec<PieceState>, EngineError> {
        let codes = self.client.piece_states(&self.hash).await?;
        Ok(codes.into_iter().map(piece_state_from_code).collect())
    }
}

impl QBittorrentAdapter {
    /// Pins download bandwidth onto the target file: maximum priority for
    /// it, "do not download" for everything else. Best-effort.
    async fn focus_file(&self, hash: &str, target_index: usize, total_files: usize) {
        let skip_ids: Vec<usize> = (0..total_files).filter(|&i| i != target_index).collect();
        if let Err(err) = self
            .client
            .set_file_priority(hash, &skip_ids, PRIORITY_SKIP)
            .await
        {
            tracing::warn!("qbittorrent: deprioritizing other files failed: {err}");
        }
        if let Err(err) = self
            .client
            .set_file_priority(hash, &[target_index], PRIORITY_MAX)
            .await
        {
            tracing::warn!("qbittorrent: prioritizing target file failed: {err}");
        }
    }

    /// Waits for the torrent to be registered with resolved metadata that
    /// covers `file_index`. The wrapper adds torrents fire-and-forget, so
    /// the torrent may not exist yet when the stream request arrives.
    async fn wait_for_stream_ready(
        &self,
        hash: &str,
        file_index: usize,
    ) -> Result<(QbitTorrentInfo, Vec<QbitFileInfo>), EngineError> {
        let deadline = tokio::time::Instant::now() + STREAM_READY_WAIT;
        let mut last_file_count = 0usize;
        let mut seen_torrent = false;

        loop {
            if let Ok(mut torrents) = self.client.torrent_info(hash).await {
                if let Some(torrent) = torrents.pop() {
                    seen_torrent = true;
                    if let Ok(files) = self.client.files(hash).await {
                        last_file_count = files.len();
                        if file_index < files.len() {
                            return Ok((torrent, files));
                        }
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                if !seen_torrent {
                    return Err(EngineError::NotFound {
                        info_hash: hash.to_string(),
                    });
                }
                return Err(EngineError::IndexOutOfRange {
                    index: file_index,
                    available: last_file_count,
                });
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Polls the properties endpoint until it reports a non-zero piece size.
    async fn resolve_piece_size(&self, hash: &str) -> Result<u64, EngineError> {
        for _ in 0..PIECE_SIZE_RETRIES {
            if let Ok(size) = self.client.piece_size(hash).await {
                if size > 0 {
                    return Ok(size);
                }
            }
            tokio::time::sleep(PIECE_SIZE_RETRY_DELAY).await;
        }
        Err(EngineError::Backend {
            reason: format!("qbittorrent: piece size unavailable for {hash}"),
        })
    }

    /// Waits for the file to exist on disk. Files deprioritized to "do not
    /// download" are not allocated, so the path can lag the metadata.
    async fn wait_for_file_on_disk(&self, path: &std::path::Path) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + FILE_ON_DISK_WAIT;
        loop {
            if tokio::fs::metadata(path).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Backend {
                    reason: format!("qbittorrent: file never appeared on disk: {}", path.display()),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Serves a fully downloaded file straight from disk.
    async fn passthrough_from_disk(
        &self,
        path: &std::path::Path,
        total_size: u64,
        content_type: &str,
        request: &StreamRequest,
    ) -> Result<StreamResponse, EngineError> {
        let mut file = tokio::fs::File::open(path).await?;

        let (start, end, status) = match &request.range {
            Some(range) => {
                let (start, end) = parse_range_header(range, total_size)?;
                (start, end, 206)
            }
            None => (0, total_size.saturating_sub(1), 200),
        };
        let content_length = end - start + 1;

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let body = ReaderStream::new(file.take(content_length)).boxed();

        Ok(StreamResponse {
            body,
            content_length: Some(content_length),
            content_type: content_type.to_string(),
            status,
            headers: stream_headers(status, start, end, total_size, content_length),
        })
    }
}

fn stream_headers(
    status: u16,
    start: u64,
    end: u64,
    total_size: u64,
    content_length: u64,
) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Accept-Ranges".to_string(), "bytes".to_string()),
        ("Content-Length".to_string(), content_length.to_string()),
    ];
    if status == 206 {
        headers.push((
            "Content-Range".to_string(),
            format!("bytes {start}-{end}/{total_size}"),
        ));
    }
    headers
}

#[async_trait::async_trait]
impl TorrentEngine for QBittorrentAdapter {
    fn name(&self) -> &'static str {
        "qbittorrent"
    }

    async fn add_torrent(&self, magnet_uri: &str) -> Result<TorrentInfo, EngineError> {
        let info_hash =
            parse_info_hash_from_magnet(magnet_uri).ok_or_else(|| EngineError::InvalidInput {
                reason: "could not parse info hash from magnet URI".to_string(),
            })?;

        // Idempotency: a torrent already present is returned as-is.
        if let Some(existing) = self.get_torrent(&info_hash).await? {
            return Ok(existing);
        }

        let response = self
            .client
            .post_form(
                "/api/v2/torrents/add",
                &[
                    ("urls", magnet_uri.to_string()),
                    ("sequentialDownload", "true".to_string()),
                    ("firstLastPiecePrio", "true".to_string()),
                    (
                        "savepath",
                        self.download_path.to_string_lossy().into_owned(),
                    ),
                ],
            )
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body.trim() == "Fails." {
            return Err(EngineError::Backend {
                reason: format!("qbittorrent add torrent failed (status {status}): {body}"),
            });
        }

        // qBittorrent may take a moment to fetch metadata from peers.
        let deadline = tokio::time::Instant::now() + METADATA_WAIT;
        let mut last_info = None;
        while tokio::time::Instant::now() < deadline {
            let info = self.get_torrent(&info_hash).await?;
            if let Some(info) = &info {
                if !info.name.is_empty() && !info.files.is_empty() {
                    return Ok(info.clone());
                }
            }
            last_info = info;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // Return whatever we have, even with incomplete metadata.
        last_info.ok_or(EngineError::MetadataTimeout {
            info_hash,
        })
    }

    async fn preload_torrent(&self, magnet_uri: &str) -> Result<TorrentInfo, EngineError> {
        let info = self.add_torrent(magnet_uri).await?;

        // Metadata only: no payload bytes are allocated until streamed.
        let all_ids: Vec<usize> = (0..info.files.len()).collect();
        if let Err(err) = self
            .client
            .set_file_priority(&info.info_hash, &all_ids, PRIORITY_SKIP)
            .await
        {
            tracing::warn!("qbittorrent: preload deprioritization failed: {err}");
        }

        Ok(info)
    }

    async fn stream_file(
        &self,
        info_hash: &str,
        file_index: usize,
        request: &StreamRequest,
    ) -> Result<StreamResponse, EngineError> {
        let hash = info_hash.to_lowercase();

        let (torrent, files) = self.wait_for_stream_ready(&hash, file_index).await?;
        let target = &files[file_index];

        self.focus_file(&hash, file_index, files.len()).await;

        // Single-stream-at-a-time policy: everything else goes, without
        // delaying the stream start.
        let cleanup_client = Arc::clone(&self.client);
        let keep_hash = hash.clone();
        tokio::spawn(async move {
            cleanup_client.remove_other_torrents(&keep_hash).await;
        });

        let file_path = self.download_path.join(&target.name);
        // Engine-reported size, not disk stat: the file may be sparse or
        // partially allocated while the download is still running.
        let total_size = target.size;
        let content_type = content_type_for(&target.name);

        if torrent.progress >= 1.0 {
            return self
                .passthrough_from_disk(&file_path, total_size, content_type, request)
                .await;
        }

        let piece_size = self.resolve_piece_size(&hash).await?;
        let file_offset = file_offset_before(&files, file_index);

        self.wait_for_file_on_disk(&file_path).await?;
        let file = tokio::fs::File::open(&file_path).await?;

        let (start, end, status) = match &request.range {
            Some(range) => {
                let (start, end) = parse_range_header(range, total_size)?;
                (start, end, 206)
            }
            None => (0, total_size.saturating_sub(1), 200),
        };
        let content_length = end - start + 1;

        let states = Arc::new(QbitPieceStates {
            client: Arc::clone(&self.client),
            hash: hash.clone(),
        });
        let reader = PieceAwareReader::new(
            file,
            states,
            piece_size,
            file_offset,
            start,
            content_length,
            CancellationToken::new(),
        )
        .await?;

        Ok(StreamResponse {
            body: reader.into_stream(),
            content_length: Some(content_length),
            content_type: content_type.to_string(),
            status,
            headers: stream_headers(status, start, end, total_size, content_length),
        })
    }

    async fn remove_torrent(
        &self,
        info_hash: &str,
        delete_files: bool,
    ) -> Result<(), EngineError> {
        self.client
            .delete(&info_hash.to_lowercase(), delete_files)
            .await
    }

    async fn get_torrent(&self, info_hash: &str) -> Result<Option<TorrentInfo>, EngineError> {
        let hash = info_hash.to_lowercase();

        let torrents = self.client.torrent_info(&hash).await?;
        let Some(torrent) = torrents.first() else {
            return Ok(None);
        };

        let files = self.client.files(&hash).await?;
        Ok(Some(to_torrent_info(torrent, &files)))
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, EngineError> {
        let torrents = self.client.torrent_info("").await?;

        let mut result = Vec::with_capacity(torrents.len());
        for torrent in &torrents {
            // A torrent whose file list cannot be fetched is still listed,
            // with no files.
            let files = self
                .client
                .files(&torrent.hash.to_lowercase())
                .await
                .unwrap_or_default();
            result.push(to_torrent_info(torrent, &files));
        }

        Ok(result)
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/v2/app/version", self.client.base_url);
        let response = self
            .client
            .send_with_reauth(|| self.client.http.get(&url))
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Backend {
                reason: format!("qbittorrent ping: unexpected status {}", response.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "aabbccddeeff00112233445566778899aabbccdd";

    fn info_json(progress: f64) -> String {
        format!(
            r#"[{{"hash":"{}","name":"Big Movie","progress":{progress},"size":3000,
                "num_seeds":4,"num_leechs":2,"num_complete":10,"num_incomplete":5,
                "dlspeed":1024.0,"upspeed":256.0}}]"#,
            HASH.to_uppercase()
        )
    }

    fn files_json() -> &'static str {
        r#"[{"index":0,"name":"Big Movie/movie.mkv","size":2000},
            {"index":1,"name":"Big Movie/extras.mkv","size":1000}]"#
    }

    #[tokio::test]
    async fn test_add_torrent_is_idempotent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v2/torrents/info")
            .match_query(mockito::Matcher::UrlEncoded("hashes".into(), HASH.into()))
            .with_body(info_json(1.0))
            .create_async()
            .await;
        server
            .mock("GET", "/api/v2/torrents/files")
            .match_query(mockito::Matcher::UrlEncoded("hash".into(), HASH.into()))
            .with_body(files_json())
            .create_async()
            .await;
        let add_mock = server
            .mock("POST", "/api/v2/torrents/add")
            .expect(0)
            .create_async()
            .await;

        let adapter = QBittorrentAdapter::new(&server.url(), "/downloads", "admin", "adminadmin");
        let magnet = format!("magnet:?xt=urn:btih:{HASH}");

        let first = adapter.add_torrent(&magnet).await.unwrap();
        let second = adapter.add_torrent(&magnet).await.unwrap();

        // The torrent already existed, so no add request ever went out.
        add_mock.assert_async().await;
        assert_eq!(first.info_hash, HASH);
        assert_eq!(first.info_hash, second.info_hash);
        assert_eq!(first.engine_id, second.engine_id);
    }

    #[tokio::test]
    async fn test_add_torrent_rejects_bad_magnet() {
        let server = mockito::Server::new_async().await;
        let adapter = QBittorrentAdapter::new(&server.url(), "/downloads", "admin", "adminadmin");

        let result = adapter.add_torrent("http://not-a-magnet").await;
        assert!(matches!(result, Err(EngineError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_relogin_once_on_forbidden() {
        let mut server = mockito::Server::new_async().await;

        // First attempt without a session is rejected.
        server
            .mock("GET", "/api/v2/app/version")
            .match_header("Cookie", mockito::Matcher::Missing)
            .with_status(403)
            .create_async()
            .await;
        let login_mock = server
            .mock("POST", "/api/v2/auth/login")
            .with_status(200)
            .with_header("Set-Cookie", "SID=abc123; path=/")
            .with_body("Ok.")
            .expect(1)
            .create_async()
            .await;
        let retry_mock = server
            .mock("GET", "/api/v2/app/version")
            .match_header("Cookie", "SID=abc123")
            .with_status(200)
            .with_body("4.6.0")
            .expect(1)
            .create_async()
            .await;

        let adapter = QBittorrentAdapter::new(&server.url(), "/downloads", "admin", "adminadmin");
        adapter.ping().await.unwrap();

        login_mock.assert_async().await;
        retry_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_failure_surfaces_as_backend_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v2/app/version")
            .with_status(403)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v2/auth/login")
            .with_status(200)
            .with_body("Fails.")
            .create_async()
            .await;

        let adapter = QBittorrentAdapter::new(&server.url(), "/downloads", "admin", "wrong");
        let result = adapter.ping().await;
        assert!(matches!(result, Err(EngineError::Backend { .. })));
    }

    #[tokio::test]
    async fn test_get_torrent_converts_stats() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v2/torrents/info")
            .match_query(mockito::Matcher::UrlEncoded("hashes".into(), HASH.into()))
            .with_body(info_json(0.5))
            .create_async()
            .await;
        server
            .mock("GET", "/api/v2/torrents/files")
            .match_query(mockito::Matcher::UrlEncoded("hash".into(), HASH.into()))
            .with_body(files_json())
            .create_async()
            .await;

        let adapter = QBittorrentAdapter::new(&server.url(), "/downloads", "admin", "adminadmin");
        let info = adapter.get_torrent(&HASH.to_uppercase()).await.unwrap().unwrap();

        assert_eq!(info.info_hash, HASH);
        assert_eq!(info.files.len(), 2);
        assert_eq!(info.total_size, 3000);
        let stats = info.stats.unwrap();
        assert_eq!(stats.active_peers, 6);
        assert_eq!(stats.total_peers, 15);
        assert_eq!(stats.connected_seeders, 4);
    }

    #[tokio::test]
    async fn test_stream_complete_torrent_replays_range_from_disk() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v2/torrents/info")
            .match_query(mockito::Matcher::UrlEncoded("hashes".into(), HASH.into()))
            .with_body(info_json(1.0))
            .create_async()
            .await;
        server
            .mock("GET", "/api/v2/torrents/files")
            .match_query(mockito::Matcher::UrlEncoded("hash".into(), HASH.into()))
            .with_body(files_json())
            .create_async()
            .await;

        // The download directory holds the fully downloaded file.
        let downloads = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        std::fs::create_dir_all(downloads.path().join("Big Movie")).unwrap();
        std::fs::write(downloads.path().join("Big Movie/movie.mkv"), &data).unwrap();

        let adapter = QBittorrentAdapter::new(
            &server.url(),
            downloads.path().to_str().unwrap(),
            "admin",
            "adminadmin",
        );
        let request = StreamRequest {
            range: Some("bytes=100-199".to_string()),
            ..Default::default()
        };

        let response = adapter.stream_file(HASH, 0, &request).await.unwrap();

        assert_eq!(response.status, 206);
        assert_eq!(response.content_length, Some(100));
        assert_eq!(response.content_type, "video/x-matroska");
        assert!(response.headers.contains(&(
            "Content-Range".to_string(),
            "bytes 100-199/2000".to_string()
        )));

        let mut body = response.body;
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data[100..200].to_vec());
    }

    #[tokio::test]
    async fn test_stream_unknown_torrent_is_not_found() {
        tokio::time::pause();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v2/torrents/info")
            .match_query(mockito::Matcher::Any)
            .with_body("[]")
            .create_async()
            .await;

        let adapter = QBittorrentAdapter::new(&server.url(), "/downloads", "admin", "adminadmin");
        let result = adapter
            .stream_file(HASH, 0, &StreamRequest::default())
            .await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_file_offset_is_sum_of_preceding_sizes() {
        let files = vec![
            QbitFileInfo {
                index: 0,
                name: "a.mkv".to_string(),
                size: 100,
            },
            QbitFileInfo {
                index: 1,
                name: "b.mkv".to_string(),
                size: 250,
            },
            QbitFileInfo {
                index: 2,
                name: "c.mkv".to_string(),
                size: 50,
            },
        ];

        assert_eq!(file_offset_before(&files, 0), 0);
        assert_eq!(file_offset_before(&files, 1), 100);
        assert_eq!(file_offset_before(&files, 2), 350);
    }

    #[test]
    fn test_piece_state_codes() {
        assert_eq!(piece_state_from_code(0), PieceState::Missing);
        assert_eq!(piece_state_from_code(1), PieceState::Downloading);
        assert_eq!(piece_state_from_code(2), PieceState::Downloaded);
        assert_eq!(piece_state_from_code(99), PieceState::Missing);
    }
}
