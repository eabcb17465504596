//! Uniform interface over heterogeneous torrent engines.
//!
//! Three backends are supported: TorrServer and rqbit stream over HTTP
//! directly, while qBittorrent downloads to a shared filesystem and the
//! bridge serves the bytes itself with a piece-aware reader.

mod piece_reader;
mod qbittorrent;
mod rqbit;
mod torrserver;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use piece_reader::{PieceAwareReader, PieceState, PieceStateSource};
pub use qbittorrent::QBittorrentAdapter;
pub use rqbit::RqbitAdapter;
pub use torrserver::TorrServerAdapter;

/// Errors that can bubble up from any engine adapter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed magnet URI, bad JSON, or other invalid caller input
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Description of what was rejected
        reason: String,
    },

    /// The engine does not know the requested torrent
    #[error("torrent {info_hash} not found")]
    NotFound {
        /// Lower-case info hash that was looked up
        info_hash: String,
    },

    /// File index past the end of the torrent's file list
    #[error("file index {index} out of range ({available} files)")]
    IndexOutOfRange {
        /// Requested file index
        index: usize,
        /// Number of files the torrent actually has
        available: usize,
    },

    /// The engine failed to resolve torrent metadata in time
    #[error("timed out waiting for torrent metadata: {info_hash}")]
    MetadataTimeout {
        /// Info hash of the torrent whose metadata never arrived
        info_hash: String,
    },

    /// Any upstream engine HTTP failure
    #[error("engine request failed: {reason}")]
    Backend {
        /// Description of the upstream failure
        reason: String,
    },

    /// Unsatisfiable Range header
    #[error("range not satisfiable: {range} (total size {total_size})")]
    RangeNotSatisfiable {
        /// The offending Range header value
        range: String,
        /// Total size of the requested file
        total_size: u64,
    },

    /// The operation's cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem errors while serving file-on-disk streams
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Backend {
            reason: err.to_string(),
        }
    }
}

/// A single file within a torrent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TorrentFile {
    pub index: usize,
    pub path: String,
    pub size: u64,
}

/// Live transfer statistics, when the engine reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct TorrentStats {
    pub download_speed: f64,
    pub upload_speed: f64,
    pub active_peers: u32,
    pub total_peers: u32,
    pub connected_seeders: u32,
}

/// Metadata about a torrent known to an engine.
///
/// `info_hash` is the canonical cross-engine key and is always lower-case
/// hex. `engine_id` is the engine's own identifier (rqbit uses numeric IDs).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TorrentInfo {
    pub info_hash: String,
    pub name: String,
    pub files: Vec<TorrentFile>,
    pub engine_id: String,
    pub total_size: u64,
    pub stats: Option<TorrentStats>,
}

/// Client request headers an adapter forwards to the engine.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub range: Option<String>,
    pub if_range: Option<String>,
    pub if_none_match: Option<String>,
    pub accept: Option<String>,
}

/// Byte stream body plus the headers the proxy forwards to the client.
pub struct StreamResponse {
    /// The video bytes. Reads may block until the engine has the data.
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
    /// Known content length, or `None` when the engine didn't say.
    pub content_length: Option<u64>,
    pub content_type: String,
    /// 200 or 206.
    pub status: u16,
    /// Response headers to pass through (hop-by-hop filtering happens in
    /// the proxy layer).
    pub headers: Vec<(String, String)>,
}

/// The contract all torrent engine adapters fulfill.
///
/// `add_torrent` must be idempotent: adding a magnet whose hash the engine
/// already holds returns the current info without re-adding.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Human-readable engine identifier ("torrserver", "rqbit", "qbittorrent").
    fn name(&self) -> &'static str;

    /// Sends a magnet link to the engine and returns the resulting torrent.
    async fn add_torrent(&self, magnet_uri: &str) -> Result<TorrentInfo, EngineError>;

    /// Like [`add_torrent`](Self::add_torrent), but only caches metadata
    /// where the backend supports it; no payload bytes are allocated.
    async fn preload_torrent(&self, magnet_uri: &str) -> Result<TorrentInfo, EngineError> {
        self.add_torrent(magnet_uri).await
    }

    /// Opens the video stream for one file of a torrent, honoring the
    /// client's Range headers.
    async fn stream_file(
        &self,
        info_hash: &str,
        file_index: usize,
        request: &StreamRequest,
    ) -> Result<StreamResponse, EngineError>;

    /// Removes a torrent. `delete_files` controls whether downloaded data
    /// is removed as well.
    async fn remove_torrent(&self, info_hash: &str, delete_files: bool)
    -> Result<(), EngineError>;

    /// Returns info about a specific torrent, or `None` if unknown.
    async fn get_torrent(&self, info_hash: &str) -> Result<Option<TorrentInfo>, EngineError>;

    /// Returns all torrents known to this engine.
    async fn list_torrents(&self) -> Result<Vec<TorrentInfo>, EngineError>;

    /// Checks that the engine is reachable.
    async fn ping(&self) -> Result<(), EngineError>;
}

/// Extracts the info hash from a magnet URI, normalized to lower-case.
///
/// Returns `None` for anything that is not a magnet URI with a `urn:btih`
/// exact topic; callers treat that as an input error.
pub fn parse_info_hash_from_magnet(magnet_uri: &str) -> Option<String> {
    let url = url::Url::parse(magnet_uri).ok()?;
    if url.scheme() != "magnet" {
        return None;
    }

    let xt = url
        .query_pairs()
        .find(|(key, _)| key == "xt")
        .map(|(_, value)| value.into_owned())?;

    // xt format: urn:btih:HASH
    let mut parts = xt.splitn(3, ':');
    let _urn = parts.next()?;
    if !parts.next()?.eq_ignore_ascii_case("btih") {
        return None;
    }
    let hash = parts.next()?;
    if hash.is_empty() {
        return None;
    }

    Some(hash.to_ascii_lowercase())
}

/// Parses an HTTP Range header like `bytes=0-499`, `bytes=500-` or
/// `bytes=-500` into inclusive start and end positions.
///
/// Multi-range requests use only the first range.
///
/// # Errors
/// - `EngineError::InvalidInput` - unsupported or malformed range format
/// - `EngineError::RangeNotSatisfiable` - start past end or past the file
pub fn parse_range_header(range_header: &str, total_size: u64) -> Result<(u64, u64), EngineError> {
    let Some(range_spec) = range_header.strip_prefix("bytes=") else {
        return Err(EngineError::InvalidInput {
            reason: format!("unsupported range format: {range_header}"),
        });
    };

    // Multiple ranges: only the first one is honored.
    let range_spec = range_spec.split(',').next().unwrap_or(range_spec);

    let Some((start_str, end_str)) = range_spec.split_once('-') else {
        return Err(EngineError::InvalidInput {
            reason: format!("invalid range format: {range_header}"),
        });
    };

    let start_str = start_str.trim();
    let end_str = end_str.trim();

    let (start, end) = if start_str.is_empty() {
        // Suffix range: "-500" means the last 500 bytes.
        let suffix_len: u64 = end_str.parse().map_err(|_| EngineError::InvalidInput {
            reason: format!("invalid range suffix: {range_header}"),
        })?;
        (total_size.saturating_sub(suffix_len), total_size.saturating_sub(1))
    } else {
        let start: u64 = start_str.parse().map_err(|_| EngineError::InvalidInput {
            reason: format!("invalid range start: {range_header}"),
        })?;
        let end = if end_str.is_empty() {
            // Open-ended range: "500-" means from byte 500 to the end.
            total_size.saturating_sub(1)
        } else {
            end_str.parse().map_err(|_| EngineError::InvalidInput {
                reason: format!("invalid range end: {range_header}"),
            })?
        };
        (start, end)
    };

    if start > end || start >= total_size {
        return Err(EngineError::RangeNotSatisfiable {
            range: range_header.to_string(),
            total_size,
        });
    }

    Ok((start, end.min(total_size.saturating_sub(1))))
}

/// Returns a MIME type based on the file extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("ts") => "video/mp2t",
        Some("wmv") => "video/x-ms-wmv",
        Some("flv") => "video/x-flv",
        Some("srt") | Some("sub") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Sums the total byte size across a torrent's files.
pub fn total_size_of(files: &[TorrentFile]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_hash_lowercases() {
        let hash = "ABCDEF0123456789ABCDEF0123456789ABCDEF01";
        let magnet = format!("magnet:?xt=urn:btih:{hash}&dn=Some.Movie");
        assert_eq!(
            parse_info_hash_from_magnet(&magnet),
            Some(hash.to_lowercase())
        );
    }

    #[test]
    fn test_parse_info_hash_with_trackers() {
        let magnet = "magnet:?xt=urn:btih:aabbccddeeff00112233445566778899aabbccdd&tr=udp%3A%2F%2Ftracker.example%3A1337";
        assert_eq!(
            parse_info_hash_from_magnet(magnet),
            Some("aabbccddeeff00112233445566778899aabbccdd".to_string())
        );
    }

    #[test]
    fn test_parse_info_hash_rejects_non_magnet() {
        assert_eq!(parse_info_hash_from_magnet("http://example.com"), None);
        assert_eq!(parse_info_hash_from_magnet("not a uri"), None);
        assert_eq!(parse_info_hash_from_magnet("magnet:?dn=no-xt"), None);
    }

    #[test]
    fn test_parse_info_hash_rejects_non_btih() {
        assert_eq!(
            parse_info_hash_from_magnet("magnet:?xt=urn:sha1:aabbccddeeff00112233445566778899aabbccdd"),
            None
        );
    }

    #[test]
    fn test_parse_range_explicit() {
        assert_eq!(parse_range_header("bytes=0-499", 1000).unwrap(), (0, 499));
        assert_eq!(
            parse_range_header("bytes=100-199", 1000).unwrap(),
            (100, 199)
        );
    }

    #[test]
    fn test_parse_range_open_ended() {
        assert_eq!(parse_range_header("bytes=500-", 1000).unwrap(), (500, 999));
    }

    #[test]
    fn test_parse_range_suffix() {
        assert_eq!(parse_range_header("bytes=-200", 1000).unwrap(), (800, 999));
        // Suffix larger than the file clamps to the whole file.
        assert_eq!(parse_range_header("bytes=-5000", 1000).unwrap(), (0, 999));
    }

    #[test]
    fn test_parse_range_multi_uses_first() {
        assert_eq!(
            parse_range_header("bytes=0-99,200-299", 1000).unwrap(),
            (0, 99)
        );
    }

    #[test]
    fn test_parse_range_clamps_end() {
        assert_eq!(
            parse_range_header("bytes=500-5000", 1000).unwrap(),
            (500, 999)
        );
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert!(matches!(
            parse_range_header("bytes=1000-1100", 1000),
            Err(EngineError::RangeNotSatisfiable { .. })
        ));
        assert!(matches!(
            parse_range_header("bytes=500-100", 1000),
            Err(EngineError::RangeNotSatisfiable { .. })
        ));
    }

    #[test]
    fn test_parse_range_invalid_format() {
        assert!(matches!(
            parse_range_header("items=0-5", 1000),
            Err(EngineError::InvalidInput { .. })
        ));
        assert!(matches!(
            parse_range_header("bytes=abc-def", 1000),
            Err(EngineError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_content_type_for_extensions() {
        assert_eq!(content_type_for("Movie.2024.1080p.mkv"), "video/x-matroska");
        assert_eq!(content_type_for("clip.MP4"), "video/mp4");
        assert_eq!(content_type_for("subs.srt"), "text/plain");
        assert_eq!(content_type_for("unknown.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
