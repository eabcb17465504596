//! Piece-aware file reading for the file-on-disk backend.
//!
//! Converts an asynchronous piecewise download into an in-order byte stream:
//! the HTTP response starts immediately and reads only block when they reach
//! bytes the engine has not finished downloading. Already-confirmed pieces
//! are served straight from disk without consulting the engine again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::EngineError;

/// Download state of a single piece as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Downloading,
    Downloaded,
}

/// Source of per-piece download states for one torrent.
#[async_trait]
pub trait PieceStateSource: Send + Sync {
    /// Returns the state of every piece in the torrent, in piece order.
    async fn piece_states(&self) -> Result<Vec<PieceState>, EngineError>;
}

const READ_CHUNK_SIZE: u64 = 64 * 1024;
const PIECE_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Reader that intercepts every read and waits for the underlying piece.
///
/// Positions are file-relative; `file_offset` places the file within the
/// torrent's linear byte layout so positions map onto piece indices. The
/// confirmed frontier (`last_confirmed`) only ever advances, so reads behind
/// it never touch the piece-states endpoint.
pub struct PieceAwareReader {
    file: tokio::fs::File,
    states: Arc<dyn PieceStateSource>,
    piece_size: u64,
    file_offset: u64,
    position: u64,
    remaining: u64,
    last_confirmed: Option<u64>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl PieceAwareReader {
    /// Creates a reader serving `length` bytes starting at `start_pos`.
    ///
    /// # Errors
    /// - `EngineError::InvalidInput` - zero piece size
    /// - `EngineError::Io` - seeking to the start position failed
    pub async fn new(
        mut file: tokio::fs::File,
        states: Arc<dyn PieceStateSource>,
        piece_size: u64,
        file_offset: u64,
        start_pos: u64,
        length: u64,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        if piece_size == 0 {
            return Err(EngineError::InvalidInput {
                reason: "piece size must be non-zero".to_string(),
            });
        }

        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(start_pos)).await?;

        Ok(Self {
            file,
            states,
            piece_size,
            file_offset,
            position: start_pos,
            remaining: length,
            last_confirmed: None,
            cancel,
            poll_interval: PIECE_POLL_INTERVAL,
        })
    }

    /// Highest piece index confirmed downloaded so far.
    pub fn last_confirmed_piece(&self) -> Option<u64> {
        self.last_confirmed
    }

    /// Reads the next chunk, waiting for its piece if necessary.
    ///
    /// Returns `Ok(None)` once the requested length is exhausted. The chunk
    /// never crosses the confirmed frontier, so the caller can never observe
    /// bytes the engine has not finished.
    ///
    /// # Errors
    /// - `EngineError::Cancelled` - the cancellation token fired mid-wait
    /// - `EngineError::Io` - reading from the file failed
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, EngineError> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let piece_index = (self.file_offset + self.position) / self.piece_size;
        if self.last_confirmed.is_none_or(|confirmed| piece_index > confirmed) {
            self.wait_for_piece(piece_index).await?;
        }

        let confirmed = self
            .last_confirmed
            .expect("wait_for_piece always sets the frontier");
        let frontier = (confirmed + 1) * self.piece_size;
        let available = frontier.saturating_sub(self.file_offset + self.position);
        let len = READ_CHUNK_SIZE.min(self.remaining).min(available).max(1) as usize;

        let mut buf = vec![0u8; len];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);

        self.position += n as u64;
        self.remaining -= n as u64;

        Ok(Some(Bytes::from(buf)))
    }

    /// Consumes the reader into an HTTP body stream.
    pub fn into_stream(mut self) -> BoxStream<'static, std::io::Result<Bytes>> {
        Box::pin(async_stream::try_stream! {
            while let Some(chunk) = self.read_chunk().await.map_err(std::io::Error::other)? {
                yield chunk;
            }
        })
    }

    /// Polls the engine until `piece_index` is downloaded, then advances the
    /// frontier across the contiguous downloaded run to amortize future reads.
    async fn wait_for_piece(&mut self, piece_index: u64) -> Result<(), EngineError> {
        loop {
            match self.states.piece_states().await {
                Ok(states) => {
                    if states.get(piece_index as usize) == Some(&PieceState::Downloaded) {
                        let mut confirmed = piece_index;
                        while states.get(confirmed as usize + 1) == Some(&PieceState::Downloaded) {
                            confirmed += 1;
                        }
                        if self.last_confirmed.is_none_or(|c| confirmed > c) {
                            self.last_confirmed = Some(confirmed);
                        }
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!("piece state poll failed: {err} (retrying)");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
