//! Browser tab relay: HTTP long-poll rendezvous.
//!
//! The bridge enqueues fetch requests; an external browser tab long-polls
//! for them, performs the fetch with its own network identity, and posts the
//! response back. Each request is delivered to at most one polling call and
//! expires after 60 seconds without delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A browser is "connected" if it polled within this window.
const CONNECTED_WINDOW: Duration = Duration::from_secs(10);
/// Undelivered requests older than this are reaped on dequeue.
const PENDING_TTL: Duration = Duration::from_secs(60);
/// Long-poll granularity.
const POLL_TICK: Duration = Duration::from_millis(200);

/// Errors from the relay producer side.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No browser has polled recently; the caller should fall back to a
    /// direct fetch.
    #[error("relay: no browser connected")]
    Disconnected,

    /// The browser never responded within the caller's timeout.
    #[error("relay: timeout waiting for browser response")]
    Timeout,

    /// The browser reported a fetch failure.
    #[error("relay: browser fetch failed: {reason}")]
    Browser {
        /// Error string reported by the browser
        reason: String,
    },

    /// Response callback for an ID that is not (or no longer) waiting.
    #[error("relay: request {id} expired or unknown")]
    UnknownRequest { id: String },
}

/// Request handed to the browser for fetching on the bridge's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: String,
    pub url: String,
}

/// Response posted back by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub error: String,
}

struct PendingEntry {
    request: FetchRequest,
    created_at: Instant,
}

#[derive(Default)]
struct RelayState {
    pending: VecDeque<PendingEntry>,
    channels: HashMap<String, oneshot::Sender<FetchResponse>>,
}

/// Long-poll rendezvous server.
///
/// `next_id` and `last_poll` are atomics so the hot polling path never
/// contends with producers on the state lock.
pub struct RelayServer {
    state: Mutex<RelayState>,
    next_id: AtomicU64,
    last_poll: AtomicI64,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            next_id: AtomicU64::new(0),
            last_poll: AtomicI64::new(0),
        }
    }

    /// True if a browser polled within the last 10 seconds.
    pub fn connected(&self) -> bool {
        let last = self.last_poll.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        unix_now() - last < CONNECTED_WINDOW.as_secs() as i64
    }

    /// Sends a URL to the connected browser and waits for its response.
    ///
    /// Returns the body bytes and HTTP status. Fails fast with
    /// [`RelayError::Disconnected`] when no browser is polling.
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<(Vec<u8>, u16), RelayError> {
        if !self.connected() {
            return Err(RelayError::Disconnected);
        }

        let id = format!("r{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock().expect("relay lock");
            state.channels.insert(id.clone(), tx);
            state.pending.push_back(PendingEntry {
                request: FetchRequest {
                    id: id.clone(),
                    url: url.to_string(),
                },
                created_at: Instant::now(),
            });
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Strip the channel whether we got a response or not, so a late
        // callback sees Gone instead of a dangling slot.
        self.state
            .lock()
            .expect("relay lock")
            .channels
            .remove(&id);

        match result {
            Ok(Ok(response)) => {
                if !response.error.is_empty() {
                    return Err(RelayError::Browser {
                        reason: response.error,
                    });
                }
                Ok((response.body.into_bytes(), response.status_code))
            }
            // Sender dropped or timer fired: either way the response never
            // arrived in time.
            Ok(Err(_)) | Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Long-poll entry point for the browser. Returns the oldest pending
    /// request, waiting up to `max_wait` for one to appear.
    ///
    /// Every tick re-stamps the poll time so `connected()` stays true for
    /// the duration of the poll.
    pub async fn wait_for_request(&self, max_wait: Duration) -> Option<FetchRequest> {
        self.mark_polled();

        if let Some(request) = self.dequeue() {
            return Some(request);
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_TICK).await;
            self.mark_polled();
            if let Some(request) = self.dequeue() {
                return Some(request);
            }
        }
    }

    /// Delivers a browser callback to the waiting producer.
    ///
    /// # Errors
    /// - `RelayError::UnknownRequest` - the producer already timed out, or
    ///   the ID never existed
    pub fn complete(&self, id: &str, mut response: FetchResponse) -> Result<(), RelayError> {
        response.id = id.to_string();

        let sender = self
            .state
            .lock()
            .expect("relay lock")
            .channels
            .remove(id)
            .ok_or_else(|| RelayError::UnknownRequest { id: id.to_string() })?;

        // A dropped receiver means the producer gave up between our lookup
        // and this send; that race is equivalent to expiry.
        sender
            .send(response)
            .map_err(|_| RelayError::UnknownRequest { id: id.to_string() })
    }

    fn mark_polled(&self) {
        self.last_poll.store(unix_now(), Ordering::Relaxed);
    }

    /// Pops the oldest pending request, reaping entries past their TTL.
    fn dequeue(&self) -> Option<FetchRequest> {
        let mut state = self.state.lock().expect("relay lock");
        state
            .pending
            .retain(|entry| entry.created_at.elapsed() < PENDING_TTL);
        state.pending.pop_front().map(|entry| entry.request)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_fetch_fails_fast_when_disconnected() {
        let relay = RelayServer::new();

        let started = Instant::now();
        let result = relay.fetch("https://example.com", Duration::from_secs(2)).await;

        assert!(matches!(result, Err(RelayError::Disconnected)));
        // Never blocks: the two-second timeout is not consulted.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_fetch_times_out_without_response() {
        let relay = RelayServer::new();
        // A poll marks the browser connected.
        relay.wait_for_request(Duration::ZERO).await;

        let result = relay
            .fetch("https://example.com", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RelayError::Timeout)));
    }

    #[tokio::test]
    async fn test_callback_after_timeout_is_unknown() {
        let relay = RelayServer::new();
        relay.wait_for_request(Duration::ZERO).await;

        let _ = relay
            .fetch("https://example.com", Duration::from_millis(20))
            .await;

        let result = relay.complete(
            "r1",
            FetchResponse {
                id: String::new(),
                status_code: 200,
                body: "late".to_string(),
                error: String::new(),
            },
        );
        assert!(matches!(result, Err(RelayError::UnknownRequest { .. })));
    }

    #[tokio::test]
    async fn test_round_trip_delivers_response() {
        let relay = Arc::new(RelayServer::new());
        relay.wait_for_request(Duration::ZERO).await;

        let browser = Arc::clone(&relay);
        let handle = tokio::spawn(async move {
            let request = browser
                .wait_for_request(Duration::from_secs(5))
                .await
                .expect("a request should arrive");
            assert_eq!(request.url, "https://example.com/manifest.json");
            browser
                .complete(
                    &request.id,
                    FetchResponse {
                        id: String::new(),
                        status_code: 200,
                        body: "{\"name\":\"ok\"}".to_string(),
                        error: String::new(),
                    },
                )
                .unwrap();
        });

        let (body, status) = relay
            .fetch("https://example.com/manifest.json", Duration::from_secs(5))
            .await
            .unwrap();

        handle.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"{\"name\":\"ok\"}");
    }

    #[tokio::test]
    async fn test_browser_error_is_surfaced() {
        let relay = Arc::new(RelayServer::new());
        relay.wait_for_request(Duration::ZERO).await;

        let browser = Arc::clone(&relay);
        tokio::spawn(async move {
            let request = browser
                .wait_for_request(Duration::from_secs(5))
                .await
                .unwrap();
            browser
                .complete(
                    &request.id,
                    FetchResponse {
                        id: String::new(),
                        status_code: 0,
                        body: String::new(),
                        error: "net::ERR_BLOCKED".to_string(),
                    },
                )
                .unwrap();
        });

        let result = relay
            .fetch("https://blocked.example", Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(RelayError::Browser { .. })));
    }

    #[tokio::test]
    async fn test_dequeue_is_exclusive() {
        let relay = Arc::new(RelayServer::new());
        relay.wait_for_request(Duration::ZERO).await;

        // Producer enqueues one request and waits in the background.
        let producer = Arc::clone(&relay);
        let fetch_handle = tokio::spawn(async move {
            let _ = producer
                .fetch("https://example.com", Duration::from_secs(1))
                .await;
        });

        // Give the producer time to enqueue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = relay.wait_for_request(Duration::ZERO).await;
        let second = relay.wait_for_request(Duration::ZERO).await;

        assert!(first.is_some());
        assert!(second.is_none());
        fetch_handle.await.unwrap();
    }
}
