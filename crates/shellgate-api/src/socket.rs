//! WebSocket transport to the shell backend, with auto-reconnect.
//!
//! Owns the physical connection: outgoing frames are queued through an
//! `mpsc` channel, incoming text frames fan out through a
//! [`tokio::sync::broadcast`] channel, and the connection state is
//! observable through a `watch` channel. Reconnection uses exponential
//! backoff with jitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use shellgate_api::socket::{ReconnectConfig, SocketHandle};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let cancel = CancellationToken::new();
//! let url = Url::parse("https://127.0.0.1:8000")?;
//!
//! let handle = SocketHandle::connect(url, ReconnectConfig::default(), cancel.clone())?;
//! let mut frames = handle.subscribe_frames();
//!
//! while let Ok(frame) = frames.recv().await {
//!     println!("{frame}");
//! }
//!
//! handle.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

// ── Channel capacities ───────────────────────────────────────────────

const FRAME_CHANNEL_CAPACITY: usize = 1024;
const OUTGOING_QUEUE_CAPACITY: usize = 256;

// ── SocketState ──────────────────────────────────────────────────────

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── URL derivation ───────────────────────────────────────────────────

/// Derive the backend WebSocket endpoint from a normal http(s) URL.
///
/// The backend serves its socket at `/ws1.ws` on the same host and port.
pub fn ws_endpoint(mut url: Url) -> Result<Url, Error> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // `set_scheme` rejects nothing for ws/wss here; map failure anyway.
    url.set_scheme(scheme)
        .map_err(|()| Error::SocketConnect(format!("cannot derive ws scheme for {url}")))?;
    url.set_path("ws1.ws");
    Ok(url)
}

// ── SocketHandle ─────────────────────────────────────────────────────

/// Handle to a running socket task.
///
/// Cheaply cloneable. Drop all clones and call
/// [`shutdown`](Self::shutdown) to tear down the background task.
#[derive(Clone)]
pub struct SocketHandle {
    out_tx: mpsc::Sender<String>,
    frame_tx: broadcast::Sender<Arc<str>>,
    state_rx: watch::Receiver<SocketState>,
    cancel: CancellationToken,
}

impl SocketHandle {
    /// Spawn the connection loop against the given http(s) base URL.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background. Observe [`state`](Self::state) to learn when the
    /// socket is usable.
    pub fn connect(
        base_url: Url,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let ws_url = ws_endpoint(base_url)?;

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SocketState::Disconnected);

        let task_cancel = cancel.clone();
        let task_frame_tx = frame_tx.clone();
        tokio::spawn(async move {
            socket_loop(ws_url, out_rx, task_frame_tx, state_tx, reconnect, task_cancel).await;
        });

        Ok(Self {
            out_tx,
            frame_tx,
            state_rx,
            cancel,
        })
    }

    /// Queue a text frame for sending.
    ///
    /// Fails fast when the socket is not connected -- callers surface this
    /// as a transport error rather than buffering across reconnects.
    pub fn send(&self, frame: String) -> Result<(), Error> {
        if *self.state_rx.borrow() != SocketState::Connected {
            return Err(Error::NotConnected);
        }
        self.out_tx
            .try_send(frame)
            .map_err(|_| Error::NotConnected)
    }

    /// Get a new receiver for incoming text frames.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Arc<str>> {
        self.frame_tx.subscribe()
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<SocketState> {
        self.state_rx.clone()
    }

    /// True if the socket is currently connected.
    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == SocketState::Connected
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background connection loop ───────────────────────────────────────

/// Main loop: connect → pump frames → on error, backoff → reconnect.
async fn socket_loop(
    ws_url: Url,
    mut out_rx: mpsc::Receiver<String>,
    frame_tx: broadcast::Sender<Arc<str>>,
    state_tx: watch::Sender<SocketState>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(SocketState::Connecting);

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = pump_connection(&ws_url, &mut out_rx, &frame_tx, &state_tx, &cancel) => {
                let _ = state_tx.send(SocketState::Disconnected);

                match result {
                    // Clean disconnect (server close frame or stream ended).
                    Ok(()) => {
                        tracing::info!("socket disconnected cleanly, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "socket error");

                        if let Some(max) = reconnect.max_retries {
                            if attempt >= max {
                                tracing::error!(
                                    max_retries = max,
                                    "reconnection limit reached, giving up"
                                );
                                break;
                            }
                        }

                        let delay = calculate_backoff(attempt, &reconnect);
                        tracing::info!(
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            attempt,
                            "waiting before reconnect"
                        );

                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    let _ = state_tx.send(SocketState::Disconnected);
    tracing::debug!("socket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one connection and pump frames both ways until it drops.
async fn pump_connection(
    url: &Url,
    out_rx: &mut mpsc::Receiver<String>,
    frame_tx: &broadcast::Sender<Arc<str>>,
    state_tx: &watch::Sender<SocketState>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(url = %url, "connecting to backend socket");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::SocketConnect(e.to_string()))?;

    tracing::info!("backend socket connected");
    let _ = state_tx.send(SocketState::Connected);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        write
                            .send(tungstenite::Message::text(frame))
                            .await
                            .map_err(|e| Error::SocketClosed { reason: e.to_string() })?;
                    }
                    // All senders dropped -- treat as shutdown.
                    None => return Ok(()),
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        // Ignore send errors -- no active subscribers right now.
                        let _ = frame_tx.send(Arc::from(text.as_str()));
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite replies with pongs automatically.
                        tracing::trace!("socket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "close frame received");
                        } else {
                            tracing::info!("close frame received (no payload)");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(Error::SocketClosed { reason: e.to_string() });
                    }
                    None => {
                        tracing::info!("socket stream ended");
                        return Ok(());
                    }
                    _ => {
                        // Binary, Pong, Frame -- the backend never sends these.
                    }
                }
            }
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25%, deterministically seeded from the attempt number --
/// enough to spread reconnection storms without pulling in an RNG.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * ((f64::from(attempt) * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        let d10 = calculate_backoff(10, &config);
        // With jitter factor up to 1.25, max effective is 12.5s.
        assert!(
            d10 <= Duration::from_secs(13),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn ws_endpoint_from_https() {
        let url = Url::parse("https://127.0.0.1:8000/some/path").unwrap();
        let ws = ws_endpoint(url).unwrap();
        assert_eq!(ws.as_str(), "wss://127.0.0.1:8000/ws1.ws");
    }

    #[test]
    fn ws_endpoint_from_http() {
        let url = Url::parse("http://localhost:8000").unwrap();
        let ws = ws_endpoint(url).unwrap();
        assert_eq!(ws.as_str(), "ws://localhost:8000/ws1.ws");
    }

    #[tokio::test]
    async fn send_fails_when_disconnected() {
        let cancel = CancellationToken::new();
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        let handle = SocketHandle::connect(url, ReconnectConfig::default(), cancel.clone()).unwrap();

        // Freshly spawned -- state is Disconnected or Connecting, never Connected.
        let result = handle.send("{}".into());
        assert!(matches!(result, Err(Error::NotConnected)));

        cancel.cancel();
    }
}
