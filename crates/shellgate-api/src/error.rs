use thiserror::Error;

/// Top-level error type for the `shellgate-api` crate.
///
/// Covers every failure mode across the wire layer: socket transport,
/// serialization, and the request/response protocol itself.
/// `shellgate-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// The socket is not connected -- nothing can be sent.
    #[error("Socket not connected")]
    NotConnected,

    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    SocketConnect(String),

    /// The socket closed while a request was outstanding.
    #[error("Socket closed: {reason}")]
    SocketClosed { reason: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Protocol ────────────────────────────────────────────────────
    /// The backend answered a request with a terminal `ERROR` state.
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// A request was abandoned before its terminal response arrived.
    #[error("Request {request_id} cancelled")]
    Cancelled { request_id: String },

    /// No terminal response arrived within the configured deadline.
    #[error("Request {request_id} timed out after {timeout_secs}s")]
    Timeout {
        request_id: String,
        timeout_secs: u64,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
