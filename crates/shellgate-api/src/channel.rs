//! Request correlator.
//!
//! Maps each outgoing request to exactly one logical completion, even when
//! the backend emits several messages per request: zero or more `PENDING`
//! progress messages followed by one terminal `OK` or `ERROR`.
//!
//! The pending map is the single source of truth for outstanding requests.
//! An id is registered before its request hits the wire and removed when a
//! terminal message arrives, the caller cancels, the deadline expires, or
//! the socket drops. Messages for ids with no entry are dropped with a
//! debug log -- late arrivals after cancellation are benign.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::protocol::{
    AuthenticateRequest, ResponseState, ServerMessage, ShellRequest, ShellResponse,
};
use crate::socket::{SocketHandle, SocketState};

// ── Channel capacities / intervals ───────────────────────────────────

const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ── ChannelConfig ────────────────────────────────────────────────────

/// Correlator tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deadline for a terminal response. `None` disables expiry -- an
    /// unanswered request then stays resident until cancel or disconnect.
    pub request_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

// ── PendingReply ─────────────────────────────────────────────────────

/// Caller-side handle for one in-flight request.
///
/// `PENDING` responses stream through [`next_pending`](Self::next_pending)
/// in arrival order; [`wait`](Self::wait) resolves on the terminal
/// response. Dropping the handle abandons the request (the entry is
/// reaped on terminal arrival, expiry, or disconnect).
pub struct PendingReply {
    request_id: String,
    progress: mpsc::UnboundedReceiver<ShellResponse>,
    terminal: oneshot::Receiver<Result<ShellResponse, Error>>,
}

impl PendingReply {
    /// The correlation token assigned to this request.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Receive the next `PENDING` response, or `None` once the stream is
    /// closed (terminal response processed, or request removed).
    pub async fn next_pending(&mut self) -> Option<ShellResponse> {
        self.progress.recv().await
    }

    /// Await the terminal response. `OK` resolves with the response,
    /// `ERROR` rejects with the backend's message text.
    pub async fn wait(self) -> Result<ShellResponse, Error> {
        let request_id = self.request_id;
        self.terminal
            .await
            .map_err(|_| Error::Cancelled { request_id })?
    }

    /// Drain remaining `PENDING` payloads, then await the terminal
    /// response. Returns the accumulated partial results alongside it.
    pub async fn collect(mut self) -> Result<(Vec<Value>, ShellResponse), Error> {
        let mut partials = Vec::new();

        loop {
            tokio::select! {
                // Progress first: per-id FIFO means everything queued ahead
                // of the terminal message must be delivered before it.
                biased;
                Some(response) = self.progress.recv() => {
                    if let Some(result) = response.result {
                        partials.push(result);
                    }
                }
                terminal = &mut self.terminal => {
                    let request_id = self.request_id.clone();
                    let done = terminal.map_err(|_| Error::Cancelled { request_id })??;

                    // Progress already queued before the terminal send.
                    while let Ok(response) = self.progress.try_recv() {
                        if let Some(result) = response.result {
                            partials.push(result);
                        }
                    }

                    return Ok((partials, done));
                }
            }
        }
    }
}

// ── Pending map ──────────────────────────────────────────────────────

struct PendingEntry {
    reply: Option<oneshot::Sender<Result<ShellResponse, Error>>>,
    progress: mpsc::UnboundedSender<ShellResponse>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

/// Bookkeeping for outstanding requests, keyed by `request_id`.
///
/// Kept separate from the socket plumbing so the correlation rules are
/// testable without a live connection.
pub(crate) struct PendingMap {
    entries: DashMap<String, PendingEntry>,
}

impl PendingMap {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a fresh id and hand back the caller side.
    pub(crate) fn register(&self, request_id: String, timeout: Option<Duration>) -> PendingReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        self.entries.insert(
            request_id.clone(),
            PendingEntry {
                reply: Some(reply_tx),
                progress: progress_tx,
                deadline: timeout.map(|t| Instant::now() + t),
                timeout,
            },
        );

        PendingReply {
            request_id,
            progress: progress_rx,
            terminal: reply_rx,
        }
    }

    /// Route one response to its waiting caller.
    ///
    /// Returns `false` when no entry exists for the id -- the caller drops
    /// the message. `PENDING` responses are forwarded without touching the
    /// entry; terminal responses consume it.
    pub(crate) fn dispatch(&self, response: ShellResponse) -> bool {
        if response.request_state.state.is_terminal() {
            let Some((_, mut entry)) = self.entries.remove(&response.request_id) else {
                return false;
            };

            let outcome = if response.request_state.state == ResponseState::Error {
                Err(Error::Backend {
                    message: response.request_state.msg.clone(),
                })
            } else {
                Ok(response)
            };

            if let Some(reply) = entry.reply.take() {
                // A dropped caller is fine -- the entry is gone either way.
                let _ = reply.send(outcome);
            }
            return true;
        }

        let Some(entry) = self.entries.get(&response.request_id) else {
            return false;
        };
        let _ = entry.progress.send(response);
        true
    }

    /// Abandon an outstanding request. Later messages for the id are
    /// dropped silently. Returns `false` if the id was not pending.
    pub(crate) fn cancel(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Reject every entry whose deadline has passed. Returns the number
    /// of requests expired.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.deadline.is_some_and(|d| d <= now))
            .map(|e| e.key().clone())
            .collect();

        for request_id in &expired {
            if let Some((_, mut entry)) = self.entries.remove(request_id) {
                let timeout_secs = entry.timeout.map_or(0, |t| t.as_secs());
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(Err(Error::Timeout {
                        request_id: request_id.clone(),
                        timeout_secs,
                    }));
                }
            }
        }

        expired.len()
    }

    /// Reject every outstanding request (socket dropped).
    pub(crate) fn fail_all(&self, reason: &str) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for request_id in ids {
            if let Some((_, mut entry)) = self.entries.remove(&request_id) {
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(Err(Error::SocketClosed {
                        reason: reason.to_owned(),
                    }));
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── ShellChannel ─────────────────────────────────────────────────────

/// The correlator: socket + pending map + dispatch/sweeper tasks.
///
/// Cheaply cloneable via `Arc<ChannelInner>`.
#[derive(Clone)]
pub struct ShellChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    socket: SocketHandle,
    pending: PendingMap,
    config: ChannelConfig,
    notification_tx: broadcast::Sender<Arc<ServerMessage>>,
}

impl ShellChannel {
    /// Wire a correlator onto a socket and spawn its background tasks
    /// (frame dispatch and, when a timeout is configured, the pending
    /// sweeper). Tasks stop when `cancel` fires.
    pub fn spawn(socket: SocketHandle, config: ChannelConfig, cancel: &CancellationToken) -> Self {
        let (notification_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                socket,
                pending: PendingMap::new(),
                config,
                notification_tx,
            }),
        };

        channel.spawn_dispatch(cancel.clone());
        if channel.inner.config.request_timeout.is_some() {
            channel.spawn_sweeper(cancel.clone());
        }

        channel
    }

    /// Send a command. Fails immediately when the socket is down.
    pub fn submit(&self, command: &str, args: Value) -> Result<PendingReply, Error> {
        if !self.inner.socket.is_connected() {
            return Err(Error::NotConnected);
        }

        let request_id = Uuid::new_v4().to_string();
        let request = ShellRequest::execute(request_id.clone(), command, args);
        let frame = serde_json::to_string(&request)?;

        let reply = self
            .inner
            .pending
            .register(request_id.clone(), self.inner.config.request_timeout);

        if let Err(e) = self.inner.socket.send(frame) {
            // Never leave an entry for a request that was not sent.
            self.inner.pending.cancel(&request_id);
            return Err(e);
        }

        tracing::debug!(request_id = %request_id, command, "request submitted");
        Ok(reply)
    }

    /// One-shot convenience: submit and await the terminal response,
    /// discarding progress.
    pub async fn execute(&self, command: &str, args: Value) -> Result<ShellResponse, Error> {
        self.submit(command, args)?.wait().await
    }

    /// Authenticate against the backend. The envelope differs from
    /// `execute` but the response flow is the same: one terminal `OK`
    /// (or `ERROR` with the denial message).
    pub fn authenticate(&self, username: &str, password: &str) -> Result<PendingReply, Error> {
        if !self.inner.socket.is_connected() {
            return Err(Error::NotConnected);
        }

        let request_id = Uuid::new_v4().to_string();
        let request = AuthenticateRequest::new(request_id.clone(), username, password);
        let frame = serde_json::to_string(&request)?;

        let reply = self
            .inner
            .pending
            .register(request_id.clone(), self.inner.config.request_timeout);

        if let Err(e) = self.inner.socket.send(frame) {
            self.inner.pending.cancel(&request_id);
            return Err(e);
        }

        tracing::debug!(request_id = %request_id, username, "authentication submitted");
        Ok(reply)
    }

    /// Abandon an outstanding request.
    pub fn cancel(&self, request_id: &str) -> bool {
        let removed = self.inner.pending.cancel(request_id);
        if removed {
            tracing::debug!(request_id, "request cancelled");
        }
        removed
    }

    /// Subscribe to out-of-band messages (web session announcement and
    /// other frames without a `request_id`).
    pub fn notifications(&self) -> broadcast::Receiver<Arc<ServerMessage>> {
        self.inner.notification_tx.subscribe()
    }

    /// Reject every outstanding request, e.g. when the session that owns
    /// this channel is torn down.
    pub fn abort_outstanding(&self, reason: &str) {
        self.inner.pending.fail_all(reason);
    }

    /// Number of requests currently awaiting a terminal response.
    pub fn outstanding(&self) -> usize {
        self.inner.pending.len()
    }

    /// The underlying socket.
    pub fn socket(&self) -> &SocketHandle {
        &self.inner.socket
    }

    // ── Background tasks ─────────────────────────────────────────────

    fn spawn_dispatch(&self, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let mut frames = inner.socket.subscribe_frames();
        let mut state = inner.socket.state();

        tokio::spawn(async move {
            let mut was_connected = *state.borrow() == SocketState::Connected;

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = *state.borrow() == SocketState::Connected;
                        if was_connected && !connected {
                            tracing::warn!(
                                outstanding = inner.pending.len(),
                                "socket dropped, failing outstanding requests"
                            );
                            inner.pending.fail_all("connection lost");
                        }
                        was_connected = connected;
                    }
                    frame = frames.recv() => {
                        match frame {
                            Ok(raw) => inner.handle_frame(&raw),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(skipped = n, "frame dispatch lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }

            tracing::debug!("dispatch task exiting");
        });
    }

    fn spawn_sweeper(&self, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let expired = inner.pending.expire(Instant::now());
                        if expired > 0 {
                            tracing::warn!(expired, "requests timed out");
                        }
                    }
                }
            }
        });
    }
}

impl ChannelInner {
    fn handle_frame(&self, raw: &str) {
        match ServerMessage::parse(raw) {
            Ok(ServerMessage::Response(response)) => {
                let request_id = response.request_id.clone();
                if !self.pending.dispatch(response) {
                    // Late arrival after cancel/terminal, or a response-shaped
                    // frame we never asked for. Both are benign.
                    tracing::debug!(request_id = %request_id, "dropping response with no pending request");
                }
            }
            Ok(message @ (ServerMessage::WebSession(_) | ServerMessage::Notification(_))) => {
                let _ = self.notification_tx.send(Arc::new(message));
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to parse incoming frame");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::RequestState;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pending_response(id: &str, result: Value) -> ShellResponse {
        ShellResponse {
            request_id: id.to_owned(),
            request_state: RequestState {
                state: ResponseState::Pending,
                msg: String::new(),
            },
            result: Some(result),
            done: false,
        }
    }

    fn ok_response(id: &str) -> ShellResponse {
        ShellResponse {
            request_id: id.to_owned(),
            request_state: RequestState {
                state: ResponseState::Ok,
                msg: String::new(),
            },
            result: None,
            done: true,
        }
    }

    fn error_response(id: &str, msg: &str) -> ShellResponse {
        ShellResponse {
            request_id: id.to_owned(),
            request_state: RequestState {
                state: ResponseState::Error,
                msg: msg.to_owned(),
            },
            result: None,
            done: false,
        }
    }

    #[tokio::test]
    async fn pending_delivered_before_terminal() {
        let map = PendingMap::new();
        let reply = map.register("r1".into(), None);

        assert!(map.dispatch(pending_response("r1", json!(1))));
        assert!(map.dispatch(pending_response("r1", json!(2))));
        assert!(map.dispatch(ok_response("r1")));

        let (partials, done) = reply.collect().await.unwrap();
        assert_eq!(partials, vec![json!(1), json!(2)]);
        assert!(done.done);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn terminal_error_rejects_with_message() {
        let map = PendingMap::new();
        let reply = map.register("r1".into(), None);

        map.dispatch(error_response("r1", "Unknown command"));

        let err = reply.wait().await.unwrap_err();
        assert!(matches!(err, Error::Backend { ref message } if message == "Unknown command"));
    }

    #[tokio::test]
    async fn late_response_after_terminal_is_dropped() {
        let map = PendingMap::new();
        let reply = map.register("r1".into(), None);

        assert!(map.dispatch(ok_response("r1")));
        // Stray messages for a completed id must not throw or resolve anything.
        assert!(!map.dispatch(pending_response("r1", json!(9))));
        assert!(!map.dispatch(ok_response("r1")));

        let done = reply.wait().await.unwrap();
        assert!(done.done);
    }

    #[tokio::test]
    async fn response_after_cancel_is_dropped() {
        let map = PendingMap::new();
        let reply = map.register("r1".into(), None);

        assert!(map.cancel("r1"));
        assert!(!map.cancel("r1"));
        assert!(!map.dispatch(ok_response("r1")));

        let err = reply.wait().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let map = PendingMap::new();
        assert!(!map.dispatch(ok_response("never-registered")));
    }

    #[tokio::test]
    async fn ids_are_independent() {
        let map = PendingMap::new();
        let reply_a = map.register("a".into(), None);
        let reply_b = map.register("b".into(), None);

        map.dispatch(pending_response("b", json!("only-b")));
        map.dispatch(ok_response("a"));
        map.dispatch(ok_response("b"));

        let (partials_a, _) = reply_a.collect().await.unwrap();
        assert!(partials_a.is_empty());

        let (partials_b, _) = reply_b.collect().await.unwrap();
        assert_eq!(partials_b, vec![json!("only-b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_rejects_with_timeout() {
        let map = PendingMap::new();
        let reply = map.register("r1".into(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(map.expire(Instant::now()), 1);
        assert_eq!(map.len(), 0);

        let err = reply.wait().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_secs: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_spares_requests_within_deadline() {
        let map = PendingMap::new();
        let _reply = map.register("r1".into(), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(map.expire(Instant::now()), 0);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_rejects_everything() {
        let map = PendingMap::new();
        let reply_a = map.register("a".into(), None);
        let reply_b = map.register("b".into(), None);

        map.fail_all("connection lost");
        assert_eq!(map.len(), 0);

        for reply in [reply_a, reply_b] {
            let err = reply.wait().await.unwrap_err();
            assert!(matches!(err, Error::SocketClosed { .. }));
        }
    }

    /// The literal fixture from the backend's own test corpus:
    /// `gui.users.get_user_id` answers with a numeric PENDING result,
    /// then an OK terminal with `done: true`.
    #[tokio::test]
    async fn get_user_id_fixture_flow() {
        let map = PendingMap::new();
        let request = ShellRequest::execute(
            "fixture-1",
            "gui.users.get_user_id",
            json!({ "username": "LocalAdministrator" }),
        );
        let reply = map.register(request.request_id.clone(), None);

        let first = r#"{
            "request_id": "fixture-1",
            "request_state": { "type": "PENDING", "msg": "" },
            "result": 1
        }"#;
        let second = r#"{
            "request_id": "fixture-1",
            "request_state": { "type": "OK", "msg": "" },
            "done": true
        }"#;

        for raw in [first, second] {
            let ServerMessage::Response(response) = ServerMessage::parse(raw).unwrap() else {
                panic!("expected a response");
            };
            assert!(map.dispatch(response));
        }

        let (partials, done) = reply.collect().await.unwrap();
        assert_eq!(partials.len(), 1);
        let digits = partials[0].to_string();
        assert!(
            digits.chars().all(|c| c.is_ascii_digit()),
            "user id should be numeric, got {digits}"
        );
        assert!(done.done);
        assert_eq!(done.request_state.state, ResponseState::Ok);
    }
}
