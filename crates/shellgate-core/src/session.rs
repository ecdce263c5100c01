//! Session lifecycle.
//!
//! [`ShellSession`] ties the wire layer together for one backend: it owns
//! the socket and correlator while connected, bridges socket state and
//! out-of-band notifications onto the requisition bus, and (when
//! credentials are configured) replays the `authenticate` handshake on
//! every transition to connected. Created explicitly at startup and
//! passed around -- there is no ambient global session.

use std::sync::Arc;

use futures::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use shellgate_api::{
    ChannelConfig, PendingReply, ServerMessage, ShellChannel, ShellResponse, SocketHandle,
    SocketState,
};

use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::requisition::{Requisition, RequisitionHub};

// ── ShellBackend ─────────────────────────────────────────────────────

/// Seam the data models fetch through. [`ShellSession`] is the live
/// implementation; tests substitute scripted ones.
pub trait ShellBackend: Send + Sync {
    /// Run a command to completion and return its merged result payload.
    fn call(&self, command: &str, args: Value) -> BoxFuture<'_, Result<Value, CoreError>>;
}

// ── ShellSession ─────────────────────────────────────────────────────

/// Cheaply cloneable session handle.
#[derive(Clone)]
pub struct ShellSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    hub: Arc<RequisitionHub>,
    /// Parent of every per-connection child token; cancelling it ends
    /// the session for good.
    lifetime: CancellationToken,
    active: Mutex<Option<Active>>,
}

struct Active {
    channel: ShellChannel,
    cancel: CancellationToken,
}

impl ShellSession {
    pub fn new(config: SessionConfig, hub: Arc<RequisitionHub>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                hub,
                lifetime: CancellationToken::new(),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<RequisitionHub> {
        &self.inner.hub
    }

    /// Open the socket and spawn the background machinery. Returns
    /// immediately; `SocketStateChanged(true)` on the bus signals when
    /// the connection is usable.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Err(CoreError::AlreadyConnected);
        }

        let cancel = self.inner.lifetime.child_token();
        let socket = SocketHandle::connect(
            self.inner.config.base_url.clone(),
            self.inner.config.reconnect.clone(),
            cancel.clone(),
        )
        .map_err(CoreError::Api)?;
        let channel = ShellChannel::spawn(
            socket,
            ChannelConfig {
                request_timeout: self.inner.config.request_timeout,
            },
            &cancel,
        );

        self.spawn_bridge(channel.clone(), cancel.clone());
        *active = Some(Active { channel, cancel });

        tracing::info!(url = %self.inner.config.base_url, "session connecting");
        Ok(())
    }

    /// Tear the connection down: stop the background tasks, fail every
    /// outstanding request, raise `SocketStateChanged(false)`. The
    /// session can `connect` again afterwards. Returns `false` when
    /// there was nothing to disconnect.
    pub async fn disconnect(&self) -> bool {
        let taken = self.inner.active.lock().await.take();
        let Some(active) = taken else {
            return false;
        };

        active.cancel.cancel();
        active.channel.abort_outstanding("session disconnected");

        if let Err(e) = self
            .inner
            .hub
            .execute(Requisition::SocketStateChanged(false))
            .await
        {
            tracing::warn!(error = %e, "socket-state handler failed during disconnect");
        }

        tracing::info!("session disconnected");
        true
    }

    /// End the session permanently; a closed lifetime token cannot be
    /// reused.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.lifetime.cancel();
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| a.channel.socket().is_connected())
    }

    /// Run a command to completion, merging partial results into one
    /// payload.
    pub async fn execute(&self, command: &str, args: Value) -> Result<Value, CoreError> {
        let channel = self.channel().await?;
        let reply = channel.submit(command, args).map_err(CoreError::Api)?;
        let (partials, done) = reply.collect().await.map_err(CoreError::Api)?;
        Ok(merge_results(partials, done))
    }

    /// Submit a command and keep the streaming handle, for callers that
    /// want `PENDING` payloads as they arrive.
    pub async fn submit(&self, command: &str, args: Value) -> Result<PendingReply, CoreError> {
        let channel = self.channel().await?;
        channel.submit(command, args).map_err(CoreError::Api)
    }

    /// Abandon an outstanding request.
    pub async fn cancel(&self, request_id: &str) -> bool {
        match self.inner.active.lock().await.as_ref() {
            Some(active) => active.channel.cancel(request_id),
            None => false,
        }
    }

    async fn channel(&self) -> Result<ShellChannel, CoreError> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.channel.clone())
            .ok_or(CoreError::Api(shellgate_api::Error::NotConnected))
    }

    /// Bridge task: socket state transitions and out-of-band frames
    /// become requisitions; reconnects re-run the authenticate handshake.
    fn spawn_bridge(&self, channel: ShellChannel, cancel: CancellationToken) {
        let hub = Arc::clone(&self.inner.hub);
        let username = self.inner.config.username.clone();
        let password = self.inner.config.password.clone();
        let mut state = channel.socket().state();
        let mut notifications = channel.notifications();

        tokio::spawn(async move {
            let mut connected = *state.borrow() == SocketState::Connected;

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now = *state.borrow() == SocketState::Connected;
                        if now == connected {
                            continue;
                        }
                        connected = now;

                        if now {
                            if let (Some(user), Some(pass)) = (&username, &password) {
                                authenticate(&channel, user, pass).await;
                            }
                        }
                        if let Err(e) = hub.execute(Requisition::SocketStateChanged(now)).await {
                            tracing::warn!(error = %e, "socket-state handler failed");
                        }
                    }
                    note = notifications.recv() => {
                        match note {
                            Ok(message) => {
                                if let ServerMessage::WebSession(data) = message.as_ref() {
                                    tracing::info!(
                                        session_uuid = data.session_uuid.as_deref().unwrap_or("-"),
                                        "web session established"
                                    );
                                    let started = Requisition::WebSessionStarted(data.clone());
                                    if let Err(e) = hub.execute(started).await {
                                        tracing::warn!(error = %e, "web-session handler failed");
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(skipped = n, "notification bridge lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }

            tracing::debug!("session bridge exiting");
        });
    }
}

async fn authenticate(channel: &ShellChannel, username: &str, password: &SecretString) {
    let reply = match channel.authenticate(username, password.expose_secret()) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "could not send authenticate request");
            return;
        }
    };

    match reply.wait().await {
        Ok(_) => tracing::info!(username, "authenticated"),
        Err(e) => tracing::error!(username, error = %e, "authentication failed"),
    }
}

impl ShellBackend for ShellSession {
    fn call(&self, command: &str, args: Value) -> BoxFuture<'_, Result<Value, CoreError>> {
        let command = command.to_owned();
        Box::pin(async move { self.execute(&command, args).await })
    }
}

// ── Result merging ───────────────────────────────────────────────────

/// Fold a request's partial payloads and terminal payload into one value.
///
/// List commands stream their rows as arrays across `PENDING` messages;
/// those concatenate. A single payload passes through untouched, none at
/// all becomes `null`.
fn merge_results(mut partials: Vec<Value>, done: ShellResponse) -> Value {
    if let Some(result) = done.result {
        partials.push(result);
    }

    if partials.len() <= 1 {
        return partials.pop().unwrap_or(Value::Null);
    }

    if partials.iter().all(Value::is_array) {
        let mut rows = Vec::new();
        for value in partials {
            if let Value::Array(mut chunk) = value {
                rows.append(&mut chunk);
            }
        }
        return Value::Array(rows);
    }

    Value::Array(partials)
}

// ── Tests ────────────────────────────────────────────────────────────
