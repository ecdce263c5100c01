//! Wire types for the shell backend protocol.
//!
//! All traffic is JSON text frames over a WebSocket. Outgoing frames are
//! [`ShellRequest`] envelopes; incoming frames either carry a `request_id`
//! (a [`ShellResponse`] correlated to an outstanding request) or not (an
//! out-of-band notification such as the web session announcement).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Requests ─────────────────────────────────────────────────────────

/// An outgoing request envelope.
///
/// The backend routes on `command`, a dotted name like
/// `gui.dbconnections.list_db_connections` or `mds.list.compartments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRequest {
    /// Request kind. Always `"execute"` for command execution.
    pub request: String,

    /// Correlation token, unique among outstanding requests.
    pub request_id: String,

    /// Dotted command name.
    pub command: String,

    /// Command arguments, shaped per command.
    #[serde(default)]
    pub args: Value,
}

impl ShellRequest {
    /// Build an `execute` request for the given command.
    pub fn execute(request_id: impl Into<String>, command: impl Into<String>, args: Value) -> Self {
        Self {
            request: "execute".into(),
            request_id: request_id.into(),
            command: command.into(),
            args,
        }
    }
}

/// The `authenticate` envelope. Unlike commands it carries its fields at
/// the top level, but it correlates by `request_id` like everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub request: String,
    pub request_id: String,
    pub username: String,
    pub password: String,
}

impl AuthenticateRequest {
    pub fn new(
        request_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            request: "authenticate".into(),
            request_id: request_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

// ── Responses ────────────────────────────────────────────────────────

/// Completion state of one response message.
///
/// A logical request produces zero or more `PENDING` messages followed by
/// exactly one terminal `OK` or `ERROR` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseState {
    Pending,
    Ok,
    Error,
}

impl ResponseState {
    /// `OK` and `ERROR` end the request; `PENDING` does not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The `request_state` object carried by every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    #[serde(rename = "type")]
    pub state: ResponseState,

    /// Human-readable message. Carries the error text for `ERROR` states.
    #[serde(default)]
    pub msg: String,
}

/// One response message for an outstanding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellResponse {
    pub request_id: String,
    pub request_state: RequestState,

    /// Incremental (`PENDING`) or final (`OK`) result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Set on the last message of a multi-part result.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

// ── Out-of-band notifications ────────────────────────────────────────

/// Session announcement the backend sends once a web session is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSessionData {
    pub session_uuid: Option<String>,

    #[serde(default)]
    pub local_user_mode: bool,

    /// Remaining fields the backend sends (active profile, etc.).
    #[serde(flatten)]
    pub extra: Value,
}

// ── Frame classification ─────────────────────────────────────────────

/// A parsed incoming frame.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// A response correlated to an outstanding request.
    Response(ShellResponse),

    /// The web session announcement.
    WebSession(WebSessionData),

    /// Anything else the backend emits without a `request_id`.
    Notification(Value),
}

impl ServerMessage {
    /// Classify a raw text frame.
    ///
    /// Frames with a `request_id` are responses; frames with a
    /// `session_uuid` are the session announcement; everything else is an
    /// opaque notification.
    pub fn parse(raw: &str) -> Result<Self, crate::error::Error> {
        let value: Value = serde_json::from_str(raw)?;

        if value.get("request_id").is_some() {
            let response: ShellResponse = serde_json::from_value(value)?;
            return Ok(Self::Response(response));
        }

        if value.get("session_uuid").is_some() {
            let session: WebSessionData = serde_json::from_value(value)?;
            return Ok(Self::WebSession(session));
        }

        Ok(Self::Notification(value))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
