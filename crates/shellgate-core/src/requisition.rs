//! The requisition bus.
//!
//! Application-wide publish/subscribe for UI-facing events ("requisitions").
//! Payloads are a tagged union rather than loose maps, so every handler
//! gets a typed event. The hub is an explicit, injected object: create one
//! at startup, share it as `Arc<RequisitionHub>`.
//!
//! Dispatch rules:
//! - handlers run sequentially in registration order;
//! - the chain stops at the first handler that reports the event handled;
//! - a handler error aborts the remaining chain;
//! - the handler list is snapshotted before dispatch, so handlers may
//!   register or unregister freely during their own invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shellgate_api::WebSessionData;

use crate::error::CoreError;

// ── Payload types ────────────────────────────────────────────────────

/// Request to open (or focus) a tab for a stored connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenConnectionTab {
    pub connection_id: u64,
    /// Open a fresh tab even when one exists for the connection.
    #[serde(default)]
    pub force: bool,
    /// Editor to activate inside the tab, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_editor: Option<String>,
}

/// Request to show a modal dialog identified by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Dialog-specific parameters, shaped per dialog.
    #[serde(default)]
    pub parameters: Value,
}

/// The user's answer to a previously shown dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogResponse {
    pub id: String,
    pub accepted: bool,
    #[serde(default)]
    pub values: Value,
}

/// Result of a file-selection flow started elsewhere (e.g. by the host).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSelection {
    /// Identifies which consumer asked for the file(s).
    pub resource_id: String,
    pub paths: Vec<String>,
}

/// Request to show a native open-file dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDialogOptions {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub can_select_files: bool,
    #[serde(default)]
    pub can_select_folders: bool,
    #[serde(default)]
    pub multi_selection: bool,
}

// ── Requisition ──────────────────────────────────────────────────────

/// One bus event.
///
/// The serialized form (adjacent tagging) doubles as the wire shape for
/// remote dispatch to an embedding host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "requisition", content = "data", rename_all = "camelCase")]
pub enum Requisition {
    /// The backend socket went up (`true`) or down (`false`).
    SocketStateChanged(bool),

    /// The backend announced an established web session.
    WebSessionStarted(WebSessionData),

    /// Reload one connection entry, or all of them when `None`.
    RefreshConnection(Option<String>),

    OpenConnectionTab(OpenConnectionTab),

    ShowDialog(DialogRequest),
    DialogResponse(DialogResponse),

    SelectFile(FileSelection),
    ShowOpenDialog(OpenDialogOptions),

    ShowInfo(String),
    ShowWarning(String),
    ShowError(String),

    /// Untargeted status text.
    Message(String),

    /// Entries executed strictly in order; see [`RequisitionHub::execute`].
    Job(Vec<Requisition>),
}

/// Discriminant of [`Requisition`], used to key handler registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequisitionKind {
    SocketStateChanged,
    WebSessionStarted,
    RefreshConnection,
    OpenConnectionTab,
    ShowDialog,
    DialogResponse,
    SelectFile,
    ShowOpenDialog,
    ShowInfo,
    ShowWarning,
    ShowError,
    Message,
    Job,
}

impl Requisition {
    pub fn kind(&self) -> RequisitionKind {
        match self {
            Self::SocketStateChanged(_) => RequisitionKind::SocketStateChanged,
            Self::WebSessionStarted(_) => RequisitionKind::WebSessionStarted,
            Self::RefreshConnection(_) => RequisitionKind::RefreshConnection,
            Self::OpenConnectionTab(_) => RequisitionKind::OpenConnectionTab,
            Self::ShowDialog(_) => RequisitionKind::ShowDialog,
            Self::DialogResponse(_) => RequisitionKind::DialogResponse,
            Self::SelectFile(_) => RequisitionKind::SelectFile,
            Self::ShowOpenDialog(_) => RequisitionKind::ShowOpenDialog,
            Self::ShowInfo(_) => RequisitionKind::ShowInfo,
            Self::ShowWarning(_) => RequisitionKind::ShowWarning,
            Self::ShowError(_) => RequisitionKind::ShowError,
            Self::Message(_) => RequisitionKind::Message,
            Self::Job(_) => RequisitionKind::Job,
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// What a handler resolves to: `Ok(true)` means "handled, stop the chain".
pub type HandlerResult = Result<bool, CoreError>;

/// Boxed future a handler returns.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

type Handler = Arc<dyn Fn(Requisition) -> HandlerFuture + Send + Sync>;

/// Token returned by [`RequisitionHub::register`].
///
/// Closures are not comparable, so removal is by token rather than by
/// handler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationId {
    kind: RequisitionKind,
    serial: u64,
}

struct Registration {
    serial: u64,
    handler: Handler,
}

// ── Remote dispatch ──────────────────────────────────────────────────

/// A requisition relayed to or from an embedding host window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Originating component, e.g. `"app"` or `"host"`.
    pub source: String,
    #[serde(flatten)]
    pub requisition: Requisition,
}

/// Seam for the host side of remote dispatch (a wrapping desktop window,
/// an extension webview). Posting is fire-and-forget.
pub trait RemoteTarget: Send + Sync {
    fn post(&self, message: RemoteMessage);
}

// ── RequisitionHub ───────────────────────────────────────────────────

/// The bus itself.
pub struct RequisitionHub {
    registry: DashMap<RequisitionKind, Vec<Registration>>,
    serial: AtomicU64,
    remote: RwLock<Option<Arc<dyn RemoteTarget>>>,
}

impl Default for RequisitionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RequisitionHub {
    pub fn new() -> Self {
        Self {
            registry: DashMap::new(),
            serial: AtomicU64::new(0),
            remote: RwLock::new(None),
        }
    }

    /// Append a handler for `kind`. Registration order is dispatch order;
    /// registering the same closure twice invokes it twice.
    pub fn register<F>(&self, kind: RequisitionKind, handler: F) -> RegistrationId
    where
        F: Fn(Requisition) -> HandlerFuture + Send + Sync + 'static,
    {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        self.registry.entry(kind).or_default().push(Registration {
            serial,
            handler: Arc::new(handler),
        });
        RegistrationId { kind, serial }
    }

    /// Remove the registration behind `id`. Returns `false` when it was
    /// already gone.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let Some(mut list) = self.registry.get_mut(&id.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.serial != id.serial);
        before != list.len()
    }

    /// Number of handlers currently registered for `kind`.
    pub fn registrations(&self, kind: RequisitionKind) -> usize {
        self.registry.get(&kind).map_or(0, |list| list.len())
    }

    /// Dispatch one requisition.
    ///
    /// Handlers run sequentially in registration order; the first
    /// `Ok(true)` stops the chain, and a handler error aborts it.
    /// Returns `Ok(false)` when no handler claimed the event.
    ///
    /// [`Requisition::Job`] is special: its entries are executed strictly
    /// one after another through this same method, and the job itself
    /// counts as handled.
    pub fn execute(&self, requisition: Requisition) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            if let Requisition::Job(entries) = requisition {
                tracing::debug!(steps = entries.len(), "executing job");
                for entry in entries {
                    self.execute(entry).await?;
                }
                return Ok(true);
            }

            let kind = requisition.kind();
            for handler in self.snapshot(kind) {
                if handler(requisition.clone()).await? {
                    return Ok(true);
                }
            }

            tracing::trace!(?kind, "requisition unhandled");
            Ok(false)
        })
    }

    /// Post a requisition to the attached remote target, if any.
    /// Returns whether a target was attached.
    pub fn execute_remote(&self, requisition: Requisition) -> bool {
        let Some(target) = self.remote_target() else {
            return false;
        };
        target.post(RemoteMessage {
            source: "app".into(),
            requisition,
        });
        true
    }

    /// Dispatch a requisition that arrived from the remote side to every
    /// local handler of its kind -- no short-circuiting, since the sender
    /// cannot observe local handled-ness. Handler errors are logged and
    /// skipped. Returns how many handlers claimed the event.
    pub async fn handle_remote_message(&self, message: RemoteMessage) -> usize {
        let requisition = message.requisition;
        let kind = requisition.kind();
        let mut handled = 0;

        for handler in self.snapshot(kind) {
            match handler(requisition.clone()).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(?kind, source = %message.source, error = %e,
                        "remote requisition handler failed");
                }
            }
        }

        handled
    }

    /// Attach (or detach, with `None`) the remote target.
    pub fn set_remote_target(&self, target: Option<Arc<dyn RemoteTarget>>) {
        *self
            .remote
            .write()
            .unwrap_or_else(PoisonError::into_inner) = target;
    }

    fn remote_target(&self) -> Option<Arc<dyn RemoteTarget>> {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot(&self, kind: RequisitionKind) -> Vec<Handler> {
        self.registry.get(&kind).map_or_else(Vec::new, |list| {
            list.iter().map(|r| Arc::clone(&r.handler)).collect()
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────
