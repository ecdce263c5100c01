//! The open-documents model.
//!
//! root → document providers → connection pages → documents, plus a
//! shell-session root for interactive shell consoles. Entirely
//! client-driven: no backend fetch, every mutation goes straight into the
//! arena and broadcasts its delta batch.

use uuid::Uuid;

use crate::error::CoreError;
use crate::model::tree::{EntryId, EntryState, TreeStore};

const ROOT_ID: &str = "documents";
const SHELL_SESSIONS_ID: &str = "shell-sessions";

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Notebook,
    Script,
    AdminPage,
}

#[derive(Debug, Clone)]
pub enum DocumentEntry {
    Root,
    /// A tab host contributing documents, e.g. one application window.
    Provider { caption: String },
    /// An open connection tab inside a provider.
    ConnectionPage {
        caption: String,
        connection_id: u64,
    },
    Document {
        caption: String,
        kind: DocumentKind,
    },
    /// Fixed container for interactive shell consoles.
    ShellSessionRoot,
    ShellSession { caption: String },
}

// ── DocumentsModel ───────────────────────────────────────────────────

pub struct DocumentsModel {
    store: TreeStore<DocumentEntry>,
}

impl Default for DocumentsModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentsModel {
    /// The shell-session root exists from the start; providers come and
    /// go with application windows.
    pub fn new() -> Self {
        let store = TreeStore::new(ROOT_ID, DocumentEntry::Root);
        {
            let root = store.root().clone();
            let mut m = store.mutate();
            // Cannot fail: the root always exists.
            let _ = m.insert(
                &root,
                EntryId::new(SHELL_SESSIONS_ID),
                DocumentEntry::ShellSessionRoot,
            );
            m.set_state(&EntryId::new(SHELL_SESSIONS_ID), EntryState::Populated);
        }
        Self { store }
    }

    pub fn store(&self) -> &TreeStore<DocumentEntry> {
        &self.store
    }

    pub fn shell_session_root(&self) -> EntryId {
        EntryId::new(SHELL_SESSIONS_ID)
    }

    pub fn add_provider(&self, caption: impl Into<String>) -> Result<EntryId, CoreError> {
        let id = EntryId::new(format!("provider:{}", Uuid::new_v4()));
        let root = self.store.root().clone();
        let mut m = self.store.mutate();
        m.insert(
            &root,
            id.clone(),
            DocumentEntry::Provider {
                caption: caption.into(),
            },
        )?;
        m.set_state(&id, EntryState::Populated);
        Ok(id)
    }

    /// Drop a provider and everything below it.
    pub fn remove_provider(&self, id: &EntryId) -> bool {
        if !matches!(self.store.payload(id), Some(DocumentEntry::Provider { .. })) {
            return false;
        }
        self.store.mutate().remove(id)
    }

    pub fn open_connection_page(
        &self,
        provider: &EntryId,
        connection_id: u64,
        caption: impl Into<String>,
    ) -> Result<EntryId, CoreError> {
        if !matches!(
            self.store.payload(provider),
            Some(DocumentEntry::Provider { .. })
        ) {
            return Err(CoreError::UnknownEntry(provider.to_string()));
        }

        let id = EntryId::new(format!("page:{}", Uuid::new_v4()));
        let mut m = self.store.mutate();
        m.insert(
            provider,
            id.clone(),
            DocumentEntry::ConnectionPage {
                caption: caption.into(),
                connection_id,
            },
        )?;
        m.set_state(&id, EntryState::Populated);
        Ok(id)
    }

    /// Closing a page removes its documents with it.
    pub fn close_connection_page(&self, id: &EntryId) -> bool {
        if !matches!(
            self.store.payload(id),
            Some(DocumentEntry::ConnectionPage { .. })
        ) {
            return false;
        }
        self.store.mutate().remove(id)
    }

    pub fn open_document(
        &self,
        page: &EntryId,
        kind: DocumentKind,
        caption: impl Into<String>,
    ) -> Result<EntryId, CoreError> {
        if !matches!(
            self.store.payload(page),
            Some(DocumentEntry::ConnectionPage { .. })
        ) {
            return Err(CoreError::UnknownEntry(page.to_string()));
        }

        let id = EntryId::new(format!("document:{}", Uuid::new_v4()));
        let mut m = self.store.mutate();
        m.insert(
            page,
            id.clone(),
            DocumentEntry::Document {
                caption: caption.into(),
                kind,
            },
        )?;
        m.set_state(&id, EntryState::Populated);
        Ok(id)
    }

    pub fn close_document(&self, id: &EntryId) -> bool {
        if !matches!(self.store.payload(id), Some(DocumentEntry::Document { .. })) {
            return false;
        }
        self.store.mutate().remove(id)
    }

    pub fn add_shell_session(&self, caption: impl Into<String>) -> Result<EntryId, CoreError> {
        let id = EntryId::new(format!("shell-session:{}", Uuid::new_v4()));
        let mut m = self.store.mutate();
        m.insert(
            &self.shell_session_root(),
            id.clone(),
            DocumentEntry::ShellSession {
                caption: caption.into(),
            },
        )?;
        m.set_state(&id, EntryState::Populated);
        Ok(id)
    }

    pub fn remove_shell_session(&self, id: &EntryId) -> bool {
        if !matches!(
            self.store.payload(id),
            Some(DocumentEntry::ShellSession { .. })
        ) {
            return false;
        }
        self.store.mutate().remove(id)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
