//! Arena-backed tree storage shared by the data models.
//!
//! Every node of a model lives in one map keyed by [`EntryId`]; parents
//! and children are ids, never references. Invariant: a child's `parent`
//! always names the entry whose `children` list holds it.
//!
//! Mutations go through [`TreeStore::mutate`], which buffers deltas and
//! broadcasts them as a single batch when the mutation is dropped --
//! observers see one message per refresh, not one per node.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;

use crate::error::CoreError;

const DELTA_CHANNEL_CAPACITY: usize = 64;

// ── EntryId ──────────────────────────────────────────────────────────

/// Stable identity of one tree node, e.g. `connection:42` or an OCI
/// resource OCID. Survives refreshes as long as the backend keeps
/// reporting the same underlying object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ── Entry state ──────────────────────────────────────────────────────

/// Lazy-population state machine of one node.
///
/// A node is "initialized" once it has left `Uninitialized` -- a failed
/// fetch still counts as tried and does not reset the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    #[default]
    Uninitialized,
    Populating,
    Populated,
}

// ── Entries and deltas ───────────────────────────────────────────────

/// One arena node.
#[derive(Debug, Clone)]
pub struct TreeEntry<T> {
    pub id: EntryId,
    pub parent: Option<EntryId>,
    pub children: Vec<EntryId>,
    pub state: EntryState,
    pub payload: T,
}

/// One observed change. Batched per mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeDelta {
    Added(EntryId),
    Updated(EntryId),
    Removed(EntryId),
    /// All children below the entry were dropped wholesale.
    Cleared(EntryId),
}

// ── TreeStore ────────────────────────────────────────────────────────

/// The arena plus its delta broadcast.
pub struct TreeStore<T> {
    root: EntryId,
    entries: RwLock<HashMap<EntryId, TreeEntry<T>>>,
    delta_tx: broadcast::Sender<std::sync::Arc<Vec<TreeDelta>>>,
}

impl<T> TreeStore<T> {
    /// Arena with a single root entry, already `Populated` (the root has
    /// no fetch of its own).
    pub fn new(root_id: impl Into<EntryId>, root_payload: T) -> Self {
        let root: EntryId = root_id.into();
        let mut entries = HashMap::new();
        entries.insert(
            root.clone(),
            TreeEntry {
                id: root.clone(),
                parent: None,
                children: Vec::new(),
                state: EntryState::Populated,
                payload: root_payload,
            },
        );

        let (delta_tx, _) = broadcast::channel(DELTA_CHANNEL_CAPACITY);
        Self {
            root,
            entries: RwLock::new(entries),
            delta_tx,
        }
    }

    pub fn root(&self) -> &EntryId {
        &self.root
    }

    /// Receive batched deltas, one message per mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<std::sync::Arc<Vec<TreeDelta>>> {
        self.delta_tx.subscribe()
    }

    /// Run a closure against an entry, if present.
    pub fn with_entry<R>(&self, id: &EntryId, f: impl FnOnce(&TreeEntry<T>) -> R) -> Option<R> {
        self.read().get(id).map(f)
    }

    pub fn children(&self, id: &EntryId) -> Vec<EntryId> {
        self.read().get(id).map_or_else(Vec::new, |e| e.children.clone())
    }

    pub fn parent(&self, id: &EntryId) -> Option<EntryId> {
        self.read().get(id).and_then(|e| e.parent.clone())
    }

    pub fn state(&self, id: &EntryId) -> Option<EntryState> {
        self.read().get(id).map(|e| e.state)
    }

    /// True once the entry has been refreshed at least once, successfully
    /// or not.
    pub fn is_initialized(&self, id: &EntryId) -> bool {
        self.state(id).is_some_and(|s| s != EntryState::Uninitialized)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Start a mutation. Deltas buffer until the returned guard drops,
    /// then broadcast as one batch.
    pub fn mutate(&self) -> TreeMutation<'_, T> {
        TreeMutation {
            entries: self
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            deltas: Vec::new(),
            delta_tx: &self.delta_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EntryId, TreeEntry<T>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> TreeStore<T> {
    pub fn payload(&self, id: &EntryId) -> Option<T> {
        self.read().get(id).map(|e| e.payload.clone())
    }
}

// ── TreeMutation ─────────────────────────────────────────────────────

/// Write guard over the arena. Dropping it commits the delta batch.
pub struct TreeMutation<'a, T> {
    entries: RwLockWriteGuard<'a, HashMap<EntryId, TreeEntry<T>>>,
    deltas: Vec<TreeDelta>,
    delta_tx: &'a broadcast::Sender<std::sync::Arc<Vec<TreeDelta>>>,
}

impl<T> TreeMutation<'_, T> {
    /// Attach a node under `parent`. An existing entry keeps its children
    /// and state; only the payload is replaced.
    pub fn insert(&mut self, parent: &EntryId, id: EntryId, payload: T) -> Result<(), CoreError> {
        if !self.entries.contains_key(parent) {
            return Err(CoreError::UnknownEntry(parent.to_string()));
        }

        if let Some(existing) = self.entries.get_mut(&id) {
            existing.payload = payload;
            self.deltas.push(TreeDelta::Updated(id));
            return Ok(());
        }

        self.entries.insert(
            id.clone(),
            TreeEntry {
                id: id.clone(),
                parent: Some(parent.clone()),
                children: Vec::new(),
                state: EntryState::Uninitialized,
                payload,
            },
        );
        if let Some(parent_entry) = self.entries.get_mut(parent) {
            parent_entry.children.push(id.clone());
        }
        self.deltas.push(TreeDelta::Added(id));
        Ok(())
    }

    /// Replace an entry's payload.
    pub fn update(&mut self, id: &EntryId, payload: T) -> Result<(), CoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownEntry(id.to_string()))?;
        entry.payload = payload;
        self.deltas.push(TreeDelta::Updated(id.clone()));
        Ok(())
    }

    /// Move an entry through its population state machine. No delta --
    /// state is bookkeeping, not content.
    pub fn set_state(&mut self, id: &EntryId, state: EntryState) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Remove an entry and its whole subtree. The root cannot be removed.
    /// Returns `false` when the id was absent (or the root).
    pub fn remove(&mut self, id: &EntryId) -> bool {
        let Some(parent) = self.entries.get(id).and_then(|e| e.parent.clone()) else {
            return false;
        };

        if let Some(parent_entry) = self.entries.get_mut(&parent) {
            parent_entry.children.retain(|c| c != id);
        }
        remove_subtree(&mut self.entries, id, &mut self.deltas);
        true
    }

    /// Drop all children below an entry, emitting a single `Cleared`
    /// delta instead of per-node removals.
    pub fn clear_children(&mut self, id: &EntryId) -> Result<(), CoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownEntry(id.to_string()))?;
        let children = std::mem::take(&mut entry.children);
        if children.is_empty() {
            return Ok(());
        }

        let mut discarded = Vec::new();
        for child in &children {
            remove_subtree(&mut self.entries, child, &mut discarded);
        }
        self.deltas.push(TreeDelta::Cleared(id.clone()));
        Ok(())
    }

    /// Rebuild an entry's children from the backend's current list.
    ///
    /// Children whose stable id is still reported survive in place --
    /// identity, subtree, and initialized state intact, payload updated.
    /// Unreported children are removed with their subtrees; new ids are
    /// added. The final child order is the reported order.
    ///
    /// An unreported id whose `parent` no longer names this entry is left
    /// alone: a sibling reconcile in the same rebuild has already claimed
    /// it, and removing it here would leave a dangling id in the new
    /// container's child list.
    pub fn reconcile_children(
        &mut self,
        parent: &EntryId,
        reported: Vec<(EntryId, T)>,
    ) -> Result<(), CoreError> {
        let previous = {
            let entry = self
                .entries
                .get_mut(parent)
                .ok_or_else(|| CoreError::UnknownEntry(parent.to_string()))?;
            std::mem::take(&mut entry.children)
        };

        let reported_ids: HashSet<EntryId> = reported.iter().map(|(id, _)| id.clone()).collect();
        for stale in previous.iter().filter(|id| !reported_ids.contains(id)) {
            let owned_here = self
                .entries
                .get(stale)
                .is_some_and(|e| e.parent.as_ref() == Some(parent));
            if owned_here {
                remove_subtree(&mut self.entries, stale, &mut self.deltas);
            }
        }

        let mut order = Vec::with_capacity(reported.len());
        for (id, payload) in reported {
            if let Some(existing) = self.entries.get_mut(&id) {
                existing.payload = payload;
                existing.parent = Some(parent.clone());
                self.deltas.push(TreeDelta::Updated(id.clone()));
            } else {
                self.entries.insert(
                    id.clone(),
                    TreeEntry {
                        id: id.clone(),
                        parent: Some(parent.clone()),
                        children: Vec::new(),
                        state: EntryState::Uninitialized,
                        payload,
                    },
                );
                self.deltas.push(TreeDelta::Added(id.clone()));
            }
            order.push(id);
        }

        if let Some(entry) = self.entries.get_mut(parent) {
            entry.children = order;
        }
        Ok(())
    }

    /// Commit now instead of at end of scope.
    pub fn commit(self) {
        drop(self);
    }
}

impl<T> Drop for TreeMutation<'_, T> {
    fn drop(&mut self) {
        if !self.deltas.is_empty() {
            // No subscribers is fine.
            let _ = self
                .delta_tx
                .send(std::sync::Arc::new(std::mem::take(&mut self.deltas)));
        }
    }
}

fn remove_subtree<T>(
    entries: &mut HashMap<EntryId, TreeEntry<T>>,
    id: &EntryId,
    deltas: &mut Vec<TreeDelta>,
) {
    if let Some(entry) = entries.remove(id) {
        for child in &entry.children {
            remove_subtree(entries, child, deltas);
        }
        deltas.push(TreeDelta::Removed(id.clone()));
    }
}

// ── Tests ────────────────────────────────────────────────────────────
