//! The stored-connections model.
//!
//! root → connection groups → connections → schemas. The connection list
//! comes from `gui.dbconnections.list_db_connections`; schemas per
//! connection from `gui.db.get_catalog_object_names`. Both levels refresh
//! lazily; a fetch failure keeps the existing children and surfaces as a
//! requisition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::model::tree::{EntryId, EntryState, TreeStore};
use crate::requisition::{Requisition, RequisitionHub};
use crate::session::ShellBackend;

const ROOT_ID: &str = "connections";

// ── Payloads ─────────────────────────────────────────────────────────

/// One stored connection as the backend reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub id: u64,
    pub caption: String,
    #[serde(default)]
    pub db_type: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Grouping path; empty means top level.
    #[serde(default)]
    pub folder_path: String,
}

#[derive(Debug, Clone)]
pub enum ConnectionEntry {
    Root,
    Group { path: String },
    Connection(ConnectionDetails),
    Schema { name: String, connection_id: u64 },
}

// ── Ids ──────────────────────────────────────────────────────────────

fn group_id(path: &str) -> EntryId {
    EntryId::new(format!("group:{path}"))
}

fn connection_id(id: u64) -> EntryId {
    EntryId::new(format!("connection:{id}"))
}

fn schema_id(connection: u64, name: &str) -> EntryId {
    EntryId::new(format!("schema:{connection}:{name}"))
}

// ── ConnectionsModel ─────────────────────────────────────────────────

pub struct ConnectionsModel {
    store: TreeStore<ConnectionEntry>,
    backend: Arc<dyn ShellBackend>,
    hub: Arc<RequisitionHub>,
    profile_id: u64,
}

impl ConnectionsModel {
    pub fn new(backend: Arc<dyn ShellBackend>, hub: Arc<RequisitionHub>, profile_id: u64) -> Self {
        Self {
            store: TreeStore::new(ROOT_ID, ConnectionEntry::Root),
            backend,
            hub,
            profile_id,
        }
    }

    pub fn store(&self) -> &TreeStore<ConnectionEntry> {
        &self.store
    }

    /// Reload the connection list. Groups and connections whose id is
    /// still reported survive in place; failures keep the previous
    /// children and still resolve `true`.
    pub async fn refresh(&self) -> bool {
        let root = self.store.root().clone();
        self.store.mutate().set_state(&root, EntryState::Populating);

        let args = json!({ "profileId": self.profile_id, "folderPath": "" });
        match self
            .backend
            .call("gui.dbconnections.list_db_connections", args)
            .await
            .and_then(rows::<ConnectionDetails>)
        {
            Ok(connections) => self.rebuild(&root, connections),
            Err(e) => {
                tracing::warn!(error = %e, "connection list fetch failed");
                self.report(&e, "stored connections").await;
            }
        }

        self.store.mutate().set_state(&root, EntryState::Populated);
        true
    }

    /// Populate one connection's schema children.
    pub async fn refresh_connection(&self, id: &EntryId) -> bool {
        let Some(ConnectionEntry::Connection(details)) = self.store.payload(id) else {
            tracing::warn!(entry = %id, "refresh of a non-connection entry ignored");
            return false;
        };

        self.store.mutate().set_state(id, EntryState::Populating);

        let args = json!({ "connectionId": details.id, "type": "Schema" });
        match self
            .backend
            .call("gui.db.get_catalog_object_names", args)
            .await
            .and_then(rows::<String>)
        {
            Ok(names) => {
                let reported = names
                    .into_iter()
                    .map(|name| {
                        (
                            schema_id(details.id, &name),
                            ConnectionEntry::Schema {
                                name,
                                connection_id: details.id,
                            },
                        )
                    })
                    .collect();
                let mut m = self.store.mutate();
                if let Err(e) = m.reconcile_children(id, reported) {
                    tracing::warn!(entry = %id, error = %e, "schema reconcile failed");
                }
            }
            Err(e) => {
                tracing::warn!(entry = %id, error = %e, "schema fetch failed");
                self.report(&e, "schemas").await;
            }
        }

        self.store.mutate().set_state(id, EntryState::Populated);
        true
    }

    /// Two-level rebuild: groups (by folder path) under the root, then
    /// the connections of each group. Ungrouped connections sit directly
    /// under the root, after the groups.
    fn rebuild(&self, root: &EntryId, connections: Vec<ConnectionDetails>) {
        let mut groups: Vec<String> = Vec::new();
        for details in &connections {
            if !details.folder_path.is_empty() && !groups.contains(&details.folder_path) {
                groups.push(details.folder_path.clone());
            }
        }

        let mut top_level: Vec<(EntryId, ConnectionEntry)> = groups
            .iter()
            .map(|path| (group_id(path), ConnectionEntry::Group { path: path.clone() }))
            .collect();
        top_level.extend(
            connections
                .iter()
                .filter(|d| d.folder_path.is_empty())
                .map(|d| (connection_id(d.id), ConnectionEntry::Connection(d.clone()))),
        );

        let mut m = self.store.mutate();
        if let Err(e) = m.reconcile_children(root, top_level) {
            tracing::warn!(error = %e, "connection reconcile failed");
            return;
        }

        for path in &groups {
            let members = connections
                .iter()
                .filter(|d| d.folder_path == *path)
                .map(|d| (connection_id(d.id), ConnectionEntry::Connection(d.clone())))
                .collect();
            if let Err(e) = m.reconcile_children(&group_id(path), members) {
                tracing::warn!(group = %path, error = %e, "group reconcile failed");
            }
        }
    }

    /// Authorization denials downgrade to warnings; everything else is an
    /// error. The previous children stay either way.
    async fn report(&self, error: &CoreError, category: &str) {
        let requisition = if error.is_authorization_denial() {
            Requisition::ShowWarning(format!("Not authorized to list {category}"))
        } else {
            Requisition::ShowError(format!("Failed to list {category}: {error}"))
        };
        if let Err(e) = self.hub.execute(requisition).await {
            tracing::warn!(error = %e, "failed to surface fetch problem");
        }
    }
}

/// Deserialize a backend list payload; `null` means an empty list.
fn rows<T: serde::de::DeserializeOwned>(value: Value) -> Result<Vec<T>, CoreError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value)?)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::tree::TreeDelta;
    use crate::requisition::RequisitionKind;
    use crate::test_support::StubBackend;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn seeded_model(backend: Arc<StubBackend>) -> (ConnectionsModel, Arc<RequisitionHub>) {
        let hub = Arc::new(RequisitionHub::new());
        let model = ConnectionsModel::new(backend, Arc::clone(&hub), 1);
        (model, hub)
    }

    fn details(id: u64, caption: &str, folder: &str) -> Value {
        json!({
            "id": id,
            "caption": caption,
            "dbType": "MySQL",
            "description": "",
            "folderPath": folder,
        })
    }

    #[tokio::test]
    async fn refresh_builds_groups_and_connections() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([
                details(1, "local", ""),
                details(2, "prod-eu", "prod"),
                details(3, "prod-us", "prod"),
            ]),
        );

        let (model, _hub) = seeded_model(backend);
        assert!(model.refresh().await);

        let root = model.store().root().clone();
        assert_eq!(
            model.store().children(&root),
            vec![group_id("prod"), connection_id(1)]
        );
        assert_eq!(
            model.store().children(&group_id("prod")),
            vec![connection_id(2), connection_id(3)]
        );
        assert!(model.store().is_initialized(&root));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_children_and_resolves_true() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(1, "local", "")]),
        );
        backend.push_err(
            "gui.dbconnections.list_db_connections",
            "backend unavailable",
        );

        let (model, _hub) = seeded_model(backend);
        assert!(model.refresh().await);
        assert!(model.refresh().await, "failed refresh still resolves true");

        let root = model.store().root().clone();
        assert_eq!(model.store().children(&root), vec![connection_id(1)]);
        assert!(model.store().is_initialized(&root));
    }

    #[tokio::test]
    async fn removed_connection_disappears_surviving_one_stays() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(1, "a", ""), details(2, "b", "")]),
        );
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(1, "a-renamed", ""), details(3, "c", "")]),
        );

        let (model, _hub) = seeded_model(backend);
        model.refresh().await;
        model.refresh().await;

        let root = model.store().root().clone();
        assert_eq!(
            model.store().children(&root),
            vec![connection_id(1), connection_id(3)]
        );
        let Some(ConnectionEntry::Connection(d)) = model.store().payload(&connection_id(1)) else {
            panic!("expected a connection payload");
        };
        assert_eq!(d.caption, "a-renamed");
    }

    #[tokio::test]
    async fn refresh_connection_populates_schemas() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(7, "local", "")]),
        );
        backend.push_ok(
            "gui.db.get_catalog_object_names",
            json!(["information_schema", "sakila"]),
        );

        let hub = Arc::new(RequisitionHub::new());
        let model = ConnectionsModel::new(
            Arc::clone(&backend) as Arc<dyn ShellBackend>,
            hub,
            1,
        );
        model.refresh().await;

        let conn = connection_id(7);
        let mut rx = model.store().subscribe();
        assert!(model.refresh_connection(&conn).await);

        assert_eq!(
            model.store().children(&conn),
            vec![schema_id(7, "information_schema"), schema_id(7, "sakila")]
        );
        assert!(model.store().is_initialized(&conn));

        let batch = rx.try_recv().unwrap();
        assert!(
            batch.iter().all(|d| matches!(d, TreeDelta::Added(_))),
            "schema population should only add entries"
        );
    }

    #[tokio::test]
    async fn refresh_connection_failure_marks_initialized() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(7, "local", "")]),
        );
        backend.push_err("gui.db.get_catalog_object_names", "no session");

        let (model, _hub) = seeded_model(backend);
        model.refresh().await;

        let conn = connection_id(7);
        assert!(!model.store().is_initialized(&conn));
        assert!(model.refresh_connection(&conn).await);
        assert!(model.store().is_initialized(&conn));
        assert!(model.store().children(&conn).is_empty());
    }

    #[tokio::test]
    async fn refresh_of_non_connection_entry_is_rejected() {
        let backend = Arc::new(StubBackend::new());
        let (model, _hub) = seeded_model(backend);
        let root = model.store().root().clone();
        assert!(!model.refresh_connection(&root).await);
    }

    #[tokio::test]
    async fn moving_connection_between_groups_keeps_it() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(1, "a", "g1"), details(3, "c", "g1")]),
        );
        // Connection 1 moved to g2, and g2 is reported first so its
        // reconcile runs before g1 gives the id up.
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(1, "a", "g2"), details(3, "c", "g1")]),
        );

        let (model, _hub) = seeded_model(backend);
        model.refresh().await;
        model.refresh().await;

        assert!(
            model.store().contains(&connection_id(1)),
            "moved connection must survive the rebuild"
        );
        assert_eq!(
            model.store().parent(&connection_id(1)),
            Some(group_id("g2"))
        );
        assert_eq!(
            model.store().children(&group_id("g2")),
            vec![connection_id(1)]
        );
        assert_eq!(
            model.store().children(&group_id("g1")),
            vec![connection_id(3)]
        );
    }

    #[tokio::test]
    async fn failed_refresh_raises_error_requisition() {
        let backend = Arc::new(StubBackend::new());
        backend.push_err("gui.dbconnections.list_db_connections", "backend down");
        backend.push_ok(
            "gui.dbconnections.list_db_connections",
            json!([details(7, "local", "")]),
        );
        backend.push_err("gui.db.get_catalog_object_names", "no session");

        let (model, hub) = seeded_model(backend);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        hub.register(RequisitionKind::ShowError, move |r| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                if let Requisition::ShowError(text) = r {
                    sink.lock().unwrap().push(text);
                }
                Ok(true)
            })
        });

        assert!(model.refresh().await);
        assert!(model.refresh().await);
        assert!(model.refresh_connection(&connection_id(7)).await);

        let seen = errors.lock().unwrap();
        assert_eq!(seen.len(), 2, "list and schema failures both surface");
        assert!(seen[0].contains("stored connections"));
        assert!(seen[1].contains("schemas"));
    }
}
