//! The cloud resources model.
//!
//! root → config profiles → compartments → {sub-compartments, DB systems,
//! compute instances, bastions, load balancers}. Compartment categories
//! are fetched concurrently and fail independently: an authorization
//! denial surfaces as a warning requisition and skips the category, any
//! other error surfaces as an error requisition; siblings proceed either
//! way. DB systems with an attached HeatWave cluster gain a child entry
//! for the cluster.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::CoreError;
use crate::model::tree::{EntryId, EntryState, TreeStore};
use crate::requisition::{Requisition, RequisitionHub};
use crate::session::ShellBackend;

const ROOT_ID: &str = "cloud";

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigProfile {
    pub profile: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compartment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatWaveCluster {
    #[serde(default)]
    pub shape_name: String,
    #[serde(default)]
    pub cluster_size: u32,
    #[serde(default)]
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSystem {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub lifecycle_state: String,
    #[serde(default)]
    pub heat_wave_cluster: Option<HeatWaveCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeInstance {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bastion {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    #[serde(default)]
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub enum CloudEntry {
    Root,
    Profile(ConfigProfile),
    Compartment(Compartment),
    DbSystem(DbSystem),
    HeatWaveCluster(HeatWaveCluster),
    ComputeInstance(ComputeInstance),
    Bastion(Bastion),
    LoadBalancer(LoadBalancer),
}

fn profile_id(profile: &str) -> EntryId {
    EntryId::new(format!("profile:{profile}"))
}

// ── CloudModel ───────────────────────────────────────────────────────

pub struct CloudModel {
    store: TreeStore<CloudEntry>,
    backend: Arc<dyn ShellBackend>,
    hub: Arc<RequisitionHub>,
}

impl CloudModel {
    pub fn new(backend: Arc<dyn ShellBackend>, hub: Arc<RequisitionHub>) -> Self {
        Self {
            store: TreeStore::new(ROOT_ID, CloudEntry::Root),
            backend,
            hub,
        }
    }

    pub fn store(&self) -> &TreeStore<CloudEntry> {
        &self.store
    }

    /// Reload the config profile list.
    pub async fn refresh(&self) -> bool {
        let root = self.store.root().clone();
        self.store.mutate().set_state(&root, EntryState::Populating);

        match self
            .backend
            .call("mds.list.config_profiles", json!({}))
            .await
            .and_then(rows::<ConfigProfile>)
        {
            Ok(profiles) => {
                let reported = profiles
                    .into_iter()
                    .map(|p| (profile_id(&p.profile), CloudEntry::Profile(p)))
                    .collect();
                let mut m = self.store.mutate();
                if let Err(e) = m.reconcile_children(&root, reported) {
                    tracing::warn!(error = %e, "profile reconcile failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config profile fetch failed");
                self.report(&e, "config profiles").await;
            }
        }

        self.store.mutate().set_state(&root, EntryState::Populated);
        true
    }

    /// Populate a profile with its top-level compartments.
    pub async fn refresh_profile(&self, id: &EntryId) -> bool {
        let Some(CloudEntry::Profile(profile)) = self.store.payload(id) else {
            tracing::warn!(entry = %id, "refresh of a non-profile entry ignored");
            return false;
        };

        self.store.mutate().set_state(id, EntryState::Populating);

        let args = json!({ "kwargs": { "configProfile": profile.profile } });
        match self
            .backend
            .call("mds.list.compartments", args)
            .await
            .and_then(rows::<Compartment>)
        {
            Ok(compartments) => {
                let reported = compartments
                    .into_iter()
                    .map(|c| (EntryId::new(c.id.clone()), CloudEntry::Compartment(c)))
                    .collect();
                let mut m = self.store.mutate();
                if let Err(e) = m.reconcile_children(id, reported) {
                    tracing::warn!(entry = %id, error = %e, "compartment reconcile failed");
                }
            }
            Err(e) => {
                tracing::warn!(entry = %id, error = %e, "compartment fetch failed");
                self.report(&e, "compartments").await;
            }
        }

        self.store.mutate().set_state(id, EntryState::Populated);
        true
    }

    /// Populate one compartment. The five categories are fetched
    /// concurrently; each failure is reported and skipped while the
    /// others land.
    pub async fn refresh_compartment(&self, id: &EntryId) -> bool {
        let Some(CloudEntry::Compartment(compartment)) = self.store.payload(id) else {
            tracing::warn!(entry = %id, "refresh of a non-compartment entry ignored");
            return false;
        };
        let Some(profile) = self.owning_profile(id) else {
            tracing::warn!(entry = %id, "compartment has no owning profile");
            return false;
        };

        self.store.mutate().set_state(id, EntryState::Populating);

        let args = json!({ "kwargs": {
            "configProfile": profile.profile,
            "compartmentId": compartment.id,
        }});
        let list = |command: &'static str| {
            let args = args.clone();
            async move { self.backend.call(command, args).await }
        };

        let (sub, systems, computes, bastions, balancers) = tokio::join!(
            list("mds.list.compartments"),
            list("mds.list.db_systems"),
            list("mds.list.compute_instances"),
            list("mds.list.bastions"),
            list("mds.list.load_balancers"),
        );

        let mut children: Vec<(EntryId, CloudEntry)> = Vec::new();
        let mut clusters: Vec<(EntryId, HeatWaveCluster)> = Vec::new();

        match sub.and_then(rows::<Compartment>) {
            Ok(items) => children.extend(
                items
                    .into_iter()
                    .map(|c| (EntryId::new(c.id.clone()), CloudEntry::Compartment(c))),
            ),
            Err(e) => self.report(&e, "sub-compartments").await,
        }
        match systems.and_then(rows::<DbSystem>) {
            Ok(items) => {
                for system in items {
                    let system_id = EntryId::new(system.id.clone());
                    if let Some(cluster) = &system.heat_wave_cluster {
                        clusters.push((system_id.clone(), cluster.clone()));
                    }
                    children.push((system_id, CloudEntry::DbSystem(system)));
                }
            }
            Err(e) => self.report(&e, "DB systems").await,
        }
        match computes.and_then(rows::<ComputeInstance>) {
            Ok(items) => children.extend(
                items
                    .into_iter()
                    .map(|c| (EntryId::new(c.id.clone()), CloudEntry::ComputeInstance(c))),
            ),
            Err(e) => self.report(&e, "compute instances").await,
        }
        match bastions.and_then(rows::<Bastion>) {
            Ok(items) => children.extend(
                items
                    .into_iter()
                    .map(|b| (EntryId::new(b.id.clone()), CloudEntry::Bastion(b))),
            ),
            Err(e) => self.report(&e, "bastions").await,
        }
        match balancers.and_then(rows::<LoadBalancer>) {
            Ok(items) => children.extend(items.into_iter().map(|lb| {
                let id = if lb.id.is_empty() {
                    format!("loadbalancer:{}", lb.display_name)
                } else {
                    lb.id.clone()
                };
                (EntryId::new(id), CloudEntry::LoadBalancer(lb))
            })),
            Err(e) => self.report(&e, "load balancers").await,
        }

        {
            let mut m = self.store.mutate();
            if let Err(e) = m.reconcile_children(id, children) {
                tracing::warn!(entry = %id, error = %e, "compartment reconcile failed");
            }
            for (system_id, cluster) in clusters {
                let cluster_id = EntryId::new(format!("{system_id}:heatwave"));
                if let Err(e) = m.reconcile_children(
                    &system_id,
                    vec![(cluster_id, CloudEntry::HeatWaveCluster(cluster))],
                ) {
                    tracing::warn!(entry = %system_id, error = %e, "cluster reconcile failed");
                }
            }
            m.set_state(id, EntryState::Populated);
        }
        true
    }

    /// Walk up to the profile entry that owns this subtree.
    fn owning_profile(&self, id: &EntryId) -> Option<ConfigProfile> {
        let mut current = id.clone();
        while let Some(parent) = self.store.parent(&current) {
            if let Some(CloudEntry::Profile(profile)) = self.store.payload(&parent) {
                return Some(profile);
            }
            current = parent;
        }
        None
    }

    /// Authorization denials downgrade to warnings; everything else is an
    /// error. Either way the sibling categories continue.
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

    fn seeded_model(backend: Arc<StubBackend>) -> (CloudModel, Arc<RequisitionHub>) {
        let hub = Arc::new(RequisitionHub::new());
        let model = CloudModel::new(backend, Arc::clone(&hub));
        (model, hub)
    }

    fn profile_json() -> Value {
        json!([{ "profile": "DEFAULT", "region": "us-phoenix-1", "isCurrent": true }])
    }

    fn compartment_json(id: &str, name: &str) -> Value {
        json!({ "id": id, "name": name, "isCurrent": false })
    }

    async fn populated_compartment(backend: &Arc<StubBackend>, model: &CloudModel) -> EntryId {
        backend.push_ok("mds.list.config_profiles", profile_json());
        backend.push_ok(
            "mds.list.compartments",
            json!([compartment_json("ocid.comp.1", "dev")]),
        );
        model.refresh().await;
        model.refresh_profile(&profile_id("DEFAULT")).await;
        EntryId::new("ocid.comp.1")
    }

    #[tokio::test]
    async fn refresh_builds_profiles() {
        let backend = Arc::new(StubBackend::new());
        backend.push_ok("mds.list.config_profiles", profile_json());
        let (model, _hub) = seeded_model(Arc::clone(&backend));

        assert!(model.refresh().await);
        let root = model.store().root().clone();
        assert_eq!(model.store().children(&root), vec![profile_id("DEFAULT")]);
    }

    #[tokio::test]
    async fn compartment_refresh_fetches_all_five_categories() {
        let backend = Arc::new(StubBackend::new());
        let (model, _hub) = seeded_model(Arc::clone(&backend));
        let comp = populated_compartment(&backend, &model).await;

        backend.push_ok("mds.list.compartments", json!([]));
        backend.push_ok(
            "mds.list.db_systems",
            json!([{ "id": "ocid.dbsystem.1", "displayName": "db1", "lifecycleState": "ACTIVE" }]),
        );
        backend.push_ok(
            "mds.list.compute_instances",
            json!([{ "id": "ocid.instance.1", "displayName": "vm1" }]),
        );
        backend.push_ok("mds.list.bastions", json!([{ "id": "ocid.bastion.1", "name": "b1" }]));
        backend.push_ok(
            "mds.list.load_balancers",
            json!([{ "id": "ocid.lb.1", "displayName": "lb1" }]),
        );

        let mut rx = model.store().subscribe();
        assert!(model.refresh_compartment(&comp).await);

        let children = model.store().children(&comp);
        assert_eq!(
            children,
            vec![
                EntryId::new("ocid.dbsystem.1"),
                EntryId::new("ocid.instance.1"),
                EntryId::new("ocid.bastion.1"),
                EntryId::new("ocid.lb.1"),
            ]
        );

        // One Added delta per discovered entity, in one batch.
        let batch = rx.try_recv().unwrap();
        let added = batch
            .iter()
            .filter(|d| matches!(d, TreeDelta::Added(_)))
            .count();
        assert_eq!(added, 4);

        let called = backend.calls();
        for command in [
            "mds.list.compartments",
            "mds.list.db_systems",
            "mds.list.compute_instances",
            "mds.list.bastions",
            "mds.list.load_balancers",
        ] {
            assert!(called.iter().any(|c| c == command), "missing {command}");
        }
    }

    #[tokio::test]
    async fn heatwave_cluster_becomes_a_child_of_its_db_system() {
        let backend = Arc::new(StubBackend::new());
        let (model, _hub) = seeded_model(Arc::clone(&backend));
        let comp = populated_compartment(&backend, &model).await;

        backend.push_ok("mds.list.compartments", json!([]));
        backend.push_ok(
            "mds.list.db_systems",
            json!([{
                "id": "ocid.dbsystem.1",
                "displayName": "db1",
                "heatWaveCluster": { "shapeName": "HW.1", "clusterSize": 2, "lifecycleState": "ACTIVE" },
            }]),
        );
        backend.push_ok("mds.list.compute_instances", json!([]));
        backend.push_ok("mds.list.bastions", json!([]));
        backend.push_ok("mds.list.load_balancers", json!([]));

        model.refresh_compartment(&comp).await;

        let system = EntryId::new("ocid.dbsystem.1");
        let cluster = EntryId::new("ocid.dbsystem.1:heatwave");
        assert_eq!(model.store().children(&system), vec![cluster.clone()]);
        let Some(CloudEntry::HeatWaveCluster(hw)) = model.store().payload(&cluster) else {
            panic!("expected a cluster payload");
        };
        assert_eq!(hw.cluster_size, 2);
    }

    #[tokio::test]
    async fn authorization_denial_warns_and_siblings_proceed() {
        let backend = Arc::new(StubBackend::new());
        let (model, hub) = seeded_model(Arc::clone(&backend));
        let comp = populated_compartment(&backend, &model).await;

        let warnings = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        hub.register(RequisitionKind::ShowWarning, move |r| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                if let Requisition::ShowWarning(text) = r {
                    sink.lock().unwrap().push(text);
                }
                Ok(true)
            })
        });
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

        backend.push_ok("mds.list.compartments", json!([]));
        backend.push_err("mds.list.db_systems", "NotAuthorizedOrNotFound: db systems");
        backend.push_ok(
            "mds.list.compute_instances",
            json!([{ "id": "ocid.instance.1", "displayName": "vm1" }]),
        );
        backend.push_err("mds.list.bastions", "internal failure");
        backend.push_ok("mds.list.load_balancers", json!([]));

        assert!(model.refresh_compartment(&comp).await);

        // The compute instance landed despite two failing categories.
        assert_eq!(
            model.store().children(&comp),
            vec![EntryId::new("ocid.instance.1")]
        );
        assert!(model.store().is_initialized(&comp));

        assert_eq!(warnings.lock().unwrap().len(), 1, "denial should warn");
        assert_eq!(errors.lock().unwrap().len(), 1, "other failures should error");
    }
}
