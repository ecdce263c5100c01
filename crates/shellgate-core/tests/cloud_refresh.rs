//! Compartment refresh behavior against a scripted backend.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Barrier;

use shellgate_core::model::CloudModel;
use shellgate_core::model::tree::{EntryId, TreeDelta};
use shellgate_core::{CoreError, RequisitionHub, ShellBackend};

/// Backend whose category listings rendezvous on a barrier: the refresh
/// only completes if all five category fetches are in flight at once.
struct BarrierBackend {
    barrier: Barrier,
    armed: AtomicBool,
}

impl BarrierBackend {
    fn new() -> Self {
        Self {
            barrier: Barrier::new(5),
            armed: AtomicBool::new(false),
        }
    }
}

impl ShellBackend for BarrierBackend {
    fn call(&self, command: &str, _args: Value) -> BoxFuture<'_, Result<Value, CoreError>> {
        let command = command.to_owned();
        Box::pin(async move {
            if self.armed.load(Ordering::SeqCst) {
                self.barrier.wait().await;
            }

            Ok(match command.as_str() {
                "mds.list.config_profiles" => {
                    json!([{ "profile": "DEFAULT", "region": "us-phoenix-1", "isCurrent": true }])
                }
                "mds.list.compartments" => {
                    if self.armed.load(Ordering::SeqCst) {
                        json!([])
                    } else {
                        json!([{ "id": "ocid.comp.1", "name": "dev", "isCurrent": false }])
                    }
                }
                "mds.list.db_systems" => json!([
                    { "id": "ocid.dbsystem.1", "displayName": "db1", "lifecycleState": "ACTIVE" },
                ]),
                "mds.list.compute_instances" => json!([
                    { "id": "ocid.instance.1", "displayName": "vm1" },
                ]),
                "mds.list.bastions" => json!([{ "id": "ocid.bastion.1", "name": "b1" }]),
                "mds.list.load_balancers" => json!([
                    { "id": "ocid.lb.1", "displayName": "lb1" },
                ]),
                _ => Value::Null,
            })
        })
    }
}

#[tokio::test]
async fn category_fetches_run_concurrently() {
    let backend = Arc::new(BarrierBackend::new());
    let hub = Arc::new(RequisitionHub::new());
    let model = CloudModel::new(Arc::clone(&backend) as Arc<dyn ShellBackend>, hub);

    assert!(model.refresh().await);
    let profile = EntryId::new("profile:DEFAULT");
    assert!(model.refresh_profile(&profile).await);

    let compartment = EntryId::new("ocid.comp.1");
    backend.armed.store(true, Ordering::SeqCst);

    let mut rx = model.store().subscribe();

    // If the five categories were fetched one at a time, the barrier
    // would never release and this would time out.
    let refreshed = tokio::time::timeout(
        Duration::from_secs(10),
        model.refresh_compartment(&compartment),
    )
    .await
    .expect("category fetches must be issued concurrently");
    assert!(refreshed);

    // One Added delta per discovered entity, in a single batch.
    let batch = rx.try_recv().unwrap();
    let added: Vec<_> = batch
        .iter()
        .filter_map(|d| match d {
            TreeDelta::Added(id) => Some(id.as_str().to_owned()),
            _ => None,
        })
        .collect();
    assert_eq!(
        added,
        vec![
            "ocid.dbsystem.1".to_owned(),
            "ocid.instance.1".to_owned(),
            "ocid.bastion.1".to_owned(),
            "ocid.lb.1".to_owned(),
        ]
    );
    assert!(model.store().is_initialized(&compartment));
}
