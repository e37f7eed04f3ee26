//! Cluster-scope controller for InstaSlice
//!
//! A single controller watches pods and drives three concerns:
//!
//! - The placement planner reserves a GPU slot for every gated pod
//!   ([`planner`]).
//! - The gate releaser removes the scheduling gate once the node agent
//!   reports the slice realized (also in [`planner`], it is the same
//!   reconciliation).
//! - The teardown coordinator walks deleted pods through the grace window
//!   and clears the finalizer once hardware is reclaimed ([`teardown`]).

pub mod planner;
pub mod teardown;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Instaslice;
use crate::placement::PlacementPolicy;
use crate::{Result, FINALIZER, SCHEDULING_GATE};

pub use planner::{error_policy, reconcile};
pub use teardown::TtlSet;

/// Read/write access to every node's inventory object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InventoryOps: Send + Sync {
    /// List all inventory objects in the inventory namespace
    async fn list(&self) -> Result<Vec<Instaslice>>;

    /// Replace an inventory; fails with a conflict when another writer won
    async fn update(&self, inventory: &Instaslice) -> Result<Instaslice>;
}

/// Mutations the controller applies to workload pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodOps: Send + Sync {
    /// Remove the scheduling gate; a pod without the gate is success
    async fn remove_scheduling_gate(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the finalizer; a pod without the finalizer is success
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real inventory access over the Instaslice API
pub struct ClusterInventories {
    api: Api<Instaslice>,
}

impl ClusterInventories {
    /// Access inventories stored in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl InventoryOps for ClusterInventories {
    async fn list(&self) -> Result<Vec<Instaslice>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn update(&self, inventory: &Instaslice) -> Result<Instaslice> {
        Ok(self
            .api
            .replace(&inventory.name_any(), &PostParams::default(), inventory)
            .await?)
    }
}

/// Real pod mutations over the core API
pub struct ClusterPods {
    client: Client,
}

impl ClusterPods {
    /// Create pod access through the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodOps for ClusterPods {
    async fn remove_scheduling_gate(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get(name).await?;

        let Some(gates) = pod.spec.as_ref().and_then(|s| s.scheduling_gates.as_ref()) else {
            return Ok(());
        };
        if !gates.iter().any(|g| g.name == SCHEDULING_GATE) {
            debug!(pod = %name, "scheduling gate already removed");
            return Ok(());
        }

        let remaining: Vec<_> = gates
            .iter()
            .filter(|g| g.name != SCHEDULING_GATE)
            .cloned()
            .collect();
        let patch = serde_json::json!({ "spec": { "schedulingGates": remaining } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = match api.get_opt(name).await? {
            Some(pod) => pod,
            None => return Ok(()),
        };

        let finalizers = pod.metadata.finalizers.unwrap_or_default();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }

        let remaining: Vec<_> = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state for the cluster controller
pub struct Context {
    /// Inventory objects across all nodes
    pub inventories: Arc<dyn InventoryOps>,
    /// Pod gate/finalizer mutations
    pub pods: Arc<dyn PodOps>,
    /// Ordering strategy over profile placements
    pub policy: PlacementPolicy,
    /// How long a deleted workload keeps its slice before reclaim
    pub teardown_grace: std::time::Duration,
    /// Workloads whose `deleted` transition was already posted
    pub posted_deletes: TtlSet,
}

impl Context {
    /// Production context over a kube client
    pub fn new(client: Client, inventory_namespace: &str) -> Self {
        Self {
            inventories: Arc::new(ClusterInventories::new(client.clone(), inventory_namespace)),
            pods: Arc::new(ClusterPods::new(client)),
            policy: PlacementPolicy::FirstFit,
            teardown_grace: std::time::Duration::from_secs(crate::DEFAULT_TEARDOWN_GRACE_SECS),
            posted_deletes: TtlSet::default(),
        }
    }

    /// Context with explicit collaborators, used in tests
    pub fn with_clients(
        inventories: Arc<dyn InventoryOps>,
        pods: Arc<dyn PodOps>,
        policy: PlacementPolicy,
        teardown_grace: std::time::Duration,
    ) -> Self {
        Self {
            inventories,
            pods,
            policy,
            teardown_grace,
            posted_deletes: TtlSet::default(),
        }
    }
}
