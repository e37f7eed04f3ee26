//! Node-scope realization engine
//!
//! One engine runs per GPU node, watching that node's Instaslice object.
//! Allocations in `creating` are realized against the hardware: a GPU
//! instance is created at the reserved placement, a compute instance inside
//! it, and the resulting MIG UUID is published to the workload (side-channel
//! record) and the device plugin (capacity token). Allocations in `deleted`
//! are reclaimed in the reverse order, compute instance first.
//!
//! The engine is the only writer of `prepared` entries. All hardware calls
//! go through [`crate::gpu::MigGpuDriver`] on a blocking worker, serialized
//! per GPU; no lock is held across I/O except those per-GPU creation locks.

pub mod capacity;
pub mod probe;
pub mod sidechannel;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{Allocation, AllocationState, Instaslice, Prepared};
use crate::gpu::{GpuError, MigGpuDriver, SlicePlacement};
use crate::retry::{with_backoff, RetryConfig};
use crate::{Error, Result};

use capacity::NodeCapacityClient;
use sidechannel::SideChannelClient;

/// Requeue delay after a transient failure; the next pass re-derives state
const FAILURE_REQUEUE: Duration = Duration::from_secs(1);

/// Access to this node's inventory object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Fetch the inventory, or None when it has not been created yet
    async fn get(&self) -> Result<Option<Instaslice>>;

    /// Create the inventory object
    async fn create(&self, inventory: &Instaslice) -> Result<Instaslice>;

    /// Replace the inventory; fails with a conflict when another writer won
    async fn update(&self, inventory: &Instaslice) -> Result<Instaslice>;
}

/// Real store over the Instaslice API, scoped to one node's object
pub struct NodeInventoryStore {
    api: Api<Instaslice>,
    node_name: String,
}

impl NodeInventoryStore {
    /// Store for `node_name`'s inventory in `namespace`
    pub fn new(client: Client, namespace: &str, node_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            node_name: node_name.to_string(),
        }
    }
}

#[async_trait]
impl InventoryStore for NodeInventoryStore {
    async fn get(&self) -> Result<Option<Instaslice>> {
        Ok(self.api.get_opt(&self.node_name).await?)
    }

    async fn create(&self, inventory: &Instaslice) -> Result<Instaslice> {
        Ok(self.api.create(&PostParams::default(), inventory).await?)
    }

    async fn update(&self, inventory: &Instaslice) -> Result<Instaslice> {
        // replace carries resourceVersion, so a racing writer loses with 409
        Ok(self
            .api
            .replace(&self.node_name, &PostParams::default(), inventory)
            .await?)
    }
}

/// Hardware handles of a realized slice, cached per workload so a redriven
/// reconciliation never creates the hardware twice
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealizedSlice {
    /// GPU instance handle
    pub gi_id: u32,
    /// UUID of the MIG child device
    pub mig_uuid: String,
    /// Compute instance handle
    pub ci_id: u32,
}

/// Shared state for the realization engine
pub struct EngineContext {
    /// Name of the node this engine serves
    pub node_name: String,
    /// This node's inventory object
    pub inventory: Arc<dyn InventoryStore>,
    /// Node status patcher (capacity tokens, reload label)
    pub nodes: Arc<dyn NodeCapacityClient>,
    /// Per-workload device record publisher
    pub sidechannel: Arc<dyn SideChannelClient>,
    /// Vendor GPU library
    pub driver: Arc<dyn MigGpuDriver>,
    /// Retry budget for compare-and-swap inventory writes
    pub retry: RetryConfig,

    // pod name -> realized hardware handles; guarded for map access only,
    // never across I/O
    realized: Mutex<HashMap<String, RealizedSlice>>,
    // per-GPU creation locks; MIG creation is serialized per GPU
    gpu_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EngineContext {
    /// Create an engine context for `node_name`
    pub fn new(
        node_name: impl Into<String>,
        inventory: Arc<dyn InventoryStore>,
        nodes: Arc<dyn NodeCapacityClient>,
        sidechannel: Arc<dyn SideChannelClient>,
        driver: Arc<dyn MigGpuDriver>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            inventory,
            nodes,
            sidechannel,
            driver,
            retry: RetryConfig::default(),
            realized: Mutex::new(HashMap::new()),
            gpu_locks: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, pod_name: &str) -> Option<RealizedSlice> {
        self.realized
            .lock()
            .expect("realized cache poisoned")
            .get(pod_name)
            .cloned()
    }

    fn cache(&self, pod_name: &str, slice: RealizedSlice) {
        self.realized
            .lock()
            .expect("realized cache poisoned")
            .insert(pod_name.to_string(), slice);
    }

    fn uncache(&self, pod_name: &str) {
        self.realized
            .lock()
            .expect("realized cache poisoned")
            .remove(pod_name);
    }

    fn gpu_lock(&self, gpu_uuid: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gpu_locks
            .lock()
            .expect("gpu locks poisoned")
            .entry(gpu_uuid.to_string())
            .or_default()
            .clone()
    }
}

/// Reconcile this node's inventory object.
///
/// Handles one state-changing allocation per pass; the resulting inventory
/// write triggers the next pass, so a backlog drains without requeue loops.
#[instrument(skip(inventory, ctx), fields(node = %inventory.name_any()))]
pub async fn reconcile(inventory: Arc<Instaslice>, ctx: Arc<EngineContext>) -> Result<Action> {
    if inventory.name_any() != ctx.node_name {
        return Ok(Action::await_change());
    }

    for allocation in inventory.spec.allocations.values() {
        if allocation.node != ctx.node_name {
            continue;
        }
        match allocation.state {
            AllocationState::Creating => {
                info!(pod = %allocation.workload_name, profile = %allocation.profile_name,
                    gpu = %allocation.gpu_uuid, start = allocation.slot_start,
                    "realizing slice");
                realize_allocation(&ctx, allocation).await?;
                return Ok(Action::await_change());
            }
            AllocationState::Deleted => {
                info!(pod = %allocation.workload_name, "reclaiming slice");
                reclaim_allocation(&ctx, allocation).await?;
                return Ok(Action::await_change());
            }
            _ => {}
        }
    }

    Ok(Action::await_change())
}

/// Error policy: log and let the next pass re-derive everything
pub fn error_policy(inventory: Arc<Instaslice>, error: &Error, _ctx: Arc<EngineContext>) -> Action {
    error!(node = %inventory.name_any(), error = %error, "engine reconciliation failed");
    Action::requeue(FAILURE_REQUEUE)
}

/// Drive an allocation in `creating` to `created`
async fn realize_allocation(ctx: &EngineContext, allocation: &Allocation) -> Result<()> {
    let slice = obtain_slice(ctx, allocation).await?;

    ctx.sidechannel
        .publish(
            &allocation.namespace,
            &allocation.workload_name,
            &slice.mig_uuid,
        )
        .await?;

    record_realized(ctx, allocation, &slice).await?;

    ctx.nodes
        .add_capacity(&allocation.node, &allocation.workload_name)
        .await?;
    ctx.nodes.flip_reload_label(&allocation.node).await?;

    info!(pod = %allocation.workload_name, mig_uuid = %slice.mig_uuid, "slice realized");
    Ok(())
}

/// Find or create the hardware slice for an allocation.
///
/// Resolution order: in-process cache, then the prepared entry written by a
/// previous engine lifetime, then actual hardware creation. Each step makes
/// a redriven reconciliation idempotent.
async fn obtain_slice(ctx: &EngineContext, allocation: &Allocation) -> Result<RealizedSlice> {
    if let Some(slice) = ctx.cached(&allocation.workload_name) {
        debug!(pod = %allocation.workload_name, "using cached slice handles");
        return Ok(slice);
    }

    if let Some(inventory) = ctx.inventory.get().await? {
        if let Some((mig_uuid, prepared)) = inventory.spec.prepared_for(&allocation.workload_uid) {
            debug!(pod = %allocation.workload_name, mig_uuid = %mig_uuid,
                "adopting slice recorded by a previous run");
            let slice = RealizedSlice {
                gi_id: prepared.gi_handle_id,
                mig_uuid: mig_uuid.clone(),
                ci_id: prepared.ci_handle_id,
            };
            ctx.cache(&allocation.workload_name, slice.clone());
            return Ok(slice);
        }
    }

    let slice = create_slice(ctx, allocation).await?;
    ctx.cache(&allocation.workload_name, slice.clone());
    Ok(slice)
}

/// Create GI + CI at the reserved placement and locate the MIG child
async fn create_slice(ctx: &EngineContext, allocation: &Allocation) -> Result<RealizedSlice> {
    let lock = ctx.gpu_lock(&allocation.gpu_uuid);
    let _guard = lock.lock().await;

    let driver = ctx.driver.clone();
    let allocation = allocation.clone();
    tokio::task::spawn_blocking(move || -> Result<RealizedSlice> {
        let placement = SlicePlacement {
            start: allocation.slot_start,
            size: allocation.slot_size,
        };
        let gi_id =
            driver.create_gpu_instance(&allocation.gpu_uuid, allocation.gi_profile_id, placement)?;
        driver.create_compute_instance(
            &allocation.gpu_uuid,
            gi_id,
            allocation.ci_profile_id,
            allocation.ci_eng_profile_id,
        )?;

        // the MIG UUID only exists on the realized child device; find ours
        // by profile string and backing GI
        let child = driver
            .mig_children(&allocation.gpu_uuid)?
            .into_iter()
            .find(|c| c.profile_name == allocation.profile_name && c.gi_id == gi_id)
            .ok_or_else(|| {
                GpuError::NotFound(format!(
                    "MIG child for GI {gi_id} with profile {}",
                    allocation.profile_name
                ))
            })?;

        Ok(RealizedSlice {
            gi_id,
            mig_uuid: child.mig_uuid,
            ci_id: child.ci_id,
        })
    })
    .await
    .map_err(|e| Error::hardware(format!("driver worker failed: {e}")))?
}

/// Record the prepared entry and advance the allocation to `created`,
/// re-reading and retrying on write conflicts
async fn record_realized(
    ctx: &EngineContext,
    allocation: &Allocation,
    slice: &RealizedSlice,
) -> Result<()> {
    with_backoff(&ctx.retry, "record-realized", || async move {
        let Some(mut inventory) = ctx.inventory.get().await? else {
            return Err(Error::hardware("inventory object disappeared"));
        };
        if inventory.spec.allocation(&allocation.workload_uid).is_none() {
            // teardown raced ahead of us; nothing to record
            warn!(pod = %allocation.workload_name, "allocation vanished before created");
            return Ok(());
        }

        inventory.spec.prepared.insert(
            slice.mig_uuid.clone(),
            Prepared {
                mig_uuid: slice.mig_uuid.clone(),
                parent_gpu_uuid: allocation.gpu_uuid.clone(),
                profile_name: allocation.profile_name.clone(),
                slot_start: allocation.slot_start,
                slot_size: allocation.slot_size,
                workload_uid: allocation.workload_uid.clone(),
                gi_handle_id: slice.gi_id,
                ci_handle_id: slice.ci_id,
            },
        );
        inventory
            .spec
            .advance_allocation(&allocation.workload_uid, AllocationState::Created);

        ctx.inventory.update(&inventory).await?;
        Ok(())
    })
    .await
}

/// Drive an allocation in `deleted` out of existence: destroy CI then GI,
/// retract the workload's published records, prune the inventory entries
async fn reclaim_allocation(ctx: &EngineContext, allocation: &Allocation) -> Result<()> {
    let current = ctx.inventory.get().await?;
    let prepared = current
        .as_ref()
        .and_then(|inv| inv.spec.prepared_for(&allocation.workload_uid))
        .map(|(_, p)| p.clone());

    if let Some(prepared) = prepared {
        destroy_slice(ctx, &prepared).await?;
    } else {
        debug!(pod = %allocation.workload_name, "no prepared entry, hardware already gone");
    }

    ctx.sidechannel
        .remove(&allocation.namespace, &allocation.workload_name)
        .await?;
    ctx.nodes
        .remove_capacity(&allocation.node, &allocation.workload_name)
        .await?;
    ctx.nodes.flip_reload_label(&allocation.node).await?;
    ctx.uncache(&allocation.workload_name);

    with_backoff(&ctx.retry, "prune-workload", || async move {
        let Some(mut inventory) = ctx.inventory.get().await? else {
            return Ok::<(), Error>(());
        };
        inventory.spec.prune_workload(&allocation.workload_uid);
        ctx.inventory.update(&inventory).await?;
        Ok(())
    })
    .await?;

    info!(pod = %allocation.workload_name, "slice reclaimed");
    Ok(())
}

/// Destroy the compute instance, then the GPU instance. The driver reports
/// already-gone as success, so a partial teardown retried later converges.
async fn destroy_slice(ctx: &EngineContext, prepared: &Prepared) -> Result<()> {
    let lock = ctx.gpu_lock(&prepared.parent_gpu_uuid);
    let _guard = lock.lock().await;

    let driver = ctx.driver.clone();
    let prepared = prepared.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        driver.destroy_compute_instance(
            &prepared.parent_gpu_uuid,
            prepared.gi_handle_id,
            prepared.ci_handle_id,
        )?;
        driver.destroy_gpu_instance(&prepared.parent_gpu_uuid, prepared.gi_handle_id)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::hardware(format!("driver worker failed: {e}")))?
}
