//! Placement planner and gate releaser
//!
//! For every pod carrying the scheduling gate, the planner picks a node, a
//! GPU, and a slot window where the requested MIG profile fits, and records
//! the reservation as an `Allocation` in that node's inventory. The node
//! agent realizes the reservation; once it reports `created`, the planner
//! removes the scheduling gate so admission can proceed.
//!
//! Planning never blocks on other planners: inventory writes are
//! compare-and-swap, and a lost write drops the local decision and requeues.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Allocation, AllocationState, Instaslice};
use crate::placement::{find_slot, NO_FIT};
use crate::{Error, Result, SCHEDULING_GATE};

use super::teardown;
use super::Context;

/// Requeue while the node agent is still realizing the slice
const REQUEUE_CREATING: Duration = Duration::from_secs(5);
/// Requeue after writing a reservation, to run the gate-release check
const REQUEUE_PLANNED: Duration = Duration::from_secs(10);
/// Requeue while no GPU can fit the profile; inventories change over time
const REQUEUE_NO_FIT: Duration = Duration::from_secs(10);
/// Requeue after losing a compare-and-swap race
const REQUEUE_CONFLICT: Duration = Duration::from_secs(1);

fn mig_profile_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+g\.\d+gb)").expect("static pattern"))
}

/// Reconcile a pod
///
/// Dispatches to teardown for deleted pods, otherwise plans or releases the
/// gate for gated pods. Pods without our gate are ignored.
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action> {
    if pod.metadata.deletion_timestamp.is_some() && has_finalizer(&pod) {
        return teardown::handle_deletion(&pod, &ctx).await;
    }

    if !is_gated_and_blocked(&pod) {
        return Ok(Action::await_change());
    }

    let workload_uid = pod.uid().unwrap_or_default();
    let inventories = ctx.inventories.list().await?;

    // Gate-release check first: an existing reservation is never re-planned
    if let Some((inventory, allocation)) = find_allocation(&inventories, &workload_uid) {
        return match allocation.state {
            AllocationState::Created => release_gate(&pod, inventory, &ctx).await,
            AllocationState::Creating => {
                debug!("reservation awaiting hardware");
                Ok(Action::requeue(REQUEUE_CREATING))
            }
            AllocationState::Ungated => {
                // a stale watch event can still show the gate; removal is
                // idempotent
                ctx.pods
                    .remove_scheduling_gate(&pod.namespace().unwrap_or_default(), &pod.name_any())
                    .await?;
                Ok(Action::await_change())
            }
            AllocationState::Deleting | AllocationState::Deleted => Ok(Action::await_change()),
        };
    }

    plan(&pod, &workload_uid, inventories, &ctx).await
}

/// Error policy: log and retry with a flat delay
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(pod = %pod.name_any(), error = %error, "pod reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Pick a node, GPU, and slot for the pod and write the reservation
async fn plan(
    pod: &Pod,
    workload_uid: &str,
    inventories: Vec<Instaslice>,
    ctx: &Context,
) -> Result<Action> {
    let profile_name = extract_profile_name(pod)?;
    debug!(profile = %profile_name, "planning placement");

    for inventory in inventories {
        if !inventory.spec.ready {
            debug!(node = %inventory.spec.node, "inventory not probed yet, skipping");
            continue;
        }

        for gpu_uuid in inventory.spec.gpus.keys() {
            let start = find_slot(&inventory.spec, gpu_uuid, &profile_name, ctx.policy);
            if start == NO_FIT {
                continue;
            }

            let Some(profile) = inventory.spec.profile(&profile_name) else {
                continue;
            };
            let Some(slot_size) = profile.slot_size() else {
                continue;
            };

            let allocation = Allocation {
                workload_uid: workload_uid.to_string(),
                namespace: pod.namespace().unwrap_or_default(),
                workload_name: pod.name_any(),
                node: inventory.spec.node.clone(),
                gpu_uuid: gpu_uuid.clone(),
                profile_name: profile_name.clone(),
                slot_start: start,
                slot_size,
                gi_profile_id: profile.gi_profile_id,
                ci_profile_id: profile.ci_profile_id,
                ci_eng_profile_id: profile.ci_eng_profile_id,
                state: AllocationState::Creating,
            };

            let mut reserved = inventory.clone();
            reserved.spec.put_allocation(allocation);
            match ctx.inventories.update(&reserved).await {
                Ok(_) => {
                    info!(
                        node = %reserved.spec.node,
                        gpu = %gpu_uuid,
                        start,
                        size = slot_size,
                        profile = %profile_name,
                        "reserved slice"
                    );
                    return Ok(Action::requeue(REQUEUE_PLANNED));
                }
                Err(e) if e.is_conflict() => {
                    // another writer won; drop the decision and re-plan from
                    // a fresh read on the next pass
                    warn!(node = %reserved.spec.node, "inventory changed under us, re-planning");
                    return Ok(Action::requeue(REQUEUE_CONFLICT));
                }
                Err(e) => return Err(e),
            }
        }
    }

    warn!(profile = %profile_name, "no GPU can place profile, pod stays gated");
    Ok(Action::requeue(REQUEUE_NO_FIT))
}

/// Remove the scheduling gate and advance the allocation to `ungated`
async fn release_gate(pod: &Pod, inventory: &Instaslice, ctx: &Context) -> Result<Action> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    ctx.pods.remove_scheduling_gate(&namespace, &name).await?;

    let workload_uid = pod.uid().unwrap_or_default();
    let mut updated = inventory.clone();
    if updated
        .spec
        .advance_allocation(&workload_uid, AllocationState::Ungated)
    {
        match ctx.inventories.update(&updated).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                // the gate is already off; the state write retries next pass
                return Ok(Action::requeue(REQUEUE_CONFLICT));
            }
            Err(e) => return Err(e),
        }
    }

    info!(pod = %name, "scheduling gate released");
    Ok(Action::await_change())
}

/// True when the pod carries our scheduling gate and is blocked pending
fn is_gated_and_blocked(pod: &Pod) -> bool {
    let gated = pod
        .spec
        .as_ref()
        .and_then(|s| s.scheduling_gates.as_ref())
        .is_some_and(|gates| gates.iter().any(|g| g.name == SCHEDULING_GATE));
    if !gated {
        return false;
    }

    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let pending = status.phase.as_deref() == Some("Pending");
    let blocked = status
        .conditions
        .as_ref()
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.message.as_deref().is_some_and(|m| m.contains("blocked")))
        });
    pending && blocked
}

/// True when the pod holds our finalizer
pub(super) fn has_finalizer(pod: &Pod) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == crate::FINALIZER))
}

/// Extract the MIG profile name from the pod's resource limits.
///
/// Exactly one container may request a GPU; the profile is matched by
/// `<digits>g.<digits>gb` inside a vendor-prefixed resource key.
fn extract_profile_name(pod: &Pod) -> Result<String> {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let mut gpu_containers = containers.iter().filter_map(|container| {
        let limits = container.resources.as_ref()?.limits.as_ref()?;
        let vendor_keys: Vec<&String> =
            limits.keys().filter(|key| key.contains("nvidia")).collect();
        (!vendor_keys.is_empty()).then_some(vendor_keys)
    });

    let Some(vendor_keys) = gpu_containers.next() else {
        return Err(Error::invalid_request(
            "no container requests a GPU resource",
        ));
    };
    if gpu_containers.next().is_some() {
        return Err(Error::invalid_request(
            "more than one container requests a GPU resource",
        ));
    }

    for key in vendor_keys {
        if let Some(captures) = mig_profile_pattern().captures(key) {
            return Ok(captures[1].to_string());
        }
    }
    Err(Error::invalid_request(
        "no MIG profile found in GPU resource limits",
    ))
}

/// Find the inventory holding an allocation for `workload_uid`
fn find_allocation<'a>(
    inventories: &'a [Instaslice],
    workload_uid: &str,
) -> Option<(&'a Instaslice, &'a Allocation)> {
    inventories.iter().find_map(|inventory| {
        inventory
            .spec
            .allocation(workload_uid)
            .map(|allocation| (inventory, allocation))
    })
}
