//! Teardown coordination for deleted workloads
//!
//! A deleted pod holding our finalizer walks through three steps, each
//! re-derived from cluster state on every reconciliation:
//!
//! 1. Its allocation is marked `deleting` as soon as the deletion is
//!    observed.
//! 2. After the grace window has elapsed, the allocation is marked
//!    `deleted` exactly once; the node agent reacts by reclaiming the
//!    hardware and pruning the inventory entries.
//! 3. Once no allocation or prepared entry remains for the workload, the
//!    finalizer is removed and the pod is released.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::AllocationState;
use crate::Result;

use super::Context;

/// Requeue while waiting for the node agent to reclaim hardware
const RECLAIM_POLL: Duration = Duration::from_secs(5);
/// Requeue after losing a compare-and-swap race
const REQUEUE_CONFLICT: Duration = Duration::from_secs(1);

/// A set whose entries expire after a fixed TTL.
///
/// Used to post the `deleted` transition exactly once per workload without
/// growing without bound across the controller's lifetime; after the TTL a
/// re-post is harmless because state transitions are monotone.
pub struct TtlSet {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl TtlSet {
    /// Create a set whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a key
    pub fn insert(&self, key: &str) {
        let mut entries = self.entries.lock().expect("ttl set poisoned");
        let now = Instant::now();
        entries.retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
        entries.insert(key.to_string(), now);
    }

    /// True when the key was recorded within the TTL
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().expect("ttl set poisoned");
        entries
            .get(key)
            .is_some_and(|inserted| inserted.elapsed() < self.ttl)
    }
}

impl Default for TtlSet {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

/// Walk a deleted pod toward finalizer release
pub(super) async fn handle_deletion(pod: &Pod, ctx: &Context) -> Result<Action> {
    let workload_uid = pod.uid().unwrap_or_default();
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let Some(deleted_at) = pod.metadata.deletion_timestamp.as_ref() else {
        return Ok(Action::await_change());
    };

    let inventories = ctx.inventories.list().await?;
    let located = inventories.iter().find_map(|inventory| {
        inventory
            .spec
            .allocation(&workload_uid)
            .map(|allocation| (inventory, allocation.state))
    });

    let Some((inventory, state)) = located else {
        // allocation pruned by the engine; the prepared entry going away is
        // the signal that hardware is reclaimed
        let hardware_remains = inventories
            .iter()
            .any(|inv| inv.spec.prepared_for(&workload_uid).is_some());
        if hardware_remains {
            debug!(pod = %name, "hardware not yet reclaimed");
            return Ok(Action::requeue(RECLAIM_POLL));
        }
        info!(pod = %name, "teardown complete, releasing finalizer");
        ctx.pods.remove_finalizer(&namespace, &name).await?;
        return Ok(Action::await_change());
    };

    // step 1: tombstone the allocation the moment deletion is observed
    if state.holds_slots() {
        let mut updated = inventory.clone();
        updated
            .spec
            .advance_allocation(&workload_uid, AllocationState::Deleting);
        return match ctx.inventories.update(&updated).await {
            Ok(_) => {
                info!(pod = %name, "allocation marked deleting");
                Ok(Action::requeue(RECLAIM_POLL))
            }
            Err(e) if e.is_conflict() => Ok(Action::requeue(REQUEUE_CONFLICT)),
            Err(e) => Err(e),
        };
    }

    // step 2: only post `deleted` once the grace window has fully elapsed
    let elapsed = (Utc::now() - deleted_at.0)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed < ctx.teardown_grace {
        let remaining = ctx.teardown_grace - elapsed;
        debug!(pod = %name, remaining_secs = remaining.as_secs(), "grace window running");
        return Ok(Action::requeue(remaining));
    }

    if state == AllocationState::Deleting && !ctx.posted_deletes.contains(&workload_uid) {
        let mut updated = inventory.clone();
        updated
            .spec
            .advance_allocation(&workload_uid, AllocationState::Deleted);
        match ctx.inventories.update(&updated).await {
            Ok(_) => {
                ctx.posted_deletes.insert(&workload_uid);
                info!(pod = %name, "allocation marked deleted, engine will reclaim");
            }
            Err(e) if e.is_conflict() => {
                warn!(pod = %name, "lost write race posting deleted, retrying");
                return Ok(Action::requeue(REQUEUE_CONFLICT));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Action::requeue(RECLAIM_POLL))
}
