//! Instaslice Custom Resource Definition
//!
//! The Instaslice CRD is the per-node inventory record: which GPUs the node
//! carries, which MIG profiles they support, which slices are planned
//! (allocations) and which are realized in hardware (prepared). The planner
//! and the node-local realization engine communicate solely through this
//! object, using optimistic concurrency on writes.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Allocation, AllocationState, Prepared, ProfileDescriptor};

/// Specification for an Instaslice inventory record
///
/// One object exists per GPU-bearing node, named after the node. The node
/// agent fills `gpus`/`profiles` at startup and flips `ready`; the planner
/// only considers ready inventories.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "inference.instaslice.dev",
    version = "v1alpha1",
    kind = "Instaslice",
    plural = "instaslices",
    status = "InstasliceStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".spec.ready"}"#,
    printcolumn = r#"{"name":"GPUs","type":"integer","jsonPath":".spec.gpuCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstasliceSpec {
    /// Name of the node this inventory describes
    pub node: String,

    /// Physical GPUs on the node: UUID -> model string
    #[serde(default)]
    pub gpus: BTreeMap<String, String>,

    /// Number of GPUs, denormalized for kubectl printcolumns
    #[serde(default)]
    pub gpu_count: u32,

    /// Supported MIG profiles with their legal placements, in discovery order
    #[serde(default)]
    pub profiles: Vec<ProfileDescriptor>,

    /// Planned slices: workload UID -> allocation
    #[serde(default)]
    pub allocations: BTreeMap<String, Allocation>,

    /// Realized slices: MIG UUID -> prepared entry
    #[serde(default)]
    pub prepared: BTreeMap<String, Prepared>,

    /// True once the inventory probe has completed on this node
    #[serde(default)]
    pub ready: bool,
}

impl InstasliceSpec {
    /// Look up a profile descriptor by name
    pub fn profile(&self, profile_name: &str) -> Option<&ProfileDescriptor> {
        self.profiles.iter().find(|p| p.profile_name == profile_name)
    }

    /// Look up the allocation for a workload UID
    pub fn allocation(&self, workload_uid: &str) -> Option<&Allocation> {
        self.allocations.get(workload_uid)
    }

    /// Look up the prepared entry owned by a workload UID, with its MIG UUID
    pub fn prepared_for(&self, workload_uid: &str) -> Option<(&String, &Prepared)> {
        self.prepared
            .iter()
            .find(|(_, p)| p.workload_uid == workload_uid)
    }

    /// Insert or replace the allocation for a workload
    pub fn put_allocation(&mut self, allocation: Allocation) {
        self.allocations
            .insert(allocation.workload_uid.clone(), allocation);
    }

    /// Advance an allocation's state, refusing to move backwards.
    ///
    /// Returns true when the state was changed. A false return means the
    /// allocation is missing or already at (or past) the requested state,
    /// which callers treat as "someone else got there first".
    pub fn advance_allocation(&mut self, workload_uid: &str, next: AllocationState) -> bool {
        match self.allocations.get_mut(workload_uid) {
            Some(alloc) if alloc.state.may_advance_to(next) => {
                alloc.state = next;
                true
            }
            _ => false,
        }
    }

    /// Drop the allocation and any prepared entry for a workload
    pub fn prune_workload(&mut self, workload_uid: &str) {
        self.allocations.remove(workload_uid);
        self.prepared.retain(|_, p| p.workload_uid != workload_uid);
    }
}

/// Status for an Instaslice inventory record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstasliceStatus {
    /// Human-readable note from the last probe or reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MigPlacement;

    fn sample_allocation(uid: &str, state: AllocationState) -> Allocation {
        Allocation {
            workload_uid: uid.to_string(),
            namespace: "default".to_string(),
            workload_name: format!("pod-{uid}"),
            node: "node-1".to_string(),
            gpu_uuid: "GPU-1".to_string(),
            profile_name: "1g.5gb".to_string(),
            slot_start: 0,
            slot_size: 1,
            gi_profile_id: 0,
            ci_profile_id: 0,
            ci_eng_profile_id: 0,
            state,
        }
    }

    fn sample_spec() -> InstasliceSpec {
        InstasliceSpec {
            node: "node-1".to_string(),
            gpus: BTreeMap::from([("GPU-1".to_string(), "NVIDIA A100-PCIE-40GB".to_string())]),
            gpu_count: 1,
            profiles: vec![ProfileDescriptor {
                profile_name: "1g.5gb".to_string(),
                gi_profile_id: 0,
                ci_profile_id: 0,
                ci_eng_profile_id: 0,
                placements: (0..7).map(|s| MigPlacement { start: s, size: 1 }).collect(),
            }],
            allocations: BTreeMap::new(),
            prepared: BTreeMap::new(),
            ready: true,
        }
    }

    /// Story: The engine advances a fresh allocation to `created`
    #[test]
    fn story_advance_moves_state_forward() {
        let mut spec = sample_spec();
        spec.put_allocation(sample_allocation("uid-1", AllocationState::Creating));

        assert!(spec.advance_allocation("uid-1", AllocationState::Created));
        assert_eq!(
            spec.allocation("uid-1").unwrap().state,
            AllocationState::Created
        );
    }

    /// Story: A reconciliation holding a stale view cannot rewind the state
    ///
    /// The planner may re-run against a cached inventory where the
    /// allocation is already `ungated`; its attempt to post `created` is a
    /// no-op rather than a regression.
    #[test]
    fn story_advance_refuses_backwards_and_missing() {
        let mut spec = sample_spec();
        spec.put_allocation(sample_allocation("uid-1", AllocationState::Ungated));

        assert!(!spec.advance_allocation("uid-1", AllocationState::Created));
        assert_eq!(
            spec.allocation("uid-1").unwrap().state,
            AllocationState::Ungated
        );
        assert!(!spec.advance_allocation("uid-missing", AllocationState::Created));
    }

    /// Story: Teardown prunes both the allocation and its prepared sibling
    #[test]
    fn story_prune_removes_allocation_and_prepared() {
        let mut spec = sample_spec();
        spec.put_allocation(sample_allocation("uid-1", AllocationState::Deleted));
        spec.prepared.insert(
            "MIG-abc".to_string(),
            Prepared {
                mig_uuid: "MIG-abc".to_string(),
                parent_gpu_uuid: "GPU-1".to_string(),
                profile_name: "1g.5gb".to_string(),
                slot_start: 0,
                slot_size: 1,
                workload_uid: "uid-1".to_string(),
                gi_handle_id: 1,
                ci_handle_id: 0,
            },
        );

        spec.prune_workload("uid-1");
        assert!(spec.allocations.is_empty());
        assert!(spec.prepared.is_empty());
    }

    /// Story: Orphan slices survive pruning of unrelated workloads
    #[test]
    fn story_prune_keeps_unrelated_prepared_entries() {
        let mut spec = sample_spec();
        spec.prepared.insert(
            "MIG-orphan".to_string(),
            Prepared {
                mig_uuid: "MIG-orphan".to_string(),
                parent_gpu_uuid: "GPU-1".to_string(),
                profile_name: "1g.5gb".to_string(),
                slot_start: 3,
                slot_size: 1,
                workload_uid: String::new(),
                gi_handle_id: 7,
                ci_handle_id: 0,
            },
        );

        spec.prune_workload("uid-1");
        assert!(spec.prepared.contains_key("MIG-orphan"));
    }

    #[test]
    fn test_prepared_for_finds_by_workload_uid() {
        let mut spec = sample_spec();
        spec.prepared.insert(
            "MIG-abc".to_string(),
            Prepared {
                mig_uuid: "MIG-abc".to_string(),
                parent_gpu_uuid: "GPU-1".to_string(),
                profile_name: "1g.5gb".to_string(),
                slot_start: 0,
                slot_size: 1,
                workload_uid: "uid-1".to_string(),
                gi_handle_id: 1,
                ci_handle_id: 0,
            },
        );

        let (mig_uuid, prepared) = spec.prepared_for("uid-1").unwrap();
        assert_eq!(mig_uuid, "MIG-abc");
        assert_eq!(prepared.slot_start, 0);
        assert!(spec.prepared_for("uid-2").is_none());
    }

    #[test]
    fn test_spec_survives_json_roundtrip() {
        let mut spec = sample_spec();
        spec.put_allocation(sample_allocation("uid-1", AllocationState::Creating));

        let json = serde_json::to_string(&spec).unwrap();
        let parsed: InstasliceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }
}
