//! Supporting types for the Instaslice CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`Allocation`].
///
/// Transitions are monotone: `Creating -> Created -> Ungated -> Deleting ->
/// Deleted`. Writers may observe states out of order (a missed watch event)
/// but never move an allocation backwards.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    /// Planner has reserved the slot; hardware does not exist yet
    #[default]
    Creating,
    /// Realization engine has created GI+CI and published the MIG UUID
    Created,
    /// Scheduling gate removed; the workload may be admitted
    Ungated,
    /// Workload deletion observed; waiting out the grace period
    Deleting,
    /// Grace elapsed; the engine must reclaim the hardware
    Deleted,
}

impl AllocationState {
    /// Position of this state along the lifecycle, used for monotonicity
    /// checks.
    fn rank(self) -> u8 {
        match self {
            Self::Creating => 0,
            Self::Created => 1,
            Self::Ungated => 2,
            Self::Deleting => 3,
            Self::Deleted => 4,
        }
    }

    /// True when moving from `self` to `next` goes forward along the
    /// lifecycle. A reconciliation observing a later state than the one it
    /// wants to write leaves the allocation unchanged.
    pub fn may_advance_to(self, next: AllocationState) -> bool {
        next.rank() > self.rank()
    }

    /// True for states that occupy GPU slots for accounting purposes.
    ///
    /// `Deleting`/`Deleted` allocations still have hardware behind them, but
    /// their slots are counted through the matching `Prepared` entry, which
    /// lives until the engine reclaims the slice.
    pub fn holds_slots(self) -> bool {
        matches!(self, Self::Creating | Self::Created | Self::Ungated)
    }
}

impl std::fmt::Display for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Ungated => "ungated",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// A legal `(start, size)` slot window for a profile on this hardware
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigPlacement {
    /// First slot of the window
    pub start: u32,
    /// Number of contiguous slots the window covers
    pub size: u32,
}

/// A MIG profile supported by this node's hardware, with its legal placements
///
/// Placements are immutable per hardware generation and listed in the order
/// the vendor library reported them; that order is the FirstFit tie-break.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDescriptor {
    /// Canonical profile name, e.g. `1g.5gb` or `4c.7g.40gb+me`
    pub profile_name: String,

    /// Vendor GPU-instance profile identifier
    pub gi_profile_id: i32,

    /// Vendor compute-instance profile identifier
    pub ci_profile_id: i32,

    /// Vendor compute-instance engine profile identifier
    pub ci_eng_profile_id: i32,

    /// Legal slot windows for this profile
    #[serde(default)]
    pub placements: Vec<MigPlacement>,
}

impl ProfileDescriptor {
    /// Slot footprint of this profile. All placements of a profile share a
    /// size; an empty placement list means the profile cannot be placed.
    pub fn slot_size(&self) -> Option<u32> {
        self.placements.first().map(|p| p.size)
    }
}

/// Scheduler intent: "this workload should get this slot on this GPU"
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// UID of the workload pod this slice belongs to
    pub workload_uid: String,

    /// Namespace of the workload pod
    pub namespace: String,

    /// Name of the workload pod
    pub workload_name: String,

    /// Node the slice is planned on
    pub node: String,

    /// UUID of the physical GPU the slice is planned on
    pub gpu_uuid: String,

    /// Requested MIG profile name
    pub profile_name: String,

    /// First slot of the reserved window
    pub slot_start: u32,

    /// Number of slots the reserved window covers
    pub slot_size: u32,

    /// Vendor GPU-instance profile identifier, copied from the profile
    pub gi_profile_id: i32,

    /// Vendor compute-instance profile identifier, copied from the profile
    pub ci_profile_id: i32,

    /// Vendor compute-instance engine profile identifier
    pub ci_eng_profile_id: i32,

    /// Lifecycle state; the coordination medium between planner and engine
    #[serde(default)]
    pub state: AllocationState,
}

/// Hardware fact: "this MIG UUID is realized at this placement"
///
/// Created and destroyed only by the realization engine, except that the
/// inventory probe records pre-existing slices here with an empty
/// `workload_uid` so restarts never double-book occupied slots.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prepared {
    /// UUID of the realized MIG device
    pub mig_uuid: String,

    /// UUID of the physical GPU the slice lives on
    pub parent_gpu_uuid: String,

    /// Profile the slice was created from
    pub profile_name: String,

    /// First slot of the realized window
    pub slot_start: u32,

    /// Number of slots the realized window covers
    pub slot_size: u32,

    /// Owning workload UID; empty for orphans discovered at probe time
    #[serde(default)]
    pub workload_uid: String,

    /// Vendor handle of the GPU instance
    pub gi_handle_id: u32,

    /// Vendor handle of the compute instance nested inside the GI
    pub ci_handle_id: u32,
}
