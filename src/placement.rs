//! Slot accounting: deciding where a MIG profile fits on a GPU
//!
//! A MIG-capable GPU exposes a small number of ordinal slots (eight on
//! current hardware); a profile occupies a contiguous run of 1, 2, 4, or 8
//! of them, and only from certain starting positions. This module is the
//! single fit-finding authority shared by the cluster planner and the node
//! engine: a pure function over an inventory snapshot, free of side effects.

use crate::crd::{InstasliceSpec, MigPlacement};

/// Sentinel slot index meaning "no placement fits"
pub const NO_FIT: u32 = 9;

/// Ordering strategy over a profile's legal placements.
///
/// Policies only reorder the candidate list; the fit check itself never
/// changes. FirstFit keeps the order the hardware reported, which is the
/// default tie-break.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Try placements in hardware discovery order
    #[default]
    FirstFit,
    /// Try placements from the lowest start index upwards
    LeftToRight,
    /// Try placements from the highest start index downwards
    RightToLeft,
}

impl std::str::FromStr for PlacementPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-fit" => Ok(Self::FirstFit),
            "left-to-right" => Ok(Self::LeftToRight),
            "right-to-left" => Ok(Self::RightToLeft),
            _ => Err(crate::Error::invalid_request(format!(
                "unknown placement policy: {s}, expected one of: first-fit, left-to-right, right-to-left"
            ))),
        }
    }
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstFit => write!(f, "first-fit"),
            Self::LeftToRight => write!(f, "left-to-right"),
            Self::RightToLeft => write!(f, "right-to-left"),
        }
    }
}

impl PlacementPolicy {
    /// Produce the candidate placements in the order this policy tries them
    pub fn ordered(&self, placements: &[MigPlacement]) -> Vec<MigPlacement> {
        let mut candidates = placements.to_vec();
        match self {
            Self::FirstFit => {}
            Self::LeftToRight => candidates.sort_by_key(|p| p.start),
            Self::RightToLeft => {
                candidates.sort_by_key(|p| p.start);
                candidates.reverse();
            }
        }
        candidates
    }
}

/// Number of slots the GPU exposes, derived from the placement lists.
///
/// Current hardware has eight; deriving the universe from the inventory
/// keeps the kernel correct on generations with a different slot count.
pub fn slot_universe(inventory: &InstasliceSpec) -> usize {
    inventory
        .profiles
        .iter()
        .flat_map(|p| p.placements.iter())
        .map(|p| (p.start + p.size) as usize)
        .max()
        .unwrap_or(8)
}

/// Find the first legal start slot where `profile_name` fits on `gpu_uuid`.
///
/// Occupancy is the union of every realized slice on the GPU (`prepared`,
/// owned or orphaned) and every live allocation targeting it (states
/// `creating`, `created`, `ungated`). Returns [`NO_FIT`] when no placement
/// window is free, when the profile is unknown, or when it has no placements
/// on this hardware.
pub fn find_slot(
    inventory: &InstasliceSpec,
    gpu_uuid: &str,
    profile_name: &str,
    policy: PlacementPolicy,
) -> u32 {
    let universe = slot_universe(inventory);
    let mut occupied = vec![false; universe];

    let mut mark = |start: u32, size: u32| {
        for slot in start..start.saturating_add(size) {
            if let Some(cell) = occupied.get_mut(slot as usize) {
                *cell = true;
            }
        }
    };

    for prepared in inventory.prepared.values() {
        if prepared.parent_gpu_uuid == gpu_uuid {
            mark(prepared.slot_start, prepared.slot_size);
        }
    }
    for allocation in inventory.allocations.values() {
        if allocation.gpu_uuid == gpu_uuid && allocation.state.holds_slots() {
            mark(allocation.slot_start, allocation.slot_size);
        }
    }

    let Some(profile) = inventory.profile(profile_name) else {
        return NO_FIT;
    };
    let Some(need) = profile.slot_size() else {
        return NO_FIT;
    };

    for candidate in policy.ordered(&profile.placements) {
        let start = candidate.start as usize;
        let end = start + need as usize;
        if end <= universe && occupied[start..end].iter().all(|slot| !slot) {
            return candidate.start;
        }
    }

    NO_FIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Allocation, AllocationState, Prepared, ProfileDescriptor};
    use std::collections::BTreeMap;

    fn placements(pairs: &[(u32, u32)]) -> Vec<MigPlacement> {
        pairs
            .iter()
            .map(|&(start, size)| MigPlacement { start, size })
            .collect()
    }

    fn profile(name: &str, gi: i32, windows: &[(u32, u32)]) -> ProfileDescriptor {
        ProfileDescriptor {
            profile_name: name.to_string(),
            gi_profile_id: gi,
            ci_profile_id: gi,
            ci_eng_profile_id: 0,
            placements: placements(windows),
        }
    }

    /// A100-shaped inventory: one GPU, the profile set used throughout
    fn a100_inventory() -> InstasliceSpec {
        InstasliceSpec {
            node: "node-1".to_string(),
            gpus: BTreeMap::from([("GPU-A".to_string(), "NVIDIA A100-PCIE-40GB".to_string())]),
            gpu_count: 1,
            profiles: vec![
                profile(
                    "1g.5gb",
                    0,
                    &[(0, 1), (1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 1)],
                ),
                profile("2g.10gb", 1, &[(0, 2), (2, 2), (4, 2), (6, 2)]),
                profile("3g.20gb", 2, &[(0, 4), (4, 4)]),
                profile("7g.40gb", 4, &[(0, 8)]),
            ],
            allocations: BTreeMap::new(),
            prepared: BTreeMap::new(),
            ready: true,
        }
    }

    fn prepared_at(gpu: &str, start: u32, size: u32) -> Prepared {
        Prepared {
            mig_uuid: format!("MIG-{gpu}-{start}"),
            parent_gpu_uuid: gpu.to_string(),
            profile_name: "any".to_string(),
            slot_start: start,
            slot_size: size,
            workload_uid: String::new(),
            gi_handle_id: 0,
            ci_handle_id: 0,
        }
    }

    fn allocation_at(gpu: &str, start: u32, size: u32, state: AllocationState) -> Allocation {
        Allocation {
            workload_uid: format!("uid-{gpu}-{start}"),
            namespace: "default".to_string(),
            workload_name: "w".to_string(),
            node: "node-1".to_string(),
            gpu_uuid: gpu.to_string(),
            profile_name: "any".to_string(),
            slot_start: start,
            slot_size: size,
            gi_profile_id: 0,
            ci_profile_id: 0,
            ci_eng_profile_id: 0,
            state,
        }
    }

    // =========================================================================
    // Fit-Finding Stories
    // =========================================================================

    /// Story: An empty GPU places a small slice at the first legal window
    #[test]
    fn story_empty_gpu_takes_first_placement() {
        let inventory = a100_inventory();
        assert_eq!(
            find_slot(&inventory, "GPU-A", "1g.5gb", PlacementPolicy::FirstFit),
            0
        );
    }

    /// Story: A fragmented GPU still serves an exact-fit request
    ///
    /// Slices at (0,2) and (4,2) leave exactly one 2-slot hole at start 2;
    /// the kernel finds it rather than reporting the GPU full.
    #[test]
    fn story_exact_fit_between_fragments() {
        let mut inventory = a100_inventory();
        for p in [prepared_at("GPU-A", 0, 2), prepared_at("GPU-A", 4, 2)] {
            inventory.prepared.insert(p.mig_uuid.clone(), p);
        }
        assert_eq!(
            find_slot(&inventory, "GPU-A", "2g.10gb", PlacementPolicy::FirstFit),
            2
        );
    }

    /// Story: A full GPU reports the no-fit sentinel
    #[test]
    fn story_full_gpu_returns_sentinel() {
        let mut inventory = a100_inventory();
        for p in [prepared_at("GPU-A", 0, 4), prepared_at("GPU-A", 4, 4)] {
            inventory.prepared.insert(p.mig_uuid.clone(), p);
        }
        assert_eq!(
            find_slot(&inventory, "GPU-A", "1g.5gb", PlacementPolicy::FirstFit),
            NO_FIT
        );
    }

    /// Story: Live allocations occupy slots before hardware exists
    ///
    /// An allocation still in `creating` has no prepared sibling yet, but
    /// its window is reserved; a second workload must land elsewhere.
    #[test]
    fn story_pending_allocation_blocks_window() {
        let mut inventory = a100_inventory();
        let alloc = allocation_at("GPU-A", 0, 2, AllocationState::Creating);
        inventory.put_allocation(alloc);

        assert_eq!(
            find_slot(&inventory, "GPU-A", "2g.10gb", PlacementPolicy::FirstFit),
            2
        );
    }

    /// Story: Tombstoned allocations do not double-book their slots
    ///
    /// After teardown begins the allocation stops holding slots; occupancy
    /// comes from the prepared entry until the engine reclaims the slice.
    #[test]
    fn story_deleting_allocation_releases_accounting_to_prepared() {
        let mut inventory = a100_inventory();
        inventory.put_allocation(allocation_at("GPU-A", 0, 2, AllocationState::Deleting));

        assert_eq!(
            find_slot(&inventory, "GPU-A", "2g.10gb", PlacementPolicy::FirstFit),
            0
        );

        let p = prepared_at("GPU-A", 0, 2);
        inventory.prepared.insert(p.mig_uuid.clone(), p);
        assert_eq!(
            find_slot(&inventory, "GPU-A", "2g.10gb", PlacementPolicy::FirstFit),
            2
        );
    }

    /// Story: Occupancy on one GPU never leaks onto a sibling GPU
    #[test]
    fn story_occupancy_is_per_gpu() {
        let mut inventory = a100_inventory();
        inventory
            .gpus
            .insert("GPU-B".to_string(), "NVIDIA A100-PCIE-40GB".to_string());
        let p = prepared_at("GPU-A", 0, 8);
        inventory.prepared.insert(p.mig_uuid.clone(), p);

        assert_eq!(
            find_slot(&inventory, "GPU-A", "3g.20gb", PlacementPolicy::FirstFit),
            NO_FIT
        );
        assert_eq!(
            find_slot(&inventory, "GPU-B", "3g.20gb", PlacementPolicy::FirstFit),
            0
        );
    }

    /// Story: Unknown profiles and empty placement lists cannot be placed
    #[test]
    fn story_unknown_or_unplaceable_profile_is_no_fit() {
        let mut inventory = a100_inventory();
        assert_eq!(
            find_slot(&inventory, "GPU-A", "9g.999gb", PlacementPolicy::FirstFit),
            NO_FIT
        );

        inventory.profiles.push(ProfileDescriptor {
            profile_name: "ghost".to_string(),
            gi_profile_id: 9,
            ci_profile_id: 9,
            ci_eng_profile_id: 0,
            placements: vec![],
        });
        assert_eq!(
            find_slot(&inventory, "GPU-A", "ghost", PlacementPolicy::FirstFit),
            NO_FIT
        );
    }

    // =========================================================================
    // Invariant Checks
    // =========================================================================

    /// Every result the kernel hands out is a legal placement start whose
    /// window is disjoint from all existing occupancy. Exercised across all
    /// profiles and a sweep of occupancy patterns.
    #[test]
    fn prop_results_are_legal_and_disjoint() {
        let base = a100_inventory();
        let profile_names: Vec<String> = base
            .profiles
            .iter()
            .map(|p| p.profile_name.clone())
            .collect();

        // Occupancy patterns: each bit pattern places 1-slot slices
        for pattern in 0u32..256 {
            let mut inventory = a100_inventory();
            for slot in 0..8 {
                if pattern & (1 << slot) != 0 {
                    let p = prepared_at("GPU-A", slot, 1);
                    inventory.prepared.insert(p.mig_uuid.clone(), p);
                }
            }

            for name in &profile_names {
                let start = find_slot(&inventory, "GPU-A", name, PlacementPolicy::FirstFit);
                if start == NO_FIT {
                    continue;
                }
                let profile = inventory.profile(name).unwrap();
                assert!(
                    profile.placements.iter().any(|p| p.start == start),
                    "{name}: start {start} not in placement list"
                );
                let size = profile.slot_size().unwrap();
                for slot in start..start + size {
                    assert!(
                        pattern & (1 << slot) == 0,
                        "{name}: start {start} overlaps occupied slot {slot} (pattern {pattern:08b})"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Policy Ordering
    // =========================================================================

    #[test]
    fn test_policies_reorder_candidates_only() {
        let windows = placements(&[(4, 2), (0, 2), (6, 2), (2, 2)]);

        let first_fit: Vec<u32> = PlacementPolicy::FirstFit
            .ordered(&windows)
            .iter()
            .map(|p| p.start)
            .collect();
        assert_eq!(first_fit, vec![4, 0, 6, 2]);

        let ltr: Vec<u32> = PlacementPolicy::LeftToRight
            .ordered(&windows)
            .iter()
            .map(|p| p.start)
            .collect();
        assert_eq!(ltr, vec![0, 2, 4, 6]);

        let rtl: Vec<u32> = PlacementPolicy::RightToLeft
            .ordered(&windows)
            .iter()
            .map(|p| p.start)
            .collect();
        assert_eq!(rtl, vec![6, 4, 2, 0]);
    }

    /// Story: RightToLeft packs from the high end of the GPU
    #[test]
    fn story_right_to_left_prefers_high_slots() {
        let inventory = a100_inventory();
        assert_eq!(
            find_slot(&inventory, "GPU-A", "2g.10gb", PlacementPolicy::RightToLeft),
            6
        );
        assert_eq!(
            find_slot(&inventory, "GPU-A", "3g.20gb", PlacementPolicy::RightToLeft),
            4
        );
    }

    // =========================================================================
    // Slot Universe Derivation
    // =========================================================================

    #[test]
    fn test_universe_derived_from_placements() {
        let inventory = a100_inventory();
        assert_eq!(slot_universe(&inventory), 8);

        let small = InstasliceSpec {
            profiles: vec![profile("1g.6gb", 0, &[(0, 1), (1, 1), (2, 1), (3, 1)])],
            ..InstasliceSpec::default()
        };
        assert_eq!(slot_universe(&small), 4);

        let empty = InstasliceSpec::default();
        assert_eq!(slot_universe(&empty), 8);
    }

    /// Story: A window reaching past the universe is rejected
    ///
    /// A profile's footprint comes from its first placement; a trailing
    /// candidate whose window would run off the end of the GPU is skipped
    /// rather than indexed out of range.
    #[test]
    fn story_window_past_universe_is_rejected() {
        let mut inventory = InstasliceSpec {
            profiles: vec![profile("2g.12gb", 1, &[(0, 2), (7, 1)])],
            ..InstasliceSpec::default()
        };
        assert_eq!(slot_universe(&inventory), 8);

        let p = prepared_at("GPU-A", 0, 2);
        inventory.prepared.insert(p.mig_uuid.clone(), p);

        // only remaining candidate starts at 7, but the 2-slot footprint
        // would end at 9
        assert_eq!(
            find_slot(&inventory, "GPU-A", "2g.12gb", PlacementPolicy::FirstFit),
            NO_FIT
        );
    }
}
