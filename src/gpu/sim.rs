//! Simulated MIG hardware
//!
//! A deterministic in-memory stand-in for the vendor GPU library, shaped
//! like an A100 40GB part. Used by the node agent in development clusters
//! without GPUs and as the hardware fixture in tests. The simulator enforces
//! the same rules real hardware does: explicit placements must not overlap
//! live slices, a CI nests inside a GI, and destroying something already
//! gone succeeds.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    DiscoveredProfile, GpuDevice, GpuError, MigChild, MigGpuDriver, SlicePlacement,
};

const A100_MODEL: &str = "NVIDIA A100-PCIE-40GB";
const A100_MEMORY_BYTES: u64 = 40 * 1024 * 1024 * 1024;

/// Profile table for the simulated part: (gi_profile_id, vendor profile
/// string, slice count, memory MiB, media extensions, placements).
/// Placement windows match what the real part reports.
#[allow(clippy::type_complexity)]
fn a100_profile_table() -> Vec<(i32, &'static str, u32, u64, bool, Vec<(u32, u32)>)> {
    vec![
        (
            0,
            "1g.5gb",
            1,
            4864,
            false,
            vec![(0, 1), (1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 1)],
        ),
        (
            7,
            "1g.5gb+me",
            1,
            4864,
            true,
            vec![(0, 1), (1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 1)],
        ),
        (1, "2g.10gb", 2, 9984, false, vec![(0, 2), (2, 2), (4, 2)]),
        (2, "3g.20gb", 3, 19968, false, vec![(0, 4), (4, 4)]),
        (3, "4g.20gb", 4, 19968, false, vec![(0, 4)]),
        (4, "7g.40gb", 7, 40192, false, vec![(0, 8)]),
    ]
}

#[derive(Clone, Debug)]
struct SimSlice {
    gi_profile_id: i32,
    placement: SlicePlacement,
    mig_uuid: String,
    ci_id: Option<u32>,
}

#[derive(Default)]
struct SimGpuState {
    next_gi_id: u32,
    slices: HashMap<u32, SimSlice>,
}

/// In-memory A100-shaped GPU fleet
pub struct SimulatedGpu {
    devices: Vec<GpuDevice>,
    state: Mutex<HashMap<String, SimGpuState>>,
    uuid_counter: Mutex<u64>,
}

impl SimulatedGpu {
    /// Create a simulator exposing `count` identical A100 GPUs with UUIDs
    /// `GPU-sim-0`, `GPU-sim-1`, ...
    pub fn new(count: usize) -> Self {
        let devices: Vec<GpuDevice> = (0..count)
            .map(|i| GpuDevice {
                uuid: format!("GPU-sim-{i}"),
                model: A100_MODEL.to_string(),
                memory_bytes: A100_MEMORY_BYTES,
            })
            .collect();
        let state = devices
            .iter()
            .map(|d| (d.uuid.clone(), SimGpuState::default()))
            .collect();
        Self {
            devices,
            state: Mutex::new(state),
            uuid_counter: Mutex::new(0),
        }
    }

    /// Pre-create a slice outside the engine's control, as if an operator
    /// had carved the GPU by hand before the agent started. Returns the MIG
    /// UUID of the dangling slice.
    pub fn seed_dangling_slice(
        &self,
        gpu_uuid: &str,
        gi_profile_id: i32,
        placement: SlicePlacement,
    ) -> Result<String, GpuError> {
        let gi_id = self.create_gpu_instance(gpu_uuid, gi_profile_id, placement)?;
        let profile = self.profile_entry(gi_profile_id)?;
        self.create_compute_instance(gpu_uuid, gi_id, profile.0, 0)?;
        let state = self.state.lock().expect("sim state poisoned");
        Ok(state[gpu_uuid].slices[&gi_id].mig_uuid.clone())
    }

    fn profile_entry(
        &self,
        gi_profile_id: i32,
    ) -> Result<(i32, &'static str, u32, u64, bool, Vec<(u32, u32)>), GpuError> {
        a100_profile_table()
            .into_iter()
            .find(|entry| entry.0 == gi_profile_id)
            .ok_or_else(|| {
                GpuError::NotSupported(format!("GI profile {gi_profile_id} on {A100_MODEL}"))
            })
    }

    fn next_mig_uuid(&self) -> String {
        let mut counter = self.uuid_counter.lock().expect("sim counter poisoned");
        *counter += 1;
        format!("MIG-sim-{:08x}", *counter)
    }
}

impl MigGpuDriver for SimulatedGpu {
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError> {
        Ok(self.devices.clone())
    }

    fn supported_profiles(&self, gpu_uuid: &str) -> Result<Vec<DiscoveredProfile>, GpuError> {
        if !self.devices.iter().any(|d| d.uuid == gpu_uuid) {
            return Err(GpuError::NotFound(gpu_uuid.to_string()));
        }
        Ok(a100_profile_table()
            .into_iter()
            .map(
                |(gi_id, _, slices, memory_mb, media_extensions, placements)| DiscoveredProfile {
                    gi_profile_id: gi_id,
                    ci_profile_id: gi_id,
                    ci_eng_profile_id: 0,
                    gi_slice_count: slices,
                    ci_slice_count: slices,
                    memory_mb,
                    media_extensions,
                    placements: placements
                        .into_iter()
                        .map(|(start, size)| SlicePlacement { start, size })
                        .collect(),
                },
            )
            .collect())
    }

    fn create_gpu_instance(
        &self,
        gpu_uuid: &str,
        gi_profile_id: i32,
        placement: SlicePlacement,
    ) -> Result<u32, GpuError> {
        let entry = self.profile_entry(gi_profile_id)?;
        if !entry
            .5
            .iter()
            .any(|&(start, size)| start == placement.start && size == placement.size)
        {
            return Err(GpuError::Vendor(format!(
                "placement ({}, {}) not legal for GI profile {gi_profile_id}",
                placement.start, placement.size
            )));
        }

        let mig_uuid = self.next_mig_uuid();
        let mut state = self.state.lock().expect("sim state poisoned");
        let gpu = state
            .get_mut(gpu_uuid)
            .ok_or_else(|| GpuError::NotFound(gpu_uuid.to_string()))?;

        if gpu
            .slices
            .values()
            .any(|s| s.placement.overlaps(&placement))
        {
            return Err(GpuError::Vendor(format!(
                "placement ({}, {}) overlaps a live slice",
                placement.start, placement.size
            )));
        }

        let gi_id = gpu.next_gi_id;
        gpu.next_gi_id += 1;
        gpu.slices.insert(
            gi_id,
            SimSlice {
                gi_profile_id,
                placement,
                mig_uuid,
                ci_id: None,
            },
        );
        Ok(gi_id)
    }

    fn create_compute_instance(
        &self,
        gpu_uuid: &str,
        gi_id: u32,
        _ci_profile_id: i32,
        _ci_eng_profile_id: i32,
    ) -> Result<u32, GpuError> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let gpu = state
            .get_mut(gpu_uuid)
            .ok_or_else(|| GpuError::NotFound(gpu_uuid.to_string()))?;
        let slice = gpu
            .slices
            .get_mut(&gi_id)
            .ok_or_else(|| GpuError::NotFound(format!("GI {gi_id} on {gpu_uuid}")))?;

        // CI handles are scoped to their GI; one CI per GI in this model
        slice.ci_id = Some(0);
        Ok(0)
    }

    fn mig_children(&self, gpu_uuid: &str) -> Result<Vec<MigChild>, GpuError> {
        let state = self.state.lock().expect("sim state poisoned");
        let gpu = state
            .get(gpu_uuid)
            .ok_or_else(|| GpuError::NotFound(gpu_uuid.to_string()))?;

        let mut children: Vec<MigChild> = gpu
            .slices
            .iter()
            .map(|(&gi_id, slice)| {
                let profile_name = a100_profile_table()
                    .into_iter()
                    .find(|entry| entry.0 == slice.gi_profile_id)
                    .map(|entry| entry.1.to_string())
                    .unwrap_or_default();
                MigChild {
                    mig_uuid: slice.mig_uuid.clone(),
                    profile_name,
                    gi_id,
                    ci_id: slice.ci_id.unwrap_or(0),
                    placement: slice.placement,
                }
            })
            .collect();
        children.sort_by_key(|c| c.placement.start);
        Ok(children)
    }

    fn destroy_compute_instance(
        &self,
        gpu_uuid: &str,
        gi_id: u32,
        _ci_id: u32,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let gpu = state
            .get_mut(gpu_uuid)
            .ok_or_else(|| GpuError::NotFound(gpu_uuid.to_string()))?;
        // already-gone reports success so retried teardowns converge
        if let Some(slice) = gpu.slices.get_mut(&gi_id) {
            slice.ci_id = None;
        }
        Ok(())
    }

    fn destroy_gpu_instance(&self, gpu_uuid: &str, gi_id: u32) -> Result<(), GpuError> {
        let mut state = self.state.lock().expect("sim state poisoned");
        let gpu = state
            .get_mut(gpu_uuid)
            .ok_or_else(|| GpuError::NotFound(gpu_uuid.to_string()))?;
        if let Some(slice) = gpu.slices.get(&gi_id) {
            if slice.ci_id.is_some() {
                return Err(GpuError::Vendor(format!(
                    "GI {gi_id} still has a compute instance"
                )));
            }
            gpu.slices.remove(&gi_id);
        }
        Ok(())
    }
}
