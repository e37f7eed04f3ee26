//! GPU inventory probe
//!
//! Runs once per node-agent lifetime, before the realization engine serves:
//! enumerates the physical GPUs and their supported MIG profiles (with legal
//! placements), scans for pre-existing MIG slices so a restart never
//! double-books occupied slots, and publishes the result as this node's
//! Instaslice object with `ready=true`.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::ObjectMeta;
use tracing::{info, warn};

use crate::crd::{Instaslice, InstasliceSpec, MigPlacement, Prepared, ProfileDescriptor};
use crate::gpu::{DiscoveredProfile, MigGpuDriver};
use crate::{Error, Result};

use super::InventoryStore;

/// Attribute suffix for profiles carrying media extensions
const ATTRIBUTE_MEDIA_EXTENSIONS: &str = "me";

/// Canonical name of a MIG profile, e.g. `1g.5gb`, `4c.7g.40gb`, `1g.5gb+me`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigProfileName {
    /// Compute slice count (from the CI profile)
    pub c: u32,
    /// GPU slice count (from the GI profile)
    pub g: u32,
    /// Memory footprint in GB, rounded the way the vendor tooling rounds
    pub gb: u64,
    /// Attribute suffixes, e.g. `me`
    pub attributes: Vec<&'static str>,
}

impl MigProfileName {
    /// Synthesize the name for a discovered profile on a device with
    /// `total_memory_bytes` of memory
    pub fn new(profile: &DiscoveredProfile, total_memory_bytes: u64) -> Self {
        let mut attributes = Vec::new();
        if profile.media_extensions {
            attributes.push(ATTRIBUTE_MEDIA_EXTENSIONS);
        }
        Self {
            c: profile.ci_slice_count,
            g: profile.gi_slice_count,
            gb: mig_memory_gb(total_memory_bytes, profile.memory_mb),
            attributes,
        }
    }
}

impl std::fmt::Display for MigProfileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let suffix = if self.attributes.is_empty() {
            String::new()
        } else {
            format!("+{}", self.attributes.join(","))
        };
        if self.c == self.g {
            write!(f, "{}g.{}gb{}", self.g, self.gb, suffix)
        } else {
            write!(f, "{}c.{}g.{}gb{}", self.c, self.g, self.gb, suffix)
        }
    }
}

/// Memory footprint of a MIG profile in GB.
///
/// The vendor rounds the slice's fraction of device memory up to an eighth,
/// then applies it to the device's marketing capacity:
/// `round(ceil(mig_mem/total_mem * 8) / 8 * ceil(total_mem/GiB))`.
pub fn mig_memory_gb(total_memory_bytes: u64, mig_memory_mb: u64) -> u64 {
    const FRAC_DENOMINATOR: f64 = 8.0;
    const ONE_MB: u64 = 1024 * 1024;
    const ONE_GB: u64 = 1024 * 1024 * 1024;

    let fraction = (mig_memory_mb * ONE_MB) as f64 / total_memory_bytes as f64;
    let fraction = (fraction * FRAC_DENOMINATOR).ceil() / FRAC_DENOMINATOR;
    let total_gb = total_memory_bytes.div_ceil(ONE_GB) as f64;
    (fraction * total_gb).round() as u64
}

/// Walk the hardware and build the inventory spec for this node.
///
/// Blocking: calls the vendor library. Callers run it on a blocking worker.
pub fn discover_hardware(node_name: &str, driver: &dyn MigGpuDriver) -> Result<InstasliceSpec> {
    let devices = driver.devices()?;
    let mut gpus = BTreeMap::new();
    let mut profiles: Vec<ProfileDescriptor> = Vec::new();
    let mut prepared = BTreeMap::new();

    for device in &devices {
        gpus.insert(device.uuid.clone(), device.model.clone());

        // Profiles are uniform across a node's GPUs; discover them once,
        // from the first device that reports any.
        if profiles.is_empty() {
            for discovered in driver.supported_profiles(&device.uuid)? {
                let name = MigProfileName::new(&discovered, device.memory_bytes);
                profiles.push(ProfileDescriptor {
                    profile_name: name.to_string(),
                    gi_profile_id: discovered.gi_profile_id,
                    ci_profile_id: discovered.ci_profile_id,
                    ci_eng_profile_id: discovered.ci_eng_profile_id,
                    placements: discovered
                        .placements
                        .iter()
                        .map(|p| MigPlacement {
                            start: p.start,
                            size: p.size,
                        })
                        .collect(),
                });
            }
        }

        // Pre-existing slices ("dangling") occupy slots from day one. They
        // carry no workload UID until adopted or reclaimed by an operator.
        for child in driver.mig_children(&device.uuid)? {
            warn!(
                gpu = %device.uuid,
                mig_uuid = %child.mig_uuid,
                profile = %child.profile_name,
                "found pre-existing MIG slice"
            );
            prepared.insert(
                child.mig_uuid.clone(),
                Prepared {
                    mig_uuid: child.mig_uuid.clone(),
                    parent_gpu_uuid: device.uuid.clone(),
                    profile_name: child.profile_name.clone(),
                    slot_start: child.placement.start,
                    slot_size: child.placement.size,
                    workload_uid: String::new(),
                    gi_handle_id: child.gi_id,
                    ci_handle_id: child.ci_id,
                },
            );
        }
    }

    Ok(InstasliceSpec {
        node: node_name.to_string(),
        gpu_count: gpus.len() as u32,
        gpus,
        profiles,
        allocations: BTreeMap::new(),
        prepared,
        ready: false,
    })
}

/// Ensure this node's inventory object exists and is ready.
///
/// An existing ready inventory is reused as-is (restart with state). An
/// absent one is created from hardware discovery with `ready=false`, then
/// flipped to `ready=true` once fully populated, so the planner never sees
/// a half-filled record.
pub async fn ensure_inventory(
    node_name: &str,
    store: &dyn InventoryStore,
    driver: Arc<dyn MigGpuDriver>,
) -> Result<Instaslice> {
    let existing = store.get().await?;
    if let Some(ref inventory) = existing {
        if inventory.spec.ready {
            info!(node = %node_name, "inventory already probed, reusing");
            return Ok(inventory.clone());
        }
    }

    let name = node_name.to_string();
    let spec = tokio::task::spawn_blocking(move || {
        // driver moved onto the blocking worker for the whole probe
        discover_hardware(&name, driver.as_ref())
    })
    .await
    .map_err(|e| Error::hardware(format!("probe worker failed: {e}")))??;

    info!(
        node = %node_name,
        gpus = spec.gpus.len(),
        profiles = spec.profiles.len(),
        dangling = spec.prepared.len(),
        "hardware probe complete"
    );

    // a half-probed object from a crashed run is refilled in place
    let mut created = match existing {
        Some(mut inventory) => {
            inventory.spec = spec;
            store.update(&inventory).await?
        }
        None => {
            store
                .create(&Instaslice {
                    metadata: ObjectMeta {
                        name: Some(node_name.to_string()),
                        ..Default::default()
                    },
                    spec,
                    status: None,
                })
                .await?
        }
    };

    created.spec.ready = true;
    let ready = store.update(&created).await?;
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::sim::SimulatedGpu;
    use crate::gpu::SlicePlacement;

    const GIB: u64 = 1024 * 1024 * 1024;

    // =========================================================================
    // Profile Naming
    // =========================================================================

    fn discovered(c: u32, g: u32, memory_mb: u64, me: bool) -> DiscoveredProfile {
        DiscoveredProfile {
            gi_profile_id: 0,
            ci_profile_id: 0,
            ci_eng_profile_id: 0,
            gi_slice_count: g,
            ci_slice_count: c,
            memory_mb,
            media_extensions: me,
            placements: vec![],
        }
    }

    /// Story: A100 40GB profiles render their marketing names
    #[test]
    fn story_a100_40gb_profile_names() {
        let total = 40 * GIB;
        assert_eq!(
            MigProfileName::new(&discovered(1, 1, 4864, false), total).to_string(),
            "1g.5gb"
        );
        assert_eq!(
            MigProfileName::new(&discovered(2, 2, 9984, false), total).to_string(),
            "2g.10gb"
        );
        assert_eq!(
            MigProfileName::new(&discovered(3, 3, 19968, false), total).to_string(),
            "3g.20gb"
        );
        assert_eq!(
            MigProfileName::new(&discovered(7, 7, 40192, false), total).to_string(),
            "7g.40gb"
        );
    }

    /// Story: Media-extension profiles carry the `+me` suffix
    #[test]
    fn story_media_extensions_suffix() {
        let name = MigProfileName::new(&discovered(1, 1, 4864, true), 40 * GIB);
        assert_eq!(name.to_string(), "1g.5gb+me");
    }

    /// Story: A compute slice narrower than its GI renders the `c.` form
    #[test]
    fn story_unbalanced_compute_slice_name() {
        let name = MigProfileName::new(&discovered(4, 7, 40192, false), 40 * GIB);
        assert_eq!(name.to_string(), "4c.7g.40gb");
    }

    #[test]
    fn test_memory_gb_rounds_to_eighths_of_capacity() {
        let total = 40 * GIB;
        assert_eq!(mig_memory_gb(total, 4864), 5);
        assert_eq!(mig_memory_gb(total, 9984), 10);
        assert_eq!(mig_memory_gb(total, 19968), 20);
        assert_eq!(mig_memory_gb(total, 40192), 40);
    }

    // =========================================================================
    // Hardware Discovery
    // =========================================================================

    /// Story: A clean two-GPU node probes into a ready-to-fill inventory
    #[test]
    fn story_clean_node_discovery() {
        let sim = SimulatedGpu::new(2);
        let spec = discover_hardware("node-1", &sim).unwrap();

        assert_eq!(spec.node, "node-1");
        assert_eq!(spec.gpu_count, 2);
        assert_eq!(spec.gpus.len(), 2);
        assert_eq!(spec.gpus["GPU-sim-0"], "NVIDIA A100-PCIE-40GB");
        assert!(spec.allocations.is_empty());
        assert!(spec.prepared.is_empty());
        assert!(!spec.ready, "probe output is not ready until persisted");

        // synthesized names match what the hardware reports for children
        let names: Vec<&str> = spec
            .profiles
            .iter()
            .map(|p| p.profile_name.as_str())
            .collect();
        assert!(names.contains(&"1g.5gb"));
        assert!(names.contains(&"1g.5gb+me"));
        assert!(names.contains(&"2g.10gb"));
        assert!(names.contains(&"3g.20gb"));
        assert!(names.contains(&"7g.40gb"));

        let one_g = spec.profile("1g.5gb").unwrap();
        assert_eq!(one_g.placements.len(), 7);
        assert_eq!(one_g.slot_size(), Some(1));
    }

    /// Story: Pre-existing slices are accounted for on restart
    ///
    /// A slice carved by hand (or left behind by a crashed agent) shows up
    /// as a Prepared entry with an empty workload UID and its true
    /// placement, so the planner can never double-book those slots.
    #[test]
    fn story_dangling_slices_become_prepared_entries() {
        let sim = SimulatedGpu::new(1);
        let mig_uuid = sim
            .seed_dangling_slice("GPU-sim-0", 2, SlicePlacement { start: 4, size: 4 })
            .unwrap();

        let spec = discover_hardware("node-1", &sim).unwrap();
        assert_eq!(spec.prepared.len(), 1);

        let prepared = &spec.prepared[&mig_uuid];
        assert_eq!(prepared.parent_gpu_uuid, "GPU-sim-0");
        assert_eq!(prepared.profile_name, "3g.20gb");
        assert_eq!(prepared.slot_start, 4);
        assert_eq!(prepared.slot_size, 4);
        assert_eq!(prepared.workload_uid, "");
    }

    // =========================================================================
    // Inventory Publication
    // =========================================================================

    /// Store double that records every write it sees
    struct RecordingStore {
        state: std::sync::Mutex<Option<Instaslice>>,
        writes: std::sync::Mutex<Vec<bool>>, // `ready` flag of each write
    }

    impl RecordingStore {
        fn empty() -> Self {
            Self {
                state: std::sync::Mutex::new(None),
                writes: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl InventoryStore for RecordingStore {
        async fn get(&self) -> crate::Result<Option<Instaslice>> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn create(&self, inventory: &Instaslice) -> crate::Result<Instaslice> {
            self.writes.lock().unwrap().push(inventory.spec.ready);
            *self.state.lock().unwrap() = Some(inventory.clone());
            Ok(inventory.clone())
        }

        async fn update(&self, inventory: &Instaslice) -> crate::Result<Instaslice> {
            self.writes.lock().unwrap().push(inventory.spec.ready);
            *self.state.lock().unwrap() = Some(inventory.clone());
            Ok(inventory.clone())
        }
    }

    /// Story: The inventory is published unready first, then flipped ready
    ///
    /// The planner must never see a half-filled record, so the ready flag
    /// only goes true in a second write over the fully populated object.
    #[tokio::test]
    async fn story_inventory_published_in_two_phases() {
        let store = RecordingStore::empty();
        let driver = Arc::new(SimulatedGpu::new(1));

        let inventory = ensure_inventory("node-1", &store, driver).await.unwrap();
        assert!(inventory.spec.ready);
        assert_eq!(inventory.spec.gpus.len(), 1);

        let writes = store.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![false, true]);
    }

    /// Story: A ready inventory survives an agent restart untouched
    #[tokio::test]
    async fn story_existing_ready_inventory_is_reused() {
        let store = RecordingStore::empty();
        let driver = Arc::new(SimulatedGpu::new(1));
        let first = ensure_inventory("node-1", &store, driver.clone())
            .await
            .unwrap();

        let again = ensure_inventory("node-1", &store, driver).await.unwrap();
        assert_eq!(first, again);
        // no writes beyond the original two
        assert_eq!(store.writes.lock().unwrap().len(), 2);
    }

    /// Story: Probe fidelity - every hardware slice has a matching entry
    #[test]
    fn story_probe_matches_every_hardware_slice() {
        let sim = SimulatedGpu::new(2);
        let seeded = vec![
            sim.seed_dangling_slice("GPU-sim-0", 0, SlicePlacement { start: 0, size: 1 })
                .unwrap(),
            sim.seed_dangling_slice("GPU-sim-0", 1, SlicePlacement { start: 2, size: 2 })
                .unwrap(),
            sim.seed_dangling_slice("GPU-sim-1", 4, SlicePlacement { start: 0, size: 8 })
                .unwrap(),
        ];

        let spec = discover_hardware("node-1", &sim).unwrap();
        assert_eq!(spec.prepared.len(), seeded.len());
        for mig_uuid in seeded {
            let entry = spec.prepared.get(&mig_uuid).expect("entry for seeded slice");
            let children = sim.mig_children(&entry.parent_gpu_uuid).unwrap();
            let child = children
                .iter()
                .find(|c| c.mig_uuid == mig_uuid)
                .expect("child still on GPU");
            assert_eq!(entry.slot_start, child.placement.start);
            assert_eq!(entry.slot_size, child.placement.size);
            assert_eq!(entry.gi_handle_id, child.gi_id);
        }
    }
}
