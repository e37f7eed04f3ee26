//! Vendor GPU library boundary
//!
//! Everything that talks to the MIG hardware goes through [`MigGpuDriver`],
//! a synchronous trait mirroring the vendor management library's call shape:
//! device enumeration, GPU-instance (GI) and compute-instance (CI) lifecycle,
//! and MIG child discovery. Driver calls may block for milliseconds to
//! seconds, so callers run them on a blocking worker and never from a watch
//! handler directly.
//!
//! [`sim::SimulatedGpu`] provides deterministic fake hardware for
//! development and tests; production wires in a driver backed by the real
//! vendor library.

pub mod sim;

use thiserror::Error;

/// Errors surfaced by the vendor GPU library
#[derive(Debug, Error)]
pub enum GpuError {
    /// The library could not be initialized on this host
    #[error("driver init failed: {0}")]
    Init(String),

    /// A GPU, GI, or CI handle could not be resolved
    #[error("device not found: {0}")]
    NotFound(String),

    /// The operation is not supported on this hardware
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Any other non-success code from the vendor library
    #[error("vendor call failed: {0}")]
    Vendor(String),
}

/// A physical GPU as enumerated by the driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuDevice {
    /// Vendor device UUID
    pub uuid: String,
    /// Marketing model string, e.g. "NVIDIA A100-PCIE-40GB"
    pub model: String,
    /// Total device memory in bytes
    pub memory_bytes: u64,
}

/// A `(start, size)` slot window passed to GI creation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlicePlacement {
    /// First slot of the window
    pub start: u32,
    /// Number of contiguous slots
    pub size: u32,
}

impl SlicePlacement {
    /// True when two windows share at least one slot
    pub fn overlaps(&self, other: &SlicePlacement) -> bool {
        self.start < other.start + other.size && other.start < self.start + self.size
    }
}

/// A GI profile supported by a GPU, as reported during discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredProfile {
    /// Vendor GPU-instance profile identifier
    pub gi_profile_id: i32,
    /// Vendor compute-instance profile identifier
    pub ci_profile_id: i32,
    /// Vendor compute-instance engine profile identifier
    pub ci_eng_profile_id: i32,
    /// Compute slices granted by the GI profile
    pub gi_slice_count: u32,
    /// Compute slices granted by the CI profile
    pub ci_slice_count: u32,
    /// Memory footprint of the profile in MiB
    pub memory_mb: u64,
    /// True when the profile carries the media-extensions attribute
    pub media_extensions: bool,
    /// Legal slot windows for this profile
    pub placements: Vec<SlicePlacement>,
}

/// A realized MIG device nested under a parent GPU
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigChild {
    /// UUID of the MIG device
    pub mig_uuid: String,
    /// Profile string as the vendor library renders it, e.g. "1g.5gb"
    pub profile_name: String,
    /// Handle of the backing GPU instance
    pub gi_id: u32,
    /// Handle of the compute instance nested in the GI
    pub ci_id: u32,
    /// Slot window the slice occupies
    pub placement: SlicePlacement,
}

/// Synchronous interface to the MIG portions of the vendor GPU library.
///
/// All methods may block; run them via `spawn_blocking`. Implementations
/// must report "already gone" as success from the destroy methods so that a
/// partial teardown retried by the next reconciliation converges.
#[cfg_attr(test, mockall::automock)]
pub trait MigGpuDriver: Send + Sync {
    /// Enumerate the physical GPUs on this host
    fn devices(&self) -> Result<Vec<GpuDevice>, GpuError>;

    /// Enumerate the GI profiles a GPU supports, with their placements
    fn supported_profiles(&self, gpu_uuid: &str) -> Result<Vec<DiscoveredProfile>, GpuError>;

    /// Create a GPU instance at an explicit placement; returns the GI handle
    fn create_gpu_instance(
        &self,
        gpu_uuid: &str,
        gi_profile_id: i32,
        placement: SlicePlacement,
    ) -> Result<u32, GpuError>;

    /// Create a compute instance inside a GI; returns the CI handle
    fn create_compute_instance(
        &self,
        gpu_uuid: &str,
        gi_id: u32,
        ci_profile_id: i32,
        ci_eng_profile_id: i32,
    ) -> Result<u32, GpuError>;

    /// Enumerate realized MIG devices nested under a parent GPU
    fn mig_children(&self, gpu_uuid: &str) -> Result<Vec<MigChild>, GpuError>;

    /// Destroy a compute instance. Destruction order is CI before GI.
    fn destroy_compute_instance(
        &self,
        gpu_uuid: &str,
        gi_id: u32,
        ci_id: u32,
    ) -> Result<(), GpuError>;

    /// Destroy a GPU instance once its CI is gone
    fn destroy_gpu_instance(&self, gpu_uuid: &str, gi_id: u32) -> Result<(), GpuError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_overlap() {
        let a = SlicePlacement { start: 0, size: 4 };
        let b = SlicePlacement { start: 4, size: 4 };
        let c = SlicePlacement { start: 2, size: 4 };

        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
        assert!(a.overlaps(&a));
    }
}
