//! InstaSlice - Kubernetes operator for MIG GPU slice scheduling
//!
//! InstaSlice partitions NVIDIA MIG-capable GPUs across workloads, giving each
//! workload a hardware-isolated slice of a physical GPU rather than the whole
//! device. Two cooperating processes coordinate through one `Instaslice`
//! inventory object per GPU node:
//!
//! - The cluster controller plans placements for gated pods, releases their
//!   scheduling gates once hardware is ready, and coordinates teardown.
//! - The node agent probes the GPUs at startup and realizes planned slices in
//!   hardware (GPU Instance + Compute Instance), publishing the resulting MIG
//!   UUID to the workload.
//!
//! # Modules
//!
//! - [`crd`] - The Instaslice custom resource (per-node inventory record)
//! - [`placement`] - Slot accounting: where a profile fits on a GPU
//! - [`controller`] - Cluster-scope planner, gate releaser, and teardown
//! - [`engine`] - Node-scope realization engine and inventory probe
//! - [`gpu`] - Vendor GPU library boundary (MIG driver trait + simulator)
//! - [`webhook`] - Mutating pod webhook translating MIG resource limits
//! - [`retry`] - Backoff helper for optimistic-concurrency write loops
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod placement;
pub mod retry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Names below are part of the wire contract with the admission webhook, the
// device plugin, and the container runtime. Changing them breaks rollouts.

/// Scheduling gate held on pods awaiting a MIG slice
pub const SCHEDULING_GATE: &str = "org.instaslice/accelarator";

/// Finalizer held on pods whose slice must be reclaimed before deletion
pub const FINALIZER: &str = "org.instaslice/accelarator";

/// Prefix for the opaque per-workload capacity token on the node status
pub const CAPACITY_PREFIX: &str = "org.instaslice";

/// Node label toggled to force the external device plugin to reload
pub const DEVICE_PLUGIN_CONFIG_LABEL: &str = "nvidia.com/device-plugin.config";

/// Pod annotation correlating a pod with its translated resource claims
pub const CLAIM_ANNOTATION: &str = "instaslice";

/// Default namespace where per-node inventory objects are stored
pub const DEFAULT_INVENTORY_NAMESPACE: &str = "default";

/// Seconds a deleted workload keeps its slice before hardware reclaim begins
pub const DEFAULT_TEARDOWN_GRACE_SECS: u64 = 30;
