//! Custom Resource Definitions for InstaSlice
//!
//! One `Instaslice` object exists per GPU-bearing node. It is both the
//! durable record of that node's GPUs and the coordination protocol between
//! the cluster-scope planner and the node-scope realization engine.

mod inventory;
mod types;

pub use inventory::{Instaslice, InstasliceSpec, InstasliceStatus};
pub use types::{Allocation, AllocationState, MigPlacement, Prepared, ProfileDescriptor};
