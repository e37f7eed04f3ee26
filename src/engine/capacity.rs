//! Node capacity tokens and device-plugin reload
//!
//! Once a slice is realized the engine advertises an opaque capacity token
//! `org.instaslice/<pod>` on the node status so the external device plugin
//! can match the workload's resource claim to a device, then toggles the
//! plugin's config label between two sentinel values to make it reload.
//! Both patches are idempotent; teardown runs them in reverse.

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, RemoveOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Result, CAPACITY_PREFIX, DEVICE_PLUGIN_CONFIG_LABEL};

/// Sentinel label values toggled to force a device-plugin reload
const RELOAD_SENTINELS: [&str; 2] = ["update-capacity", "update-capacity-1"];

/// Capacity key advertised for a workload, e.g. `org.instaslice/my-pod`
pub fn capacity_key(pod_name: &str) -> String {
    format!("{CAPACITY_PREFIX}/{pod_name}")
}

/// JSON pointer into the node status for a capacity key (the `/` in the
/// key itself is escaped as `~1` by pointer-token encoding)
fn capacity_path(pod_name: &str) -> PointerBuf {
    PointerBuf::from_tokens(["status", "capacity", capacity_key(pod_name).as_str()])
}

/// Patches the node's capacity and the device-plugin reload label
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeCapacityClient: Send + Sync {
    /// Advertise the capacity token for a workload; a present token is
    /// success
    async fn add_capacity(&self, node: &str, pod_name: &str) -> Result<()>;

    /// Retract the capacity token; an absent token is success
    async fn remove_capacity(&self, node: &str, pod_name: &str) -> Result<()>;

    /// Toggle the device-plugin config label between its sentinel values
    async fn flip_reload_label(&self, node: &str) -> Result<()>;
}

/// Real implementation backed by the Node API
pub struct NodePatcher {
    api: Api<Node>,
}

impl NodePatcher {
    /// Create a patcher over the cluster's nodes
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    async fn has_capacity(&self, node: &str, pod_name: &str) -> Result<bool> {
        let node = self.api.get(node).await?;
        let key = capacity_key(pod_name);
        Ok(node
            .status
            .and_then(|s| s.capacity)
            .is_some_and(|c| c.contains_key(&key)))
    }
}

#[async_trait]
impl NodeCapacityClient for NodePatcher {
    async fn add_capacity(&self, node: &str, pod_name: &str) -> Result<()> {
        if self.has_capacity(node, pod_name).await? {
            debug!(node, pod = %pod_name, "capacity token already advertised");
            return Ok(());
        }

        let patch = json_patch::Patch(vec![PatchOperation::Add(AddOperation {
            path: capacity_path(pod_name),
            value: serde_json::Value::String("1".to_string()),
        })]);
        self.api
            .patch_status(node, &PatchParams::default(), &Patch::<Node>::Json(patch))
            .await?;
        info!(node, pod = %pod_name, "advertised capacity token");
        Ok(())
    }

    async fn remove_capacity(&self, node: &str, pod_name: &str) -> Result<()> {
        if !self.has_capacity(node, pod_name).await? {
            debug!(node, pod = %pod_name, "capacity token already retracted");
            return Ok(());
        }

        let patch = json_patch::Patch(vec![PatchOperation::Remove(RemoveOperation {
            path: capacity_path(pod_name),
        })]);
        self.api
            .patch_status(node, &PatchParams::default(), &Patch::<Node>::Json(patch))
            .await?;
        info!(node, pod = %pod_name, "retracted capacity token");
        Ok(())
    }

    async fn flip_reload_label(&self, node: &str) -> Result<()> {
        let current = self.api.get(node).await?;
        let Some(value) = current
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(DEVICE_PLUGIN_CONFIG_LABEL))
        else {
            // Label is seeded at cluster setup; without it the plugin does
            // not watch for reloads.
            debug!(node, "device-plugin config label not present, skipping reload");
            return Ok(());
        };

        let next = next_sentinel(value);
        let patch = serde_json::json!({
            "metadata": { "labels": { DEVICE_PLUGIN_CONFIG_LABEL: next } }
        });
        self.api
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node, from = %value, to = %next, "flipped device-plugin reload label");
        Ok(())
    }
}

fn next_sentinel(current: &str) -> &'static str {
    if current == RELOAD_SENTINELS[0] {
        RELOAD_SENTINELS[1]
    } else {
        RELOAD_SENTINELS[0]
    }
}
