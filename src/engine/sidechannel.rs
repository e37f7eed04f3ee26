//! Per-workload side-channel records
//!
//! The container runtime learns which MIG device a workload may see from a
//! ConfigMap named after the pod, in the pod's namespace, carrying the
//! realized MIG UUID under the vendor visibility keys. The engine publishes
//! the record when the slice is realized and removes it at teardown.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Data key the NVIDIA container runtime reads
pub const NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
/// Data key CUDA applications read
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Publishes and retracts the per-workload device record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SideChannelClient: Send + Sync {
    /// Create the record if absent; an existing record is success
    async fn publish(&self, namespace: &str, pod_name: &str, mig_uuid: &str) -> Result<()>;

    /// Delete the record; a missing record is success
    async fn remove(&self, namespace: &str, pod_name: &str) -> Result<()>;
}

/// Real implementation backed by the ConfigMap API
pub struct ConfigMapSideChannel {
    client: Client,
}

impl ConfigMapSideChannel {
    /// Create a client publishing through the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Build the record payload for a realized MIG device
pub fn device_record(namespace: &str, pod_name: &str, mig_uuid: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            [
                (NVIDIA_VISIBLE_DEVICES.to_string(), mig_uuid.to_string()),
                (CUDA_VISIBLE_DEVICES.to_string(), mig_uuid.to_string()),
            ]
            .into(),
        ),
        ..Default::default()
    }
}

#[async_trait]
impl SideChannelClient for ConfigMapSideChannel {
    async fn publish(&self, namespace: &str, pod_name: &str, mig_uuid: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let record = device_record(namespace, pod_name, mig_uuid);

        match api.create(&PostParams::default(), &record).await {
            Ok(_) => {
                info!(pod = %pod_name, namespace = %namespace, mig_uuid = %mig_uuid,
                    "published device record");
                Ok(())
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    debug!(pod = %pod_name, "device record already published");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn remove(&self, namespace: &str, pod_name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %pod_name, namespace = %namespace, "removed device record");
                Ok(())
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    debug!(pod = %pod_name, "device record already gone");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: The runtime sees the same MIG UUID under both visibility keys
    #[test]
    fn story_record_carries_mig_uuid_under_both_keys() {
        let record = device_record("team-a", "inference-pod", "MIG-abc-123");

        assert_eq!(record.metadata.name.as_deref(), Some("inference-pod"));
        assert_eq!(record.metadata.namespace.as_deref(), Some("team-a"));

        let data = record.data.unwrap();
        assert_eq!(data[NVIDIA_VISIBLE_DEVICES], "MIG-abc-123");
        assert_eq!(data[CUDA_VISIBLE_DEVICES], "MIG-abc-123");
    }
}
