//! Mutating pod admission webhook
//!
//! Intercepts pod create/update and translates MIG resource limits of the
//! form `nvidia.com/mig-<profile>` into opaque resource claims: one claim
//! per requested unit, referencing the profile's claim template. The
//! original limit entries are removed so the default scheduler never sees
//! them, and the pod is annotated so the planner can correlate the claims
//! back to the workload.

use axum::{routing::post, Json, Router};
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Container, Pod, PodResourceClaim, ResourceClaim};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error, info};

use crate::{Error, Result, CLAIM_ANNOTATION};

const VENDOR_PREFIX: &str = "nvidia.com/";
const MIG_PREFIX: &str = "nvidia.com/mig-";

/// Most MIG slices a single GPU can host; larger requests are nonsense
const MAX_SLICES_PER_REQUEST: i64 = 7;

/// Webhook router exposing the pod mutation endpoint
pub fn webhook_router() -> Router {
    Router::new().route("/mutate-v1-pod", post(mutate_handler))
}

/// Handle a mutating admission review for pods
pub async fn mutate_handler(
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_pod(&req);
    Json(response.into_review())
}

fn mutate_pod(request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let Some(pod) = request.object.as_ref() else {
        debug!("no pod in admission request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let ops = match translate_mig_limits(pod) {
        Ok(ops) => ops,
        Err(e) => {
            info!(error = %e, "rejecting pod with invalid MIG request");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    if ops.is_empty() {
        return AdmissionResponse::from(request);
    }

    info!(
        pod = ?pod.metadata.name,
        patch_ops = ops.len(),
        "translating MIG limits into resource claims"
    );
    match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Build the JSON-Patch that rewrites MIG limits into resource claims.
///
/// Returns an empty list when the pod requests no MIG resources.
fn translate_mig_limits(pod: &Pod) -> Result<Vec<PatchOperation>> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(vec![]);
    };

    let mut containers: Vec<Container> = spec.containers.clone();
    let mut pod_claims: Vec<PodResourceClaim> =
        spec.resource_claims.clone().unwrap_or_default();
    let mut translated = false;

    for container in &mut containers {
        let Some(resources) = container.resources.as_mut() else {
            continue;
        };
        let Some(limits) = resources.limits.as_mut() else {
            continue;
        };

        let mig_keys: Vec<String> = limits
            .keys()
            .filter(|key| key.starts_with(MIG_PREFIX))
            .cloned()
            .collect();

        for key in mig_keys {
            let quantity = limits.get(&key).map(|q| q.0.clone()).unwrap_or_default();
            let count: i64 = quantity.parse().map_err(|_| {
                Error::invalid_request(format!(
                    "quantity {quantity:?} for resource {key} must be an integer"
                ))
            })?;
            if !(1..=MAX_SLICES_PER_REQUEST).contains(&count) {
                return Err(Error::invalid_request(format!(
                    "quantity for resource {key} must be between 1 and {MAX_SLICES_PER_REQUEST}"
                )));
            }

            // claim template is named after the profile, e.g. "mig-1g.5gb"
            let template = key[VENDOR_PREFIX.len()..].to_string();
            let claims = resources.claims.get_or_insert_with(Vec::new);
            for _ in 0..count {
                let claim_name = uuid::Uuid::new_v4().to_string();
                claims.push(ResourceClaim {
                    name: claim_name.clone(),
                    request: None,
                });
                pod_claims.push(PodResourceClaim {
                    name: claim_name,
                    resource_claim_name: None,
                    resource_claim_template_name: Some(template.clone()),
                });
            }

            limits.remove(&key);
            if let Some(requests) = resources.requests.as_mut() {
                requests.remove(&key);
            }
            translated = true;
        }
    }

    if !translated {
        return Ok(vec![]);
    }

    let mut annotations = pod.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(
        CLAIM_ANNOTATION.to_string(),
        pod.metadata
            .uid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );

    let ops = vec![
        PatchOperation::Replace(ReplaceOperation {
            path: PointerBuf::from_tokens(["spec", "containers"]),
            value: serde_json::to_value(&containers)
                .map_err(|e| Error::serialization(e.to_string()))?,
        }),
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "resourceClaims"]),
            value: serde_json::to_value(&pod_claims)
                .map_err(|e| Error::serialization(e.to_string()))?,
        }),
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::to_value(&annotations)
                .map_err(|e| Error::serialization(e.to_string()))?,
        }),
    ];
    Ok(ops)
}
