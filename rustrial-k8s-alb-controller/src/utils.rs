use json_patch::diff;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(MANAGER.to_string()),
        dry_run: false,
        force: false,
        field_validation: None,
    }
}

/// Apply the finalizer changes of `modified` with a JSON Patch. Server-side
/// apply would take ownership of all fields of objects we do not own.
async fn patch_finalizers<T>(api: &Api<T>, original: &T, modified: &T) -> Result<(), ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    let patch = diff(
        &serde_json::to_value(original)?,
        &serde_json::to_value(modified)?,
    );
    match api
        .patch(
            modified.name_any().as_str(),
            &patch_params(),
            &Patch::<T>::Json(patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e)?,
    }
}

pub(crate) async fn add_finalizer_if_missing<T>(
    api: Api<T>,
    source: &mut T,
    finalizer: &str,
) -> Result<bool, ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    let original = source.clone();
    let finalizers = source.finalizers_mut();
    if finalizers.iter().any(|f| f.as_str() == finalizer) {
        Ok(false)
    } else {
        finalizers.push(finalizer.to_string());
        patch_finalizers(&api, &original, source).await?;
        Ok(true)
    }
}

pub(crate) async fn remove_finalizer<T>(
    api: Api<T>,
    source: &mut T,
    finalizer: &str,
) -> Result<bool, ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    let original = source.clone();
    let finalizers = source.finalizers_mut();
    let len = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    if finalizers.len() != len {
        patch_finalizers(&api, &original, source).await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Hostname published in `status.loadBalancer.ingress[0]`.
pub(crate) fn ingress_hostname(ingress: &Ingress) -> Option<&str> {
    ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|i| i.first())
        .and_then(|i| i.hostname.as_deref())
}

/// Publish `hostname` as load balancer address of `ingress`, returns whether
/// the status had to be changed.
pub(crate) async fn set_ingress_hostname(
    api: Api<Ingress>,
    ingress: &Ingress,
    hostname: &str,
) -> Result<bool, ControllerError> {
    if ingress_hostname(ingress) == Some(hostname) {
        return Ok(false);
    }
    let status = json!({
        "status": {
            "loadBalancer": {
                "ingress": [{ "hostname": hostname }]
            }
        }
    });
    match api
        .patch_status(
            ingress.name_any().as_str(),
            &patch_params(),
            &Patch::Merge(&status),
        )
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e)?,
    }
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("alb_controller_{}", name)
}
