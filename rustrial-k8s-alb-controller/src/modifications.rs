use crate::{MANAGER, errors::ControllerError};
use json_patch::diff;
use kube::ResourceExt;
use kube::api::PostParams;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use rustrial_k8s_alb_controller_apis::LoadBalancerConfig;
use std::ops::DerefMut;

/// Helper construct to simplify updating and patching [`LoadBalancerConfig`] objects.
pub(crate) struct LoadBalancerConfigModifications {
    original: LoadBalancerConfig,
    pub modified: LoadBalancerConfig,
}

impl std::ops::Deref for LoadBalancerConfigModifications {
    type Target = LoadBalancerConfig;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for LoadBalancerConfigModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl LoadBalancerConfigModifications {
    pub(crate) fn new(original: LoadBalancerConfig) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    fn api(&self, client: Client) -> Api<LoadBalancerConfig> {
        if let Some(ns) = self.original.namespace() {
            Api::<LoadBalancerConfig>::namespaced(client, ns.as_str())
        } else {
            Api::<LoadBalancerConfig>::all(client)
        }
    }

    async fn latest(&self, client: &Client) -> Result<LoadBalancerConfig, ControllerError> {
        let api = self.api(client.clone());
        let name = self.modified.name_any();
        Ok(api.get_status(name.as_str()).await?)
    }

    fn status_has_changed(&self) -> Result<bool, ControllerError> {
        Ok(self.get_status_patch(&self.original)?.is_some())
    }

    fn spec_has_changed(&self) -> Result<bool, ControllerError> {
        Ok(self.get_spec_patch(&self.original)?.is_some())
    }

    /// Write the modified status, a no-op if it did not change.
    pub(crate) async fn replace_status(&mut self, client: Client) -> Result<(), ControllerError> {
        if self.status_has_changed()? {
            let latest = self.latest(&client).await?;
            Ok(self._replace_status(client, &latest).await?)
        } else {
            Ok(())
        }
    }

    async fn _replace_status(
        &mut self,
        client: Client,
        latest: &LoadBalancerConfig,
    ) -> kube::Result<()> {
        let api = self.api(client);
        let name = self.modified.name_any();
        self.modified.metadata.resource_version = latest.metadata.resource_version.clone();
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        let status = api
            .replace_status(
                name.as_str(),
                &pp,
                serde_json::to_vec(&self.modified).map_err(|e| kube::Error::SerdeError(e))?,
            )
            .await?;
        // keep local finalizer changes which have not been patched yet
        self.modified.metadata.resource_version = status.metadata.resource_version.clone();
        self.modified.status = status.status.clone();
        self.original.metadata.resource_version = status.metadata.resource_version;
        self.original.status = status.status;
        Ok(())
    }

    /// Patch metadata and spec changes (e.g. finalizers), a no-op if nothing changed.
    pub(crate) async fn patch_spec(&mut self, client: Client) -> Result<(), ControllerError> {
        if self.spec_has_changed()? {
            Ok(self._patch_spec(client).await?)
        } else {
            Ok(())
        }
    }

    fn get_spec_patch(
        &self,
        latest: &LoadBalancerConfig,
    ) -> Result<Option<json_patch::Patch>, ControllerError> {
        let mut latest = latest.clone();
        let mut mspec = self.modified.clone();
        latest.status = None;
        mspec.status = None;
        // the server owns these, they must not be part of the patch
        mspec.metadata.resource_version = latest.metadata.resource_version.clone();
        mspec.metadata.managed_fields = latest.metadata.managed_fields.clone();
        let patch = diff(
            &serde_json::to_value(&latest)?,
            &serde_json::to_value(&mspec)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    fn get_status_patch(
        &self,
        latest: &LoadBalancerConfig,
    ) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&latest.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    async fn _patch_spec(&mut self, client: Client) -> Result<(), ControllerError> {
        let name = self.modified.name_any();
        let api = self.api(client);
        let latest = api.get(name.as_str()).await?;
        if let Some(patch) = self.get_spec_patch(&latest)? {
            let patch_txt = serde_json::to_string(&patch)?;
            let response = api
                .patch(
                    name.as_str(),
                    &PatchParams {
                        field_manager: Some(MANAGER.to_string()),
                        dry_run: false,
                        force: false,
                        field_validation: None,
                    },
                    &Patch::<json_patch::Patch>::Json(patch),
                )
                .await;
            debug!(
                "Patch object {} ({:?}) with {} -> {:?}",
                self.original.id(),
                self.original.resource_version(),
                patch_txt,
                response.as_ref().map(|v| v.resource_version())
            );
            let mut new = response?;
            // the patch does not touch the status, keep the local modifications
            let status = self.modified.status.take();
            self.original = new.clone();
            new.status = status;
            self.modified = new;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use rustrial_k8s_alb_controller_apis::{Condition, FINALIZER};

    fn config() -> LoadBalancerConfig {
        LoadBalancerConfig {
            metadata: ObjectMeta {
                name: Some("default".into()),
                namespace: Some("kube-system".into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn detects_status_changes() {
        let mut m = LoadBalancerConfigModifications::new(config());
        assert!(!m.status_has_changed().unwrap());
        assert!(!m.spec_has_changed().unwrap());
        m.update_condition(Condition::new("Ready", Some(true), "Success", "ok".into()));
        assert!(m.status_has_changed().unwrap());
        assert!(!m.spec_has_changed().unwrap());
    }

    #[test]
    fn finalizers_are_spec_changes() {
        let mut m = LoadBalancerConfigModifications::new(config());
        m.finalizers_mut().push(FINALIZER.to_string());
        m.metadata.resource_version = Some("2".into());
        let patch = m.get_spec_patch(&config()).unwrap().unwrap();
        let txt = serde_json::to_string(&patch).unwrap();
        assert!(txt.contains("finalizers"));
        assert!(!txt.contains("resourceVersion"));
    }
}
