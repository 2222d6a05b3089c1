use std::collections::BTreeMap;

use async_trait::async_trait;
use log::info;

use super::{ApplyContext, ResourceApplier, parallel::for_each_bounded};
use crate::{
    cloud::{CertificateUpload, CloudError, SdkCertificate, retry::{classify, retry, retry_call}},
    errors::ControllerError,
    model::{Certificate, CertificateStatus, ResourceKind, Stack},
};

/// Uploads certificates of TLS Secrets. Certificate names are unique per
/// Secret revision, so uploaded certificates are never updated, a changed
/// Secret results in a new upload and the old one is deleted once no
/// listener refers to it anymore.
#[derive(Default)]
pub(crate) struct CertificateApplier {
    stale: Vec<SdkCertificate>,
}

#[async_trait]
impl ResourceApplier for CertificateApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Certificate
    }

    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let mut observed: BTreeMap<String, SdkCertificate> = BTreeMap::new();
        for cert in retry_call("list certificates", || cloud.list_certificates()).await? {
            if !ctx.tracking.is_owned(stack.id(), &cert.tags) {
                continue;
            }
            if observed.contains_key(&cert.name) {
                self.stale.push(cert);
            } else {
                observed.insert(cert.name.clone(), cert);
            }
        }
        let mut uploads = Vec::new();
        for (r, cert) in stack.list::<Certificate>() {
            match observed.remove(&cert.name) {
                Some(o) => stack.set_status(&r, CertificateStatus { id: o.id })?,
                None => uploads.push((r, cert)),
            }
        }
        self.stale.extend(observed.into_values());
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            uploads,
            |(r, cert)| async move {
                let req = CertificateUpload {
                    name: cert.name.clone(),
                    certificate_pem: cert.certificate_pem.clone(),
                    private_key_pem: cert.private_key_pem.clone(),
                    tags: ctx.tracking.resource_tags(stack.id(), r.key(), &cert.tags),
                };
                let id = retry_call("upload certificate", || cloud.upload_certificate(&req)).await?;
                info!(
                    "uploaded certificate {} ({}) of secret {}/{}",
                    id, cert.name, cert.namespace, cert.secret_name
                );
                stack.set_status(&r, CertificateStatus { id })
            },
        )
        .await
    }

    async fn post_apply(&mut self, ctx: &ApplyContext<'_>, _stack: &Stack) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let stale = std::mem::take(&mut self.stale);
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            stale,
            |cert| async move {
                let id = cert.id.as_str();
                retry("delete certificate", move || async move {
                    match cloud.delete_certificate(id).await {
                        Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
                        Err(e) => Err(classify("delete certificate", e)),
                    }
                })
                .await?;
                info!("deleted certificate {} ({})", id, cert.name);
                Ok(())
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::{Fixture, stack_id};
    use k8s_openapi::chrono::{Duration, Utc};

    fn stack(revision: &str) -> (Stack, crate::model::ResourceRef<Certificate>) {
        let mut stack = Stack::new(stack_id());
        let r = stack
            .add(
                "default/web-tls",
                Certificate {
                    namespace: "default".into(),
                    secret_name: "web-tls".into(),
                    name: format!("default-web-tls-{}", revision),
                    hosts: vec!["web.example.com".into()],
                    certificate_pem: "cert".into(),
                    private_key_pem: "key".into(),
                    tags: Default::default(),
                },
            )
            .unwrap();
        (stack, r)
    }

    async fn apply(f: &Fixture, stack: &Stack) {
        let mut applier = CertificateApplier::default();
        applier.apply(&f.ctx(), stack).await.unwrap();
        applier.post_apply(&f.ctx(), stack).await.unwrap();
    }

    #[tokio::test]
    async fn new_secret_revision_replaces_the_upload() {
        let f = Fixture::new();
        // certificates of other owners are never touched
        f.cloud.insert_certificate(SdkCertificate {
            id: "cert-console".into(),
            name: "default-web-tls-1".into(),
            domains: vec!["web.example.com".into()],
            expires_at: Utc::now() + Duration::days(30),
            tags: Default::default(),
        });
        let (s, r) = stack("1");
        apply(&f, &s).await;
        let first = s.status(&r).unwrap().id.clone();
        assert_ne!("cert-console", first);
        assert_eq!(2, f.cloud.certificates().len());

        let (s, r) = stack("1");
        let mutations = f.cloud.mutations();
        apply(&f, &s).await;
        assert_eq!(first, s.status(&r).unwrap().id);
        assert_eq!(mutations, f.cloud.mutations());

        let (s, r) = stack("2");
        apply(&f, &s).await;
        let second = s.status(&r).unwrap().id.clone();
        let ids: Vec<String> = f.cloud.certificates().into_iter().map(|c| c.id).collect();
        assert!(ids.contains(&second));
        assert!(ids.contains(&"cert-console".to_string()));
        assert!(!ids.contains(&first));
    }
}
