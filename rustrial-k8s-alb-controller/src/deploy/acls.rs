use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use log::{debug, info};

use super::{
    ApplyContext, ResourceApplier, is_deletion,
    listeners::{applied_load_balancer, is_managed},
    parallel::for_each_bounded,
};
use crate::{
    cloud::{CloudError, SdkAcl, SdkListener, TaggableResource, has_tags, retry::{classify, retry, retry_call}},
    errors::ControllerError,
    model::{Acl, AclStatus, Listener, ResourceKey, ResourceKind, Stack, Token},
};

/// Converges controller managed ACLs and the ACL associations of listeners.
#[derive(Default)]
pub(crate) struct AclApplier {
    /// Listener ID and the ACL IDs to dissociate from it.
    dissociations: Vec<(String, Vec<String>)>,
    stale: Vec<SdkAcl>,
}

impl AclApplier {
    /// Create or update the managed ACL of `acl`, returns its ID.
    async fn ensure_managed(
        &self,
        ctx: &ApplyContext<'_>,
        stack: &Stack,
        key: &ResourceKey,
        acl: &Acl,
        name: &str,
        observed: Option<SdkAcl>,
    ) -> Result<String, ControllerError> {
        let cloud = ctx.cloud;
        let tags = ctx.tracking.resource_tags(stack.id(), key, &acl.tags);
        let (id, current) = match observed {
            Some(o) => {
                if !has_tags(&o.tags, &tags) {
                    let ids = [o.id.clone()];
                    retry_call("tag acl", || cloud.tag_resources(TaggableResource::Acl, &ids, &tags))
                        .await?;
                }
                (o.id, o.entries)
            }
            None => {
                let id = retry_call("create acl", || cloud.create_acl(name, &tags)).await?;
                info!("created acl {} ({})", id, name);
                (id, vec![])
            }
        };
        let current: BTreeSet<&String> = current.iter().collect();
        let desired: BTreeSet<&String> = acl.entries.iter().collect();
        let added: Vec<String> = desired.difference(&current).map(|e| e.to_string()).collect();
        let removed: Vec<String> = current.difference(&desired).map(|e| e.to_string()).collect();
        if !added.is_empty() {
            retry_call("add acl entries", || cloud.add_acl_entries(&id, &added)).await?;
        }
        if !removed.is_empty() {
            retry_call("remove acl entries", || cloud.remove_acl_entries(&id, &removed)).await?;
        }
        if !added.is_empty() || !removed.is_empty() {
            info!(
                "updated entries of acl {} ({}): {} added, {} removed",
                id,
                name,
                added.len(),
                removed.len()
            );
        }
        Ok(id)
    }

    /// Make the ACL association of `listener` match `acl`.
    async fn associate(
        &mut self,
        ctx: &ApplyContext<'_>,
        listener: &SdkListener,
        acl: &Acl,
        acl_ids: &[String],
    ) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let (observed_type, observed_ids) = match &listener.acl {
            Some(a) => (Some(a.acl_type), a.acl_ids.clone()),
            None => (None, vec![]),
        };
        if observed_type.is_some() && observed_type != Some(acl.acl_type) && !observed_ids.is_empty() {
            // a listener can not have white and black lists at the same time
            info!(
                "switching acl type of listener {} to {:?}",
                listener.id, acl.acl_type
            );
            retry_call("dissociate acls", || cloud.dissociate_acls(&listener.id, &observed_ids)).await?;
            retry_call("associate acls", || {
                cloud.associate_acls(&listener.id, acl.acl_type, acl_ids)
            })
            .await?;
            return Ok(());
        }
        let missing: Vec<String> = acl_ids
            .iter()
            .filter(|id| !observed_ids.contains(id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            info!("associating {:?} with listener {}", missing, listener.id);
            retry_call("associate acls", || {
                cloud.associate_acls(&listener.id, acl.acl_type, &missing)
            })
            .await?;
        }
        let superfluous: Vec<String> = observed_ids
            .into_iter()
            .filter(|id| !acl_ids.contains(id))
            .collect();
        if !superfluous.is_empty() {
            self.dissociations.push((listener.id.clone(), superfluous));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceApplier for AclApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Acl
    }

    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let stack_tags = ctx.tracking.stack_tags(stack.id());
        // managed ACLs by the stack resource they were created for, names need not be unique
        let mut managed: BTreeMap<String, SdkAcl> = BTreeMap::new();
        for acl in retry_call("list acls", || cloud.list_acls(&stack_tags)).await? {
            match ctx.tracking.resource_id(&acl.tags) {
                Some(id) if !managed.contains_key(id) => {
                    managed.insert(id.to_string(), acl);
                }
                _ => self.stale.push(acl),
            }
        }
        if is_deletion(stack) {
            // listeners are gone together with the load balancer
            self.stale.extend(managed.into_values());
            return Ok(());
        }
        let (lb_id, common_reuse) = applied_load_balancer(stack)?;
        let observed_listeners: BTreeMap<String, SdkListener> =
            retry_call("list listeners", || cloud.list_listeners(&lb_id))
                .await?
                .into_iter()
            .map(|l| (l.id.clone(), l))
            .collect();
        let mut with_acl: BTreeSet<Token> = BTreeSet::new();
        for (r, acl) in stack.list::<Acl>() {
            with_acl.insert(acl.listener.clone());
            let listener_id = stack.resolve(&acl.listener)?;
            let mut acl_ids = Vec::new();
            if let Some(name) = &acl.name {
                let observed = match managed.remove(r.id()) {
                    Some(o) if &o.name != name => {
                        self.stale.push(o);
                        None
                    }
                    o => o,
                };
                acl_ids.push(
                    self.ensure_managed(ctx, stack, r.key(), acl, name, observed)
                        .await?,
                );
            }
            acl_ids.extend(acl.acl_ids.iter().cloned());
            match observed_listeners.get(&listener_id) {
                Some(listener) => self.associate(ctx, listener, acl, &acl_ids).await?,
                None => {
                    return Err(ControllerError::UnresolvedReference(format!(
                        "listener {} of acl {}",
                        listener_id,
                        r.id()
                    )));
                }
            }
            stack.set_status(&r, AclStatus { acl_ids })?;
        }
        let mut desired_listeners: BTreeSet<String> = BTreeSet::new();
        for (r, _) in stack.list::<Listener>() {
            let Some(status) = stack.status(&r) else {
                continue;
            };
            desired_listeners.insert(status.id.clone());
            if with_acl.contains(&r.token()) {
                continue;
            }
            if let Some(observed) = observed_listeners.get(&status.id).and_then(|l| l.acl.as_ref()) {
                if !observed.acl_ids.is_empty() {
                    self.dissociations
                        .push((status.id.clone(), observed.acl_ids.clone()));
                }
            }
        }
        // stale listeners are deleted after the ACLs, release their ACLs first
        for listener in observed_listeners.values() {
            if desired_listeners.contains(&listener.id) || !is_managed(ctx, stack, common_reuse, listener) {
                continue;
            }
            if let Some(observed) = listener.acl.as_ref().filter(|a| !a.acl_ids.is_empty()) {
                self.dissociations
                    .push((listener.id.clone(), observed.acl_ids.clone()));
            }
        }
        self.stale.extend(managed.into_values());
        Ok(())
    }

    async fn post_apply(&mut self, ctx: &ApplyContext<'_>, _stack: &Stack) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let dissociations = std::mem::take(&mut self.dissociations);
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            dissociations,
            |(listener, acl_ids)| async move {
                match retry_call("dissociate acls", || cloud.dissociate_acls(&listener, &acl_ids)).await {
                    Ok(()) | Err(ControllerError::Cloud(CloudError::NotFound(_))) => {
                        info!("dissociated {:?} from listener {}", acl_ids, listener);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await?;
        let stale = std::mem::take(&mut self.stale);
        debug!("{} stale acls", stale.len());
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            stale,
            |acl| async move {
                let id = acl.id.as_str();
                retry("delete acl", move || async move {
                    match cloud.delete_acl(id).await {
                        Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
                        Err(e) => Err(classify("delete acl", e)),
                    }
                })
                .await?;
                info!("deleted acl {} ({})", id, acl.name);
                Ok(())
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{
        deploy,
        tests::{Fixture, http_stack, load_balancer},
    };
    use crate::model::{ListenerCertificate, LoadBalancer};
    use rustrial_k8s_alb_controller_apis::{AclType, ListenerProtocol};

    fn with_acl(acl_type: AclType, name: Option<&str>, entries: &[&str], ids: &[&str]) -> Stack {
        let mut stack = http_stack(load_balancer(), 0);
        let (listener, _) = stack.list::<Listener>().into_iter().next().unwrap();
        let r = stack
            .add(
                listener.id(),
                Acl {
                    listener: listener.token(),
                    acl_type,
                    name: name.map(|n| n.to_string()),
                    entries: entries.iter().map(|e| e.to_string()).collect(),
                    acl_ids: ids.iter().map(|e| e.to_string()).collect(),
                    tags: Default::default(),
                },
            )
            .unwrap();
        stack.add_dependency(listener.key(), r.key()).unwrap();
        stack
    }

    #[tokio::test]
    async fn managed_acl_entries_are_synchronized() {
        let f = Fixture::new();
        let stack = with_acl(AclType::White, Some("web-80"), &["10.0.0.0/8", "192.168.0.0/16"], &[]);
        deploy(&f.ctx(), &stack).await.unwrap();
        let acls = f.cloud.acls();
        assert_eq!(1, acls.len());
        assert_eq!(2, acls[0].entries.len());
        let listener = &f.cloud.listeners()[0];
        assert_eq!(Some(vec![acls[0].id.clone()]), listener.acl.as_ref().map(|a| a.acl_ids.clone()));

        let stack = with_acl(AclType::White, Some("web-80"), &["10.0.0.0/8"], &[]);
        deploy(&f.ctx(), &stack).await.unwrap();
        let acls = f.cloud.acls();
        assert_eq!(1, acls.len());
        assert_eq!(vec!["10.0.0.0/8".to_string()], acls[0].entries);
    }

    #[tokio::test]
    async fn acl_type_change_reassociates() {
        let f = Fixture::new();
        deploy(&f.ctx(), &with_acl(AclType::White, Some("web-80"), &["10.0.0.0/8"], &[]))
            .await
            .unwrap();
        let managed = f.cloud.acls()[0].id.clone();
        deploy(&f.ctx(), &with_acl(AclType::Black, None, &[], &["acl-external"]))
            .await
            .unwrap();
        let listener = &f.cloud.listeners()[0];
        let acl = listener.acl.as_ref().unwrap();
        assert_eq!(AclType::Black, acl.acl_type);
        assert_eq!(vec!["acl-external".to_string()], acl.acl_ids);
        // the managed acl is not needed anymore
        assert!(f.cloud.acls().iter().all(|a| a.id != managed));
    }

    #[tokio::test]
    async fn removed_acl_config_dissociates() {
        let f = Fixture::new();
        deploy(&f.ctx(), &with_acl(AclType::White, Some("web-80"), &["10.0.0.0/8"], &[]))
            .await
            .unwrap();
        deploy(&f.ctx(), &http_stack(load_balancer(), 0)).await.unwrap();
        assert!(f.cloud.listeners()[0].acl.is_none());
        assert!(f.cloud.acls().is_empty());
    }

    /// HTTPS and QUIC listeners on port 443, each with a managed ACL named `name`.
    fn shared_port(name: &str) -> Stack {
        let mut stack = http_stack(load_balancer(), 0);
        let lb = stack.list::<LoadBalancer>()[0].0.clone();
        for protocol in [ListenerProtocol::Https, ListenerProtocol::Quic] {
            let id = format!("443-{}", protocol.as_str().to_ascii_lowercase());
            let listener = stack
                .add(
                    id.clone(),
                    Listener {
                        load_balancer: lb.token(),
                        port: 443,
                        protocol,
                        description: None,
                        idle_timeout: None,
                        request_timeout: None,
                        certificates: vec![ListenerCertificate {
                            certificate: "cert-1".into(),
                            is_default: true,
                        }],
                    },
                )
                .unwrap();
            stack.add_dependency(lb.key(), listener.key()).unwrap();
            let acl = stack
                .add(
                    id,
                    Acl {
                        listener: listener.token(),
                        acl_type: AclType::White,
                        name: Some(name.to_string()),
                        entries: vec!["10.0.0.0/8".into()],
                        acl_ids: vec![],
                        tags: Default::default(),
                    },
                )
                .unwrap();
            stack.add_dependency(listener.key(), acl.key()).unwrap();
        }
        stack
    }

    #[tokio::test]
    async fn listeners_sharing_a_port_keep_their_acls() {
        let f = Fixture::new();
        // same name on both, the resource tag tells them apart
        let stack = shared_port("lb-443");
        deploy(&f.ctx(), &stack).await.unwrap();
        let ids = |f: &Fixture| -> Vec<String> { f.cloud.acls().into_iter().map(|a| a.id).collect() };
        let first = ids(&f);
        assert_eq!(2, first.len());
        let mutations = f.cloud.mutations();
        for _ in 0..2 {
            deploy(&f.ctx(), &shared_port("lb-443")).await.unwrap();
            assert_eq!(first, ids(&f));
            assert_eq!(mutations, f.cloud.mutations());
        }
    }

    #[tokio::test]
    async fn acls_of_removed_listeners_are_released() {
        let f = Fixture::new();
        deploy(&f.ctx(), &shared_port("lb-443")).await.unwrap();
        assert_eq!(3, f.cloud.listeners().len());
        deploy(&f.ctx(), &http_stack(load_balancer(), 0)).await.unwrap();
        let listeners = f.cloud.listeners();
        assert_eq!(1, listeners.len());
        assert_eq!(80, listeners[0].port);
        assert!(f.cloud.acls().is_empty());
    }
}
