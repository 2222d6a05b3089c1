use async_trait::async_trait;
use log::{debug, info};
use rustrial_k8s_alb_controller_apis::tags;
use tokio::time::sleep;

use super::{ApplyContext, ResourceApplier, parallel::for_each_bounded};
use crate::{
    cloud::{
        CloudError, LoadBalancerRequest, LoadBalancerState, SdkLoadBalancer, TaggableResource,
        has_tags,
        retry::retry_call,
    },
    errors::ControllerError,
    model::{LoadBalancer, LoadBalancerStatus, ResourceKind, ResourceRef, Stack},
};

const REUSE_OVERRIDE: &'static str = "override";
const REUSE_COMMON: &'static str = "common";

/// Creates, adopts, updates and releases the load balancer of a stack.
#[derive(Default)]
pub(crate) struct LoadBalancerApplier;

fn request(ctx: &ApplyContext<'_>, stack: &Stack, r: &ResourceRef<LoadBalancer>, lb: &LoadBalancer) -> LoadBalancerRequest {
    LoadBalancerRequest {
        name: lb.name.clone(),
        address_type: lb.address_type,
        edition: lb.edition.clone(),
        zone_mappings: lb.zone_mappings.clone(),
        deletion_protection: lb.deletion_protection,
        tags: ctx.tracking.resource_tags(stack.id(), r.key(), &lb.tags),
    }
}

fn needs_update(observed: &SdkLoadBalancer, desired: &LoadBalancerRequest) -> bool {
    observed.name != desired.name
        || observed.deletion_protection != desired.deletion_protection
        || (!desired.zone_mappings.is_empty() && observed.zone_mappings != desired.zone_mappings)
}

/// Tracking tag keys removed from a reused load balancer when it is released.
fn tracking_keys() -> Vec<String> {
    [tags::CLUSTER_ID, tags::CONFIG, tags::RESOURCE, tags::REUSED]
        .iter()
        .map(|k| k.to_string())
        .collect()
}

async fn wait_until_active(
    ctx: &ApplyContext<'_>,
    id: &str,
) -> Result<SdkLoadBalancer, ControllerError> {
    for _ in 0..ctx.settings.lb_max_polls {
        let cloud = ctx.cloud;
        let observed = retry_call("get load balancer", || cloud.get_load_balancer(id)).await?;
        if observed.state == LoadBalancerState::Active {
            return Ok(observed);
        }
        debug!("load balancer {} is {:?}", id, observed.state);
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = sleep(ctx.settings.lb_poll_interval) => (),
        }
    }
    Err(ControllerError::Timeout(format!(
        "load balancer {} to become active",
        id
    )))
}

impl LoadBalancerApplier {
    async fn adopt(
        &self,
        ctx: &ApplyContext<'_>,
        stack: &Stack,
        r: &ResourceRef<LoadBalancer>,
        lb: &LoadBalancer,
        id: &str,
    ) -> Result<String, ControllerError> {
        let cloud = ctx.cloud;
        let observed = retry_call("get load balancer", || cloud.get_load_balancer(id)).await?;
        if let Some(conflict) = ctx.tracking.ownership_conflict(stack.id(), &observed.tags) {
            return Err(ControllerError::OwnershipConflict(format!(
                "load balancer {}: {}",
                id, conflict
            )));
        }
        let mut req = request(ctx, stack, r, lb);
        req.tags.insert(
            tags::REUSED.to_string(),
            if lb.force_override { REUSE_OVERRIDE } else { REUSE_COMMON }.to_string(),
        );
        if !has_tags(&observed.tags, &req.tags) {
            info!("adopting load balancer {} for {}", id, stack.id());
            let ids = [id.to_string()];
            retry_call("tag load balancer", || {
                cloud.tag_resources(TaggableResource::LoadBalancer, &ids, &req.tags)
            })
            .await?;
        }
        if lb.force_override {
            // the name of a reused load balancer is kept
            req.name = observed.name.clone();
            if needs_update(&observed, &req) {
                info!("updating reused load balancer {}", id);
                retry_call("update load balancer", || cloud.update_load_balancer(id, &req)).await?;
            }
        }
        Ok(id.to_string())
    }

    async fn ensure(
        &self,
        ctx: &ApplyContext<'_>,
        stack: &Stack,
        r: &ResourceRef<LoadBalancer>,
        lb: &LoadBalancer,
    ) -> Result<String, ControllerError> {
        let cloud = ctx.cloud;
        let req = request(ctx, stack, r, lb);
        let stack_tags = ctx.tracking.stack_tags(stack.id());
        let observed = retry_call("list load balancers", || cloud.list_load_balancers(&stack_tags)).await?;
        let observed = observed
            .into_iter()
            .filter(|o| !o.tags.contains_key(tags::REUSED))
            .min_by(|a, b| a.id.cmp(&b.id));
        match observed {
            Some(observed) => {
                if needs_update(&observed, &req) {
                    info!("updating load balancer {} of {}", observed.id, stack.id());
                    retry_call("update load balancer", || {
                        cloud.update_load_balancer(&observed.id, &req)
                    })
                    .await?;
                }
                if !has_tags(&observed.tags, &req.tags) {
                    let ids = [observed.id.clone()];
                    retry_call("tag load balancer", || {
                        cloud.tag_resources(TaggableResource::LoadBalancer, &ids, &req.tags)
                    })
                    .await?;
                }
                debug!("load balancer {} of {} is up to date", observed.id, stack.id());
                Ok(observed.id)
            }
            None => {
                let id = retry_call("create load balancer", || cloud.create_load_balancer(&req)).await?;
                info!("created load balancer {} for {}", id, stack.id());
                Ok(id)
            }
        }
    }

    /// Release every load balancer tagged with the stack.
    async fn release(&self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let stack_tags = ctx.tracking.stack_tags(stack.id());
        for observed in retry_call("list load balancers", || cloud.list_load_balancers(&stack_tags)).await? {
            let id = observed.id.as_str();
            match observed.tags.get(tags::REUSED).map(|v| v.as_str()) {
                Some(mode) => {
                    let listeners = retry_call("list listeners", || cloud.list_listeners(id)).await?;
                    let listeners: Vec<String> = listeners
                        .into_iter()
                        .filter(|l| mode == REUSE_OVERRIDE || ctx.tracking.is_owned(stack.id(), &l.tags))
                        .map(|l| l.id)
                        .collect();
                    for_each_bounded(
                        ctx.settings.concurrency,
                        ctx.settings.jitter,
                        listeners,
                        |listener| async move {
                            match retry_call("delete listener", || cloud.delete_listener(&listener)).await {
                                Ok(()) | Err(ControllerError::Cloud(CloudError::NotFound(_))) => {
                                    info!("deleted listener {} of reused load balancer {}", listener, id);
                                    Ok(())
                                }
                                Err(e) => Err(e),
                            }
                        },
                    )
                    .await?;
                    let ids = [id.to_string()];
                    let keys = tracking_keys();
                    retry_call("untag load balancer", || {
                        cloud.untag_resources(TaggableResource::LoadBalancer, &ids, &keys)
                    })
                    .await?;
                    info!("released reused load balancer {} of {}", id, stack.id());
                }
                None => {
                    if observed.deletion_protection {
                        let req = LoadBalancerRequest {
                            name: observed.name.clone(),
                            address_type: observed.address_type,
                            edition: observed.edition.clone(),
                            zone_mappings: observed.zone_mappings.clone(),
                            deletion_protection: false,
                            tags: observed.tags.clone(),
                        };
                        retry_call("update load balancer", || cloud.update_load_balancer(id, &req)).await?;
                    }
                    match retry_call("delete load balancer", || cloud.delete_load_balancer(id)).await {
                        Ok(()) | Err(ControllerError::Cloud(CloudError::NotFound(_))) => (),
                        Err(e) => return Err(e),
                    }
                    info!("deleted load balancer {} of {}", id, stack.id());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceApplier for LoadBalancerApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::LoadBalancer
    }

    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        let Some((r, lb)) = stack.list::<LoadBalancer>().into_iter().next() else {
            return self.release(ctx, stack).await;
        };
        let id = match &lb.reuse_id {
            Some(reuse_id) => self.adopt(ctx, stack, &r, lb, reuse_id).await?,
            None => self.ensure(ctx, stack, &r, lb).await?,
        };
        let observed = wait_until_active(ctx, &id).await?;
        stack.set_status(
            &r,
            LoadBalancerStatus {
                id,
                dns_name: observed.dns_name,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::LOAD_BALANCER_ID,
        cloud::SdkListener,
        deploy::tests::{Fixture, load_balancer, stack_id},
    };
    use std::collections::BTreeMap;
    use rustrial_k8s_alb_controller_apis::{AddressType, ListenerProtocol};

    fn existing(id: &str, tags: BTreeMap<String, String>) -> SdkLoadBalancer {
        SdkLoadBalancer {
            id: id.into(),
            name: "console".into(),
            dns_name: format!("{}.example.com", id),
            state: LoadBalancerState::Active,
            address_type: AddressType::Internet,
            edition: "Standard".into(),
            zone_mappings: vec![],
            deletion_protection: true,
            tags,
        }
    }

    fn listener(id: &str, lb: &str, port: u16, tags: BTreeMap<String, String>) -> SdkListener {
        SdkListener {
            id: id.into(),
            load_balancer_id: lb.into(),
            port,
            protocol: ListenerProtocol::Http,
            description: None,
            idle_timeout: None,
            request_timeout: None,
            certificates: vec![],
            acl: None,
            tags,
        }
    }

    fn single(lb: LoadBalancer) -> (Stack, ResourceRef<LoadBalancer>) {
        let mut stack = Stack::new(stack_id());
        let r = stack.add(LOAD_BALANCER_ID, lb).unwrap();
        (stack, r)
    }

    #[tokio::test]
    async fn creates_and_waits_until_active() {
        let f = Fixture::new();
        let (stack, r) = single(load_balancer());
        LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap();
        let status = stack.status(&r).unwrap();
        assert!(status.id.starts_with("alb-"));
        assert_eq!(format!("{}.alb.example.com", status.id), status.dns_name);
        let observed = &f.cloud.load_balancers()[0];
        assert!(f.tracking.is_owned(&stack_id(), &observed.tags));
        assert_eq!(Some("LoadBalancer"), f.tracking.resource_id(&observed.tags));
    }

    #[tokio::test]
    async fn updates_changed_attributes() {
        let f = Fixture::new();
        let (stack, _) = single(load_balancer());
        LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap();
        let mut lb = load_balancer();
        lb.deletion_protection = true;
        let (stack, r) = single(lb);
        LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap();
        assert_eq!(1, f.cloud.load_balancers().len());
        let observed = &f.cloud.load_balancers()[0];
        assert!(observed.deletion_protection);
        assert_eq!(observed.id, stack.status(&r).unwrap().id);
    }

    #[tokio::test]
    async fn foreign_load_balancers_are_not_adopted() {
        let f = Fixture::new();
        let foreign = crate::tracking::TrackingProvider::new("other").stack_tags(&stack_id());
        f.cloud.insert_load_balancer(existing("alb-console", foreign));
        let mut lb = load_balancer();
        lb.reuse_id = Some("alb-console".into());
        let (stack, _) = single(lb);
        let mutations = f.cloud.mutations();
        let e = LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap_err();
        assert!(matches!(e, ControllerError::OwnershipConflict(_)));
        assert_eq!(mutations, f.cloud.mutations());
    }

    #[tokio::test]
    async fn common_reuse_only_releases_own_listeners() {
        let f = Fixture::new();
        f.cloud.insert_load_balancer(existing("alb-console", BTreeMap::new()));
        f.cloud
            .insert_listener(listener("lsn-foreign", "alb-console", 8080, BTreeMap::new()));
        let mut lb = load_balancer();
        lb.reuse_id = Some("alb-console".into());
        let (stack, r) = single(lb);
        LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap();
        assert_eq!("alb-console", stack.status(&r).unwrap().id);
        let observed = &f.cloud.load_balancers()[0];
        assert_eq!("console", observed.name);
        assert_eq!(Some(&REUSE_COMMON.to_string()), observed.tags.get(tags::REUSED));

        let own_tags = f.tracking.stack_tags(&stack_id());
        f.cloud
            .insert_listener(listener("lsn-own", "alb-console", 80, own_tags));
        LoadBalancerApplier
            .apply(&f.ctx(), &Stack::new(stack_id()))
            .await
            .unwrap();
        let ids: Vec<String> = f.cloud.listeners().into_iter().map(|l| l.id).collect();
        assert_eq!(vec!["lsn-foreign".to_string()], ids);
        let observed = &f.cloud.load_balancers()[0];
        assert!(observed.tags.is_empty());
        assert!(observed.deletion_protection);
    }

    #[tokio::test]
    async fn deletion_protection_is_lifted_before_delete() {
        let f = Fixture::new();
        let mut lb = load_balancer();
        lb.deletion_protection = true;
        let (stack, _) = single(lb);
        LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap();
        LoadBalancerApplier
            .apply(&f.ctx(), &Stack::new(stack_id()))
            .await
            .unwrap();
        assert!(f.cloud.load_balancers().is_empty());
    }
}
