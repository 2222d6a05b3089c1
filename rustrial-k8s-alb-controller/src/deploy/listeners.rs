use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, info};
use rustrial_k8s_alb_controller_apis::ListenerProtocol;

use super::{ApplyContext, ResourceApplier, parallel::for_each_bounded};
use crate::{
    cloud::{
        CloudError, ListenerRequest, SdkListener, SdkListenerCertificate, TaggableResource,
        has_tags, retry::{classify, retry, retry_call},
    },
    errors::ControllerError,
    model::{Listener, ListenerStatus, LoadBalancer, ResourceKind, ResourceRef, Stack},
};

/// Converges the listeners of the applied load balancer. Listeners blocking
/// the port of a new listener are deleted right away, other stale ones in
/// `post_apply`.
#[derive(Default)]
pub(crate) struct ListenerApplier {
    stale: Vec<SdkListener>,
}

/// ID and reuse mode of the applied load balancer.
pub(super) fn applied_load_balancer(stack: &Stack) -> Result<(String, bool), ControllerError> {
    let (r, lb) = stack
        .list::<LoadBalancer>()
        .into_iter()
        .next()
        .ok_or_else(|| ControllerError::UnknownResource(format!("load balancer of {}", stack.id())))?;
    let id = stack.resolve(&r.token())?;
    Ok((id, lb.is_common_reuse()))
}

fn request(
    ctx: &ApplyContext<'_>,
    stack: &Stack,
    r: &ResourceRef<Listener>,
    listener: &Listener,
) -> Result<ListenerRequest, ControllerError> {
    let certificates = listener
        .certificates
        .iter()
        .map(|c| {
            Ok(SdkListenerCertificate {
                id: stack.resolve(&c.certificate)?,
                is_default: c.is_default,
            })
        })
        .collect::<Result<Vec<_>, ControllerError>>()?;
    Ok(ListenerRequest {
        port: listener.port,
        protocol: listener.protocol,
        description: listener.description.clone(),
        idle_timeout: listener.idle_timeout,
        request_timeout: listener.request_timeout,
        certificates,
        tags: ctx.tracking.resource_tags(stack.id(), r.key(), &BTreeMap::new()),
    })
}

fn needs_update(observed: &SdkListener, desired: &ListenerRequest) -> bool {
    observed.description != desired.description
        || observed.idle_timeout != desired.idle_timeout
        || observed.request_timeout != desired.request_timeout
        || observed.certificates != desired.certificates
}

async fn delete_listeners(ctx: &ApplyContext<'_>, listeners: Vec<SdkListener>) -> Result<(), ControllerError> {
    let cloud = ctx.cloud;
    for_each_bounded(
        ctx.settings.concurrency,
        ctx.settings.jitter,
        listeners,
        |listener| async move {
            let id = listener.id.as_str();
            retry("delete listener", move || async move {
                match cloud.delete_listener(id).await {
                    Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
                    Err(e) => Err(classify("delete listener", e)),
                }
            })
            .await?;
            info!("deleted listener {} ({}/{})", id, listener.port, listener.protocol);
            Ok(())
        },
    )
    .await
}

#[async_trait]
impl ResourceApplier for ListenerApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Listener
    }

    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        let (lb_id, common_reuse) = applied_load_balancer(stack)?;
        let cloud = ctx.cloud;
        let mut observed: BTreeMap<(ListenerProtocol, u16), SdkListener> =
            retry_call("list listeners", || cloud.list_listeners(&lb_id))
                .await?
                .into_iter()
            // on a shared load balancer only listeners created by us are touched
            .filter(|l| is_managed(ctx, stack, common_reuse, l))
            .map(|l| ((l.protocol, l.port), l))
            .collect();
        let mut matched = Vec::new();
        let mut created = Vec::new();
        for (r, listener) in stack.list::<Listener>() {
            let req = request(ctx, stack, &r, listener)?;
            match observed.remove(&(listener.protocol, listener.port)) {
                Some(o) => matched.push((r, o, req)),
                None => created.push((r, req)),
            }
        }
        let (colliding, stale): (Vec<SdkListener>, Vec<SdkListener>) = observed
            .into_values()
            .partition(|o| created.iter().any(|(_, req)| req.port == o.port));
        delete_listeners(ctx, colliding).await?;

        let lb = lb_id.as_str();
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            matched,
            |(r, observed, req)| async move {
                if needs_update(&observed, &req) {
                    info!("updating listener {} ({}/{})", observed.id, req.port, req.protocol);
                    retry_call("update listener", || cloud.update_listener(&observed.id, &req)).await?;
                }
                if !has_tags(&observed.tags, &req.tags) {
                    let ids = [observed.id.clone()];
                    retry_call("tag listener", || {
                        cloud.tag_resources(TaggableResource::Listener, &ids, &req.tags)
                    })
                    .await?;
                }
                stack.set_status(&r, ListenerStatus { id: observed.id })
            },
        )
        .await?;
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            created,
            |(r, req)| async move {
                let id = match retry_call("create listener", || cloud.create_listener(lb, &req)).await {
                    Ok(id) => id,
                    Err(ControllerError::Cloud(CloudError::AlreadyExists(_))) => {
                        return Err(ControllerError::ListenerAlreadyExists {
                            load_balancer: lb.to_string(),
                            port: req.port,
                            protocol: req.protocol.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                };
                info!("created listener {} ({}/{}) on {}", id, req.port, req.protocol, lb);
                stack.set_status(&r, ListenerStatus { id })
            },
        )
        .await?;
        debug!("{} stale listeners on {}", stale.len(), lb);
        self.stale = stale;
        Ok(())
    }

    async fn post_apply(&mut self, ctx: &ApplyContext<'_>, _stack: &Stack) -> Result<(), ControllerError> {
        delete_listeners(ctx, std::mem::take(&mut self.stale)).await
    }
}

/// Whether `listener` is touched by the applier of `stack`.
pub(super) fn is_managed(
    ctx: &ApplyContext<'_>,
    stack: &Stack,
    common_reuse: bool,
    listener: &SdkListener,
) -> bool {
    !common_reuse || ctx.tracking.is_owned(stack.id(), &listener.tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::LOAD_BALANCER_ID,
        cloud::{LoadBalancerState, SdkLoadBalancer},
        deploy::{
            LoadBalancerApplier,
            tests::{Fixture, http_stack, load_balancer, stack_id},
        },
    };
    use rustrial_k8s_alb_controller_apis::AddressType;

    async fn apply(f: &Fixture, stack: &Stack) -> Result<(), ControllerError> {
        LoadBalancerApplier.apply(&f.ctx(), stack).await?;
        let mut listeners = ListenerApplier::default();
        listeners.apply(&f.ctx(), stack).await?;
        listeners.post_apply(&f.ctx(), stack).await
    }

    fn shared_load_balancer() -> SdkLoadBalancer {
        SdkLoadBalancer {
            id: "alb-shared".into(),
            name: "shared".into(),
            dns_name: "shared.example.com".into(),
            state: LoadBalancerState::Active,
            address_type: AddressType::Internet,
            edition: "Standard".into(),
            zone_mappings: vec![],
            deletion_protection: false,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn matched_listeners_are_updated_in_place() {
        let f = Fixture::new();
        apply(&f, &http_stack(load_balancer(), 0)).await.unwrap();
        let before = f.cloud.listeners();
        assert_eq!(1, before.len());
        assert_eq!(Some(15), before[0].idle_timeout);

        let mut changed = Stack::new(stack_id());
        let lb = changed.add(LOAD_BALANCER_ID, load_balancer()).unwrap();
        changed
            .add(
                "80-http",
                Listener {
                    load_balancer: lb.token(),
                    port: 80,
                    protocol: ListenerProtocol::Http,
                    description: Some("web".into()),
                    idle_timeout: Some(30),
                    request_timeout: None,
                    certificates: vec![],
                },
            )
            .unwrap();
        apply(&f, &changed).await.unwrap();
        let after = f.cloud.listeners();
        assert_eq!(1, after.len());
        assert_eq!(before[0].id, after[0].id);
        assert_eq!(Some(30), after[0].idle_timeout);
        assert_eq!(Some("web".to_string()), after[0].description);
    }

    #[tokio::test]
    async fn protocol_change_replaces_the_listener() {
        let f = Fixture::new();
        apply(&f, &http_stack(load_balancer(), 0)).await.unwrap();
        let old = f.cloud.listeners()[0].id.clone();

        let mut stack = Stack::new(stack_id());
        let lb = stack.add(LOAD_BALANCER_ID, load_balancer()).unwrap();
        let r = stack
            .add(
                "80-quic",
                Listener {
                    load_balancer: lb.token(),
                    port: 80,
                    protocol: ListenerProtocol::Quic,
                    description: None,
                    idle_timeout: None,
                    request_timeout: None,
                    certificates: vec![],
                },
            )
            .unwrap();
        apply(&f, &stack).await.unwrap();
        let listeners = f.cloud.listeners();
        assert_eq!(1, listeners.len());
        assert_ne!(old, listeners[0].id);
        assert_eq!(ListenerProtocol::Quic, listeners[0].protocol);
        assert_eq!(listeners[0].id, stack.status(&r).unwrap().id);
    }

    #[tokio::test]
    async fn foreign_listener_on_shared_load_balancer() {
        let f = Fixture::new();
        f.cloud.insert_load_balancer(shared_load_balancer());
        f.cloud.insert_listener(SdkListener {
            id: "lsn-console".into(),
            load_balancer_id: "alb-shared".into(),
            port: 80,
            protocol: ListenerProtocol::Http,
            description: None,
            idle_timeout: None,
            request_timeout: None,
            certificates: vec![],
            acl: None,
            tags: BTreeMap::new(),
        });
        let mut lb = load_balancer();
        lb.reuse_id = Some("alb-shared".into());
        let e = apply(&f, &http_stack(lb, 0)).await.unwrap_err();
        match e {
            ControllerError::ListenerAlreadyExists {
                load_balancer,
                port,
                protocol,
            } => {
                assert_eq!("alb-shared", load_balancer);
                assert_eq!(80, port);
                assert_eq!("HTTP", protocol);
            }
            e => panic!("unexpected error {}", e),
        }
        // the console listener is left alone
        assert_eq!(1, f.cloud.listeners().len());
        assert_eq!("lsn-console", f.cloud.listeners()[0].id);
    }

    #[tokio::test]
    async fn stale_listeners_are_deleted_in_post_apply() {
        let f = Fixture::new();
        apply(&f, &http_stack(load_balancer(), 0)).await.unwrap();
        let old = f.cloud.listeners()[0].id.clone();

        let mut stack = Stack::new(stack_id());
        let lb = stack.add(LOAD_BALANCER_ID, load_balancer()).unwrap();
        stack
            .add(
                "8080-http",
                Listener {
                    load_balancer: lb.token(),
                    port: 8080,
                    protocol: ListenerProtocol::Http,
                    description: None,
                    idle_timeout: None,
                    request_timeout: None,
                    certificates: vec![],
                },
            )
            .unwrap();
        LoadBalancerApplier.apply(&f.ctx(), &stack).await.unwrap();
        let mut applier = ListenerApplier::default();
        applier.apply(&f.ctx(), &stack).await.unwrap();
        let ports: Vec<u16> = f.cloud.listeners().iter().map(|l| l.port).collect();
        assert_eq!(2, ports.len());
        assert!(ports.contains(&80) && ports.contains(&8080));

        applier.post_apply(&f.ctx(), &stack).await.unwrap();
        let listeners = f.cloud.listeners();
        assert_eq!(1, listeners.len());
        assert_eq!(8080, listeners[0].port);
        assert!(listeners.iter().all(|l| l.id != old));
    }
}
