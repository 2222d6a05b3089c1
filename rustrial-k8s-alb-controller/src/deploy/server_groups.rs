use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use log::{debug, info};

use super::{ApplyContext, ResourceApplier, parallel::for_each_bounded};
use crate::{
    cloud::{
        CloudError, SdkServerGroup, ServerGroupRequest, TaggableResource, has_tags,
        job::JobKind, retry::{classify, retry, retry_call},
    },
    errors::ControllerError,
    model::{BackendServer, ResourceKind, ResourceRef, ServerGroup, ServerGroupStatus, Stack},
};

/// Converges server groups and their backend servers.
///
/// Server groups referenced by `reuse_id` are managed in the console, only
/// their servers are synchronized.
#[derive(Default)]
pub(crate) struct ServerGroupApplier {
    stale: Vec<SdkServerGroup>,
    pending: bool,
}

fn needs_update(observed: &SdkServerGroup, desired: &ServerGroupRequest) -> bool {
    observed.name != desired.name
        || observed.protocol != desired.protocol
        || observed.health_check != desired.health_check
}

/// Add missing and remove superfluous servers, each as one asynchronous job.
async fn sync_servers(
    ctx: &ApplyContext<'_>,
    id: &str,
    desired: &[BackendServer],
) -> Result<(), ControllerError> {
    let cloud = ctx.cloud;
    let observed: BTreeSet<BackendServer> = retry_call("list servers", || cloud.list_servers(id))
        .await?
        .into_iter()
        .collect();
    let desired: BTreeSet<BackendServer> = desired.iter().cloned().collect();
    let added: Vec<BackendServer> = desired.difference(&observed).cloned().collect();
    let removed: Vec<BackendServer> = observed.difference(&desired).cloned().collect();
    if !added.is_empty() {
        let list = added.as_slice();
        let job = ctx
            .jobs
            .run(JobKind::AddServers, ctx.cancel, || async move {
                cloud.add_servers(id, list).await
            })
            .await?;
        debug!("adding {} servers to {} (job {})", added.len(), id, job.job_id());
        job.result().await?;
    }
    if !removed.is_empty() {
        let list = removed.as_slice();
        let job = ctx
            .jobs
            .run(JobKind::RemoveServers, ctx.cancel, || async move {
                cloud.remove_servers(id, list).await
            })
            .await?;
        debug!("removing {} servers from {} (job {})", removed.len(), id, job.job_id());
        job.result().await?;
    }
    if !added.is_empty() || !removed.is_empty() {
        info!(
            "synchronized servers of {}: {} added, {} removed",
            id,
            added.len(),
            removed.len()
        );
    }
    Ok(())
}

#[async_trait]
impl ResourceApplier for ServerGroupApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ServerGroup
    }

    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let stack_tags = ctx.tracking.stack_tags(stack.id());
        let mut observed: BTreeMap<String, SdkServerGroup> = BTreeMap::new();
        for sg in retry_call("list server groups", || cloud.list_server_groups(&stack_tags)).await? {
            match ctx.tracking.resource_id(&sg.tags) {
                Some(resource) if !observed.contains_key(resource) => {
                    observed.insert(resource.to_string(), sg);
                }
                _ => self.stale.push(sg),
            }
        }
        let mut desired: Vec<(ResourceRef<ServerGroup>, &ServerGroup, Option<SdkServerGroup>)> =
            Vec::new();
        for (r, sg) in stack.list::<ServerGroup>() {
            if sg.pending_endpoints > 0 {
                self.pending = true;
            }
            let existing = match &sg.reuse_id {
                Some(reuse_id) => Some(
                    retry_call("get server group", || cloud.get_server_group(reuse_id)).await?,
                ),
                None => observed.remove(r.id()),
            };
            desired.push((r, sg, existing));
        }
        self.stale.extend(observed.into_values());
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            desired,
            |(r, sg, existing)| async move {
                let req = ServerGroupRequest {
                    name: sg.name.clone(),
                    protocol: sg.protocol,
                    health_check: sg.health_check.clone(),
                    tags: ctx.tracking.resource_tags(stack.id(), r.key(), &sg.tags),
                };
                let id = match existing {
                    Some(existing) if sg.reuse_id.is_some() => existing.id,
                    Some(existing) => {
                        if needs_update(&existing, &req) {
                            info!("updating server group {} ({})", existing.id, sg.service);
                            retry_call("update server group", || {
                                cloud.update_server_group(&existing.id, &req)
                            })
                            .await?;
                        }
                        if !has_tags(&existing.tags, &req.tags) {
                            let ids = [existing.id.clone()];
                            retry_call("tag server group", || {
                                cloud.tag_resources(TaggableResource::ServerGroup, &ids, &req.tags)
                            })
                            .await?;
                        }
                        existing.id
                    }
                    None => {
                        let id = retry_call("create server group", || cloud.create_server_group(&req))
                            .await?;
                        info!("created server group {} ({})", id, sg.service);
                        id
                    }
                };
                sync_servers(ctx, &id, &sg.servers).await?;
                stack.set_status(&r, ServerGroupStatus { id })
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
            |sg| async move {
                let id = sg.id.as_str();
                retry("delete server group", move || async move {
                    match cloud.delete_server_group(id).await {
                        Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
                        Err(e) => Err(classify("delete server group", e)),
                    }
                })
                .await?;
                info!("deleted server group {} ({})", id, sg.name);
                Ok(())
            },
        )
        .await
    }

    fn needs_requeue(&self) -> bool {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cloud::CloudProvider,
        deploy::tests::{Fixture, server_group, stack_id},
        model::{BackendProtocol, HealthCheck},
    };

    fn stack(sg: ServerGroup) -> (Stack, ResourceRef<ServerGroup>) {
        let mut stack = Stack::new(stack_id());
        let r = stack.add("default/web:80", sg).unwrap();
        (stack, r)
    }

    #[tokio::test]
    async fn servers_follow_endpoints() {
        let f = Fixture::new();
        f.cloud.set_job_polls(1);
        let (s, r) = stack(server_group("web", &["10.0.0.1", "10.0.0.2"], 0));
        let mut applier = ServerGroupApplier::default();
        applier.apply(&f.ctx(), &s).await.unwrap();
        applier.post_apply(&f.ctx(), &s).await.unwrap();
        assert!(!applier.needs_requeue());
        let id = s.status(&r).unwrap().id.clone();
        assert_eq!(2, f.cloud.servers(&id).len());

        let (s, r) = stack(server_group("web", &["10.0.0.2", "10.0.0.3"], 1));
        let mut applier = ServerGroupApplier::default();
        applier.apply(&f.ctx(), &s).await.unwrap();
        applier.post_apply(&f.ctx(), &s).await.unwrap();
        assert!(applier.needs_requeue());
        assert_eq!(id, s.status(&r).unwrap().id);
        let ips: Vec<String> = f.cloud.servers(&id).into_iter().map(|s| s.ip).collect();
        assert_eq!(vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()], ips);
        assert_eq!(1, f.cloud.server_groups().len());
    }

    #[tokio::test]
    async fn reused_server_groups_are_never_deleted() {
        let f = Fixture::new();
        let console = f
            .cloud
            .create_server_group(&ServerGroupRequest {
                name: "console-group".into(),
                protocol: BackendProtocol::Http,
                health_check: HealthCheck::default(),
                tags: BTreeMap::new(),
            })
            .await
            .unwrap();
        let mut sg = server_group("web", &["10.0.0.1"], 0);
        sg.reuse_id = Some(console.clone());
        let (s, r) = stack(sg);
        let mut applier = ServerGroupApplier::default();
        applier.apply(&f.ctx(), &s).await.unwrap();
        applier.post_apply(&f.ctx(), &s).await.unwrap();
        assert_eq!(console, s.status(&r).unwrap().id);
        assert_eq!(1, f.cloud.servers(&console).len());

        let empty = Stack::new(stack_id());
        let mut applier = ServerGroupApplier::default();
        applier.apply(&f.ctx(), &empty).await.unwrap();
        applier.post_apply(&f.ctx(), &empty).await.unwrap();
        let groups = f.cloud.server_groups();
        assert_eq!(1, groups.len());
        assert_eq!("console-group", groups[0].name);
    }
}
