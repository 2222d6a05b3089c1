//! Convergence of a desired [`Stack`] against the observed cloud state.
//!
//! One applier per resource kind. Appliers run in a fixed order (certificates,
//! server groups, load balancer, listeners, ACLs, listener rules) and their
//! `post_apply` step runs in reverse order once every `apply` succeeded, so
//! resources are only deleted after nothing desired refers to them anymore.

mod acls;
mod certificates;
mod listener_rules;
mod listeners;
mod load_balancer;
pub(crate) mod parallel;
mod server_groups;

use async_trait::async_trait;
use log::{debug, info};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    cloud::{CloudProvider, job::JobExecutor},
    errors::ControllerError,
    model::{LoadBalancer, ResourceKind, Stack},
    tracking::TrackingProvider,
};

pub(crate) use self::{
    acls::AclApplier, certificates::CertificateApplier, listener_rules::ListenerRuleApplier,
    listeners::ListenerApplier, load_balancer::LoadBalancerApplier,
    server_groups::ServerGroupApplier,
};

#[derive(Clone, Debug)]
pub(crate) struct ApplySettings {
    /// Maximum number of concurrent cloud calls per applier batch.
    pub concurrency: usize,
    /// Upper bound of the random delay before each cloud call.
    pub jitter: Duration,
    pub lb_poll_interval: Duration,
    pub lb_max_polls: u32,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            jitter: Duration::from_millis(200),
            lb_poll_interval: Duration::from_secs(2),
            lb_max_polls: 60,
        }
    }
}

/// Collaborators shared by all appliers of one apply pass.
pub(crate) struct ApplyContext<'a> {
    pub cloud: &'a dyn CloudProvider,
    pub jobs: &'a JobExecutor,
    pub tracking: &'a TrackingProvider,
    pub settings: &'a ApplySettings,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
pub(crate) trait ResourceApplier: Send {
    fn kind(&self) -> ResourceKind;

    /// Create and update desired resources, record stale ones.
    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError>;

    /// Remove what `apply` found to be stale.
    async fn post_apply(
        &mut self,
        _ctx: &ApplyContext<'_>,
        _stack: &Stack,
    ) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Whether the applied state is expected to change without a change of
    /// the desired state (e.g. endpoints becoming ready).
    fn needs_requeue(&self) -> bool {
        false
    }
}

/// A stack without load balancer describes a configuration which is being
/// deleted. Listeners and rules are then handled by the load balancer applier.
pub(crate) fn is_deletion(stack: &Stack) -> bool {
    stack.list::<LoadBalancer>().is_empty()
}

fn appliers(deletion: bool) -> Vec<Box<dyn ResourceApplier>> {
    if deletion {
        vec![
            Box::new(CertificateApplier::default()),
            Box::new(ServerGroupApplier::default()),
            Box::new(LoadBalancerApplier::default()),
            Box::new(AclApplier::default()),
        ]
    } else {
        vec![
            Box::new(CertificateApplier::default()),
            Box::new(ServerGroupApplier::default()),
            Box::new(LoadBalancerApplier::default()),
            Box::new(ListenerApplier::default()),
            Box::new(AclApplier::default()),
            Box::new(ListenerRuleApplier::default()),
        ]
    }
}

/// Apply `stack`, fails with [`ControllerError::RetryPotentialReadyEndpoints`]
/// if everything was applied but some backends are not ready yet.
pub(crate) async fn deploy(ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
    let deletion = is_deletion(stack);
    if deletion {
        info!("releasing cloud resources of {}", stack.id());
    }
    let mut appliers = appliers(deletion);
    for applier in appliers.iter_mut() {
        debug!("applying {:?} resources of {}", applier.kind(), stack.id());
        applier.apply(ctx, stack).await?;
    }
    for applier in appliers.iter_mut().rev() {
        applier.post_apply(ctx, stack).await?;
    }
    if appliers.iter().any(|a| a.needs_requeue()) {
        return Err(ControllerError::RetryPotentialReadyEndpoints);
    }
    Ok(())
}
