use rustrial_k8s_alb_controller_apis::LoadBalancerConfig;

use super::subnets::SubnetResolver;
use crate::{errors::ControllerError, model::LoadBalancer};

const DEFAULT_EDITION: &'static str = "Standard";

/// Desired load balancer of a configuration. Subnets are only resolved for
/// load balancers created by the controller.
pub(crate) async fn build_load_balancer(
    config: &LoadBalancerConfig,
    subnets: &dyn SubnetResolver,
) -> Result<LoadBalancer, ControllerError> {
    let spec = &config.spec.config;
    let reuse_id = spec.id.clone().filter(|id| !id.trim().is_empty());
    let zone_mappings = match &reuse_id {
        Some(_) => vec![],
        None => subnets.resolve(&spec.zone_mappings).await?,
    };
    Ok(LoadBalancer {
        name: config.load_balancer_name(),
        reuse_id,
        force_override: spec.force_override,
        address_type: spec.address_type,
        edition: spec
            .edition
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_EDITION.to_string()),
        zone_mappings,
        deletion_protection: spec.deletion_protection,
        tags: spec.tags.clone(),
    })
}
