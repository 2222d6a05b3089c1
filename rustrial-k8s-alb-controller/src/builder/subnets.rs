use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use rustrial_k8s_alb_controller_apis::ZoneMapping;

use crate::{
    cloud::{CloudProvider, SdkSubnet, retry::retry_call},
    errors::ControllerError,
    model::ZoneSubnet,
};

/// Resolves the zone mappings of a newly created load balancer.
#[async_trait]
pub(crate) trait SubnetResolver: Send + Sync {
    /// Explicit mappings are completed with their zone, an empty list is
    /// replaced by one subnet per supported zone.
    async fn resolve(&self, mappings: &[ZoneMapping]) -> Result<Vec<ZoneSubnet>, ControllerError>;
}

pub(crate) struct CloudSubnetResolver<'a> {
    cloud: &'a dyn CloudProvider,
    vpc_id: &'a str,
}

impl<'a> CloudSubnetResolver<'a> {
    pub fn new(cloud: &'a dyn CloudProvider, vpc_id: &'a str) -> Self {
        Self { cloud, vpc_id }
    }

    async fn subnets(&self) -> Result<Vec<SdkSubnet>, ControllerError> {
        if self.vpc_id.is_empty() {
            return Err(ControllerError::NoSubnets(
                "VPC_ID must be set to look up subnets".to_string(),
            ));
        }
        let (cloud, vpc_id) = (self.cloud, self.vpc_id);
        retry_call("list subnets", || cloud.list_subnets(vpc_id)).await
    }
}

/// One subnet per zone, the one with the most available addresses.
pub(crate) fn pick_subnets(zones: &[String], subnets: &[SdkSubnet]) -> Vec<ZoneSubnet> {
    let mut best: BTreeMap<&str, &SdkSubnet> = BTreeMap::new();
    for subnet in subnets.iter().filter(|s| zones.contains(&s.zone_id)) {
        let better = match best.get(subnet.zone_id.as_str()) {
            Some(current) => {
                (subnet.available_ips, std::cmp::Reverse(&subnet.id))
                    > (current.available_ips, std::cmp::Reverse(&current.id))
            }
            None => true,
        };
        if better {
            best.insert(subnet.zone_id.as_str(), subnet);
        }
    }
    best.into_iter()
        .map(|(zone, s)| ZoneSubnet {
            zone_id: zone.to_string(),
            subnet_id: s.id.clone(),
        })
        .collect()
}

#[async_trait]
impl SubnetResolver for CloudSubnetResolver<'_> {
    async fn resolve(&self, mappings: &[ZoneMapping]) -> Result<Vec<ZoneSubnet>, ControllerError> {
        if !mappings.is_empty() {
            if mappings.iter().all(|m| m.zone_id.is_some()) {
                return Ok(mappings
                    .iter()
                    .map(|m| ZoneSubnet {
                        zone_id: m.zone_id.clone().unwrap_or_default(),
                        subnet_id: m.subnet_id.clone(),
                    })
                    .collect());
            }
            let subnets = self.subnets().await?;
            return mappings
                .iter()
                .map(|m| {
                    let zone_id = match &m.zone_id {
                        Some(zone) => Some(zone.clone()),
                        None => subnets
                            .iter()
                            .find(|s| s.id == m.subnet_id)
                            .map(|s| s.zone_id.clone()),
                    };
                    zone_id
                        .map(|zone_id| ZoneSubnet {
                            zone_id,
                            subnet_id: m.subnet_id.clone(),
                        })
                        .ok_or_else(|| {
                            ControllerError::NoSubnets(format!(
                                "subnet {} not found in VPC {}",
                                m.subnet_id, self.vpc_id
                            ))
                        })
                })
                .collect();
        }
        let cloud = self.cloud;
        let zones = retry_call("list zones", || cloud.list_zones()).await?;
        let subnets = self.subnets().await?;
        let picked = pick_subnets(&zones, &subnets);
        debug!("auto discovered subnets {:?} in VPC {}", picked, self.vpc_id);
        if picked.is_empty() {
            return Err(ControllerError::NoSubnets(format!(
                "no subnet of VPC {} is located in a supported zone",
                self.vpc_id
            )));
        }
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::InMemoryCloud;

    fn subnet(id: &str, zone: &str, ips: u64) -> SdkSubnet {
        SdkSubnet {
            id: id.into(),
            zone_id: zone.into(),
            available_ips: ips,
        }
    }

    #[test]
    fn one_subnet_per_zone() {
        let zones = vec!["z-a".to_string(), "z-b".to_string()];
        let subnets = vec![
            subnet("s-1", "z-a", 10),
            subnet("s-2", "z-a", 200),
            subnet("s-4", "z-b", 50),
            subnet("s-3", "z-b", 50),
            subnet("s-5", "z-c", 1000),
        ];
        let picked: Vec<(String, String)> = pick_subnets(&zones, &subnets)
            .into_iter()
            .map(|z| (z.zone_id, z.subnet_id))
            .collect();
        assert_eq!(
            vec![
                ("z-a".to_string(), "s-2".to_string()),
                ("z-b".to_string(), "s-3".to_string())
            ],
            picked
        );
    }

    #[tokio::test]
    async fn explicit_mappings_are_completed() {
        let cloud = InMemoryCloud::new();
        cloud.add_subnet("vpc-1", subnet("s-1", "z-a", 10));
        let resolver = CloudSubnetResolver::new(&cloud, "vpc-1");
        let resolved = resolver
            .resolve(&[ZoneMapping {
                subnet_id: "s-1".into(),
                zone_id: None,
            }])
            .await
            .unwrap();
        assert_eq!("z-a", resolved[0].zone_id);
        let e = resolver
            .resolve(&[ZoneMapping {
                subnet_id: "s-9".into(),
                zone_id: None,
            }])
            .await
            .unwrap_err();
        assert!(matches!(e, ControllerError::NoSubnets(_)));
    }

    #[tokio::test]
    async fn auto_discovery_requires_vpc() {
        let cloud = InMemoryCloud::new();
        cloud.add_zone("z-a");
        let e = CloudSubnetResolver::new(&cloud, "").resolve(&[]).await.unwrap_err();
        assert!(matches!(e, ControllerError::NoSubnets(_)));
        cloud.add_subnet("vpc-1", subnet("s-1", "z-a", 10));
        let resolved = CloudSubnetResolver::new(&cloud, "vpc-1").resolve(&[]).await.unwrap();
        assert_eq!("s-1", resolved[0].subnet_id);
    }
}
