//! Translation of a `LoadBalancerConfig` and its Ingress group into the
//! desired [`Stack`].
//!
//! The build runs sequentially: listeners have to be known before rules can
//! be attached to them. Failures of individual group members are collected
//! in a per-member error map, the first one also fails the build.

pub(crate) mod acls;
pub(crate) mod certificates;
pub(crate) mod listeners;
pub(crate) mod load_balancer;
pub(crate) mod rules;
pub(crate) mod server_groups;
pub(crate) mod subnets;

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use log::{debug, warn};
use rustrial_k8s_alb_controller_apis::LoadBalancerConfig;

use self::{
    acls::build_acl,
    certificates::{CertDiscovery, secret_certificate},
    listeners::{PlannedListener, merge_listeners},
    load_balancer::build_load_balancer,
    rules::{MemberRules, RuleDraft, WeightedCanary, apply_canaries, member_rules},
    server_groups::build_server_group,
    subnets::SubnetResolver,
};
use crate::{
    errors::ControllerError,
    ingress::{
        backend::BackendLookup,
        group::{Group, Member},
        listen_ports::{PortProtocol, ingress_listen_ports},
    },
    model::{
        Certificate, Listener, ListenerCertificate, ListenerRule, LoadBalancer, ResourceRef,
        ServerGroup, ServiceRef, Stack, StackId, Token,
    },
};

/// Stack ID of the load balancer node, there is exactly one per stack.
pub(crate) const LOAD_BALANCER_ID: &'static str = "LoadBalancer";

pub(crate) fn stack_id(config: &LoadBalancerConfig) -> StackId {
    StackId {
        namespace: config.namespace().unwrap_or_default(),
        name: config.name_any(),
    }
}

/// Stack without load balancer, applying it releases all cloud resources of
/// the configuration.
/// Unique certificates in token order, the default one first. The default is
/// the first one flagged as default, otherwise the first one listed.
fn dedup_certificates(certificates: Vec<ListenerCertificate>) -> Vec<ListenerCertificate> {
    let default = certificates
        .iter()
        .find(|c| c.is_default)
        .or(certificates.first())
        .map(|c| c.certificate.clone());
    let others: BTreeSet<Token> = certificates
        .into_iter()
        .map(|c| c.certificate)
        .filter(|t| Some(t) != default.as_ref())
        .collect();
    default
        .into_iter()
        .map(|certificate| ListenerCertificate {
            certificate,
            is_default: true,
        })
        .chain(others.into_iter().map(|certificate| ListenerCertificate {
            certificate,
            is_default: false,
        }))
        .collect()
}

pub(crate) fn deletion_stack(config: &LoadBalancerConfig) -> Stack {
    Stack::new(stack_id(config))
}

pub(crate) struct BuildOutcome {
    pub stack: Result<Stack, ControllerError>,
    /// Error messages by `namespace/name` of the offending group member.
    pub member_errors: BTreeMap<String, String>,
}

#[derive(Default)]
struct MemberErrors {
    errors: BTreeMap<String, String>,
    first: Option<ControllerError>,
}

impl MemberErrors {
    fn record(&mut self, member: &Member, e: ControllerError) {
        warn!("skipping group member {}: {}", member.id(), e);
        self.errors.entry(member.id()).or_insert_with(|| e.to_string());
        if self.first.is_none() {
            self.first = Some(e);
        }
    }

    fn check(&mut self) -> Result<(), ControllerError> {
        match self.first.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What one group member contributes to the stack.
struct MemberPlan<'g> {
    member: &'g Member,
    ports: Vec<PortProtocol>,
    rules: MemberRules,
    /// Certificates of TLS blocks with a secret, keyed by stack ID.
    secret_certificates: BTreeMap<String, Certificate>,
    /// Hosts which are not served by one of the member's own secrets.
    hosts: BTreeSet<String>,
}

impl MemberPlan<'_> {
    fn listens_on(&self, pp: &PortProtocol) -> bool {
        self.ports.contains(pp)
    }
}

pub(crate) struct ModelBuilder<'a> {
    pub backends: &'a dyn BackendLookup,
    pub certificates: &'a dyn CertDiscovery,
    pub subnets: &'a dyn SubnetResolver,
}

impl<'a> ModelBuilder<'a> {
    pub async fn build(&self, config: &LoadBalancerConfig, group: &Group) -> BuildOutcome {
        let mut errors = MemberErrors::default();
        let stack = self.build_stack(config, group, &mut errors).await;
        BuildOutcome {
            stack,
            member_errors: errors.errors,
        }
    }

    async fn plan_member<'g>(&self, member: &'g Member) -> Result<MemberPlan<'g>, ControllerError> {
        let ingress = member.ingress.as_ref();
        let object = member.id();
        let ports = ingress_listen_ports(ingress)?;
        let rules = member_rules(ingress, &ports)?;
        let spec = ingress.spec.as_ref();
        let mut hosts: BTreeSet<String> = spec
            .into_iter()
            .flat_map(|s| s.rules.iter().flatten())
            .filter_map(|r| r.host.clone())
            .filter(|h| !h.is_empty())
            .collect();
        let mut secret_certificates = BTreeMap::new();
        if ports.iter().any(|pp| pp.protocol.is_secure()) {
            let namespace = ingress.namespace().unwrap_or_default();
            let mut explained: BTreeSet<String> = BTreeSet::new();
            let mut explains_all = false;
            for tls in spec.into_iter().flat_map(|s| s.tls.iter().flatten()) {
                let tls_hosts: Vec<String> = tls.hosts.clone().unwrap_or_default();
                match tls.secret_name.as_deref().filter(|s| !s.is_empty()) {
                    Some(secret_name) => {
                        let secret = self
                            .backends
                            .secret(&namespace, secret_name)
                            .await?
                            .ok_or_else(|| ControllerError::InvalidBackend {
                                object: object.clone(),
                                message: format!("secret {}/{} not found", namespace, secret_name),
                            })?;
                        explains_all |= tls_hosts.is_empty();
                        explained.extend(tls_hosts.iter().cloned());
                        let certificate = secret_certificate(&object, &secret, tls_hosts)?;
                        secret_certificates
                            .entry(format!("{}/{}", namespace, secret_name))
                            .or_insert(certificate);
                    }
                    None => hosts.extend(tls_hosts),
                }
            }
            if explains_all {
                hosts.clear();
            }
            hosts.retain(|h| !explained.contains(h));
        } else {
            hosts.clear();
        }
        Ok(MemberPlan {
            member,
            ports,
            rules,
            secret_certificates,
            hosts,
        })
    }

    /// Certificates of a secure listener: declared ones, then the ones of
    /// member secrets, then discovered ones. Exactly one is the default.
    async fn listener_certificates(
        &self,
        stack: &mut Stack,
        planned: &PlannedListener<'_>,
        plans: &[MemberPlan<'_>],
        certificate_refs: &mut BTreeMap<String, ResourceRef<Certificate>>,
    ) -> Result<Vec<ListenerCertificate>, ControllerError> {
        let mut certificates: Vec<ListenerCertificate> = planned
            .spec
            .into_iter()
            .flat_map(|s| s.certificates.iter())
            .map(|c| ListenerCertificate {
                certificate: Token::Value(c.certificate_id.clone()),
                is_default: c.is_default,
            })
            .collect();
        let declared = !certificates.is_empty();
        let mut explained: BTreeSet<&str> = BTreeSet::new();
        let mut hosts: BTreeSet<String> = BTreeSet::new();
        for plan in plans.iter().filter(|p| p.listens_on(&planned.pp)) {
            for (id, certificate) in &plan.secret_certificates {
                explained.extend(certificate.hosts.iter().map(|h| h.as_str()));
                let r = match certificate_refs.get(id) {
                    Some(r) => r.clone(),
                    None => {
                        let r = stack.add(id.clone(), certificate.clone())?;
                        certificate_refs.insert(id.clone(), r.clone());
                        r
                    }
                };
                certificates.push(ListenerCertificate {
                    certificate: r.token(),
                    is_default: false,
                });
            }
            hosts.extend(plan.hosts.iter().cloned());
        }
        hosts.retain(|h| !explained.contains(h.as_str()));
        if !declared {
            certificates.extend(
                self.certificates
                    .discover(&hosts)
                    .await?
                    .into_iter()
                    .map(|id| ListenerCertificate {
                        certificate: Token::Value(id),
                        is_default: false,
                    }),
            );
        }
        let certificates = dedup_certificates(certificates);
        if certificates.is_empty() {
            warn!(
                "secure listener {} of {} has no certificate",
                planned.pp,
                stack.id()
            );
        }
        Ok(certificates)
    }

    async fn build_stack(
        &self,
        config: &LoadBalancerConfig,
        group: &Group,
        errors: &mut MemberErrors,
    ) -> Result<Stack, ControllerError> {
        let mut stack = Stack::new(stack_id(config));
        let load_balancer: LoadBalancer = build_load_balancer(config, self.subnets).await?;
        let load_balancer_name = load_balancer.name.clone();
        let lb = stack.add(LOAD_BALANCER_ID, load_balancer)?;

        let mut plans = Vec::with_capacity(group.members.len());
        for member in &group.members {
            match self.plan_member(member).await {
                Ok(plan) => plans.push(plan),
                Err(e) => errors.record(member, e),
            }
        }
        errors.check()?;

        // Server groups are configured by the first member referencing them.
        let mut server_groups: BTreeMap<ServiceRef, ResourceRef<ServerGroup>> = BTreeMap::new();
        for plan in &plans {
            for service in plan.rules.backends() {
                if server_groups.contains_key(&service) {
                    continue;
                }
                match build_server_group(self.backends, &service, &plan.member.ingress).await {
                    Ok(sg) => {
                        let r = stack.add(service.to_string(), sg)?;
                        server_groups.insert(service, r);
                    }
                    Err(e) => {
                        errors.record(plan.member, e);
                        break;
                    }
                }
            }
        }
        errors.check()?;

        let planned = merge_listeners(
            &config.spec.listeners,
            plans.iter().flat_map(|p| p.ports.iter().copied()),
        )?;
        let mut certificate_refs: BTreeMap<String, ResourceRef<Certificate>> = BTreeMap::new();
        for pl in &planned {
            let certificates = if pl.pp.protocol.is_secure() {
                self.listener_certificates(&mut stack, pl, &plans, &mut certificate_refs)
                    .await?
            } else {
                vec![]
            };
            let listener = stack.add(
                pl.pp.stack_id(),
                Listener {
                    load_balancer: lb.token(),
                    port: pl.pp.port,
                    protocol: pl.pp.protocol,
                    description: pl.spec.and_then(|s| s.description.clone()),
                    idle_timeout: pl.spec.and_then(|s| s.idle_timeout),
                    request_timeout: pl.spec.and_then(|s| s.request_timeout),
                    certificates: certificates.clone(),
                },
            )?;
            stack.add_dependency(lb.key(), listener.key())?;
            for c in &certificates {
                if let Token::Resource(key) = &c.certificate {
                    stack.add_dependency(key, listener.key())?;
                }
            }
            if let Some(spec) = pl.spec {
                if let Some(acl) = build_acl(&load_balancer_name, spec, listener.token())? {
                    let acl = stack.add(pl.pp.stack_id(), acl)?;
                    stack.add_dependency(listener.key(), acl.key())?;
                }
            }

            let mut drafts: Vec<RuleDraft> = vec![];
            let mut canaries: Vec<WeightedCanary> = vec![];
            for plan in &plans {
                drafts.extend(plan.rules.rules.get(&pl.pp).into_iter().flatten().cloned());
                canaries.extend(plan.rules.canaries.get(&pl.pp).into_iter().flatten().cloned());
            }
            apply_canaries(&mut drafts, &canaries)?;
            // Header and cookie canaries have to be evaluated before the
            // production rules they shadow.
            drafts.sort_by_key(|d| d.production);
            for (i, draft) in drafts.into_iter().enumerate() {
                let priority = i as u32 + 1;
                let actions = draft
                    .actions
                    .iter()
                    .map(|a| {
                        a.try_map(|service| {
                            server_groups
                                .get(service)
                                .map(|r| r.token())
                                .ok_or_else(|| ControllerError::UnknownResource(service.to_string()))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let rule = stack.add(
                    format!("{}-{}", pl.pp.stack_id(), priority),
                    ListenerRule {
                        listener: listener.token(),
                        priority,
                        name: format!("rule-{}-{}", pl.pp.port, priority),
                        conditions: draft.conditions.clone(),
                        actions,
                    },
                )?;
                stack.add_dependency(listener.key(), rule.key())?;
                for service in draft.backends() {
                    if let Some(sg) = server_groups.get(service) {
                        stack.add_dependency(sg.key(), rule.key())?;
                    }
                }
            }
        }
        debug!(
            "built stack {} with {} resources for {} group members",
            stack.id(),
            stack.len(),
            plans.len()
        );
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ingress::{annotations::DEFAULT_GROUP_ORDER, backend::tests::StaticBackends, group::{GroupId, sort_members}},
        model::{Acl, ResourceKey, ResourceKind, RuleAction, ZoneSubnet},
    };
    use async_trait::async_trait;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;
    use rustrial_k8s_alb_controller_apis::{
        AclConfig, AclType, CertificateRef, ListenerProtocol, ListenerSpec, LoadBalancerConfigSpec,
        ZoneMapping, annotations,
    };
    use std::sync::Arc;

    struct Discovery(BTreeMap<String, String>);

    #[async_trait]
    impl CertDiscovery for Discovery {
        async fn discover(&self, hosts: &BTreeSet<String>) -> Result<BTreeSet<String>, ControllerError> {
            hosts
                .iter()
                .map(|h| {
                    self.0
                        .get(h)
                        .cloned()
                        .ok_or_else(|| ControllerError::CertificateNotFound(h.clone()))
                })
                .collect()
        }
    }

    struct Subnets;

    #[async_trait]
    impl SubnetResolver for Subnets {
        async fn resolve(&self, _: &[ZoneMapping]) -> Result<Vec<ZoneSubnet>, ControllerError> {
            Ok(vec![ZoneSubnet {
                zone_id: "z-a".into(),
                subnet_id: "s-1".into(),
            }])
        }
    }

    fn config(listeners: Vec<ListenerSpec>) -> LoadBalancerConfig {
        let mut c = LoadBalancerConfig::new(
            "default",
            LoadBalancerConfigSpec {
                config: Default::default(),
                listeners,
            },
        );
        c.metadata.namespace = Some("kube-system".into());
        c
    }

    fn ingress(
        name: &str,
        annotations: &[(&str, &str)],
        rules: &[(Option<&str>, &str)],
        tls: &[(&[&str], Option<&str>)],
    ) -> Arc<Ingress> {
        Arc::new(Ingress {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(
                    rules
                        .iter()
                        .map(|(host, service)| IngressRule {
                            host: host.map(|h| h.to_string()),
                            http: Some(HTTPIngressRuleValue {
                                paths: vec![HTTPIngressPath {
                                    path: Some("/".into()),
                                    path_type: "Prefix".into(),
                                    backend: IngressBackend {
                                        resource: None,
                                        service: Some(IngressServiceBackend {
                                            name: service.to_string(),
                                            port: Some(ServiceBackendPort {
                                                name: None,
                                                number: Some(80),
                                            }),
                                        }),
                                    },
                                }],
                            }),
                        })
                        .collect(),
                ),
                tls: Some(
                    tls.iter()
                        .map(|(hosts, secret)| IngressTLS {
                            hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
                            secret_name: secret.map(|s| s.to_string()),
                        })
                        .collect(),
                )
                .filter(|t: &Vec<IngressTLS>| !t.is_empty()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn group(ingresses: Vec<Arc<Ingress>>) -> Group {
        let mut members: Vec<Member> = ingresses
            .into_iter()
            .map(|ingress| {
                let explicit = ingress.annotations().get(annotations::GROUP_ORDER).cloned();
                Member {
                    order: explicit
                        .as_deref()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(DEFAULT_GROUP_ORDER),
                    explicit_order: explicit.is_some(),
                    ingress,
                }
            })
            .collect();
        sort_members(&mut members).unwrap();
        Group {
            id: GroupId::new("kube-system", "default"),
            members,
            inactive_members: vec![],
        }
    }

    async fn build(
        backends: &StaticBackends,
        discovery: &Discovery,
        config: &LoadBalancerConfig,
        group: &Group,
    ) -> BuildOutcome {
        ModelBuilder {
            backends,
            certificates: discovery,
            subnets: &Subnets,
        }
        .build(config, group)
        .await
    }

    fn sg_token(service: &str) -> Token {
        Token::Resource(ResourceKey {
            kind: ResourceKind::ServerGroup,
            id: format!("default/{}:80", service),
        })
    }

    fn forwards_to(rule: &ListenerRule) -> Vec<Token> {
        rule.actions
            .iter()
            .flat_map(|a| match a {
                RuleAction::ForwardGroup { server_groups } => {
                    server_groups.iter().map(|t| t.server_group.clone()).collect()
                }
                _ => vec![],
            })
            .collect()
    }

    #[tokio::test]
    async fn member_order_drives_rule_priorities() {
        let backends = StaticBackends::default()
            .with_service("default", "web-a", &[("10.0.0.1", true)])
            .with_service("default", "web-b", &[("10.0.0.2", true)]);
        let g = group(vec![
            ingress("a", &[], &[(None, "web-a")], &[]),
            ingress("b", &[(annotations::GROUP_ORDER, "5")], &[(None, "web-b")], &[]),
        ]);
        let outcome = build(&backends, &Discovery(Default::default()), &config(vec![]), &g).await;
        assert!(outcome.member_errors.is_empty());
        let stack = outcome.stack.unwrap();
        let listeners = stack.list::<Listener>();
        assert_eq!(1, listeners.len());
        assert_eq!("80-http", listeners[0].0.id());
        assert_eq!(ListenerProtocol::Http, listeners[0].1.protocol);
        let rules = stack.list::<ListenerRule>();
        assert_eq!(2, rules.len());
        assert_eq!(1, rules[0].1.priority);
        assert_eq!("rule-80-1", rules[0].1.name);
        assert_eq!(vec![sg_token("web-b")], forwards_to(rules[0].1));
        assert_eq!(2, rules[1].1.priority);
        assert_eq!(vec![sg_token("web-a")], forwards_to(rules[1].1));
        assert!(stack.list::<Acl>().is_empty());
        assert!(stack.list::<Certificate>().is_empty());
        assert_eq!(2, stack.list::<ServerGroup>().len());
        assert_eq!(1, stack.list::<LoadBalancer>().len());
        // dependencies allow a full traversal
        let mut visited = 0;
        stack
            .topological_traversal(|_, _| {
                visited += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(stack.len(), visited);
    }

    #[tokio::test]
    async fn secure_listener_certificates() {
        let backends = StaticBackends::default()
            .with_service("default", "web", &[])
            .with_tls_secret("default", "tls");
        let discovery = Discovery(
            [("b.example.com".to_string(), "cert-b".to_string())]
                .into_iter()
                .collect(),
        );
        let g = group(vec![ingress(
            "web",
            &[],
            &[(Some("a.example.com"), "web"), (Some("b.example.com"), "web")],
            &[(&["a.example.com"], Some("tls"))],
        )]);
        let stack = build(&backends, &discovery, &config(vec![]), &g)
            .await
            .stack
            .unwrap();
        let listeners = stack.list::<Listener>();
        let ids: Vec<&str> = listeners.iter().map(|(r, _)| r.id()).collect();
        assert_eq!(vec!["443-https", "80-http"], ids);
        let https = listeners[0].1;
        assert_eq!(
            vec![
                ListenerCertificate {
                    certificate: Token::Resource(ResourceKey {
                        kind: ResourceKind::Certificate,
                        id: "default/tls".into()
                    }),
                    is_default: true
                },
                ListenerCertificate {
                    certificate: Token::Value("cert-b".into()),
                    is_default: false
                },
            ],
            https.certificates
        );
        let certificates = stack.list::<Certificate>();
        assert_eq!(1, certificates.len());
        assert_eq!("default-tls-42", certificates[0].1.name);
        assert!(listeners[1].1.certificates.is_empty());
    }

    #[tokio::test]
    async fn unmapped_tls_host_fails_the_build() {
        let backends = StaticBackends::default().with_service("default", "web", &[]);
        let g = group(vec![ingress(
            "web",
            &[],
            &[(Some("c.example.com"), "web")],
            &[(&["c.example.com"], None)],
        )]);
        let outcome = build(&backends, &Discovery(Default::default()), &config(vec![]), &g).await;
        assert!(matches!(
            outcome.stack,
            Err(ControllerError::CertificateNotFound(h)) if h == "c.example.com"
        ));
    }

    #[tokio::test]
    async fn declared_listener_with_acl_and_certificate() {
        let backends = StaticBackends::default();
        let declared = ListenerSpec {
            port: 443,
            protocol: ListenerProtocol::Https,
            description: Some("public".into()),
            idle_timeout: Some(30),
            request_timeout: None,
            certificates: vec![CertificateRef {
                certificate_id: "cert-1".into(),
                is_default: false,
            }],
            acl_config: Some(AclConfig {
                acl_type: Some(AclType::White),
                acl_name: None,
                acl_entries: vec!["10.0.0.0/8".into()],
                acl_ids: vec![],
            }),
        };
        let stack = build(&backends, &Discovery(Default::default()), &config(vec![declared]), &group(vec![]))
            .await
            .stack
            .unwrap();
        let listeners = stack.list::<Listener>();
        assert_eq!(1, listeners.len());
        assert_eq!(Some(30), listeners[0].1.idle_timeout);
        assert!(listeners[0].1.certificates[0].is_default);
        let acls = stack.list::<Acl>();
        assert_eq!(1, acls.len());
        assert_eq!("443-https", acls[0].0.id());
        assert_eq!(Some("k8s-kube-system-default-443-https".to_string()), acls[0].1.name);
        assert_eq!(listeners[0].0.token(), acls[0].1.listener);
    }

    #[tokio::test]
    async fn declared_certificates_are_unique() {
        let declared = ListenerSpec {
            port: 443,
            protocol: ListenerProtocol::Https,
            description: None,
            idle_timeout: None,
            request_timeout: None,
            certificates: ["cert-2", "cert-1", "cert-2", "cert-1"]
                .iter()
                .enumerate()
                .map(|(i, id)| CertificateRef {
                    certificate_id: id.to_string(),
                    is_default: i == 1,
                })
                .collect(),
            acl_config: None,
        };
        let stack = build(
            &StaticBackends::default(),
            &Discovery(Default::default()),
            &config(vec![declared]),
            &group(vec![]),
        )
        .await
        .stack
        .unwrap();
        let listeners = stack.list::<Listener>();
        assert_eq!(
            vec![
                ListenerCertificate {
                    certificate: Token::Value("cert-1".into()),
                    is_default: true
                },
                ListenerCertificate {
                    certificate: Token::Value("cert-2".into()),
                    is_default: false
                },
            ],
            listeners[0].1.certificates
        );
    }

    #[tokio::test]
    async fn member_errors_are_attributed() {
        let backends = StaticBackends::default().with_service("default", "web", &[]);
        let g = group(vec![
            ingress("good", &[], &[(None, "web")], &[]),
            ingress("bad", &[(annotations::LISTEN_PORTS, "[{\"TCP\":80}]")], &[(None, "web")], &[]),
            ingress("missing", &[], &[(None, "nope")], &[]),
        ]);
        let outcome = build(&backends, &Discovery(Default::default()), &config(vec![]), &g).await;
        assert!(matches!(
            outcome.stack,
            Err(ControllerError::InvalidAnnotation { .. })
        ));
        assert_eq!(1, outcome.member_errors.len());
        assert!(outcome.member_errors.contains_key("default/bad"));

        let g = group(vec![
            ingress("good", &[], &[(None, "web")], &[]),
            ingress("missing", &[], &[(None, "nope")], &[]),
        ]);
        let outcome = build(&backends, &Discovery(Default::default()), &config(vec![]), &g).await;
        assert!(matches!(outcome.stack, Err(ControllerError::InvalidBackend { .. })));
        let keys: Vec<&String> = outcome.member_errors.keys().collect();
        assert_eq!(vec!["default/missing"], keys);
    }

    #[tokio::test]
    async fn header_canary_precedes_production() {
        let backends = StaticBackends::default()
            .with_service("default", "web", &[])
            .with_service("default", "web-canary", &[]);
        let g = group(vec![
            ingress("a-web", &[], &[(None, "web")], &[]),
            ingress(
                "b-web-canary",
                &[
                    ("alb.ingress.rustrial.org/canary", "true"),
                    ("alb.ingress.rustrial.org/canary-by-header", "x-canary"),
                ],
                &[(None, "web-canary")],
                &[],
            ),
        ]);
        let stack = build(&backends, &Discovery(Default::default()), &config(vec![]), &g)
            .await
            .stack
            .unwrap();
        let mut rules: Vec<&ListenerRule> = stack.list::<ListenerRule>().into_iter().map(|(_, r)| r).collect();
        rules.sort_by_key(|r| r.priority);
        assert_eq!(vec![sg_token("web-canary")], forwards_to(rules[0]));
        assert_eq!(vec![sg_token("web")], forwards_to(rules[1]));
    }

    #[tokio::test]
    async fn conflicting_listener_protocols() {
        let backends = StaticBackends::default().with_service("default", "web", &[]);
        let g = group(vec![ingress(
            "web",
            &[(annotations::LISTEN_PORTS, "[{\"HTTPS\":80}]")],
            &[(None, "web")],
            &[],
        )]);
        let declared = ListenerSpec {
            port: 80,
            protocol: ListenerProtocol::Http,
            description: None,
            idle_timeout: None,
            request_timeout: None,
            certificates: vec![],
            acl_config: None,
        };
        let outcome = build(&backends, &Discovery(Default::default()), &config(vec![declared]), &g).await;
        assert!(matches!(
            outcome.stack,
            Err(ControllerError::ListenerProtocolConflict { port: 80, .. })
        ));
    }

    #[test]
    fn deletion_stack_is_empty() {
        let stack = deletion_stack(&config(vec![]));
        assert!(stack.is_empty());
        assert_eq!("kube-system/default", stack.id().to_string());
    }
}
