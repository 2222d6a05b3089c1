//! Listener rules derived from Ingress path rules.
//!
//! Rules are first built as drafts referencing Kubernetes services, one list
//! per listener in group member order. Weighted canaries are then folded into
//! their production sibling and the drafts are turned into stack resources
//! with sequential priorities.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::ResourceExt;
use log::warn;
use rustrial_k8s_alb_controller_apis::{ListenerProtocol, annotations};

use crate::{
    errors::ControllerError,
    ingress::{
        annotations::{self as ann, Canary},
        ingress_id,
        listen_ports::PortProtocol,
    },
    model::{RuleAction, RuleCondition, ServerGroupTuple, ServiceRef},
};

const CATCH_ALL: &'static str = "/*";
const FULL_WEIGHT: u32 = 100;
const REDIRECT_CODE: u16 = 301;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RuleDraft {
    pub host: Option<String>,
    /// Raw Ingress path, part of the key weighted canaries are merged by.
    pub path: Option<String>,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction<ServiceRef>>,
    /// Only production rules absorb weighted canaries.
    pub production: bool,
}

impl RuleDraft {
    pub fn backends(&self) -> impl Iterator<Item = &ServiceRef> {
        self.actions.iter().flat_map(|a| match a {
            RuleAction::ForwardGroup { server_groups } => {
                server_groups.iter().map(|t| &t.server_group).collect::<Vec<_>>()
            }
            _ => vec![],
        })
    }
}

/// Traffic share a canary Ingress takes from the production rule with the same host and path.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WeightedCanary {
    pub host: Option<String>,
    pub path: Option<String>,
    pub tuples: Vec<ServerGroupTuple<ServiceRef>>,
}

#[derive(Debug, Default)]
pub(crate) struct MemberRules {
    pub rules: BTreeMap<PortProtocol, Vec<RuleDraft>>,
    pub canaries: BTreeMap<PortProtocol, Vec<WeightedCanary>>,
}

impl MemberRules {
    /// Every service referenced by the rules and canaries.
    pub fn backends(&self) -> BTreeSet<ServiceRef> {
        let mut backends: BTreeSet<ServiceRef> = self
            .rules
            .values()
            .flatten()
            .flat_map(|r| r.backends().cloned())
            .collect();
        backends.extend(
            self.canaries
                .values()
                .flatten()
                .flat_map(|c| c.tuples.iter().map(|t| t.server_group.clone())),
        );
        backends
    }
}

fn service_ref(ingress: &Ingress, backend: &IngressBackend) -> Result<ServiceRef, ControllerError> {
    let invalid = |message: &str| ControllerError::InvalidBackend {
        object: ingress_id(ingress),
        message: message.to_string(),
    };
    let service = backend
        .service
        .as_ref()
        .ok_or_else(|| invalid("only service backends are supported"))?;
    let port = service
        .port
        .as_ref()
        .and_then(|p| {
            p.number
                .map(|n| n.to_string())
                .or_else(|| p.name.clone())
        })
        .ok_or_else(|| invalid(&format!("service {} has no port", service.name)))?;
    Ok(ServiceRef {
        namespace: ingress.namespace().unwrap_or_default(),
        name: service.name.clone(),
        port,
    })
}

/// Path condition values for an Ingress path.
pub(crate) fn path_values(
    object: &str,
    path: Option<&str>,
    path_type: &str,
    rewrite_target: Option<&str>,
) -> Result<Vec<String>, ControllerError> {
    let invalid = |path: &str, message: &str| ControllerError::InvalidPath {
        object: object.to_string(),
        path: path.to_string(),
        message: message.to_string(),
    };
    let path = path.unwrap_or("/");
    match path_type {
        "Exact" => {
            if path.contains(['*', '?']) {
                Err(invalid(path, "exact paths must not contain wildcards"))
            } else {
                Ok(vec![path.to_string()])
            }
        }
        "Prefix" | "ImplementationSpecific" => {
            if !path.starts_with('/') {
                return Err(invalid(path, "paths must start with /"));
            }
            let trimmed = path.trim_end_matches('/');
            if trimmed.is_empty() {
                return Ok(vec![CATCH_ALL.to_string()]);
            }
            match rewrite_target {
                Some(target) if target != path => Ok(vec![format!("~*^{}(/.*)?$", trimmed)]),
                _ => Ok(vec![trimmed.to_string(), format!("{}/*", trimmed)]),
            }
        }
        other => Err(invalid(path, &format!("unsupported path type {}", other))),
    }
}

fn forward(service: ServiceRef, weight: u32) -> RuleAction<ServiceRef> {
    RuleAction::ForwardGroup {
        server_groups: vec![ServerGroupTuple {
            server_group: service,
            weight,
        }],
    }
}

fn catch_all_if_empty(mut conditions: Vec<RuleCondition>) -> Vec<RuleCondition> {
    if conditions.is_empty() {
        conditions.push(RuleCondition::Path {
            values: vec![CATCH_ALL.to_string()],
        });
    }
    conditions
}

/// Matches of one Ingress path, before listener specific actions are added.
struct PathMatch {
    host: Option<String>,
    path: Option<String>,
    conditions: Vec<RuleCondition>,
    service: ServiceRef,
}

fn path_matches(ingress: &Ingress, rewrite_target: Option<&str>) -> Result<Vec<PathMatch>, ControllerError> {
    let object = ingress_id(ingress);
    let mut matches = vec![];
    let Some(spec) = ingress.spec.as_ref() else {
        return Ok(matches);
    };
    for rule in spec.rules.iter().flatten() {
        let host = rule.host.clone().filter(|h| !h.is_empty());
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            let mut conditions = vec![];
            if let Some(host) = &host {
                conditions.push(RuleCondition::Host {
                    values: vec![host.clone()],
                });
            }
            conditions.push(RuleCondition::Path {
                values: path_values(&object, path.path.as_deref(), &path.path_type, rewrite_target)?,
            });
            matches.push(PathMatch {
                host: host.clone(),
                path: path.path.clone(),
                conditions,
                service: service_ref(ingress, &path.backend)?,
            });
        }
    }
    Ok(matches)
}

fn canary_conditions(canary: &Canary) -> Vec<RuleCondition> {
    let mut conditions = vec![];
    if let Some(header) = &canary.header {
        conditions.push(RuleCondition::Header {
            key: header.clone(),
            values: vec![canary.header_value.clone().unwrap_or_else(|| "always".to_string())],
        });
    }
    if let Some(cookie) = &canary.cookie {
        conditions.push(RuleCondition::Cookie {
            key: cookie.clone(),
            value: "always".to_string(),
        });
    }
    conditions
}

/// Rule drafts of one group member for each of its listeners.
pub(crate) fn member_rules(
    ingress: &Ingress,
    listeners: &[PortProtocol],
) -> Result<MemberRules, ControllerError> {
    let rewrite_target = ann::get(ingress, annotations::REWRITE_TARGET);
    let ssl_redirect = ann::parse_bool(ingress, annotations::SSL_REDIRECT)?.unwrap_or(false);
    let canary = ann::canary(ingress)?;
    let matches = path_matches(ingress, rewrite_target)?;
    let mut result = MemberRules::default();
    for pp in listeners {
        let redirect = ssl_redirect && pp.protocol == ListenerProtocol::Http;
        let actions_for = |m: &PathMatch, weight: u32| -> Vec<RuleAction<ServiceRef>> {
            if redirect {
                return vec![RuleAction::Redirect {
                    protocol: ListenerProtocol::Https,
                    port: 443,
                    http_code: REDIRECT_CODE,
                }];
            }
            let mut actions = vec![];
            if let Some(target) = rewrite_target.filter(|t| Some(*t) != m.path.as_deref()) {
                actions.push(RuleAction::Rewrite {
                    path: target.to_string(),
                });
            }
            actions.push(forward(m.service.clone(), weight));
            actions
        };
        let mut rules = vec![];
        match &canary {
            Some(canary) => {
                let extra = canary_conditions(canary);
                for m in &matches {
                    // each match kind (header, cookie) gets its own rule
                    for condition in &extra {
                        let mut conditions = m.conditions.clone();
                        conditions.push(condition.clone());
                        rules.push(RuleDraft {
                            host: m.host.clone(),
                            path: m.path.clone(),
                            conditions,
                            actions: actions_for(m, FULL_WEIGHT),
                            production: false,
                        });
                    }
                    if canary.weight > 0 && !redirect {
                        result.canaries.entry(*pp).or_default().push(WeightedCanary {
                            host: m.host.clone(),
                            path: m.path.clone(),
                            tuples: vec![ServerGroupTuple {
                                server_group: m.service.clone(),
                                weight: canary.weight,
                            }],
                        });
                    }
                }
            }
            None => {
                for m in &matches {
                    rules.push(RuleDraft {
                        host: m.host.clone(),
                        path: m.path.clone(),
                        conditions: catch_all_if_empty(m.conditions.clone()),
                        actions: actions_for(m, FULL_WEIGHT),
                        production: true,
                    });
                }
                let default_backend = ingress.spec.as_ref().and_then(|s| s.default_backend.as_ref());
                if let Some(backend) = default_backend {
                    let m = PathMatch {
                        host: None,
                        path: None,
                        conditions: vec![],
                        service: service_ref(ingress, backend)?,
                    };
                    rules.push(RuleDraft {
                        host: None,
                        path: None,
                        conditions: catch_all_if_empty(vec![]),
                        actions: actions_for(&m, FULL_WEIGHT),
                        production: true,
                    });
                }
            }
        }
        if !rules.is_empty() {
            result.rules.insert(*pp, rules);
        }
    }
    Ok(result)
}

/// Fold canary tuples into the forward tuples of a production rule, keeping
/// the total weight at 100. Canaries taking all traffic replace production.
pub(crate) fn merge_canary(
    host: Option<&str>,
    path: Option<&str>,
    production: &mut Vec<ServerGroupTuple<ServiceRef>>,
    canary: &[ServerGroupTuple<ServiceRef>],
) -> Result<(), ControllerError> {
    let canary_weight: u32 = canary.iter().map(|t| t.weight).sum();
    if canary_weight > FULL_WEIGHT {
        return Err(ControllerError::CanaryWeightExceeded {
            host: host.unwrap_or("*").to_string(),
            path: path.unwrap_or("/").to_string(),
            weight: canary_weight,
        });
    }
    if canary_weight == FULL_WEIGHT {
        *production = canary.to_vec();
        return Ok(());
    }
    let remaining = FULL_WEIGHT - canary_weight;
    let n = production.len().max(1) as u32;
    for (i, t) in production.iter_mut().enumerate() {
        t.weight = remaining / n + if i == 0 { remaining % n } else { 0 };
    }
    production.extend(canary.iter().cloned());
    Ok(())
}

/// Apply the weighted canaries of a listener to its production rules.
pub(crate) fn apply_canaries(
    rules: &mut [RuleDraft],
    canaries: &[WeightedCanary],
) -> Result<(), ControllerError> {
    let mut by_key: BTreeMap<(Option<&str>, Option<&str>), Vec<ServerGroupTuple<ServiceRef>>> =
        BTreeMap::new();
    for c in canaries {
        by_key
            .entry((c.host.as_deref(), c.path.as_deref()))
            .or_default()
            .extend(c.tuples.iter().cloned());
    }
    for ((host, path), tuples) in by_key {
        let production = rules.iter_mut().find(|r| {
            r.production && r.host.as_deref() == host && r.path.as_deref() == path
        });
        let forward = production.and_then(|r| {
            r.actions.iter_mut().find_map(|a| match a {
                RuleAction::ForwardGroup { server_groups } => Some(server_groups),
                _ => None,
            })
        });
        match forward {
            Some(server_groups) => merge_canary(host, path, server_groups, &tuples)?,
            None => warn!(
                "ignoring weighted canary for host {:?} and path {:?}, there is no production rule to split traffic with",
                host, path
            ),
        }
    }
    Ok(())
}
