//! Desired resource types which make up a [`Stack`](super::Stack).
//!
//! Each type comes with a status type which the corresponding applier writes
//! back once it observed or created the cloud counterpart. Values which are
//! only known after another resource has been applied (e.g. the ID of the
//! load balancer a listener belongs to) are expressed as [`Token`]s.

use std::collections::BTreeMap;

use rustrial_k8s_alb_controller_apis::{AclType, AddressType, ListenerProtocol};
use serde::Serialize;

use super::stack::{ResourceKey, ResourceKind};

/// A string value which is either known at build time or resolved from the
/// status of another resource of the same stack at apply time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Token {
    Value(String),
    Resource(ResourceKey),
}

impl From<&str> for Token {
    fn from(v: &str) -> Self {
        Token::Value(v.to_string())
    }
}

impl From<String> for Token {
    fn from(v: String) -> Self {
        Token::Value(v)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSubnet {
    pub zone_id: String,
    pub subnet_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub name: String,
    /// ID of a pre-existing load balancer which is adopted instead of created.
    pub reuse_id: Option<String>,
    pub force_override: bool,
    pub address_type: AddressType,
    pub edition: String,
    pub zone_mappings: Vec<ZoneSubnet>,
    pub deletion_protection: bool,
    pub tags: BTreeMap<String, String>,
}

impl LoadBalancer {
    /// Reused without override permission, only tags are managed.
    pub fn is_common_reuse(&self) -> bool {
        self.reuse_id.is_some() && !self.force_override
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    pub id: String,
    pub dns_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerCertificate {
    pub certificate: Token,
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub load_balancer: Token,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub description: Option<String>,
    pub idle_timeout: Option<u32>,
    pub request_timeout: Option<u32>,
    pub certificates: Vec<ListenerCertificate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub id: String,
}

/// Match condition of a listener rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleCondition {
    Host { values: Vec<String> },
    Path { values: Vec<String> },
    Header { key: String, values: Vec<String> },
    Cookie { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupTuple<G> {
    pub server_group: G,
    pub weight: u32,
}

/// Action of a listener rule, generic over the way server groups are referenced:
/// [`Token`]s in the desired model and plain IDs on the cloud side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction<G> {
    Rewrite {
        path: String,
    },
    Redirect {
        protocol: ListenerProtocol,
        port: u16,
        http_code: u16,
    },
    FixedResponse {
        http_code: u16,
        content: String,
    },
    ForwardGroup {
        server_groups: Vec<ServerGroupTuple<G>>,
    },
}

impl<G> RuleAction<G> {
    /// Map the server group references, failing on the first unresolvable one.
    pub fn try_map<H, E>(&self, f: impl Fn(&G) -> Result<H, E>) -> Result<RuleAction<H>, E> {
        Ok(match self {
            RuleAction::Rewrite { path } => RuleAction::Rewrite { path: path.clone() },
            RuleAction::Redirect {
                protocol,
                port,
                http_code,
            } => RuleAction::Redirect {
                protocol: *protocol,
                port: *port,
                http_code: *http_code,
            },
            RuleAction::FixedResponse { http_code, content } => RuleAction::FixedResponse {
                http_code: *http_code,
                content: content.clone(),
            },
            RuleAction::ForwardGroup { server_groups } => RuleAction::ForwardGroup {
                server_groups: server_groups
                    .iter()
                    .map(|t| {
                        Ok(ServerGroupTuple {
                            server_group: f(&t.server_group)?,
                            weight: t.weight,
                        })
                    })
                    .collect::<Result<Vec<_>, E>>()?,
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRule {
    pub listener: Token,
    pub priority: u32,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction<Token>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRuleStatus {
    pub id: String,
}

/// Kubernetes Service port a server group forwards to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    /// Port number or port name as referenced by the Ingress backend.
    pub port: String,
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BackendProtocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
    #[serde(rename = "gRPC")]
    Grpc,
}

impl BackendProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "grpc" => Some(Self::Grpc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub enabled: bool,
    pub path: String,
    pub protocol: BackendProtocol,
    pub interval_seconds: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/".to_string(),
            protocol: BackendProtocol::Http,
            interval_seconds: 2,
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendServer {
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroup {
    pub name: String,
    pub service: ServiceRef,
    /// Console-managed server group, never created nor deleted by the controller.
    pub reuse_id: Option<String>,
    pub protocol: BackendProtocol,
    pub health_check: HealthCheck,
    /// Sorted, ready endpoints of the service.
    pub servers: Vec<BackendServer>,
    /// Number of endpoints which exist but are not ready yet.
    pub pending_endpoints: usize,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupStatus {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acl {
    pub listener: Token,
    pub acl_type: AclType,
    /// Name of the controller managed ACL, `None` if only external ACLs are referenced.
    pub name: Option<String>,
    pub entries: Vec<String>,
    pub acl_ids: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AclStatus {
    /// IDs of all ACLs associated with the listener.
    pub acl_ids: Vec<String>,
}

/// Certificate uploaded from a `kubernetes.io/tls` Secret.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub namespace: String,
    pub secret_name: String,
    /// Cloud side name, unique per Secret revision.
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(skip)]
    pub certificate_pem: String,
    #[serde(skip)]
    pub private_key_pem: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    pub id: String,
}

/// Closed set of resource specifications a stack can hold.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    Certificate(Certificate),
    ServerGroup(ServerGroup),
    LoadBalancer(LoadBalancer),
    Listener(Listener),
    Acl(Acl),
    ListenerRule(ListenerRule),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResourceStatus {
    Certificate(CertificateStatus),
    ServerGroup(ServerGroupStatus),
    LoadBalancer(LoadBalancerStatus),
    Listener(ListenerStatus),
    Acl(AclStatus),
    ListenerRule(ListenerRuleStatus),
}

impl ResourceStatus {
    /// The cloud ID other resources refer to.
    pub fn id(&self) -> Option<&str> {
        match self {
            ResourceStatus::Certificate(s) => Some(&s.id),
            ResourceStatus::ServerGroup(s) => Some(&s.id),
            ResourceStatus::LoadBalancer(s) => Some(&s.id),
            ResourceStatus::Listener(s) => Some(&s.id),
            ResourceStatus::Acl(s) => s.acl_ids.first().map(|v| v.as_str()),
            ResourceStatus::ListenerRule(s) => Some(&s.id),
        }
    }
}

/// Typed access to the variants of [`ResourceSpec`] and [`ResourceStatus`].
pub trait StackResource: Sized {
    const KIND: ResourceKind;
    type Status;

    fn into_spec(self) -> ResourceSpec;
    fn from_spec(spec: &ResourceSpec) -> Option<&Self>;
    fn into_status(status: Self::Status) -> ResourceStatus;
    fn from_status(status: &ResourceStatus) -> Option<&Self::Status>;
}

macro_rules! stack_resource {
    ($variant:ident, $status:ident) => {
        impl StackResource for $variant {
            const KIND: ResourceKind = ResourceKind::$variant;
            type Status = $status;

            fn into_spec(self) -> ResourceSpec {
                ResourceSpec::$variant(self)
            }

            fn from_spec(spec: &ResourceSpec) -> Option<&Self> {
                match spec {
                    ResourceSpec::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_status(status: Self::Status) -> ResourceStatus {
                ResourceStatus::$variant(status)
            }

            fn from_status(status: &ResourceStatus) -> Option<&Self::Status> {
                match status {
                    ResourceStatus::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

stack_resource!(Certificate, CertificateStatus);
stack_resource!(ServerGroup, ServerGroupStatus);
stack_resource!(LoadBalancer, LoadBalancerStatus);
stack_resource!(Listener, ListenerStatus);
stack_resource!(Acl, AclStatus);
stack_resource!(ListenerRule, ListenerRuleStatus);
