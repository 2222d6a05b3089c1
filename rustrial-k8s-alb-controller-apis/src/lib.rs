use std::collections::BTreeMap;

use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "alb.rustrial.org";

/// Value of `IngressClass.spec.controller` for classes handled by this controller.
pub const CONTROLLER_NAME: &'static str = "alb.rustrial.org/ingress-controller";

/// Legacy `kubernetes.io/ingress.class` annotation.
pub const INGRESS_CLASS_ANNOTATION: &'static str = "kubernetes.io/ingress.class";

/// Legacy ingress class value which is always handled by this controller.
pub const LEGACY_INGRESS_CLASS: &'static str = "alb";

/// Kind name used in `IngressClass.spec.parameters`.
pub const LOAD_BALANCER_CONFIG_KIND: &'static str = "LoadBalancerConfig";

/// Finalizer set on every [`LoadBalancerConfig`] object.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects.
pub const FINALIZER: &'static str = "alb.rustrial.org/resources";

/// Prefix of the per-group finalizer set on active Ingress members.
pub const GROUP_FINALIZER_PREFIX: &'static str = "group.alb.rustrial.org/";

/// Ingress (and Service) annotations understood by the controller.
pub mod annotations {
    pub const PREFIX: &'static str = "alb.ingress.rustrial.org";
    /// Prefix of the legacy canary annotations.
    pub const LEGACY_PREFIX: &'static str = "nginx.ingress.kubernetes.io";

    pub const GROUP_NAME: &'static str = "alb.ingress.rustrial.org/group-name";
    pub const GROUP_ORDER: &'static str = "alb.ingress.rustrial.org/group-order";
    pub const LISTEN_PORTS: &'static str = "alb.ingress.rustrial.org/listen-ports";
    pub const SSL_REDIRECT: &'static str = "alb.ingress.rustrial.org/ssl-redirect";
    pub const REWRITE_TARGET: &'static str = "alb.ingress.rustrial.org/rewrite-target";
    pub const BACKEND_PROTOCOL: &'static str = "alb.ingress.rustrial.org/backend-protocol";
    pub const HEALTHCHECK_ENABLED: &'static str = "alb.ingress.rustrial.org/healthcheck-enabled";
    pub const HEALTHCHECK_PATH: &'static str = "alb.ingress.rustrial.org/healthcheck-path";
    pub const HEALTHCHECK_PROTOCOL: &'static str = "alb.ingress.rustrial.org/healthcheck-protocol";
    pub const HEALTHCHECK_INTERVAL: &'static str =
        "alb.ingress.rustrial.org/healthcheck-interval-seconds";
    pub const HEALTHY_THRESHOLD: &'static str = "alb.ingress.rustrial.org/healthy-threshold-count";
    pub const UNHEALTHY_THRESHOLD: &'static str =
        "alb.ingress.rustrial.org/unhealthy-threshold-count";
    /// Service annotation referencing a console-managed server group.
    pub const SERVER_GROUP_ID: &'static str = "alb.ingress.rustrial.org/server-group-id";

    /// Canary annotation suffixes, valid with both [`PREFIX`] and [`LEGACY_PREFIX`].
    pub const CANARY: &'static str = "canary";
    pub const CANARY_WEIGHT: &'static str = "canary-weight";
    pub const CANARY_BY_HEADER: &'static str = "canary-by-header";
    pub const CANARY_BY_HEADER_VALUE: &'static str = "canary-by-header-value";
    pub const CANARY_BY_COOKIE: &'static str = "canary-by-cookie";
}

/// Tag keys used to track ownership of cloud resources.
pub mod tags {
    pub const CLUSTER_ID: &'static str = "alb.rustrial.org/cluster-id";
    pub const CONFIG: &'static str = "alb.rustrial.org/config";
    pub const RESOURCE: &'static str = "alb.rustrial.org/resource";
    /// Set on pre-existing load balancers adopted through `spec.config.id`,
    /// value is either `override` or `common`.
    pub const REUSED: &'static str = "alb.rustrial.org/reused";
}

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }
}

/// Listener protocol.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub enum ListenerProtocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
    #[serde(rename = "QUIC")]
    Quic,
}

impl ListenerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Quic => "QUIC",
        }
    }

    /// Whether listeners of this protocol terminate TLS and need certificates.
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Https | Self::Quic)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "HTTP" => Some(Self::Http),
            "HTTPS" => Some(Self::Https),
            "QUIC" => Some(Self::Quic),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network type of the load balancer address.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum AddressType {
    Internet,
    Intranet,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::Internet
    }
}

/// Access control list type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum AclType {
    /// Allow-list.
    White,
    /// Deny-list.
    Black,
}

/// Load balancer configuration, shared by all Ingress objects of one group.
#[derive(CustomResource, Debug, Default, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "alb.rustrial.org",
    version = "v1alpha1",
    kind = "LoadBalancerConfig",
    derive = "PartialEq",
    status = "LoadBalancerConfigStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the load balancer converged to the desired configuration."
    }"#,
    printcolumn = r#"{
        "name":"DNS",
        "type": "string",
        "jsonPath": ".status.loadBalancer.dnsName",
        "description": "DNS name of the load balancer."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfigSpec {
    /// Load balancer attributes.
    #[serde(default)]
    pub config: LoadBalancerSpec,
    /// Listeners which are always provisioned, regardless of the Ingress objects of the group.
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Load balancer name, defaults to `k8s-{namespace}-{name}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// ID of an existing load balancer to reuse instead of creating a new one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Allow the controller to modify listeners and attributes of a reused load balancer.
    #[serde(default)]
    pub force_override: bool,
    #[serde(default)]
    pub address_type: AddressType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    /// Explicit subnets, auto-discovered if empty.
    #[serde(default)]
    pub zone_mappings: Vec<ZoneMapping>,
    #[serde(default)]
    pub deletion_protection: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZoneMapping {
    pub subnet_id: String,
    /// Zone of the subnet, looked up from the subnet if omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub port: u16,
    pub protocol: ListenerProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Idle timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u32>,
    /// Request timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u32>,
    #[serde(default)]
    pub certificates: Vec<CertificateRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl_config: Option<AclConfig>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    pub certificate_id: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AclConfig {
    /// No ACL is attached if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl_type: Option<AclType>,
    /// Name of the managed ACL, derived from load balancer name and port if omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl_name: Option<String>,
    /// CIDR entries of a controller managed ACL.
    #[serde(default)]
    pub acl_entries: Vec<String>,
    /// IDs of externally managed ACLs, mutually exclusive with `aclEntries`.
    #[serde(default)]
    pub acl_ids: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfigStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerStatus>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    pub id: String,
    #[serde(default)]
    pub dns_name: String,
    #[serde(default)]
    pub listeners: Vec<ListenerStatus>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub port: u16,
    pub protocol: ListenerProtocol,
    #[serde(default)]
    pub certificates: Vec<String>,
}

impl LoadBalancerConfig {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// DNS name of the provisioned load balancer, `None` until provisioned.
    pub fn dns_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .map(|lb| lb.dns_name.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Name of the cloud load balancer.
    pub fn load_balancer_name(&self) -> String {
        self.spec.config.name.clone().unwrap_or_else(|| {
            format!(
                "k8s-{}-{}",
                self.namespace().unwrap_or_default(),
                self.name_any()
            )
        })
    }

    pub fn update_condition(&mut self, c: Condition) {
        let mut status = self.status.take().unwrap_or_default();
        status.update_condition(c);
        self.status = Some(status);
    }

    pub fn update_load_balancer(&mut self, lb: Option<LoadBalancerStatus>) {
        let mut status = self.status.take().unwrap_or_default();
        status.load_balancer = lb;
        self.status = Some(status);
    }
}

impl LoadBalancerConfigStatus {
    pub fn update_condition(&mut self, mut c: Condition) {
        let time = Utc::now();
        c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_else(|| vec![]);
        if let Some(existing) = conditions.iter().find(|e| e.type_ == c.type_) {
            if existing.status != c.status
                || existing.reason != c.reason
                || existing.message != c.message
                || existing.observed_generation != c.observed_generation
            {
                conditions.retain(|v| v.type_ != c.type_);
                conditions.push(c);
            }
        } else {
            conditions.push(c);
        };
        self.conditions = Some(conditions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn it_works() {
        let p: LoadBalancerConfigSpec = serde_json::from_str(
            r#"{"config":{"forceOverride":true},"listeners":[{"port":443,"protocol":"HTTPS"}]}"#,
        )
        .unwrap();
        assert!(p.config.force_override);
        assert_eq!(AddressType::Internet, p.config.address_type);
        assert_eq!(ListenerProtocol::Https, p.listeners[0].protocol);
        assert!(p.listeners[0].certificates.is_empty());
    }

    #[test]
    fn listener_protocol() {
        assert_eq!(
            r#""QUIC""#,
            serde_json::to_string(&ListenerProtocol::Quic).unwrap()
        );
        assert_eq!(Some(ListenerProtocol::Http), ListenerProtocol::parse("http"));
        assert_eq!(None, ListenerProtocol::parse("TCP"));
        assert!(ListenerProtocol::Quic.is_secure());
        assert!(!ListenerProtocol::Http.is_secure());
    }

    #[test]
    fn condition_is_replaced_only_on_change() {
        let mut status = LoadBalancerConfigStatus::default();
        status.update_condition(Condition::new("Ready", Some(true), "Success", "ok".into()));
        status.update_condition(Condition::new("Other", None, "Pending", "".into()));
        status.update_condition(Condition::new("Ready", Some(false), "Failure", "x".into()));
        let conditions = status.conditions.unwrap();
        assert_eq!(2, conditions.len());
        let ready = conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!("False", ready.status);
    }

    #[test]
    fn load_balancer_name_and_dns() {
        let mut cfg = LoadBalancerConfig {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };
        assert_eq!("k8s-kube-system-web", cfg.load_balancer_name());
        assert_eq!(None, cfg.dns_name());
        cfg.update_load_balancer(Some(LoadBalancerStatus {
            id: "alb-1".into(),
            dns_name: "alb-1.example.com".into(),
            listeners: vec![],
        }));
        assert_eq!(Some("alb-1.example.com"), cfg.dns_name());
        assert_eq!("kube-system/web", cfg.id());
    }
}
