//! Cloud provider abstraction consumed by the model builder (discovery) and
//! the appliers (create/update/delete).
//!
//! The wire protocol of the provider API is not part of this crate, the
//! [`CloudProvider`] trait is the seam at which an SDK client is plugged in.

pub(crate) mod job;
pub(crate) mod memory;
pub(crate) mod retry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::chrono::{DateTime, Utc};
use rustrial_k8s_alb_controller_apis::{AclType, AddressType, ListenerProtocol};

use crate::model::{
    BackendProtocol, BackendServer, HealthCheck, RuleAction, RuleCondition, ZoneSubnet,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub(crate) enum CloudError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Provider side rate limiting.
    #[error("throttled: {0}")]
    Throttled(String),
    /// The resource is in a transient state (e.g. still provisioning).
    #[error("incorrect status: {0}")]
    IncorrectStatus(String),
    #[error("{0}")]
    Other(String),
}

impl CloudError {
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Throttled(_) | CloudError::IncorrectStatus(_))
    }
}

/// Resource types accepted by the tag and untag calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaggableResource {
    LoadBalancer,
    Listener,
    ServerGroup,
    Acl,
    Certificate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoadBalancerState {
    Provisioning,
    Active,
    Inactive,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkLoadBalancer {
    pub id: String,
    pub name: String,
    pub dns_name: String,
    pub state: LoadBalancerState,
    pub address_type: AddressType,
    pub edition: String,
    pub zone_mappings: Vec<ZoneSubnet>,
    pub deletion_protection: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LoadBalancerRequest {
    pub name: String,
    pub address_type: AddressType,
    pub edition: String,
    pub zone_mappings: Vec<ZoneSubnet>,
    pub deletion_protection: bool,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SdkListenerCertificate {
    pub id: String,
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SdkListenerAcl {
    pub acl_type: AclType,
    pub acl_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkListener {
    pub id: String,
    pub load_balancer_id: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub description: Option<String>,
    pub idle_timeout: Option<u32>,
    pub request_timeout: Option<u32>,
    pub certificates: Vec<SdkListenerCertificate>,
    pub acl: Option<SdkListenerAcl>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ListenerRequest {
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub description: Option<String>,
    pub idle_timeout: Option<u32>,
    pub request_timeout: Option<u32>,
    pub certificates: Vec<SdkListenerCertificate>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkListenerRule {
    pub id: String,
    pub listener_id: String,
    pub priority: u32,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ListenerRuleRequest {
    pub priority: u32,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkServerGroup {
    pub id: String,
    pub name: String,
    pub protocol: BackendProtocol,
    pub health_check: HealthCheck,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ServerGroupRequest {
    pub name: String,
    pub protocol: BackendProtocol,
    pub health_check: HealthCheck,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkAcl {
    pub id: String,
    pub name: String,
    pub entries: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkCertificate {
    pub id: String,
    pub name: String,
    /// Common name and subject alternative names.
    pub domains: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CertificateUpload {
    pub name: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SdkSubnet {
    pub id: String,
    pub zone_id: String,
    pub available_ips: u64,
}

/// State of an asynchronous provider job.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum JobStatus {
    Running,
    Succeeded,
    Failed(String),
}

#[async_trait]
pub(crate) trait CloudProvider: Send + Sync {
    async fn list_load_balancers(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<SdkLoadBalancer>, CloudError>;
    async fn get_load_balancer(&self, id: &str) -> Result<SdkLoadBalancer, CloudError>;
    async fn create_load_balancer(&self, req: &LoadBalancerRequest) -> Result<String, CloudError>;
    async fn update_load_balancer(
        &self,
        id: &str,
        req: &LoadBalancerRequest,
    ) -> Result<(), CloudError>;
    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError>;

    async fn tag_resources(
        &self,
        kind: TaggableResource,
        ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudError>;
    async fn untag_resources(
        &self,
        kind: TaggableResource,
        ids: &[String],
        keys: &[String],
    ) -> Result<(), CloudError>;

    async fn list_listeners(&self, load_balancer_id: &str) -> Result<Vec<SdkListener>, CloudError>;
    async fn create_listener(
        &self,
        load_balancer_id: &str,
        req: &ListenerRequest,
    ) -> Result<String, CloudError>;
    async fn update_listener(&self, id: &str, req: &ListenerRequest) -> Result<(), CloudError>;
    async fn delete_listener(&self, id: &str) -> Result<(), CloudError>;

    async fn list_listener_rules(
        &self,
        listener_id: &str,
    ) -> Result<Vec<SdkListenerRule>, CloudError>;
    async fn create_listener_rule(
        &self,
        listener_id: &str,
        req: &ListenerRuleRequest,
    ) -> Result<String, CloudError>;
    async fn update_listener_rule(
        &self,
        id: &str,
        req: &ListenerRuleRequest,
    ) -> Result<(), CloudError>;
    async fn delete_listener_rule(&self, id: &str) -> Result<(), CloudError>;

    async fn list_server_groups(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<SdkServerGroup>, CloudError>;
    async fn get_server_group(&self, id: &str) -> Result<SdkServerGroup, CloudError>;
    async fn create_server_group(&self, req: &ServerGroupRequest) -> Result<String, CloudError>;
    async fn update_server_group(
        &self,
        id: &str,
        req: &ServerGroupRequest,
    ) -> Result<(), CloudError>;
    async fn delete_server_group(&self, id: &str) -> Result<(), CloudError>;
    async fn list_servers(&self, server_group_id: &str) -> Result<Vec<BackendServer>, CloudError>;
    /// Returns the ID of an asynchronous job.
    async fn add_servers(
        &self,
        server_group_id: &str,
        servers: &[BackendServer],
    ) -> Result<String, CloudError>;
    /// Returns the ID of an asynchronous job.
    async fn remove_servers(
        &self,
        server_group_id: &str,
        servers: &[BackendServer],
    ) -> Result<String, CloudError>;
    async fn get_job(&self, job_id: &str) -> Result<JobStatus, CloudError>;

    async fn list_acls(&self, tags: &BTreeMap<String, String>) -> Result<Vec<SdkAcl>, CloudError>;
    async fn create_acl(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, CloudError>;
    async fn add_acl_entries(&self, acl_id: &str, entries: &[String]) -> Result<(), CloudError>;
    async fn remove_acl_entries(&self, acl_id: &str, entries: &[String])
    -> Result<(), CloudError>;
    async fn delete_acl(&self, id: &str) -> Result<(), CloudError>;
    async fn associate_acls(
        &self,
        listener_id: &str,
        acl_type: AclType,
        acl_ids: &[String],
    ) -> Result<(), CloudError>;
    async fn dissociate_acls(&self, listener_id: &str, acl_ids: &[String])
    -> Result<(), CloudError>;

    /// All certificates of the account.
    async fn list_certificates(&self) -> Result<Vec<SdkCertificate>, CloudError>;
    async fn upload_certificate(&self, req: &CertificateUpload) -> Result<String, CloudError>;
    async fn delete_certificate(&self, id: &str) -> Result<(), CloudError>;

    /// Zones in which the load balancer product is available.
    async fn list_zones(&self) -> Result<Vec<String>, CloudError>;
    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<SdkSubnet>, CloudError>;
}

/// Whether all `wanted` tags are present with the same value.
pub(crate) fn has_tags(tags: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| tags.get(k) == Some(v))
}
