//! In-memory [`CloudProvider`], used as dry-run backend and as test double.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use rustrial_k8s_alb_controller_apis::AclType;

use super::*;

#[derive(Default)]
struct State {
    next_id: u64,
    mutations: u64,
    /// Number of `Running` answers before a job reports success.
    job_polls: u32,
    load_balancers: BTreeMap<String, SdkLoadBalancer>,
    listeners: BTreeMap<String, SdkListener>,
    rules: BTreeMap<String, SdkListenerRule>,
    server_groups: BTreeMap<String, SdkServerGroup>,
    servers: BTreeMap<String, BTreeSet<BackendServer>>,
    jobs: BTreeMap<String, u32>,
    acls: BTreeMap<String, SdkAcl>,
    certificates: BTreeMap<String, SdkCertificate>,
    zones: Vec<String>,
    subnets: Vec<(String, SdkSubnet)>,
    /// Errors returned by the next calls of an operation, in order.
    faults: BTreeMap<&'static str, Vec<CloudError>>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08}", prefix, self.next_id)
    }

    fn mutated(&mut self) {
        self.mutations += 1;
    }

    fn fault(&mut self, operation: &str) -> Result<(), CloudError> {
        match self.faults.get_mut(operation) {
            Some(errors) if !errors.is_empty() => Err(errors.remove(0)),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct InMemoryCloud {
    state: Mutex<State>,
}

fn not_found(what: &str, id: &str) -> CloudError {
    CloudError::NotFound(format!("{} {}", what, id))
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Default::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of mutating calls served so far.
    pub fn mutations(&self) -> u64 {
        self.state().mutations
    }

    /// Fail the next call of `operation` (e.g. `create_listener`) with `error`.
    pub fn fail_next(&self, operation: &'static str, error: CloudError) {
        self.state().faults.entry(operation).or_default().push(error);
    }

    pub fn set_job_polls(&self, polls: u32) {
        self.state().job_polls = polls;
    }

    pub fn add_zone(&self, zone_id: &str) {
        self.state().zones.push(zone_id.to_string());
    }

    pub fn add_subnet(&self, vpc_id: &str, subnet: SdkSubnet) {
        self.state().subnets.push((vpc_id.to_string(), subnet));
    }

    pub fn insert_load_balancer(&self, lb: SdkLoadBalancer) {
        self.state().load_balancers.insert(lb.id.clone(), lb);
    }

    pub fn insert_listener(&self, listener: SdkListener) {
        self.state()
            .listeners
            .insert(listener.id.clone(), listener);
    }

    pub fn insert_certificate(&self, certificate: SdkCertificate) {
        self.state()
            .certificates
            .insert(certificate.id.clone(), certificate);
    }

    pub fn load_balancers(&self) -> Vec<SdkLoadBalancer> {
        self.state().load_balancers.values().cloned().collect()
    }

    pub fn listeners(&self) -> Vec<SdkListener> {
        self.state().listeners.values().cloned().collect()
    }

    pub fn rules(&self) -> Vec<SdkListenerRule> {
        self.state().rules.values().cloned().collect()
    }

    pub fn server_groups(&self) -> Vec<SdkServerGroup> {
        self.state().server_groups.values().cloned().collect()
    }

    pub fn servers(&self, server_group_id: &str) -> Vec<BackendServer> {
        self.state()
            .servers
            .get(server_group_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn acls(&self) -> Vec<SdkAcl> {
        self.state().acls.values().cloned().collect()
    }

    pub fn certificates(&self) -> Vec<SdkCertificate> {
        self.state().certificates.values().cloned().collect()
    }
}

#[async_trait]
impl CloudProvider for InMemoryCloud {
    async fn list_load_balancers(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<SdkLoadBalancer>, CloudError> {
        Ok(self
            .state()
            .load_balancers
            .values()
            .filter(|lb| has_tags(&lb.tags, tags))
            .cloned()
            .collect())
    }

    async fn get_load_balancer(&self, id: &str) -> Result<SdkLoadBalancer, CloudError> {
        let mut state = self.state();
        let lb = state
            .load_balancers
            .get_mut(id)
            .ok_or_else(|| not_found("load balancer", id))?;
        let observed = lb.clone();
        // provisioning finishes after it has been observed once
        if lb.state == LoadBalancerState::Provisioning {
            lb.state = LoadBalancerState::Active;
        }
        Ok(observed)
    }

    async fn create_load_balancer(&self, req: &LoadBalancerRequest) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("create_load_balancer")?;
        state.mutated();
        let id = state.next_id("alb");
        state.load_balancers.insert(
            id.clone(),
            SdkLoadBalancer {
                id: id.clone(),
                name: req.name.clone(),
                dns_name: format!("{}.alb.example.com", id),
                state: LoadBalancerState::Provisioning,
                address_type: req.address_type,
                edition: req.edition.clone(),
                zone_mappings: req.zone_mappings.clone(),
                deletion_protection: req.deletion_protection,
                tags: req.tags.clone(),
            },
        );
        Ok(id)
    }

    async fn update_load_balancer(
        &self,
        id: &str,
        req: &LoadBalancerRequest,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let lb = state
            .load_balancers
            .get_mut(id)
            .ok_or_else(|| not_found("load balancer", id))?;
        lb.name = req.name.clone();
        lb.deletion_protection = req.deletion_protection;
        lb.zone_mappings = req.zone_mappings.clone();
        Ok(())
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        match state.load_balancers.get(id) {
            Some(lb) if lb.deletion_protection => {
                return Err(CloudError::Other(format!(
                    "deletion protection is enabled for {}",
                    id
                )));
            }
            Some(_) => (),
            None => return Err(not_found("load balancer", id)),
        }
        state.load_balancers.remove(id);
        let listeners: Vec<String> = state
            .listeners
            .values()
            .filter(|l| l.load_balancer_id == id)
            .map(|l| l.id.clone())
            .collect();
        for listener in listeners {
            state.listeners.remove(&listener);
            state.rules.retain(|_, r| r.listener_id != listener);
        }
        Ok(())
    }

    async fn tag_resources(
        &self,
        kind: TaggableResource,
        ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.fault("tag_resources")?;
        state.mutated();
        for id in ids {
            let target = match kind {
                TaggableResource::LoadBalancer => state.load_balancers.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::Listener => state.listeners.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::ServerGroup => state.server_groups.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::Acl => state.acls.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::Certificate => state.certificates.get_mut(id).map(|r| &mut r.tags),
            };
            let target = target.ok_or_else(|| not_found("resource", id))?;
            target.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    async fn untag_resources(
        &self,
        kind: TaggableResource,
        ids: &[String],
        keys: &[String],
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        for id in ids {
            let target = match kind {
                TaggableResource::LoadBalancer => state.load_balancers.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::Listener => state.listeners.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::ServerGroup => state.server_groups.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::Acl => state.acls.get_mut(id).map(|r| &mut r.tags),
                TaggableResource::Certificate => state.certificates.get_mut(id).map(|r| &mut r.tags),
            };
            let target = target.ok_or_else(|| not_found("resource", id))?;
            target.retain(|k, _| !keys.contains(k));
        }
        Ok(())
    }

    async fn list_listeners(&self, load_balancer_id: &str) -> Result<Vec<SdkListener>, CloudError> {
        Ok(self
            .state()
            .listeners
            .values()
            .filter(|l| l.load_balancer_id == load_balancer_id)
            .cloned()
            .collect())
    }

    async fn create_listener(
        &self,
        load_balancer_id: &str,
        req: &ListenerRequest,
    ) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("create_listener")?;
        if !state.load_balancers.contains_key(load_balancer_id) {
            return Err(not_found("load balancer", load_balancer_id));
        }
        if state
            .listeners
            .values()
            .any(|l| {
                l.load_balancer_id == load_balancer_id
                    && l.port == req.port
                    // HTTPS and QUIC listeners may share a port
                    && !(l.protocol != req.protocol && l.protocol.is_secure() && req.protocol.is_secure())
            })
        {
            return Err(CloudError::AlreadyExists(format!(
                "listener port {}",
                req.port
            )));
        }
        state.mutated();
        let id = state.next_id("lsn");
        state.listeners.insert(
            id.clone(),
            SdkListener {
                id: id.clone(),
                load_balancer_id: load_balancer_id.to_string(),
                port: req.port,
                protocol: req.protocol,
                description: req.description.clone(),
                idle_timeout: req.idle_timeout,
                request_timeout: req.request_timeout,
                certificates: req.certificates.clone(),
                acl: None,
                tags: req.tags.clone(),
            },
        );
        Ok(id)
    }

    async fn update_listener(&self, id: &str, req: &ListenerRequest) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let listener = state
            .listeners
            .get_mut(id)
            .ok_or_else(|| not_found("listener", id))?;
        listener.description = req.description.clone();
        listener.idle_timeout = req.idle_timeout;
        listener.request_timeout = req.request_timeout;
        listener.certificates = req.certificates.clone();
        Ok(())
    }

    async fn delete_listener(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        state
            .listeners
            .remove(id)
            .ok_or_else(|| not_found("listener", id))?;
        state.rules.retain(|_, r| r.listener_id != id);
        Ok(())
    }

    async fn list_listener_rules(
        &self,
        listener_id: &str,
    ) -> Result<Vec<SdkListenerRule>, CloudError> {
        Ok(self
            .state()
            .rules
            .values()
            .filter(|r| r.listener_id == listener_id)
            .cloned()
            .collect())
    }

    async fn create_listener_rule(
        &self,
        listener_id: &str,
        req: &ListenerRuleRequest,
    ) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("create_listener_rule")?;
        if !state.listeners.contains_key(listener_id) {
            return Err(not_found("listener", listener_id));
        }
        if state
            .rules
            .values()
            .any(|r| r.listener_id == listener_id && r.priority == req.priority)
        {
            return Err(CloudError::AlreadyExists(format!(
                "rule priority {}",
                req.priority
            )));
        }
        state.mutated();
        let id = state.next_id("rule");
        state.rules.insert(
            id.clone(),
            SdkListenerRule {
                id: id.clone(),
                listener_id: listener_id.to_string(),
                priority: req.priority,
                name: req.name.clone(),
                conditions: req.conditions.clone(),
                actions: req.actions.clone(),
            },
        );
        Ok(id)
    }

    async fn update_listener_rule(
        &self,
        id: &str,
        req: &ListenerRuleRequest,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let rule = state
            .rules
            .get_mut(id)
            .ok_or_else(|| not_found("listener rule", id))?;
        rule.priority = req.priority;
        rule.name = req.name.clone();
        rule.conditions = req.conditions.clone();
        rule.actions = req.actions.clone();
        Ok(())
    }

    async fn delete_listener_rule(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        state
            .rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("listener rule", id))
    }

    async fn list_server_groups(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<SdkServerGroup>, CloudError> {
        Ok(self
            .state()
            .server_groups
            .values()
            .filter(|sg| has_tags(&sg.tags, tags))
            .cloned()
            .collect())
    }

    async fn get_server_group(&self, id: &str) -> Result<SdkServerGroup, CloudError> {
        self.state()
            .server_groups
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("server group", id))
    }

    async fn create_server_group(&self, req: &ServerGroupRequest) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("create_server_group")?;
        state.mutated();
        let id = state.next_id("sgp");
        state.server_groups.insert(
            id.clone(),
            SdkServerGroup {
                id: id.clone(),
                name: req.name.clone(),
                protocol: req.protocol,
                health_check: req.health_check.clone(),
                tags: req.tags.clone(),
            },
        );
        Ok(id)
    }

    async fn update_server_group(
        &self,
        id: &str,
        req: &ServerGroupRequest,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let sg = state
            .server_groups
            .get_mut(id)
            .ok_or_else(|| not_found("server group", id))?;
        sg.name = req.name.clone();
        sg.health_check = req.health_check.clone();
        Ok(())
    }

    async fn delete_server_group(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        if state
            .rules
            .values()
            .flat_map(|r| r.actions.iter())
            .any(|a| match a {
                RuleAction::ForwardGroup { server_groups } => {
                    server_groups.iter().any(|t| t.server_group == id)
                }
                _ => false,
            })
        {
            return Err(CloudError::IncorrectStatus(format!(
                "server group {} is still in use",
                id
            )));
        }
        state.servers.remove(id);
        state
            .server_groups
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("server group", id))
    }

    async fn list_servers(&self, server_group_id: &str) -> Result<Vec<BackendServer>, CloudError> {
        Ok(self.servers(server_group_id))
    }

    async fn add_servers(
        &self,
        server_group_id: &str,
        servers: &[BackendServer],
    ) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("add_servers")?;
        state.mutated();
        state
            .servers
            .entry(server_group_id.to_string())
            .or_default()
            .extend(servers.iter().cloned());
        let id = state.next_id("job");
        let polls = state.job_polls;
        state.jobs.insert(id.clone(), polls);
        Ok(id)
    }

    async fn remove_servers(
        &self,
        server_group_id: &str,
        servers: &[BackendServer],
    ) -> Result<String, CloudError> {
        let mut state = self.state();
        state.mutated();
        if let Some(existing) = state.servers.get_mut(server_group_id) {
            for s in servers {
                existing.remove(s);
            }
        }
        let id = state.next_id("job");
        let polls = state.job_polls;
        state.jobs.insert(id.clone(), polls);
        Ok(id)
    }

    async fn get_job(&self, job_id: &str) -> Result<JobStatus, CloudError> {
        let mut state = self.state();
        let remaining = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| not_found("job", job_id))?;
        if *remaining == 0 {
            Ok(JobStatus::Succeeded)
        } else {
            *remaining -= 1;
            Ok(JobStatus::Running)
        }
    }

    async fn list_acls(&self, tags: &BTreeMap<String, String>) -> Result<Vec<SdkAcl>, CloudError> {
        Ok(self
            .state()
            .acls
            .values()
            .filter(|acl| has_tags(&acl.tags, tags))
            .cloned()
            .collect())
    }

    async fn create_acl(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("create_acl")?;
        state.mutated();
        let id = state.next_id("acl");
        state.acls.insert(
            id.clone(),
            SdkAcl {
                id: id.clone(),
                name: name.to_string(),
                entries: vec![],
                tags: tags.clone(),
            },
        );
        Ok(id)
    }

    async fn add_acl_entries(&self, acl_id: &str, entries: &[String]) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let acl = state
            .acls
            .get_mut(acl_id)
            .ok_or_else(|| not_found("acl", acl_id))?;
        for e in entries {
            if !acl.entries.contains(e) {
                acl.entries.push(e.clone());
            }
        }
        acl.entries.sort();
        Ok(())
    }

    async fn remove_acl_entries(
        &self,
        acl_id: &str,
        entries: &[String],
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let acl = state
            .acls
            .get_mut(acl_id)
            .ok_or_else(|| not_found("acl", acl_id))?;
        acl.entries.retain(|e| !entries.contains(e));
        Ok(())
    }

    async fn delete_acl(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        if state
            .listeners
            .values()
            .filter_map(|l| l.acl.as_ref())
            .any(|a| a.acl_ids.iter().any(|v| v == id))
        {
            return Err(CloudError::IncorrectStatus(format!(
                "acl {} is still associated",
                id
            )));
        }
        state
            .acls
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("acl", id))
    }

    async fn associate_acls(
        &self,
        listener_id: &str,
        acl_type: AclType,
        acl_ids: &[String],
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let listener = state
            .listeners
            .get_mut(listener_id)
            .ok_or_else(|| not_found("listener", listener_id))?;
        let acl = listener.acl.get_or_insert_with(|| SdkListenerAcl {
            acl_type,
            acl_ids: vec![],
        });
        if acl.acl_type != acl_type && !acl.acl_ids.is_empty() {
            return Err(CloudError::Other(format!(
                "listener {} already has {:?} acls",
                listener_id, acl.acl_type
            )));
        }
        acl.acl_type = acl_type;
        for id in acl_ids {
            if !acl.acl_ids.contains(id) {
                acl.acl_ids.push(id.clone());
            }
        }
        Ok(())
    }

    async fn dissociate_acls(
        &self,
        listener_id: &str,
        acl_ids: &[String],
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        let listener = state
            .listeners
            .get_mut(listener_id)
            .ok_or_else(|| not_found("listener", listener_id))?;
        if let Some(acl) = &mut listener.acl {
            acl.acl_ids.retain(|id| !acl_ids.contains(id));
            if acl.acl_ids.is_empty() {
                listener.acl = None;
            }
        }
        Ok(())
    }

    async fn list_certificates(&self) -> Result<Vec<SdkCertificate>, CloudError> {
        Ok(self.certificates())
    }

    async fn upload_certificate(&self, req: &CertificateUpload) -> Result<String, CloudError> {
        let mut state = self.state();
        state.fault("upload_certificate")?;
        state.mutated();
        let id = state.next_id("cert");
        state.certificates.insert(
            id.clone(),
            SdkCertificate {
                id: id.clone(),
                name: req.name.clone(),
                domains: vec![],
                expires_at: Utc::now() + k8s_openapi::chrono::Duration::days(90),
                tags: req.tags.clone(),
            },
        );
        Ok(id)
    }

    async fn delete_certificate(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.mutated();
        state
            .certificates
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("certificate", id))
    }

    async fn list_zones(&self) -> Result<Vec<String>, CloudError> {
        Ok(self.state().zones.clone())
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<SdkSubnet>, CloudError> {
        Ok(self
            .state()
            .subnets
            .iter()
            .filter(|(vpc, _)| vpc == vpc_id)
            .map(|(_, s)| s.clone())
            .collect())
    }
}
