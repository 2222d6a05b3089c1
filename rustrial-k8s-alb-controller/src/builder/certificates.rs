//! Certificates of HTTPS and QUIC listeners.
//!
//! Hosts of TLS blocks with a secret reference are served by a certificate
//! uploaded from that secret. All other hosts are looked up among the
//! certificates already issued in the cloud account.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Secret,
    chrono::{DateTime, Utc},
};
use kube::ResourceExt;

use crate::{
    cloud::{CloudProvider, SdkCertificate, retry::retry_call},
    errors::ControllerError,
    model::Certificate,
};

const TLS_CERT: &'static str = "tls.crt";
const TLS_KEY: &'static str = "tls.key";

/// Looks up issued certificates serving a set of hosts.
#[async_trait]
pub(crate) trait CertDiscovery: Send + Sync {
    /// IDs of the certificates serving `hosts`, fails for the first host
    /// without certificate.
    async fn discover(&self, hosts: &BTreeSet<String>) -> Result<BTreeSet<String>, ControllerError>;
}

/// Whether certificate `domain` (exact or leftmost wildcard) covers `host`.
pub(crate) fn domain_matches(domain: &str, host: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    match domain.strip_prefix("*.") {
        Some(suffix) => {
            domain.split('.').count() == host.split('.').count()
                && host
                    .split_once('.')
                    .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix)
        }
        None => domain == host,
    }
}

/// The best certificate for `host`: exact matches before wildcard matches,
/// then the latest expiry, then the smallest ID. Expired certificates are ignored.
pub(crate) fn select_certificate<'c>(
    certificates: &'c [SdkCertificate],
    host: &str,
    now: DateTime<Utc>,
) -> Option<&'c SdkCertificate> {
    certificates
        .iter()
        .filter(|c| c.expires_at > now)
        .filter_map(|c| {
            let exact = c.domains.iter().any(|d| d.eq_ignore_ascii_case(host));
            let wildcard = c.domains.iter().any(|d| domain_matches(d, host));
            (exact || wildcard).then_some((exact, c))
        })
        .max_by(|(a_exact, a), (b_exact, b)| {
            a_exact
                .cmp(b_exact)
                .then(a.expires_at.cmp(&b.expires_at))
                .then(b.id.cmp(&a.id))
        })
        .map(|(_, c)| c)
}

pub(crate) struct CloudCertDiscovery<'a> {
    cloud: &'a dyn CloudProvider,
}

impl<'a> CloudCertDiscovery<'a> {
    pub fn new(cloud: &'a dyn CloudProvider) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl CertDiscovery for CloudCertDiscovery<'_> {
    async fn discover(&self, hosts: &BTreeSet<String>) -> Result<BTreeSet<String>, ControllerError> {
        if hosts.is_empty() {
            return Ok(BTreeSet::new());
        }
        let cloud = self.cloud;
        let certificates = retry_call("list certificates", || cloud.list_certificates()).await?;
        let now = Utc::now();
        hosts
            .iter()
            .map(|host| {
                select_certificate(&certificates, host, now)
                    .map(|c| c.id.clone())
                    .ok_or_else(|| ControllerError::CertificateNotFound(host.clone()))
            })
            .collect()
    }
}

/// Certificate resource for a `kubernetes.io/tls` Secret.
pub(crate) fn secret_certificate(
    object: &str,
    secret: &Secret,
    hosts: Vec<String>,
) -> Result<Certificate, ControllerError> {
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();
    let data: BTreeMap<&str, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    let field = |key: &str| {
        data.get(key).cloned().filter(|v| !v.is_empty()).ok_or_else(|| {
            ControllerError::InvalidBackend {
                object: object.to_string(),
                message: format!("secret {}/{} has no {}", namespace, name, key),
            }
        })
    };
    Ok(Certificate {
        name: format!(
            "{}-{}-{}",
            namespace,
            name,
            secret.resource_version().unwrap_or_default()
        ),
        certificate_pem: field(TLS_CERT)?,
        private_key_pem: field(TLS_KEY)?,
        namespace: namespace.clone(),
        secret_name: name.clone(),
        hosts,
        tags: Default::default(),
    })
}
