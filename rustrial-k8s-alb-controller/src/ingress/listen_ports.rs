//! Listener endpoints required by an Ingress.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::networking::v1::Ingress;
use rustrial_k8s_alb_controller_apis::{ListenerProtocol, annotations::LISTEN_PORTS};
use serde_json::Value;

use super::{annotations, ingress_id};
use crate::errors::ControllerError;

/// Identity of a listener within a load balancer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PortProtocol {
    pub port: u16,
    pub protocol: ListenerProtocol,
}

impl PortProtocol {
    pub const HTTP: PortProtocol = PortProtocol {
        port: 80,
        protocol: ListenerProtocol::Http,
    };
    pub const HTTPS: PortProtocol = PortProtocol {
        port: 443,
        protocol: ListenerProtocol::Https,
    };

    pub fn new(port: u16, protocol: ListenerProtocol) -> Self {
        Self { port, protocol }
    }

    /// Stack ID of the listener, e.g. `443-https`.
    pub fn stack_id(&self) -> String {
        format!(
            "{}-{}",
            self.port,
            self.protocol.as_str().to_ascii_lowercase()
        )
    }

    /// HTTPS (TCP) and QUIC (UDP) can share a port, plain HTTP can't share it
    /// with either of them.
    pub fn conflicts_with(&self, other: &PortProtocol) -> bool {
        self.port == other.port
            && self.protocol != other.protocol
            && !(self.protocol.is_secure() && other.protocol.is_secure())
    }
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Parse the listen-ports annotation, e.g. `[{"HTTP":80},{"HTTPS":443}]`.
pub(crate) fn parse_listen_ports(
    object: &str,
    value: &str,
) -> Result<Vec<PortProtocol>, ControllerError> {
    let invalid = |message: String| ControllerError::InvalidAnnotation {
        object: object.to_string(),
        key: LISTEN_PORTS.to_string(),
        message,
    };
    let entries: Vec<BTreeMap<String, Value>> =
        serde_json::from_str(value).map_err(|e| invalid(format!("malformed JSON: {}", e)))?;
    if entries.is_empty() {
        return Err(invalid("no listen ports".to_string()));
    }
    let mut ports = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut iter = entry.into_iter();
        let (protocol, port) = match (iter.next(), iter.next()) {
            (Some(kv), None) => kv,
            _ => {
                return Err(invalid(
                    "every entry must be a map with exactly one protocol key".to_string(),
                ));
            }
        };
        let protocol = ListenerProtocol::parse(&protocol)
            .ok_or_else(|| invalid(format!("unsupported protocol {}", protocol)))?;
        let port = port
            .as_u64()
            .filter(|p| (1..=65535).contains(p))
            .ok_or_else(|| invalid(format!("port {} is outside of [1, 65535]", port)))?;
        let pp = PortProtocol::new(port as u16, protocol);
        if !ports.contains(&pp) {
            ports.push(pp);
        }
    }
    Ok(ports)
}

/// Listen ports of one Ingress: the explicit annotation, otherwise inferred
/// from TLS blocks (443/HTTPS) and rules without a TLS host (80/HTTP),
/// otherwise 80/HTTP.
pub(crate) fn ingress_listen_ports(ingress: &Ingress) -> Result<Vec<PortProtocol>, ControllerError> {
    if let Some(value) = annotations::get(ingress, LISTEN_PORTS) {
        return parse_listen_ports(&ingress_id(ingress), value);
    }
    let Some(spec) = ingress.spec.as_ref() else {
        return Ok(vec![PortProtocol::HTTP]);
    };
    let tls = spec.tls.as_deref().unwrap_or_default();
    // A TLS block without hosts covers every host.
    let tls_any_host = tls.iter().any(|t| t.hosts.as_deref().unwrap_or_default().is_empty());
    let tls_hosts: BTreeSet<&str> = tls
        .iter()
        .flat_map(|t| t.hosts.iter().flatten())
        .map(|h| h.as_str())
        .collect();
    let plain_http = spec.rules.iter().flatten().any(|r| {
        !tls_any_host
            && r.host
                .as_deref()
                .is_none_or(|h| !tls_hosts.contains(h))
    });
    let mut ports = vec![];
    if plain_http {
        ports.push(PortProtocol::HTTP);
    }
    if !tls.is_empty() {
        ports.push(PortProtocol::HTTPS);
    }
    if ports.is_empty() {
        ports.push(PortProtocol::HTTP);
    }
    Ok(ports)
}
