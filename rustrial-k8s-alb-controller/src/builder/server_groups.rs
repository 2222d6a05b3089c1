use k8s_openapi::{
    api::{
        core::v1::{Service, ServicePort},
        discovery::v1::EndpointSlice,
        networking::v1::Ingress,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use rustrial_k8s_alb_controller_apis::annotations;

use crate::{
    errors::ControllerError,
    ingress::{annotations as ann, backend::BackendLookup, ingress_id},
    model::{BackendProtocol, BackendServer, HealthCheck, ServerGroup, ServiceRef},
};

const DEFAULT_WEIGHT: u32 = 100;

fn find_port<'s>(service: &'s Service, port: &str) -> Option<&'s ServicePort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    match port.parse::<i32>() {
        Ok(number) => ports.iter().find(|p| p.port == number),
        Err(_) => ports.iter().find(|p| p.name.as_deref() == Some(port)),
    }
}

/// Ready servers and the number of not yet ready endpoint addresses of a service port.
pub(crate) fn servers(port: &ServicePort, slices: &[EndpointSlice]) -> (Vec<BackendServer>, usize) {
    let port_name = port.name.as_deref().unwrap_or_default();
    let mut servers = vec![];
    let mut pending = 0;
    for slice in slices {
        let target = slice
            .ports
            .iter()
            .flatten()
            .find(|p| p.name.as_deref().unwrap_or_default() == port_name)
            .and_then(|p| p.port)
            .or(match &port.target_port {
                Some(IntOrString::Int(n)) => Some(*n),
                None => Some(port.port),
                _ => None,
            });
        let Some(target) = target.and_then(|p| u16::try_from(p).ok()) else {
            continue;
        };
        for endpoint in &slice.endpoints {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if ready {
                servers.extend(endpoint.addresses.iter().map(|ip| BackendServer {
                    ip: ip.clone(),
                    port: target,
                    weight: DEFAULT_WEIGHT,
                }));
            } else {
                pending += endpoint.addresses.len();
            }
        }
    }
    servers.sort();
    servers.dedup();
    (servers, pending)
}

fn health_check(ingress: &Ingress) -> Result<HealthCheck, ControllerError> {
    let mut hc = HealthCheck::default();
    if let Some(enabled) = ann::parse_bool(ingress, annotations::HEALTHCHECK_ENABLED)? {
        hc.enabled = enabled;
    }
    if let Some(path) = ann::get(ingress, annotations::HEALTHCHECK_PATH) {
        hc.path = path.to_string();
    }
    if let Some(protocol) = ann::get(ingress, annotations::HEALTHCHECK_PROTOCOL) {
        hc.protocol = BackendProtocol::parse(protocol).ok_or_else(|| {
            ControllerError::InvalidAnnotation {
                object: ingress_id(ingress),
                key: annotations::HEALTHCHECK_PROTOCOL.to_string(),
                message: format!("unsupported protocol {}", protocol),
            }
        })?;
    }
    if let Some(v) = ann::parse(ingress, annotations::HEALTHCHECK_INTERVAL)? {
        hc.interval_seconds = v;
    }
    if let Some(v) = ann::parse(ingress, annotations::HEALTHY_THRESHOLD)? {
        hc.healthy_threshold = v;
    }
    if let Some(v) = ann::parse(ingress, annotations::UNHEALTHY_THRESHOLD)? {
        hc.unhealthy_threshold = v;
    }
    Ok(hc)
}

/// Server group of a service port, configured by the annotations of the
/// first group member referencing it.
pub(crate) async fn build_server_group(
    backends: &dyn BackendLookup,
    service_ref: &ServiceRef,
    ingress: &Ingress,
) -> Result<ServerGroup, ControllerError> {
    let object = ingress_id(ingress);
    let invalid = |message: String| ControllerError::InvalidBackend {
        object: object.clone(),
        message,
    };
    let service = backends
        .service(&service_ref.namespace, &service_ref.name)
        .await?
        .ok_or_else(|| invalid(format!("service {}/{} not found", service_ref.namespace, service_ref.name)))?;
    let port = find_port(&service, &service_ref.port)
        .ok_or_else(|| invalid(format!("service {} has no such port", service_ref)))?;
    let slices = backends
        .endpoint_slices(&service_ref.namespace, &service_ref.name)
        .await?;
    let (servers, pending_endpoints) = servers(port, &slices);
    let protocol = match ann::get(ingress, annotations::BACKEND_PROTOCOL) {
        Some(v) => BackendProtocol::parse(v).ok_or_else(|| ControllerError::InvalidAnnotation {
            object: object.clone(),
            key: annotations::BACKEND_PROTOCOL.to_string(),
            message: format!("unsupported protocol {}", v),
        })?,
        None => BackendProtocol::Http,
    };
    Ok(ServerGroup {
        name: format!(
            "k8s-{}-{}-{}",
            service_ref.namespace, service_ref.name, service_ref.port
        ),
        service: service_ref.clone(),
        reuse_id: service
            .annotations()
            .get(annotations::SERVER_GROUP_ID)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
        protocol,
        health_check: health_check(ingress)?,
        servers,
        pending_endpoints,
        tags: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::{annotations::tests::ingress_with, backend::tests::StaticBackends};

    fn svc(port: &str) -> ServiceRef {
        ServiceRef {
            namespace: "default".into(),
            name: "web".into(),
            port: port.into(),
        }
    }

    #[tokio::test]
    async fn ready_endpoints_become_servers() {
        let backends = StaticBackends::default().with_service(
            "default",
            "web",
            &[("10.0.0.2", true), ("10.0.0.1", true), ("10.0.0.3", false)],
        );
        let ingress = ingress_with(&[
            (annotations::HEALTHCHECK_ENABLED, "true"),
            (annotations::HEALTHCHECK_PATH, "/healthz"),
            (annotations::BACKEND_PROTOCOL, "gRPC"),
        ]);
        for port in ["80", "http"] {
            let sg = build_server_group(&backends, &svc(port), &ingress).await.unwrap();
            let ips: Vec<&str> = sg.servers.iter().map(|s| s.ip.as_str()).collect();
            assert_eq!(vec!["10.0.0.1", "10.0.0.2"], ips);
            assert!(sg.servers.iter().all(|s| s.port == 8080 && s.weight == 100));
            assert_eq!(1, sg.pending_endpoints);
            assert_eq!(BackendProtocol::Grpc, sg.protocol);
            assert!(sg.health_check.enabled);
            assert_eq!("/healthz", sg.health_check.path);
            assert_eq!(None, sg.reuse_id);
        }
    }

    #[tokio::test]
    async fn console_managed_server_group() {
        let mut backends = StaticBackends::default().with_service("default", "web", &[]);
        backends.services[0].metadata.annotations = Some(
            [(annotations::SERVER_GROUP_ID.to_string(), "sgp-console".to_string())]
                .into_iter()
                .collect(),
        );
        let sg = build_server_group(&backends, &svc("80"), &ingress_with(&[]))
            .await
            .unwrap();
        assert_eq!(Some("sgp-console".to_string()), sg.reuse_id);
        assert!(sg.servers.is_empty());
    }

    #[tokio::test]
    async fn missing_service_or_port() {
        let backends = StaticBackends::default().with_service("default", "web", &[]);
        let e = build_server_group(&backends, &svc("8443"), &ingress_with(&[]))
            .await
            .unwrap_err();
        assert!(matches!(e, ControllerError::InvalidBackend { .. }));
        let mut missing = svc("80");
        missing.name = "nope".into();
        let e = build_server_group(&backends, &missing, &ingress_with(&[]))
            .await
            .unwrap_err();
        assert!(matches!(e, ControllerError::InvalidBackend { .. }));
    }
}
