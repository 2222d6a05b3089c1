//! Ingress side of the engine: annotations, listen-port planning, group
//! membership and the lookup of Kubernetes backends.

pub(crate) mod annotations;
pub(crate) mod backend;
pub(crate) mod group;
pub(crate) mod listen_ports;

use std::collections::BTreeSet;

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

/// `namespace/name` of an Ingress, used in logs, errors and the member error map.
pub(crate) fn ingress_id(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    )
}

pub(crate) fn is_deleted(ingress: &Ingress) -> bool {
    ingress.metadata.deletion_timestamp.is_some()
}

/// Names of the Services the backends of `ingress` point to.
pub(crate) fn referenced_services(ingress: &Ingress) -> BTreeSet<&str> {
    let Some(spec) = ingress.spec.as_ref() else {
        return BTreeSet::new();
    };
    let paths = spec
        .rules
        .iter()
        .flatten()
        .filter_map(|r| r.http.as_ref())
        .flat_map(|h| h.paths.iter())
        .map(|p| &p.backend);
    spec.default_backend
        .iter()
        .chain(paths)
        .filter_map(|b| b.service.as_ref())
        .map(|s| s.name.as_str())
        .collect()
}
