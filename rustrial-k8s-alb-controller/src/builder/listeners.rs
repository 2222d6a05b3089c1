use std::collections::BTreeSet;

use rustrial_k8s_alb_controller_apis::ListenerSpec;

use crate::{errors::ControllerError, ingress::listen_ports::PortProtocol};

/// A listener of the desired load balancer, declared by the configuration
/// (`spec` is set) or inferred from the group members.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PlannedListener<'c> {
    pub pp: PortProtocol,
    pub spec: Option<&'c ListenerSpec>,
}

fn conflict(existing: &PortProtocol, requested: &PortProtocol) -> ControllerError {
    ControllerError::ListenerProtocolConflict {
        port: requested.port,
        existing: existing.to_string(),
        requested: requested.to_string(),
    }
}

/// Declared listeners are kept as they are (and in their order), inferred
/// listeners are appended in (port, protocol) order unless already declared.
pub(crate) fn merge_listeners<'c>(
    declared: &'c [ListenerSpec],
    inferred: impl IntoIterator<Item = PortProtocol>,
) -> Result<Vec<PlannedListener<'c>>, ControllerError> {
    let mut planned: Vec<PlannedListener<'c>> = Vec::with_capacity(declared.len());
    for spec in declared {
        let pp = PortProtocol::new(spec.port, spec.protocol);
        if let Some(existing) = planned.iter().find(|p| p.pp == pp || p.pp.conflicts_with(&pp)) {
            return Err(conflict(&existing.pp, &pp));
        }
        planned.push(PlannedListener {
            pp,
            spec: Some(spec),
        });
    }
    let inferred: BTreeSet<PortProtocol> = inferred.into_iter().collect();
    for pp in inferred {
        if planned.iter().any(|p| p.pp == pp) {
            continue;
        }
        if let Some(existing) = planned.iter().find(|p| p.pp.conflicts_with(&pp)) {
            return Err(conflict(&existing.pp, &pp));
        }
        planned.push(PlannedListener { pp, spec: None });
    }
    Ok(planned)
}
