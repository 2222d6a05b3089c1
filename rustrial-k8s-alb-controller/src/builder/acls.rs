use rustrial_k8s_alb_controller_apis::ListenerSpec;

use crate::{
    errors::ControllerError,
    ingress::listen_ports::PortProtocol,
    model::{Acl, Token},
};

/// Access control list of a declared listener, `None` unless an ACL type is set.
pub(crate) fn build_acl(
    load_balancer_name: &str,
    spec: &ListenerSpec,
    listener: Token,
) -> Result<Option<Acl>, ControllerError> {
    let Some(config) = spec.acl_config.as_ref() else {
        return Ok(None);
    };
    let Some(acl_type) = config.acl_type else {
        return Ok(None);
    };
    let pp = PortProtocol::new(spec.port, spec.protocol);
    if !config.acl_entries.is_empty() && !config.acl_ids.is_empty() {
        return Err(ControllerError::AclConflict(pp.to_string()));
    }
    let name = if config.acl_entries.is_empty() {
        None
    } else {
        Some(
            config
                .acl_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("{}-{}", load_balancer_name, pp.stack_id())),
        )
    };
    let mut entries = config.acl_entries.clone();
    entries.sort();
    entries.dedup();
    Ok(Some(Acl {
        listener,
        acl_type,
        name,
        entries,
        acl_ids: config.acl_ids.clone(),
        tags: Default::default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustrial_k8s_alb_controller_apis::{AclConfig, AclType, ListenerProtocol};

    fn spec(entries: &[&str], ids: &[&str], acl_type: Option<AclType>) -> ListenerSpec {
        ListenerSpec {
            port: 443,
            protocol: ListenerProtocol::Https,
            description: None,
            idle_timeout: None,
            request_timeout: None,
            certificates: vec![],
            acl_config: Some(AclConfig {
                acl_type,
                acl_name: None,
                acl_entries: entries.iter().map(|v| v.to_string()).collect(),
                acl_ids: ids.iter().map(|v| v.to_string()).collect(),
            }),
        }
    }

    #[test]
    fn entries_get_a_derived_name() {
        let acl = build_acl("lb", &spec(&["10.0.0.0/8", "10.0.0.0/8"], &[], Some(AclType::White)), "l".into())
            .unwrap()
            .unwrap();
        assert_eq!(Some("lb-443-https".to_string()), acl.name);
        assert_eq!(vec!["10.0.0.0/8".to_string()], acl.entries);
    }

    #[test]
    fn derived_names_differ_per_protocol() {
        let https = spec(&["10.0.0.0/8"], &[], Some(AclType::White));
        let mut quic = https.clone();
        quic.protocol = ListenerProtocol::Quic;
        let name = |s: &ListenerSpec| build_acl("lb", s, "l".into()).unwrap().unwrap().name;
        assert_eq!(Some("lb-443-https".to_string()), name(&https));
        assert_eq!(Some("lb-443-quic".to_string()), name(&quic));
    }

    #[test]
    fn external_acls_are_unnamed() {
        let acl = build_acl("lb", &spec(&[], &["acl-1"], Some(AclType::Black)), "l".into())
            .unwrap()
            .unwrap();
        assert_eq!(None, acl.name);
        assert_eq!(vec!["acl-1".to_string()], acl.acl_ids);
    }

    #[test]
    fn no_type_no_acl() {
        assert!(build_acl("lb", &spec(&["10.0.0.0/8"], &[], None), "l".into())
            .unwrap()
            .is_none());
    }

    #[test]
    fn entries_and_ids_conflict() {
        let e = build_acl("lb", &spec(&["10.0.0.0/8"], &["acl-1"], Some(AclType::White)), "l".into())
            .unwrap_err();
        assert!(matches!(e, ControllerError::AclConflict(pp) if pp == "443/HTTPS"));
    }
}
