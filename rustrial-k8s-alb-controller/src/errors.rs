use crate::cloud::CloudError;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// A resource with the same type and ID was already added to the stack.
    #[error("duplicate resource {0}")]
    DuplicateResource(String),
    /// A dependency edge references a resource which is not part of the stack.
    #[error("unknown resource {0}")]
    UnknownResource(String),
    /// The stack's dependency graph is not acyclic.
    #[error("dependency cycle detected among {0}")]
    CycleDetected(String),
    /// The status of a resource was written twice within one apply pass.
    #[error("status of resource {0} has already been set")]
    StatusAlreadySet(String),
    /// A resource reference was resolved before its target was applied.
    #[error("unresolved reference to resource {0}")]
    UnresolvedReference(String),
    /// Two group members declare the same explicit order.
    #[error("{first} and {second} have the same explicit group order {order}")]
    GroupOrderConflict {
        first: String,
        second: String,
        order: i64,
    },
    #[error("invalid annotation {key} on {object}: {message}")]
    InvalidAnnotation {
        object: String,
        key: String,
        message: String,
    },
    #[error("conflicting listener protocols on port {port}: {existing} and {requested}")]
    ListenerProtocolConflict {
        port: u16,
        existing: String,
        requested: String,
    },
    #[error("listener {0}: aclEntries and aclIds must not be set at the same time")]
    AclConflict(String),
    #[error("no certificate found for host {0}")]
    CertificateNotFound(String),
    #[error("invalid path {path} on {object}: {message}")]
    InvalidPath {
        object: String,
        path: String,
        message: String,
    },
    #[error("invalid backend on {object}: {message}")]
    InvalidBackend { object: String, message: String },
    /// Weighted canaries of one host and path take more than all traffic.
    #[error("canary weights for host {host} and path {path} add up to {weight}, at most 100 is allowed")]
    CanaryWeightExceeded {
        host: String,
        path: String,
        weight: u32,
    },
    #[error("{0}")]
    NoSubnets(String),
    /// A reused cloud resource is owned by a different cluster or configuration.
    #[error("{0}")]
    OwnershipConflict(String),
    #[error(
        "listener {port}/{protocol} already exists on load balancer {load_balancer}, set spec.config.forceOverride to true and retry"
    )]
    ListenerAlreadyExists {
        load_balancer: String,
        port: u16,
        protocol: String,
    },
    #[error("{0}")]
    Cloud(#[from] CloudError),
    #[error("asynchronous job {job} failed: {message}")]
    JobFailed { job: String, message: String },
    #[error("timeout while waiting for {0}")]
    Timeout(String),
    /// Signals a retry wrapper to try the failed call again.
    #[error("try again: {0}")]
    TryAgain(String),
    /// Some backend endpoints are not ready yet, reconcile again soon.
    #[error("retry potential ready endpoints")]
    RetryPotentialReadyEndpoints,
    #[error("panic during reconciliation: {message}\n{backtrace}")]
    Panic { message: String, backtrace: String },
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    /// Configuration errors will not go away by retrying without a change
    /// of the Kubernetes objects involved.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::GroupOrderConflict { .. }
            | ControllerError::InvalidAnnotation { .. }
            | ControllerError::ListenerProtocolConflict { .. }
            | ControllerError::AclConflict(_)
            | ControllerError::CertificateNotFound(_)
            | ControllerError::InvalidPath { .. }
            | ControllerError::InvalidBackend { .. }
            | ControllerError::CanaryWeightExceeded { .. }
            | ControllerError::NoSubnets(_)
            | ControllerError::OwnershipConflict(_)
            | ControllerError::ListenerAlreadyExists { .. } => false,
            _ => true,
        }
    }

    /// Whether a retry wrapper should repeat the failed call.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ControllerError::TryAgain(_) => true,
            ControllerError::Cloud(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short CamelCase reason used for events and conditions.
    pub(crate) fn reason(&self) -> &'static str {
        if self.is_temporary() {
            "ApplyFailed"
        } else {
            "InvalidConfiguration"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_temporary() {
        assert!(!ControllerError::AclConflict("443".into()).is_temporary());
        assert!(!ControllerError::CertificateNotFound("a.example.com".into()).is_temporary());
        let canary = ControllerError::CanaryWeightExceeded {
            host: "a.example.com".into(),
            path: "/".into(),
            weight: 120,
        };
        assert!(!canary.is_temporary());
        assert_eq!("InvalidConfiguration", canary.reason());
        assert!(ControllerError::Timeout("load balancer".into()).is_temporary());
        assert!(ControllerError::RetryPotentialReadyEndpoints.is_temporary());
    }

    #[test]
    fn retryable() {
        assert!(ControllerError::TryAgain("x".into()).is_retryable());
        assert!(ControllerError::Cloud(CloudError::Throttled("x".into())).is_retryable());
        assert!(!ControllerError::Cloud(CloudError::NotFound("x".into())).is_retryable());
        assert!(!ControllerError::Timeout("x".into()).is_retryable());
    }

    #[test]
    fn listener_conflict_message_is_actionable() {
        let e = ControllerError::ListenerAlreadyExists {
            load_balancer: "alb-1".into(),
            port: 80,
            protocol: "HTTP".into(),
        };
        assert!(e.to_string().contains("forceOverride"));
    }
}
